#![forbid(unsafe_code)]
//! Collection mutations: append, cleanup, move, mime types, cache policy,
//! attributes and virtual-collection membership.

use std::collections::BTreeSet;

use chrono::Utc;
use pimd_core::{Id, ROOT_COLLECTION};
use rusqlite::types::Value;

use super::DataStore;
use crate::entity::{format_db_datetime, Collection, CollectionAttribute, MimeType, PimItem};
use crate::error::StoreError;
use crate::parts;
use crate::query::{integer, text, CompareOperator, QueryBuilder, QueryMode};

impl DataStore {
    /// Inserts a new collection. The unique `(parent, name)` index rejects
    /// duplicates at the database.
    pub fn append_collection(&mut self, collection: &mut Collection) -> Result<(), StoreError> {
        collection.insert(self)?;
        let resource = self.resource_name_of(collection)?;
        let entity = self.collection_entity(collection);
        self.collector()
            .collection_added(entity, collection.parent_id, &resource);
        Ok(())
    }

    /// Removes a collection with everything it contains.
    ///
    /// With enforced foreign keys the row delete cascades through items,
    /// parts, relations and attributes; only external payload files and
    /// notifications need manual work. Without them every dependent row is
    /// removed explicitly.
    pub fn cleanup_collection(&mut self, collection: &Collection) -> Result<(), StoreError> {
        if !self.config().enforce_foreign_keys {
            return self.cleanup_collection_slow(collection);
        }

        let items = PimItem::retrieve_by_collection(self, collection.id)?;
        let resource = self.resource_name_of(collection)?;

        // The notification must be generated while the rows still exist.
        let entities = self.item_entities(&items)?;
        if !entities.is_empty() {
            self.collector()
                .items_removed(entities, collection.id, &resource);
        }

        let external_files = self.query_rows(
            "SELECT parts.data FROM parts \
             INNER JOIN pim_items ON parts.pim_item_id = pim_items.id \
             WHERE pim_items.collection_id = ? AND parts.external = 1 \
             AND parts.data IS NOT NULL",
            vec![integer(collection.id)],
            |row| row.get::<_, Vec<u8>>(0),
        )?;
        for file_name in external_files {
            let file_name = String::from_utf8_lossy(&file_name).into_owned();
            let path = parts::external_file_path(self.data_dir(), &file_name);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }

        let entity = self.collection_entity(collection);
        self.collector()
            .collection_removed(entity, collection.parent_id, &resource);
        Collection::remove(self, collection.id)
    }

    fn cleanup_collection_slow(&mut self, collection: &Collection) -> Result<(), StoreError> {
        let items = PimItem::retrieve_by_collection(self, collection.id)?;
        self.cleanup_pim_items(&items)?;

        Collection::clear_mime_types(self, collection.id)?;
        Collection::clear_pim_items(self, collection.id)?;
        self.exec(
            "DELETE FROM collection_attributes WHERE collection_id = ?",
            vec![integer(collection.id)],
        )?;

        let resource = self.resource_name_of(collection)?;
        let entity = self.collection_entity(collection);
        self.collector()
            .collection_removed(entity, collection.parent_id, &resource);
        Collection::remove(self, collection.id)
    }

    fn is_descendant_of(&mut self, candidate: Id, ancestor: Id) -> Result<bool, StoreError> {
        let mut current = candidate;
        while current != ROOT_COLLECTION {
            if current == ancestor {
                return Ok(true);
            }
            match Collection::retrieve_by_id(self, current)? {
                Some(collection) => current = collection.parent_id,
                None => break,
            }
        }
        Ok(false)
    }

    // Cross-resource move: children change owner, and every item loses its
    // resource-specific state and turns dirty so an abrupt shutdown forces
    // the new resource to fetch definitive data.
    fn recursive_set_resource_id(
        &mut self,
        collection_id: Id,
        resource_id: Id,
    ) -> Result<(), StoreError> {
        self.begin_transaction()?;

        let mut qb = QueryBuilder::new("collections", QueryMode::Update);
        qb.set_column_value("resource_id", integer(resource_id));
        qb.set_column_value("remote_id", text(""));
        qb.set_column_value("remote_revision", text(""));
        qb.add_value_condition("parent_id", CompareOperator::Equals, integer(collection_id));
        self.exec_builder(&qb)?;

        let now = format_db_datetime(&Utc::now());
        let mut qb = QueryBuilder::new("pim_items", QueryMode::Update);
        qb.set_column_value("remote_id", text(""));
        qb.set_column_value("remote_revision", text(""));
        qb.set_column_value("datetime", text(now.clone()));
        qb.set_column_value("atime", text(now));
        qb.set_column_value("dirty", Value::Integer(1));
        qb.add_value_condition("collection_id", CompareOperator::Equals, integer(collection_id));
        self.exec_builder(&qb)?;

        self.commit_transaction()?;

        let children = Collection::children(self, collection_id)?;
        for child in children {
            self.recursive_set_resource_id(child.id, resource_id)?;
        }
        Ok(())
    }

    /// Reparents a collection. Rejects moves into the collection itself or
    /// one of its descendants; switching resources resets the whole subtree.
    pub fn move_collection(
        &mut self,
        collection: &mut Collection,
        new_parent_id: Id,
    ) -> Result<(), StoreError> {
        if collection.parent_id == new_parent_id {
            return Ok(());
        }
        if self.is_descendant_of(new_parent_id, collection.id)? {
            return Err(StoreError::InvalidMoveTarget);
        }

        let mut resource_id = collection.resource_id;
        if new_parent_id != ROOT_COLLECTION {
            let parent = Collection::retrieve_by_id(self, new_parent_id)?
                .ok_or(StoreError::UnknownCollection(new_parent_id.to_string()))?;
            resource_id = parent.resource_id;
        }

        let old_parent = collection.parent_id;
        let old_resource = self.resource_name_of(collection)?;

        collection.parent_id = new_parent_id;
        if collection.resource_id != resource_id {
            collection.resource_id = resource_id;
            collection.remote_id.clear();
            collection.remote_revision.clear();
            self.recursive_set_resource_id(collection.id, resource_id)?;
        }
        collection.update(self)?;

        let new_resource = self.resource_name_of(collection)?;
        let entity = self.collection_entity(collection);
        self.collector().collection_moved(
            entity,
            old_parent,
            new_parent_id,
            &old_resource,
            &new_resource,
        );
        Ok(())
    }

    /// Attaches mime types to a collection, creating unknown type names.
    pub fn append_mime_type_for_collection(
        &mut self,
        collection_id: Id,
        mime_type_names: &[String],
    ) -> Result<(), StoreError> {
        for name in mime_type_names {
            let mime_type = MimeType::ensure(self, name)?;
            // The unique index on the relation prevents duplicates.
            self.exec(
                "INSERT OR IGNORE INTO collection_mime_type_relation \
                 (collection_id, mime_type_id) VALUES (?, ?)",
                vec![integer(collection_id), integer(mime_type.id)],
            )?;
        }
        Ok(())
    }

    /// Resolves the effective cache policy by walking up the tree while the
    /// policy is inherited; falls back to the system default.
    pub fn active_cache_policy(&mut self, collection: &mut Collection) -> Result<(), StoreError> {
        if !collection.cache_policy_inherit {
            return Ok(());
        }

        let mut parent_id = collection.parent_id;
        while parent_id != ROOT_COLLECTION {
            let Some(parent) = Collection::retrieve_by_id(self, parent_id)? else {
                break;
            };
            if !parent.cache_policy_inherit {
                collection.cache_policy_check_interval = parent.cache_policy_check_interval;
                collection.cache_policy_cache_timeout = parent.cache_policy_cache_timeout;
                collection.cache_policy_sync_on_demand = parent.cache_policy_sync_on_demand;
                collection.cache_policy_local_parts = parent.cache_policy_local_parts;
                return Ok(());
            }
            parent_id = parent.parent_id;
        }

        collection.cache_policy_check_interval = -1;
        collection.cache_policy_cache_timeout = -1;
        collection.cache_policy_sync_on_demand = false;
        collection.cache_policy_local_parts = "ALL".to_string();
        Ok(())
    }

    /// The virtual collections an item is linked into.
    pub fn virtual_collections(&mut self, item_id: Id) -> Result<Vec<Collection>, StoreError> {
        self.query_rows(
            &format!(
                "SELECT {} FROM collections \
                 INNER JOIN collection_pim_item_relation \
                 ON collection_pim_item_relation.collection_id = collections.id \
                 WHERE collection_pim_item_relation.pim_item_id = ?",
                Collection::COLUMNS
                    .split(", ")
                    .map(|column| format!("collections.{column}"))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            vec![integer(item_id)],
            Collection::from_row,
        )
    }

    /// Links items into a virtual collection; only rows actually inserted
    /// are announced.
    pub fn link_pim_items(
        &mut self,
        collection: &Collection,
        items: &[PimItem],
    ) -> Result<(), StoreError> {
        if !collection.is_virtual {
            return Err(StoreError::NotVirtualCollection);
        }
        let mut linked = Vec::new();
        for item in items {
            if Collection::add_pim_item(self, collection.id, item.id)? {
                linked.push(item.clone());
            }
        }
        if linked.is_empty() {
            return Ok(());
        }
        let resource = self.resource_name_of(collection)?;
        let entities = self.item_entities(&linked)?;
        self.collector()
            .items_linked(entities, collection.id, &resource);
        Ok(())
    }

    /// Unlink twin of [`link_pim_items`].
    pub fn unlink_pim_items(
        &mut self,
        collection: &Collection,
        items: &[PimItem],
    ) -> Result<(), StoreError> {
        if !collection.is_virtual {
            return Err(StoreError::NotVirtualCollection);
        }
        let mut unlinked = Vec::new();
        for item in items {
            if Collection::remove_pim_item(self, collection.id, item.id)? {
                unlinked.push(item.clone());
            }
        }
        if unlinked.is_empty() {
            return Ok(());
        }
        let resource = self.resource_name_of(collection)?;
        let entities = self.item_entities(&unlinked)?;
        self.collector()
            .items_unlinked(entities, collection.id, &resource);
        Ok(())
    }

    /// Adds a collection attribute; rejects an existing key.
    pub fn add_collection_attribute(
        &mut self,
        collection: &Collection,
        key: &[u8],
        value: &[u8],
    ) -> Result<(), StoreError> {
        if CollectionAttribute::retrieve(self, collection.id, key)?.is_some() {
            return Err(StoreError::UniqueViolation {
                entity: "collection attribute",
                key: String::from_utf8_lossy(key).into_owned(),
            });
        }
        let mut attribute = CollectionAttribute {
            collection_id: collection.id,
            key: key.to_vec(),
            value: value.to_vec(),
            ..CollectionAttribute::default()
        };
        attribute.insert(self)?;

        let resource = self.resource_name_of(collection)?;
        let entity = self.collection_entity(collection);
        let changed: BTreeSet<Vec<u8>> = [key.to_vec()].into();
        self.collector()
            .collection_changed(entity, collection.parent_id, &resource, changed);
        Ok(())
    }

    /// Removes a collection attribute; reports whether anything was there.
    pub fn remove_collection_attribute(
        &mut self,
        collection: &Collection,
        key: &[u8],
    ) -> Result<bool, StoreError> {
        if !CollectionAttribute::remove(self, collection.id, key)? {
            return Ok(false);
        }
        let resource = self.resource_name_of(collection)?;
        let entity = self.collection_entity(collection);
        let changed: BTreeSet<Vec<u8>> = [key.to_vec()].into();
        self.collector()
            .collection_changed(entity, collection.parent_id, &resource, changed);
        Ok(true)
    }
}
