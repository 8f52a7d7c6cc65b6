#![forbid(unsafe_code)]

use pimd_core::{Id, ROOT_COLLECTION};
use rusqlite::Row;

use crate::cache::COLLECTION_CACHE;
use crate::datastore::DataStore;
use crate::error::StoreError;
use crate::query::{boolean, integer, text};

/// A node in the collection tree rooted at id 0.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Collection {
    pub id: Id,
    pub remote_id: String,
    pub remote_revision: String,
    pub name: String,
    pub parent_id: Id,
    pub resource_id: Id,
    pub subscribed: bool,
    pub cache_policy_inherit: bool,
    pub cache_policy_check_interval: i64,
    pub cache_policy_cache_timeout: i64,
    pub cache_policy_sync_on_demand: bool,
    pub cache_policy_local_parts: String,
    pub query_string: String,
    pub query_attributes: String,
    pub query_collections: String,
    pub is_virtual: bool,
    pub referenced: bool,
}

impl Default for Collection {
    fn default() -> Self {
        Self {
            id: pimd_core::UNSET_ID,
            remote_id: String::new(),
            remote_revision: String::new(),
            name: String::new(),
            parent_id: ROOT_COLLECTION,
            resource_id: pimd_core::UNSET_ID,
            subscribed: true,
            cache_policy_inherit: true,
            cache_policy_check_interval: -1,
            cache_policy_cache_timeout: -1,
            cache_policy_sync_on_demand: false,
            cache_policy_local_parts: String::new(),
            query_string: String::new(),
            query_attributes: String::new(),
            query_collections: String::new(),
            is_virtual: false,
            referenced: false,
        }
    }
}

impl Collection {
    pub(crate) const COLUMNS: &'static str = "id, remote_id, remote_revision, name, parent_id, \
         resource_id, subscribed, cache_policy_inherit, cache_policy_check_interval, \
         cache_policy_cache_timeout, cache_policy_sync_on_demand, cache_policy_local_parts, \
         query_string, query_attributes, query_collections, is_virtual, referenced";

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            remote_id: row.get(1)?,
            remote_revision: row.get(2)?,
            name: row.get(3)?,
            parent_id: row.get(4)?,
            resource_id: row.get(5)?,
            subscribed: row.get(6)?,
            cache_policy_inherit: row.get(7)?,
            cache_policy_check_interval: row.get(8)?,
            cache_policy_cache_timeout: row.get(9)?,
            cache_policy_sync_on_demand: row.get(10)?,
            cache_policy_local_parts: row.get(11)?,
            query_string: row.get(12)?,
            query_attributes: row.get(13)?,
            query_collections: row.get(14)?,
            is_virtual: row.get(15)?,
            referenced: row.get(16)?,
        })
    }

    pub fn retrieve_by_id(store: &mut DataStore, id: Id) -> Result<Option<Self>, StoreError> {
        store.query_opt(
            &format!("SELECT {} FROM collections WHERE id = ?", Self::COLUMNS),
            vec![integer(id)],
            Self::from_row,
        )
    }

    pub fn retrieve_by_name(store: &mut DataStore, name: &str) -> Result<Option<Self>, StoreError> {
        if let Some(id) = COLLECTION_CACHE.get(name) {
            return Self::retrieve_by_id(store, id);
        }
        let found = store.query_opt(
            &format!("SELECT {} FROM collections WHERE name = ?", Self::COLUMNS),
            vec![text(name)],
            Self::from_row,
        )?;
        if let Some(collection) = &found {
            COLLECTION_CACHE.put(name, collection.id);
        }
        Ok(found)
    }

    pub fn retrieve_filtered(
        store: &mut DataStore,
        column: &str,
        value: rusqlite::types::Value,
    ) -> Result<Vec<Self>, StoreError> {
        store.query_rows(
            &format!(
                "SELECT {} FROM collections WHERE {} = ?",
                Self::COLUMNS,
                column
            ),
            vec![value],
            Self::from_row,
        )
    }

    pub fn retrieve_all(store: &mut DataStore) -> Result<Vec<Self>, StoreError> {
        store.query_rows(
            &format!("SELECT {} FROM collections", Self::COLUMNS),
            Vec::new(),
            Self::from_row,
        )
    }

    pub fn children(store: &mut DataStore, id: Id) -> Result<Vec<Self>, StoreError> {
        Self::retrieve_filtered(store, "parent_id", rusqlite::types::Value::Integer(id))
    }

    pub fn insert(&mut self, store: &mut DataStore) -> Result<Id, StoreError> {
        let id = store.insert(
            "INSERT INTO collections (remote_id, remote_revision, name, parent_id, resource_id, \
             subscribed, cache_policy_inherit, cache_policy_check_interval, \
             cache_policy_cache_timeout, cache_policy_sync_on_demand, cache_policy_local_parts, \
             query_string, query_attributes, query_collections, is_virtual, referenced) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            vec![
                text(self.remote_id.clone()),
                text(self.remote_revision.clone()),
                text(self.name.clone()),
                integer(self.parent_id),
                integer(self.resource_id),
                boolean(self.subscribed),
                boolean(self.cache_policy_inherit),
                integer(self.cache_policy_check_interval),
                integer(self.cache_policy_cache_timeout),
                boolean(self.cache_policy_sync_on_demand),
                text(self.cache_policy_local_parts.clone()),
                text(self.query_string.clone()),
                text(self.query_attributes.clone()),
                text(self.query_collections.clone()),
                boolean(self.is_virtual),
                boolean(self.referenced),
            ],
        )?;
        self.id = id;
        COLLECTION_CACHE.put(&self.name, id);
        Ok(id)
    }

    pub fn update(&self, store: &mut DataStore) -> Result<(), StoreError> {
        COLLECTION_CACHE.invalidate(&self.name);
        store.exec(
            "UPDATE collections SET remote_id = ?, remote_revision = ?, name = ?, parent_id = ?, \
             resource_id = ?, subscribed = ?, cache_policy_inherit = ?, \
             cache_policy_check_interval = ?, cache_policy_cache_timeout = ?, \
             cache_policy_sync_on_demand = ?, cache_policy_local_parts = ?, query_string = ?, \
             query_attributes = ?, query_collections = ?, is_virtual = ?, referenced = ? \
             WHERE id = ?",
            vec![
                text(self.remote_id.clone()),
                text(self.remote_revision.clone()),
                text(self.name.clone()),
                integer(self.parent_id),
                integer(self.resource_id),
                boolean(self.subscribed),
                boolean(self.cache_policy_inherit),
                integer(self.cache_policy_check_interval),
                integer(self.cache_policy_cache_timeout),
                boolean(self.cache_policy_sync_on_demand),
                text(self.cache_policy_local_parts.clone()),
                text(self.query_string.clone()),
                text(self.query_attributes.clone()),
                text(self.query_collections.clone()),
                boolean(self.is_virtual),
                boolean(self.referenced),
                integer(self.id),
            ],
        )?;
        Ok(())
    }

    pub fn remove(store: &mut DataStore, id: Id) -> Result<(), StoreError> {
        if let Some(collection) = Self::retrieve_by_id(store, id)? {
            COLLECTION_CACHE.invalidate(&collection.name);
        }
        store.exec("DELETE FROM collections WHERE id = ?", vec![integer(id)])?;
        Ok(())
    }

    pub fn resource(&self, store: &mut DataStore) -> Result<super::Resource, StoreError> {
        super::Resource::retrieve_by_id(store, self.resource_id)?.ok_or(StoreError::NotFound {
            entity: "resource",
            id: self.resource_id.to_string(),
        })
    }

    pub fn mime_types(&self, store: &mut DataStore) -> Result<Vec<super::MimeType>, StoreError> {
        store.query_rows(
            "SELECT mime_types.id, mime_types.name FROM mime_types \
             INNER JOIN collection_mime_type_relation \
             ON collection_mime_type_relation.mime_type_id = mime_types.id \
             WHERE collection_mime_type_relation.collection_id = ?",
            vec![integer(self.id)],
            super::MimeType::from_row,
        )
    }

    pub fn add_mime_type(store: &mut DataStore, id: Id, mime_type_id: Id) -> Result<(), StoreError> {
        store.exec(
            "INSERT INTO collection_mime_type_relation (collection_id, mime_type_id) VALUES (?, ?)",
            vec![integer(id), integer(mime_type_id)],
        )?;
        Ok(())
    }

    pub fn clear_mime_types(store: &mut DataStore, id: Id) -> Result<(), StoreError> {
        store.exec(
            "DELETE FROM collection_mime_type_relation WHERE collection_id = ?",
            vec![integer(id)],
        )?;
        Ok(())
    }

    /// Virtual-collection membership.
    pub fn add_pim_item(store: &mut DataStore, id: Id, item_id: Id) -> Result<bool, StoreError> {
        let changed = store.exec(
            "INSERT OR IGNORE INTO collection_pim_item_relation (collection_id, pim_item_id) \
             VALUES (?, ?)",
            vec![integer(id), integer(item_id)],
        )?;
        Ok(changed > 0)
    }

    pub fn remove_pim_item(store: &mut DataStore, id: Id, item_id: Id) -> Result<bool, StoreError> {
        let changed = store.exec(
            "DELETE FROM collection_pim_item_relation WHERE collection_id = ? AND pim_item_id = ?",
            vec![integer(id), integer(item_id)],
        )?;
        Ok(changed > 0)
    }

    pub fn pim_item_ids(store: &mut DataStore, id: Id) -> Result<Vec<Id>, StoreError> {
        store.query_rows(
            "SELECT pim_item_id FROM collection_pim_item_relation WHERE collection_id = ?",
            vec![integer(id)],
            |row| row.get(0),
        )
    }

    pub fn clear_pim_items(store: &mut DataStore, id: Id) -> Result<(), StoreError> {
        store.exec(
            "DELETE FROM collection_pim_item_relation WHERE collection_id = ?",
            vec![integer(id)],
        )?;
        Ok(())
    }
}
