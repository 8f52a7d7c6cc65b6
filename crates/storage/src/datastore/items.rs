#![forbid(unsafe_code)]
//! Item mutations: append, flag and tag juggling, part removal, cache
//! invalidation, cleanup.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use pimd_core::Id;
use rusqlite::types::Value;

use super::DataStore;
use crate::entity::{
    Collection, Flag, MimeType, Part, PartType, PimItem, Tag, HIDDEN_ATTRIBUTE, PAYLOAD_NAMESPACE,
};
use crate::error::StoreError;
use crate::parts;
use crate::query::{integer, text, CompareOperator, Condition, LogicOperator, QueryBuilder, QueryMode};

/// One payload part of an item being appended.
#[derive(Clone, Debug)]
pub struct NewPart {
    pub fq_name: String,
    pub data: Vec<u8>,
    pub datasize: i64,
    pub version: i64,
}

impl DataStore {
    /// Appends an item with its parts into `collection`.
    ///
    /// An empty remote id means the item originates from an application and
    /// is dirty until some resource writes it back; a non-empty remote id
    /// means the resource itself is feeding the cache.
    pub fn append_pim_item(
        &mut self,
        new_parts: Vec<NewPart>,
        mime_type: &MimeType,
        collection: &Collection,
        datetime: Option<DateTime<Utc>>,
        remote_id: &str,
        remote_revision: &str,
        gid: &str,
        size: i64,
    ) -> Result<PimItem, StoreError> {
        if collection.is_virtual {
            return Err(StoreError::VirtualCollection);
        }

        let resource = self.resource_name_of(collection)?;
        if !remote_id.is_empty() {
            // (resource, remote id) must stay unique.
            let clash = self.query_opt(
                "SELECT pim_items.id FROM pim_items \
                 INNER JOIN collections ON collections.id = pim_items.collection_id \
                 WHERE collections.resource_id = ? AND pim_items.remote_id = ?",
                vec![integer(collection.resource_id), text(remote_id)],
                |row| row.get::<_, Id>(0),
            )?;
            if clash.is_some() {
                return Err(StoreError::UniqueViolation {
                    entity: "item remote id",
                    key: remote_id.to_string(),
                });
            }
        }

        let now = Utc::now();
        let mut item = PimItem {
            remote_id: remote_id.to_string(),
            remote_revision: remote_revision.to_string(),
            gid: gid.to_string(),
            collection_id: collection.id,
            mime_type_id: mime_type.id,
            datetime: datetime.unwrap_or(now),
            atime: now,
            size,
            dirty: remote_id.is_empty(),
            ..PimItem::default()
        };
        item.insert(self)?;

        for new_part in new_parts {
            let part_type = PartType::ensure_fq(self, &new_part.fq_name)?;
            let mut part = Part {
                pim_item_id: item.id,
                part_type_id: part_type.id,
                datasize: new_part.datasize,
                version: new_part.version,
                ..Part::default()
            };
            parts::insert_part(self, &mut part, new_part.data)?;
        }

        let entity = self.item_entities(std::slice::from_ref(&item))?.remove(0);
        self.collector().item_added(entity, collection.id, &resource);
        Ok(item)
    }

    fn current_flag_relations(
        &mut self,
        item_ids: &[Id],
    ) -> Result<HashMap<Id, HashSet<Id>>, StoreError> {
        let placeholders = vec!["?"; item_ids.len()].join(", ");
        let rows = self.query_rows(
            &format!(
                "SELECT pim_item_id, flag_id FROM pim_item_flag_relation \
                 WHERE pim_item_id IN ({placeholders})"
            ),
            item_ids.iter().map(|id| integer(*id)).collect(),
            |row| Ok((row.get::<_, Id>(0)?, row.get::<_, Id>(1)?)),
        )?;
        let mut map: HashMap<Id, HashSet<Id>> = HashMap::new();
        for (item, flag) in rows {
            map.entry(item).or_default().insert(flag);
        }
        Ok(map)
    }

    fn flag_changes_context(
        &mut self,
        items: &[PimItem],
        collection: Option<&Collection>,
    ) -> Result<(Id, String), StoreError> {
        let collection = match collection {
            Some(collection) => collection.clone(),
            None => {
                let id = items.first().map(|item| item.collection_id).unwrap_or(-1);
                Collection::retrieve_by_id(self, id)?
                    .ok_or(StoreError::UnknownCollection(id.to_string()))?
            }
        };
        let resource = self.resource_name_of(&collection)?;
        Ok((collection.id, resource))
    }

    /// Makes each item's flag set equal `flags`. Removed relations go in
    /// one delete, added ones in one insert; nothing is emitted when the
    /// symmetric difference is empty.
    pub fn set_items_flags(
        &mut self,
        items: &[PimItem],
        flags: &[Flag],
    ) -> Result<bool, StoreError> {
        let item_ids: Vec<Id> = items.iter().map(|item| item.id).collect();
        let current = self.current_flag_relations(&item_ids)?;
        let target: HashSet<Id> = flags.iter().map(|flag| flag.id).collect();
        let flag_names: HashMap<Id, &str> =
            flags.iter().map(|flag| (flag.id, flag.name.as_str())).collect();

        let mut removed_flags: BTreeSet<Vec<u8>> = BTreeSet::new();
        let mut added_flags: BTreeSet<Vec<u8>> = BTreeSet::new();
        let mut delete_conditions = Condition::new(LogicOperator::Or);
        let mut insert_items: Vec<Value> = Vec::new();
        let mut insert_flags: Vec<Value> = Vec::new();

        for item in items {
            let empty = HashSet::new();
            let current_flags = current.get(&item.id).unwrap_or(&empty);
            for flag_id in current_flags {
                if !target.contains(flag_id) {
                    if let Some(flag) = Flag::retrieve_by_id(self, *flag_id)? {
                        removed_flags.insert(flag.name.into_bytes());
                    }
                    let mut pair = Condition::new(LogicOperator::And);
                    pair.add_value_condition("pim_item_id", CompareOperator::Equals, integer(item.id));
                    pair.add_value_condition("flag_id", CompareOperator::Equals, integer(*flag_id));
                    delete_conditions.add_condition(pair);
                }
            }
            for flag in flags {
                if !current_flags.contains(&flag.id) {
                    added_flags.insert(flag_names[&flag.id].as_bytes().to_vec());
                    insert_items.push(integer(item.id));
                    insert_flags.push(integer(flag.id));
                }
            }
        }

        if !removed_flags.is_empty() {
            let mut qb = QueryBuilder::new("pim_item_flag_relation", QueryMode::Delete);
            qb.add_condition(delete_conditions);
            self.exec_builder(&qb)?;
        }
        if !added_flags.is_empty() {
            let mut qb = QueryBuilder::new("pim_item_flag_relation", QueryMode::Insert);
            qb.set_column_values("pim_item_id", insert_items);
            qb.set_column_values("flag_id", insert_flags);
            self.exec_builder(&qb)?;
        }

        if added_flags.is_empty() && removed_flags.is_empty() {
            // No change, no notification.
            return Ok(false);
        }

        let (collection_id, resource) = self.flag_changes_context(items, None)?;
        let entities = self.item_entities(items)?;
        self.collector()
            .items_flags_changed(entities, collection_id, &resource, added_flags, removed_flags);
        Ok(true)
    }

    fn do_append_items_flag(
        &mut self,
        items: &[PimItem],
        flag: &Flag,
        existing: &HashSet<Id>,
        collection: Option<&Collection>,
        silent: bool,
    ) -> Result<(), StoreError> {
        let append_items: Vec<PimItem> = items
            .iter()
            .filter(|item| !existing.contains(&item.id))
            .cloned()
            .collect();
        if append_items.is_empty() {
            // All items carry the flag already.
            return Ok(());
        }

        let mut qb = QueryBuilder::new("pim_item_flag_relation", QueryMode::Insert);
        qb.set_column_values(
            "pim_item_id",
            append_items.iter().map(|item| integer(item.id)).collect(),
        );
        qb.set_column_values(
            "flag_id",
            append_items.iter().map(|_| integer(flag.id)).collect(),
        );
        self.exec_builder(&qb)?;

        if !silent {
            let (collection_id, resource) = self.flag_changes_context(&append_items, collection)?;
            let entities = self.item_entities(&append_items)?;
            let added: BTreeSet<Vec<u8>> = [flag.name.clone().into_bytes()].into();
            self.collector().items_flags_changed(
                entities,
                collection_id,
                &resource,
                added,
                BTreeSet::new(),
            );
        }
        Ok(())
    }

    /// Adds `flags` to every item. With `check_if_exists` a select guards
    /// against duplicate relations; the returned bool says whether any item
    /// actually gained a flag.
    pub fn append_items_flags(
        &mut self,
        items: &[PimItem],
        flags: &[Flag],
        check_if_exists: bool,
        collection: Option<&Collection>,
        silent: bool,
    ) -> Result<bool, StoreError> {
        let item_ids: Vec<Value> = items.iter().map(|item| integer(item.id)).collect();
        let mut flags_changed = false;

        for flag in flags {
            let mut existing = HashSet::new();
            if check_if_exists {
                let mut qb = QueryBuilder::new("pim_item_flag_relation", QueryMode::Select);
                qb.add_column("pim_item_id");
                qb.add_value_condition("flag_id", CompareOperator::Equals, integer(flag.id));
                qb.add_value_list_condition("pim_item_id", CompareOperator::In, item_ids.clone());
                let rows = self.query_builder_rows(&qb, |row| row.get::<_, Id>(0))?;
                if rows.len() == items.len() {
                    continue;
                }
                flags_changed = true;
                existing = rows.into_iter().collect();
            }
            self.do_append_items_flag(items, flag, &existing, collection, silent)?;
        }
        Ok(flags_changed)
    }

    /// Deletes the given flags from all given items in one go.
    pub fn remove_items_flags(
        &mut self,
        items: &[PimItem],
        flags: &[Flag],
    ) -> Result<(), StoreError> {
        let mut removed_flags: BTreeSet<Vec<u8>> = BTreeSet::new();
        let mut flag_ids: Vec<Value> = Vec::new();
        for flag in flags {
            if removed_flags.insert(flag.name.clone().into_bytes()) {
                flag_ids.push(integer(flag.id));
            }
        }
        let item_ids: Vec<Value> = items.iter().map(|item| integer(item.id)).collect();

        let mut qb = QueryBuilder::new("pim_item_flag_relation", QueryMode::Delete);
        qb.add_value_list_condition("flag_id", CompareOperator::In, flag_ids);
        qb.add_value_list_condition("pim_item_id", CompareOperator::In, item_ids);
        self.exec_builder(&qb)?;

        let (collection_id, resource) = self.flag_changes_context(items, None)?;
        let entities = self.item_entities(items)?;
        self.collector().items_flags_changed(
            entities,
            collection_id,
            &resource,
            BTreeSet::new(),
            removed_flags,
        );
        Ok(())
    }

    fn current_tag_relations(
        &mut self,
        item_ids: &[Id],
    ) -> Result<HashMap<Id, HashSet<Id>>, StoreError> {
        let placeholders = vec!["?"; item_ids.len()].join(", ");
        let rows = self.query_rows(
            &format!(
                "SELECT pim_item_id, tag_id FROM pim_item_tag_relation \
                 WHERE pim_item_id IN ({placeholders})"
            ),
            item_ids.iter().map(|id| integer(*id)).collect(),
            |row| Ok((row.get::<_, Id>(0)?, row.get::<_, Id>(1)?)),
        )?;
        let mut map: HashMap<Id, HashSet<Id>> = HashMap::new();
        for (item, tag) in rows {
            map.entry(item).or_default().insert(tag);
        }
        Ok(map)
    }

    /// Tag twin of [`set_items_flags`].
    pub fn set_items_tags(&mut self, items: &[PimItem], tags: &[Tag]) -> Result<bool, StoreError> {
        let item_ids: Vec<Id> = items.iter().map(|item| item.id).collect();
        let current = self.current_tag_relations(&item_ids)?;
        let target: HashSet<Id> = tags.iter().map(|tag| tag.id).collect();

        let mut removed_tags: BTreeSet<Id> = BTreeSet::new();
        let mut added_tags: BTreeSet<Id> = BTreeSet::new();
        let mut delete_conditions = Condition::new(LogicOperator::Or);
        let mut insert_items: Vec<Value> = Vec::new();
        let mut insert_tags: Vec<Value> = Vec::new();

        for item in items {
            let empty = HashSet::new();
            let current_tags = current.get(&item.id).unwrap_or(&empty);
            for tag_id in current_tags {
                if !target.contains(tag_id) {
                    removed_tags.insert(*tag_id);
                    let mut pair = Condition::new(LogicOperator::And);
                    pair.add_value_condition("pim_item_id", CompareOperator::Equals, integer(item.id));
                    pair.add_value_condition("tag_id", CompareOperator::Equals, integer(*tag_id));
                    delete_conditions.add_condition(pair);
                }
            }
            for tag in tags {
                if !current_tags.contains(&tag.id) {
                    added_tags.insert(tag.id);
                    insert_items.push(integer(item.id));
                    insert_tags.push(integer(tag.id));
                }
            }
        }

        if !removed_tags.is_empty() {
            let mut qb = QueryBuilder::new("pim_item_tag_relation", QueryMode::Delete);
            qb.add_condition(delete_conditions);
            self.exec_builder(&qb)?;
        }
        if !added_tags.is_empty() {
            let mut qb = QueryBuilder::new("pim_item_tag_relation", QueryMode::Insert);
            qb.set_column_values("pim_item_id", insert_items);
            qb.set_column_values("tag_id", insert_tags);
            self.exec_builder(&qb)?;
        }

        if added_tags.is_empty() && removed_tags.is_empty() {
            return Ok(false);
        }

        let (collection_id, resource) = self.flag_changes_context(items, None)?;
        let entities = self.item_entities(items)?;
        self.collector()
            .items_tags_changed(entities, collection_id, &resource, added_tags, removed_tags);
        Ok(true)
    }

    /// Tag twin of [`append_items_flags`].
    pub fn append_items_tags(
        &mut self,
        items: &[PimItem],
        tags: &[Tag],
        check_if_exists: bool,
        collection: Option<&Collection>,
        silent: bool,
    ) -> Result<bool, StoreError> {
        let item_ids: Vec<Value> = items.iter().map(|item| integer(item.id)).collect();
        let mut tags_changed = false;

        for tag in tags {
            let mut existing: HashSet<Id> = HashSet::new();
            if check_if_exists {
                let mut qb = QueryBuilder::new("pim_item_tag_relation", QueryMode::Select);
                qb.add_column("pim_item_id");
                qb.add_value_condition("tag_id", CompareOperator::Equals, integer(tag.id));
                qb.add_value_list_condition("pim_item_id", CompareOperator::In, item_ids.clone());
                let rows = self.query_builder_rows(&qb, |row| row.get::<_, Id>(0))?;
                if rows.len() == items.len() {
                    continue;
                }
                tags_changed = true;
                existing = rows.into_iter().collect();
            }

            let append_items: Vec<PimItem> = items
                .iter()
                .filter(|item| !existing.contains(&item.id))
                .cloned()
                .collect();
            if append_items.is_empty() {
                continue;
            }
            let mut qb = QueryBuilder::new("pim_item_tag_relation", QueryMode::Insert);
            qb.set_column_values(
                "pim_item_id",
                append_items.iter().map(|item| integer(item.id)).collect(),
            );
            qb.set_column_values(
                "tag_id",
                append_items.iter().map(|_| integer(tag.id)).collect(),
            );
            self.exec_builder(&qb)?;

            if !silent {
                let (collection_id, resource) =
                    self.flag_changes_context(&append_items, collection)?;
                let entities = self.item_entities(&append_items)?;
                self.collector().items_tags_changed(
                    entities,
                    collection_id,
                    &resource,
                    [tag.id].into(),
                    BTreeSet::new(),
                );
            }
        }
        Ok(tags_changed)
    }

    /// Tag twin of [`remove_items_flags`].
    pub fn remove_items_tags(&mut self, items: &[PimItem], tags: &[Tag]) -> Result<(), StoreError> {
        let mut removed_tags: BTreeSet<Id> = BTreeSet::new();
        let mut tag_ids: Vec<Value> = Vec::new();
        for tag in tags {
            if removed_tags.insert(tag.id) {
                tag_ids.push(integer(tag.id));
            }
        }
        let item_ids: Vec<Value> = items.iter().map(|item| integer(item.id)).collect();

        let mut qb = QueryBuilder::new("pim_item_tag_relation", QueryMode::Delete);
        qb.add_value_list_condition("tag_id", CompareOperator::In, tag_ids);
        qb.add_value_list_condition("pim_item_id", CompareOperator::In, item_ids);
        self.exec_builder(&qb)?;

        let (collection_id, resource) = self.flag_changes_context(items, None)?;
        let entities = self.item_entities(items)?;
        self.collector().items_tags_changed(
            entities,
            collection_id,
            &resource,
            BTreeSet::new(),
            removed_tags,
        );
        Ok(())
    }

    fn fq_name_condition(part_names: &[Vec<u8>]) -> Result<Condition, StoreError> {
        let mut condition = Condition::new(LogicOperator::Or);
        for fq_name in part_names {
            let fq_name = String::from_utf8_lossy(fq_name).into_owned();
            let (ns, name) = PartType::parse_fq_name(&fq_name)?;
            let mut pair = Condition::new(LogicOperator::And);
            pair.add_value_condition("part_types.ns", CompareOperator::Equals, text(ns));
            pair.add_value_condition("part_types.name", CompareOperator::Equals, text(name));
            condition.add_condition(pair);
        }
        Ok(condition)
    }

    /// Deletes the named parts of an item, external files included.
    pub fn remove_item_parts(
        &mut self,
        item: &PimItem,
        part_names: &[Vec<u8>],
    ) -> Result<(), StoreError> {
        let mut qb = QueryBuilder::new("parts", QueryMode::Select);
        for column in Part::COLUMNS.split(", ") {
            qb.add_column(&format!("parts.{column}"));
        }
        qb.add_join(
            crate::query::JoinType::Inner,
            "part_types",
            "parts.part_type_id",
            "part_types.id",
        );
        qb.add_value_condition("parts.pim_item_id", CompareOperator::Equals, integer(item.id));
        qb.add_condition(Self::fq_name_condition(part_names)?);
        let existing = self.query_builder_rows(&qb, Part::from_row)?;
        for part in existing {
            parts::remove_part(self, &part)?;
        }

        let (collection_id, resource) =
            self.flag_changes_context(std::slice::from_ref(item), None)?;
        let entity = self.item_entities(std::slice::from_ref(item))?.remove(0);
        self.collector().item_changed(
            entity,
            collection_id,
            &resource,
            part_names.iter().cloned().collect(),
        );
        Ok(())
    }

    /// Drops the cached payload of a clean item: inline data is cleared and
    /// external files removed, but the part rows stay so the payload can be
    /// refetched from the owning resource.
    pub fn invalidate_item_cache(&mut self, item: &PimItem) -> Result<(), StoreError> {
        let payload_parts = self.query_rows(
            &format!(
                "SELECT {} FROM parts \
                 INNER JOIN pim_items ON pim_items.id = parts.pim_item_id \
                 INNER JOIN part_types ON part_types.id = parts.part_type_id \
                 WHERE parts.pim_item_id = ? AND parts.data IS NOT NULL \
                 AND part_types.ns = ? AND pim_items.dirty = 0",
                Part::COLUMNS
                    .split(", ")
                    .map(|column| format!("parts.{column}"))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            vec![integer(item.id), text(PAYLOAD_NAMESPACE)],
            Part::from_row,
        )?;
        for part in payload_parts {
            parts::truncate_part(self, &part)?;
        }
        Ok(())
    }

    /// Emits the removal notification, then deletes items with their parts,
    /// flag/tag relations and virtual-collection references.
    pub fn cleanup_pim_items(&mut self, items: &[PimItem]) -> Result<(), StoreError> {
        if items.is_empty() {
            return Ok(());
        }
        let (collection_id, resource) = self.flag_changes_context(items, None)?;
        let entities = self.item_entities(items)?;
        self.collector()
            .items_removed(entities, collection_id, &resource);

        for item in items {
            PimItem::clear_flags(self, item.id)?;
            PimItem::clear_tags(self, item.id)?;
            parts::remove_parts_for_item(self, item.id)?;
            self.exec(
                "DELETE FROM collection_pim_item_relation WHERE pim_item_id = ?",
                vec![integer(item.id)],
            )?;
            PimItem::remove(self, item.id)?;
        }
        Ok(())
    }

    /// Drops the hidden marker from one item.
    pub fn unhide_pim_item(&mut self, item: &mut PimItem) -> Result<(), StoreError> {
        item.hidden = false;
        item.update(self)?;
        self.remove_item_parts(item, &[HIDDEN_ATTRIBUTE.as_bytes().to_vec()])
    }

    /// Drops the hidden marker from every item, in two statements.
    pub fn unhide_all_pim_items(&mut self) -> Result<(), StoreError> {
        self.exec(
            "DELETE FROM parts WHERE part_type_id IN \
             (SELECT id FROM part_types WHERE ns = 'ATR' AND name = 'HIDDEN')",
            Vec::new(),
        )?;
        self.exec("UPDATE pim_items SET hidden = 0 WHERE hidden = 1", Vec::new())?;
        Ok(())
    }
}
