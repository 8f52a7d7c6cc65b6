#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use pimd_core::Id;
use rusqlite::Row;

use super::{format_db_datetime, parse_db_datetime};
use crate::datastore::DataStore;
use crate::error::StoreError;
use crate::query::{boolean, integer, text};

/// The leaf data entity: a mail-message-shaped record with payload parts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PimItem {
    pub id: Id,
    pub remote_id: String,
    pub remote_revision: String,
    pub gid: String,
    pub collection_id: Id,
    pub mime_type_id: Id,
    pub datetime: DateTime<Utc>,
    pub atime: DateTime<Utc>,
    pub size: i64,
    pub dirty: bool,
    pub hidden: bool,
}

impl Default for PimItem {
    fn default() -> Self {
        Self {
            id: pimd_core::UNSET_ID,
            remote_id: String::new(),
            remote_revision: String::new(),
            gid: String::new(),
            collection_id: pimd_core::UNSET_ID,
            mime_type_id: pimd_core::UNSET_ID,
            datetime: DateTime::<Utc>::UNIX_EPOCH,
            atime: DateTime::<Utc>::UNIX_EPOCH,
            size: 0,
            dirty: false,
            hidden: false,
        }
    }
}

impl PimItem {
    pub(crate) const COLUMNS: &'static str = "id, remote_id, remote_revision, gid, collection_id, \
         mime_type_id, datetime, atime, size, dirty, hidden";

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let datetime: String = row.get(6)?;
        let atime: String = row.get(7)?;
        Ok(Self {
            id: row.get(0)?,
            remote_id: row.get(1)?,
            remote_revision: row.get(2)?,
            gid: row.get(3)?,
            collection_id: row.get(4)?,
            mime_type_id: row.get(5)?,
            datetime: parse_db_datetime(&datetime).unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
            atime: parse_db_datetime(&atime).unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
            size: row.get(8)?,
            dirty: row.get(9)?,
            hidden: row.get(10)?,
        })
    }

    pub fn retrieve_by_id(store: &mut DataStore, id: Id) -> Result<Option<Self>, StoreError> {
        store.query_opt(
            &format!("SELECT {} FROM pim_items WHERE id = ?", Self::COLUMNS),
            vec![integer(id)],
            Self::from_row,
        )
    }

    pub fn retrieve_by_ids(store: &mut DataStore, ids: &[Id]) -> Result<Vec<Self>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        store.query_rows(
            &format!(
                "SELECT {} FROM pim_items WHERE id IN ({placeholders}) ORDER BY id",
                Self::COLUMNS
            ),
            ids.iter().map(|id| integer(*id)).collect(),
            Self::from_row,
        )
    }

    pub fn retrieve_by_collection(
        store: &mut DataStore,
        collection_id: Id,
    ) -> Result<Vec<Self>, StoreError> {
        store.query_rows(
            &format!(
                "SELECT {} FROM pim_items WHERE collection_id = ? ORDER BY id",
                Self::COLUMNS
            ),
            vec![integer(collection_id)],
            Self::from_row,
        )
    }

    pub fn insert(&mut self, store: &mut DataStore) -> Result<Id, StoreError> {
        let id = store.insert(
            "INSERT INTO pim_items (remote_id, remote_revision, gid, collection_id, mime_type_id, \
             datetime, atime, size, dirty, hidden) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            vec![
                text(self.remote_id.clone()),
                text(self.remote_revision.clone()),
                text(self.gid.clone()),
                integer(self.collection_id),
                integer(self.mime_type_id),
                text(format_db_datetime(&self.datetime)),
                text(format_db_datetime(&self.atime)),
                integer(self.size),
                boolean(self.dirty),
                boolean(self.hidden),
            ],
        )?;
        self.id = id;
        Ok(id)
    }

    pub fn update(&self, store: &mut DataStore) -> Result<(), StoreError> {
        store.exec(
            "UPDATE pim_items SET remote_id = ?, remote_revision = ?, gid = ?, collection_id = ?, \
             mime_type_id = ?, datetime = ?, atime = ?, size = ?, dirty = ?, hidden = ? \
             WHERE id = ?",
            vec![
                text(self.remote_id.clone()),
                text(self.remote_revision.clone()),
                text(self.gid.clone()),
                integer(self.collection_id),
                integer(self.mime_type_id),
                text(format_db_datetime(&self.datetime)),
                text(format_db_datetime(&self.atime)),
                integer(self.size),
                boolean(self.dirty),
                boolean(self.hidden),
                integer(self.id),
            ],
        )?;
        Ok(())
    }

    pub fn remove(store: &mut DataStore, id: Id) -> Result<(), StoreError> {
        store.exec("DELETE FROM pim_items WHERE id = ?", vec![integer(id)])?;
        Ok(())
    }

    /// Refreshes the access time to now.
    pub fn touch(&mut self, store: &mut DataStore) -> Result<(), StoreError> {
        self.atime = Utc::now();
        store.exec(
            "UPDATE pim_items SET atime = ? WHERE id = ?",
            vec![text(format_db_datetime(&self.atime)), integer(self.id)],
        )?;
        Ok(())
    }

    pub fn mime_type(&self, store: &mut DataStore) -> Result<super::MimeType, StoreError> {
        super::MimeType::retrieve_by_id(store, self.mime_type_id)?.ok_or(StoreError::NotFound {
            entity: "mime type",
            id: self.mime_type_id.to_string(),
        })
    }

    pub fn flags(&self, store: &mut DataStore) -> Result<Vec<super::Flag>, StoreError> {
        store.query_rows(
            "SELECT flags.id, flags.name FROM flags \
             INNER JOIN pim_item_flag_relation ON pim_item_flag_relation.flag_id = flags.id \
             WHERE pim_item_flag_relation.pim_item_id = ? ORDER BY flags.id",
            vec![integer(self.id)],
            super::Flag::from_row,
        )
    }

    pub fn tags(&self, store: &mut DataStore) -> Result<Vec<super::Tag>, StoreError> {
        store.query_rows(
            &format!(
                "SELECT {} FROM tags \
                 INNER JOIN pim_item_tag_relation ON pim_item_tag_relation.tag_id = tags.id \
                 WHERE pim_item_tag_relation.pim_item_id = ? ORDER BY tags.id",
                super::Tag::qualified_columns()
            ),
            vec![integer(self.id)],
            super::Tag::from_row,
        )
    }

    pub fn clear_flags(store: &mut DataStore, id: Id) -> Result<(), StoreError> {
        store.exec(
            "DELETE FROM pim_item_flag_relation WHERE pim_item_id = ?",
            vec![integer(id)],
        )?;
        Ok(())
    }

    pub fn clear_tags(store: &mut DataStore, id: Id) -> Result<(), StoreError> {
        store.exec(
            "DELETE FROM pim_item_tag_relation WHERE pim_item_id = ?",
            vec![integer(id)],
        )?;
        Ok(())
    }
}
