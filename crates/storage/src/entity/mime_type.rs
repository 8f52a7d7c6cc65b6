#![forbid(unsafe_code)]

use pimd_core::Id;
use rusqlite::Row;

use crate::cache::MIME_TYPE_CACHE;
use crate::datastore::DataStore;
use crate::error::StoreError;
use crate::query::{integer, text};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MimeType {
    pub id: Id,
    pub name: String,
}

impl MimeType {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
        })
    }

    pub fn retrieve_by_id(store: &mut DataStore, id: Id) -> Result<Option<Self>, StoreError> {
        store.query_opt(
            "SELECT id, name FROM mime_types WHERE id = ?",
            vec![integer(id)],
            Self::from_row,
        )
    }

    pub fn retrieve_by_name(store: &mut DataStore, name: &str) -> Result<Option<Self>, StoreError> {
        if let Some(id) = MIME_TYPE_CACHE.get(name) {
            return Ok(Some(Self {
                id,
                name: name.to_string(),
            }));
        }
        let found = store.query_opt(
            "SELECT id, name FROM mime_types WHERE name = ?",
            vec![text(name)],
            Self::from_row,
        )?;
        if let Some(mime_type) = &found {
            MIME_TYPE_CACHE.put(name, mime_type.id);
        }
        Ok(found)
    }

    /// Looks the name up, creating the row when missing.
    pub fn ensure(store: &mut DataStore, name: &str) -> Result<Self, StoreError> {
        if let Some(existing) = Self::retrieve_by_name(store, name)? {
            return Ok(existing);
        }
        let mut mime_type = Self {
            id: pimd_core::UNSET_ID,
            name: name.to_string(),
        };
        mime_type.insert(store)?;
        Ok(mime_type)
    }

    pub fn insert(&mut self, store: &mut DataStore) -> Result<Id, StoreError> {
        let id = store.insert(
            "INSERT INTO mime_types (name) VALUES (?)",
            vec![text(self.name.clone())],
        )?;
        self.id = id;
        MIME_TYPE_CACHE.put(&self.name, id);
        Ok(id)
    }
}
