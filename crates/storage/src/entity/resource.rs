#![forbid(unsafe_code)]

use pimd_core::Id;
use rusqlite::types::Value;
use rusqlite::Row;

use crate::cache::RESOURCE_CACHE;
use crate::datastore::DataStore;
use crate::error::StoreError;
use crate::query::{integer, text};

/// An external agent owning a subtree of collections.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Resource {
    pub id: Id,
    pub name: String,
    pub is_virtual: bool,
}

impl Resource {
    pub(crate) const COLUMNS: &'static str = "id, name, is_virtual";

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            is_virtual: row.get(2)?,
        })
    }

    pub fn retrieve_by_id(store: &mut DataStore, id: Id) -> Result<Option<Self>, StoreError> {
        store.query_opt(
            &format!("SELECT {} FROM resources WHERE id = ?", Self::COLUMNS),
            vec![integer(id)],
            Self::from_row,
        )
    }

    pub fn retrieve_by_name(store: &mut DataStore, name: &str) -> Result<Option<Self>, StoreError> {
        if let Some(id) = RESOURCE_CACHE.get(name) {
            return Self::retrieve_by_id(store, id);
        }
        let found = store.query_opt(
            &format!("SELECT {} FROM resources WHERE name = ?", Self::COLUMNS),
            vec![text(name)],
            Self::from_row,
        )?;
        if let Some(resource) = &found {
            RESOURCE_CACHE.put(name, resource.id);
        }
        Ok(found)
    }

    pub fn retrieve_all(store: &mut DataStore) -> Result<Vec<Self>, StoreError> {
        store.query_rows(
            &format!("SELECT {} FROM resources", Self::COLUMNS),
            Vec::new(),
            Self::from_row,
        )
    }

    pub fn insert(&mut self, store: &mut DataStore) -> Result<Id, StoreError> {
        let id = store.insert(
            "INSERT INTO resources (name, is_virtual) VALUES (?, ?)",
            vec![text(self.name.clone()), Value::Integer(self.is_virtual as i64)],
        )?;
        self.id = id;
        RESOURCE_CACHE.put(&self.name, id);
        Ok(id)
    }

    pub fn remove(store: &mut DataStore, id: Id) -> Result<(), StoreError> {
        if let Some(resource) = Self::retrieve_by_id(store, id)? {
            RESOURCE_CACHE.invalidate(&resource.name);
        }
        store.exec("DELETE FROM resources WHERE id = ?", vec![integer(id)])?;
        Ok(())
    }
}
