#![forbid(unsafe_code)]

use pimd_core::Id;
use rusqlite::Row;

use crate::cache::FLAG_CACHE;
use crate::datastore::DataStore;
use crate::error::StoreError;
use crate::query::{integer, text};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Flag {
    pub id: Id,
    pub name: String,
}

impl Flag {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
        })
    }

    pub fn retrieve_by_id(store: &mut DataStore, id: Id) -> Result<Option<Self>, StoreError> {
        store.query_opt(
            "SELECT id, name FROM flags WHERE id = ?",
            vec![integer(id)],
            Self::from_row,
        )
    }

    pub fn retrieve_by_name(store: &mut DataStore, name: &str) -> Result<Option<Self>, StoreError> {
        if let Some(id) = FLAG_CACHE.get(name) {
            return Ok(Some(Self {
                id,
                name: name.to_string(),
            }));
        }
        let found = store.query_opt(
            "SELECT id, name FROM flags WHERE name = ?",
            vec![text(name)],
            Self::from_row,
        )?;
        if let Some(flag) = &found {
            FLAG_CACHE.put(name, flag.id);
        }
        Ok(found)
    }

    pub fn ensure(store: &mut DataStore, name: &str) -> Result<Self, StoreError> {
        if let Some(existing) = Self::retrieve_by_name(store, name)? {
            return Ok(existing);
        }
        let mut flag = Self {
            id: pimd_core::UNSET_ID,
            name: name.to_string(),
        };
        flag.insert(store)?;
        Ok(flag)
    }

    /// Resolves a list of flag names, creating unknown ones.
    pub fn resolve(store: &mut DataStore, names: &[Vec<u8>]) -> Result<Vec<Self>, StoreError> {
        let mut flags = Vec::with_capacity(names.len());
        for name in names {
            let name = String::from_utf8_lossy(name).into_owned();
            flags.push(Self::ensure(store, &name)?);
        }
        Ok(flags)
    }

    pub fn insert(&mut self, store: &mut DataStore) -> Result<Id, StoreError> {
        let id = store.insert(
            "INSERT INTO flags (name) VALUES (?)",
            vec![text(self.name.clone())],
        )?;
        self.id = id;
        FLAG_CACHE.put(&self.name, id);
        Ok(id)
    }
}
