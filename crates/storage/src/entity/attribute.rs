#![forbid(unsafe_code)]

use pimd_core::Id;
use rusqlite::types::Value;
use rusqlite::Row;

use crate::datastore::DataStore;
use crate::error::StoreError;
use crate::query::integer;

/// A `(collection, key) -> value` byte-blob bag.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CollectionAttribute {
    pub id: Id,
    pub collection_id: Id,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl CollectionAttribute {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            collection_id: row.get(1)?,
            key: row.get(2)?,
            value: row.get(3)?,
        })
    }

    pub fn retrieve_by_collection(
        store: &mut DataStore,
        collection_id: Id,
    ) -> Result<Vec<Self>, StoreError> {
        store.query_rows(
            "SELECT id, collection_id, type, value FROM collection_attributes \
             WHERE collection_id = ? ORDER BY id",
            vec![integer(collection_id)],
            Self::from_row,
        )
    }

    pub fn retrieve(
        store: &mut DataStore,
        collection_id: Id,
        key: &[u8],
    ) -> Result<Option<Self>, StoreError> {
        store.query_opt(
            "SELECT id, collection_id, type, value FROM collection_attributes \
             WHERE collection_id = ? AND type = ?",
            vec![integer(collection_id), Value::Blob(key.to_vec())],
            Self::from_row,
        )
    }

    pub fn insert(&mut self, store: &mut DataStore) -> Result<Id, StoreError> {
        let id = store.insert(
            "INSERT INTO collection_attributes (collection_id, type, value) VALUES (?, ?, ?)",
            vec![
                integer(self.collection_id),
                Value::Blob(self.key.clone()),
                Value::Blob(self.value.clone()),
            ],
        )?;
        self.id = id;
        Ok(id)
    }

    pub fn update(&self, store: &mut DataStore) -> Result<(), StoreError> {
        store.exec(
            "UPDATE collection_attributes SET value = ? WHERE id = ?",
            vec![Value::Blob(self.value.clone()), integer(self.id)],
        )?;
        Ok(())
    }

    pub fn remove(store: &mut DataStore, collection_id: Id, key: &[u8]) -> Result<bool, StoreError> {
        let removed = store.exec(
            "DELETE FROM collection_attributes WHERE collection_id = ? AND type = ?",
            vec![integer(collection_id), Value::Blob(key.to_vec())],
        )?;
        Ok(removed > 0)
    }
}
