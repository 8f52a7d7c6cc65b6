#![forbid(unsafe_code)]

use pimd_core::Id;
use rusqlite::types::Value;
use rusqlite::Row;

use crate::datastore::DataStore;
use crate::error::StoreError;
use crate::query::{integer, text};

/// Namespace of payload parts; everything else is attribute-like.
pub const PAYLOAD_NAMESPACE: &str = "PLD";
/// Namespace of attribute parts.
pub const ATTRIBUTE_NAMESPACE: &str = "ATR";
/// The hidden-item marker part.
pub const HIDDEN_ATTRIBUTE: &str = "ATR:HIDDEN";

/// A `(namespace, name)` pair such as `PLD:RFC822`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PartType {
    pub id: Id,
    pub ns: String,
    pub name: String,
}

impl PartType {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            ns: row.get(1)?,
            name: row.get(2)?,
        })
    }

    pub fn full_name(&self) -> String {
        format!("{}:{}", self.ns, self.name)
    }

    /// Splits a `NS:NAME` token; anything else is not a part type.
    pub fn parse_fq_name(fq_name: &str) -> Result<(&str, &str), StoreError> {
        match fq_name.split_once(':') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains(':') => {
                Ok((ns, name))
            }
            _ => Err(StoreError::InvalidInput("Invalid part type name.")),
        }
    }

    pub fn retrieve_by_id(store: &mut DataStore, id: Id) -> Result<Option<Self>, StoreError> {
        store.query_opt(
            "SELECT id, ns, name FROM part_types WHERE id = ?",
            vec![integer(id)],
            Self::from_row,
        )
    }

    pub fn ensure(store: &mut DataStore, ns: &str, name: &str) -> Result<Self, StoreError> {
        let found = store.query_opt(
            "SELECT id, ns, name FROM part_types WHERE ns = ? AND name = ?",
            vec![text(ns), text(name)],
            Self::from_row,
        )?;
        if let Some(existing) = found {
            return Ok(existing);
        }
        let id = store.insert(
            "INSERT INTO part_types (ns, name) VALUES (?, ?)",
            vec![text(ns), text(name)],
        )?;
        Ok(Self {
            id,
            ns: ns.to_string(),
            name: name.to_string(),
        })
    }

    pub fn ensure_fq(store: &mut DataStore, fq_name: &str) -> Result<Self, StoreError> {
        let (ns, name) = Self::parse_fq_name(fq_name)?;
        let (ns, name) = (ns.to_string(), name.to_string());
        Self::ensure(store, &ns, &name)
    }
}

/// A payload fragment of an item. `data` holds the bytes inline, or the
/// external file name when `external` is set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Part {
    pub id: Id,
    pub pim_item_id: Id,
    pub part_type_id: Id,
    pub data: Option<Vec<u8>>,
    pub datasize: i64,
    pub version: i64,
    pub external: bool,
}

impl Part {
    pub(crate) const COLUMNS: &'static str =
        "id, pim_item_id, part_type_id, data, datasize, version, external";

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            pim_item_id: row.get(1)?,
            part_type_id: row.get(2)?,
            data: row.get(3)?,
            datasize: row.get(4)?,
            version: row.get(5)?,
            external: row.get(6)?,
        })
    }

    pub fn retrieve_by_item(store: &mut DataStore, item_id: Id) -> Result<Vec<Self>, StoreError> {
        store.query_rows(
            &format!(
                "SELECT {} FROM parts WHERE pim_item_id = ? ORDER BY id",
                Self::COLUMNS
            ),
            vec![integer(item_id)],
            Self::from_row,
        )
    }

    pub fn retrieve_by_item_and_type(
        store: &mut DataStore,
        item_id: Id,
        part_type_id: Id,
    ) -> Result<Option<Self>, StoreError> {
        store.query_opt(
            &format!(
                "SELECT {} FROM parts WHERE pim_item_id = ? AND part_type_id = ?",
                Self::COLUMNS
            ),
            vec![integer(item_id), integer(part_type_id)],
            Self::from_row,
        )
    }

    pub(crate) fn insert_row(&mut self, store: &mut DataStore) -> Result<Id, StoreError> {
        let data = match &self.data {
            Some(bytes) => Value::Blob(bytes.clone()),
            None => Value::Null,
        };
        let id = store.insert(
            "INSERT INTO parts (pim_item_id, part_type_id, data, datasize, version, external) \
             VALUES (?, ?, ?, ?, ?, ?)",
            vec![
                integer(self.pim_item_id),
                integer(self.part_type_id),
                data,
                integer(self.datasize),
                integer(self.version),
                Value::Integer(self.external as i64),
            ],
        )?;
        self.id = id;
        Ok(id)
    }

    pub(crate) fn update_row(&self, store: &mut DataStore) -> Result<(), StoreError> {
        let data = match &self.data {
            Some(bytes) => Value::Blob(bytes.clone()),
            None => Value::Null,
        };
        store.exec(
            "UPDATE parts SET data = ?, datasize = ?, version = ?, external = ? WHERE id = ?",
            vec![
                data,
                integer(self.datasize),
                integer(self.version),
                Value::Integer(self.external as i64),
                integer(self.id),
            ],
        )?;
        Ok(())
    }
}
