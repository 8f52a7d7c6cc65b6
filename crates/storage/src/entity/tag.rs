#![forbid(unsafe_code)]

use pimd_core::Id;
use rusqlite::Row;

use crate::datastore::DataStore;
use crate::error::StoreError;
use crate::query::{integer, text};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TagType {
    pub id: Id,
    pub name: String,
}

impl TagType {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
        })
    }

    pub fn retrieve_by_id(store: &mut DataStore, id: Id) -> Result<Option<Self>, StoreError> {
        store.query_opt(
            "SELECT id, name FROM tag_types WHERE id = ?",
            vec![integer(id)],
            Self::from_row,
        )
    }

    pub fn ensure(store: &mut DataStore, name: &str) -> Result<Self, StoreError> {
        let found = store.query_opt(
            "SELECT id, name FROM tag_types WHERE name = ?",
            vec![text(name)],
            Self::from_row,
        )?;
        if let Some(existing) = found {
            return Ok(existing);
        }
        let id = store.insert(
            "INSERT INTO tag_types (name) VALUES (?)",
            vec![text(name)],
        )?;
        Ok(Self {
            id,
            name: name.to_string(),
        })
    }
}

/// A first-class identified tag; unlike a flag it carries a gid, a type and
/// optional per-resource remote ids.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tag {
    pub id: Id,
    pub gid: String,
    pub parent_id: Id,
    pub tag_type_id: Id,
}

impl Tag {
    pub(crate) fn qualified_columns() -> &'static str {
        "tags.id, tags.gid, tags.parent_id, tags.tag_type_id"
    }

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            gid: row.get(1)?,
            parent_id: row.get(2)?,
            tag_type_id: row.get(3)?,
        })
    }

    pub fn retrieve_by_id(store: &mut DataStore, id: Id) -> Result<Option<Self>, StoreError> {
        store.query_opt(
            "SELECT id, gid, parent_id, tag_type_id FROM tags WHERE id = ?",
            vec![integer(id)],
            Self::from_row,
        )
    }

    pub fn retrieve_by_gid(store: &mut DataStore, gid: &str) -> Result<Option<Self>, StoreError> {
        store.query_opt(
            "SELECT id, gid, parent_id, tag_type_id FROM tags WHERE gid = ?",
            vec![text(gid)],
            Self::from_row,
        )
    }

    pub fn retrieve_all(store: &mut DataStore) -> Result<Vec<Self>, StoreError> {
        store.query_rows(
            "SELECT id, gid, parent_id, tag_type_id FROM tags ORDER BY id",
            Vec::new(),
            Self::from_row,
        )
    }

    pub fn insert(&mut self, store: &mut DataStore) -> Result<Id, StoreError> {
        let id = store.insert(
            "INSERT INTO tags (gid, parent_id, tag_type_id) VALUES (?, ?, ?)",
            vec![text(self.gid.clone()), integer(self.parent_id), integer(self.tag_type_id)],
        )?;
        self.id = id;
        Ok(id)
    }

    pub fn update(&self, store: &mut DataStore) -> Result<(), StoreError> {
        store.exec(
            "UPDATE tags SET gid = ?, parent_id = ?, tag_type_id = ? WHERE id = ?",
            vec![
                text(self.gid.clone()),
                integer(self.parent_id),
                integer(self.tag_type_id),
                integer(self.id),
            ],
        )?;
        Ok(())
    }

    pub fn remove(store: &mut DataStore, id: Id) -> Result<(), StoreError> {
        store.exec(
            "DELETE FROM pim_item_tag_relation WHERE tag_id = ?",
            vec![integer(id)],
        )?;
        store.exec(
            "DELETE FROM tag_remote_id_resource_relation WHERE tag_id = ?",
            vec![integer(id)],
        )?;
        store.exec("DELETE FROM tags WHERE id = ?", vec![integer(id)])?;
        Ok(())
    }

    pub fn tag_type(&self, store: &mut DataStore) -> Result<TagType, StoreError> {
        TagType::retrieve_by_id(store, self.tag_type_id)?.ok_or(StoreError::NotFound {
            entity: "tag type",
            id: self.tag_type_id.to_string(),
        })
    }

    /// The tag's remote id for one resource, if any.
    pub fn remote_id_for_resource(
        &self,
        store: &mut DataStore,
        resource_id: Id,
    ) -> Result<Option<String>, StoreError> {
        store.query_opt(
            "SELECT remote_id FROM tag_remote_id_resource_relation \
             WHERE tag_id = ? AND resource_id = ?",
            vec![integer(self.id), integer(resource_id)],
            |row| row.get(0),
        )
    }

    pub fn set_remote_id_for_resource(
        &self,
        store: &mut DataStore,
        resource_id: Id,
        remote_id: &str,
    ) -> Result<(), StoreError> {
        store.exec(
            "INSERT INTO tag_remote_id_resource_relation (tag_id, resource_id, remote_id) \
             VALUES (?, ?, ?) \
             ON CONFLICT (tag_id, resource_id) DO UPDATE SET remote_id = excluded.remote_id",
            vec![integer(self.id), integer(resource_id), text(remote_id)],
        )?;
        Ok(())
    }

    /// Finds the tag a resource knows under `remote_id`.
    pub fn retrieve_by_remote_id(
        store: &mut DataStore,
        resource_id: Id,
        remote_id: &str,
    ) -> Result<Option<Self>, StoreError> {
        store.query_opt(
            &format!(
                "SELECT {} FROM tags \
                 INNER JOIN tag_remote_id_resource_relation \
                 ON tag_remote_id_resource_relation.tag_id = tags.id \
                 WHERE tag_remote_id_resource_relation.resource_id = ? \
                 AND tag_remote_id_resource_relation.remote_id = ?",
                Self::qualified_columns()
            ),
            vec![integer(resource_id), text(remote_id)],
            Self::from_row,
        )
    }
}
