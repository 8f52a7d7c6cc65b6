#![forbid(unsafe_code)]
//! Schema creation. Idempotent; run on every open.

use rusqlite::Connection;

use crate::error::StoreError;

pub fn migrate_schema(conn: &Connection, enforce_foreign_keys: bool) -> Result<(), StoreError> {
    conn.execute_batch(&format!(
        "PRAGMA journal_mode=WAL;\n\
         PRAGMA synchronous=NORMAL;\n\
         PRAGMA foreign_keys={};",
        if enforce_foreign_keys { "ON" } else { "OFF" }
    ))?;
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS resources (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          name TEXT NOT NULL UNIQUE,
          is_virtual INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS collections (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          remote_id TEXT NOT NULL DEFAULT '',
          remote_revision TEXT NOT NULL DEFAULT '',
          name TEXT NOT NULL,
          parent_id INTEGER NOT NULL DEFAULT 0,
          resource_id INTEGER NOT NULL REFERENCES resources(id) ON DELETE CASCADE,
          subscribed INTEGER NOT NULL DEFAULT 1,
          cache_policy_inherit INTEGER NOT NULL DEFAULT 1,
          cache_policy_check_interval INTEGER NOT NULL DEFAULT -1,
          cache_policy_cache_timeout INTEGER NOT NULL DEFAULT -1,
          cache_policy_sync_on_demand INTEGER NOT NULL DEFAULT 0,
          cache_policy_local_parts TEXT NOT NULL DEFAULT '',
          query_string TEXT NOT NULL DEFAULT '',
          query_attributes TEXT NOT NULL DEFAULT '',
          query_collections TEXT NOT NULL DEFAULT '',
          is_virtual INTEGER NOT NULL DEFAULT 0,
          referenced INTEGER NOT NULL DEFAULT 0,
          UNIQUE (parent_id, name)
        );

        CREATE TABLE IF NOT EXISTS mime_types (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          name TEXT NOT NULL UNIQUE
        );

        CREATE TABLE IF NOT EXISTS pim_items (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          remote_id TEXT NOT NULL DEFAULT '',
          remote_revision TEXT NOT NULL DEFAULT '',
          gid TEXT NOT NULL DEFAULT '',
          collection_id INTEGER NOT NULL REFERENCES collections(id) ON DELETE CASCADE,
          mime_type_id INTEGER NOT NULL REFERENCES mime_types(id),
          datetime TEXT NOT NULL DEFAULT '',
          atime TEXT NOT NULL DEFAULT '',
          size INTEGER NOT NULL DEFAULT 0,
          dirty INTEGER NOT NULL DEFAULT 0,
          hidden INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_pim_items_collection ON pim_items(collection_id);
        CREATE INDEX IF NOT EXISTS idx_pim_items_remote_id ON pim_items(remote_id);

        CREATE TABLE IF NOT EXISTS part_types (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          ns TEXT NOT NULL,
          name TEXT NOT NULL,
          UNIQUE (ns, name)
        );

        CREATE TABLE IF NOT EXISTS parts (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          pim_item_id INTEGER NOT NULL REFERENCES pim_items(id) ON DELETE CASCADE,
          part_type_id INTEGER NOT NULL REFERENCES part_types(id),
          data BLOB,
          datasize INTEGER NOT NULL DEFAULT 0,
          version INTEGER NOT NULL DEFAULT 0,
          external INTEGER NOT NULL DEFAULT 0,
          UNIQUE (pim_item_id, part_type_id)
        );

        CREATE TABLE IF NOT EXISTS flags (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          name TEXT NOT NULL UNIQUE
        );

        CREATE TABLE IF NOT EXISTS tag_types (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          name TEXT NOT NULL UNIQUE
        );

        CREATE TABLE IF NOT EXISTS tags (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          gid TEXT NOT NULL DEFAULT '',
          parent_id INTEGER NOT NULL DEFAULT 0,
          tag_type_id INTEGER NOT NULL REFERENCES tag_types(id)
        );

        CREATE TABLE IF NOT EXISTS tag_remote_id_resource_relation (
          tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
          resource_id INTEGER NOT NULL REFERENCES resources(id) ON DELETE CASCADE,
          remote_id TEXT NOT NULL DEFAULT '',
          UNIQUE (tag_id, resource_id)
        );

        CREATE TABLE IF NOT EXISTS collection_attributes (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          collection_id INTEGER NOT NULL REFERENCES collections(id) ON DELETE CASCADE,
          type TEXT NOT NULL,
          value BLOB NOT NULL,
          UNIQUE (collection_id, type)
        );

        CREATE TABLE IF NOT EXISTS pim_item_flag_relation (
          pim_item_id INTEGER NOT NULL REFERENCES pim_items(id) ON DELETE CASCADE,
          flag_id INTEGER NOT NULL REFERENCES flags(id) ON DELETE CASCADE,
          UNIQUE (pim_item_id, flag_id)
        );

        CREATE TABLE IF NOT EXISTS pim_item_tag_relation (
          pim_item_id INTEGER NOT NULL REFERENCES pim_items(id) ON DELETE CASCADE,
          tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
          UNIQUE (pim_item_id, tag_id)
        );

        CREATE TABLE IF NOT EXISTS collection_mime_type_relation (
          collection_id INTEGER NOT NULL REFERENCES collections(id) ON DELETE CASCADE,
          mime_type_id INTEGER NOT NULL REFERENCES mime_types(id) ON DELETE CASCADE,
          UNIQUE (collection_id, mime_type_id)
        );

        CREATE TABLE IF NOT EXISTS collection_pim_item_relation (
          collection_id INTEGER NOT NULL REFERENCES collections(id) ON DELETE CASCADE,
          pim_item_id INTEGER NOT NULL REFERENCES pim_items(id) ON DELETE CASCADE,
          UNIQUE (collection_id, pim_item_id)
        );
        "#,
    )?;
    Ok(())
}
