#![forbid(unsafe_code)]
//! Payload part storage.
//!
//! Small parts live inline in the `parts` row; larger ones go to external
//! files under `{data-dir}/file_db_data`, content-addressed by part id and
//! version. A failed external write never leaves a partial file behind.

use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::datastore::DataStore;
use crate::entity::Part;
use crate::error::StoreError;

pub const EXTERNAL_DIR: &str = "file_db_data";

pub fn external_file_name(part: &Part) -> String {
    format!("{}_r{}", part.id, part.version)
}

pub fn external_file_path(data_dir: &Path, file_name: &str) -> PathBuf {
    data_dir.join(EXTERNAL_DIR).join(file_name)
}

fn write_external_file(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    let mut file = std::fs::File::create(path)?;
    if let Err(err) = file.write_all(data).and_then(|()| file.flush()) {
        drop(file);
        let _ = std::fs::remove_file(path);
        return Err(err.into());
    }
    Ok(())
}

/// Inserts a part, spilling the payload to an external file when it crosses
/// the configured threshold. `part.datasize` is raised to the data length
/// when the advertised size was smaller.
pub fn insert_part(store: &mut DataStore, part: &mut Part, data: Vec<u8>) -> Result<(), StoreError> {
    if part.datasize < data.len() as i64 {
        part.datasize = data.len() as i64;
    }
    let external = data.len() >= store.config().external_payload_threshold;
    if !external {
        part.data = Some(data);
        part.external = false;
        part.insert_row(store)?;
        return Ok(());
    }

    // The file name embeds the row id, so the row goes first.
    part.data = None;
    part.external = true;
    part.insert_row(store)?;
    let file_name = external_file_name(part);
    let path = external_file_path(store.data_dir(), &file_name);
    write_external_file(&path, &data)?;
    part.data = Some(file_name.into_bytes());
    part.update_row(store)?;
    debug!(part = part.id, path = %path.display(), "external payload written");
    Ok(())
}

/// Replaces a part's payload in place, bumping the version for external
/// storage so readers never observe a half-written file.
pub fn update_part_data(
    store: &mut DataStore,
    part: &mut Part,
    data: Vec<u8>,
) -> Result<(), StoreError> {
    remove_external_file(store, part)?;
    if part.datasize < data.len() as i64 {
        part.datasize = data.len() as i64;
    }
    if data.len() >= store.config().external_payload_threshold {
        part.version += 1;
        part.external = true;
        let file_name = external_file_name(part);
        let path = external_file_path(store.data_dir(), &file_name);
        write_external_file(&path, &data)?;
        part.data = Some(file_name.into_bytes());
    } else {
        part.external = false;
        part.data = Some(data);
    }
    part.update_row(store)
}

/// The payload bytes, resolving external storage.
pub fn part_data(store: &DataStore, part: &Part) -> Result<Vec<u8>, StoreError> {
    let Some(data) = &part.data else {
        return Ok(Vec::new());
    };
    if !part.external {
        return Ok(data.clone());
    }
    let file_name = String::from_utf8_lossy(data).into_owned();
    let path = external_file_path(store.data_dir(), &file_name);
    Ok(std::fs::read(path)?)
}

fn remove_external_file(store: &DataStore, part: &Part) -> Result<(), StoreError> {
    if !part.external {
        return Ok(());
    }
    if let Some(data) = &part.data {
        let file_name = String::from_utf8_lossy(data).into_owned();
        let path = external_file_path(store.data_dir(), &file_name);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// Deletes the row and any external file.
pub fn remove_part(store: &mut DataStore, part: &Part) -> Result<(), StoreError> {
    remove_external_file(store, part)?;
    store.exec(
        "DELETE FROM parts WHERE id = ?",
        vec![rusqlite::types::Value::Integer(part.id)],
    )?;
    Ok(())
}

/// Deletes all parts of one item, external files included.
pub fn remove_parts_for_item(store: &mut DataStore, item_id: i64) -> Result<(), StoreError> {
    let parts = Part::retrieve_by_item(store, item_id)?;
    for part in parts {
        remove_part(store, &part)?;
    }
    Ok(())
}

/// Clears the payload but keeps the row so it can be refetched later.
pub fn truncate_part(store: &mut DataStore, part: &Part) -> Result<(), StoreError> {
    remove_external_file(store, part)?;
    store.exec(
        "UPDATE parts SET data = NULL, external = 0 WHERE id = ?",
        vec![rusqlite::types::Value::Integer(part.id)],
    )?;
    Ok(())
}
