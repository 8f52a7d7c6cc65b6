#![forbid(unsafe_code)]
//! COPY: duplicate items into another collection.
//!
//! ```text
//! tag COPY uid-set destination-collection
//! ```
//!
//! Copies carry the payload parts and flags of the source but start without
//! remote state: the destination's resource has never seen them.

use std::io::{Read, Write};

use pimd_storage::{parts, Collection, NewPart, Part, PartType};

use super::{parse_uid_set, resolve_items, HandlerError};
use crate::connection::Connection;

impl<R: Read, W: Write> Connection<R, W> {
    pub(crate) fn copy_items(&mut self, tag: &[u8]) -> Result<(), HandlerError> {
        let uid_set = self.parser().read_string()?;
        let ids = parse_uid_set(&uid_set)?;
        let destination_id = self.parser().read_number()?;

        let store = self.store()?;
        store.begin_transaction()?;

        let destination = Collection::retrieve_by_id(store, destination_id)?.ok_or_else(|| {
            HandlerError::failure(format!("Unknown collection for '{destination_id}'."))
        })?;
        let items = resolve_items(store, &ids)?;

        for item in &items {
            let mut new_parts = Vec::new();
            for part in Part::retrieve_by_item(store, item.id)? {
                let part_type = PartType::retrieve_by_id(store, part.part_type_id)?
                    .ok_or_else(|| HandlerError::failure("Dangling part type"))?;
                new_parts.push(NewPart {
                    fq_name: part_type.full_name(),
                    data: parts::part_data(store, &part)?,
                    datasize: part.datasize,
                    version: part.version,
                });
            }
            let mime_type = item.mime_type(store)?;
            let copy = store.append_pim_item(
                new_parts,
                &mime_type,
                &destination,
                Some(item.datetime),
                "",
                "",
                &item.gid,
                item.size,
            )?;
            let flags = item.flags(store)?;
            if !flags.is_empty() {
                store.append_items_flags(
                    std::slice::from_ref(&copy),
                    &flags,
                    false,
                    Some(&destination),
                    true,
                )?;
            }
        }

        store.commit_transaction()?;
        self.writer().tagged(tag, "OK COPY completed")?;
        Ok(())
    }
}
