#![forbid(unsafe_code)]
//! FETCH: report item metadata, flags and payload parts.
//!
//! ```text
//! tag FETCH uid-set [(part-names)]
//! ```
//!
//! Each matching item produces one untagged response; payload parts are
//! written as response literals so arbitrary bytes survive.

use std::io::{Read, Write};

use pimd_storage::{parts, Part, PartType};

use super::{format_protocol_datetime, parse_uid_set, resolve_items, HandlerError};
use crate::connection::Connection;

impl<R: Read, W: Write> Connection<R, W> {
    pub(crate) fn fetch(&mut self, tag: &[u8]) -> Result<(), HandlerError> {
        let uid_set = self.parser().read_string()?;
        let ids = parse_uid_set(&uid_set)?;
        let requested_parts: Option<Vec<String>> = if self.parser().at_command_end()? {
            None
        } else {
            Some(
                self.parser()
                    .read_list()?
                    .iter()
                    .filter_map(|item| item.as_atom())
                    .map(|atom| String::from_utf8_lossy(atom).into_owned())
                    .collect(),
            )
        };

        let store = self.store()?;
        let items = resolve_items(store, &ids)?;

        let mut responses: Vec<Vec<u8>> = Vec::with_capacity(items.len());
        for item in &items {
            let mime_type = item.mime_type(store)?;
            let flags = item.flags(store)?;
            let tags = item.tags(store)?;

            let mut line = Vec::new();
            line.extend_from_slice(format!("{} FETCH (UID {}", item.id, item.id).as_bytes());
            line.extend_from_slice(
                format!(
                    " REMOTEID \"{}\" REMOTEREVISION \"{}\" GID \"{}\"",
                    item.remote_id, item.remote_revision, item.gid
                )
                .as_bytes(),
            );
            line.extend_from_slice(
                format!(
                    " MIMETYPE \"{}\" COLLECTIONID {} SIZE {} DATETIME \"{}\"",
                    mime_type.name,
                    item.collection_id,
                    item.size,
                    format_protocol_datetime(&item.datetime)
                )
                .as_bytes(),
            );
            line.extend_from_slice(b" FLAGS (");
            for (index, flag) in flags.iter().enumerate() {
                if index > 0 {
                    line.push(b' ');
                }
                line.extend_from_slice(flag.name.as_bytes());
            }
            line.extend_from_slice(b") TAGS (");
            for (index, item_tag) in tags.iter().enumerate() {
                if index > 0 {
                    line.push(b' ');
                }
                line.extend_from_slice(item_tag.id.to_string().as_bytes());
            }
            line.push(b')');

            for part in Part::retrieve_by_item(store, item.id)? {
                let part_type = PartType::retrieve_by_id(store, part.part_type_id)?
                    .ok_or_else(|| HandlerError::failure("Dangling part type"))?;
                let fq_name = part_type.full_name();
                if let Some(requested) = &requested_parts {
                    if !requested.iter().any(|name| name == &fq_name) {
                        continue;
                    }
                }
                let data = parts::part_data(store, &part)?;
                line.extend_from_slice(
                    format!(" {}[{}] {{{}}}\r\n", fq_name, part.version, data.len()).as_bytes(),
                );
                line.extend_from_slice(&data);
            }
            responses.push(line);
        }

        // Fetching counts as access.
        for item in &items {
            let mut item = item.clone();
            item.touch(store)?;
        }

        for response in responses {
            self.writer().untagged_bytes(&response)?;
        }
        self.writer().tagged(tag, "OK FETCH completed")?;
        Ok(())
    }
}
