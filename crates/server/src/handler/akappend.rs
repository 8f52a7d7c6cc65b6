#![forbid(unsafe_code)]
//! X-AKAPPEND: append an item with payload parts.
//!
//! ```text
//! tag X-AKAPPEND collection size (meta-and-flags) "datetime" (parts)
//! meta     = \RemoteId[..] \MimeType[..] \RemoteRevision[..] \Gid[..]
//! flags    = plain atoms, \Tag[gid], \RTag[remote-id]
//! parts    = NS:NAME[version] followed by a literal or NIL
//! ```

use std::io::{Read, Write};

use pimd_storage::{Collection, Flag, NewPart, PartType, Tag, TagType};

use super::{bracket_value, format_protocol_datetime, parse_protocol_datetime, HandlerError};
use crate::connection::Connection;
use crate::parser::ListItem;

const DEFAULT_TAG_TYPE: &str = "PLAIN";

struct AppendMeta {
    remote_id: String,
    remote_revision: String,
    gid: String,
    mime_type: String,
    flag_names: Vec<Vec<u8>>,
    tag_gids: Vec<String>,
    tag_remote_ids: Vec<String>,
}

fn parse_meta(list: &[ListItem]) -> Result<AppendMeta, HandlerError> {
    let mut meta = AppendMeta {
        remote_id: String::new(),
        remote_revision: String::new(),
        gid: String::new(),
        mime_type: String::new(),
        flag_names: Vec::new(),
        tag_gids: Vec::new(),
        tag_remote_ids: Vec::new(),
    };
    for item in list {
        let Some(atom) = item.as_atom() else {
            return Err(HandlerError::failure("Malformed attribute list"));
        };
        if let Some(value) = bracket_value(atom, b"\\RemoteId[") {
            meta.remote_id = String::from_utf8_lossy(value).into_owned();
        } else if let Some(value) = bracket_value(atom, b"\\MimeType[") {
            meta.mime_type = String::from_utf8_lossy(value).into_owned();
        } else if let Some(value) = bracket_value(atom, b"\\RemoteRevision[") {
            meta.remote_revision = String::from_utf8_lossy(value).into_owned();
        } else if let Some(value) = bracket_value(atom, b"\\Gid[") {
            meta.gid = String::from_utf8_lossy(value).into_owned();
        } else if let Some(value) = bracket_value(atom, b"\\Tag[") {
            meta.tag_gids.push(String::from_utf8_lossy(value).into_owned());
        } else if let Some(value) = bracket_value(atom, b"\\RTag[") {
            meta.tag_remote_ids
                .push(String::from_utf8_lossy(value).into_owned());
        } else if !atom.is_empty() {
            meta.flag_names.push(atom.to_vec());
        }
    }
    Ok(meta)
}

/// Splits `NS:NAME[version]` into the fully qualified type name and the
/// version number.
fn parse_part_label(atom: &[u8]) -> Result<(String, i64), HandlerError> {
    let text = String::from_utf8_lossy(atom);
    let (fq_name, version) = match text.split_once('[') {
        Some((fq_name, rest)) => {
            let version = rest
                .strip_suffix(']')
                .and_then(|digits| digits.parse::<i64>().ok())
                .ok_or(HandlerError::InvalidPartType)?;
            (fq_name.to_string(), version)
        }
        None => (text.into_owned(), 0),
    };
    // Validate the shape early so trailing garbage after an overrun
    // literal fails with the part-type error.
    PartType::parse_fq_name(&fq_name)?;
    Ok((fq_name, version))
}

impl<R: Read, W: Write> Connection<R, W> {
    pub(crate) fn akappend(&mut self, tag: &[u8]) -> Result<(), HandlerError> {
        let collection_id = self.parser().read_number()?;
        let size = self.parser().read_number()?;
        let meta = parse_meta(&self.parser().read_list()?)?;
        let datetime = parse_protocol_datetime(&self.parser().read_string()?);

        // Parts stream through the parser: the part label, then a literal
        // (with its continuation) or NIL.
        let part_list = self.parser().read_list()?;
        let mut new_parts = Vec::new();
        let mut pending_label: Option<(String, i64)> = None;
        for entry in part_list {
            let Some(atom) = entry.as_atom() else {
                return Err(HandlerError::failure("Malformed part list"));
            };
            match pending_label.take() {
                None => pending_label = Some(parse_part_label(atom)?),
                Some((fq_name, version)) => {
                    new_parts.push(NewPart {
                        datasize: atom.len() as i64,
                        data: atom.to_vec(),
                        fq_name,
                        version,
                    });
                }
            }
        }
        if let Some((fq_name, version)) = pending_label {
            // A label with no payload is an empty part.
            new_parts.push(NewPart {
                fq_name,
                data: Vec::new(),
                datasize: 0,
                version,
            });
        }

        let resource_context = self.resource_context().cloned();
        let session_store = self.store()?;
        session_store.begin_transaction()?;

        let collection = Collection::retrieve_by_id(session_store, collection_id)?.ok_or_else(
            || HandlerError::failure(format!("Unknown collection for '{collection_id}'.")),
        )?;
        let mime_type = pimd_storage::MimeType::ensure(session_store, &meta.mime_type)?;

        let item = session_store.append_pim_item(
            new_parts,
            &mime_type,
            &collection,
            datetime,
            &meta.remote_id,
            &meta.remote_revision,
            &meta.gid,
            size,
        )?;

        if !meta.flag_names.is_empty() {
            let flags = Flag::resolve(session_store, &meta.flag_names)?;
            session_store.append_items_flags(
                std::slice::from_ref(&item),
                &flags,
                false,
                Some(&collection),
                true,
            )?;
        }

        let mut tags = Vec::new();
        for gid in &meta.tag_gids {
            let tag = match Tag::retrieve_by_gid(session_store, gid)? {
                Some(tag) => tag,
                None => {
                    let tag_type = TagType::ensure(session_store, DEFAULT_TAG_TYPE)?;
                    let mut tag = Tag {
                        gid: gid.clone(),
                        tag_type_id: tag_type.id,
                        ..Tag::default()
                    };
                    tag.insert(session_store)?;
                    session_store.collector().tag_added(tag.id);
                    tag
                }
            };
            tags.push(tag);
        }
        if !meta.tag_remote_ids.is_empty() {
            let resource = resource_context.ok_or_else(|| {
                HandlerError::failure("Only resources can create tags with a remote id")
            })?;
            for remote_id in &meta.tag_remote_ids {
                let tag = match Tag::retrieve_by_remote_id(session_store, resource.id, remote_id)? {
                    Some(tag) => tag,
                    None => {
                        let tag_type = TagType::ensure(session_store, DEFAULT_TAG_TYPE)?;
                        let mut tag = Tag {
                            gid: remote_id.clone(),
                            tag_type_id: tag_type.id,
                            ..Tag::default()
                        };
                        tag.insert(session_store)?;
                        tag.set_remote_id_for_resource(session_store, resource.id, remote_id)?;
                        session_store.collector().tag_added(tag.id);
                        tag
                    }
                };
                tags.push(tag);
            }
        }
        if !tags.is_empty() {
            session_store.append_items_tags(
                std::slice::from_ref(&item),
                &tags,
                false,
                Some(&collection),
                true,
            )?;
        }

        session_store.commit_transaction()?;

        self.writer().tagged(
            tag,
            &format!(
                "[UIDNEXT {} DATETIME \"{}\"]",
                item.id,
                format_protocol_datetime(&item.datetime)
            ),
        )?;
        self.writer().tagged(tag, "OK Append completed")?;
        Ok(())
    }
}
