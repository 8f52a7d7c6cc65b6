#![forbid(unsafe_code)]
//! STORE: modify items — flag and tag sets, remote state, cache
//! invalidation. Subcommands repeat until the command ends:
//!
//! ```text
//! tag STORE uid-set FLAGS (..) +FLAGS (..) -FLAGS (..)
//!                   TAGS (..) +TAGS (..) -TAGS (..)
//!                   REMOTEID value REMOTEREVISION value GID value
//!                   INVALIDATECACHE
//! ```

use std::io::{Read, Write};

use pimd_storage::{DataStore, Flag, Tag, TagType};

use super::{parse_uid_set, resolve_items, HandlerError};
use crate::connection::Connection;
use crate::parser::ListItem;

fn atoms_of(list: Vec<ListItem>) -> Result<Vec<Vec<u8>>, HandlerError> {
    list.into_iter()
        .map(|item| match item {
            ListItem::Atom(atom) => Ok(atom),
            ListItem::List(_) => Err(HandlerError::failure("Expected a flat list")),
        })
        .collect()
}

fn resolve_tags_by_gid(store: &mut DataStore, gids: &[Vec<u8>]) -> Result<Vec<Tag>, HandlerError> {
    let mut tags = Vec::with_capacity(gids.len());
    for gid in gids {
        let gid = String::from_utf8_lossy(gid).into_owned();
        let tag = match Tag::retrieve_by_gid(store, &gid)? {
            Some(tag) => tag,
            None => {
                let tag_type = TagType::ensure(store, "PLAIN")?;
                let mut tag = Tag {
                    gid,
                    tag_type_id: tag_type.id,
                    ..Tag::default()
                };
                tag.insert(store)?;
                store.collector().tag_added(tag.id);
                tag
            }
        };
        tags.push(tag);
    }
    Ok(tags)
}

impl<R: Read, W: Write> Connection<R, W> {
    pub(crate) fn store_items(&mut self, tag: &[u8]) -> Result<(), HandlerError> {
        let uid_set = self.parser().read_string()?;
        let ids = parse_uid_set(&uid_set)?;

        // Subcommands are collected first; literals and lists stream
        // through the parser, so nothing blocks mid-transaction.
        enum Op {
            SetFlags(Vec<Vec<u8>>),
            AddFlags(Vec<Vec<u8>>),
            RemoveFlags(Vec<Vec<u8>>),
            SetTags(Vec<Vec<u8>>),
            AddTags(Vec<Vec<u8>>),
            RemoveTags(Vec<Vec<u8>>),
            RemoteId(String),
            RemoteRevision(String),
            Gid(String),
            InvalidateCache,
        }
        let mut ops = Vec::new();
        while !self.parser().at_command_end()? {
            let subcommand = self.parser().read_string()?.to_ascii_uppercase();
            match subcommand.as_slice() {
                b"FLAGS" => ops.push(Op::SetFlags(atoms_of(self.parser().read_list()?)?)),
                b"+FLAGS" => ops.push(Op::AddFlags(atoms_of(self.parser().read_list()?)?)),
                b"-FLAGS" => ops.push(Op::RemoveFlags(atoms_of(self.parser().read_list()?)?)),
                b"TAGS" => ops.push(Op::SetTags(atoms_of(self.parser().read_list()?)?)),
                b"+TAGS" => ops.push(Op::AddTags(atoms_of(self.parser().read_list()?)?)),
                b"-TAGS" => ops.push(Op::RemoveTags(atoms_of(self.parser().read_list()?)?)),
                b"REMOTEID" => ops.push(Op::RemoteId(
                    String::from_utf8_lossy(&self.parser().read_string()?).into_owned(),
                )),
                b"REMOTEREVISION" => ops.push(Op::RemoteRevision(
                    String::from_utf8_lossy(&self.parser().read_string()?).into_owned(),
                )),
                b"GID" => ops.push(Op::Gid(
                    String::from_utf8_lossy(&self.parser().read_string()?).into_owned(),
                )),
                b"INVALIDATECACHE" => ops.push(Op::InvalidateCache),
                other => {
                    return Err(HandlerError::failure(format!(
                        "Unknown STORE operation '{}'",
                        String::from_utf8_lossy(other)
                    )))
                }
            }
        }

        let store = self.store()?;
        store.begin_transaction()?;
        let items = resolve_items(store, &ids)?;

        for op in ops {
            match op {
                Op::SetFlags(names) => {
                    let flags = Flag::resolve(store, &names)?;
                    store.set_items_flags(&items, &flags)?;
                }
                Op::AddFlags(names) => {
                    let flags = Flag::resolve(store, &names)?;
                    store.append_items_flags(&items, &flags, true, None, false)?;
                }
                Op::RemoveFlags(names) => {
                    let flags = Flag::resolve(store, &names)?;
                    store.remove_items_flags(&items, &flags)?;
                }
                Op::SetTags(gids) => {
                    let tags = resolve_tags_by_gid(store, &gids)?;
                    store.set_items_tags(&items, &tags)?;
                }
                Op::AddTags(gids) => {
                    let tags = resolve_tags_by_gid(store, &gids)?;
                    store.append_items_tags(&items, &tags, true, None, false)?;
                }
                Op::RemoveTags(gids) => {
                    let tags = resolve_tags_by_gid(store, &gids)?;
                    store.remove_items_tags(&items, &tags)?;
                }
                Op::RemoteId(remote_id) => {
                    for item in &items {
                        let mut item = item.clone();
                        item.remote_id = remote_id.clone();
                        item.dirty = false;
                        item.update(store)?;
                    }
                }
                Op::RemoteRevision(remote_revision) => {
                    for item in &items {
                        let mut item = item.clone();
                        item.remote_revision = remote_revision.clone();
                        item.update(store)?;
                    }
                }
                Op::Gid(gid) => {
                    for item in &items {
                        let mut item = item.clone();
                        item.gid = gid.clone();
                        item.update(store)?;
                    }
                }
                Op::InvalidateCache => {
                    for item in &items {
                        store.invalidate_item_cache(item)?;
                    }
                }
            }
        }

        store.commit_transaction()?;
        self.writer().tagged(tag, "OK STORE completed")?;
        Ok(())
    }
}
