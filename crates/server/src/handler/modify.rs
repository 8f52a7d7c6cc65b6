#![forbid(unsafe_code)]
//! MODIFY: change collection attributes.
//!
//! ```text
//! tag MODIFY collection attribute-list
//! attribute-list = *([-]attribute-name [value])
//! ```
//!
//! Known attributes: NAME, PARENT, REMOTEID, REMOTEREVISION, MIMETYPE
//! (list), CACHEPOLICY (list), SUBSCRIBED, QUERYSTRING, QUERYCOLLECTIONS,
//! QUERYATTRIBUTES, VIRTUAL. Anything else is a custom attribute; a
//! leading `-` deletes it.

use std::collections::BTreeSet;
use std::io::{Read, Write};

use pimd_core::Entity;
use pimd_storage::{Collection, CollectionAttribute, DataStore};

use super::HandlerError;
use crate::connection::Connection;
use crate::parser::ListItem;

fn parse_bool(token: &[u8]) -> bool {
    matches!(token, b"true" | b"TRUE" | b"1")
}

fn apply_cache_policy(collection: &mut Collection, list: &[ListItem]) -> Result<(), HandlerError> {
    let mut iter = list.iter();
    while let Some(entry) = iter.next() {
        let Some(key) = entry.as_atom() else {
            return Err(HandlerError::failure("Malformed cache policy"));
        };
        match key.to_ascii_uppercase().as_slice() {
            b"INHERIT" => {
                let value = iter
                    .next()
                    .and_then(|item| item.as_atom())
                    .ok_or_else(|| HandlerError::failure("Malformed cache policy"))?;
                collection.cache_policy_inherit = parse_bool(value);
            }
            b"INTERVAL" => {
                let value = iter
                    .next()
                    .and_then(|item| item.as_atom())
                    .ok_or_else(|| HandlerError::failure("Malformed cache policy"))?;
                collection.cache_policy_check_interval = String::from_utf8_lossy(value)
                    .parse()
                    .map_err(|_| HandlerError::failure("Malformed cache policy"))?;
            }
            b"CACHETIMEOUT" => {
                let value = iter
                    .next()
                    .and_then(|item| item.as_atom())
                    .ok_or_else(|| HandlerError::failure("Malformed cache policy"))?;
                collection.cache_policy_cache_timeout = String::from_utf8_lossy(value)
                    .parse()
                    .map_err(|_| HandlerError::failure("Malformed cache policy"))?;
            }
            b"SYNCONDEMAND" => {
                let value = iter
                    .next()
                    .and_then(|item| item.as_atom())
                    .ok_or_else(|| HandlerError::failure("Malformed cache policy"))?;
                collection.cache_policy_sync_on_demand = parse_bool(value);
            }
            b"LOCALPARTS" => {
                let parts = match iter.next() {
                    Some(ListItem::List(parts)) => parts
                        .iter()
                        .filter_map(|item| item.as_atom())
                        .map(|atom| String::from_utf8_lossy(atom).into_owned())
                        .collect::<Vec<_>>()
                        .join(" "),
                    _ => return Err(HandlerError::failure("Malformed cache policy")),
                };
                collection.cache_policy_local_parts = parts;
            }
            _ => return Err(HandlerError::failure("Malformed cache policy")),
        }
    }
    Ok(())
}

fn set_custom_attribute(
    store: &mut DataStore,
    collection: &Collection,
    key: &[u8],
    value: &[u8],
) -> Result<(), HandlerError> {
    match CollectionAttribute::retrieve(store, collection.id, key)? {
        Some(mut attribute) => {
            attribute.value = value.to_vec();
            attribute.update(store)?;
            Ok(())
        }
        None => {
            store.add_collection_attribute(collection, key, value)?;
            Ok(())
        }
    }
}

impl<R: Read, W: Write> Connection<R, W> {
    pub(crate) fn modify_collection(&mut self, tag: &[u8]) -> Result<(), HandlerError> {
        let collection_id = self.parser().read_number()?;

        // Attribute tokens first, then one transaction for the lot.
        enum Change {
            Name(String),
            Parent(i64),
            RemoteId(String),
            RemoteRevision(String),
            MimeTypes(Vec<String>),
            CachePolicy(Vec<ListItem>),
            Subscribed(bool),
            QueryString(String),
            QueryCollections(String),
            QueryAttributes(String),
            Virtual(bool),
            SetAttribute(Vec<u8>, Vec<u8>),
            DeleteAttribute(Vec<u8>),
        }
        let mut changes = Vec::new();
        while !self.parser().at_command_end()? {
            let attribute = self.parser().read_string()?;
            match attribute.to_ascii_uppercase().as_slice() {
                b"NAME" => changes.push(Change::Name(
                    String::from_utf8_lossy(&self.parser().read_string()?).into_owned(),
                )),
                b"PARENT" => changes.push(Change::Parent(self.parser().read_number()?)),
                b"REMOTEID" => changes.push(Change::RemoteId(
                    String::from_utf8_lossy(&self.parser().read_string()?).into_owned(),
                )),
                b"REMOTEREVISION" => changes.push(Change::RemoteRevision(
                    String::from_utf8_lossy(&self.parser().read_string()?).into_owned(),
                )),
                b"MIMETYPE" => changes.push(Change::MimeTypes(
                    self.parser()
                        .read_list()?
                        .iter()
                        .filter_map(|item| item.as_atom())
                        .map(|atom| String::from_utf8_lossy(atom).into_owned())
                        .collect(),
                )),
                b"CACHEPOLICY" => changes.push(Change::CachePolicy(self.parser().read_list()?)),
                b"SUBSCRIBED" => changes.push(Change::Subscribed(parse_bool(
                    &self.parser().read_string()?,
                ))),
                b"QUERYSTRING" => changes.push(Change::QueryString(
                    String::from_utf8_lossy(&self.parser().read_string()?).into_owned(),
                )),
                b"QUERYCOLLECTIONS" => changes.push(Change::QueryCollections(
                    String::from_utf8_lossy(&self.parser().read_string()?).into_owned(),
                )),
                b"QUERYATTRIBUTES" => changes.push(Change::QueryAttributes(
                    String::from_utf8_lossy(&self.parser().read_string()?).into_owned(),
                )),
                b"VIRTUAL" => changes.push(Change::Virtual(parse_bool(
                    &self.parser().read_string()?,
                ))),
                _ if attribute.starts_with(b"-") => {
                    changes.push(Change::DeleteAttribute(attribute[1..].to_vec()));
                }
                _ => {
                    let value = self.parser().read_string()?;
                    changes.push(Change::SetAttribute(attribute, value));
                }
            }
        }

        let store = self.store()?;
        store.begin_transaction()?;

        let mut collection = Collection::retrieve_by_id(store, collection_id)?.ok_or_else(
            || HandlerError::failure(format!("Unknown collection for '{collection_id}'.")),
        )?;
        let mut changed_parts: BTreeSet<Vec<u8>> = BTreeSet::new();
        let mut subscription_change: Option<bool> = None;
        let mut new_parent: Option<i64> = None;

        for change in changes {
            match change {
                Change::Name(name) => {
                    if collection.name != name {
                        collection.name = name;
                        changed_parts.insert(b"NAME".to_vec());
                    }
                }
                Change::Parent(parent) => new_parent = Some(parent),
                Change::RemoteId(remote_id) => {
                    if collection.remote_id != remote_id {
                        collection.remote_id = remote_id;
                        changed_parts.insert(b"REMOTEID".to_vec());
                    }
                }
                Change::RemoteRevision(remote_revision) => {
                    if collection.remote_revision != remote_revision {
                        collection.remote_revision = remote_revision;
                        changed_parts.insert(b"REMOTEREVISION".to_vec());
                    }
                }
                Change::MimeTypes(names) => {
                    Collection::clear_mime_types(store, collection.id)?;
                    store.append_mime_type_for_collection(collection.id, &names)?;
                    changed_parts.insert(b"MIMETYPE".to_vec());
                }
                Change::CachePolicy(policy) => {
                    apply_cache_policy(&mut collection, &policy)?;
                    changed_parts.insert(b"CACHEPOLICY".to_vec());
                }
                Change::Subscribed(subscribed) => {
                    if collection.subscribed != subscribed {
                        collection.subscribed = subscribed;
                        subscription_change = Some(subscribed);
                    }
                }
                Change::QueryString(query) => {
                    if collection.query_string != query {
                        collection.query_string = query;
                        changed_parts.insert(b"QUERYSTRING".to_vec());
                    }
                }
                Change::QueryCollections(value) => {
                    if collection.query_collections != value {
                        collection.query_collections = value;
                        changed_parts.insert(b"QUERYCOLLECTIONS".to_vec());
                    }
                }
                Change::QueryAttributes(value) => {
                    if collection.query_attributes != value {
                        collection.query_attributes = value;
                        changed_parts.insert(b"QUERYATTRIBUTES".to_vec());
                    }
                }
                Change::Virtual(value) => {
                    if collection.is_virtual != value {
                        collection.is_virtual = value;
                        changed_parts.insert(b"VIRTUAL".to_vec());
                    }
                }
                Change::SetAttribute(key, value) => {
                    set_custom_attribute(store, &collection, &key, &value)?;
                }
                Change::DeleteAttribute(key) => {
                    store.remove_collection_attribute(&collection, &key)?;
                }
            }
        }

        collection.update(store)?;

        if !changed_parts.is_empty() {
            let resource = collection.resource(store)?.name;
            let entity = Entity {
                id: collection.id,
                remote_id: collection.remote_id.clone(),
                remote_revision: collection.remote_revision.clone(),
                mime_type: String::new(),
            };
            store.collector().collection_changed(
                entity,
                collection.parent_id,
                &resource,
                changed_parts,
            );
        }
        if let Some(subscribed) = subscription_change {
            let resource = collection.resource(store)?.name;
            let entity = Entity {
                id: collection.id,
                remote_id: collection.remote_id.clone(),
                remote_revision: collection.remote_revision.clone(),
                mime_type: String::new(),
            };
            store.collector().collection_subscription_changed(
                entity,
                collection.parent_id,
                &resource,
                subscribed,
            );
        }
        // Reparenting runs through the move path, with its notification.
        if let Some(parent) = new_parent {
            store.move_collection(&mut collection, parent)?;
        }

        store.commit_transaction()?;

        // Changing the query reschedules the search update for this
        // collection.
        let search = self.search_manager();
        search.schedule_update();

        self.writer().tagged(tag, "OK MODIFY completed")?;
        Ok(())
    }
}
