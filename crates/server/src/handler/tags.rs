#![forbid(unsafe_code)]
//! Tag verbs: TAGAPPEND, TAGSTORE, TAGREMOVE, TAGFETCH.
//!
//! ```text
//! tag TAGAPPEND (GID value MIMETYPE value [PARENT id] [REMOTEID value])
//! tag TAGSTORE tag-id (attrs)
//! tag TAGREMOVE tag-id...
//! tag TAGFETCH uid-set
//! ```

use std::io::{Read, Write};

use pimd_core::Id;
use pimd_storage::{DataStore, Resource, Tag, TagType};

use super::{parse_uid_set, HandlerError};
use crate::connection::Connection;
use crate::parser::ListItem;

#[derive(Default)]
struct TagAttributes {
    gid: Option<String>,
    tag_type: Option<String>,
    parent_id: Option<Id>,
    remote_id: Option<String>,
}

fn parse_tag_attributes(list: &[ListItem]) -> Result<TagAttributes, HandlerError> {
    let mut attributes = TagAttributes::default();
    let mut iter = list.iter();
    while let Some(entry) = iter.next() {
        let Some(key) = entry.as_atom() else {
            return Err(HandlerError::failure("Malformed tag attribute list"));
        };
        let value = iter
            .next()
            .and_then(|item| item.as_atom())
            .ok_or_else(|| HandlerError::failure("Malformed tag attribute list"))?;
        match key.to_ascii_uppercase().as_slice() {
            b"GID" => attributes.gid = Some(String::from_utf8_lossy(value).into_owned()),
            b"MIMETYPE" => attributes.tag_type = Some(String::from_utf8_lossy(value).into_owned()),
            b"PARENT" => {
                attributes.parent_id = Some(
                    String::from_utf8_lossy(value)
                        .parse()
                        .map_err(|_| HandlerError::failure("Invalid tag parent"))?,
                )
            }
            b"REMOTEID" => {
                attributes.remote_id = Some(String::from_utf8_lossy(value).into_owned())
            }
            // TAG carries the client-side serialized form; opaque here.
            b"TAG" => {}
            other => {
                return Err(HandlerError::failure(format!(
                    "Unknown tag attribute '{}'",
                    String::from_utf8_lossy(other)
                )))
            }
        }
    }
    Ok(attributes)
}

fn tag_fetch_response(
    store: &mut DataStore,
    tag: &Tag,
    resource: Option<&Resource>,
) -> Result<String, HandlerError> {
    let tag_type = tag.tag_type(store)?;
    let mut response = format!(
        "{} TAGFETCH (UID {} GID \"{}\" PARENT {} MIMETYPE \"{}\"",
        tag.id, tag.id, tag.gid, tag.parent_id, tag_type.name
    );
    if let Some(resource) = resource {
        if let Some(remote_id) = tag.remote_id_for_resource(store, resource.id)? {
            response.push_str(&format!(" REMOTEID \"{remote_id}\""));
        }
    }
    response.push(')');
    Ok(response)
}

impl<R: Read, W: Write> Connection<R, W> {
    pub(crate) fn tag_append(&mut self, tag: &[u8]) -> Result<(), HandlerError> {
        let attributes = parse_tag_attributes(&self.parser().read_list()?)?;
        let gid = attributes
            .gid
            .ok_or_else(|| HandlerError::failure("Tag GID must be specified"))?;
        if gid.is_empty() {
            return Err(HandlerError::failure("Invalid tag name"));
        }
        let resource_context = self.resource_context().cloned();
        if attributes.remote_id.is_some() && resource_context.is_none() {
            return Err(HandlerError::failure(
                "Only resources can create tags with a remote id",
            ));
        }

        let store = self.store()?;
        store.begin_transaction()?;

        let type_name = attributes.tag_type.unwrap_or_else(|| "PLAIN".to_string());
        let tag_type = TagType::ensure(store, &type_name)?;
        let mut new_tag = Tag {
            gid,
            parent_id: attributes.parent_id.unwrap_or(0),
            tag_type_id: tag_type.id,
            ..Tag::default()
        };
        new_tag.insert(store)?;
        if let (Some(remote_id), Some(resource)) = (&attributes.remote_id, &resource_context) {
            new_tag.set_remote_id_for_resource(store, resource.id, remote_id)?;
        }
        store.collector().tag_added(new_tag.id);

        store.commit_transaction()?;

        let response = tag_fetch_response(self.store()?, &new_tag, resource_context.as_ref())?;
        self.writer().untagged(&response)?;
        self.writer().tagged(tag, "OK Append completed")?;
        Ok(())
    }

    pub(crate) fn tag_store(&mut self, tag: &[u8]) -> Result<(), HandlerError> {
        let tag_id = self.parser().read_number()?;
        let attributes = parse_tag_attributes(&self.parser().read_list()?)?;
        let resource_context = self.resource_context().cloned();
        if attributes.remote_id.is_some() && resource_context.is_none() {
            return Err(HandlerError::failure(
                "Only resources can change tag remote ids",
            ));
        }

        let store = self.store()?;
        store.begin_transaction()?;

        let mut stored_tag = Tag::retrieve_by_id(store, tag_id)?
            .ok_or_else(|| HandlerError::failure(format!("Unknown tag '{tag_id}'")))?;
        if let Some(gid) = attributes.gid {
            stored_tag.gid = gid;
        }
        if let Some(parent_id) = attributes.parent_id {
            stored_tag.parent_id = parent_id;
        }
        if let Some(type_name) = attributes.tag_type {
            stored_tag.tag_type_id = TagType::ensure(store, &type_name)?.id;
        }
        stored_tag.update(store)?;
        if let (Some(remote_id), Some(resource)) = (&attributes.remote_id, &resource_context) {
            stored_tag.set_remote_id_for_resource(store, resource.id, remote_id)?;
        }
        store.collector().tag_changed(stored_tag.id);

        store.commit_transaction()?;

        let response = tag_fetch_response(self.store()?, &stored_tag, resource_context.as_ref())?;
        self.writer().untagged(&response)?;
        self.writer().tagged(tag, "OK TAGSTORE completed")?;
        Ok(())
    }

    pub(crate) fn tag_remove(&mut self, tag: &[u8]) -> Result<(), HandlerError> {
        let mut ids = Vec::new();
        while !self.parser().at_command_end()? {
            ids.push(self.parser().read_number()?);
        }
        if ids.is_empty() {
            return Err(HandlerError::failure("No tags specified"));
        }

        let store = self.store()?;
        store.begin_transaction()?;
        for tag_id in ids {
            if Tag::retrieve_by_id(store, tag_id)?.is_none() {
                return Err(HandlerError::failure(format!("Unknown tag '{tag_id}'")));
            }
            // Announce while the row still exists.
            store.collector().tag_removed(tag_id);
            Tag::remove(store, tag_id)?;
        }
        store.commit_transaction()?;

        self.writer().tagged(tag, "OK TAGREMOVE completed")?;
        Ok(())
    }

    pub(crate) fn tag_fetch(&mut self, tag: &[u8]) -> Result<(), HandlerError> {
        let uid_set = self.parser().read_string()?;
        let ids = parse_uid_set(&uid_set)?;
        let resource_context = self.resource_context().cloned();

        let store = self.store()?;
        let mut responses = Vec::new();
        for tag_id in ids {
            let stored_tag = Tag::retrieve_by_id(store, tag_id)?
                .ok_or_else(|| HandlerError::failure(format!("Unknown tag '{tag_id}'")))?;
            responses.push(tag_fetch_response(
                store,
                &stored_tag,
                resource_context.as_ref(),
            )?);
        }
        for response in responses {
            self.writer().untagged(&response)?;
        }
        self.writer().tagged(tag, "OK TAGFETCH completed")?;
        Ok(())
    }
}
