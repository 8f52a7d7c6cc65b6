#![forbid(unsafe_code)]
//! One handler per protocol verb. Handlers are methods on the connection;
//! dispatch picks them by verb, gated on the session state.

mod akappend;
mod fetch;
mod item_copy;
mod link;
mod modify;
mod move_collection;
mod search;
mod session;
mod store;
mod subscribe;
mod tags;

use std::io::{Read, Write};

use chrono::{DateTime, Utc};
use pimd_core::Id;
use pimd_storage::{Collection, DataStore, PimItem, StoreError};
use thiserror::Error;

use crate::connection::{Connection, ConnectionState};
use crate::parser::ProtocolError;

pub const PROTOCOL_DATETIME_FORMAT: &str = "%d-%b-%Y %H:%M:%S %z";

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failure(String),
    #[error("ImapParserException: {0}")]
    Parser(#[from] ProtocolError),
    #[error("PartTypeException: Invalid part type name.")]
    InvalidPartType,
    #[error("{0}")]
    Store(StoreError),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl HandlerError {
    pub fn failure(message: impl Into<String>) -> Self {
        Self::Failure(message.into())
    }
}

impl From<StoreError> for HandlerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidInput("Invalid part type name.") => Self::InvalidPartType,
            other => Self::Store(other),
        }
    }
}

pub(crate) fn dispatch<R: Read, W: Write>(
    conn: &mut Connection<R, W>,
    tag: &[u8],
    verb: &[u8],
) -> Result<(), HandlerError> {
    let verb = verb.to_ascii_uppercase();
    // Always-allowed verbs first.
    match verb.as_slice() {
        b"LOGOUT" => return conn.logout(tag),
        b"CAPABILITY" => return conn.capability(tag),
        b"NOOP" => return conn.noop(tag),
        _ => {}
    }

    match conn.state() {
        ConnectionState::NonAuthenticated => match verb.as_slice() {
            b"LOGIN" => conn.login(tag),
            _ => conn.unknown_command(tag, &verb),
        },
        // Selected and LoggingOut dispatch like Authenticated until a verb
        // is explicitly gated on them.
        ConnectionState::Authenticated
        | ConnectionState::Selected
        | ConnectionState::LoggingOut => match verb.as_slice() {
            // Scope prefix; the actual verb follows.
            b"UID" | b"RID" => {
                let next = conn.parser().read_string()?;
                dispatch(conn, tag, &next)
            }
            b"X-AKAPPEND" => conn.akappend(tag),
            b"STORE" => conn.store_items(tag),
            b"FETCH" => conn.fetch(tag),
            b"COPY" => conn.copy_items(tag),
            b"MOVE" => conn.move_collection(tag),
            b"LINK" => conn.link(tag, true),
            b"UNLINK" => conn.link(tag, false),
            b"MODIFY" => conn.modify_collection(tag),
            b"SUBSCRIBE" => conn.subscribe(tag, true),
            b"UNSUBSCRIBE" => conn.subscribe(tag, false),
            b"SEARCH" => conn.search(tag),
            b"TAGAPPEND" => conn.tag_append(tag),
            b"TAGSTORE" => conn.tag_store(tag),
            b"TAGREMOVE" => conn.tag_remove(tag),
            b"TAGFETCH" => conn.tag_fetch(tag),
            b"SELECTRESOURCE" => conn.select_resource(tag),
            _ => conn.unknown_command(tag, &verb),
        },
    }
}

impl<R: Read, W: Write> Connection<R, W> {
    pub(crate) fn unknown_command(&mut self, tag: &[u8], verb: &[u8]) -> Result<(), HandlerError> {
        let verb = String::from_utf8_lossy(verb).into_owned();
        self.writer()
            .tagged(tag, &format!("BAD Unrecognized command: {verb}"))?;
        Ok(())
    }
}

/* --- shared parsing helpers ------------------------------------------- */

/// `5`, `1,3`, `2:4` and unions thereof.
pub(crate) fn parse_uid_set(token: &[u8]) -> Result<Vec<Id>, HandlerError> {
    let text = String::from_utf8_lossy(token);
    let mut ids = Vec::new();
    for chunk in text.split(',') {
        let chunk = chunk.trim();
        if chunk.is_empty() {
            continue;
        }
        match chunk.split_once(':') {
            Some((low, high)) => {
                let low: Id = low
                    .parse()
                    .map_err(|_| HandlerError::failure(format!("Invalid uid set '{text}'")))?;
                let high: Id = high
                    .parse()
                    .map_err(|_| HandlerError::failure(format!("Invalid uid set '{text}'")))?;
                for id in low..=high {
                    ids.push(id);
                }
            }
            None => ids.push(
                chunk
                    .parse()
                    .map_err(|_| HandlerError::failure(format!("Invalid uid set '{text}'")))?,
            ),
        }
    }
    if ids.is_empty() {
        return Err(HandlerError::failure("Empty uid set"));
    }
    Ok(ids)
}

/// Loads the items of a uid set; every id must exist.
pub(crate) fn resolve_items(store: &mut DataStore, ids: &[Id]) -> Result<Vec<PimItem>, HandlerError> {
    let items = PimItem::retrieve_by_ids(store, ids)?;
    if items.len() != ids.len() {
        return Err(HandlerError::failure("No items found"));
    }
    Ok(items)
}

/// A collection given as a numeric id or, failing that, a name.
pub(crate) fn collection_from_id_or_name(
    store: &mut DataStore,
    token: &[u8],
) -> Result<Option<Collection>, HandlerError> {
    let text = String::from_utf8_lossy(token).into_owned();
    if let Ok(id) = text.parse::<Id>() {
        return Ok(Collection::retrieve_by_id(store, id)?);
    }
    Ok(Collection::retrieve_by_name(store, &text)?)
}

/// `\RemoteId[TEST-1]` style bracketed attribute atoms.
pub(crate) fn bracket_value<'a>(atom: &'a [u8], prefix: &[u8]) -> Option<&'a [u8]> {
    if atom.starts_with(prefix) && atom.ends_with(b"]") {
        Some(&atom[prefix.len()..atom.len() - 1])
    } else {
        None
    }
}

pub(crate) fn parse_protocol_datetime(token: &[u8]) -> Option<DateTime<Utc>> {
    let text = String::from_utf8_lossy(token);
    DateTime::parse_from_str(&text, PROTOCOL_DATETIME_FORMAT)
        .ok()
        .map(|fixed| fixed.with_timezone(&Utc))
}

pub(crate) fn format_protocol_datetime(datetime: &DateTime<Utc>) -> String {
    datetime.format(PROTOCOL_DATETIME_FORMAT).to_string()
}
