#![forbid(unsafe_code)]
//! The per-connection engine.
//!
//! One connection owns its socket, stream parser, session state and a lazily
//! opened database session. Commands run to completion on this thread; a
//! handler failure turns into a tagged `NO` and the rest of the command is
//! drained so the stream stays in sync.

use std::io::{Read, Write};
use std::sync::mpsc::Sender;
use std::sync::Arc;

use pimd_core::NotificationMessage;
use pimd_storage::{DataStore, Resource, StoreConfig};
use tracing::{debug, warn};

use crate::handler::{self, HandlerError};
use crate::parser::{ProtocolError, StreamParser};
use crate::response::ResponseWriter;
use crate::search::SearchManager;

pub const PROTOCOL_VERSION: &str = "37";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    NonAuthenticated,
    Authenticated,
    // Preserved for verbs that will gate on them; dispatch treats both like
    // Authenticated.
    Selected,
    LoggingOut,
}

/// Shared wiring a connection needs: how to open database sessions, where
/// committed notifications go, and the search manager for SEARCH commands.
pub struct ServerContext {
    pub store_config: StoreConfig,
    pub notification_sink: Sender<Vec<NotificationMessage>>,
    pub search: Arc<SearchManager>,
}

pub struct Connection<R: Read, W: Write> {
    parser: StreamParser<R, W>,
    writer: ResponseWriter<W>,
    state: ConnectionState,
    session_id: Vec<u8>,
    resource_context: Option<Resource>,
    store: Option<DataStore>,
    ctx: Arc<ServerContext>,
}

impl<R: Read, W: Write> Connection<R, W> {
    /// `continuation` and `writer` must reach the same peer; the parser
    /// writes literal continuations on the former while responses go
    /// through the latter.
    pub fn new(reader: R, continuation: W, writer: W, ctx: Arc<ServerContext>) -> Self {
        Self {
            parser: StreamParser::new(reader, continuation),
            writer: ResponseWriter::new(writer),
            state: ConnectionState::NonAuthenticated,
            session_id: Vec::new(),
            resource_context: None,
            store: None,
            ctx,
        }
    }

    pub(crate) fn parser(&mut self) -> &mut StreamParser<R, W> {
        &mut self.parser
    }

    pub(crate) fn writer(&mut self) -> &mut ResponseWriter<W> {
        &mut self.writer
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
    }

    pub(crate) fn session_id(&self) -> &[u8] {
        &self.session_id
    }

    pub(crate) fn set_session_id(&mut self, session_id: &[u8]) {
        self.session_id = session_id.to_vec();
        if let Some(store) = &mut self.store {
            store.set_session_id(session_id);
        }
    }

    pub(crate) fn resource_context(&self) -> Option<&Resource> {
        self.resource_context.as_ref()
    }

    pub(crate) fn set_resource_context(&mut self, resource: Option<Resource>) {
        self.resource_context = resource;
    }

    pub(crate) fn search_manager(&self) -> Arc<SearchManager> {
        Arc::clone(&self.ctx.search)
    }

    /// The database session, opened lazily on first use.
    pub(crate) fn store(&mut self) -> Result<&mut DataStore, HandlerError> {
        if self.store.is_none() {
            let mut store = DataStore::open(self.ctx.store_config.clone())?;
            store.set_session_id(&self.session_id);
            store
                .collector()
                .set_sink(self.ctx.notification_sink.clone());
            self.store = Some(store);
        }
        match self.store.as_mut() {
            Some(store) => Ok(store),
            None => Err(HandlerError::failure("no database session")),
        }
    }

    /// Closes an idle database session; reopened lazily by the next command.
    fn close_idle_store(&mut self) {
        if let Some(mut store) = self.store.take() {
            debug!("closing idle database session");
            store.close();
        }
    }

    /// Serves the connection until the peer disconnects or logs out.
    pub fn serve(&mut self) -> Result<(), ProtocolError> {
        self.writer.untagged(&format!(
            "OK Akonadi Almost IMAP Server [PROTOCOL {PROTOCOL_VERSION}]"
        ))?;

        loop {
            match self.parser.at_stream_end() {
                Ok(true) => break,
                Ok(false) => {}
                // An idle read timeout only closes the database session.
                Err(ProtocolError::Io(err))
                    if matches!(
                        err.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    self.close_idle_store();
                    continue;
                }
                Err(err) => return Err(err),
            }

            let tag = self.parser.read_string()?;
            // Stray newlines between commands.
            if tag.is_empty() && self.parser.at_command_end()? {
                self.parser.consume_command_end()?;
                continue;
            }

            let result = match self.parser.read_string() {
                Ok(verb) if verb.is_empty() => Err(HandlerError::failure("empty command")),
                Ok(verb) => handler::dispatch(self, &tag, &verb),
                Err(err) => Err(err.into()),
            };

            match result {
                Ok(()) => {
                    if self.parser.at_command_end()? {
                        self.parser.consume_command_end()?;
                    } else {
                        // Arguments the handler did not consume.
                        self.parser.skip_current_command()?;
                    }
                }
                Err(err) => {
                    if let Some(store) = self.store.as_mut() {
                        if store.in_transaction() {
                            warn!("handler failed inside a transaction, rolling back");
                            let _ = store.rollback_transaction();
                        }
                    }
                    self.writer.tagged(&tag, &format!("NO {err}"))?;
                    let _ = self.parser.skip_current_command();
                }
            }

            if self.state == ConnectionState::LoggingOut {
                break;
            }
        }
        Ok(())
    }
}
