#![forbid(unsafe_code)]
//! Session verbs: LOGIN, LOGOUT, CAPABILITY, NOOP, SELECTRESOURCE.

use std::io::{Read, Write};

use pimd_storage::Resource;

use super::HandlerError;
use crate::connection::{Connection, ConnectionState, PROTOCOL_VERSION};

impl<R: Read, W: Write> Connection<R, W> {
    pub(crate) fn login(&mut self, tag: &[u8]) -> Result<(), HandlerError> {
        let session_id = self.parser().read_string()?;
        if session_id.is_empty() {
            return Err(HandlerError::failure("Missing session identifier"));
        }
        self.set_session_id(&session_id);
        self.set_state(ConnectionState::Authenticated);
        self.writer().tagged(tag, "OK LOGIN completed")?;
        Ok(())
    }

    pub(crate) fn logout(&mut self, tag: &[u8]) -> Result<(), HandlerError> {
        self.writer().untagged("OK Bye")?;
        self.writer().tagged(tag, "OK LOGOUT completed")?;
        self.set_state(ConnectionState::LoggingOut);
        Ok(())
    }

    pub(crate) fn capability(&mut self, tag: &[u8]) -> Result<(), HandlerError> {
        self.writer()
            .untagged(&format!("CAPABILITY PROTOCOL {PROTOCOL_VERSION}"))?;
        self.writer().tagged(tag, "OK CAPABILITY completed")?;
        Ok(())
    }

    pub(crate) fn noop(&mut self, tag: &[u8]) -> Result<(), HandlerError> {
        self.writer().tagged(tag, "OK NOOP completed")?;
        Ok(())
    }

    /// Binds a resource context to the connection. Resource-scoped tag
    /// operations (`\RTag`, tag REMOTEID) require one. An empty name
    /// clears the context.
    pub(crate) fn select_resource(&mut self, tag: &[u8]) -> Result<(), HandlerError> {
        let name = self.parser().read_string()?;
        if name.is_empty() {
            self.set_resource_context(None);
            self.writer().tagged(tag, "OK SELECTRESOURCE completed")?;
            return Ok(());
        }
        let name = String::from_utf8_lossy(&name).into_owned();
        let store = self.store()?;
        let resource = Resource::retrieve_by_name(store, &name)?
            .ok_or_else(|| HandlerError::failure(format!("Unknown resource '{name}'")))?;
        self.set_resource_context(Some(resource));
        self.writer().tagged(tag, "OK SELECTRESOURCE completed")?;
        Ok(())
    }
}
