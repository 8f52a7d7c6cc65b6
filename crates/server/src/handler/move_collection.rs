#![forbid(unsafe_code)]
//! MOVE: reparent a collection, possibly across resources.
//!
//! ```text
//! tag MOVE collection new-parent
//! ```

use std::io::{Read, Write};

use pimd_core::ROOT_COLLECTION;
use pimd_storage::Collection;

use super::HandlerError;
use crate::connection::Connection;

impl<R: Read, W: Write> Connection<R, W> {
    pub(crate) fn move_collection(&mut self, tag: &[u8]) -> Result<(), HandlerError> {
        let collection_id = self.parser().read_number()?;
        let new_parent_id = self.parser().read_number()?;

        let store = self.store()?;
        store.begin_transaction()?;

        let mut collection = Collection::retrieve_by_id(store, collection_id)?.ok_or_else(
            || HandlerError::failure(format!("Unknown collection for '{collection_id}'.")),
        )?;
        if new_parent_id != ROOT_COLLECTION
            && Collection::retrieve_by_id(store, new_parent_id)?.is_none()
        {
            return Err(HandlerError::failure(format!(
                "Unknown collection for '{new_parent_id}'."
            )));
        }

        store.move_collection(&mut collection, new_parent_id)?;
        store.commit_transaction()?;
        self.writer().tagged(tag, "OK MOVE completed")?;
        Ok(())
    }
}
