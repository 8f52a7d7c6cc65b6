#![forbid(unsafe_code)]
//! LINK / UNLINK: virtual-collection membership.
//!
//! ```text
//! tag LINK virtual-collection uid-set
//! tag UNLINK virtual-collection uid-set
//! ```

use std::io::{Read, Write};

use pimd_storage::Collection;

use super::{parse_uid_set, resolve_items, HandlerError};
use crate::connection::Connection;

impl<R: Read, W: Write> Connection<R, W> {
    pub(crate) fn link(&mut self, tag: &[u8], link: bool) -> Result<(), HandlerError> {
        let collection_id = self.parser().read_number()?;
        let uid_set = self.parser().read_string()?;
        let ids = parse_uid_set(&uid_set)?;

        let store = self.store()?;
        store.begin_transaction()?;

        let collection = Collection::retrieve_by_id(store, collection_id)?.ok_or_else(|| {
            HandlerError::failure(format!("Unknown collection for '{collection_id}'."))
        })?;
        let items = resolve_items(store, &ids)?;
        if link {
            store.link_pim_items(&collection, &items)?;
        } else {
            store.unlink_pim_items(&collection, &items)?;
        }

        store.commit_transaction()?;
        let verb = if link { "LINK" } else { "UNLINK" };
        self.writer().tagged(tag, &format!("OK {verb} completed"))?;
        Ok(())
    }
}
