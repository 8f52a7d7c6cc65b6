#![forbid(unsafe_code)]
//! SUBSCRIBE / UNSUBSCRIBE: toggle collection subscriptions.
//!
//! ```text
//! tag SUBSCRIBE collection-id-or-name...
//! ```
//!
//! Collections already in the requested state are left untouched; all
//! changes share one transaction.

use std::io::{Read, Write};

use super::{collection_from_id_or_name, HandlerError};
use crate::connection::Connection;

impl<R: Read, W: Write> Connection<R, W> {
    pub(crate) fn subscribe(&mut self, tag: &[u8], subscribe: bool) -> Result<(), HandlerError> {
        let mut names = Vec::new();
        while !self.parser().at_command_end()? {
            let name = self.parser().read_string()?;
            if name.is_empty() {
                break;
            }
            names.push(name);
        }

        let store = self.store()?;
        store.begin_transaction()?;

        for name in names {
            let Some(mut collection) = collection_from_id_or_name(store, &name)? else {
                return Err(HandlerError::failure("Invalid collection"));
            };
            if collection.subscribed == subscribe {
                continue;
            }
            collection.subscribed = subscribe;
            collection.update(store)?;
            let resource = collection.resource(store)?.name;
            let entity = pimd_core::Entity {
                id: collection.id,
                remote_id: collection.remote_id.clone(),
                remote_revision: collection.remote_revision.clone(),
                mime_type: String::new(),
            };
            store.collector().collection_subscription_changed(
                entity,
                collection.parent_id,
                &resource,
                subscribe,
            );
        }

        store.commit_transaction()?;
        self.writer().tagged(tag, "OK Completed")?;
        Ok(())
    }
}
