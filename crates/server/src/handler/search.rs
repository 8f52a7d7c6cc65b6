#![forbid(unsafe_code)]
//! SEARCH: ad-hoc query against the registered search engines.
//!
//! ```text
//! tag SEARCH [MIMETYPE (..)] [COLLECTIONS (..)] [RECURSIVE] [REMOTE] QUERY string
//! ```

use std::io::{Read, Write};

use pimd_core::Id;

use super::HandlerError;
use crate::connection::Connection;
use crate::search::SearchRequest;

impl<R: Read, W: Write> Connection<R, W> {
    pub(crate) fn search(&mut self, tag: &[u8]) -> Result<(), HandlerError> {
        let mut mime_types = Vec::new();
        let mut collections: Vec<Id> = Vec::new();
        let mut recursive = false;
        let mut remote = false;
        let mut query = String::new();

        while !self.parser().at_command_end()? {
            let keyword = self.parser().read_string()?.to_ascii_uppercase();
            match keyword.as_slice() {
                b"MIMETYPE" => {
                    mime_types = self
                        .parser()
                        .read_list()?
                        .iter()
                        .filter_map(|item| item.as_atom())
                        .map(|atom| String::from_utf8_lossy(atom).into_owned())
                        .collect();
                }
                b"COLLECTIONS" => {
                    for item in self.parser().read_list()? {
                        let Some(atom) = item.as_atom() else { continue };
                        let id = String::from_utf8_lossy(atom)
                            .parse()
                            .map_err(|_| HandlerError::failure("Invalid collection id"))?;
                        collections.push(id);
                    }
                }
                b"RECURSIVE" => recursive = true,
                b"REMOTE" => remote = true,
                b"QUERY" => {
                    query = String::from_utf8_lossy(&self.parser().read_string()?).into_owned();
                }
                other => {
                    return Err(HandlerError::failure(format!(
                        "Unknown SEARCH argument '{}'",
                        String::from_utf8_lossy(other)
                    )))
                }
            }
        }
        if query.is_empty() {
            return Err(HandlerError::failure("No query specified"));
        }

        let search = self.search_manager();
        let session_id = String::from_utf8_lossy(self.session_id()).into_owned();
        let store = self.store()?;
        let collections = search.resolve_collections(store, &collections, &mime_types, recursive)?;
        let request = SearchRequest {
            id: format!("search-{session_id}"),
            query,
            collections,
            mime_types,
            remote,
        };
        let results = search.run_engines(&request);

        let mut line = String::from("SEARCH");
        for id in &results {
            line.push(' ');
            line.push_str(&id.to_string());
        }
        self.writer().untagged(&line)?;
        self.writer().tagged(tag, "OK SEARCH completed")?;
        Ok(())
    }
}
