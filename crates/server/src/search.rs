#![forbid(unsafe_code)]
//! Search engines and the search-update loop for persistent search
//! collections.
//!
//! A search collection is a virtual collection carrying a query string. Its
//! membership is refreshed by [`SearchManager::update_search`]: the engines
//! fan out, new matches are linked (with a forced notification dispatch so
//! clients see partial progress), stale members are unlinked afterwards.

use std::collections::{BTreeSet, HashSet};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex};

use pimd_core::{Id, ROOT_COLLECTION};
use pimd_storage::{Collection, DataStore, PimItem, StoreError};
use tracing::{debug, warn};

/// The schema stores the query in a bounded column; anything longer was
/// truncated on the way in and must not run.
pub const MAX_QUERY_SIZE: usize = 32 * 1024;

pub const QUERY_ATTRIBUTE_REMOTE: &str = "REMOTE";
pub const QUERY_ATTRIBUTE_RECURSIVE: &str = "RECURSIVE";

#[derive(Clone, Debug)]
pub struct SearchRequest {
    pub id: String,
    pub query: String,
    pub collections: Vec<Id>,
    pub mime_types: Vec<String>,
    pub remote: bool,
}

/// One search backend. Implementations run on caller threads and must not
/// assume exclusive access.
pub trait SearchEngine: Send + Sync {
    fn search(&self, request: &SearchRequest) -> BTreeSet<Id>;
}

pub struct SearchManager {
    engines: Vec<Arc<dyn SearchEngine>>,
    updating: Mutex<HashSet<Id>>,
    update_done: Condvar,
    update_poke: Mutex<Option<Sender<()>>>,
}

impl SearchManager {
    pub fn new(engines: Vec<Arc<dyn SearchEngine>>) -> Self {
        Self {
            engines,
            updating: Mutex::new(HashSet::new()),
            update_done: Condvar::new(),
            update_poke: Mutex::new(None),
        }
    }

    /// Wires the debounce worker's channel; `schedule_update` pokes it.
    pub fn set_update_channel(&self, sender: Sender<()>) {
        let mut poke = self
            .update_poke
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *poke = Some(sender);
    }

    /// Drops the update channel; the debounce worker sees the disconnect
    /// and exits.
    pub fn clear_update_channel(&self) {
        let mut poke = self
            .update_poke
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *poke = None;
    }

    /// Requests a debounced search update for all search collections.
    pub fn schedule_update(&self) {
        let poke = self
            .update_poke
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(sender) = poke.as_ref() {
            let _ = sender.send(());
        }
    }

    /// Runs every engine over `request` and unions the results.
    pub fn run_engines(&self, request: &SearchRequest) -> BTreeSet<Id> {
        let mut results = BTreeSet::new();
        std::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(self.engines.len());
            for engine in &self.engines {
                let engine = Arc::clone(engine);
                handles.push(scope.spawn(move || engine.search(request)));
            }
            for handle in handles {
                if let Ok(partial) = handle.join() {
                    results.extend(partial);
                }
            }
        });
        results
    }

    /// The physical collections a query actually runs over. Empty
    /// `ancestors` means the whole tree, which implies recursion.
    pub fn resolve_collections(
        &self,
        store: &mut DataStore,
        ancestors: &[Id],
        mime_types: &[String],
        recursive: bool,
    ) -> Result<Vec<Id>, StoreError> {
        let (ancestors, recursive) = if ancestors.is_empty() {
            (vec![ROOT_COLLECTION], true)
        } else {
            (ancestors.to_vec(), recursive)
        };
        if !recursive {
            return Ok(ancestors);
        }

        let mut matched = Vec::new();
        let mut pending = ancestors;
        while let Some(current) = pending.pop() {
            for child in Collection::children(store, current)? {
                if child.is_virtual {
                    continue;
                }
                let child_id = child.id;
                if mime_types.is_empty() {
                    matched.push(child_id);
                } else {
                    let names: HashSet<String> = child
                        .mime_types(store)?
                        .into_iter()
                        .map(|mime_type| mime_type.name)
                        .collect();
                    if mime_types.iter().any(|name| names.contains(name)) {
                        matched.push(child_id);
                    }
                }
                pending.push(child_id);
            }
        }
        Ok(matched)
    }

    /// Refreshes one search collection. Concurrent updates of the same
    /// collection serialize: late callers block until the running update
    /// finishes, then run their own.
    pub fn update_search(
        &self,
        store: &mut DataStore,
        collection: &Collection,
    ) -> Result<(), StoreError> {
        {
            let mut updating = self
                .updating
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            while updating.contains(&collection.id) {
                updating = self
                    .update_done
                    .wait(updating)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
            updating.insert(collection.id);
        }

        let result = self.update_search_impl(store, collection);

        let mut updating = self
            .updating
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        updating.remove(&collection.id);
        self.update_done.notify_all();
        result
    }

    fn update_search_impl(
        &self,
        store: &mut DataStore,
        collection: &Collection,
    ) -> Result<(), StoreError> {
        if collection.query_string.len() >= MAX_QUERY_SIZE {
            warn!(
                collection = collection.id,
                "query exceeds the maximum size supported by the schema and is most \
                 likely truncated; not executing it"
            );
            return Ok(());
        }
        if collection.query_string.is_empty() {
            return Ok(());
        }

        let attributes: Vec<&str> = collection.query_attributes.split_whitespace().collect();
        let remote = attributes.contains(&QUERY_ATTRIBUTE_REMOTE);
        let recursive = attributes.contains(&QUERY_ATTRIBUTE_RECURSIVE);

        let mime_types: Vec<String> = collection
            .mime_types(store)?
            .into_iter()
            .map(|mime_type| mime_type.name)
            .collect();

        let ancestors: Vec<Id> = collection
            .query_collections
            .split_whitespace()
            .filter_map(|token| token.parse().ok())
            .collect();
        let query_collections = self.resolve_collections(store, &ancestors, &mime_types, recursive)?;
        if query_collections.is_empty() {
            debug!(
                collection = collection.id,
                "no collections to search, probably a virtual ancestor"
            );
            return Ok(());
        }

        let request = SearchRequest {
            id: format!("searchUpdate-{}", collection.id),
            query: collection.query_string.clone(),
            collections: query_collections,
            mime_types,
            remote,
        };
        let results = self.run_engines(&request);

        let existing: BTreeSet<Id> = Collection::pim_item_ids(store, collection.id)?
            .into_iter()
            .collect();

        // Link phase first so clients see results as they materialize.
        let new_matches: Vec<Id> = results.difference(&existing).copied().collect();
        if !new_matches.is_empty() {
            let items = PimItem::retrieve_by_ids(store, &new_matches)?;
            store.begin_transaction()?;
            store.link_pim_items(collection, &items)?;
            store.collector().dispatch_notifications();
            store.commit_transaction()?;
        }

        let stale: Vec<Id> = existing.difference(&results).copied().collect();
        if !stale.is_empty() {
            let items = PimItem::retrieve_by_ids(store, &stale)?;
            store.begin_transaction()?;
            store.unlink_pim_items(collection, &items)?;
            store.commit_transaction()?;
        }

        debug!(
            collection = collection.id,
            results = results.len(),
            linked = new_matches.len(),
            unlinked = stale.len(),
            "search update finished"
        );
        Ok(())
    }

    /// Refreshes every search collection with a query. The debounce worker
    /// calls this after its quiet period.
    pub fn update_all(&self, store: &mut DataStore) -> Result<(), StoreError> {
        let collections = Collection::retrieve_all(store)?;
        for collection in collections {
            if collection.is_virtual && !collection.query_string.is_empty() {
                self.update_search(store, &collection)?;
            }
        }
        Ok(())
    }
}
