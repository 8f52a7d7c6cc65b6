#![forbid(unsafe_code)]
//! Background workers: periodic maintenance threads owned by the server.

use std::collections::HashSet;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::Utc;
use pimd_core::{Entity, NotificationMessage};
use pimd_storage::{parts, Collection, DataStore, PimItem, StoreConfig};
use tracing::{debug, warn};

use crate::search::SearchManager;

/// A periodic worker; ticks on an interval, stops when asked.
pub struct Worker {
    name: &'static str,
    shutdown: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn(
        name: &'static str,
        interval: Duration,
        mut tick: impl FnMut() + Send + 'static,
    ) -> Self {
        let (shutdown, stop_signal) = mpsc::channel();
        let handle = std::thread::Builder::new()
            .name(name.into())
            .spawn(move || loop {
                match stop_signal.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => tick(),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .ok();
        Self {
            name,
            shutdown,
            handle,
        }
    }

    pub fn stop(mut self) {
        let _ = self.shutdown.send(());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(worker = self.name, "worker thread panicked");
            }
        }
    }
}

fn open_worker_store(
    config: &StoreConfig,
    sink: &Sender<Vec<NotificationMessage>>,
    session: &[u8],
) -> Option<DataStore> {
    match DataStore::open(config.clone()) {
        Ok(mut store) => {
            store.set_session_id(session);
            store.collector().set_sink(sink.clone());
            Some(store)
        }
        Err(err) => {
            warn!("worker could not open a database session: {err}");
            None
        }
    }
}

/// Expires cached payloads of clean items in collections whose effective
/// cache policy carries a non-negative timeout.
pub fn spawn_cache_cleaner(
    config: StoreConfig,
    sink: Sender<Vec<NotificationMessage>>,
    interval: Duration,
) -> Worker {
    let mut store: Option<DataStore> = None;
    Worker::spawn("cache-cleaner", interval, move || {
        if store.is_none() {
            store = open_worker_store(&config, &sink, b"cache-cleaner");
        }
        let Some(store) = store.as_mut() else { return };
        store.keep_alive();
        if let Err(err) = cache_cleaner_tick(store) {
            warn!("cache cleaner tick failed: {err}");
        }
    })
}

fn cache_cleaner_tick(store: &mut DataStore) -> Result<(), pimd_storage::StoreError> {
    let collections = Collection::retrieve_all(store)?;
    for mut collection in collections {
        if collection.is_virtual {
            continue;
        }
        store.active_cache_policy(&mut collection)?;
        if collection.cache_policy_cache_timeout < 0 {
            continue;
        }
        let cutoff = Utc::now() - chrono::Duration::seconds(collection.cache_policy_cache_timeout);
        for item in PimItem::retrieve_by_collection(store, collection.id)? {
            if !item.dirty && item.atime < cutoff {
                store.invalidate_item_cache(&item)?;
            }
        }
    }
    Ok(())
}

/// Announces collections whose check interval elapsed so the owning
/// resources refresh them; the contract is the notification channel.
pub fn spawn_interval_checker(
    config: StoreConfig,
    sink: Sender<Vec<NotificationMessage>>,
    interval: Duration,
) -> Worker {
    let mut store: Option<DataStore> = None;
    Worker::spawn("interval-checker", interval, move || {
        if store.is_none() {
            store = open_worker_store(&config, &sink, b"interval-checker");
        }
        let Some(store) = store.as_mut() else { return };
        store.keep_alive();
        if let Err(err) = interval_check_tick(store) {
            warn!("interval check tick failed: {err}");
        }
    })
}

fn interval_check_tick(store: &mut DataStore) -> Result<(), pimd_storage::StoreError> {
    let collections = Collection::retrieve_all(store)?;
    for mut collection in collections {
        if collection.is_virtual {
            continue;
        }
        store.active_cache_policy(&mut collection)?;
        if collection.cache_policy_check_interval <= 0 {
            continue;
        }
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
            [b"SYNC".to_vec()].into(),
        );
    }
    Ok(())
}

/// Removes external payload files no part row references anymore.
pub fn spawn_janitor(config: StoreConfig, interval: Duration) -> Worker {
    let mut store: Option<DataStore> = None;
    Worker::spawn("storage-janitor", interval, move || {
        if store.is_none() {
            store = match DataStore::open(config.clone()) {
                Ok(store) => Some(store),
                Err(err) => {
                    warn!("janitor could not open a database session: {err}");
                    None
                }
            };
        }
        let Some(store) = store.as_mut() else { return };
        if let Err(err) = janitor_tick(store) {
            warn!("janitor tick failed: {err}");
        }
    })
}

fn janitor_tick(store: &mut DataStore) -> Result<(), pimd_storage::StoreError> {
    let referenced: HashSet<Vec<u8>> = store
        .query_rows(
            "SELECT data FROM parts WHERE external = 1 AND data IS NOT NULL",
            Vec::new(),
            |row| row.get::<_, Vec<u8>>(0),
        )?
        .into_iter()
        .collect();

    let dir = store.data_dir().join(parts::EXTERNAL_DIR);
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(()),
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        if !referenced.contains(name.to_string_lossy().as_bytes()) {
            debug!(file = %name.to_string_lossy(), "removing orphaned payload file");
            let _ = std::fs::remove_file(entry.path());
        }
    }
    Ok(())
}

/// The search-update debouncer: every poke restarts the quiet period; when
/// it elapses, all search collections are refreshed. Exits when the poke
/// channel disconnects.
pub fn spawn_search_updater(
    config: StoreConfig,
    sink: Sender<Vec<NotificationMessage>>,
    search: Arc<SearchManager>,
    debounce: Duration,
    poke: Receiver<()>,
) -> Option<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("search-updater".into())
        .spawn(move || {
            let mut store: Option<DataStore> = None;
            'outer: loop {
                if poke.recv().is_err() {
                    break;
                }
                // Debounce: keep waiting while pokes arrive.
                loop {
                    match poke.recv_timeout(debounce) {
                        Ok(()) => continue,
                        Err(RecvTimeoutError::Timeout) => break,
                        Err(RecvTimeoutError::Disconnected) => break 'outer,
                    }
                }
                if store.is_none() {
                    store = open_worker_store(&config, &sink, b"search-updater");
                }
                let Some(store) = store.as_mut() else { continue };
                if let Err(err) = search.update_all(store) {
                    warn!("search update failed: {err}");
                }
            }
            debug!("search updater stopped");
        })
        .ok()
}
