#![forbid(unsafe_code)]
//! The notification manager.
//!
//! Runs in its own thread, consuming committed notification batches from
//! the collectors and fanning them out to subscribed sources. Each source
//! filters with its monitor sets; its delivery queue is bounded and drops
//! the oldest entries rather than stalling the manager on a slow reader.

use std::collections::{HashSet, VecDeque};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use pimd_core::{Id, NotificationMessage, NotificationType};
use tracing::debug;

const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Filter state of one subscriber.
#[derive(Clone, Debug, Default)]
pub struct SourceFilter {
    pub all_monitored: bool,
    pub monitored_collections: HashSet<Id>,
    pub monitored_items: HashSet<Id>,
    pub monitored_tags: HashSet<Id>,
    pub monitored_resources: HashSet<Vec<u8>>,
    pub monitored_mime_types: HashSet<String>,
    pub ignored_sessions: HashSet<Vec<u8>>,
}

impl SourceFilter {
    /// Whether this source wants `msg`. Ignored sessions always lose;
    /// all-monitored still requires at least one entity; otherwise any one
    /// of the monitor sets has to match.
    pub fn accepts(&self, msg: &NotificationMessage) -> bool {
        if self.ignored_sessions.contains(&msg.session_id) {
            return false;
        }
        if self.all_monitored {
            // Without entities there is nothing to deliver.
            return !msg.entities.is_empty();
        }

        let monitored_ids = match msg.kind {
            NotificationType::Items => &self.monitored_items,
            NotificationType::Collections => &self.monitored_collections,
            NotificationType::Tags => &self.monitored_tags,
            NotificationType::Relations => &self.monitored_items,
        };
        if msg.entities.keys().any(|id| monitored_ids.contains(id)) {
            return true;
        }

        if self.monitored_collections.contains(&msg.parent_collection)
            || self
                .monitored_collections
                .contains(&msg.parent_dest_collection)
        {
            return true;
        }

        if msg
            .entities
            .values()
            .any(|entity| self.monitored_mime_types.contains(&entity.mime_type))
        {
            return true;
        }

        if !msg.resource.is_empty() && self.monitored_resources.contains(&msg.resource) {
            return true;
        }
        if !msg.destination_resource.is_empty()
            && self
                .monitored_resources
                .contains(&msg.destination_resource)
        {
            return true;
        }

        false
    }
}

struct QueueState {
    queue: VecDeque<NotificationMessage>,
    closed: bool,
}

/// A subscriber endpoint. Monitor-set mutations and message consumption
/// both go through the handle handed out by [`NotificationManager::subscribe`].
pub struct NotificationSource {
    identifier: String,
    filter: Mutex<SourceFilter>,
    capacity: usize,
    state: Mutex<QueueState>,
    available: Condvar,
}

impl NotificationSource {
    fn new(identifier: &str, capacity: usize) -> Self {
        Self {
            identifier: identifier.to_string(),
            filter: Mutex::new(SourceFilter::default()),
            capacity,
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn with_filter<T>(&self, f: impl FnOnce(&mut SourceFilter) -> T) -> T {
        let mut filter = self
            .filter
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut filter)
    }

    pub fn set_all_monitored(&self, on: bool) {
        self.with_filter(|filter| filter.all_monitored = on);
    }

    pub fn set_monitored_collection(&self, id: Id, on: bool) {
        self.with_filter(|filter| {
            if on {
                filter.monitored_collections.insert(id);
            } else {
                filter.monitored_collections.remove(&id);
            }
        });
    }

    pub fn set_monitored_item(&self, id: Id, on: bool) {
        self.with_filter(|filter| {
            if on {
                filter.monitored_items.insert(id);
            } else {
                filter.monitored_items.remove(&id);
            }
        });
    }

    pub fn set_monitored_tag(&self, id: Id, on: bool) {
        self.with_filter(|filter| {
            if on {
                filter.monitored_tags.insert(id);
            } else {
                filter.monitored_tags.remove(&id);
            }
        });
    }

    pub fn set_monitored_resource(&self, resource: &[u8], on: bool) {
        self.with_filter(|filter| {
            if on {
                filter.monitored_resources.insert(resource.to_vec());
            } else {
                filter.monitored_resources.remove(resource);
            }
        });
    }

    pub fn set_monitored_mime_type(&self, mime_type: &str, on: bool) {
        self.with_filter(|filter| {
            if on {
                filter.monitored_mime_types.insert(mime_type.to_string());
            } else {
                filter.monitored_mime_types.remove(mime_type);
            }
        });
    }

    pub fn set_ignored_session(&self, session_id: &[u8], on: bool) {
        self.with_filter(|filter| {
            if on {
                filter.ignored_sessions.insert(session_id.to_vec());
            } else {
                filter.ignored_sessions.remove(session_id);
            }
        });
    }

    /// Delivery from the manager thread. Returns false once the source is
    /// closed so the manager can drop it.
    fn push_batch(&self, batch: Vec<NotificationMessage>) -> bool {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if state.closed {
            return false;
        }
        for msg in batch {
            if state.queue.len() == self.capacity {
                state.queue.pop_front();
            }
            state.queue.push_back(msg);
        }
        self.available.notify_all();
        true
    }

    pub fn try_recv(&self) -> Option<NotificationMessage> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.queue.pop_front()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<NotificationMessage> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        loop {
            if let Some(msg) = state.queue.pop_front() {
                return Some(msg);
            }
            if state.closed {
                return None;
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let (next, _) = self
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state = next;
        }
    }

    pub fn close(&self) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.closed = true;
        self.available.notify_all();
    }
}

pub struct NotificationManager {
    sources: Arc<Mutex<Vec<Arc<NotificationSource>>>>,
    sender: Sender<Vec<NotificationMessage>>,
    queue_capacity: usize,
    handle: Option<JoinHandle<()>>,
}

impl NotificationManager {
    pub fn start() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(queue_capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel();
        let sources: Arc<Mutex<Vec<Arc<NotificationSource>>>> = Arc::new(Mutex::new(Vec::new()));
        let thread_sources = Arc::clone(&sources);
        let handle = std::thread::Builder::new()
            .name("notification-manager".into())
            .spawn(move || Self::run(receiver, thread_sources))
            .ok();
        Self {
            sources,
            sender,
            queue_capacity,
            handle,
        }
    }

    fn run(
        receiver: Receiver<Vec<NotificationMessage>>,
        sources: Arc<Mutex<Vec<Arc<NotificationSource>>>>,
    ) {
        while let Ok(batch) = receiver.recv() {
            let mut sources = sources
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            sources.retain(|source| {
                let filtered: Vec<NotificationMessage> = {
                    let filter = source
                        .filter
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    batch.iter().filter(|msg| filter.accepts(msg)).cloned().collect()
                };
                if filtered.is_empty() {
                    true
                } else {
                    source.push_batch(filtered)
                }
            });
        }
        debug!("notification manager stopped");
    }

    /// The collectors' ingress channel.
    pub fn sender(&self) -> Sender<Vec<NotificationMessage>> {
        self.sender.clone()
    }

    pub fn subscribe(&self, identifier: &str) -> Arc<NotificationSource> {
        let source = Arc::new(NotificationSource::new(identifier, self.queue_capacity));
        let mut sources = self
            .sources
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        sources.push(Arc::clone(&source));
        source
    }

    pub fn unsubscribe(&self, identifier: &str) {
        let mut sources = self
            .sources
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        sources.retain(|source| {
            if source.identifier() == identifier {
                source.close();
                false
            } else {
                true
            }
        });
    }

    /// Orderly shutdown: close the ingress and join the thread. Collector
    /// sender clones must be gone by now (connections joined first).
    pub fn stop(mut self) {
        drop(self.sender);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
