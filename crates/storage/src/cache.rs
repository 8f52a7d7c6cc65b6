#![forbid(unsafe_code)]
//! Process-wide name-to-id caches for hot entities.
//!
//! Shared by every connection thread; a cache is consulted only while
//! enabled, and any write to the underlying table must invalidate the
//! affected name.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use once_cell::sync::Lazy;
use pimd_core::Id;

pub struct NameIdCache {
    enabled: AtomicBool,
    map: RwLock<HashMap<String, Id>>,
}

impl NameIdCache {
    fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            map: RwLock::new(HashMap::new()),
        }
    }

    pub fn enable(&self, on: bool) {
        self.enabled.store(on, Ordering::SeqCst);
        if !on {
            self.clear();
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn get(&self, name: &str) -> Option<Id> {
        if !self.enabled() {
            return None;
        }
        self.map.read().ok()?.get(name).copied()
    }

    pub fn put(&self, name: &str, id: Id) {
        if !self.enabled() {
            return;
        }
        if let Ok(mut map) = self.map.write() {
            map.insert(name.to_string(), id);
        }
    }

    pub fn invalidate(&self, name: &str) {
        if let Ok(mut map) = self.map.write() {
            map.remove(name);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut map) = self.map.write() {
            map.clear();
        }
    }
}

pub static MIME_TYPE_CACHE: Lazy<NameIdCache> = Lazy::new(NameIdCache::new);
pub static FLAG_CACHE: Lazy<NameIdCache> = Lazy::new(NameIdCache::new);
pub static RESOURCE_CACHE: Lazy<NameIdCache> = Lazy::new(NameIdCache::new);
pub static COLLECTION_CACHE: Lazy<NameIdCache> = Lazy::new(NameIdCache::new);

/// Turns on caching for the hot entity tables. Called once the schema is
/// known to be in place.
pub fn enable_entity_caches() {
    MIME_TYPE_CACHE.enable(true);
    FLAG_CACHE.enable(true);
    RESOURCE_CACHE.enable(true);
    COLLECTION_CACHE.enable(true);
}
