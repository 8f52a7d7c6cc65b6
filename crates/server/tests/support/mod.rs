#![forbid(unsafe_code)]
#![allow(dead_code)]

use std::io::{Cursor, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pimd_core::NotificationMessage;
use pimd_server::{
    Connection, NotificationManager, NotificationSource, SearchEngine, SearchManager,
    ServerContext,
};
use pimd_storage::{Collection, DataStore, MimeType, NewPart, PimItem, Resource, StoreConfig};

/// In-memory egress shared between the continuation and response writers,
/// so the transcript keeps the on-wire ordering.
#[derive(Clone)]
pub struct SharedWriter(Arc<Mutex<Vec<u8>>>);

impl SharedWriter {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(Vec::new())))
    }

    pub fn take(&self) -> Vec<u8> {
        let mut buffer = self.0.lock().expect("writer lock");
        std::mem::take(&mut buffer)
    }
}

impl Write for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().expect("writer lock").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

pub struct Harness {
    _dir: tempfile::TempDir,
    pub store_config: StoreConfig,
    pub manager: NotificationManager,
    pub ctx: Arc<ServerContext>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_engines(Vec::new())
    }

    pub fn with_engines(engines: Vec<Arc<dyn SearchEngine>>) -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let store_config = StoreConfig::new(dir.path());
        let manager = NotificationManager::start();
        let ctx = Arc::new(ServerContext {
            store_config: store_config.clone(),
            notification_sink: manager.sender(),
            search: Arc::new(SearchManager::new(engines)),
        });
        Self {
            _dir: dir,
            store_config,
            manager,
            ctx,
        }
    }

    /// A session for seeding and verification; changes made through it do
    /// not produce notifications.
    pub fn open_store(&self) -> DataStore {
        DataStore::open(self.store_config.clone()).expect("open store")
    }

    pub fn subscribe_all(&self, identifier: &str) -> Arc<NotificationSource> {
        let source = self.manager.subscribe(identifier);
        source.set_all_monitored(true);
        source
    }

    /// Drives one full client session over in-memory buffers and returns
    /// the raw server transcript.
    pub fn run_raw(&self, input: impl AsRef<[u8]>) -> Vec<u8> {
        let writer = SharedWriter::new();
        let mut connection = Connection::new(
            Cursor::new(input.as_ref().to_vec()),
            writer.clone(),
            writer.clone(),
            Arc::clone(&self.ctx),
        );
        connection.serve().expect("serve session");
        writer.take()
    }

    /// Like [`run_raw`], split into response lines.
    pub fn run(&self, input: impl AsRef<[u8]>) -> Vec<String> {
        transcript_lines(&self.run_raw(input))
    }
}

pub fn transcript_lines(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .split("\r\n")
        .filter(|line| !line.is_empty())
        .map(|line| line.to_string())
        .collect()
}

pub fn recv_notification(source: &NotificationSource) -> NotificationMessage {
    source
        .recv_timeout(Duration::from_secs(5))
        .expect("notification within five seconds")
}

pub fn assert_no_notification(source: &NotificationSource) {
    assert!(
        source.recv_timeout(Duration::from_millis(200)).is_none(),
        "unexpected notification"
    );
}

/// Seeds a resource with one collection; the usual starting point.
pub fn seed_collection(store: &mut DataStore, resource_name: &str, name: &str) -> (Resource, Collection) {
    let mut resource = Resource {
        name: resource_name.into(),
        ..Resource::default()
    };
    resource.insert(store).expect("insert resource");
    let mut collection = Collection {
        name: name.into(),
        resource_id: resource.id,
        ..Collection::default()
    };
    collection.insert(store).expect("insert collection");
    (resource, collection)
}

pub fn seed_item(
    store: &mut DataStore,
    collection: &Collection,
    remote_id: &str,
    payload: &[u8],
) -> PimItem {
    let mime_type = MimeType::ensure(store, "application/octet-stream").expect("mime type");
    store
        .append_pim_item(
            vec![NewPart {
                fq_name: "PLD:DATA".into(),
                data: payload.to_vec(),
                datasize: payload.len() as i64,
                version: 0,
            }],
            &mime_type,
            collection,
            None,
            remote_id,
            "1",
            remote_id,
            payload.len() as i64,
        )
        .expect("append item")
}

/// The standard session prefix: log in and check the greeting.
pub const LOGIN: &str = "0 LOGIN test-session\r\n";
pub const GREETING: &str = "* OK Akonadi Almost IMAP Server [PROTOCOL 37]";
pub const LOGIN_OK: &str = "0 OK LOGIN completed";
