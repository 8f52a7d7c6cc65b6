#![forbid(unsafe_code)]
//! Server core: owns the listening socket, the per-connection threads, the
//! background workers and the notification manager, and tears everything
//! down in reverse dependency order.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use pimd_storage::{cache, DataStore};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::{remove_stale_socket, ServerConfig};
use crate::connection::ServerContext;
use crate::notify::{NotificationManager, NotificationSource};
use crate::search::{SearchEngine, SearchManager};
use crate::workers::{
    spawn_cache_cleaner, spawn_interval_checker, spawn_janitor, spawn_search_updater, Worker,
};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("cannot listen on the server socket: {0}")]
    Listen(std::io::Error),
    #[error("cannot initialize the storage schema: {0}")]
    Storage(#[from] pimd_storage::StoreError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub struct Server {
    config: ServerConfig,
    shutdown: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<()>>,
    active_connections: Arc<AtomicUsize>,
    workers: Vec<Worker>,
    search_updater: Option<JoinHandle<()>>,
    search: Arc<SearchManager>,
    notification_manager: Option<NotificationManager>,
}

struct ConnGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Server {
    pub fn start(
        config: ServerConfig,
        engines: Vec<Arc<dyn SearchEngine>>,
    ) -> Result<Self, ServerError> {
        // Initialize the schema before anything accepts commands; a failure
        // here is fatal.
        {
            let _probe = DataStore::open(config.store.clone())?;
        }
        cache::enable_entity_caches();

        let notification_manager = NotificationManager::start();
        let search = Arc::new(SearchManager::new(engines));

        let workers = vec![
            spawn_cache_cleaner(
                config.store.clone(),
                notification_manager.sender(),
                config.cache_purge_interval,
            ),
            spawn_interval_checker(
                config.store.clone(),
                notification_manager.sender(),
                config.interval_check_interval,
            ),
            spawn_janitor(config.store.clone(), config.janitor_interval),
        ];

        let (poke_tx, poke_rx) = mpsc::channel();
        search.set_update_channel(poke_tx);
        let search_updater = spawn_search_updater(
            config.store.clone(),
            notification_manager.sender(),
            Arc::clone(&search),
            config.search_update_debounce,
            poke_rx,
        );

        let ctx = Arc::new(ServerContext {
            store_config: config.store.clone(),
            notification_sink: notification_manager.sender(),
            search: Arc::clone(&search),
        });

        let shutdown = Arc::new(AtomicBool::new(false));
        let active_connections = Arc::new(AtomicUsize::new(0));
        let acceptor = Self::start_acceptor(
            &config,
            ctx,
            Arc::clone(&shutdown),
            Arc::clone(&active_connections),
        )?;

        info!(socket = %config.socket_path.display(), "server ready");
        Ok(Self {
            config,
            shutdown,
            acceptor: Some(acceptor),
            active_connections,
            workers,
            search_updater,
            search,
            notification_manager: Some(notification_manager),
        })
    }

    #[cfg(unix)]
    fn start_acceptor(
        config: &ServerConfig,
        ctx: Arc<ServerContext>,
        shutdown: Arc<AtomicBool>,
        active_connections: Arc<AtomicUsize>,
    ) -> Result<JoinHandle<()>, ServerError> {
        use std::os::unix::net::UnixListener;

        remove_stale_socket(&config.socket_path)?;
        let listener = UnixListener::bind(&config.socket_path).map_err(ServerError::Listen)?;
        listener.set_nonblocking(true)?;
        config.write_connection_config()?;

        let idle_close = config.idle_close;
        let handle = std::thread::Builder::new()
            .name("acceptor".into())
            .spawn(move || loop {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                match listener.accept() {
                    Ok((stream, _addr)) => {
                        let ctx = Arc::clone(&ctx);
                        let counter = Arc::clone(&active_connections);
                        counter.fetch_add(1, Ordering::SeqCst);
                        let result = std::thread::Builder::new()
                            .name("connection".into())
                            .spawn(move || {
                                let _guard = ConnGuard { counter };
                                if let Err(err) = serve_stream(stream, idle_close, ctx) {
                                    warn!("connection failed: {err}");
                                }
                            });
                        if result.is_err() {
                            error!("could not spawn a connection thread");
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(50));
                    }
                    Err(err) => {
                        warn!("accept failed: {err}");
                    }
                }
            })?;
        Ok(handle)
    }

    #[cfg(not(unix))]
    fn start_acceptor(
        _config: &ServerConfig,
        _ctx: Arc<ServerContext>,
        _shutdown: Arc<AtomicBool>,
        _active_connections: Arc<AtomicUsize>,
    ) -> Result<JoinHandle<()>, ServerError> {
        Err(ServerError::Listen(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "only UNIX domain sockets are supported on this platform",
        )))
    }

    /// Registers a notification subscriber.
    pub fn subscribe(&self, identifier: &str) -> Option<Arc<NotificationSource>> {
        self.notification_manager
            .as_ref()
            .map(|manager| manager.subscribe(identifier))
    }

    pub fn search_manager(&self) -> Arc<SearchManager> {
        Arc::clone(&self.search)
    }

    /// Blocks until the acceptor exits (server stop or fatal error).
    pub fn wait(&mut self) {
        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.join();
        }
    }

    /// Reverse dependency order: connections first, then the background
    /// workers, then the notification manager.
    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.join();
        }
        remove_stale_socket(&self.config.socket_path).ok();
        self.config.remove_connection_config();

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while self.active_connections.load(Ordering::SeqCst) > 0 {
            if std::time::Instant::now() > deadline {
                warn!("connections still active at shutdown, abandoning them");
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }

        for worker in self.workers.drain(..) {
            worker.stop();
        }
        self.search.clear_update_channel();
        if let Some(updater) = self.search_updater.take() {
            let _ = updater.join();
        }
        if let Some(manager) = self.notification_manager.take() {
            manager.stop();
        }
        info!("server stopped");
    }
}

#[cfg(unix)]
fn serve_stream(
    stream: std::os::unix::net::UnixStream,
    idle_close: Duration,
    ctx: Arc<ServerContext>,
) -> Result<(), crate::parser::ProtocolError> {
    stream.set_read_timeout(Some(idle_close))?;
    let reader = stream.try_clone()?;
    let continuation = stream.try_clone()?;
    let mut connection = crate::connection::Connection::new(reader, continuation, stream, ctx);
    connection.serve()
}
