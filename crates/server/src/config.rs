#![forbid(unsafe_code)]
//! Server configuration and the runtime connection file.
//!
//! Clients discover the socket through a small INI written next to it;
//! the file is removed again on shutdown.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use pimd_storage::StoreConfig;

pub const SOCKET_FILE: &str = "akonadiserver.socket";
pub const CONNECTION_CONFIG_FILE: &str = "akonadiconnectionrc";

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub data_dir: PathBuf,
    pub socket_path: PathBuf,
    pub store: StoreConfig,
    /// A connection's database session closes after this much idle time.
    pub idle_close: Duration,
    /// Quiet period before search collections are refreshed.
    pub search_update_debounce: Duration,
    pub cache_purge_interval: Duration,
    pub interval_check_interval: Duration,
    pub janitor_interval: Duration,
}

impl ServerConfig {
    pub fn for_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            socket_path: data_dir.join(SOCKET_FILE),
            store: StoreConfig::new(&data_dir),
            data_dir,
            idle_close: Duration::from_secs(5 * 60),
            search_update_debounce: Duration::from_secs(15),
            cache_purge_interval: Duration::from_secs(5 * 60),
            interval_check_interval: Duration::from_secs(60),
            janitor_interval: Duration::from_secs(15 * 60),
        }
    }

    pub fn connection_config_path(&self) -> PathBuf {
        self.data_dir.join(CONNECTION_CONFIG_FILE)
    }

    /// Writes the discovery INI: `Data/Method` plus the transport address.
    pub fn write_connection_config(&self) -> std::io::Result<()> {
        let mut file = std::fs::File::create(self.connection_config_path())?;
        writeln!(file, "[Data]")?;
        writeln!(file, "Method=UnixPath")?;
        writeln!(file, "UnixPath={}", self.socket_path.display())?;
        file.flush()
    }

    pub fn remove_connection_config(&self) {
        let _ = std::fs::remove_file(self.connection_config_path());
    }
}

pub fn remove_stale_socket(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}
