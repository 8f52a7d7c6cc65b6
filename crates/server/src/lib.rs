#![forbid(unsafe_code)]
//! The pimd server: connection engine, protocol handlers, notification
//! manager and search-update loop over the pimd storage layer.

pub mod config;
pub mod connection;
pub mod handler;
pub mod notify;
pub mod parser;
pub mod response;
pub mod search;
pub mod server;
pub mod workers;

pub use config::ServerConfig;
pub use connection::{Connection, ConnectionState, ServerContext, PROTOCOL_VERSION};
pub use notify::{NotificationManager, NotificationSource, SourceFilter};
pub use parser::{ListItem, ProtocolError, StreamParser};
pub use search::{SearchEngine, SearchManager, SearchRequest};
pub use server::{Server, ServerError};
