#![forbid(unsafe_code)]
//! Storage layer of the pimd server.
//!
//! The [`DataStore`] owns one database session per connection thread and is
//! the only way handlers touch the database: it counts nested transactions,
//! records statements for deadlock replay, and routes every mutation into
//! the per-transaction [`NotificationCollector`].

pub mod cache;
pub mod collector;
pub mod datastore;
pub mod entity;
pub mod error;
pub mod parts;
pub mod query;
pub mod schema;

pub use collector::NotificationCollector;
pub use datastore::{DataStore, DbBackend, NewPart, StoreConfig};
pub use entity::{
    Collection, CollectionAttribute, Flag, MimeType, Part, PartType, PimItem, Resource, Tag,
    TagType,
};
pub use error::StoreError;
pub use query::{CompareOperator, Condition, LogicOperator, QueryBuilder, QueryMode};
