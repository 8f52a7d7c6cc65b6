#![forbid(unsafe_code)]
//! Typed records over the relational schema.
//!
//! Entities are plain owned values referencing rows by id; all database
//! access goes through the owning [`DataStore`](crate::DataStore) so that
//! statements are recorded for deadlock replay.

mod attribute;
mod collection;
mod flag;
mod item;
mod mime_type;
mod part;
mod resource;
mod tag;

pub use attribute::CollectionAttribute;
pub use collection::Collection;
pub use flag::Flag;
pub use item::PimItem;
pub use mime_type::MimeType;
pub use part::{Part, PartType, ATTRIBUTE_NAMESPACE, HIDDEN_ATTRIBUTE, PAYLOAD_NAMESPACE};
pub use resource::Resource;
pub use tag::{Tag, TagType};

use chrono::{DateTime, NaiveDateTime, Utc};

const DB_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn format_db_datetime(datetime: &DateTime<Utc>) -> String {
    datetime.format(DB_DATETIME_FORMAT).to_string()
}

pub fn parse_db_datetime(text: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(text, DB_DATETIME_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}
