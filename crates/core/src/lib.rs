#![forbid(unsafe_code)]
//! Shared value types for the pimd storage server: entity identifiers and
//! the change-notification message exchanged between the storage layer and
//! the notification manager.

pub mod ids;
pub mod notification;

pub use ids::{Id, ROOT_COLLECTION, UNSET_ID};
pub use notification::{Entity, NotificationMessage, NotificationType, Operation};
