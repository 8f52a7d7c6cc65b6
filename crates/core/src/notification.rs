#![forbid(unsafe_code)]
//! Change-notification messages.
//!
//! One message describes one mutation of the data model. The collector in the
//! storage layer buffers messages per transaction and compresses them with
//! [`NotificationMessage::append_and_compress`]; the notification manager
//! fans committed batches out to subscribers.

use std::collections::{BTreeMap, BTreeSet};

use crate::ids::{Id, UNSET_ID};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NotificationType {
    Items,
    Collections,
    Tags,
    Relations,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Add,
    Modify,
    Move,
    Remove,
    Link,
    Unlink,
    Subscribe,
    Unsubscribe,
}

/// One entity referenced by a notification.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Entity {
    pub id: Id,
    pub remote_id: String,
    pub remote_revision: String,
    pub mime_type: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NotificationMessage {
    pub session_id: Vec<u8>,
    pub kind: NotificationType,
    pub operation: Operation,
    pub entities: BTreeMap<Id, Entity>,
    pub parent_collection: Id,
    pub parent_dest_collection: Id,
    pub resource: Vec<u8>,
    pub destination_resource: Vec<u8>,
    pub parts: BTreeSet<Vec<u8>>,
    pub added_flags: BTreeSet<Vec<u8>>,
    pub removed_flags: BTreeSet<Vec<u8>>,
    pub added_tags: BTreeSet<Id>,
    pub removed_tags: BTreeSet<Id>,
}

impl NotificationMessage {
    pub fn new(kind: NotificationType, operation: Operation) -> Self {
        Self {
            session_id: Vec::new(),
            kind,
            operation,
            entities: BTreeMap::new(),
            parent_collection: UNSET_ID,
            parent_dest_collection: UNSET_ID,
            resource: Vec::new(),
            destination_resource: Vec::new(),
            parts: BTreeSet::new(),
            added_flags: BTreeSet::new(),
            removed_flags: BTreeSet::new(),
            added_tags: BTreeSet::new(),
            removed_tags: BTreeSet::new(),
        }
    }

    pub fn add_entity(
        &mut self,
        id: Id,
        remote_id: impl Into<String>,
        remote_revision: impl Into<String>,
        mime_type: impl Into<String>,
    ) {
        self.entities.insert(
            id,
            Entity {
                id,
                remote_id: remote_id.into(),
                remote_revision: remote_revision.into(),
                mime_type: mime_type.into(),
            },
        );
    }

    /// Equality on every field except `operation` and `parts`.
    fn same_except_op_and_parts(&self, other: &Self) -> bool {
        self.session_id == other.session_id
            && self.kind == other.kind
            && self.entities == other.entities
            && self.parent_collection == other.parent_collection
            && self.parent_dest_collection == other.parent_dest_collection
            && self.resource == other.resource
            && self.destination_resource == other.destination_resource
            && self.added_flags == other.added_flags
            && self.removed_flags == other.removed_flags
            && self.added_tags == other.added_tags
            && self.removed_tags == other.removed_tags
    }

    /// Equality on every field except `operation`.
    fn same_except_op(&self, other: &Self) -> bool {
        self.same_except_op_and_parts(other) && self.parts == other.parts
    }

    /// Appends `msg` to `list`, compressing against the pending entries.
    ///
    /// For each pending entry with the same key (all fields except operation
    /// and parts):
    /// - same entry including parts, same operation or the arriving one is a
    ///   `Modify`: the arriving message is redundant and dropped;
    /// - arriving `Remove` against a pending `Modify`: the pending entry is
    ///   erased, removal subsumes the modification;
    /// - both `Modify` on items, parts differ: part sets are merged into the
    ///   pending entry.
    ///
    /// Returns whether the list changed.
    pub fn append_and_compress(list: &mut Vec<NotificationMessage>, msg: NotificationMessage) -> bool {
        let mut index = 0;
        while index < list.len() {
            let existing = &mut list[index];
            if msg.same_except_op(existing) {
                if msg.operation == existing.operation || msg.operation == Operation::Modify {
                    return false;
                }
                if msg.operation == Operation::Remove && existing.operation == Operation::Modify {
                    list.remove(index);
                    continue;
                }
            } else if msg.same_except_op_and_parts(existing)
                && msg.operation == Operation::Modify
                && existing.operation == Operation::Modify
                && msg.kind == NotificationType::Items
            {
                existing.parts.extend(msg.parts);
                return true;
            }
            index += 1;
        }
        list.push(msg);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item_msg(op: Operation, id: Id, parts: &[&str]) -> NotificationMessage {
        let mut msg = NotificationMessage::new(NotificationType::Items, op);
        msg.session_id = b"session".to_vec();
        msg.parent_collection = 1;
        msg.add_entity(id, "rid", "rrev", "application/octet-stream");
        msg.parts = parts.iter().map(|p| p.as_bytes().to_vec()).collect();
        msg
    }

    #[test]
    fn identical_message_is_dropped() {
        let mut list = Vec::new();
        assert!(NotificationMessage::append_and_compress(
            &mut list,
            item_msg(Operation::Add, 1, &[])
        ));
        assert!(!NotificationMessage::append_and_compress(
            &mut list,
            item_msg(Operation::Add, 1, &[])
        ));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn modify_after_add_is_dropped() {
        let mut list = Vec::new();
        NotificationMessage::append_and_compress(&mut list, item_msg(Operation::Add, 1, &[]));
        assert!(!NotificationMessage::append_and_compress(
            &mut list,
            item_msg(Operation::Modify, 1, &[])
        ));
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].operation, Operation::Add);
    }

    #[test]
    fn remove_subsumes_modify() {
        let mut list = Vec::new();
        NotificationMessage::append_and_compress(&mut list, item_msg(Operation::Modify, 1, &[]));
        NotificationMessage::append_and_compress(&mut list, item_msg(Operation::Remove, 1, &[]));
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].operation, Operation::Remove);
    }

    #[test]
    fn modify_merges_part_sets() {
        let mut list = Vec::new();
        NotificationMessage::append_and_compress(
            &mut list,
            item_msg(Operation::Modify, 1, &["PLD:DATA"]),
        );
        NotificationMessage::append_and_compress(
            &mut list,
            item_msg(Operation::Modify, 1, &["PLD:HEAD"]),
        );
        assert_eq!(list.len(), 1);
        let parts: Vec<&[u8]> = list[0].parts.iter().map(|p| p.as_slice()).collect();
        assert_eq!(parts, vec![b"PLD:DATA".as_slice(), b"PLD:HEAD".as_slice()]);
    }

    #[test]
    fn distinct_entities_are_kept_in_order() {
        let mut list = Vec::new();
        NotificationMessage::append_and_compress(&mut list, item_msg(Operation::Add, 1, &[]));
        NotificationMessage::append_and_compress(&mut list, item_msg(Operation::Add, 2, &[]));
        NotificationMessage::append_and_compress(&mut list, item_msg(Operation::Remove, 1, &[]));
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].operation, Operation::Add);
        assert_eq!(list[2].operation, Operation::Remove);
    }
}
