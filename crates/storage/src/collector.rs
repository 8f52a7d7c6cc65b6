#![forbid(unsafe_code)]
//! Per-transaction notification buffer.
//!
//! Mutations record typed change events here; the buffer is compressed on
//! arrival and handed to the notification manager when the owning
//! transaction commits. A rollback discards it silently.

use std::collections::BTreeSet;
use std::sync::mpsc::Sender;

use pimd_core::{Entity, Id, NotificationMessage, NotificationType, Operation};

pub struct NotificationCollector {
    session_id: Vec<u8>,
    pending: Vec<NotificationMessage>,
    sink: Option<Sender<Vec<NotificationMessage>>>,
    in_transaction: bool,
}

impl NotificationCollector {
    pub fn new() -> Self {
        Self {
            session_id: Vec::new(),
            pending: Vec::new(),
            sink: None,
            in_transaction: false,
        }
    }

    /// Toggled by the owning DataStore on outermost begin/commit/rollback.
    /// Outside a transaction every recorded change is delivered right away.
    pub fn set_in_transaction(&mut self, on: bool) {
        self.in_transaction = on;
    }

    pub fn set_session_id(&mut self, session_id: &[u8]) {
        self.session_id = session_id.to_vec();
    }

    /// Wires the collector to the notification manager's ingress channel.
    pub fn set_sink(&mut self, sink: Sender<Vec<NotificationMessage>>) {
        self.sink = Some(sink);
    }

    pub fn pending(&self) -> &[NotificationMessage] {
        &self.pending
    }

    fn add(&mut self, mut msg: NotificationMessage) {
        msg.session_id = self.session_id.clone();
        NotificationMessage::append_and_compress(&mut self.pending, msg);
        if !self.in_transaction {
            self.dispatch_notifications();
        }
    }

    fn item_message(
        operation: Operation,
        entities: Vec<Entity>,
        collection: Id,
        resource: &str,
    ) -> NotificationMessage {
        let mut msg = NotificationMessage::new(NotificationType::Items, operation);
        for entity in entities {
            msg.entities.insert(entity.id, entity);
        }
        msg.parent_collection = collection;
        msg.resource = resource.as_bytes().to_vec();
        msg
    }

    pub fn item_added(&mut self, entity: Entity, collection: Id, resource: &str) {
        self.add(Self::item_message(Operation::Add, vec![entity], collection, resource));
    }

    pub fn item_changed(
        &mut self,
        entity: Entity,
        collection: Id,
        resource: &str,
        parts: BTreeSet<Vec<u8>>,
    ) {
        let mut msg = Self::item_message(Operation::Modify, vec![entity], collection, resource);
        msg.parts = parts;
        self.add(msg);
    }

    pub fn items_flags_changed(
        &mut self,
        entities: Vec<Entity>,
        collection: Id,
        resource: &str,
        added_flags: BTreeSet<Vec<u8>>,
        removed_flags: BTreeSet<Vec<u8>>,
    ) {
        let mut msg = Self::item_message(Operation::Modify, entities, collection, resource);
        msg.parts.insert(b"FLAGS".to_vec());
        msg.added_flags = added_flags;
        msg.removed_flags = removed_flags;
        self.add(msg);
    }

    pub fn items_tags_changed(
        &mut self,
        entities: Vec<Entity>,
        collection: Id,
        resource: &str,
        added_tags: BTreeSet<Id>,
        removed_tags: BTreeSet<Id>,
    ) {
        let mut msg = Self::item_message(Operation::Modify, entities, collection, resource);
        msg.parts.insert(b"TAGS".to_vec());
        msg.added_tags = added_tags;
        msg.removed_tags = removed_tags;
        self.add(msg);
    }

    pub fn items_removed(&mut self, entities: Vec<Entity>, collection: Id, resource: &str) {
        self.add(Self::item_message(Operation::Remove, entities, collection, resource));
    }

    pub fn items_linked(&mut self, entities: Vec<Entity>, collection: Id, resource: &str) {
        self.add(Self::item_message(Operation::Link, entities, collection, resource));
    }

    pub fn items_unlinked(&mut self, entities: Vec<Entity>, collection: Id, resource: &str) {
        self.add(Self::item_message(Operation::Unlink, entities, collection, resource));
    }

    fn collection_message(
        operation: Operation,
        entity: Entity,
        parent: Id,
        resource: &str,
    ) -> NotificationMessage {
        let mut msg = NotificationMessage::new(NotificationType::Collections, operation);
        msg.entities.insert(entity.id, entity);
        msg.parent_collection = parent;
        msg.resource = resource.as_bytes().to_vec();
        msg
    }

    pub fn collection_added(&mut self, entity: Entity, parent: Id, resource: &str) {
        self.add(Self::collection_message(Operation::Add, entity, parent, resource));
    }

    pub fn collection_changed(
        &mut self,
        entity: Entity,
        parent: Id,
        resource: &str,
        changed_parts: BTreeSet<Vec<u8>>,
    ) {
        let mut msg = Self::collection_message(Operation::Modify, entity, parent, resource);
        msg.parts = changed_parts;
        self.add(msg);
    }

    pub fn collection_moved(
        &mut self,
        entity: Entity,
        old_parent: Id,
        new_parent: Id,
        resource: &str,
        destination_resource: &str,
    ) {
        let mut msg = Self::collection_message(Operation::Move, entity, old_parent, resource);
        msg.parent_dest_collection = new_parent;
        msg.destination_resource = destination_resource.as_bytes().to_vec();
        self.add(msg);
    }

    pub fn collection_removed(&mut self, entity: Entity, parent: Id, resource: &str) {
        self.add(Self::collection_message(Operation::Remove, entity, parent, resource));
    }

    pub fn collection_subscription_changed(
        &mut self,
        entity: Entity,
        parent: Id,
        resource: &str,
        subscribed: bool,
    ) {
        let operation = if subscribed {
            Operation::Subscribe
        } else {
            Operation::Unsubscribe
        };
        self.add(Self::collection_message(operation, entity, parent, resource));
    }

    fn tag_message(operation: Operation, tag_id: Id) -> NotificationMessage {
        let mut msg = NotificationMessage::new(NotificationType::Tags, operation);
        msg.entities.insert(
            tag_id,
            Entity {
                id: tag_id,
                ..Entity::default()
            },
        );
        msg
    }

    pub fn tag_added(&mut self, tag_id: Id) {
        self.add(Self::tag_message(Operation::Add, tag_id));
    }

    pub fn tag_changed(&mut self, tag_id: Id) {
        self.add(Self::tag_message(Operation::Modify, tag_id));
    }

    pub fn tag_removed(&mut self, tag_id: Id) {
        self.add(Self::tag_message(Operation::Remove, tag_id));
    }

    /// Forces delivery of everything buffered so far, mid-transaction.
    pub fn dispatch_notifications(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.pending);
        if let Some(sink) = &self.sink {
            // A closed manager is not an error for the mutation path.
            let _ = sink.send(batch);
        }
    }

    /// Called on outermost commit.
    pub fn transaction_committed(&mut self) {
        self.dispatch_notifications();
    }

    /// Called on rollback: pending notifications never happened.
    pub fn transaction_rolled_back(&mut self) {
        self.pending.clear();
    }
}

impl Default for NotificationCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn entity(id: Id) -> Entity {
        Entity {
            id,
            remote_id: format!("rid-{id}"),
            remote_revision: "1".into(),
            mime_type: "application/octet-stream".into(),
        }
    }

    #[test]
    fn rollback_discards_pending() {
        let (tx, rx) = mpsc::channel();
        let mut collector = NotificationCollector::new();
        collector.set_sink(tx);
        collector.set_in_transaction(true);
        collector.item_added(entity(1), 4, "res");
        collector.transaction_rolled_back();
        collector.transaction_committed();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn commit_preserves_recording_order() {
        let (tx, rx) = mpsc::channel();
        let mut collector = NotificationCollector::new();
        collector.set_sink(tx);
        collector.set_in_transaction(true);
        collector.item_added(entity(1), 4, "res");
        collector.items_removed(vec![entity(2)], 4, "res");
        collector.transaction_committed();
        let batch = rx.try_recv().expect("one batch");
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].operation, Operation::Add);
        assert_eq!(batch[1].operation, Operation::Remove);
    }

    #[test]
    fn duplicate_flag_change_is_compressed() {
        let mut collector = NotificationCollector::new();
        collector.set_in_transaction(true);
        let added: BTreeSet<Vec<u8>> = [b"\\Seen".to_vec()].into();
        collector.items_flags_changed(vec![entity(5)], 4, "res", added.clone(), BTreeSet::new());
        collector.items_flags_changed(vec![entity(5)], 4, "res", added, BTreeSet::new());
        assert_eq!(collector.pending().len(), 1);
    }
}
