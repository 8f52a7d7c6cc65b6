#![forbid(unsafe_code)]

mod support;
use support::*;

use pimd_core::{NotificationType, Operation};
use pimd_storage::{Collection, CollectionAttribute, PimItem, Resource};

fn seed_two_resources(harness: &Harness) -> (Collection, Collection, PimItem) {
    let mut store = harness.open_store();
    let (_, moved) = seed_collection(&mut store, "akonadi_resource_a", "moved");
    let item = seed_item(&mut store, &moved, "MOVED-1", b"payload");
    let mut resource_b = Resource {
        name: "akonadi_resource_b".into(),
        ..Resource::default()
    };
    resource_b.insert(&mut store).expect("insert resource");
    let mut target = Collection {
        name: "target".into(),
        resource_id: resource_b.id,
        ..Collection::default()
    };
    target.insert(&mut store).expect("insert target");
    (moved, target, item)
}

#[test]
fn move_across_resources_resets_descendants() {
    let harness = Harness::new();
    let (moved, target, item) = seed_two_resources(&harness);
    let source = harness.subscribe_all("move-observer");

    let input = format!("{LOGIN}1 MOVE {} {}\r\n", moved.id, target.id);
    let lines = harness.run(&input);
    assert!(lines.contains(&"1 OK MOVE completed".to_string()));

    let notification = recv_notification(&source);
    assert_eq!(notification.kind, NotificationType::Collections);
    assert_eq!(notification.operation, Operation::Move);
    assert_eq!(notification.resource, b"akonadi_resource_a".to_vec());
    assert_eq!(
        notification.destination_resource,
        b"akonadi_resource_b".to_vec()
    );

    let mut store = harness.open_store();
    let moved = Collection::retrieve_by_id(&mut store, moved.id)
        .expect("query")
        .expect("collection");
    assert_eq!(moved.parent_id, target.id);
    let item = PimItem::retrieve_by_id(&mut store, item.id)
        .expect("query")
        .expect("item");
    assert!(item.remote_id.is_empty());
    assert!(item.dirty);
}

#[test]
fn repeated_move_is_a_noop() {
    let harness = Harness::new();
    let (moved, target, _) = seed_two_resources(&harness);
    let source = harness.subscribe_all("move-observer");

    let input = format!(
        "{LOGIN}1 MOVE {col} {target}\r\n2 MOVE {col} {target}\r\n",
        col = moved.id,
        target = target.id
    );
    let lines = harness.run(&input);
    assert!(lines.contains(&"1 OK MOVE completed".to_string()));
    assert!(lines.contains(&"2 OK MOVE completed".to_string()));

    let first = recv_notification(&source);
    assert_eq!(first.operation, Operation::Move);
    // The second MOVE found the collection already in place.
    assert_no_notification(&source);
}

#[test]
fn modify_renames_and_records_changed_parts() {
    let harness = Harness::new();
    let collection = {
        let mut store = harness.open_store();
        seed_collection(&mut store, "res", "inbox").1
    };
    let source = harness.subscribe_all("modify-observer");

    let input = format!(
        "{LOGIN}1 MODIFY {} NAME renamed QUERYSTRING \"subject:foo\"\r\n",
        collection.id
    );
    let lines = harness.run(&input);
    assert!(lines.contains(&"1 OK MODIFY completed".to_string()));

    let notification = recv_notification(&source);
    assert_eq!(notification.kind, NotificationType::Collections);
    assert_eq!(notification.operation, Operation::Modify);
    assert!(notification.parts.contains(&b"NAME".to_vec()));
    assert!(notification.parts.contains(&b"QUERYSTRING".to_vec()));

    let mut store = harness.open_store();
    let collection = Collection::retrieve_by_id(&mut store, collection.id)
        .expect("query")
        .expect("collection");
    assert_eq!(collection.name, "renamed");
    assert_eq!(collection.query_string, "subject:foo");
}

#[test]
fn modify_sets_and_deletes_custom_attributes() {
    let harness = Harness::new();
    let collection = {
        let mut store = harness.open_store();
        seed_collection(&mut store, "res", "inbox").1
    };

    let input = format!(
        "{LOGIN}1 MODIFY {col} DISPLAYNAME \"My Inbox\"\r\n2 MODIFY {col} -DISPLAYNAME\r\n",
        col = collection.id
    );
    let lines = harness.run(&input);
    assert!(lines.contains(&"1 OK MODIFY completed".to_string()));
    assert!(lines.contains(&"2 OK MODIFY completed".to_string()));

    let mut store = harness.open_store();
    assert!(
        CollectionAttribute::retrieve(&mut store, collection.id, b"DISPLAYNAME")
            .expect("query")
            .is_none()
    );
}

#[test]
fn modify_cache_policy_round_trips() {
    let harness = Harness::new();
    let collection = {
        let mut store = harness.open_store();
        seed_collection(&mut store, "res", "inbox").1
    };

    let input = format!(
        "{LOGIN}1 MODIFY {} CACHEPOLICY (INHERIT false INTERVAL 10 CACHETIMEOUT 60 \
         SYNCONDEMAND true LOCALPARTS (PLD:DATA))\r\n",
        collection.id
    );
    let lines = harness.run(&input);
    assert!(lines.contains(&"1 OK MODIFY completed".to_string()));

    let mut store = harness.open_store();
    let collection = Collection::retrieve_by_id(&mut store, collection.id)
        .expect("query")
        .expect("collection");
    assert!(!collection.cache_policy_inherit);
    assert_eq!(collection.cache_policy_check_interval, 10);
    assert_eq!(collection.cache_policy_cache_timeout, 60);
    assert!(collection.cache_policy_sync_on_demand);
    assert_eq!(collection.cache_policy_local_parts, "PLD:DATA");
}

#[test]
fn subscribe_touches_only_changed_collections() {
    let harness = Harness::new();
    let collection = {
        let mut store = harness.open_store();
        let (resource, collection) = seed_collection(&mut store, "res", "inbox");
        let mut unsubscribed = Collection {
            name: "archive".into(),
            resource_id: resource.id,
            subscribed: false,
            ..Collection::default()
        };
        unsubscribed.insert(&mut store).expect("insert");
        collection
    };
    let source = harness.subscribe_all("subscribe-observer");

    // Collection 1 is already subscribed: no change, no notification.
    let input = format!("{LOGIN}1 SUBSCRIBE {} 2\r\n", collection.id);
    let lines = harness.run(&input);
    assert!(lines.contains(&"1 OK Completed".to_string()));

    let notification = recv_notification(&source);
    assert_eq!(notification.operation, Operation::Subscribe);
    assert!(notification.entities.contains_key(&2));
    assert_no_notification(&source);
}
