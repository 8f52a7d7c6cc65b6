#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver};

use pimd_core::{NotificationMessage, NotificationType, Operation, ROOT_COLLECTION};
use pimd_storage::{
    parts, Collection, DataStore, MimeType, NewPart, PimItem, Resource, StoreConfig, StoreError,
};

fn temp_dir(test_name: &str) -> PathBuf {
    let base = std::env::temp_dir();
    let pid = std::process::id();
    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let dir = base.join(format!("pimd_collections_{test_name}_{pid}_{nonce}"));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn open_store(dir: &PathBuf) -> (DataStore, Receiver<Vec<NotificationMessage>>) {
    open_store_with(StoreConfig::new(dir))
}

fn open_store_with(config: StoreConfig) -> (DataStore, Receiver<Vec<NotificationMessage>>) {
    let mut store = DataStore::open(config).expect("open store");
    let (tx, rx) = mpsc::channel();
    store.collector().set_sink(tx);
    (store, rx)
}

fn make_resource(store: &mut DataStore, name: &str) -> Resource {
    let mut resource = Resource {
        name: name.into(),
        ..Resource::default()
    };
    resource.insert(store).expect("insert resource");
    resource
}

fn make_collection(store: &mut DataStore, name: &str, parent: i64, resource: &Resource) -> Collection {
    let mut collection = Collection {
        name: name.into(),
        parent_id: parent,
        resource_id: resource.id,
        ..Collection::default()
    };
    collection.insert(store).expect("insert collection");
    collection
}

fn append_item(store: &mut DataStore, collection: &Collection, remote_id: &str) -> PimItem {
    let mime_type = MimeType::ensure(store, "application/octet-stream").expect("mime type");
    store
        .append_pim_item(
            vec![NewPart {
                fq_name: "PLD:DATA".into(),
                data: remote_id.as_bytes().to_vec(),
                datasize: remote_id.len() as i64,
                version: 0,
            }],
            &mime_type,
            collection,
            None,
            remote_id,
            "1",
            remote_id,
            0,
        )
        .expect("append item")
}

fn drain(rx: &Receiver<Vec<NotificationMessage>>) -> Vec<NotificationMessage> {
    let mut all = Vec::new();
    while let Ok(batch) = rx.try_recv() {
        all.extend(batch);
    }
    all
}

#[test]
fn append_collection_emits_added() {
    let dir = temp_dir("append_collection_emits_added");
    let (mut store, rx) = open_store(&dir);
    let resource = make_resource(&mut store, "res_a");

    let mut collection = Collection {
        name: "inbox".into(),
        resource_id: resource.id,
        ..Collection::default()
    };
    store.append_collection(&mut collection).expect("append");
    let notifications = drain(&rx);
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].kind, NotificationType::Collections);
    assert_eq!(notifications[0].operation, Operation::Add);
    assert_eq!(notifications[0].resource, b"res_a".to_vec());
}

#[test]
fn duplicate_sibling_name_is_rejected_by_unique_index() {
    let dir = temp_dir("duplicate_sibling_name");
    let (mut store, _rx) = open_store(&dir);
    let resource = make_resource(&mut store, "res_a");
    make_collection(&mut store, "inbox", ROOT_COLLECTION, &resource);

    let mut duplicate = Collection {
        name: "inbox".into(),
        resource_id: resource.id,
        ..Collection::default()
    };
    let err = store
        .append_collection(&mut duplicate)
        .expect_err("duplicate (parent, name)");
    assert!(matches!(err, StoreError::Sql(_)));
}

#[test]
fn move_to_current_parent_is_a_noop() {
    let dir = temp_dir("move_noop");
    let (mut store, rx) = open_store(&dir);
    let resource = make_resource(&mut store, "res_a");
    let parent = make_collection(&mut store, "parent", ROOT_COLLECTION, &resource);
    let mut child = make_collection(&mut store, "child", parent.id, &resource);
    drain(&rx);

    store.move_collection(&mut child, parent.id).expect("move");
    assert!(drain(&rx).is_empty(), "no-op move emits nothing");
}

#[test]
fn move_into_own_descendant_is_rejected() {
    let dir = temp_dir("move_into_descendant");
    let (mut store, _rx) = open_store(&dir);
    let resource = make_resource(&mut store, "res_a");
    let mut top = make_collection(&mut store, "top", ROOT_COLLECTION, &resource);
    let middle = make_collection(&mut store, "middle", top.id, &resource);

    let err = store
        .move_collection(&mut top, middle.id)
        .expect_err("cycle");
    assert!(matches!(err, StoreError::InvalidMoveTarget));
    let top_id = top.id;
    let err = store.move_collection(&mut top, top_id).expect_err("self");
    assert!(matches!(err, StoreError::InvalidMoveTarget));
}

#[test]
fn cross_resource_move_resets_the_subtree() {
    let dir = temp_dir("cross_resource_move");
    let (mut store, rx) = open_store(&dir);
    let resource_a = make_resource(&mut store, "resource_a");
    let resource_b = make_resource(&mut store, "resource_b");
    let mut moved = make_collection(&mut store, "moved", ROOT_COLLECTION, &resource_a);
    let child = make_collection(&mut store, "moved_child", moved.id, &resource_a);
    let item = append_item(&mut store, &moved, "MOVE-1");
    let child_item = append_item(&mut store, &child, "MOVE-2");
    let target = make_collection(&mut store, "target", ROOT_COLLECTION, &resource_b);
    drain(&rx);

    store.move_collection(&mut moved, target.id).expect("move");

    let moved = Collection::retrieve_by_id(&mut store, moved.id)
        .expect("query")
        .expect("collection");
    assert_eq!(moved.resource_id, resource_b.id);
    assert!(moved.remote_id.is_empty());

    let child = Collection::retrieve_by_id(&mut store, child.id)
        .expect("query")
        .expect("collection");
    assert_eq!(child.resource_id, resource_b.id, "descendants switch resources");
    assert!(child.remote_id.is_empty());

    for id in [item.id, child_item.id] {
        let item = PimItem::retrieve_by_id(&mut store, id)
            .expect("query")
            .expect("item");
        assert!(item.remote_id.is_empty(), "resource-specific state is reset");
        assert!(item.dirty, "items must be written back by the new resource");
    }

    let notifications = drain(&rx);
    let move_msg = notifications
        .iter()
        .find(|msg| msg.operation == Operation::Move)
        .expect("move notification");
    assert_eq!(move_msg.resource, b"resource_a".to_vec());
    assert_eq!(move_msg.destination_resource, b"resource_b".to_vec());
}

#[test]
fn cleanup_emits_item_removals_before_collection_removal() {
    let dir = temp_dir("cleanup_order");
    let (mut store, rx) = open_store(&dir);
    let resource = make_resource(&mut store, "res_a");
    let collection = make_collection(&mut store, "doomed", ROOT_COLLECTION, &resource);
    append_item(&mut store, &collection, "DOOMED-1");
    drain(&rx);

    store.begin_transaction().expect("begin");
    store.cleanup_collection(&collection).expect("cleanup");
    store.commit_transaction().expect("commit");

    let notifications = drain(&rx);
    let kinds: Vec<(NotificationType, Operation)> = notifications
        .iter()
        .map(|msg| (msg.kind, msg.operation))
        .collect();
    let item_removed = kinds
        .iter()
        .position(|(kind, op)| *kind == NotificationType::Items && *op == Operation::Remove)
        .expect("items_removed");
    let collection_removed = kinds
        .iter()
        .position(|(kind, op)| *kind == NotificationType::Collections && *op == Operation::Remove)
        .expect("collection_removed");
    assert!(
        item_removed < collection_removed,
        "collection_removed strictly follows items_removed"
    );
    assert!(Collection::retrieve_by_id(&mut store, collection.id)
        .expect("query")
        .is_none());
    let orphans = store
        .query_rows("SELECT id FROM pim_items", Vec::new(), |row| {
            row.get::<_, i64>(0)
        })
        .expect("query items");
    assert!(orphans.is_empty(), "cascade removes contained items");
}

#[test]
fn cleanup_slow_path_matches_fast_path() {
    let dir = temp_dir("cleanup_slow_path");
    let mut config = StoreConfig::new(&dir);
    config.enforce_foreign_keys = false;
    config.external_payload_threshold = 4;
    let (mut store, rx) = open_store_with(config);
    let resource = make_resource(&mut store, "res_a");
    let collection = make_collection(&mut store, "doomed", ROOT_COLLECTION, &resource);
    let item = append_item(&mut store, &collection, "SLOW-PAYLOAD");
    let stored = pimd_storage::Part::retrieve_by_item(&mut store, item.id).expect("parts");
    let file_name = String::from_utf8(stored[0].data.clone().expect("file name")).expect("utf8");
    let path = parts::external_file_path(store.data_dir(), &file_name);
    assert!(path.exists());
    drain(&rx);

    store.cleanup_collection(&collection).expect("cleanup");

    assert!(Collection::retrieve_by_id(&mut store, collection.id)
        .expect("query")
        .is_none());
    let orphans = store
        .query_rows("SELECT id FROM pim_items", Vec::new(), |row| {
            row.get::<_, i64>(0)
        })
        .expect("query items");
    assert!(orphans.is_empty());
    assert!(!path.exists(), "external payload files are removed");
}

#[test]
fn active_cache_policy_walks_up_to_first_non_inheriting_ancestor() {
    let dir = temp_dir("active_cache_policy");
    let (mut store, _rx) = open_store(&dir);
    let resource = make_resource(&mut store, "res_a");

    let mut top = make_collection(&mut store, "top", ROOT_COLLECTION, &resource);
    top.cache_policy_inherit = false;
    top.cache_policy_check_interval = 42;
    top.cache_policy_cache_timeout = 99;
    top.cache_policy_sync_on_demand = true;
    top.cache_policy_local_parts = "PLD:DATA".into();
    top.update(&mut store).expect("update top");

    let middle = make_collection(&mut store, "middle", top.id, &resource);
    let mut leaf = make_collection(&mut store, "leaf", middle.id, &resource);

    store.active_cache_policy(&mut leaf).expect("resolve policy");
    assert_eq!(leaf.cache_policy_check_interval, 42);
    assert_eq!(leaf.cache_policy_cache_timeout, 99);
    assert!(leaf.cache_policy_sync_on_demand);
    assert_eq!(leaf.cache_policy_local_parts, "PLD:DATA");

    let mut orphan = make_collection(&mut store, "orphan", ROOT_COLLECTION, &resource);
    store.active_cache_policy(&mut orphan).expect("resolve policy");
    assert_eq!(orphan.cache_policy_check_interval, -1);
    assert_eq!(orphan.cache_policy_cache_timeout, -1);
    assert!(!orphan.cache_policy_sync_on_demand);
    assert_eq!(orphan.cache_policy_local_parts, "ALL");
}

#[test]
fn link_and_unlink_touch_only_changed_rows() {
    let dir = temp_dir("link_unlink");
    let (mut store, rx) = open_store(&dir);
    let resource = make_resource(&mut store, "res_a");
    let physical = make_collection(&mut store, "inbox", ROOT_COLLECTION, &resource);
    let mut virtual_collection = Collection {
        name: "saved-search".into(),
        resource_id: resource.id,
        is_virtual: true,
        ..Collection::default()
    };
    virtual_collection.insert(&mut store).expect("insert");
    let item = append_item(&mut store, &physical, "LINK-1");
    drain(&rx);

    store
        .link_pim_items(&virtual_collection, std::slice::from_ref(&item))
        .expect("link");
    let linked = drain(&rx);
    assert_eq!(linked.len(), 1);
    assert_eq!(linked[0].operation, Operation::Link);

    store
        .link_pim_items(&virtual_collection, std::slice::from_ref(&item))
        .expect("link again");
    assert!(drain(&rx).is_empty(), "already linked, nothing to announce");

    store
        .unlink_pim_items(&virtual_collection, std::slice::from_ref(&item))
        .expect("unlink");
    let unlinked = drain(&rx);
    assert_eq!(unlinked.len(), 1);
    assert_eq!(unlinked[0].operation, Operation::Unlink);

    let err = store
        .link_pim_items(&physical, std::slice::from_ref(&item))
        .expect_err("physical target");
    assert!(matches!(err, StoreError::NotVirtualCollection));
}

#[test]
fn collection_attributes_are_unique_per_key() {
    let dir = temp_dir("collection_attributes");
    let (mut store, rx) = open_store(&dir);
    let resource = make_resource(&mut store, "res_a");
    let collection = make_collection(&mut store, "inbox", ROOT_COLLECTION, &resource);
    drain(&rx);

    store
        .add_collection_attribute(&collection, b"ENTITYDISPLAY", b"my inbox")
        .expect("add attribute");
    let notifications = drain(&rx);
    assert_eq!(notifications.len(), 1);
    assert!(notifications[0].parts.contains(&b"ENTITYDISPLAY".to_vec()));

    let err = store
        .add_collection_attribute(&collection, b"ENTITYDISPLAY", b"again")
        .expect_err("duplicate key");
    assert!(matches!(err, StoreError::UniqueViolation { .. }));

    assert!(store
        .remove_collection_attribute(&collection, b"ENTITYDISPLAY")
        .expect("remove"));
    assert!(!store
        .remove_collection_attribute(&collection, b"ENTITYDISPLAY")
        .expect("remove again"));
}

#[test]
fn append_mime_type_creates_missing_names() {
    let dir = temp_dir("append_mime_type");
    let (mut store, _rx) = open_store(&dir);
    let resource = make_resource(&mut store, "res_a");
    let collection = make_collection(&mut store, "inbox", ROOT_COLLECTION, &resource);

    store
        .append_mime_type_for_collection(
            collection.id,
            &["message/rfc822".into(), "text/calendar".into()],
        )
        .expect("append mime types");
    // A second call hits the unique relation index and stays silent.
    store
        .append_mime_type_for_collection(collection.id, &["message/rfc822".into()])
        .expect("append again");

    let names: Vec<String> = collection
        .mime_types(&mut store)
        .expect("mime types")
        .into_iter()
        .map(|mime_type| mime_type.name)
        .collect();
    assert_eq!(names.len(), 2);
    assert!(names.contains(&"message/rfc822".to_string()));
}
