#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver};

use pimd_core::{NotificationMessage, Operation};
use pimd_storage::{
    parts, Collection, DataStore, Flag, MimeType, NewPart, Part, PimItem, Resource, StoreConfig,
    StoreError, Tag, TagType,
};

fn temp_dir(test_name: &str) -> PathBuf {
    let base = std::env::temp_dir();
    let pid = std::process::id();
    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let dir = base.join(format!("pimd_items_{test_name}_{pid}_{nonce}"));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn open_store(dir: &PathBuf) -> (DataStore, Receiver<Vec<NotificationMessage>>) {
    let mut store = DataStore::open(StoreConfig::new(dir)).expect("open store");
    let (tx, rx) = mpsc::channel();
    store.collector().set_sink(tx);
    (store, rx)
}

fn seed(store: &mut DataStore) -> (Resource, Collection) {
    let mut resource = Resource {
        name: "test_resource".into(),
        ..Resource::default()
    };
    resource.insert(store).expect("insert resource");
    let mut collection = Collection {
        name: "inbox".into(),
        resource_id: resource.id,
        ..Collection::default()
    };
    collection.insert(store).expect("insert collection");
    (resource, collection)
}

fn append_item(
    store: &mut DataStore,
    collection: &Collection,
    remote_id: &str,
    parts: Vec<NewPart>,
) -> PimItem {
    let mime_type = MimeType::ensure(store, "application/octet-stream").expect("mime type");
    store
        .append_pim_item(parts, &mime_type, collection, None, remote_id, "1", remote_id, 10)
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
fn appended_payload_reads_back_byte_identical() {
    let dir = temp_dir("appended_payload_reads_back");
    let (mut store, rx) = open_store(&dir);
    let (_, collection) = seed(&mut store);

    let payload = b"Bernard, look!\nWHAT\x00!!!\n".to_vec();
    let item = append_item(
        &mut store,
        &collection,
        "TEST-1",
        vec![NewPart {
            fq_name: "PLD:DATA".into(),
            data: payload.clone(),
            datasize: payload.len() as i64,
            version: 0,
        }],
    );

    assert!(!item.dirty, "items fed by a resource are clean");
    let stored = Part::retrieve_by_item(&mut store, item.id).expect("parts");
    assert_eq!(stored.len(), 1);
    assert_eq!(
        parts::part_data(&store, &stored[0]).expect("payload"),
        payload
    );

    let notifications = drain(&rx);
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].operation, Operation::Add);
    let entity = notifications[0].entities.values().next().expect("entity");
    assert_eq!(entity.remote_id, "TEST-1");
    assert_eq!(entity.mime_type, "application/octet-stream");
}

#[test]
fn empty_remote_id_marks_item_dirty() {
    let dir = temp_dir("empty_remote_id_dirty");
    let (mut store, _rx) = open_store(&dir);
    let (_, collection) = seed(&mut store);

    let item = append_item(&mut store, &collection, "", Vec::new());
    assert!(item.dirty, "locally created items are dirty until written back");
}

#[test]
fn datasize_is_raised_to_actual_length() {
    let dir = temp_dir("datasize_raised");
    let (mut store, _rx) = open_store(&dir);
    let (_, collection) = seed(&mut store);

    let item = append_item(
        &mut store,
        &collection,
        "TEST-SIZE",
        vec![NewPart {
            fq_name: "PLD:DATA".into(),
            data: b"12345".to_vec(),
            datasize: 1,
            version: 0,
        }],
    );
    let stored = Part::retrieve_by_item(&mut store, item.id).expect("parts");
    assert_eq!(stored[0].datasize, 5);
}

#[test]
fn append_into_virtual_collection_is_rejected() {
    let dir = temp_dir("append_virtual_rejected");
    let (mut store, rx) = open_store(&dir);
    let (resource, _) = seed(&mut store);
    let mut virtual_collection = Collection {
        name: "search".into(),
        resource_id: resource.id,
        is_virtual: true,
        ..Collection::default()
    };
    virtual_collection.insert(&mut store).expect("insert collection");

    let mime_type = MimeType::ensure(&mut store, "application/octet-stream").expect("mime type");
    let err = store
        .append_pim_item(Vec::new(), &mime_type, &virtual_collection, None, "X", "", "X", 0)
        .expect_err("virtual append must fail");
    assert_eq!(err.to_string(), "Cannot append item into virtual collection");
    assert!(drain(&rx).is_empty(), "failed append emits nothing");
}

#[test]
fn duplicate_remote_id_within_resource_is_rejected() {
    let dir = temp_dir("duplicate_remote_id");
    let (mut store, _rx) = open_store(&dir);
    let (_, collection) = seed(&mut store);

    append_item(&mut store, &collection, "DUP-1", Vec::new());
    let mime_type = MimeType::ensure(&mut store, "application/octet-stream").expect("mime type");
    let err = store
        .append_pim_item(Vec::new(), &mime_type, &collection, None, "DUP-1", "", "", 0)
        .expect_err("duplicate remote id");
    assert!(matches!(err, StoreError::UniqueViolation { .. }));
}

#[test]
fn set_items_flags_is_idempotent() {
    let dir = temp_dir("set_items_flags_idempotent");
    let (mut store, rx) = open_store(&dir);
    let (_, collection) = seed(&mut store);
    let item = append_item(&mut store, &collection, "FLAG-1", Vec::new());
    drain(&rx);

    let seen = Flag::ensure(&mut store, "\\SEEN").expect("flag");
    let changed = store
        .set_items_flags(std::slice::from_ref(&item), std::slice::from_ref(&seen))
        .expect("set flags");
    assert!(changed);
    let first = drain(&rx);
    assert_eq!(first.len(), 1);
    assert!(first[0].added_flags.contains(&b"\\SEEN".to_vec()));

    let changed = store
        .set_items_flags(std::slice::from_ref(&item), std::slice::from_ref(&seen))
        .expect("set flags again");
    assert!(!changed, "second call must detect no difference");
    assert!(drain(&rx).is_empty(), "no change, no notification");

    let flags = item.flags(&mut store).expect("flags");
    assert_eq!(flags.len(), 1, "\\SEEN present exactly once");
}

#[test]
fn set_items_flags_removes_stale_relations() {
    let dir = temp_dir("set_items_flags_removes");
    let (mut store, rx) = open_store(&dir);
    let (_, collection) = seed(&mut store);
    let item = append_item(&mut store, &collection, "FLAG-2", Vec::new());

    let seen = Flag::ensure(&mut store, "\\SEEN").expect("flag");
    let draft = Flag::ensure(&mut store, "\\DRAFT").expect("flag");
    store
        .set_items_flags(std::slice::from_ref(&item), &[seen.clone(), draft.clone()])
        .expect("set both");
    drain(&rx);

    store
        .set_items_flags(std::slice::from_ref(&item), std::slice::from_ref(&draft))
        .expect("keep only draft");
    let notifications = drain(&rx);
    assert_eq!(notifications.len(), 1);
    assert!(notifications[0].removed_flags.contains(&b"\\SEEN".to_vec()));
    let names: Vec<String> = item
        .flags(&mut store)
        .expect("flags")
        .into_iter()
        .map(|flag| flag.name)
        .collect();
    assert_eq!(names, vec!["\\DRAFT".to_string()]);
}

#[test]
fn append_items_flags_reports_whether_anything_changed() {
    let dir = temp_dir("append_items_flags_check");
    let (mut store, rx) = open_store(&dir);
    let (_, collection) = seed(&mut store);
    let item = append_item(&mut store, &collection, "FLAG-3", Vec::new());
    drain(&rx);

    let seen = Flag::ensure(&mut store, "\\SEEN").expect("flag");
    let changed = store
        .append_items_flags(
            std::slice::from_ref(&item),
            std::slice::from_ref(&seen),
            true,
            Some(&collection),
            false,
        )
        .expect("append flag");
    assert!(changed);
    drain(&rx);

    let changed = store
        .append_items_flags(
            std::slice::from_ref(&item),
            std::slice::from_ref(&seen),
            true,
            Some(&collection),
            false,
        )
        .expect("append same flag");
    assert!(!changed, "flag already present everywhere");
    assert!(drain(&rx).is_empty());
}

#[test]
fn remove_items_flags_deletes_in_one_sweep() {
    let dir = temp_dir("remove_items_flags");
    let (mut store, rx) = open_store(&dir);
    let (_, collection) = seed(&mut store);
    let first = append_item(&mut store, &collection, "FLAG-4", Vec::new());
    let second = append_item(&mut store, &collection, "FLAG-5", Vec::new());
    let seen = Flag::ensure(&mut store, "\\SEEN").expect("flag");
    let items = [first.clone(), second.clone()];
    store
        .append_items_flags(&items, std::slice::from_ref(&seen), false, Some(&collection), true)
        .expect("seed flags");
    drain(&rx);

    store
        .remove_items_flags(&items, std::slice::from_ref(&seen))
        .expect("remove flags");
    let notifications = drain(&rx);
    assert_eq!(notifications.len(), 1);
    assert!(notifications[0].removed_flags.contains(&b"\\SEEN".to_vec()));
    assert!(first.flags(&mut store).expect("flags").is_empty());
    assert!(second.flags(&mut store).expect("flags").is_empty());
}

#[test]
fn tag_relations_mirror_flag_semantics() {
    let dir = temp_dir("tag_relations");
    let (mut store, rx) = open_store(&dir);
    let (_, collection) = seed(&mut store);
    let item = append_item(&mut store, &collection, "TAG-1", Vec::new());
    drain(&rx);

    let tag_type = TagType::ensure(&mut store, "PLAIN").expect("tag type");
    let mut tag = Tag {
        gid: "gid-1".into(),
        tag_type_id: tag_type.id,
        ..Tag::default()
    };
    tag.insert(&mut store).expect("insert tag");

    let changed = store
        .set_items_tags(std::slice::from_ref(&item), std::slice::from_ref(&tag))
        .expect("set tags");
    assert!(changed);
    let notifications = drain(&rx);
    assert!(notifications[0].added_tags.contains(&tag.id));

    let changed = store
        .set_items_tags(std::slice::from_ref(&item), std::slice::from_ref(&tag))
        .expect("set tags again");
    assert!(!changed);
    assert!(drain(&rx).is_empty());

    store
        .remove_items_tags(std::slice::from_ref(&item), std::slice::from_ref(&tag))
        .expect("remove tags");
    assert!(item.tags(&mut store).expect("tags").is_empty());
}

#[test]
fn remove_item_parts_deletes_only_named_types() {
    let dir = temp_dir("remove_item_parts");
    let (mut store, rx) = open_store(&dir);
    let (_, collection) = seed(&mut store);
    let item = append_item(
        &mut store,
        &collection,
        "PART-1",
        vec![
            NewPart {
                fq_name: "PLD:DATA".into(),
                data: b"payload".to_vec(),
                datasize: 7,
                version: 0,
            },
            NewPart {
                fq_name: "PLD:HEAD".into(),
                data: b"header".to_vec(),
                datasize: 6,
                version: 0,
            },
        ],
    );
    drain(&rx);

    store
        .remove_item_parts(&item, &[b"PLD:HEAD".to_vec()])
        .expect("remove part");
    let remaining = Part::retrieve_by_item(&mut store, item.id).expect("parts");
    assert_eq!(remaining.len(), 1);
    let notifications = drain(&rx);
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].operation, Operation::Modify);
    assert!(notifications[0].parts.contains(&b"PLD:HEAD".to_vec()));
}

#[test]
fn invalidate_item_cache_only_touches_clean_items() {
    let dir = temp_dir("invalidate_item_cache");
    let (mut store, _rx) = open_store(&dir);
    let (_, collection) = seed(&mut store);

    let clean = append_item(
        &mut store,
        &collection,
        "CLEAN-1",
        vec![NewPart {
            fq_name: "PLD:DATA".into(),
            data: b"cached payload".to_vec(),
            datasize: 14,
            version: 0,
        }],
    );
    let dirty = append_item(
        &mut store,
        &collection,
        "",
        vec![NewPart {
            fq_name: "PLD:DATA".into(),
            data: b"local payload".to_vec(),
            datasize: 13,
            version: 0,
        }],
    );

    store.invalidate_item_cache(&clean).expect("invalidate clean");
    store.invalidate_item_cache(&dirty).expect("invalidate dirty");

    let clean_parts = Part::retrieve_by_item(&mut store, clean.id).expect("parts");
    assert!(clean_parts[0].data.is_none(), "clean payload is purged");
    let dirty_parts = Part::retrieve_by_item(&mut store, dirty.id).expect("parts");
    assert!(
        dirty_parts[0].data.is_some(),
        "dirty payload is the only copy and must survive"
    );
}

#[test]
fn external_payload_spills_to_file_and_reads_back() {
    let dir = temp_dir("external_payload");
    let mut config = StoreConfig::new(&dir);
    config.external_payload_threshold = 8;
    let mut store = DataStore::open(config).expect("open store");
    let (_, collection) = seed(&mut store);

    let payload = vec![b'a'; 64];
    let item = append_item(
        &mut store,
        &collection,
        "EXT-1",
        vec![NewPart {
            fq_name: "PLD:DATA".into(),
            data: payload.clone(),
            datasize: 64,
            version: 0,
        }],
    );

    let stored = Part::retrieve_by_item(&mut store, item.id).expect("parts");
    assert!(stored[0].external);
    let file_name = String::from_utf8(stored[0].data.clone().expect("file name")).expect("utf8");
    let path = parts::external_file_path(store.data_dir(), &file_name);
    assert!(path.exists(), "payload file must exist");
    assert_eq!(parts::part_data(&store, &stored[0]).expect("payload"), payload);

    store.invalidate_item_cache(&item).expect("invalidate");
    assert!(!path.exists(), "invalidation removes the external file");
}

#[test]
fn cleanup_pim_items_notifies_before_deleting() {
    let dir = temp_dir("cleanup_pim_items");
    let (mut store, rx) = open_store(&dir);
    let (_, collection) = seed(&mut store);
    let item = append_item(
        &mut store,
        &collection,
        "GONE-1",
        vec![NewPart {
            fq_name: "PLD:DATA".into(),
            data: b"bye".to_vec(),
            datasize: 3,
            version: 0,
        }],
    );
    let seen = Flag::ensure(&mut store, "\\SEEN").expect("flag");
    store
        .append_items_flags(
            std::slice::from_ref(&item),
            std::slice::from_ref(&seen),
            false,
            Some(&collection),
            true,
        )
        .expect("seed flag");
    drain(&rx);

    store
        .cleanup_pim_items(std::slice::from_ref(&item))
        .expect("cleanup");
    let notifications = drain(&rx);
    assert_eq!(notifications[0].operation, Operation::Remove);
    assert!(PimItem::retrieve_by_id(&mut store, item.id)
        .expect("query")
        .is_none());
    assert!(Part::retrieve_by_item(&mut store, item.id)
        .expect("parts")
        .is_empty());
}

#[test]
fn unhide_drops_the_hidden_marker() {
    let dir = temp_dir("unhide_item");
    let (mut store, _rx) = open_store(&dir);
    let (_, collection) = seed(&mut store);
    let mut item = append_item(
        &mut store,
        &collection,
        "HIDE-1",
        vec![NewPart {
            fq_name: "ATR:HIDDEN".into(),
            data: Vec::new(),
            datasize: 0,
            version: 0,
        }],
    );
    store
        .exec(
            "UPDATE pim_items SET hidden = 1 WHERE id = ?",
            vec![rusqlite::types::Value::Integer(item.id)],
        )
        .expect("mark hidden");

    store.unhide_pim_item(&mut item).expect("unhide");
    let reloaded = PimItem::retrieve_by_id(&mut store, item.id)
        .expect("query")
        .expect("item");
    assert!(!reloaded.hidden);
    assert!(Part::retrieve_by_item(&mut store, item.id)
        .expect("parts")
        .is_empty());
}
