#![forbid(unsafe_code)]

mod support;
use support::*;

use pimd_core::{NotificationType, Operation};
use pimd_storage::{parts, Part, PimItem};

fn single_payload_command(collection: i64, remote_id: &str, payload: &[u8]) -> String {
    format!(
        "2 X-AKAPPEND {collection} {size} (\\RemoteId[{remote_id}] \
         \\MimeType[application/octet-stream] \\RemoteRevision[1] \\Gid[{remote_id}]) \
         \"12-May-2014 14:46:00 +0000\" (PLD:DATA[0] {{{size}}}\r\n{payload})\r\n",
        size = payload.len(),
        payload = String::from_utf8_lossy(payload),
    )
}

#[test]
fn append_single_payload_part() {
    let harness = Harness::new();
    let collection = {
        let mut store = harness.open_store();
        seed_collection(&mut store, "akonadi_fake_resource_0", "inbox").1
    };
    let source = harness.subscribe_all("append-observer");

    let input = format!(
        "{LOGIN}{}",
        single_payload_command(collection.id, "TEST-1", b"0123456789")
    );
    let lines = harness.run(&input);

    assert!(
        lines.contains(&"+ Ready for literal data (expecting 10 bytes)".to_string()),
        "missing continuation in: {lines:?}"
    );
    let mut store = harness.open_store();
    let item = store
        .query_opt(
            "SELECT id FROM pim_items WHERE remote_id = 'TEST-1'",
            Vec::new(),
            |row| row.get::<_, i64>(0),
        )
        .expect("query")
        .expect("item row");
    assert!(lines.contains(&format!(
        "2 [UIDNEXT {item} DATETIME \"12-May-2014 14:46:00 +0000\"]"
    )));
    assert!(lines.contains(&"2 OK Append completed".to_string()));

    let stored = Part::retrieve_by_item(&mut store, item).expect("parts");
    assert_eq!(stored.len(), 1);
    assert_eq!(
        parts::part_data(&store, &stored[0]).expect("payload"),
        b"0123456789"
    );

    let notification = recv_notification(&source);
    assert_eq!(notification.kind, NotificationType::Items);
    assert_eq!(notification.operation, Operation::Add);
    assert_eq!(notification.session_id, b"test-session".to_vec());
    let entity = notification.entities.values().next().expect("entity");
    assert_eq!(entity.remote_id, "TEST-1");
    assert_eq!(entity.mime_type, "application/octet-stream");
    assert_no_notification(&source);
}

#[test]
fn append_multiple_parts() {
    let harness = Harness::new();
    let collection = {
        let mut store = harness.open_store();
        seed_collection(&mut store, "res", "inbox").1
    };

    let input = format!(
        "{LOGIN}2 X-AKAPPEND {} 20 (\\RemoteId[TEST-2] \
         \\MimeType[application/octet-stream] \\RemoteRevision[1] \\Gid[TEST-2]) \
         \"12-May-2014 14:46:00 +0000\" (PLD:DATA[0] {{11}}\r\nRandom Data PLD:PLDTEST[0] {{9}}\r\nTest Data)\r\n",
        collection.id
    );
    let lines = harness.run(&input);
    assert!(lines.contains(&"2 OK Append completed".to_string()));

    let mut store = harness.open_store();
    let item = store
        .query_opt(
            "SELECT id FROM pim_items WHERE remote_id = 'TEST-2'",
            Vec::new(),
            |row| row.get::<_, i64>(0),
        )
        .expect("query")
        .expect("item row");
    let stored = Part::retrieve_by_item(&mut store, item).expect("parts");
    assert_eq!(stored.len(), 2);
}

#[test]
fn append_into_unknown_collection() {
    let harness = Harness::new();
    let source = harness.subscribe_all("append-observer");
    let input = format!("{LOGIN}2 X-AKAPPEND 100 0 () \"12-May-2014 14:46:00 +0000\" ()\r\n");
    let lines = harness.run(&input);
    assert!(lines.contains(&"2 NO Unknown collection for '100'.".to_string()));
    assert_no_notification(&source);
}

#[test]
fn append_into_virtual_collection() {
    let harness = Harness::new();
    let collection = {
        let mut store = harness.open_store();
        let (resource, _) = seed_collection(&mut store, "res", "inbox");
        let mut virtual_collection = pimd_storage::Collection {
            name: "search".into(),
            resource_id: resource.id,
            is_virtual: true,
            ..pimd_storage::Collection::default()
        };
        virtual_collection.insert(&mut store).expect("insert");
        virtual_collection
    };
    let input = format!(
        "{LOGIN}2 X-AKAPPEND {} 0 () \"12-May-2014 14:46:00 +0000\" ()\r\n",
        collection.id
    );
    let lines = harness.run(&input);
    assert!(lines.contains(&"2 NO Cannot append item into virtual collection".to_string()));
}

#[test]
fn append_empty_literal_part() {
    let harness = Harness::new();
    let collection = {
        let mut store = harness.open_store();
        seed_collection(&mut store, "res", "inbox").1
    };
    let input = format!("{LOGIN}{}", single_payload_command(collection.id, "TEST-7", b""));
    let lines = harness.run(&input);
    assert!(
        lines.contains(&"+ Ready for literal data (expecting 0 bytes)".to_string()),
        "missing continuation in: {lines:?}"
    );
    assert!(lines.contains(&"2 OK Append completed".to_string()));

    let mut store = harness.open_store();
    let item = store
        .query_opt(
            "SELECT id FROM pim_items WHERE remote_id = 'TEST-7'",
            Vec::new(),
            |row| row.get::<_, i64>(0),
        )
        .expect("query")
        .expect("item row");
    let stored = Part::retrieve_by_item(&mut store, item).expect("parts");
    assert_eq!(stored[0].datasize, 0);
}

#[test]
fn append_binary_payload_with_newlines_and_nul() {
    let harness = Harness::new();
    let collection = {
        let mut store = harness.open_store();
        seed_collection(&mut store, "res", "inbox").1
    };
    let payload = b"line one\nline two\x00binary\r\ntail";
    let input = {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(LOGIN.as_bytes());
        bytes.extend_from_slice(
            format!(
                "2 X-AKAPPEND {} {} (\\RemoteId[TEST-8] \
                 \\MimeType[application/octet-stream] \\RemoteRevision[1] \\Gid[TEST-8]) \
                 \"12-May-2014 14:46:00 +0000\" (PLD:DATA[0] {{{}}}\r\n",
                collection.id,
                payload.len(),
                payload.len()
            )
            .as_bytes(),
        );
        bytes.extend_from_slice(payload);
        bytes.extend_from_slice(b")\r\n");
        bytes
    };
    let transcript = harness.run_raw(&input);
    assert!(String::from_utf8_lossy(&transcript).contains("2 OK Append completed"));

    let mut store = harness.open_store();
    let item = store
        .query_opt(
            "SELECT id FROM pim_items WHERE remote_id = 'TEST-8'",
            Vec::new(),
            |row| row.get::<_, i64>(0),
        )
        .expect("query")
        .expect("item row");
    let stored = Part::retrieve_by_item(&mut store, item).expect("parts");
    assert_eq!(
        parts::part_data(&store, &stored[0]).expect("payload"),
        payload.to_vec()
    );
}

#[test]
fn literal_overrun_fails_as_invalid_part_type() {
    let harness = Harness::new();
    let collection = {
        let mut store = harness.open_store();
        seed_collection(&mut store, "res", "inbox").1
    };
    // Four bytes are advertised but eleven sent: the leftovers parse as the
    // next part label and fail.
    let input = format!(
        "{LOGIN}2 X-AKAPPEND {} 4 (\\RemoteId[TEST-9] \
         \\MimeType[application/octet-stream] \\RemoteRevision[1] \\Gid[TEST-9]) \
         \"12-May-2014 14:46:00 +0000\" (PLD:DATA[0] {{4}}\r\n12345678910)\r\n",
        collection.id
    );
    let lines = harness.run(&input);
    assert!(
        lines.contains(&"2 NO PartTypeException: Invalid part type name.".to_string()),
        "unexpected transcript: {lines:?}"
    );
    let mut store = harness.open_store();
    assert!(PimItem::retrieve_by_id(&mut store, 1).expect("query").is_none());
}

#[test]
fn truncated_literal_fails_as_parser_error() {
    let harness = Harness::new();
    let collection = {
        let mut store = harness.open_store();
        seed_collection(&mut store, "res", "inbox").1
    };
    let input = format!(
        "{LOGIN}2 X-AKAPPEND {} 4 (\\RemoteId[TEST-10] \
         \\MimeType[application/octet-stream] \\RemoteRevision[1] \\Gid[TEST-10]) \
         \"12-May-2014 14:46:00 +0000\" (PLD:DATA[0] {{4}}\r\n123",
        collection.id
    );
    let lines = harness.run(&input);
    assert!(
        lines.contains(&"2 NO ImapParserException: Unable to read more data".to_string()),
        "unexpected transcript: {lines:?}"
    );
}

#[test]
fn append_with_flags_and_tags() {
    let harness = Harness::new();
    let collection = {
        let mut store = harness.open_store();
        seed_collection(&mut store, "res", "inbox").1
    };
    let input = format!(
        "{LOGIN}2 X-AKAPPEND {} 0 (\\RemoteId[TEST-14] \
         \\MimeType[application/octet-stream] \\RemoteRevision[1] \\Gid[TEST-14] \
         \\SEEN $CUSTOM \\Tag[TAG-1]) \"12-May-2014 14:46:00 +0000\" ()\r\n",
        collection.id
    );
    let lines = harness.run(&input);
    assert!(lines.contains(&"2 OK Append completed".to_string()));

    let mut store = harness.open_store();
    let item = PimItem::retrieve_by_id(&mut store, 1)
        .expect("query")
        .expect("item");
    let flag_names: Vec<String> = item
        .flags(&mut store)
        .expect("flags")
        .into_iter()
        .map(|flag| flag.name)
        .collect();
    assert!(flag_names.contains(&"\\SEEN".to_string()));
    assert!(flag_names.contains(&"$CUSTOM".to_string()));
    let tags = item.tags(&mut store).expect("tags");
    assert_eq!(tags.len(), 1);
    assert_eq!(tags[0].gid, "TAG-1");
}
