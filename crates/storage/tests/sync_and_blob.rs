#![forbid(unsafe_code)]

use lix_core::{EntityKey, JsonType, SchemaDefinition};
use lix_storage::{
    CommitRequest, SqliteStore, StateFilter, StateStatement, StateView, SyncRowKind,
};
use serde_json::{Value, json};
use std::path::PathBuf;

fn temp_dir(test_name: &str) -> PathBuf {
    let base = std::env::temp_dir();
    let pid = std::process::id();
    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let dir = base.join(format!("lix_storage_{test_name}_{pid}_{nonce}"));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn open(test_name: &str) -> SqliteStore {
    let mut store = SqliteStore::open(temp_dir(test_name)).expect("open store");
    store
        .register_schema(
            &SchemaDefinition::new("item", "1")
                .property("a", JsonType::Integer)
                .require("a"),
        )
        .expect("register schema");
    store
}

fn upsert(store: &mut SqliteStore, entity_id: &str, snapshot: Value) {
    store
        .execute(StateStatement::Upsert {
            key: EntityKey::new(entity_id, "file-1", "item"),
            schema_version: "1".to_string(),
            plugin_key: "test_plugin".to_string(),
            snapshot,
            version_id: None,
        })
        .expect("upsert");
}

fn live(store: &mut SqliteStore) -> Vec<(String, Value)> {
    store
        .select(StateView::State, StateFilter::schema("item"))
        .expect("select")
        .into_iter()
        .map(|row| (row.entity_id, row.snapshot_content.unwrap_or(Value::Null)))
        .collect()
}

#[test]
fn ingesting_the_same_rows_twice_is_a_no_op() {
    let mut source = open("sync_source");
    let mut replica = open("sync_replica");
    upsert(&mut source, "e1", json!({"a": 1}));
    upsert(&mut source, "e1", json!({"a": 2}));
    source
        .commit(CommitRequest {
            version_id: None,
            author: "tester".to_string(),
            message: "sync me".to_string(),
            labels: vec!["shared".to_string()],
        })
        .expect("commit")
        .expect("commit record");

    let batch = source
        .unsynced_rows(&replica.peer_token(source.store_id()).expect("peer token"), 1_000)
        .expect("unsynced rows");
    assert!(!batch.has_more);
    let kinds = batch.rows.iter().map(|row| row.kind).collect::<Vec<_>>();
    assert!(kinds.contains(&SyncRowKind::Change));
    assert!(kinds.contains(&SyncRowKind::ChangeSet));
    assert!(kinds.contains(&SyncRowKind::ChangeSetLabel));
    assert!(kinds.contains(&SyncRowKind::Commit));

    let before = replica.change_count().expect("count");
    let applied = replica.ingest_rows(&batch.rows).expect("ingest");
    assert!(applied > 0);
    assert_eq!(replica.change_count().expect("count"), before + 2);

    let replayed = replica.ingest_rows(&batch.rows).expect("replay");
    assert_eq!(replayed, 0);
    assert_eq!(replica.change_count().expect("count"), before + 2);

    let token = replica.causality_token().expect("token");
    assert_eq!(
        token.get(source.store_id()),
        batch.causality_token.get(source.store_id())
    );
    let shared = replica.change_sets_with_label("shared").expect("labeled sets");
    assert_eq!(shared.len(), 1);

    let remaining = source.unsynced_rows(&token, 1_000).expect("nothing left");
    assert!(remaining.rows.is_empty());
}

#[test]
fn batches_are_bounded() {
    let mut source = open("batches_are_bounded");
    for index in 0..5 {
        upsert(&mut source, &format!("e{index}"), json!({"a": index}));
    }
    let empty = lix_core::CausalityToken::new();
    let batch = source.unsynced_rows(&empty, 3).expect("first batch");
    assert_eq!(batch.rows.len(), 3);
    assert!(batch.has_more);
}

#[test]
fn tampered_rows_are_rejected_atomically() {
    let mut source = open("tampered_source");
    let mut replica = open("tampered_replica");
    upsert(&mut source, "e1", json!({"a": 1}));

    let mut rows = source
        .unsynced_rows(&lix_core::CausalityToken::new(), 100)
        .expect("rows")
        .rows;
    let snapshot = rows
        .iter_mut()
        .find(|row| row.kind == SyncRowKind::Snapshot)
        .expect("snapshot row");
    snapshot.payload["content"] = json!({"a": 999});

    let before = replica.causality_token().expect("token");
    let err = replica.ingest_rows(&rows).expect_err("mismatched content");
    assert_eq!(err.code(), "GRAPH_INVARIANT");
    assert_eq!(replica.causality_token().expect("token"), before);
}

#[test]
fn export_and_import_round_trip() {
    let mut source = open("export_source");
    upsert(&mut source, "e1", json!({"a": 1}));
    upsert(&mut source, "e2", json!({"a": 2}));
    let image = source.export_blob().expect("export");
    assert!(image.starts_with(b"SQLite format 3"));

    let mut restored = open("export_target");
    upsert(&mut restored, "other", json!({"a": 9}));
    restored.import_blob(&image).expect("import");

    assert_eq!(restored.store_id(), source.store_id());
    assert_eq!(live(&mut restored), live(&mut source));

    let mut fork = open("export_fork");
    fork.fork_from_blob(&image).expect("fork");
    assert_ne!(fork.store_id(), source.store_id());
    assert_eq!(live(&mut fork), live(&mut source));

    upsert(&mut fork, "e3", json!({"a": 3}));
    let rows = fork
        .unsynced_rows(&source.causality_token().expect("token"), 100)
        .expect("fork rows");
    assert!(!rows.rows.is_empty());
    assert!(rows.rows.iter().all(|row| row.origin_store_id == fork.store_id()));
}

#[test]
fn corrupt_images_are_refused() {
    let mut store = open("corrupt_images_are_refused");
    upsert(&mut store, "e1", json!({"a": 1}));
    assert!(store.import_blob(b"definitely not sqlite").is_err());
    assert_eq!(live(&mut store), vec![("e1".to_string(), json!({"a": 1}))]);
}
