#![forbid(unsafe_code)]

use lix_core::{
    DetectedChange, FileDescriptor, JsonType, Plugin, PluginError, SchemaDefinition,
};
use lix_storage::{SqliteStore, StateFilter, StateView, StoreError};
use serde_json::{Map, Value, json};
use std::path::PathBuf;
use std::sync::Arc;

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

/// Treats a JSON object file as one `item` entity per top-level key.
struct JsonObjectPlugin;

fn parse(bytes: &[u8]) -> Result<Map<String, Value>, PluginError> {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(PluginError::new("expected a JSON object")),
        Err(err) => Err(PluginError::new(err.to_string())),
    }
}

impl Plugin for JsonObjectPlugin {
    fn key(&self) -> &str {
        "json_object"
    }

    fn glob(&self) -> &str {
        "**/*.json"
    }

    fn schemas(&self) -> Vec<SchemaDefinition> {
        vec![
            SchemaDefinition::new("item", "1")
                .property("a", JsonType::Integer)
                .require("a"),
        ]
    }

    fn detect_changes(
        &self,
        before: Option<&[u8]>,
        after: &[u8],
    ) -> Result<Vec<DetectedChange>, PluginError> {
        let before = before.map(parse).transpose()?.unwrap_or_default();
        let after = parse(after)?;
        let mut out = Vec::new();
        for (entity_id, value) in &after {
            if before.get(entity_id) != Some(value) {
                out.push(DetectedChange {
                    entity_id: entity_id.clone(),
                    schema_key: "item".to_string(),
                    schema_version: "1".to_string(),
                    snapshot: Some(value.clone()),
                });
            }
        }
        for entity_id in before.keys().filter(|id| !after.contains_key(*id)) {
            out.push(DetectedChange {
                entity_id: entity_id.clone(),
                schema_key: "item".to_string(),
                schema_version: "1".to_string(),
                snapshot: None,
            });
        }
        Ok(out)
    }

    fn apply_changes(
        &self,
        _file: &FileDescriptor,
        changes: &[DetectedChange],
    ) -> Result<Vec<u8>, PluginError> {
        let mut map = Map::new();
        for change in changes {
            if let Some(snapshot) = change.snapshot.as_ref() {
                map.insert(change.entity_id.clone(), snapshot.clone());
            }
        }
        serde_json::to_vec(&Value::Object(map)).map_err(|err| PluginError::new(err.to_string()))
    }
}

fn open(test_name: &str) -> SqliteStore {
    let mut store = SqliteStore::open(temp_dir(test_name)).expect("open store");
    store
        .register_plugin(Arc::new(JsonObjectPlugin))
        .expect("register plugin");
    store
}

fn entities(store: &mut SqliteStore) -> Vec<(String, Value)> {
    store
        .select(StateView::State, StateFilter::schema("item"))
        .expect("select")
        .into_iter()
        .map(|row| (row.entity_id, row.snapshot_content.unwrap_or(Value::Null)))
        .collect()
}

#[test]
fn settlement_derives_entities_through_the_plugin() {
    let mut store = open("settlement_derives_entities");
    let entry = store
        .write_file("/data/items.json", br#"{"x": {"a": 1}, "y": {"a": 2}}"#, None)
        .expect("write file")
        .expect("queued");
    assert!(entry.before_data.is_none());
    assert_eq!(store.pending_count().expect("pending"), 1);

    let outcome = store.settle_next().expect("settle").expect("entry settled");
    assert_eq!(outcome.entry_id, entry.id);
    assert_eq!(outcome.plugin_key.as_deref(), Some("json_object"));
    assert_eq!(outcome.changes_written, 2);
    assert_eq!(store.pending_count().expect("pending"), 0);
    assert!(store.settle_next().expect("empty queue").is_none());

    let rows = store
        .select(StateView::State, StateFilter::schema("item"))
        .expect("select");
    assert!(rows.iter().all(|row| row.file_id == entry.file_id));
    assert_eq!(
        entities(&mut store),
        vec![
            ("x".to_string(), json!({"a": 1})),
            ("y".to_string(), json!({"a": 2})),
        ]
    );

    store
        .write_file("/data/items.json", br#"{"x": {"a": 5}}"#, None)
        .expect("rewrite file")
        .expect("queued");
    let outcome = store.settle_next().expect("settle").expect("entry settled");
    assert_eq!(outcome.changes_written, 2);
    assert_eq!(entities(&mut store), vec![("x".to_string(), json!({"a": 5}))]);

    let rendered = store
        .materialize_file("/data/items.json", None)
        .expect("materialize");
    let rendered: Value = serde_json::from_slice(&rendered).expect("json output");
    assert_eq!(rendered, json!({"x": {"a": 5}}));
}

#[test]
fn unchanged_bytes_are_not_queued() {
    let mut store = open("unchanged_bytes_are_not_queued");
    store
        .write_file("/a.json", br#"{"x": {"a": 1}}"#, None)
        .expect("write")
        .expect("queued");
    let again = store
        .write_file("/a.json", br#"{"x": {"a": 1}}"#, None)
        .expect("write again");
    assert!(again.is_none());
    assert_eq!(store.pending_count().expect("pending"), 1);
}

#[test]
fn plugin_failure_leaves_the_entry_pending() {
    let mut store = open("plugin_failure_leaves_the_entry_pending");
    store
        .write_file("/broken.json", b"not json", None)
        .expect("write")
        .expect("queued");

    let err = store.settle_next().expect_err("plugin error");
    assert!(matches!(err, StoreError::Plugin { ref plugin_key, .. } if plugin_key == "json_object"));
    assert_eq!(store.pending_count().expect("pending"), 1);
    assert!(entities(&mut store).is_empty());
}

#[test]
fn files_without_a_plugin_settle_without_changes() {
    let mut store = open("files_without_a_plugin");
    store
        .write_file("/notes/readme.md", b"# hello", None)
        .expect("write")
        .expect("queued");
    let outcome = store.settle_next().expect("settle").expect("entry settled");
    assert_eq!(outcome.plugin_key, None);
    assert_eq!(outcome.changes_written, 0);
    assert_eq!(store.pending_count().expect("pending"), 0);
}

#[test]
fn queue_is_fifo_and_paths_are_validated() {
    let mut store = open("queue_is_fifo");
    let first = store
        .write_file("/a.json", br#"{"x": {"a": 1}}"#, None)
        .expect("write a")
        .expect("queued");
    let second = store
        .write_file("/b.json", br#"{"y": {"a": 2}}"#, None)
        .expect("write b")
        .expect("queued");
    let ids = store
        .queue_entries()
        .expect("entries")
        .into_iter()
        .map(|entry| entry.id)
        .collect::<Vec<_>>();
    assert_eq!(ids, vec![first.id, second.id]);

    let err = store
        .write_file("relative.json", b"{}", None)
        .expect_err("relative path");
    assert_eq!(err.code(), "INVALID_INPUT");
}

#[test]
fn deleting_a_file_tombstones_its_entities() {
    let mut store = open("deleting_a_file");
    store
        .write_file("/a.json", br#"{"x": {"a": 1}}"#, None)
        .expect("write")
        .expect("queued");
    store.settle_next().expect("settle");
    assert_eq!(entities(&mut store).len(), 1);

    assert!(store.delete_file("/a.json", None).expect("delete"));
    assert!(entities(&mut store).is_empty());
    assert!(store.file("/a.json").expect("lookup").is_none());
    assert!(!store.delete_file("/a.json", None).expect("delete again"));
}
