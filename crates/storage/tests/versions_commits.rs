#![forbid(unsafe_code)]

use lix_core::{EntityKey, JsonType, SchemaDefinition};
use lix_storage::{
    CommitRequest, CreateVersionRequest, SqliteStore, StateFilter, StateStatement, StateView,
    StoreError,
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

fn upsert(store: &mut SqliteStore, version_id: &str, entity_id: &str, snapshot: Value) {
    store
        .execute(StateStatement::Upsert {
            key: EntityKey::new(entity_id, "file-1", "item"),
            schema_version: "1".to_string(),
            plugin_key: "test_plugin".to_string(),
            snapshot,
            version_id: Some(version_id.to_string()),
        })
        .expect("upsert");
}

fn value_of(store: &mut SqliteStore, version_id: &str, entity_id: &str) -> Option<Value> {
    store
        .select(
            StateView::State,
            StateFilter::schema("item").in_version(version_id).entity(entity_id),
        )
        .expect("select")
        .into_iter()
        .next()
        .and_then(|row| row.snapshot_content)
}

fn commit(store: &mut SqliteStore, version_id: &str, message: &str, labels: &[&str]) -> Option<lix_storage::Commit> {
    store
        .commit(CommitRequest {
            version_id: Some(version_id.to_string()),
            author: "tester".to_string(),
            message: message.to_string(),
            labels: labels.iter().map(|label| label.to_string()).collect(),
        })
        .expect("commit")
}

#[test]
fn commit_seals_working_set_and_records_history() {
    let mut store = open("commit_seals_working_set");
    let main = store.active_version().expect("active");

    assert!(commit(&mut store, &main.id, "empty", &[]).is_none());

    upsert(&mut store, &main.id, "e1", json!({"a": 1}));
    let first = commit(&mut store, &main.id, "first", &["Release"]).expect("first commit");
    let sealed = store
        .change_set(&first.change_set_id)
        .expect("load change set")
        .expect("change set exists");
    assert!(sealed.sealed);
    assert_eq!(sealed.labels, vec!["checkpoint".to_string(), "release".to_string()]);

    let main = store.version(&main.id).expect("load").expect("main exists");
    assert_eq!(main.change_set_id.as_deref(), Some(first.change_set_id.as_str()));
    assert_ne!(main.working_change_set_id, first.change_set_id);
    assert!(store
        .change_set_elements(&main.working_change_set_id)
        .expect("elements")
        .is_empty());

    // Committed state is still visible through the sealed ancestry.
    assert_eq!(value_of(&mut store, &main.id, "e1"), Some(json!({"a": 1})));

    upsert(&mut store, &main.id, "e1", json!({"a": 2}));
    let second = commit(&mut store, &main.id, "second", &[]).expect("second commit");

    let history = store.commits(&main.id).expect("history");
    assert_eq!(
        history.iter().map(|commit| commit.id.clone()).collect::<Vec<_>>(),
        vec![second.id.clone(), first.id.clone()]
    );
    let checkpoints = store.change_sets_with_label("checkpoint").expect("by label");
    assert_eq!(checkpoints.len(), 2);
}

#[test]
fn open_change_sets_cannot_be_labeled() {
    let mut store = open("open_change_sets_cannot_be_labeled");
    let main = store.active_version().expect("active");
    let err = store
        .label_change_set(&main.working_change_set_id, "wip")
        .expect_err("open set");
    assert_eq!(err.code(), "INVALID_INPUT");
}

#[test]
fn versions_branch_from_committed_state() {
    let mut store = open("versions_branch_from_committed_state");
    let main = store.active_version().expect("active");
    upsert(&mut store, &main.id, "e1", json!({"a": 1}));
    commit(&mut store, &main.id, "base", &[]).expect("commit");
    upsert(&mut store, &main.id, "uncommitted", json!({"a": 9}));

    let feature = store
        .create_version(CreateVersionRequest {
            name: "feature/x".to_string(),
            from_version_id: None,
            inherits_from_version_id: None,
        })
        .expect("create version");
    assert_eq!(feature.inherits_from_version_id.as_deref(), Some("global"));
    assert_eq!(feature.change_set_id, store.version(&main.id).expect("load").expect("main").change_set_id);

    assert_eq!(value_of(&mut store, &feature.id, "e1"), Some(json!({"a": 1})));
    assert_eq!(value_of(&mut store, &feature.id, "uncommitted"), None);

    upsert(&mut store, &feature.id, "e1", json!({"a": 5}));
    assert_eq!(value_of(&mut store, &main.id, "e1"), Some(json!({"a": 1})));

    let diff = store.diff_versions(&main.id, &feature.id).expect("diff");
    let keys = diff.iter().map(|entry| entry.key.entity_id.clone()).collect::<Vec<_>>();
    assert_eq!(keys, vec!["e1".to_string(), "uncommitted".to_string()]);
    let uncommitted = diff.iter().find(|entry| entry.key.entity_id == "uncommitted").expect("entry");
    assert!(uncommitted.right_change_id.is_none());

    let err = store
        .create_version(CreateVersionRequest {
            name: "feature/x".to_string(),
            from_version_id: None,
            inherits_from_version_id: None,
        })
        .expect_err("duplicate name");
    assert!(matches!(err, StoreError::VersionAlreadyExists(_)));
}

#[test]
fn switch_and_delete_versions() {
    let mut store = open("switch_and_delete_versions");
    let main = store.active_version().expect("active");
    let feature = store
        .create_version(CreateVersionRequest {
            name: "feature".to_string(),
            from_version_id: None,
            inherits_from_version_id: None,
        })
        .expect("create version");

    store.switch_version(&feature.id).expect("switch");
    assert_eq!(store.active_version().expect("active").id, feature.id);

    let err = store.delete_version(&feature.id).expect_err("active version");
    assert_eq!(err.code(), "INVALID_INPUT");
    let err = store.delete_version("global").expect_err("global version");
    assert_eq!(err.code(), "INVALID_INPUT");

    let child = store
        .create_version(CreateVersionRequest {
            name: "child".to_string(),
            from_version_id: Some(main.id.clone()),
            inherits_from_version_id: Some(main.id.clone()),
        })
        .expect("create inheriting version");
    store.switch_version(&child.id).expect("switch to child");
    let err = store.delete_version(&main.id).expect_err("inherited version");
    assert_eq!(err.code(), "INVALID_INPUT");

    store.delete_version(&feature.id).expect("delete feature");
    assert!(store.version(&feature.id).expect("load").is_none());
    assert!(matches!(
        store.switch_version(&feature.id),
        Err(StoreError::UnknownVersion(_))
    ));
}

#[test]
fn child_versions_inherit_through_the_chain() {
    let mut store = open("child_versions_inherit_through_the_chain");
    let main = store.active_version().expect("active");
    upsert(&mut store, &main.id, "from_main", json!({"a": 1}));
    upsert(&mut store, "global", "from_global", json!({"a": 2}));

    let child = store
        .create_version(CreateVersionRequest {
            name: "child".to_string(),
            from_version_id: None,
            inherits_from_version_id: Some(main.id.clone()),
        })
        .expect("create child");
    let chain = store
        .inheritance_chain(&child.id)
        .expect("chain")
        .into_iter()
        .map(|version| version.id)
        .collect::<Vec<_>>();
    assert_eq!(chain, vec![child.id.clone(), main.id.clone(), "global".to_string()]);

    let rows = store
        .select(StateView::State, StateFilter::schema("item").in_version(child.id.clone()))
        .expect("select child");
    let inherited = rows
        .iter()
        .map(|row| (row.entity_id.as_str(), row.inherited_from_version_id.as_deref()))
        .collect::<Vec<_>>();
    assert_eq!(
        inherited,
        vec![("from_global", Some("global")), ("from_main", Some(main.id.as_str()))]
    );
}
