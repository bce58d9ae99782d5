#![forbid(unsafe_code)]

use lix_core::{EntityKey, JsonType, NewChange, SchemaDefinition};
use lix_storage::{
    QueryPlan, SqliteStore, StateFilter, StateStatement, StateView, StoreConfig, StoreError,
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

fn item_schema() -> SchemaDefinition {
    SchemaDefinition::new("item", "1")
        .property("a", JsonType::Integer)
        .property("label", JsonType::String)
        .require("a")
}

fn key(entity_id: &str) -> EntityKey {
    EntityKey::new(entity_id, "file-1", "item")
}

fn open(test_name: &str) -> SqliteStore {
    let mut store = SqliteStore::open(temp_dir(test_name)).expect("open store");
    store.register_schema(&item_schema()).expect("register schema");
    store
}

fn insert(store: &mut SqliteStore, entity_id: &str, snapshot: Value) -> Result<Option<lix_core::Change>, StoreError> {
    Ok(store
        .execute(StateStatement::Insert {
            key: key(entity_id),
            schema_version: "1".to_string(),
            plugin_key: "test_plugin".to_string(),
            snapshot,
            version_id: None,
        })?
        .change())
}

fn update(store: &mut SqliteStore, entity_id: &str, snapshot: Value) -> Result<Option<lix_core::Change>, StoreError> {
    Ok(store
        .execute(StateStatement::Update {
            key: key(entity_id),
            snapshot,
            version_id: None,
        })?
        .change())
}

fn live(store: &mut SqliteStore) -> Vec<(String, Value)> {
    store
        .select(StateView::State, StateFilter::schema("item"))
        .expect("select state")
        .into_iter()
        .map(|row| (row.entity_id, row.snapshot_content.unwrap_or(Value::Null)))
        .collect()
}

#[test]
fn open_seeds_builtin_versions_and_keeps_store_id() {
    let dir = temp_dir("open_seeds_builtin_versions");
    let store_id = {
        let store = SqliteStore::open(&dir).expect("open store");
        let active = store.active_version().expect("active version");
        assert_eq!(active.name, "main");
        assert_eq!(active.inherits_from_version_id.as_deref(), Some("global"));
        let names = store
            .list_versions()
            .expect("list versions")
            .into_iter()
            .map(|version| version.name)
            .collect::<Vec<_>>();
        assert!(names.contains(&"global".to_string()));
        assert!(names.contains(&"main".to_string()));
        store.store_id().to_string()
    };

    let reopened = SqliteStore::open(&dir).expect("reopen store");
    assert_eq!(reopened.store_id(), store_id);
}

#[test]
fn foreign_database_requires_reset() {
    let dir = temp_dir("foreign_database_requires_reset");
    let conn = rusqlite::Connection::open(dir.join("lix.db")).expect("open raw db");
    conn.execute_batch("CREATE TABLE notes (id INTEGER PRIMARY KEY);")
        .expect("create foreign table");
    drop(conn);

    let err = SqliteStore::open(&dir).expect_err("foreign schema must be rejected");
    assert_eq!(err.code(), "RESET_REQUIRED");
}

#[test]
fn snapshots_are_content_addressed() {
    let mut store = open("snapshots_are_content_addressed");
    let first = store.put_snapshot(&json!({"b": 1, "a": [1, 2]})).expect("put snapshot");
    let second = store.put_snapshot(&json!({"a": [1, 2], "b": 1})).expect("put snapshot");
    assert_eq!(first, second);
    assert_eq!(
        store.snapshot(&first).expect("load snapshot"),
        Some(json!({"a": [1, 2], "b": 1}))
    );
}

#[test]
fn insert_update_delete_follow_state_rules() {
    let mut store = open("insert_update_delete_follow_state_rules");

    let created = insert(&mut store, "e1", json!({"a": 1})).expect("insert").expect("change");
    assert!(created.snapshot_id.is_some());

    let err = insert(&mut store, "e1", json!({"a": 2})).expect_err("duplicate insert");
    assert!(matches!(err, StoreError::EntityExists { .. }));

    let err = update(&mut store, "missing", json!({"a": 2})).expect_err("update of absent entity");
    assert!(matches!(err, StoreError::UnknownEntity { .. }));

    let same = update(&mut store, "e1", json!({"a": 1})).expect("identical update");
    assert!(same.is_none(), "identical value must not append a change");

    let updated = update(&mut store, "e1", json!({"a": 2})).expect("update").expect("change");
    assert_eq!(store.change_parents(&updated.id).expect("parents"), vec![created.id.clone()]);
    assert_eq!(live(&mut store), vec![("e1".to_string(), json!({"a": 2}))]);

    let deleted = store
        .execute(StateStatement::Delete {
            key: key("e1"),
            version_id: None,
        })
        .expect("delete")
        .change()
        .expect("tombstone");
    assert!(deleted.is_tombstone());
    assert!(live(&mut store).is_empty());

    let tombstones = store
        .select(StateView::StateWithTombstones, StateFilter::schema("item"))
        .expect("select with tombstones");
    assert_eq!(tombstones.len(), 1);
    assert!(tombstones[0].is_tombstone());

    let again = store
        .execute(StateStatement::Delete {
            key: key("e1"),
            version_id: None,
        })
        .expect("delete absent");
    assert!(again.change().is_none());
}

#[test]
fn schema_violations_roll_back() {
    let mut store = open("schema_violations_roll_back");
    let before = store.change_count().expect("count");

    let err = insert(&mut store, "e1", json!({"a": "not a number"})).expect_err("type mismatch");
    assert_eq!(err.code(), "SCHEMA_VIOLATION");

    let err = store
        .execute(StateStatement::Insert {
            key: EntityKey::new("e1", "file-1", "unknown_schema"),
            schema_version: "1".to_string(),
            plugin_key: "test_plugin".to_string(),
            snapshot: json!({}),
            version_id: None,
        })
        .expect_err("unknown schema");
    assert!(matches!(err, StoreError::UnknownSchema { .. }));
    assert_eq!(store.change_count().expect("count"), before);
}

#[test]
fn failed_transaction_leaves_no_partial_graph_writes() {
    let mut store = open("failed_transaction_leaves_no_partial_graph_writes");
    let before = store.change_count().expect("count");

    let result: Result<(), StoreError> = store.transact(|tx| {
        tx.execute(StateStatement::Insert {
            key: key("e1"),
            schema_version: "1".to_string(),
            plugin_key: "test_plugin".to_string(),
            snapshot: json!({"a": 1}),
            version_id: None,
        })?;
        tx.append_change(NewChange {
            key: key("e2"),
            schema_version: "1".to_string(),
            plugin_key: "test_plugin".to_string(),
            snapshot_id: None,
            parents: vec!["no-such-parent".to_string()],
        })?;
        Ok(())
    });

    let err = result.expect_err("unknown parent must fail");
    assert_eq!(err.code(), "GRAPH_INVARIANT");
    assert_eq!(store.change_count().expect("count"), before);
    assert!(live(&mut store).is_empty());
}

#[test]
fn cached_reads_match_live_resolution() {
    let mut cached = open("cached_reads_match_live_resolution");
    let mut uncached = SqliteStore::open_with(
        StoreConfig::new(temp_dir("cached_reads_match_live_resolution_nocache")).with_cache(false),
    )
    .expect("open uncached store");
    uncached.register_schema(&item_schema()).expect("register schema");

    for store in [&mut cached, &mut uncached] {
        insert(store, "e1", json!({"a": 1})).expect("insert e1");
        // Populate the cache before further writes so they go through the patch path.
        live(store);
        insert(store, "e2", json!({"a": 2, "label": "two"})).expect("insert e2");
        update(store, "e1", json!({"a": 10})).expect("update e1");
        store
            .execute(StateStatement::Delete {
                key: key("e2"),
                version_id: None,
            })
            .expect("delete e2");
        insert(store, "e3", json!({"a": 3})).expect("insert e3");
    }

    let from_cache = live(&mut cached);
    assert_eq!(from_cache, live(&mut uncached));
    assert_eq!(
        from_cache,
        vec![
            ("e1".to_string(), json!({"a": 10})),
            ("e3".to_string(), json!({"a": 3})),
        ]
    );

    let active = cached.active_version().expect("active");
    let graph_rows = cached
        .resolve_live(&active.id, Some("item"))
        .expect("resolve live")
        .into_iter()
        .filter(|row| !row.is_tombstone())
        .map(|row| (row.entity_id, row.snapshot_content.unwrap_or(Value::Null)))
        .collect::<Vec<_>>();
    assert_eq!(graph_rows, from_cache);
}

#[test]
fn stale_cache_is_rebuilt_on_read() {
    let mut store = open("stale_cache_is_rebuilt_on_read");
    insert(&mut store, "e1", json!({"a": 1})).expect("insert");
    let active = store.active_version().expect("active");

    assert_eq!(live(&mut store).len(), 1);
    assert!(store.cache_is_fresh("item", &active.id).expect("freshness"));

    let marked = store.mark_stale(Some("item"), None).expect("mark stale");
    assert!(marked >= 1);
    assert!(!store.cache_is_fresh("item", &active.id).expect("freshness"));

    assert_eq!(live(&mut store), vec![("e1".to_string(), json!({"a": 1}))]);
    assert!(store.cache_is_fresh("item", &active.id).expect("freshness"));
}

#[test]
fn global_rows_are_inherited_and_shadowed() {
    let mut store = open("global_rows_are_inherited_and_shadowed");
    store
        .execute(StateStatement::Insert {
            key: key("shared"),
            schema_version: "1".to_string(),
            plugin_key: "test_plugin".to_string(),
            snapshot: json!({"a": 1}),
            version_id: Some("global".to_string()),
        })
        .expect("insert into global");

    let active = store.active_version().expect("active");
    let rows = store
        .select(StateView::State, StateFilter::schema("item"))
        .expect("select");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].version_id, active.id);
    assert_eq!(rows[0].inherited_from_version_id.as_deref(), Some("global"));

    update(&mut store, "shared", json!({"a": 2})).expect("shadowing update");
    let rows = store
        .select(StateView::State, StateFilter::schema("item"))
        .expect("select");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].snapshot_content, Some(json!({"a": 2})));
    assert_eq!(rows[0].inherited_from_version_id, None);

    let global = store
        .select(StateView::State, StateFilter::schema("item").in_version("global"))
        .expect("select global");
    assert_eq!(global[0].snapshot_content, Some(json!({"a": 1})));

    store
        .execute(StateStatement::Delete {
            key: key("shared"),
            version_id: None,
        })
        .expect("local delete");
    assert!(live(&mut store).is_empty(), "a local tombstone hides the inherited row");
}

#[test]
fn rewrite_exposes_cache_reads_with_shadowing() {
    let mut store = open("rewrite_exposes_cache_reads_with_shadowing");
    let plan = store
        .rewrite(&StateStatement::Select {
            view: StateView::State,
            filter: StateFilter::schema("item").entity("e1"),
        })
        .expect("rewrite select");
    let QueryPlan::CacheRead { chain, reads, .. } = plan else {
        panic!("expected a cache read plan");
    };
    assert_eq!(chain.len(), 2);
    assert_eq!(chain[1], "global");
    assert_eq!(reads.len(), 1);
    assert!(reads[0].table.starts_with("lix_cache_item_"));
    assert!(reads[0].sql.contains("NOT EXISTS"));
    assert!(reads[0].sql.contains("snapshot_content IS NOT NULL"));

    let plan = store
        .rewrite(&StateStatement::Delete {
            key: key(" e1 "),
            version_id: None,
        })
        .expect("rewrite delete");
    let QueryPlan::Write(write) = plan else {
        panic!("expected a write plan");
    };
    assert_eq!(write.key.entity_id, "e1");
    assert!(write.snapshot.is_none());
}

#[test]
fn writes_without_the_cache_leave_it_stale_for_the_next_session() {
    let dir = temp_dir("writes_without_the_cache_leave_it_stale");
    let version_id = {
        let mut store = SqliteStore::open(&dir).expect("open store");
        store.register_schema(&item_schema()).expect("register schema");
        insert(&mut store, "e1", json!({"a": 1})).expect("insert");
        assert_eq!(live(&mut store), vec![("e1".to_string(), json!({"a": 1}))]);
        let active = store.active_version().expect("active");
        assert!(store.cache_is_fresh("item", &active.id).expect("freshness"));
        active.id
    };

    {
        let mut store =
            SqliteStore::open_with(StoreConfig::new(&dir).with_cache(false)).expect("open uncached");
        update(&mut store, "e1", json!({"a": 2})).expect("uncached update");
        assert_eq!(live(&mut store), vec![("e1".to_string(), json!({"a": 2}))]);
        assert!(!store.cache_is_fresh("item", &version_id).expect("freshness"));
    }

    let mut store = SqliteStore::open(&dir).expect("reopen cached");
    assert!(!store.cache_is_fresh("item", &version_id).expect("freshness"));
    assert_eq!(live(&mut store), vec![("e1".to_string(), json!({"a": 2}))]);
    let graph = store
        .resolve_live(&version_id, Some("item"))
        .expect("resolve live")
        .into_iter()
        .map(|row| (row.entity_id, row.snapshot_content.unwrap_or(Value::Null)))
        .collect::<Vec<_>>();
    assert_eq!(graph, vec![("e1".to_string(), json!({"a": 2}))]);
    assert!(store.cache_is_fresh("item", &version_id).expect("freshness"));
}

#[test]
fn fresh_reads_do_not_wait_for_a_concurrent_writer() {
    let dir = temp_dir("fresh_reads_do_not_wait_for_a_concurrent_writer");
    let config = StoreConfig::new(&dir).with_busy_timeout(std::time::Duration::from_millis(50));
    let mut store = SqliteStore::open_with(config.clone()).expect("open store");
    store.register_schema(&item_schema()).expect("register schema");
    insert(&mut store, "e1", json!({"a": 1})).expect("insert");
    assert_eq!(live(&mut store).len(), 1);

    let writer = rusqlite::Connection::open(config.db_path()).expect("open writer");
    writer.execute_batch("BEGIN IMMEDIATE").expect("take the write lock");

    assert_eq!(live(&mut store), vec![("e1".to_string(), json!({"a": 1}))]);
    let active = store.active_version().expect("active");
    let row = store
        .resolve_entity(&active.id, &key("e1"))
        .expect("resolve entity")
        .expect("row");
    assert_eq!(row.snapshot_content, Some(json!({"a": 1})));

    writer.execute_batch("ROLLBACK").expect("release the write lock");
}

#[test]
fn select_filters_are_canonicalized() {
    let mut store = open("select_filters_are_canonicalized");
    insert(&mut store, "e1", json!({"a": 1})).expect("insert");
    insert(&mut store, "e2", json!({"a": 2})).expect("insert");

    let canonical = store
        .select(StateView::State, StateFilter::schema("item").entity("e1").file("file-1"))
        .expect("canonical select");
    let padded = store
        .select(StateView::State, StateFilter::schema(" item ").entity(" e1 ").file(" file-1 "))
        .expect("padded select");
    assert_eq!(canonical.len(), 1);
    assert_eq!(padded, canonical);

    let plan = store
        .rewrite(&StateStatement::Select {
            view: StateView::State,
            filter: StateFilter::schema(" item "),
        })
        .expect("rewrite select");
    let QueryPlan::CacheRead { reads, .. } = plan else {
        panic!("expected a cache read plan");
    };
    assert_eq!(reads.len(), 1);
    assert_eq!(reads[0].schema_key, "item");

    let err = store
        .select(StateView::State, StateFilter::schema("item").entity("   "))
        .expect_err("blank entity id");
    assert!(matches!(err, StoreError::InvalidInput(_)));
}
