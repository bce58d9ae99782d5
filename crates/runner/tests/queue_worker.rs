#![forbid(unsafe_code)]

use lix_core::{DetectedChange, FileDescriptor, JsonType, Plugin, PluginError, SchemaDefinition};
use lix_runner::{QueueWorker, QueueWorkerConfig, SharedStore, shared};
use lix_storage::{SqliteStore, StateFilter, StateView};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn temp_dir(test_name: &str) -> PathBuf {
    let base = std::env::temp_dir();
    let pid = std::process::id();
    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let dir = base.join(format!("lix_runner_{test_name}_{pid}_{nonce}"));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

/// One `item` entity per top-level key of a JSON object.
struct JsonObjectPlugin;

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
        _before: Option<&[u8]>,
        after: &[u8],
    ) -> Result<Vec<DetectedChange>, PluginError> {
        let map: Map<String, Value> =
            serde_json::from_slice(after).map_err(|err| PluginError::new(err.to_string()))?;
        Ok(map
            .into_iter()
            .map(|(entity_id, value)| DetectedChange {
                entity_id,
                schema_key: "item".to_string(),
                schema_version: "1".to_string(),
                snapshot: Some(value),
            })
            .collect())
    }

    fn apply_changes(
        &self,
        _file: &FileDescriptor,
        _changes: &[DetectedChange],
    ) -> Result<Vec<u8>, PluginError> {
        Ok(Vec::new())
    }
}

/// Rejects every file and counts how often it was asked.
struct RejectingPlugin {
    calls: Arc<AtomicUsize>,
}

impl Plugin for RejectingPlugin {
    fn key(&self) -> &str {
        "rejecting"
    }

    fn glob(&self) -> &str {
        "**/*.bad"
    }

    fn schemas(&self) -> Vec<SchemaDefinition> {
        vec![SchemaDefinition::new("record", "1").property("a", JsonType::Integer)]
    }

    fn detect_changes(
        &self,
        _before: Option<&[u8]>,
        _after: &[u8],
    ) -> Result<Vec<DetectedChange>, PluginError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(PluginError::new("rejected"))
    }

    fn apply_changes(
        &self,
        _file: &FileDescriptor,
        _changes: &[DetectedChange],
    ) -> Result<Vec<u8>, PluginError> {
        Ok(Vec::new())
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn open(test_name: &str) -> SharedStore {
    init_tracing();
    let mut store = SqliteStore::open(temp_dir(test_name)).expect("open store");
    store
        .register_plugin(Arc::new(JsonObjectPlugin))
        .expect("register plugin");
    shared(store)
}

fn fast() -> QueueWorkerConfig {
    QueueWorkerConfig::default()
        .with_poll_interval(Duration::from_millis(10))
        .with_retry_backoff(Duration::from_millis(20))
}

async fn entity_ids(store: &SharedStore) -> Vec<String> {
    store
        .lock()
        .await
        .select(StateView::State, StateFilter::schema("item"))
        .expect("select")
        .into_iter()
        .map(|row| row.entity_id)
        .collect()
}

#[tokio::test]
async fn worker_settles_written_files() {
    let store = open("worker_settles_written_files");
    let worker = QueueWorker::spawn(store.clone(), fast()).await.expect("spawn");

    worker
        .write_file("/a.json", br#"{"x": {"a": 1}}"#, None)
        .await
        .expect("write a")
        .expect("queued");
    worker
        .write_file("/b.json", br#"{"y": {"a": 2}}"#, None)
        .await
        .expect("write b")
        .expect("queued");

    tokio::time::timeout(Duration::from_secs(5), worker.settled())
        .await
        .expect("settled in time")
        .expect("settled");
    assert_eq!(store.lock().await.pending_count().expect("pending"), 0);
    assert_eq!(entity_ids(&store).await, vec!["x".to_string(), "y".to_string()]);

    let mut pending = worker.subscribe();
    tokio::time::timeout(Duration::from_secs(5), pending.wait_for(|count| *count == 0))
        .await
        .expect("published in time")
        .expect("worker alive");

    worker.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn failing_entries_stay_pending_and_settled_can_be_abandoned() {
    let store = open("failing_entries_stay_pending");
    let worker = QueueWorker::spawn(store.clone(), fast()).await.expect("spawn");
    worker
        .write_file("/broken.json", b"not json", None)
        .await
        .expect("write")
        .expect("queued");

    let waited = tokio::time::timeout(Duration::from_millis(150), worker.settled()).await;
    assert!(waited.is_err(), "a failing entry never settles");
    assert_eq!(store.lock().await.pending_count().expect("pending"), 1);
    assert!(entity_ids(&store).await.is_empty());

    // The abandoned wait left the worker running: it keeps retrying and republishing.
    let mut pending = worker.subscribe();
    pending.borrow_and_update();
    tokio::time::timeout(Duration::from_secs(1), pending.changed())
        .await
        .expect("retried in time")
        .expect("worker alive");
    assert_eq!(*pending.borrow(), 1);

    worker.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn restarted_worker_resumes_from_the_oldest_entry() {
    let store = open("restarted_worker_resumes");
    {
        let mut guard = store.lock().await;
        guard
            .write_file("/first.json", br#"{"one": {"a": 1}}"#, None)
            .expect("write")
            .expect("queued");
        guard
            .write_file("/second.json", br#"{"two": {"a": 2}}"#, None)
            .expect("write")
            .expect("queued");
    }

    assert_eq!(store.lock().await.pending_count().expect("pending"), 2);

    let worker = QueueWorker::spawn(store.clone(), fast().with_batch_size(1))
        .await
        .expect("spawn");
    tokio::time::timeout(Duration::from_secs(5), worker.settled())
        .await
        .expect("settled in time")
        .expect("settled");
    assert_eq!(entity_ids(&store).await, vec!["one".to_string(), "two".to_string()]);
    worker.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn settled_wakes_an_idle_worker() {
    let store = open("settled_wakes_an_idle_worker");
    let slow = QueueWorkerConfig::default().with_poll_interval(Duration::from_secs(3600));
    let worker = QueueWorker::spawn(store.clone(), slow).await.expect("spawn");

    store
        .lock()
        .await
        .write_file("/late.json", br#"{"late": {"a": 3}}"#, None)
        .expect("write")
        .expect("queued");

    tokio::time::timeout(Duration::from_secs(5), worker.settled())
        .await
        .expect("settled in time")
        .expect("settled");
    assert_eq!(entity_ids(&store).await, vec!["late".to_string()]);
    worker.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn waiting_on_a_failing_entry_keeps_the_retry_backoff() {
    init_tracing();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut store = SqliteStore::open(temp_dir("waiting_on_a_failing_entry")).expect("open store");
    store
        .register_plugin(Arc::new(RejectingPlugin {
            calls: calls.clone(),
        }))
        .expect("register plugin");
    store
        .write_file("/stuck.bad", b"anything", None)
        .expect("write")
        .expect("queued");
    let store = shared(store);

    let config = QueueWorkerConfig::default()
        .with_poll_interval(Duration::from_secs(3600))
        .with_retry_backoff(Duration::from_secs(2));
    let worker = QueueWorker::spawn(store.clone(), config).await.expect("spawn");

    let waited = tokio::time::timeout(Duration::from_millis(500), worker.settled()).await;
    assert!(waited.is_err(), "a rejected entry never settles");
    let attempts = calls.load(Ordering::SeqCst);
    assert!(attempts >= 1, "the worker tried the entry");
    assert!(attempts <= 3, "settled() drove {attempts} attempts inside one backoff window");
    assert_eq!(store.lock().await.pending_count().expect("pending"), 1);

    worker.shutdown().await.expect("shutdown");
}
