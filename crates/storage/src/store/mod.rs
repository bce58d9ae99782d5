#![forbid(unsafe_code)]

mod blob;
mod change_sets;
mod changes;
mod config;
mod conflicts;
mod error;
mod files;
mod install;
mod materializer;
mod merge;
mod requests;
mod schemas;
mod snapshots;
mod state;
mod sync;
mod versions;

pub use config::{DEFAULT_DB_FILE_NAME, DEFAULT_MAX_INHERITANCE_DEPTH, StoreConfig};
pub use error::StoreError;
pub use requests::*;
pub use state::{CacheRead, QueryPlan, StateFilter, StateStatement, StateView, StatementOutput, WriteKind, WritePlan};
pub use sync::{SyncRow, SyncRowKind, SyncBatch};

use lix_core::{EntityKey, Plugin, PluginRegistry};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Embedded change-control store on a single SQLite connection.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
    config: StoreConfig,
    store_id: String,
    plugins: PluginRegistry,
}

/// An open write transaction plus the store context operations need.
///
/// Every operation is available here so callers can compose several of them atomically through
/// [`SqliteStore::transact`]. Dropping the value without committing rolls everything back.
pub struct StoreTx<'a> {
    tx: Transaction<'a>,
    config: &'a StoreConfig,
    store_id: &'a str,
    plugins: &'a PluginRegistry,
}

impl SqliteStore {
    pub fn open(storage_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with(StoreConfig::new(storage_dir))
    }

    pub fn open_with(config: StoreConfig) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&config.storage_dir)?;
        let conn = Connection::open(config.db_path())?;
        conn.busy_timeout(config.busy_timeout)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        Self::from_connection(conn, config)
    }

    /// Private in-memory store, mostly for tests and scratch work.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let config = StoreConfig::new(std::env::temp_dir());
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, config)
    }

    fn from_connection(conn: Connection, config: StoreConfig) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        install::preflight_gate(&conn)?;
        install::install_schema(&conn)?;
        let store_id = install::load_store_id(&conn)?;
        tracing::debug!(store_id = %store_id, dir = %config.storage_dir.display(), "store opened");
        Ok(Self {
            conn,
            config,
            store_id,
            plugins: PluginRegistry::new(),
        })
    }

    pub fn storage_dir(&self) -> &Path {
        &self.config.storage_dir
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Origin id stamped on every row this store authors.
    pub fn store_id(&self) -> &str {
        &self.store_id
    }

    pub fn plugins(&self) -> &PluginRegistry {
        &self.plugins
    }

    /// Registers a file-format plugin together with the schemas it emits.
    pub fn register_plugin(&mut self, plugin: Arc<dyn Plugin>) -> Result<(), StoreError> {
        let schemas = plugin.schemas();
        self.transact(|tx| {
            for schema in &schemas {
                tx.register_schema(schema)?;
            }
            Ok(())
        })?;
        let plugin_key = plugin.key().to_string();
        self.plugins
            .register(plugin)
            .map_err(|err| StoreError::Plugin {
                plugin_key,
                message: err.message,
            })
    }

    /// Runs `f` inside one `IMMEDIATE` transaction; commits on `Ok`, rolls back on `Err`.
    pub fn transact<T, F>(&mut self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut StoreTx<'_>) -> Result<T, StoreError>,
    {
        self.run_in(TransactionBehavior::Immediate, f)
    }

    /// Like [`SqliteStore::transact`] but `DEFERRED`: only a shared lock is taken until `f`
    /// writes, so concurrent readers do not queue behind each other.
    pub(crate) fn read<T, F>(&mut self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut StoreTx<'_>) -> Result<T, StoreError>,
    {
        self.run_in(TransactionBehavior::Deferred, f)
    }

    fn run_in<T, F>(&mut self, behavior: TransactionBehavior, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut StoreTx<'_>) -> Result<T, StoreError>,
    {
        let tx = self.conn.transaction_with_behavior(behavior)?;
        let mut store_tx = StoreTx {
            tx,
            config: &self.config,
            store_id: &self.store_id,
            plugins: &self.plugins,
        };
        let out = f(&mut store_tx)?;
        store_tx.tx.commit()?;
        Ok(out)
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl StoreTx<'_> {
    pub fn store_id(&self) -> &str {
        self.store_id
    }

    pub fn config(&self) -> &StoreConfig {
        self.config
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.tx
    }
}

pub(crate) fn canonicalize_key(key: &EntityKey) -> Result<EntityKey, StoreError> {
    key.canonicalize().map_err(|err| match err.field() {
        "entity_id" => StoreError::InvalidInput("invalid entity_id"),
        "file_id" => StoreError::InvalidInput("invalid file_id"),
        _ => StoreError::InvalidInput("invalid schema_key"),
    })
}

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub(crate) fn exists(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<bool, StoreError> {
    Ok(conn
        .query_row(sql, params, |row| row.get::<_, i64>(0))
        .optional()?
        .is_some())
}

pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(code, message) => {
            code.code == ErrorCode::ConstraintViolation
                || message.as_deref().is_some_and(|value| {
                    value.contains("UNIQUE constraint failed")
                        || value.contains("PRIMARY KEY constraint failed")
                })
        }
        _ => false,
    }
}

pub(crate) fn to_sqlite_i64(value: usize) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::InvalidInput("numeric overflow"))
}

pub(crate) fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    let now = match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration,
        Err(_) => return 0,
    };

    i64::try_from(now.as_millis()).unwrap_or(i64::MAX)
}

pub(crate) fn scratch_path(dir: &Path, label: &str) -> PathBuf {
    dir.join(format!("lix-{label}-{}.db", new_id()))
}
