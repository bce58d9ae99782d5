#![forbid(unsafe_code)]

use super::sync::{SyncRowKind, log_local_row};
use super::{SqliteStore, StoreError, StoreTx};
use lix_core::{canonical_json, snapshot_id};
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;

impl SqliteStore {
    pub fn put_snapshot(&mut self, value: &Value) -> Result<String, StoreError> {
        self.transact(|tx| tx.put_snapshot(value))
    }

    pub fn snapshot(&self, snapshot_id: &str) -> Result<Option<Value>, StoreError> {
        snapshot_content(self.connection(), snapshot_id)
    }
}

impl StoreTx<'_> {
    /// Stores `value` under its content hash. Storing an equal value again is a no-op.
    pub fn put_snapshot(&mut self, value: &Value) -> Result<String, StoreError> {
        let id = snapshot_id(value);
        self.tx.execute(
            "INSERT OR IGNORE INTO snapshots(id, content) VALUES (?1, ?2)",
            params![id, canonical_json(value)],
        )?;
        log_local_row(self.conn(), self.store_id, SyncRowKind::Snapshot, &id)?;
        Ok(id)
    }

    pub fn snapshot(&self, snapshot_id: &str) -> Result<Option<Value>, StoreError> {
        snapshot_content(self.conn(), snapshot_id)
    }
}

pub(crate) fn snapshot_content(
    conn: &Connection,
    snapshot_id: &str,
) -> Result<Option<Value>, StoreError> {
    let raw = conn
        .query_row(
            "SELECT content FROM snapshots WHERE id=?1",
            params![snapshot_id],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    raw.map(|raw| serde_json::from_str(&raw).map_err(StoreError::from))
        .transpose()
}

pub(crate) fn snapshot_exists(conn: &Connection, snapshot_id: &str) -> Result<bool, StoreError> {
    super::exists(
        conn,
        "SELECT 1 FROM snapshots WHERE id=?1",
        params![snapshot_id],
    )
}
