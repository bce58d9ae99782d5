#![forbid(unsafe_code)]

use super::{StoreError, new_id, now_ms};
use lix_core::{GLOBAL_VERSION_ID, GLOBAL_VERSION_NAME, MAIN_VERSION_NAME};
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::BTreeSet;

pub(crate) const STORE_SCHEMA_VERSION: i64 = 1;
pub(crate) const CACHE_TABLE_PREFIX: &str = "lix_cache_";

const REQUIRED_TABLES: [&str; 20] = [
    "store_state",
    "snapshots",
    "stored_schemas",
    "changes",
    "change_edges",
    "change_sets",
    "change_set_elements",
    "change_set_edges",
    "labels",
    "change_set_labels",
    "commits",
    "versions",
    "cache_tables",
    "cache_state",
    "conflicts",
    "sync_log",
    "sync_clock",
    "sync_peers",
    "files",
    "file_queue",
];

/// Refuses to open databases written by something else or by an incompatible schema.
pub(crate) fn preflight_gate(conn: &Connection) -> Result<(), StoreError> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
    )?;
    let mut rows = stmt.query([])?;
    let mut tables = BTreeSet::new();
    while let Some(row) = rows.next()? {
        tables.insert(row.get::<_, String>(0)?);
    }

    if tables.is_empty() {
        return Ok(());
    }

    let required: BTreeSet<&str> = REQUIRED_TABLES.into_iter().collect();

    if tables
        .iter()
        .any(|table| !required.contains(table.as_str()) && !table.starts_with(CACHE_TABLE_PREFIX))
    {
        return Err(StoreError::ResetRequired("unsupported tables detected"));
    }

    for table in required {
        if !tables.contains(table) {
            return Err(StoreError::ResetRequired("required table is missing"));
        }
    }

    let version = conn
        .query_row(
            "SELECT schema_version FROM store_state WHERE singleton=1",
            [],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;

    match version {
        Some(v) if v == STORE_SCHEMA_VERSION => Ok(()),
        Some(_) => Err(StoreError::ResetRequired("schema version mismatch")),
        None => Err(StoreError::ResetRequired("store state row is missing")),
    }
}

pub(crate) fn install_schema(conn: &Connection) -> Result<(), StoreError> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS store_state (
          singleton INTEGER PRIMARY KEY CHECK(singleton = 1),
          schema_version INTEGER NOT NULL,
          store_id TEXT NOT NULL,
          active_version_id TEXT NOT NULL,
          next_origin_seq INTEGER NOT NULL,
          created_at_ms INTEGER NOT NULL,
          updated_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS snapshots (
          id TEXT PRIMARY KEY,
          content TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS stored_schemas (
          key TEXT NOT NULL,
          version TEXT NOT NULL,
          definition TEXT NOT NULL,
          created_at_ms INTEGER NOT NULL,
          PRIMARY KEY(key, version)
        );

        CREATE TABLE IF NOT EXISTS changes (
          id TEXT PRIMARY KEY,
          entity_id TEXT NOT NULL,
          file_id TEXT NOT NULL,
          schema_key TEXT NOT NULL,
          schema_version TEXT NOT NULL,
          plugin_key TEXT NOT NULL,
          snapshot_id TEXT,
          created_at_ms INTEGER NOT NULL,
          FOREIGN KEY(snapshot_id) REFERENCES snapshots(id) ON DELETE RESTRICT
        );

        CREATE INDEX IF NOT EXISTS idx_changes_entity
          ON changes(schema_key, file_id, entity_id);

        CREATE TABLE IF NOT EXISTS change_edges (
          parent_id TEXT NOT NULL,
          child_id TEXT NOT NULL,
          PRIMARY KEY(parent_id, child_id),
          FOREIGN KEY(parent_id) REFERENCES changes(id) ON DELETE RESTRICT,
          FOREIGN KEY(child_id) REFERENCES changes(id) ON DELETE RESTRICT,
          CHECK(parent_id <> child_id)
        );

        CREATE INDEX IF NOT EXISTS idx_change_edges_child
          ON change_edges(child_id, parent_id);

        CREATE TABLE IF NOT EXISTS change_sets (
          id TEXT PRIMARY KEY,
          sealed INTEGER NOT NULL DEFAULT 0,
          created_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS change_set_elements (
          change_set_id TEXT NOT NULL,
          change_id TEXT NOT NULL,
          entity_id TEXT NOT NULL,
          file_id TEXT NOT NULL,
          schema_key TEXT NOT NULL,
          PRIMARY KEY(change_set_id, schema_key, file_id, entity_id),
          FOREIGN KEY(change_set_id) REFERENCES change_sets(id) ON DELETE CASCADE,
          FOREIGN KEY(change_id) REFERENCES changes(id) ON DELETE RESTRICT
        );

        CREATE TABLE IF NOT EXISTS change_set_edges (
          parent_id TEXT NOT NULL,
          child_id TEXT NOT NULL,
          PRIMARY KEY(parent_id, child_id),
          FOREIGN KEY(parent_id) REFERENCES change_sets(id) ON DELETE RESTRICT,
          FOREIGN KEY(child_id) REFERENCES change_sets(id) ON DELETE RESTRICT,
          CHECK(parent_id <> child_id)
        );

        CREATE INDEX IF NOT EXISTS idx_change_set_edges_child
          ON change_set_edges(child_id, parent_id);

        CREATE TABLE IF NOT EXISTS labels (
          id TEXT PRIMARY KEY,
          name TEXT NOT NULL UNIQUE
        );

        CREATE TABLE IF NOT EXISTS change_set_labels (
          change_set_id TEXT NOT NULL,
          label_id TEXT NOT NULL,
          PRIMARY KEY(change_set_id, label_id),
          FOREIGN KEY(change_set_id) REFERENCES change_sets(id) ON DELETE CASCADE,
          FOREIGN KEY(label_id) REFERENCES labels(id) ON DELETE RESTRICT
        );

        CREATE TABLE IF NOT EXISTS commits (
          id TEXT PRIMARY KEY,
          change_set_id TEXT NOT NULL UNIQUE,
          author TEXT NOT NULL,
          message TEXT NOT NULL,
          created_at_ms INTEGER NOT NULL,
          FOREIGN KEY(change_set_id) REFERENCES change_sets(id) ON DELETE RESTRICT
        );

        CREATE TABLE IF NOT EXISTS versions (
          id TEXT PRIMARY KEY,
          name TEXT NOT NULL UNIQUE,
          change_set_id TEXT,
          working_change_set_id TEXT NOT NULL,
          inherits_from_version_id TEXT,
          created_at_ms INTEGER NOT NULL,
          updated_at_ms INTEGER NOT NULL,
          FOREIGN KEY(change_set_id) REFERENCES change_sets(id) ON DELETE RESTRICT,
          FOREIGN KEY(working_change_set_id) REFERENCES change_sets(id) ON DELETE RESTRICT,
          FOREIGN KEY(inherits_from_version_id) REFERENCES versions(id) ON DELETE RESTRICT,
          CHECK(inherits_from_version_id IS NULL OR inherits_from_version_id <> id)
        );

        CREATE TABLE IF NOT EXISTS cache_tables (
          schema_key TEXT PRIMARY KEY,
          table_name TEXT NOT NULL UNIQUE
        );

        CREATE TABLE IF NOT EXISTS cache_state (
          schema_key TEXT NOT NULL,
          version_id TEXT NOT NULL,
          stale INTEGER NOT NULL,
          updated_at_ms INTEGER NOT NULL,
          PRIMARY KEY(schema_key, version_id)
        );

        CREATE TABLE IF NOT EXISTS conflicts (
          id TEXT NOT NULL,
          version_id TEXT NOT NULL,
          entity_id TEXT NOT NULL,
          file_id TEXT NOT NULL,
          schema_key TEXT NOT NULL,
          change_id TEXT NOT NULL,
          conflicting_change_id TEXT NOT NULL,
          base_change_id TEXT,
          reason TEXT NOT NULL,
          resolved_with_change_id TEXT,
          created_at_ms INTEGER NOT NULL,
          resolved_at_ms INTEGER,
          PRIMARY KEY(id, version_id),
          FOREIGN KEY(version_id) REFERENCES versions(id) ON DELETE CASCADE,
          FOREIGN KEY(change_id) REFERENCES changes(id) ON DELETE RESTRICT,
          FOREIGN KEY(conflicting_change_id) REFERENCES changes(id) ON DELETE RESTRICT
        );

        CREATE TABLE IF NOT EXISTS sync_log (
          seq INTEGER PRIMARY KEY AUTOINCREMENT,
          origin_store_id TEXT NOT NULL,
          origin_seq INTEGER NOT NULL,
          kind TEXT NOT NULL,
          row_id TEXT NOT NULL,
          UNIQUE(kind, row_id),
          UNIQUE(origin_store_id, origin_seq)
        );

        CREATE TABLE IF NOT EXISTS sync_clock (
          origin_store_id TEXT PRIMARY KEY,
          max_seq INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sync_peers (
          peer_id TEXT PRIMARY KEY,
          token TEXT NOT NULL,
          updated_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS files (
          id TEXT PRIMARY KEY,
          path TEXT NOT NULL UNIQUE,
          data BLOB NOT NULL,
          metadata TEXT,
          updated_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS file_queue (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          file_id TEXT NOT NULL,
          path TEXT NOT NULL,
          version_id TEXT NOT NULL,
          before_data BLOB,
          after_data BLOB NOT NULL,
          enqueued_at_ms INTEGER NOT NULL,
          FOREIGN KEY(file_id) REFERENCES files(id) ON DELETE CASCADE,
          FOREIGN KEY(version_id) REFERENCES versions(id) ON DELETE CASCADE
        );
        "#,
    )?;

    let seeded = tx
        .query_row("SELECT 1 FROM store_state WHERE singleton=1", [], |row| {
            row.get::<_, i64>(0)
        })
        .optional()?
        .is_some();
    if !seeded {
        seed_builtin_state(&tx)?;
    }
    tx.commit()?;
    Ok(())
}

/// `global` (no inheritance) plus the initially active `main`.
fn seed_builtin_state(conn: &Connection) -> Result<(), StoreError> {
    let now_ms = now_ms();
    let global_working = new_id();
    let main_working = new_id();
    let main_id = new_id();

    for working in [&global_working, &main_working] {
        conn.execute(
            "INSERT INTO change_sets(id, sealed, created_at_ms) VALUES (?1, 0, ?2)",
            params![working, now_ms],
        )?;
    }
    conn.execute(
        "INSERT INTO versions(id, name, change_set_id, working_change_set_id, inherits_from_version_id, created_at_ms, updated_at_ms) \
         VALUES (?1, ?2, NULL, ?3, NULL, ?4, ?4)",
        params![GLOBAL_VERSION_ID, GLOBAL_VERSION_NAME, global_working, now_ms],
    )?;
    conn.execute(
        "INSERT INTO versions(id, name, change_set_id, working_change_set_id, inherits_from_version_id, created_at_ms, updated_at_ms) \
         VALUES (?1, ?2, NULL, ?3, ?4, ?5, ?5)",
        params![main_id, MAIN_VERSION_NAME, main_working, GLOBAL_VERSION_ID, now_ms],
    )?;
    conn.execute(
        "INSERT INTO store_state(singleton, schema_version, store_id, active_version_id, next_origin_seq, created_at_ms, updated_at_ms) \
         VALUES (1, ?1, ?2, ?3, 1, ?4, ?4)",
        params![STORE_SCHEMA_VERSION, new_id(), main_id, now_ms],
    )?;
    Ok(())
}

pub(crate) fn load_store_id(conn: &Connection) -> Result<String, StoreError> {
    conn.query_row(
        "SELECT store_id FROM store_state WHERE singleton=1",
        [],
        |row| row.get::<_, String>(0),
    )
    .optional()?
    .ok_or(StoreError::ResetRequired("store state row is missing"))
}
