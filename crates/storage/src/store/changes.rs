#![forbid(unsafe_code)]

use super::snapshots::snapshot_exists;
use super::sync::{SyncRowKind, log_local_row};
use super::{SqliteStore, StoreError, StoreTx, canonicalize_key, now_ms};
use lix_core::{Change, ChangeGraph, EntityKey, GraphChange, NewChange, canonical_identifier};
use rusqlite::{Connection, OptionalExtension, Row, params};

pub(crate) const CHANGE_COLUMNS: &str =
    "id, entity_id, file_id, schema_key, schema_version, plugin_key, snapshot_id, created_at_ms";

impl SqliteStore {
    pub fn append_change(&mut self, change: NewChange) -> Result<Change, StoreError> {
        self.transact(|tx| tx.append_change(change))
    }

    pub fn change(&self, change_id: &str) -> Result<Option<Change>, StoreError> {
        change_by_id(self.connection(), change_id)
    }

    pub fn change_parents(&self, change_id: &str) -> Result<Vec<String>, StoreError> {
        change_parents(self.connection(), change_id)
    }

    pub fn change_children(&self, change_id: &str) -> Result<Vec<String>, StoreError> {
        change_children(self.connection(), change_id)
    }

    pub fn change_count(&self) -> Result<usize, StoreError> {
        let count = self
            .connection()
            .query_row("SELECT COUNT(1) FROM changes", [], |row| row.get::<_, i64>(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

impl StoreTx<'_> {
    /// Appends an immutable change and its parent edges.
    ///
    /// Every parent must already exist and describe the same entity. Appending a change whose
    /// content id is already stored returns the stored change.
    pub fn append_change(&mut self, change: NewChange) -> Result<Change, StoreError> {
        let key = canonicalize_key(&change.key)?;
        let schema_version = canonical_identifier("schema_version", &change.schema_version)
            .map_err(|_| StoreError::InvalidInput("invalid schema_version"))?;
        let plugin_key = canonical_identifier("plugin_key", &change.plugin_key)
            .map_err(|_| StoreError::InvalidInput("invalid plugin_key"))?;
        let change = NewChange {
            key,
            schema_version,
            plugin_key,
            ..change
        };

        if let Some(snapshot_id) = change.snapshot_id.as_deref() {
            if !snapshot_exists(self.conn(), snapshot_id)? {
                return Err(StoreError::graph(
                    "append_change",
                    &change.key.entity_id,
                    format!("unknown snapshot {snapshot_id}"),
                ));
            }
        }

        let parents = change.sorted_parents();
        for parent_id in &parents {
            let Some(parent) = change_by_id(self.conn(), parent_id)? else {
                return Err(StoreError::graph(
                    "append_change",
                    &change.key.entity_id,
                    format!("unknown parent {parent_id}"),
                ));
            };
            if parent.key() != change.key {
                return Err(StoreError::graph(
                    "append_change",
                    &change.key.entity_id,
                    format!("parent {parent_id} belongs to {}", parent.key()),
                ));
            }
        }

        let record = change.into_change(now_ms());
        let inserted = self.tx.execute(
            &format!("INSERT OR IGNORE INTO changes({CHANGE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
            params![
                record.id,
                record.entity_id,
                record.file_id,
                record.schema_key,
                record.schema_version,
                record.plugin_key,
                record.snapshot_id,
                record.created_at_ms,
            ],
        )?;
        if inserted == 0 {
            return change_by_id(self.conn(), &record.id)?
                .ok_or_else(|| StoreError::UnknownChange(record.id.clone()));
        }

        for parent_id in &parents {
            self.tx.execute(
                "INSERT OR IGNORE INTO change_edges(parent_id, child_id) VALUES (?1, ?2)",
                params![parent_id, record.id],
            )?;
        }
        log_local_row(self.conn(), self.store_id, SyncRowKind::Change, &record.id)?;
        Ok(record)
    }

    pub fn change(&self, change_id: &str) -> Result<Option<Change>, StoreError> {
        change_by_id(self.conn(), change_id)
    }
}

pub(crate) fn change_from_row(row: &Row<'_>) -> rusqlite::Result<Change> {
    Ok(Change {
        id: row.get(0)?,
        entity_id: row.get(1)?,
        file_id: row.get(2)?,
        schema_key: row.get(3)?,
        schema_version: row.get(4)?,
        plugin_key: row.get(5)?,
        snapshot_id: row.get(6)?,
        created_at_ms: row.get(7)?,
    })
}

pub(crate) fn change_by_id(conn: &Connection, change_id: &str) -> Result<Option<Change>, StoreError> {
    Ok(conn
        .query_row(
            &format!("SELECT {CHANGE_COLUMNS} FROM changes WHERE id=?1"),
            params![change_id],
            change_from_row,
        )
        .optional()?)
}

pub(crate) fn require_change(conn: &Connection, change_id: &str) -> Result<Change, StoreError> {
    change_by_id(conn, change_id)?.ok_or_else(|| StoreError::UnknownChange(change_id.to_string()))
}

pub(crate) fn change_parents(conn: &Connection, change_id: &str) -> Result<Vec<String>, StoreError> {
    let mut stmt =
        conn.prepare("SELECT parent_id FROM change_edges WHERE child_id=?1 ORDER BY parent_id")?;
    let rows = stmt.query_map(params![change_id], |row| row.get::<_, String>(0))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub(crate) fn change_children(conn: &Connection, change_id: &str) -> Result<Vec<String>, StoreError> {
    let mut stmt =
        conn.prepare("SELECT child_id FROM change_edges WHERE parent_id=?1 ORDER BY child_id")?;
    let rows = stmt.query_map(params![change_id], |row| row.get::<_, String>(0))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Loads the change arena, optionally restricted to one entity's history.
pub(crate) fn load_graph(conn: &Connection, key: Option<&EntityKey>) -> Result<ChangeGraph, StoreError> {
    let mut graph = ChangeGraph::new();
    let (change_sql, edge_sql) = match key {
        Some(_) => (
            "SELECT id, entity_id, file_id, schema_key, snapshot_id FROM changes \
             WHERE entity_id=?1 AND file_id=?2 AND schema_key=?3",
            "SELECT e.parent_id, e.child_id FROM change_edges e \
             JOIN changes c ON c.id = e.child_id \
             WHERE c.entity_id=?1 AND c.file_id=?2 AND c.schema_key=?3",
        ),
        None => (
            "SELECT id, entity_id, file_id, schema_key, snapshot_id FROM changes",
            "SELECT parent_id, child_id FROM change_edges",
        ),
    };

    let map_change = |row: &Row<'_>| -> rusqlite::Result<GraphChange> {
        Ok(GraphChange {
            id: row.get(0)?,
            key: EntityKey::new(
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ),
            snapshot_id: row.get(4)?,
        })
    };
    let map_edge = |row: &Row<'_>| -> rusqlite::Result<(String, String)> { Ok((row.get(0)?, row.get(1)?)) };

    let mut change_stmt = conn.prepare(change_sql)?;
    let mut edge_stmt = conn.prepare(edge_sql)?;
    let (changes, edges) = match key {
        Some(key) => {
            let params = params![key.entity_id, key.file_id, key.schema_key];
            (
                change_stmt.query_map(params, map_change)?.collect::<Result<Vec<_>, _>>()?,
                edge_stmt.query_map(params, map_edge)?.collect::<Result<Vec<_>, _>>()?,
            )
        }
        None => (
            change_stmt.query_map([], map_change)?.collect::<Result<Vec<_>, _>>()?,
            edge_stmt.query_map([], map_edge)?.collect::<Result<Vec<_>, _>>()?,
        ),
    };

    for change in changes {
        graph.insert(change);
    }
    for (parent, child) in edges {
        graph
            .link(&parent, &child)
            .map_err(|err| StoreError::graph("load_graph", &child, err))?;
    }
    Ok(graph)
}
