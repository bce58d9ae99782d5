#![forbid(unsafe_code)]

use super::changes::require_change;
use super::state::validate_snapshot;
use super::versions::require_version;
use super::{Conflict, ResolveWith, SqliteStore, StoreError, StoreTx, now_ms};
use lix_core::{ConflictReason, DetectedConflict, NewChange};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde_json::Value;

const CONFLICT_COLUMNS: &str = "id, version_id, entity_id, file_id, schema_key, change_id, conflicting_change_id, \
     base_change_id, reason, resolved_with_change_id, created_at_ms, resolved_at_ms";

impl SqliteStore {
    /// Conflicts recorded against a version, oldest first.
    pub fn conflicts(&self, version_id: &str, include_resolved: bool) -> Result<Vec<Conflict>, StoreError> {
        require_version(self.connection(), version_id)?;
        let mut stmt = self.connection().prepare(&format!(
            "SELECT {CONFLICT_COLUMNS} FROM conflicts \
             WHERE version_id=?1 AND (?2 OR resolved_with_change_id IS NULL) \
             ORDER BY created_at_ms ASC, id ASC"
        ))?;
        let rows = stmt.query_map(params![version_id, include_resolved], conflict_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn conflict(&self, version_id: &str, conflict_id: &str) -> Result<Option<Conflict>, StoreError> {
        conflict_by_id(self.connection(), version_id, conflict_id)
    }

    pub fn resolve_conflict(
        &mut self,
        version_id: &str,
        conflict_id: &str,
        resolution: ResolveWith,
    ) -> Result<Conflict, StoreError> {
        self.transact(|tx| tx.resolve_conflict(version_id, conflict_id, resolution))
    }
}

impl StoreTx<'_> {
    /// Settles a conflict in the version it was recorded against.
    ///
    /// `ResolveWith::Value(Value::Null)` resolves to a deletion.
    pub fn resolve_conflict(
        &mut self,
        version_id: &str,
        conflict_id: &str,
        resolution: ResolveWith,
    ) -> Result<Conflict, StoreError> {
        let version = self.version(version_id)?;
        let conflict = conflict_by_id(self.conn(), &version.id, conflict_id)?
            .ok_or_else(|| StoreError::UnknownConflict(conflict_id.to_string()))?;
        if conflict.is_resolved() {
            return Err(StoreError::ConflictAlreadyResolved);
        }
        let key = conflict.key();

        let change = match resolution {
            ResolveWith::Change(change_id) => {
                let change = require_change(self.conn(), &change_id)?;
                if change.key() != key {
                    return Err(StoreError::InvalidInput(
                        "resolution change belongs to another entity",
                    ));
                }
                change
            }
            ResolveWith::Value(value) => {
                let current = require_change(self.conn(), &conflict.conflicting_change_id)?;
                let snapshot_id = match value {
                    Value::Null => None,
                    value => {
                        validate_snapshot(self.conn(), &key, &current.schema_version, &value)?;
                        Some(self.put_snapshot(&value)?)
                    }
                };
                self.append_change(NewChange {
                    key: key.clone(),
                    schema_version: current.schema_version,
                    plugin_key: current.plugin_key,
                    snapshot_id,
                    parents: vec![
                        conflict.change_id.clone(),
                        conflict.conflicting_change_id.clone(),
                    ],
                })?
            }
        };
        self.set_pointer(&version, &change)?;

        let resolved_at_ms = now_ms();
        self.tx.execute(
            "UPDATE conflicts SET resolved_with_change_id=?3, resolved_at_ms=?4 WHERE id=?1 AND version_id=?2",
            params![conflict.id, version.id, change.id, resolved_at_ms],
        )?;
        tracing::info!(
            version_id = %version.id,
            conflict_id = %conflict.id,
            change_id = %change.id,
            "conflict resolved"
        );
        Ok(Conflict {
            resolved_with_change_id: Some(change.id),
            resolved_at_ms: Some(resolved_at_ms),
            ..conflict
        })
    }
}

/// Records a detected conflict once. A conflict seen again keeps its first record, resolved or not.
pub(crate) fn record_conflict(
    conn: &Connection,
    version_id: &str,
    detected: &DetectedConflict,
) -> Result<Conflict, StoreError> {
    conn.execute(
        &format!(
            "INSERT OR IGNORE INTO conflicts({CONFLICT_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL, ?10, NULL)"
        ),
        params![
            detected.conflict_id.as_str(),
            version_id,
            detected.key.entity_id,
            detected.key.file_id,
            detected.key.schema_key,
            detected.change_id,
            detected.conflicting_change_id,
            detected.base_change_id,
            detected.reason.as_str(),
            now_ms(),
        ],
    )?;
    conflict_by_id(conn, version_id, detected.conflict_id.as_str())?
        .ok_or_else(|| StoreError::UnknownConflict(detected.conflict_id.as_str().to_string()))
}

fn conflict_by_id(conn: &Connection, version_id: &str, conflict_id: &str) -> Result<Option<Conflict>, StoreError> {
    Ok(conn
        .query_row(
            &format!("SELECT {CONFLICT_COLUMNS} FROM conflicts WHERE id=?1 AND version_id=?2"),
            params![conflict_id, version_id],
            conflict_from_row,
        )
        .optional()?)
}

fn conflict_from_row(row: &Row<'_>) -> rusqlite::Result<Conflict> {
    let reason: String = row.get(8)?;
    Ok(Conflict {
        id: row.get(0)?,
        version_id: row.get(1)?,
        entity_id: row.get(2)?,
        file_id: row.get(3)?,
        schema_key: row.get(4)?,
        change_id: row.get(5)?,
        conflicting_change_id: row.get(6)?,
        base_change_id: row.get(7)?,
        reason: ConflictReason::parse(&reason).unwrap_or(ConflictReason::DivergentValues),
        resolved_with_change_id: row.get(9)?,
        created_at_ms: row.get(10)?,
        resolved_at_ms: row.get(11)?,
    })
}
