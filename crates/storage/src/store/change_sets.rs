#![forbid(unsafe_code)]

use super::sync::{SyncRowKind, label_row_id, log_local_row};
use super::versions::require_version;
use super::{ChangeSet, ChangeSetElement, Commit, SqliteStore, StoreError, StoreTx, new_id};
use lix_core::normalize_label;
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::{BTreeSet, VecDeque};

impl SqliteStore {
    pub fn change_set(&self, change_set_id: &str) -> Result<Option<ChangeSet>, StoreError> {
        change_set_by_id(self.connection(), change_set_id)
    }

    pub fn change_set_elements(
        &self,
        change_set_id: &str,
    ) -> Result<Vec<ChangeSetElement>, StoreError> {
        change_set_elements(self.connection(), change_set_id)
    }

    pub fn label_change_set(&mut self, change_set_id: &str, label: &str) -> Result<(), StoreError> {
        self.transact(|tx| tx.label_change_set(change_set_id, label))
    }

    pub fn change_sets_with_label(&self, label: &str) -> Result<Vec<ChangeSet>, StoreError> {
        let label = normalize_label(label).map_err(|err| StoreError::InvalidInput(err.message()))?;
        let mut stmt = self.connection().prepare(
            "SELECT cs.id FROM change_sets cs \
             JOIN change_set_labels csl ON csl.change_set_id = cs.id \
             JOIN labels l ON l.id = csl.label_id \
             WHERE l.name=?1 \
             ORDER BY cs.created_at_ms ASC, cs.id ASC",
        )?;
        let ids = stmt
            .query_map(params![label], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(set) = change_set_by_id(self.connection(), &id)? {
                out.push(set);
            }
        }
        Ok(out)
    }

    pub fn commit_record(&self, commit_id: &str) -> Result<Option<Commit>, StoreError> {
        commit_by_id(self.connection(), commit_id)
    }

    /// Commit history of a version, newest first.
    pub fn commits(&self, version_id: &str) -> Result<Vec<Commit>, StoreError> {
        let version = require_version(self.connection(), version_id)?;
        let Some(head) = version.change_set_id else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for change_set_id in change_set_ancestry(self.connection(), &head)? {
            let commit = self
                .connection()
                .query_row(
                    "SELECT id FROM commits WHERE change_set_id=?1",
                    params![change_set_id],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            if let Some(commit_id) = commit {
                if let Some(commit) = commit_by_id(self.connection(), &commit_id)? {
                    out.push(commit);
                }
            }
        }
        Ok(out)
    }
}

impl StoreTx<'_> {
    /// Labels a sealed change set. Open working sets cannot be labeled.
    pub fn label_change_set(&mut self, change_set_id: &str, label: &str) -> Result<(), StoreError> {
        let label = normalize_label(label).map_err(|err| StoreError::InvalidInput(err.message()))?;
        let set = change_set_by_id(self.conn(), change_set_id)?
            .ok_or_else(|| StoreError::UnknownChangeSet(change_set_id.to_string()))?;
        if !set.sealed {
            return Err(StoreError::InvalidInput("open change sets cannot be labeled"));
        }
        attach_label(self.conn(), change_set_id, &label)?;
        log_local_row(
            self.conn(),
            self.store_id,
            SyncRowKind::ChangeSetLabel,
            &label_row_id(change_set_id, &label),
        )?;
        Ok(())
    }
}

pub(crate) fn change_set_by_id(
    conn: &Connection,
    change_set_id: &str,
) -> Result<Option<ChangeSet>, StoreError> {
    let row = conn
        .query_row(
            "SELECT id, sealed, created_at_ms FROM change_sets WHERE id=?1",
            params![change_set_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)? != 0,
                    row.get::<_, i64>(2)?,
                ))
            },
        )
        .optional()?;
    let Some((id, sealed, created_at_ms)) = row else {
        return Ok(None);
    };
    let mut stmt = conn.prepare(
        "SELECT l.name FROM change_set_labels csl JOIN labels l ON l.id = csl.label_id \
         WHERE csl.change_set_id=?1 ORDER BY l.name",
    )?;
    let labels = stmt
        .query_map(params![id], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Some(ChangeSet {
        id,
        sealed,
        created_at_ms,
        labels,
    }))
}

pub(crate) fn change_set_elements(
    conn: &Connection,
    change_set_id: &str,
) -> Result<Vec<ChangeSetElement>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT change_set_id, change_id, entity_id, file_id, schema_key FROM change_set_elements \
         WHERE change_set_id=?1 ORDER BY schema_key, file_id, entity_id",
    )?;
    let rows = stmt.query_map(params![change_set_id], |row| {
        Ok(ChangeSetElement {
            change_set_id: row.get(0)?,
            change_id: row.get(1)?,
            entity_id: row.get(2)?,
            file_id: row.get(3)?,
            schema_key: row.get(4)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub(crate) fn change_set_parents(
    conn: &Connection,
    change_set_id: &str,
) -> Result<Vec<String>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT parent_id FROM change_set_edges WHERE child_id=?1 ORDER BY parent_id",
    )?;
    let rows = stmt.query_map(params![change_set_id], |row| row.get::<_, String>(0))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// `head` and its ancestors, breadth first (nearest first).
pub(crate) fn change_set_ancestry(conn: &Connection, head: &str) -> Result<Vec<String>, StoreError> {
    let mut seen = BTreeSet::new();
    let mut queue = VecDeque::from([head.to_string()]);
    let mut out = Vec::new();
    while let Some(current) = queue.pop_front() {
        if !seen.insert(current.clone()) {
            continue;
        }
        queue.extend(change_set_parents(conn, &current)?);
        out.push(current);
    }
    Ok(out)
}

pub(crate) fn commit_by_id(conn: &Connection, commit_id: &str) -> Result<Option<Commit>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT id, change_set_id, author, message, created_at_ms FROM commits WHERE id=?1",
            params![commit_id],
            |row| {
                Ok(Commit {
                    id: row.get(0)?,
                    change_set_id: row.get(1)?,
                    author: row.get(2)?,
                    message: row.get(3)?,
                    created_at_ms: row.get(4)?,
                })
            },
        )
        .optional()?)
}

pub(crate) fn ensure_label(conn: &Connection, name: &str) -> Result<String, StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO labels(id, name) VALUES (?1, ?2)",
        params![new_id(), name],
    )?;
    Ok(conn.query_row(
        "SELECT id FROM labels WHERE name=?1",
        params![name],
        |row| row.get::<_, String>(0),
    )?)
}

pub(crate) fn attach_label(conn: &Connection, change_set_id: &str, name: &str) -> Result<(), StoreError> {
    let label_id = ensure_label(conn, name)?;
    conn.execute(
        "INSERT OR IGNORE INTO change_set_labels(change_set_id, label_id) VALUES (?1, ?2)",
        params![change_set_id, label_id],
    )?;
    Ok(())
}
