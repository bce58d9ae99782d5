#![forbid(unsafe_code)]

use super::change_sets::attach_label;
use super::materializer::{cache_tables, resolve_live_all};
use super::sync::{SyncRowKind, label_row_id, log_local_row};
use super::{
    Commit, CommitRequest, CreateVersionRequest, SqliteStore, StoreError, StoreTx, Version,
    VersionDiff, is_constraint_violation, new_id, now_ms,
};
use lix_core::{CHECKPOINT_LABEL, GLOBAL_VERSION_ID, VersionName, normalize_labels};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::collections::{BTreeMap, BTreeSet};

const VERSION_COLUMNS: &str = "id, name, change_set_id, working_change_set_id, inherits_from_version_id, created_at_ms, updated_at_ms";

impl SqliteStore {
    pub fn active_version(&self) -> Result<Version, StoreError> {
        active_version(self.connection())
    }

    pub fn version(&self, version_id: &str) -> Result<Option<Version>, StoreError> {
        version_by_id(self.connection(), version_id)
    }

    pub fn version_by_name(&self, name: &str) -> Result<Option<Version>, StoreError> {
        Ok(self
            .connection()
            .query_row(
                &format!("SELECT {VERSION_COLUMNS} FROM versions WHERE name=?1"),
                params![name],
                version_from_row,
            )
            .optional()?)
    }

    pub fn list_versions(&self) -> Result<Vec<Version>, StoreError> {
        let mut stmt = self.connection().prepare(&format!(
            "SELECT {VERSION_COLUMNS} FROM versions ORDER BY created_at_ms ASC, name ASC"
        ))?;
        let rows = stmt.query_map([], version_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// The version followed by every version it inherits from, nearest first.
    pub fn inheritance_chain(&self, version_id: &str) -> Result<Vec<Version>, StoreError> {
        inheritance_chain(
            self.connection(),
            version_id,
            self.config().max_inheritance_depth,
        )
    }

    pub fn create_version(&mut self, request: CreateVersionRequest) -> Result<Version, StoreError> {
        self.transact(|tx| tx.create_version(request))
    }

    pub fn switch_version(&mut self, version_id: &str) -> Result<Version, StoreError> {
        self.transact(|tx| tx.switch_version(version_id))
    }

    pub fn delete_version(&mut self, version_id: &str) -> Result<(), StoreError> {
        self.transact(|tx| tx.delete_version(version_id))
    }

    pub fn commit(&mut self, request: CommitRequest) -> Result<Option<Commit>, StoreError> {
        self.transact(|tx| tx.commit(request))
    }

    pub fn diff_versions(&self, left: &str, right: &str) -> Result<Vec<VersionDiff>, StoreError> {
        let depth = self.config().max_inheritance_depth;
        let left = resolve_live_all(self.connection(), left, depth)?;
        let right = resolve_live_all(self.connection(), right, depth)?;

        let live = |rows: Vec<super::StateRow>| {
            rows.into_iter()
                .filter(|row| !row.is_tombstone())
                .map(|row| (row.key(), row.change_id))
                .collect::<BTreeMap<_, _>>()
        };
        let left = live(left);
        let right = live(right);

        let keys = left.keys().chain(right.keys()).cloned().collect::<BTreeSet<_>>();
        Ok(keys
            .into_iter()
            .filter_map(|key| {
                let left_change_id = left.get(&key).cloned();
                let right_change_id = right.get(&key).cloned();
                (left_change_id != right_change_id).then_some(VersionDiff {
                    key,
                    left_change_id,
                    right_change_id,
                })
            })
            .collect())
    }
}

impl StoreTx<'_> {
    pub fn active_version(&self) -> Result<Version, StoreError> {
        active_version(self.conn())
    }

    pub fn version(&self, version_id: &str) -> Result<Version, StoreError> {
        require_version(self.conn(), version_id)
    }

    /// `None` means the active version.
    pub(crate) fn version_or_active(&self, version_id: Option<&str>) -> Result<Version, StoreError> {
        match version_id {
            Some(id) => require_version(self.conn(), id),
            None => active_version(self.conn()),
        }
    }

    pub fn create_version(&mut self, request: CreateVersionRequest) -> Result<Version, StoreError> {
        let name = VersionName::try_new(request.name.trim())
            .map_err(|err| StoreError::InvalidInput(err.message()))?
            .into_string();
        let from = self.version_or_active(request.from_version_id.as_deref())?;
        let inherits_from = request
            .inherits_from_version_id
            .unwrap_or_else(|| GLOBAL_VERSION_ID.to_string());
        let parent_chain = inheritance_chain(self.conn(), &inherits_from, self.config.max_inheritance_depth)?;
        if parent_chain.len() >= self.config.max_inheritance_depth {
            return Err(StoreError::InheritanceDepthExceeded);
        }

        let now_ms = now_ms();
        let id = new_id();
        let working = new_id();
        self.tx.execute(
            "INSERT INTO change_sets(id, sealed, created_at_ms) VALUES (?1, 0, ?2)",
            params![working, now_ms],
        )?;
        let insert = self.tx.execute(
            &format!("INSERT INTO versions({VERSION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)"),
            params![id, name, from.change_set_id, working, inherits_from, now_ms],
        );
        if let Err(err) = insert {
            if is_constraint_violation(&err) {
                return Err(StoreError::VersionAlreadyExists(name));
            }
            return Err(err.into());
        }

        tracing::info!(version_id = %id, name = %name, from = %from.id, "version created");
        require_version(self.conn(), &id)
    }

    /// Moves the active pointer. Nothing else changes.
    pub fn switch_version(&mut self, version_id: &str) -> Result<Version, StoreError> {
        let version = require_version(self.conn(), version_id)?;
        self.tx.execute(
            "UPDATE store_state SET active_version_id=?1, updated_at_ms=?2 WHERE singleton=1",
            params![version.id, now_ms()],
        )?;
        tracing::info!(version_id = %version.id, name = %version.name, "switched version");
        Ok(version)
    }

    pub fn delete_version(&mut self, version_id: &str) -> Result<(), StoreError> {
        let version = require_version(self.conn(), version_id)?;
        if version.id == GLOBAL_VERSION_ID {
            return Err(StoreError::InvalidInput("the global version cannot be deleted"));
        }
        if active_version(self.conn())?.id == version.id {
            return Err(StoreError::InvalidInput("the active version cannot be deleted"));
        }
        let dependants = self.tx.query_row(
            "SELECT COUNT(1) FROM versions WHERE inherits_from_version_id=?1",
            params![version.id],
            |row| row.get::<_, i64>(0),
        )?;
        if dependants > 0 {
            return Err(StoreError::InvalidInput(
                "version is inherited by other versions and cannot be deleted",
            ));
        }

        self.tx
            .execute("DELETE FROM versions WHERE id=?1", params![version.id])?;
        self.tx.execute(
            "DELETE FROM change_sets WHERE id=?1 AND sealed=0",
            params![version.working_change_set_id],
        )?;
        for (_, table) in cache_tables(self.conn())? {
            self.tx.execute(
                &format!("DELETE FROM \"{table}\" WHERE version_id=?1"),
                params![version.id],
            )?;
        }
        self.tx.execute(
            "DELETE FROM cache_state WHERE version_id=?1",
            params![version.id],
        )?;
        tracing::info!(version_id = %version.id, name = %version.name, "version deleted");
        Ok(())
    }

    /// Seals the working change set of a version into a commit.
    ///
    /// Returns `None` (and changes nothing) when there is nothing to commit.
    pub fn commit(&mut self, request: CommitRequest) -> Result<Option<Commit>, StoreError> {
        let version = self.version_or_active(request.version_id.as_deref())?;
        let mut labels = request.labels.clone();
        labels.push(CHECKPOINT_LABEL.to_string());
        let labels = normalize_labels(&labels).map_err(|err| StoreError::InvalidInput(err.message()))?;

        let pending = self.tx.query_row(
            "SELECT COUNT(1) FROM change_set_elements WHERE change_set_id=?1",
            params![version.working_change_set_id],
            |row| row.get::<_, i64>(0),
        )?;
        if pending == 0 {
            return Ok(None);
        }

        let now_ms = now_ms();
        let sealed = version.working_change_set_id.clone();
        self.tx.execute(
            "UPDATE change_sets SET sealed=1, created_at_ms=?2 WHERE id=?1",
            params![sealed, now_ms],
        )?;
        if let Some(previous) = version.change_set_id.as_deref() {
            self.tx.execute(
                "INSERT INTO change_set_edges(parent_id, child_id) VALUES (?1, ?2)",
                params![previous, sealed],
            )?;
        }
        log_local_row(self.conn(), self.store_id, SyncRowKind::ChangeSet, &sealed)?;
        for label in &labels {
            attach_label(self.conn(), &sealed, label)?;
            log_local_row(
                self.conn(),
                self.store_id,
                SyncRowKind::ChangeSetLabel,
                &label_row_id(&sealed, label),
            )?;
        }

        let commit = Commit {
            id: new_id(),
            change_set_id: sealed.clone(),
            author: request.author,
            message: request.message,
            created_at_ms: now_ms,
        };
        self.tx.execute(
            "INSERT INTO commits(id, change_set_id, author, message, created_at_ms) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![commit.id, commit.change_set_id, commit.author, commit.message, commit.created_at_ms],
        )?;
        log_local_row(self.conn(), self.store_id, SyncRowKind::Commit, &commit.id)?;

        let working = new_id();
        self.tx.execute(
            "INSERT INTO change_sets(id, sealed, created_at_ms) VALUES (?1, 0, ?2)",
            params![working, now_ms],
        )?;
        self.tx.execute(
            "UPDATE versions SET change_set_id=?2, working_change_set_id=?3, updated_at_ms=?4 WHERE id=?1",
            params![version.id, sealed, working, now_ms],
        )?;

        tracing::info!(
            version_id = %version.id,
            commit_id = %commit.id,
            changes = pending,
            "committed working change set"
        );
        Ok(Some(commit))
    }
}

pub(crate) fn version_from_row(row: &Row<'_>) -> rusqlite::Result<Version> {
    Ok(Version {
        id: row.get(0)?,
        name: row.get(1)?,
        change_set_id: row.get(2)?,
        working_change_set_id: row.get(3)?,
        inherits_from_version_id: row.get(4)?,
        created_at_ms: row.get(5)?,
        updated_at_ms: row.get(6)?,
    })
}

pub(crate) fn version_by_id(conn: &Connection, version_id: &str) -> Result<Option<Version>, StoreError> {
    Ok(conn
        .query_row(
            &format!("SELECT {VERSION_COLUMNS} FROM versions WHERE id=?1"),
            params![version_id],
            version_from_row,
        )
        .optional()?)
}

pub(crate) fn require_version(conn: &Connection, version_id: &str) -> Result<Version, StoreError> {
    version_by_id(conn, version_id)?.ok_or_else(|| StoreError::UnknownVersion(version_id.to_string()))
}

pub(crate) fn active_version(conn: &Connection) -> Result<Version, StoreError> {
    let id = conn.query_row(
        "SELECT active_version_id FROM store_state WHERE singleton=1",
        [],
        |row| row.get::<_, String>(0),
    )?;
    require_version(conn, &id)
}

/// Walks `inherits_from_version_id` links starting at `version_id`.
pub(crate) fn inheritance_chain(
    conn: &Connection,
    version_id: &str,
    max_depth: usize,
) -> Result<Vec<Version>, StoreError> {
    let mut out = Vec::new();
    let mut seen = BTreeSet::new();
    let mut current = Some(version_id.to_string());

    while let Some(id) = current {
        if !seen.insert(id.clone()) {
            return Err(StoreError::InheritanceCycle);
        }
        if out.len() >= max_depth {
            return Err(StoreError::InheritanceDepthExceeded);
        }
        let version = require_version(conn, &id)?;
        current = version.inherits_from_version_id.clone();
        out.push(version);
    }
    Ok(out)
}
