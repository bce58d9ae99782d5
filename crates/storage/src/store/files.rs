#![forbid(unsafe_code)]

//! Raw file writes and their settlement into entity changes.
//!
//! A write stores the new bytes on the file record and enqueues the `(before, after)` pair.
//! Settlement takes the oldest entry, asks the matching plugin what changed and writes the
//! result through the state layer, all in one transaction.

use super::{
    FileRecord, QueueEntry, SettleOutcome, SqliteStore, StateFilter, StateStatement, StateView,
    StoreError, StoreTx, new_id, now_ms,
};
use lix_core::{DetectedChange, EntityKey, FileDescriptor, FilePath, Plugin};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::sync::Arc;

const QUEUE_COLUMNS: &str = "id, file_id, path, version_id, before_data, after_data, enqueued_at_ms";

impl SqliteStore {
    /// Stores `data` at `path` and queues it for settlement. `None` when the bytes are unchanged.
    pub fn write_file(
        &mut self,
        path: &str,
        data: &[u8],
        version_id: Option<&str>,
    ) -> Result<Option<QueueEntry>, StoreError> {
        self.transact(|tx| tx.write_file(path, data, version_id))
    }

    pub fn file(&self, path: &str) -> Result<Option<FileRecord>, StoreError> {
        file_by_path(self.connection(), path)
    }

    pub fn list_files(&self) -> Result<Vec<FileRecord>, StoreError> {
        let mut stmt = self
            .connection()
            .prepare("SELECT id, path, data, metadata, updated_at_ms FROM files ORDER BY path")?;
        let rows = stmt.query_map([], file_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Settles the oldest queue entry. `Ok(None)` when the queue is empty.
    pub fn settle_next(&mut self) -> Result<Option<SettleOutcome>, StoreError> {
        self.transact(|tx| tx.settle_next())
    }

    pub fn pending_count(&self) -> Result<usize, StoreError> {
        let count = self
            .connection()
            .query_row("SELECT COUNT(1) FROM file_queue", [], |row| row.get::<_, i64>(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    pub fn queue_entries(&self) -> Result<Vec<QueueEntry>, StoreError> {
        let mut stmt = self
            .connection()
            .prepare(&format!("SELECT {QUEUE_COLUMNS} FROM file_queue ORDER BY id ASC"))?;
        let rows = stmt.query_map([], queue_entry_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Renders a file from the entity state of a version through its plugin.
    pub fn materialize_file(&mut self, path: &str, version_id: Option<&str>) -> Result<Vec<u8>, StoreError> {
        self.transact(|tx| tx.materialize_file(path, version_id))
    }

    /// Removes the file record and deletes every entity it owns in the version.
    pub fn delete_file(&mut self, path: &str, version_id: Option<&str>) -> Result<bool, StoreError> {
        self.transact(|tx| tx.delete_file(path, version_id))
    }
}

impl StoreTx<'_> {
    pub fn write_file(
        &mut self,
        path: &str,
        data: &[u8],
        version_id: Option<&str>,
    ) -> Result<Option<QueueEntry>, StoreError> {
        let path = FilePath::try_new(path)
            .map_err(|err| StoreError::InvalidInput(err.message()))?
            .into_string();
        let version = self.version_or_active(version_id)?;
        let now_ms = now_ms();

        let (file_id, before) = match file_by_path(self.conn(), &path)? {
            Some(existing) if existing.data == data => return Ok(None),
            Some(existing) => {
                self.tx.execute(
                    "UPDATE files SET data=?2, updated_at_ms=?3 WHERE id=?1",
                    params![existing.id, data, now_ms],
                )?;
                (existing.id, Some(existing.data))
            }
            None => {
                let id = new_id();
                self.tx.execute(
                    "INSERT INTO files(id, path, data, metadata, updated_at_ms) VALUES (?1, ?2, ?3, NULL, ?4)",
                    params![id, path, data, now_ms],
                )?;
                (id, None)
            }
        };

        self.tx.execute(
            "INSERT INTO file_queue(file_id, path, version_id, before_data, after_data, enqueued_at_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![file_id, path, version.id, before, data, now_ms],
        )?;
        let id = self.tx.last_insert_rowid();
        tracing::debug!(entry_id = id, path = %path, version_id = %version.id, "file write queued");
        Ok(Some(QueueEntry {
            id,
            file_id,
            path,
            version_id: version.id,
            before_data: before,
            after_data: data.to_vec(),
            enqueued_at_ms: now_ms,
        }))
    }

    /// A plugin failure returns an error and the entry stays queued.
    pub fn settle_next(&mut self) -> Result<Option<SettleOutcome>, StoreError> {
        let entry = self
            .tx
            .query_row(
                &format!("SELECT {QUEUE_COLUMNS} FROM file_queue ORDER BY id ASC LIMIT 1"),
                [],
                queue_entry_from_row,
            )
            .optional()?;
        let Some(entry) = entry else {
            return Ok(None);
        };

        let mut changes_written = 0usize;
        let plugin = self.plugins.resolve(&entry.path);
        if let Some(plugin) = plugin.as_ref() {
            let detected = plugin
                .detect_changes(entry.before_data.as_deref(), &entry.after_data)
                .map_err(|err| {
                    tracing::warn!(
                        entry_id = entry.id,
                        path = %entry.path,
                        plugin_key = plugin.key(),
                        error = %err,
                        "plugin failed to detect changes"
                    );
                    StoreError::Plugin {
                        plugin_key: plugin.key().to_string(),
                        message: err.message,
                    }
                })?;
            for change in detected {
                if self.write_detected(&entry, plugin.key(), change)? {
                    changes_written += 1;
                }
            }
        }

        self.tx
            .execute("DELETE FROM file_queue WHERE id=?1", params![entry.id])?;
        tracing::debug!(
            entry_id = entry.id,
            path = %entry.path,
            changes = changes_written,
            "queue entry settled"
        );
        Ok(Some(SettleOutcome {
            entry_id: entry.id,
            file_id: entry.file_id,
            plugin_key: plugin.map(|plugin| plugin.key().to_string()),
            changes_written,
        }))
    }

    fn write_detected(
        &mut self,
        entry: &QueueEntry,
        plugin_key: &str,
        change: DetectedChange,
    ) -> Result<bool, StoreError> {
        let key = EntityKey::new(change.entity_id, &entry.file_id, change.schema_key);
        let version_id = Some(entry.version_id.clone());
        let statement = match change.snapshot {
            Some(snapshot) => StateStatement::Upsert {
                key,
                schema_version: change.schema_version,
                plugin_key: plugin_key.to_string(),
                snapshot,
                version_id,
            },
            None => StateStatement::Delete { key, version_id },
        };
        Ok(self.execute(statement)?.change().is_some())
    }

    pub fn materialize_file(&mut self, path: &str, version_id: Option<&str>) -> Result<Vec<u8>, StoreError> {
        let file = file_by_path(self.conn(), path)?.ok_or(StoreError::InvalidInput("unknown file path"))?;
        let plugin = self.plugin_for(&file.path)?;
        let version = self.version_or_active(version_id)?;
        let rows = self.select(
            StateView::State,
            &StateFilter::default().in_version(version.id).file(file.id.clone()),
        )?;
        let changes = rows
            .into_iter()
            .filter(|row| row.plugin_key == plugin.key())
            .map(|row| DetectedChange {
                entity_id: row.entity_id,
                schema_key: row.schema_key,
                schema_version: row.schema_version,
                snapshot: row.snapshot_content,
            })
            .collect::<Vec<_>>();
        let descriptor = FileDescriptor {
            id: file.id,
            path: file.path,
            data: file.data,
            metadata: file.metadata,
        };
        plugin
            .apply_changes(&descriptor, &changes)
            .map_err(|err| StoreError::Plugin {
                plugin_key: plugin.key().to_string(),
                message: err.message,
            })
    }

    pub fn delete_file(&mut self, path: &str, version_id: Option<&str>) -> Result<bool, StoreError> {
        let Some(file) = file_by_path(self.conn(), path)? else {
            return Ok(false);
        };
        let version = self.version_or_active(version_id)?;
        let rows = self.select(
            StateView::State,
            &StateFilter::default().in_version(version.id.clone()).file(file.id.clone()),
        )?;
        for row in rows {
            self.execute(StateStatement::Delete {
                key: row.key(),
                version_id: Some(version.id.clone()),
            })?;
        }
        self.tx
            .execute("DELETE FROM files WHERE id=?1", params![file.id])?;
        tracing::debug!(path = %file.path, version_id = %version.id, "file deleted");
        Ok(true)
    }

    fn plugin_for(&self, path: &str) -> Result<Arc<dyn Plugin>, StoreError> {
        self.plugins.resolve(path).ok_or_else(|| StoreError::Plugin {
            plugin_key: String::new(),
            message: format!("no plugin handles {path}"),
        })
    }
}

fn file_by_path(conn: &Connection, path: &str) -> Result<Option<FileRecord>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT id, path, data, metadata, updated_at_ms FROM files WHERE path=?1",
            params![path],
            file_from_row,
        )
        .optional()?)
}

fn file_from_row(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    Ok(FileRecord {
        id: row.get(0)?,
        path: row.get(1)?,
        data: row.get(2)?,
        metadata: row.get(3)?,
        updated_at_ms: row.get(4)?,
    })
}

fn queue_entry_from_row(row: &Row<'_>) -> rusqlite::Result<QueueEntry> {
    Ok(QueueEntry {
        id: row.get(0)?,
        file_id: row.get(1)?,
        path: row.get(2)?,
        version_id: row.get(3)?,
        before_data: row.get(4)?,
        after_data: row.get(5)?,
        enqueued_at_ms: row.get(6)?,
    })
}
