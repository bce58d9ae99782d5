#![forbid(unsafe_code)]

//! Version-local state resolution and the per-schema cache.
//!
//! A version's own state comes from its working change set first, then from the nearest sealed
//! change set in its commit ancestry. Cache tables hold exactly that version-local state, one
//! table per schema. Inherited rows are never copied into a cache table: shadowing across the
//! inheritance chain is applied when a read happens.

use super::change_sets::change_set_ancestry;
use super::changes::CHANGE_COLUMNS;
use super::install::CACHE_TABLE_PREFIX;
use super::versions::{inheritance_chain, require_version};
use super::{SqliteStore, StateRow, StoreError, StoreTx, Version, now_ms};
use lix_core::{Change, EntityKey, sha256_hex};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Version-local current change for one entity.
#[derive(Clone, Debug)]
pub(crate) struct LocalRow {
    pub change: Change,
    pub content: Option<String>,
}

impl SqliteStore {
    /// Current live value of one entity in a version (inherited values included).
    pub fn resolve_entity(
        &mut self,
        version_id: &str,
        key: &EntityKey,
    ) -> Result<Option<StateRow>, StoreError> {
        let rows = self.select(super::StateView::State, entity_filter(version_id, key)?)?;
        Ok(rows.into_iter().next())
    }

    /// Graph resolution without the cache, tombstones included.
    pub fn resolve_live(
        &self,
        version_id: &str,
        schema_key: Option<&str>,
    ) -> Result<Vec<StateRow>, StoreError> {
        resolve_live(
            self.connection(),
            version_id,
            schema_key,
            None,
            self.config().max_inheritance_depth,
        )
    }

    pub fn rebuild_cache(&mut self, schema_key: &str, version_id: &str) -> Result<usize, StoreError> {
        self.transact(|tx| tx.rebuild_cache(schema_key, version_id))
    }

    pub fn mark_stale(
        &mut self,
        schema_key: Option<&str>,
        version_id: Option<&str>,
    ) -> Result<usize, StoreError> {
        self.transact(|tx| tx.mark_stale(schema_key, version_id))
    }

    pub fn cache_is_fresh(&self, schema_key: &str, version_id: &str) -> Result<bool, StoreError> {
        is_fresh(self.connection(), schema_key, version_id)
    }
}

impl StoreTx<'_> {
    pub fn resolve_entity(
        &mut self,
        version_id: &str,
        key: &EntityKey,
    ) -> Result<Option<StateRow>, StoreError> {
        let rows = self.select(super::StateView::State, &entity_filter(version_id, key)?)?;
        Ok(rows.into_iter().next())
    }

    pub fn resolve_live(
        &self,
        version_id: &str,
        schema_key: Option<&str>,
        key: Option<&EntityKey>,
    ) -> Result<Vec<StateRow>, StoreError> {
        resolve_live(
            self.conn(),
            version_id,
            schema_key,
            key,
            self.config.max_inheritance_depth,
        )
    }

    /// Replaces every cached row of `(schema_key, version_id)` and clears its stale flag.
    pub fn rebuild_cache(&mut self, schema_key: &str, version_id: &str) -> Result<usize, StoreError> {
        let version = require_version(self.conn(), version_id)?;
        rebuild_cache(self.conn(), schema_key, &version)
    }

    pub fn mark_stale(
        &mut self,
        schema_key: Option<&str>,
        version_id: Option<&str>,
    ) -> Result<usize, StoreError> {
        let marked = self.tx.execute(
            "UPDATE cache_state SET stale=1, updated_at_ms=?3 \
             WHERE (?1 IS NULL OR schema_key=?1) AND (?2 IS NULL OR version_id=?2)",
            params![schema_key, version_id, now_ms()],
        )?;
        Ok(marked)
    }

    /// Rebuilds the caches a read of `schema_key` through `chain` depends on.
    pub(crate) fn ensure_fresh(&mut self, schema_key: &str, chain: &[Version]) -> Result<(), StoreError> {
        for version in chain {
            if !is_fresh(self.conn(), schema_key, &version.id)? {
                rebuild_cache(self.conn(), schema_key, version)?;
            }
        }
        Ok(())
    }

    /// Mirrors a pointer move into the cache when that cache is already fresh.
    ///
    /// With the cache disabled the cache is marked stale instead, so a later session that
    /// enables it rebuilds rather than serving rows this write made obsolete.
    pub(crate) fn patch_cache(&mut self, version_id: &str, change: &Change) -> Result<(), StoreError> {
        if !self.config.cache_enabled {
            self.mark_stale(Some(&change.schema_key), Some(version_id))?;
            return Ok(());
        }
        if !is_fresh(self.conn(), &change.schema_key, version_id)? {
            return Ok(());
        }
        let Some(table) = cache_table_for(self.conn(), &change.schema_key)? else {
            return Ok(());
        };
        let content = match change.snapshot_id.as_deref() {
            Some(snapshot_id) => Some(self.tx.query_row(
                "SELECT content FROM snapshots WHERE id=?1",
                params![snapshot_id],
                |row| row.get::<_, String>(0),
            )?),
            None => None,
        };
        insert_cache_row(
            self.conn(),
            &table,
            version_id,
            &LocalRow {
                change: change.clone(),
                content,
            },
        )
    }
}

fn entity_filter(version_id: &str, key: &EntityKey) -> Result<super::StateFilter, StoreError> {
    let key = super::canonicalize_key(key)?;
    Ok(super::StateFilter::schema(key.schema_key)
        .in_version(version_id)
        .entity(key.entity_id)
        .file(key.file_id))
}

pub(crate) fn cache_table_name(schema_key: &str) -> String {
    let sanitized = schema_key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .take(40)
        .collect::<String>();
    let digest = sha256_hex(schema_key.as_bytes());
    format!("{CACHE_TABLE_PREFIX}{sanitized}_{}", &digest[..8])
}

pub(crate) fn cache_tables(conn: &Connection) -> Result<Vec<(String, String)>, StoreError> {
    let mut stmt = conn.prepare("SELECT schema_key, table_name FROM cache_tables ORDER BY schema_key")?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub(crate) fn cache_table_for(conn: &Connection, schema_key: &str) -> Result<Option<String>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT table_name FROM cache_tables WHERE schema_key=?1",
            params![schema_key],
            |row| row.get::<_, String>(0),
        )
        .optional()?)
}

pub(crate) fn ensure_cache_table(conn: &Connection, schema_key: &str) -> Result<String, StoreError> {
    let table = match cache_table_for(conn, schema_key)? {
        Some(table) => table,
        None => {
            let table = cache_table_name(schema_key);
            conn.execute(
                "INSERT INTO cache_tables(schema_key, table_name) VALUES (?1, ?2)",
                params![schema_key, table],
            )?;
            table
        }
    };
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS \"{table}\" (\n\
           entity_id TEXT NOT NULL,\n\
           file_id TEXT NOT NULL,\n\
           version_id TEXT NOT NULL,\n\
           change_id TEXT NOT NULL,\n\
           schema_version TEXT NOT NULL,\n\
           plugin_key TEXT NOT NULL,\n\
           snapshot_content TEXT,\n\
           created_at_ms INTEGER NOT NULL,\n\
           PRIMARY KEY(entity_id, file_id, version_id)\n\
         );\n\
         CREATE INDEX IF NOT EXISTS \"{table}_version\" ON \"{table}\"(version_id);"
    ))?;
    Ok(table)
}

/// A missing `cache_state` row counts as stale.
pub(crate) fn is_fresh(conn: &Connection, schema_key: &str, version_id: &str) -> Result<bool, StoreError> {
    let stale = conn
        .query_row(
            "SELECT stale FROM cache_state WHERE schema_key=?1 AND version_id=?2",
            params![schema_key, version_id],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;
    Ok(matches!(stale, Some(0)))
}

fn rebuild_cache(conn: &Connection, schema_key: &str, version: &Version) -> Result<usize, StoreError> {
    let table = ensure_cache_table(conn, schema_key)?;
    conn.execute(
        &format!("DELETE FROM \"{table}\" WHERE version_id=?1"),
        params![version.id],
    )?;
    let rows = local_rows(conn, version, Some(schema_key), None)?;
    for row in &rows {
        insert_cache_row(conn, &table, &version.id, row)?;
    }
    conn.execute(
        "INSERT INTO cache_state(schema_key, version_id, stale, updated_at_ms) VALUES (?1, ?2, 0, ?3) \
         ON CONFLICT(schema_key, version_id) DO UPDATE SET stale=0, updated_at_ms=excluded.updated_at_ms",
        params![schema_key, version.id, now_ms()],
    )?;
    tracing::debug!(schema_key, version_id = %version.id, rows = rows.len(), "rebuilt state cache");
    Ok(rows.len())
}

fn insert_cache_row(conn: &Connection, table: &str, version_id: &str, row: &LocalRow) -> Result<(), StoreError> {
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO \"{table}\"(entity_id, file_id, version_id, change_id, schema_version, plugin_key, snapshot_content, created_at_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
        ),
        params![
            row.change.entity_id,
            row.change.file_id,
            version_id,
            row.change.id,
            row.change.schema_version,
            row.change.plugin_key,
            row.content,
            row.change.created_at_ms,
        ],
    )?;
    Ok(())
}

/// Version-local pointers: working set first, then the nearest sealed ancestor set per key.
pub(crate) fn local_pointers(
    conn: &Connection,
    version: &Version,
    schema_key: Option<&str>,
    key: Option<&EntityKey>,
) -> Result<BTreeMap<EntityKey, String>, StoreError> {
    let mut sets = vec![version.working_change_set_id.clone()];
    if let Some(head) = version.change_set_id.as_deref() {
        sets.extend(change_set_ancestry(conn, head)?);
    }

    let mut sql = String::from(
        "SELECT change_id, entity_id, file_id, schema_key FROM change_set_elements WHERE change_set_id=?",
    );
    let mut filters: Vec<SqlValue> = Vec::new();
    if let Some(key) = key {
        sql.push_str(" AND schema_key=? AND file_id=? AND entity_id=?");
        filters.push(SqlValue::Text(key.schema_key.clone()));
        filters.push(SqlValue::Text(key.file_id.clone()));
        filters.push(SqlValue::Text(key.entity_id.clone()));
    } else if let Some(schema_key) = schema_key {
        sql.push_str(" AND schema_key=?");
        filters.push(SqlValue::Text(schema_key.to_string()));
    }

    let mut stmt = conn.prepare(&sql)?;
    let mut out = BTreeMap::new();
    for set in sets {
        let mut values = vec![SqlValue::Text(set)];
        values.extend(filters.iter().cloned());
        let rows = stmt.query_map(params_from_iter(values), |row| {
            Ok((
                row.get::<_, String>(0)?,
                EntityKey::new(
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ),
            ))
        })?;
        for row in rows {
            let (change_id, key) = row?;
            out.entry(key).or_insert(change_id);
        }
        if key.is_some() && !out.is_empty() {
            break;
        }
    }
    Ok(out)
}

pub(crate) fn local_rows(
    conn: &Connection,
    version: &Version,
    schema_key: Option<&str>,
    key: Option<&EntityKey>,
) -> Result<Vec<LocalRow>, StoreError> {
    let pointers = local_pointers(conn, version, schema_key, key)?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {}, s.content FROM changes c LEFT JOIN snapshots s ON s.id = c.snapshot_id WHERE c.id=?1",
        CHANGE_COLUMNS
            .split(", ")
            .map(|column| format!("c.{column}"))
            .collect::<Vec<_>>()
            .join(", ")
    ))?;
    let mut out = Vec::with_capacity(pointers.len());
    for change_id in pointers.values() {
        let row = stmt.query_row(params![change_id], |row| {
            Ok(LocalRow {
                change: super::changes::change_from_row(row)?,
                content: row.get(8)?,
            })
        })?;
        out.push(row);
    }
    Ok(out)
}

/// Live resolution through the inheritance chain. A version-local row, tombstones included,
/// shadows every row further up the chain.
pub(crate) fn resolve_live(
    conn: &Connection,
    version_id: &str,
    schema_key: Option<&str>,
    key: Option<&EntityKey>,
    max_depth: usize,
) -> Result<Vec<StateRow>, StoreError> {
    let chain = inheritance_chain(conn, version_id, max_depth)?;
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for (depth, level) in chain.iter().enumerate() {
        for row in local_rows(conn, level, schema_key, key)? {
            let row_key = row.change.key();
            if !seen.insert(row_key) {
                continue;
            }
            out.push(state_row(
                version_id,
                (depth > 0).then(|| level.id.clone()),
                row.change,
                row.content.as_deref(),
            )?);
        }
    }
    out.sort_by(|a, b| a.key().cmp(&b.key()));
    Ok(out)
}

pub(crate) fn resolve_live_all(
    conn: &Connection,
    version_id: &str,
    max_depth: usize,
) -> Result<Vec<StateRow>, StoreError> {
    resolve_live(conn, version_id, None, None, max_depth)
}

pub(crate) fn state_row(
    version_id: &str,
    inherited_from_version_id: Option<String>,
    change: Change,
    content: Option<&str>,
) -> Result<StateRow, StoreError> {
    let snapshot_content = content
        .map(serde_json::from_str::<Value>)
        .transpose()?;
    Ok(StateRow {
        entity_id: change.entity_id,
        file_id: change.file_id,
        schema_key: change.schema_key,
        schema_version: change.schema_version,
        plugin_key: change.plugin_key,
        version_id: version_id.to_string(),
        change_id: change.id,
        snapshot_content,
        inherited_from_version_id,
    })
}
