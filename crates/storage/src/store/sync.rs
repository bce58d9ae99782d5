#![forbid(unsafe_code)]

//! Replication log for immutable rows.
//!
//! Every schema, snapshot, change, sealed change set, label attachment and commit gets one log
//! entry stamped with the store that authored it and that store's sequence number. Peers
//! exchange log entries and track progress with a [`CausalityToken`].

use super::changes::{CHANGE_COLUMNS, change_by_id, change_from_row, change_parents};
use super::{SqliteStore, StoreError, StoreTx, exists, new_id, now_ms};
use lix_core::{CausalityToken, NewChange, canonical_json, normalize_label, snapshot_id};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRowKind {
    Schema,
    Snapshot,
    Change,
    ChangeSet,
    ChangeSetLabel,
    Commit,
}

impl SyncRowKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Schema => "schema",
            Self::Snapshot => "snapshot",
            Self::Change => "change",
            Self::ChangeSet => "change_set",
            Self::ChangeSetLabel => "change_set_label",
            Self::Commit => "commit",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "schema" => Some(Self::Schema),
            "snapshot" => Some(Self::Snapshot),
            "change" => Some(Self::Change),
            "change_set" => Some(Self::ChangeSet),
            "change_set_label" => Some(Self::ChangeSetLabel),
            "commit" => Some(Self::Commit),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncRow {
    pub origin_store_id: String,
    pub origin_seq: u64,
    pub kind: SyncRowKind,
    pub row_id: String,
    pub payload: Value,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncBatch {
    pub rows: Vec<SyncRow>,
    pub has_more: bool,
    /// Clock of the store that produced the batch.
    pub causality_token: CausalityToken,
}

impl SqliteStore {
    /// Highest sequence number known per origin store.
    pub fn causality_token(&self) -> Result<CausalityToken, StoreError> {
        clock(self.connection())
    }

    pub fn unsynced_rows(
        &self,
        acknowledged: &CausalityToken,
        limit: usize,
    ) -> Result<SyncBatch, StoreError> {
        unsynced_rows(self.connection(), acknowledged, limit)
    }

    pub fn ingest_rows(&mut self, rows: &[SyncRow]) -> Result<usize, StoreError> {
        self.transact(|tx| tx.ingest_rows(rows))
    }

    /// Last token `peer_id` acknowledged. Empty when the peer is unknown.
    pub fn peer_token(&self, peer_id: &str) -> Result<CausalityToken, StoreError> {
        peer_token(self.connection(), peer_id)
    }

    pub fn set_peer_token(
        &mut self,
        peer_id: &str,
        token: &CausalityToken,
    ) -> Result<(), StoreError> {
        self.transact(|tx| tx.set_peer_token(peer_id, token))
    }
}

impl StoreTx<'_> {
    pub fn causality_token(&self) -> Result<CausalityToken, StoreError> {
        clock(self.conn())
    }

    /// Applies replicated rows in order. Rows already present are skipped; the whole batch is
    /// rejected when a row would break a graph invariant.
    pub fn ingest_rows(&mut self, rows: &[SyncRow]) -> Result<usize, StoreError> {
        let mut applied = 0usize;
        for row in rows {
            if ingest_row(self.conn(), row)? {
                applied += 1;
            }
            self.tx.execute(
                "INSERT OR IGNORE INTO sync_log(origin_store_id, origin_seq, kind, row_id) VALUES (?1, ?2, ?3, ?4)",
                params![
                    row.origin_store_id,
                    to_seq_i64(row.origin_seq)?,
                    row.kind.as_str(),
                    row.row_id
                ],
            )?;
            observe_clock(self.conn(), &row.origin_store_id, row.origin_seq)?;
        }
        if applied > 0 {
            tracing::debug!(applied, received = rows.len(), "ingested sync rows");
        }
        Ok(applied)
    }

    /// Applies rows taken from another store outside the sync protocol.
    ///
    /// The rows are logged as authored here: the copy is a subset of the other store's log, so
    /// observing its sequence numbers would claim rows this store never received.
    pub(crate) fn copy_rows(&mut self, rows: &[SyncRow]) -> Result<usize, StoreError> {
        let mut applied = 0usize;
        for row in rows {
            if ingest_row(self.conn(), row)? {
                applied += 1;
            }
            log_local_row(self.conn(), self.store_id, row.kind, &row.row_id)?;
        }
        Ok(applied)
    }

    pub fn set_peer_token(
        &mut self,
        peer_id: &str,
        token: &CausalityToken,
    ) -> Result<(), StoreError> {
        self.tx.execute(
            "INSERT INTO sync_peers(peer_id, token, updated_at_ms) VALUES (?1, ?2, ?3) \
             ON CONFLICT(peer_id) DO UPDATE SET token=excluded.token, updated_at_ms=excluded.updated_at_ms",
            params![peer_id, token.encode(), now_ms()],
        )?;
        Ok(())
    }
}

/// Logs a row authored by this store. Rows already logged (locally or by a peer) are left alone.
pub(crate) fn log_local_row(
    conn: &Connection,
    store_id: &str,
    kind: SyncRowKind,
    row_id: &str,
) -> Result<bool, StoreError> {
    if exists(
        conn,
        "SELECT 1 FROM sync_log WHERE kind=?1 AND row_id=?2",
        params![kind.as_str(), row_id],
    )? {
        return Ok(false);
    }
    let seq = conn.query_row(
        "SELECT next_origin_seq FROM store_state WHERE singleton=1",
        [],
        |row| row.get::<_, i64>(0),
    )?;
    conn.execute(
        "INSERT INTO sync_log(origin_store_id, origin_seq, kind, row_id) VALUES (?1, ?2, ?3, ?4)",
        params![store_id, seq, kind.as_str(), row_id],
    )?;
    conn.execute(
        "UPDATE store_state SET next_origin_seq=?1, updated_at_ms=?2 WHERE singleton=1",
        params![seq + 1, now_ms()],
    )?;
    observe_clock(conn, store_id, u64::try_from(seq).unwrap_or(0))?;
    Ok(true)
}

fn observe_clock(conn: &Connection, origin: &str, seq: u64) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO sync_clock(origin_store_id, max_seq) VALUES (?1, ?2) \
         ON CONFLICT(origin_store_id) DO UPDATE SET max_seq=MAX(max_seq, excluded.max_seq)",
        params![origin, to_seq_i64(seq)?],
    )?;
    Ok(())
}

fn to_seq_i64(seq: u64) -> Result<i64, StoreError> {
    i64::try_from(seq).map_err(|_| StoreError::InvalidInput("sequence overflow"))
}

pub(crate) fn clock(conn: &Connection) -> Result<CausalityToken, StoreError> {
    let mut stmt = conn.prepare("SELECT origin_store_id, max_seq FROM sync_clock")?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
    let mut token = CausalityToken::new();
    for row in rows {
        let (origin, seq) = row?;
        token.observe(&origin, u64::try_from(seq).unwrap_or(0));
    }
    Ok(token)
}

pub(crate) fn peer_token(conn: &Connection, peer_id: &str) -> Result<CausalityToken, StoreError> {
    let raw = conn
        .query_row(
            "SELECT token FROM sync_peers WHERE peer_id=?1",
            params![peer_id],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    match raw {
        Some(raw) => Ok(CausalityToken::decode(&raw)?),
        None => Ok(CausalityToken::new()),
    }
}

/// Log entries not covered by `acknowledged`, in local log order.
pub(crate) fn unsynced_rows(
    conn: &Connection,
    acknowledged: &CausalityToken,
    limit: usize,
) -> Result<SyncBatch, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT origin_store_id, origin_seq, kind, row_id FROM sync_log ORDER BY seq ASC",
    )?;
    let mut cursor = stmt.query([])?;
    let mut rows = Vec::new();
    let mut has_more = false;
    while let Some(row) = cursor.next()? {
        let origin: String = row.get(0)?;
        let seq = u64::try_from(row.get::<_, i64>(1)?).unwrap_or(0);
        if acknowledged.covers(&origin, seq) {
            continue;
        }
        if rows.len() >= limit {
            has_more = true;
            break;
        }
        let kind_raw: String = row.get(2)?;
        let kind = SyncRowKind::parse(&kind_raw)
            .ok_or(StoreError::InvalidInput("unknown sync row kind"))?;
        let row_id: String = row.get(3)?;
        let payload = row_payload(conn, kind, &row_id)?;
        rows.push(SyncRow {
            origin_store_id: origin,
            origin_seq: seq,
            kind,
            row_id,
            payload,
        });
    }
    Ok(SyncBatch {
        rows,
        has_more,
        causality_token: clock(conn)?,
    })
}

/// Log entry for one row, used when rows are copied between stores outside the sync protocol.
pub(crate) fn sync_row(
    conn: &Connection,
    kind: SyncRowKind,
    row_id: &str,
) -> Result<Option<SyncRow>, StoreError> {
    let entry = conn
        .query_row(
            "SELECT origin_store_id, origin_seq FROM sync_log WHERE kind=?1 AND row_id=?2",
            params![kind.as_str(), row_id],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
        )
        .optional()?;
    let Some((origin_store_id, origin_seq)) = entry else {
        return Ok(None);
    };
    Ok(Some(SyncRow {
        origin_store_id,
        origin_seq: u64::try_from(origin_seq).unwrap_or(0),
        kind,
        row_id: row_id.to_string(),
        payload: row_payload(conn, kind, row_id)?,
    }))
}

pub(crate) fn schema_row_id(key: &str, version: &str) -> String {
    json!([key, version]).to_string()
}

pub(crate) fn label_row_id(change_set_id: &str, label: &str) -> String {
    json!([change_set_id, label]).to_string()
}

fn split_pair(row_id: &str) -> Result<(String, String), StoreError> {
    let (left, right): (String, String) = serde_json::from_str(row_id)?;
    Ok((left, right))
}

fn row_payload(conn: &Connection, kind: SyncRowKind, row_id: &str) -> Result<Value, StoreError> {
    let missing = || StoreError::InvalidInput("sync log references a missing row");
    match kind {
        SyncRowKind::Schema => {
            let (key, version) = split_pair(row_id)?;
            let definition = conn
                .query_row(
                    "SELECT definition FROM stored_schemas WHERE key=?1 AND version=?2",
                    params![key, version],
                    |row| row.get::<_, String>(0),
                )
                .optional()?
                .ok_or_else(missing)?;
            Ok(json!({
                "key": key,
                "version": version,
                "definition": serde_json::from_str::<Value>(&definition)?,
            }))
        }
        SyncRowKind::Snapshot => {
            let content = super::snapshots::snapshot_content(conn, row_id)?.ok_or_else(missing)?;
            Ok(json!({ "id": row_id, "content": content }))
        }
        SyncRowKind::Change => {
            let change = conn
                .query_row(
                    &format!("SELECT {CHANGE_COLUMNS} FROM changes WHERE id=?1"),
                    params![row_id],
                    change_from_row,
                )
                .optional()?
                .ok_or_else(missing)?;
            let mut payload = serde_json::to_value(&change)?;
            payload["parents"] = json!(change_parents(conn, row_id)?);
            Ok(payload)
        }
        SyncRowKind::ChangeSet => {
            let created_at_ms = conn
                .query_row(
                    "SELECT created_at_ms FROM change_sets WHERE id=?1 AND sealed=1",
                    params![row_id],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?
                .ok_or_else(missing)?;
            let elements = super::change_sets::change_set_elements(conn, row_id)?;
            let parents = super::change_sets::change_set_parents(conn, row_id)?;
            Ok(json!({
                "id": row_id,
                "created_at_ms": created_at_ms,
                "elements": elements,
                "parents": parents,
            }))
        }
        SyncRowKind::ChangeSetLabel => {
            let (change_set_id, label) = split_pair(row_id)?;
            Ok(json!({ "change_set_id": change_set_id, "label": label }))
        }
        SyncRowKind::Commit => {
            let commit = super::change_sets::commit_by_id(conn, row_id)?.ok_or_else(missing)?;
            Ok(serde_json::to_value(commit)?)
        }
    }
}

#[derive(Deserialize)]
struct ChangePayload {
    id: String,
    entity_id: String,
    file_id: String,
    schema_key: String,
    schema_version: String,
    plugin_key: String,
    snapshot_id: Option<String>,
    created_at_ms: i64,
    #[serde(default)]
    parents: Vec<String>,
}

#[derive(Deserialize)]
struct ChangeSetPayload {
    id: String,
    created_at_ms: i64,
    #[serde(default)]
    elements: Vec<super::ChangeSetElement>,
    #[serde(default)]
    parents: Vec<String>,
}

/// Returns `true` when the row was new to this store.
fn ingest_row(conn: &Connection, row: &SyncRow) -> Result<bool, StoreError> {
    let payload = row.payload.clone();
    match row.kind {
        SyncRowKind::Schema => {
            let key = payload["key"].as_str().unwrap_or_default();
            let version = payload["version"].as_str().unwrap_or_default();
            if key.is_empty() || version.is_empty() {
                return Err(StoreError::InvalidInput("schema row is missing key or version"));
            }
            let definition = canonical_json(&payload["definition"]);
            Ok(conn.execute(
                "INSERT OR IGNORE INTO stored_schemas(key, version, definition, created_at_ms) VALUES (?1, ?2, ?3, ?4)",
                params![key, version, definition, now_ms()],
            )? > 0)
        }
        SyncRowKind::Snapshot => {
            let content = &payload["content"];
            let id = snapshot_id(content);
            if id != row.row_id {
                return Err(StoreError::graph(
                    "ingest_rows",
                    &row.row_id,
                    "snapshot content does not match its id",
                ));
            }
            Ok(conn.execute(
                "INSERT OR IGNORE INTO snapshots(id, content) VALUES (?1, ?2)",
                params![id, canonical_json(content)],
            )? > 0)
        }
        SyncRowKind::Change => {
            let change: ChangePayload = serde_json::from_value(payload)?;
            if change_by_id(conn, &change.id)?.is_some() {
                return Ok(false);
            }
            let candidate = NewChange {
                key: lix_core::EntityKey::new(&change.entity_id, &change.file_id, &change.schema_key),
                schema_version: change.schema_version.clone(),
                plugin_key: change.plugin_key.clone(),
                snapshot_id: change.snapshot_id.clone(),
                parents: change.parents.clone(),
            };
            if candidate.content_id() != change.id {
                return Err(StoreError::graph(
                    "ingest_rows",
                    &change.entity_id,
                    format!("change {} does not match its content", change.id),
                ));
            }
            if let Some(snapshot) = change.snapshot_id.as_deref() {
                if !super::snapshots::snapshot_exists(conn, snapshot)? {
                    return Err(StoreError::graph(
                        "ingest_rows",
                        &change.entity_id,
                        format!("unknown snapshot {snapshot}"),
                    ));
                }
            }
            for parent_id in &change.parents {
                match change_by_id(conn, parent_id)? {
                    Some(parent) if parent.key() == candidate.key => {}
                    Some(_) => {
                        return Err(StoreError::graph(
                            "ingest_rows",
                            &change.entity_id,
                            format!("parent {parent_id} belongs to another entity"),
                        ));
                    }
                    None => {
                        return Err(StoreError::graph(
                            "ingest_rows",
                            &change.entity_id,
                            format!("unknown parent {parent_id}"),
                        ));
                    }
                }
            }
            conn.execute(
                &format!("INSERT INTO changes({CHANGE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
                params![
                    change.id,
                    change.entity_id,
                    change.file_id,
                    change.schema_key,
                    change.schema_version,
                    change.plugin_key,
                    change.snapshot_id,
                    change.created_at_ms,
                ],
            )?;
            for parent_id in &change.parents {
                conn.execute(
                    "INSERT OR IGNORE INTO change_edges(parent_id, child_id) VALUES (?1, ?2)",
                    params![parent_id, change.id],
                )?;
            }
            Ok(true)
        }
        SyncRowKind::ChangeSet => {
            let set: ChangeSetPayload = serde_json::from_value(payload)?;
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO change_sets(id, sealed, created_at_ms) VALUES (?1, 1, ?2)",
                params![set.id, set.created_at_ms],
            )?;
            if inserted == 0 {
                return Ok(false);
            }
            for element in &set.elements {
                if change_by_id(conn, &element.change_id)?.is_none() {
                    return Err(StoreError::graph(
                        "ingest_rows",
                        &element.entity_id,
                        format!("change set {} references unknown change {}", set.id, element.change_id),
                    ));
                }
                conn.execute(
                    "INSERT OR IGNORE INTO change_set_elements(change_set_id, change_id, entity_id, file_id, schema_key) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![set.id, element.change_id, element.entity_id, element.file_id, element.schema_key],
                )?;
            }
            for parent_id in &set.parents {
                if !exists(conn, "SELECT 1 FROM change_sets WHERE id=?1", params![parent_id])? {
                    return Err(StoreError::UnknownChangeSet(parent_id.clone()));
                }
                conn.execute(
                    "INSERT OR IGNORE INTO change_set_edges(parent_id, child_id) VALUES (?1, ?2)",
                    params![parent_id, set.id],
                )?;
            }
            Ok(true)
        }
        SyncRowKind::ChangeSetLabel => {
            let change_set_id = payload["change_set_id"].as_str().unwrap_or_default();
            let label = payload["label"].as_str().unwrap_or_default();
            let label = normalize_label(label).map_err(|err| StoreError::InvalidInput(err.message()))?;
            if !exists(conn, "SELECT 1 FROM change_sets WHERE id=?1", params![change_set_id])? {
                return Err(StoreError::UnknownChangeSet(change_set_id.to_string()));
            }
            let label_id = super::change_sets::ensure_label(conn, &label)?;
            Ok(conn.execute(
                "INSERT OR IGNORE INTO change_set_labels(change_set_id, label_id) VALUES (?1, ?2)",
                params![change_set_id, label_id],
            )? > 0)
        }
        SyncRowKind::Commit => {
            let commit: super::Commit = serde_json::from_value(payload)?;
            if !exists(
                conn,
                "SELECT 1 FROM change_sets WHERE id=?1",
                params![commit.change_set_id],
            )? {
                return Err(StoreError::UnknownChangeSet(commit.change_set_id));
            }
            Ok(conn.execute(
                "INSERT OR IGNORE INTO commits(id, change_set_id, author, message, created_at_ms) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![commit.id, commit.change_set_id, commit.author, commit.message, commit.created_at_ms],
            )? > 0)
        }
    }
}

pub(crate) fn rotate_store_id(conn: &Connection) -> Result<String, StoreError> {
    let store_id = new_id();
    conn.execute(
        "UPDATE store_state SET store_id=?1, next_origin_seq=1, updated_at_ms=?2 WHERE singleton=1",
        params![store_id, now_ms()],
    )?;
    conn.execute("DELETE FROM sync_peers", [])?;
    Ok(store_id)
}
