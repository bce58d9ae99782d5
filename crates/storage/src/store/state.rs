#![forbid(unsafe_code)]

//! Statements against the logical `state` views.
//!
//! Reads are rewritten into SQL over the per-schema cache tables, with inheritance shadowing
//! expressed as `NOT EXISTS` clauses. Writes are rewritten into change-graph appends plus a
//! working-set pointer move. [`StoreTx::rewrite`] exposes the plan without running it.

use super::materializer::{cache_table_name, is_fresh, resolve_live, state_row};
use super::schemas::{known_schema_keys, schema_definition};
use super::versions::inheritance_chain;
use super::{SqliteStore, StateRow, StoreError, StoreTx, Version, canonicalize_key};
use lix_core::{Change, EntityKey, NewChange, canonical_identifier, snapshot_id};
use rusqlite::{Connection, params, params_from_iter};
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateView {
    /// Live rows only.
    State,
    StateWithTombstones,
}

impl StateView {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::State => "state",
            Self::StateWithTombstones => "state_with_tombstones",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim() {
            "state" => Some(Self::State),
            "state_with_tombstones" => Some(Self::StateWithTombstones),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StateFilter {
    pub schema_key: Option<String>,
    pub entity_id: Option<String>,
    pub file_id: Option<String>,
    /// `None` reads the active version.
    pub version_id: Option<String>,
}

impl StateFilter {
    pub fn schema(schema_key: impl Into<String>) -> Self {
        Self {
            schema_key: Some(schema_key.into()),
            ..Self::default()
        }
    }

    pub fn in_version(mut self, version_id: impl Into<String>) -> Self {
        self.version_id = Some(version_id.into());
        self
    }

    pub fn entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn file(mut self, file_id: impl Into<String>) -> Self {
        self.file_id = Some(file_id.into());
        self
    }

    /// Applies the identifier rules writes use to every key field present.
    fn canonicalize(&self) -> Result<Self, StoreError> {
        let field = |name: &'static str, message: &'static str, value: &Option<String>| {
            value
                .as_deref()
                .map(|value| canonical_identifier(name, value).map_err(|_| StoreError::InvalidInput(message)))
                .transpose()
        };
        Ok(Self {
            schema_key: field("schema_key", "invalid schema_key", &self.schema_key)?,
            entity_id: field("entity_id", "invalid entity_id", &self.entity_id)?,
            file_id: field("file_id", "invalid file_id", &self.file_id)?,
            version_id: self.version_id.clone(),
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum StateStatement {
    Select {
        view: StateView,
        filter: StateFilter,
    },
    Insert {
        key: EntityKey,
        schema_version: String,
        plugin_key: String,
        snapshot: Value,
        version_id: Option<String>,
    },
    Update {
        key: EntityKey,
        snapshot: Value,
        version_id: Option<String>,
    },
    Upsert {
        key: EntityKey,
        schema_version: String,
        plugin_key: String,
        snapshot: Value,
        version_id: Option<String>,
    },
    Delete {
        key: EntityKey,
        version_id: Option<String>,
    },
}

/// One parameterized read over a single cache table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheRead {
    pub schema_key: String,
    pub table: String,
    pub sql: String,
    pub params: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteKind {
    Insert,
    Update,
    Upsert,
    Delete,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WritePlan {
    pub kind: WriteKind,
    pub version_id: String,
    pub key: EntityKey,
    pub schema_version: Option<String>,
    pub plugin_key: Option<String>,
    /// `None` writes a tombstone.
    pub snapshot: Option<Value>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum QueryPlan {
    CacheRead {
        view: StateView,
        version_id: String,
        /// Versions whose caches the reads depend on, nearest first.
        chain: Vec<String>,
        reads: Vec<CacheRead>,
    },
    /// Cache disabled: resolve straight from the change graph.
    LiveRead {
        view: StateView,
        version_id: String,
        filter: StateFilter,
    },
    Write(WritePlan),
}

#[derive(Clone, Debug, PartialEq)]
pub enum StatementOutput {
    Rows(Vec<StateRow>),
    /// `None` when the write did not change anything.
    Written(Option<Change>),
}

impl StatementOutput {
    pub fn rows(self) -> Vec<StateRow> {
        match self {
            Self::Rows(rows) => rows,
            Self::Written(_) => Vec::new(),
        }
    }

    pub fn change(self) -> Option<Change> {
        match self {
            Self::Rows(_) => None,
            Self::Written(change) => change,
        }
    }
}

impl SqliteStore {
    pub fn execute(&mut self, statement: StateStatement) -> Result<StatementOutput, StoreError> {
        if let StateStatement::Select { view, filter } = statement {
            return Ok(StatementOutput::Rows(self.select(view, filter)?));
        }
        self.transact(|tx| tx.execute(statement))
    }

    pub fn rewrite(&mut self, statement: &StateStatement) -> Result<QueryPlan, StoreError> {
        self.read(|tx| tx.rewrite(statement))
    }

    /// Reads under a shared lock while every cache involved is fresh. A stale cache is rebuilt
    /// in a write transaction before the read runs.
    pub fn select(&mut self, view: StateView, filter: StateFilter) -> Result<Vec<StateRow>, StoreError> {
        if let Some(rows) = self.read(|tx| tx.select_if_fresh(view, &filter))? {
            return Ok(rows);
        }
        self.transact(|tx| tx.select(view, &filter))
    }
}

impl StoreTx<'_> {
    pub fn execute(&mut self, statement: StateStatement) -> Result<StatementOutput, StoreError> {
        match self.rewrite(&statement)? {
            QueryPlan::CacheRead {
                view,
                version_id,
                chain,
                reads,
            } => {
                let chain_versions = chain
                    .iter()
                    .map(|id| self.version(id))
                    .collect::<Result<Vec<_>, _>>()?;
                for read in &reads {
                    self.ensure_fresh(&read.schema_key, &chain_versions)?;
                }
                Ok(StatementOutput::Rows(read_caches(self, view, &reads, &version_id)?))
            }
            QueryPlan::LiveRead {
                view,
                version_id,
                filter,
            } => Ok(StatementOutput::Rows(live_read(self, view, &version_id, &filter)?)),
            QueryPlan::Write(plan) => Ok(StatementOutput::Written(self.apply_write(plan)?)),
        }
    }

    /// Runs a read without touching the cache. `None` when a cache it depends on is stale.
    pub(crate) fn select_if_fresh(
        &mut self,
        view: StateView,
        filter: &StateFilter,
    ) -> Result<Option<Vec<StateRow>>, StoreError> {
        let statement = StateStatement::Select {
            view,
            filter: filter.clone(),
        };
        match self.rewrite(&statement)? {
            QueryPlan::CacheRead {
                view,
                version_id,
                chain,
                reads,
            } => {
                for read in &reads {
                    for level in &chain {
                        if !is_fresh(self.conn(), &read.schema_key, level)? {
                            return Ok(None);
                        }
                    }
                }
                Ok(Some(read_caches(self, view, &reads, &version_id)?))
            }
            QueryPlan::LiveRead {
                view,
                version_id,
                filter,
            } => Ok(Some(live_read(self, view, &version_id, &filter)?)),
            QueryPlan::Write(_) => Err(StoreError::InvalidInput("select produced a write plan")),
        }
    }

    pub fn select(&mut self, view: StateView, filter: &StateFilter) -> Result<Vec<StateRow>, StoreError> {
        Ok(self
            .execute(StateStatement::Select {
                view,
                filter: filter.clone(),
            })?
            .rows())
    }

    pub fn rewrite(&self, statement: &StateStatement) -> Result<QueryPlan, StoreError> {
        match statement {
            StateStatement::Select { view, filter } => {
                let filter = &filter.canonicalize()?;
                let version = self.version_or_active(filter.version_id.as_deref())?;
                if !self.config.cache_enabled {
                    return Ok(QueryPlan::LiveRead {
                        view: *view,
                        version_id: version.id,
                        filter: filter.clone(),
                    });
                }
                let chain = inheritance_chain(self.conn(), &version.id, self.config.max_inheritance_depth)?
                    .into_iter()
                    .map(|version| version.id)
                    .collect::<Vec<_>>();
                let schema_keys = match filter.schema_key.as_deref() {
                    Some(schema_key) => vec![schema_key.to_string()],
                    None => known_schema_keys(self.conn())?,
                };
                let reads = schema_keys
                    .into_iter()
                    .map(|schema_key| cache_read(schema_key, &chain, *view, filter))
                    .collect();
                Ok(QueryPlan::CacheRead {
                    view: *view,
                    version_id: version.id,
                    chain,
                    reads,
                })
            }
            StateStatement::Insert {
                key,
                schema_version,
                plugin_key,
                snapshot,
                version_id,
            } => self.write_plan(
                WriteKind::Insert,
                key,
                version_id.as_deref(),
                Some(schema_version),
                Some(plugin_key),
                Some(snapshot),
            ),
            StateStatement::Update {
                key,
                snapshot,
                version_id,
            } => self.write_plan(WriteKind::Update, key, version_id.as_deref(), None, None, Some(snapshot)),
            StateStatement::Upsert {
                key,
                schema_version,
                plugin_key,
                snapshot,
                version_id,
            } => self.write_plan(
                WriteKind::Upsert,
                key,
                version_id.as_deref(),
                Some(schema_version),
                Some(plugin_key),
                Some(snapshot),
            ),
            StateStatement::Delete { key, version_id } => {
                self.write_plan(WriteKind::Delete, key, version_id.as_deref(), None, None, None)
            }
        }
    }

    fn write_plan(
        &self,
        kind: WriteKind,
        key: &EntityKey,
        version_id: Option<&str>,
        schema_version: Option<&String>,
        plugin_key: Option<&String>,
        snapshot: Option<&Value>,
    ) -> Result<QueryPlan, StoreError> {
        let version = self.version_or_active(version_id)?;
        Ok(QueryPlan::Write(WritePlan {
            kind,
            version_id: version.id,
            key: canonicalize_key(key)?,
            schema_version: schema_version.cloned(),
            plugin_key: plugin_key.cloned(),
            snapshot: snapshot.cloned(),
        }))
    }

    /// Validates and appends one write, then moves the version's working pointer to it.
    fn apply_write(&mut self, plan: WritePlan) -> Result<Option<Change>, StoreError> {
        let version = self.version(&plan.version_id)?;
        let current = self
            .resolve_live(&version.id, Some(&plan.key.schema_key), Some(&plan.key))?
            .into_iter()
            .next();
        let live = current.as_ref().filter(|row| !row.is_tombstone());

        match plan.kind {
            WriteKind::Insert if live.is_some() => {
                return Err(StoreError::EntityExists {
                    entity_id: plan.key.entity_id,
                });
            }
            WriteKind::Update if live.is_none() => {
                return Err(StoreError::UnknownEntity {
                    entity_id: plan.key.entity_id,
                });
            }
            WriteKind::Delete if live.is_none() => return Ok(None),
            _ => {}
        }

        let schema_version = plan
            .schema_version
            .clone()
            .or_else(|| current.as_ref().map(|row| row.schema_version.clone()))
            .ok_or(StoreError::InvalidInput("schema_version is required"))?;
        let plugin_key = plan
            .plugin_key
            .clone()
            .or_else(|| current.as_ref().map(|row| row.plugin_key.clone()))
            .ok_or(StoreError::InvalidInput("plugin_key is required"))?;

        let snapshot_id = match plan.snapshot.as_ref() {
            Some(snapshot) => {
                validate_snapshot(self.conn(), &plan.key, &schema_version, snapshot)?;

                let unchanged = live.is_some_and(|row| {
                    row.schema_version == schema_version
                        && row.snapshot_content.as_ref().map(snapshot_id) == Some(snapshot_id(snapshot))
                });
                if unchanged {
                    return Ok(None);
                }
                Some(self.put_snapshot(snapshot)?)
            }
            None => None,
        };

        let change = self.append_change(NewChange {
            key: plan.key.clone(),
            schema_version,
            plugin_key,
            snapshot_id,
            parents: current.map(|row| row.change_id).into_iter().collect(),
        })?;
        self.set_pointer(&version, &change)?;
        Ok(Some(change))
    }

    /// Makes `change` the version-local current change of its entity.
    pub(crate) fn set_pointer(&mut self, version: &Version, change: &Change) -> Result<(), StoreError> {
        self.tx.execute(
            "INSERT OR REPLACE INTO change_set_elements(change_set_id, change_id, entity_id, file_id, schema_key) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                version.working_change_set_id,
                change.id,
                change.entity_id,
                change.file_id,
                change.schema_key
            ],
        )?;
        self.patch_cache(&version.id, change)
    }
}

/// Checks a snapshot against the stored schema it claims to follow.
pub(crate) fn validate_snapshot(
    conn: &Connection,
    key: &EntityKey,
    schema_version: &str,
    snapshot: &Value,
) -> Result<(), StoreError> {
    let schema = schema_definition(conn, &key.schema_key, schema_version)?.ok_or_else(|| {
        StoreError::UnknownSchema {
            schema_key: key.schema_key.clone(),
            schema_version: schema_version.to_string(),
        }
    })?;
    schema
        .validate(snapshot)
        .map_err(|err| StoreError::SchemaViolation {
            schema_key: key.schema_key.clone(),
            entity_id: key.entity_id.clone(),
            reason: err.to_string(),
        })
}

fn cache_read(schema_key: String, chain: &[String], view: StateView, filter: &StateFilter) -> CacheRead {
    let table = cache_table_name(&schema_key);
    let columns = "entity_id, file_id, version_id, change_id, schema_version, plugin_key, snapshot_content";
    let mut params = Vec::new();
    let mut branches = Vec::with_capacity(chain.len());

    for (depth, version_id) in chain.iter().enumerate() {
        let mut sql = format!(
            "SELECT {columns}, {depth} AS depth FROM \"{table}\" AS c{depth} WHERE c{depth}.version_id = ?"
        );
        params.push(version_id.clone());
        if let Some(entity_id) = filter.entity_id.as_ref() {
            sql.push_str(&format!(" AND c{depth}.entity_id = ?"));
            params.push(entity_id.clone());
        }
        if let Some(file_id) = filter.file_id.as_ref() {
            sql.push_str(&format!(" AND c{depth}.file_id = ?"));
            params.push(file_id.clone());
        }
        if depth > 0 {
            let nearer = vec!["?"; depth].join(", ");
            sql.push_str(&format!(
                " AND NOT EXISTS (SELECT 1 FROM \"{table}\" AS s WHERE s.entity_id = c{depth}.entity_id \
                 AND s.file_id = c{depth}.file_id AND s.version_id IN ({nearer}))"
            ));
            params.extend(chain[..depth].iter().cloned());
        }
        branches.push(sql);
    }

    let tombstones = match view {
        StateView::State => " WHERE snapshot_content IS NOT NULL",
        StateView::StateWithTombstones => "",
    };
    let sql = format!(
        "SELECT {columns}, depth FROM ({}){tombstones} ORDER BY entity_id, file_id",
        branches.join(" UNION ALL ")
    );
    CacheRead {
        schema_key,
        table,
        sql,
        params,
    }
}

fn read_caches(
    tx: &StoreTx<'_>,
    view: StateView,
    reads: &[CacheRead],
    version_id: &str,
) -> Result<Vec<StateRow>, StoreError> {
    let mut rows = Vec::new();
    for read in reads {
        rows.extend(run_cache_read(tx, read, version_id)?);
    }
    rows.sort_by(|a, b| a.key().cmp(&b.key()));
    tracing::trace!(view = view.as_str(), rows = rows.len(), "cache read");
    Ok(rows)
}

fn live_read(
    tx: &StoreTx<'_>,
    view: StateView,
    version_id: &str,
    filter: &StateFilter,
) -> Result<Vec<StateRow>, StoreError> {
    let rows = resolve_live(
        tx.conn(),
        version_id,
        filter.schema_key.as_deref(),
        None,
        tx.config.max_inheritance_depth,
    )?;
    Ok(rows
        .into_iter()
        .filter(|row| view == StateView::StateWithTombstones || !row.is_tombstone())
        .filter(|row| filter.entity_id.as_ref().is_none_or(|id| &row.entity_id == id))
        .filter(|row| filter.file_id.as_ref().is_none_or(|id| &row.file_id == id))
        .collect())
}

fn run_cache_read(tx: &StoreTx<'_>, read: &CacheRead, version_id: &str) -> Result<Vec<StateRow>, StoreError> {
    let mut stmt = tx.conn().prepare(&read.sql)?;
    let rows = stmt.query_map(params_from_iter(read.params.iter()), |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, String>(5)?,
            row.get::<_, Option<String>>(6)?,
            row.get::<_, i64>(7)?,
        ))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (entity_id, file_id, source_version, change_id, schema_version, plugin_key, content, depth) = row?;
        let change = Change {
            id: change_id,
            entity_id,
            file_id,
            schema_key: read.schema_key.clone(),
            schema_version,
            plugin_key,
            snapshot_id: None,
            created_at_ms: 0,
        };
        out.push(state_row(
            version_id,
            (depth > 0).then_some(source_version),
            change,
            content.as_deref(),
        )?);
    }
    Ok(out)
}
