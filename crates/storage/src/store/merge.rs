#![forbid(unsafe_code)]

//! Merges between versions of one store and between two stores.
//!
//! Planning is the pure algorithm from `lix_core::merge`. Applying a plan moves the target's
//! working pointers for source-wins and insert decisions and records every conflict; the target
//! value stays current for conflicting entities until the conflict is resolved.

use super::changes::{load_graph, require_change};
use super::conflicts::record_conflict;
use super::materializer::resolve_live_all;
use super::snapshots::snapshot_exists;
use super::sync::{SyncRow, SyncRowKind, schema_row_id, sync_row};
use super::versions::require_version;
use super::{MergeReport, MergeRequest, SqliteStore, StoreError, StoreTx, Version};
use lix_core::{ChangeGraph, GraphError, MergeOutcome, MergePlan, Membership, VersionGraph, plan_merge};
use rusqlite::Connection;
use std::collections::BTreeSet;

impl SqliteStore {
    /// Merges one version into another inside this store.
    pub fn merge_version(&mut self, request: MergeRequest) -> Result<MergeReport, StoreError> {
        self.transact(|tx| tx.merge_version(request))
    }

    /// Merges `request.source_version_id` of `source` into `request.target_version_id` here,
    /// copying the immutable rows the merge needs.
    pub fn merge_store(&mut self, source: &SqliteStore, request: MergeRequest) -> Result<MergeReport, StoreError> {
        let source_version = require_version(source.connection(), &request.source_version_id)?;
        let leaves = version_heads(
            source.connection(),
            &source_version,
            source.config().max_inheritance_depth,
        )?;
        let source_view = VersionGraph::new(
            load_graph(source.connection(), None)?,
            leaves.clone(),
            Membership::Reachable,
        )
        .map_err(|err| graph_error(&source_version.id, err))?;
        self.transact(|tx| tx.merge_from(source.connection(), &source_view, &leaves, &request))
    }
}

impl StoreTx<'_> {
    pub fn merge_version(&mut self, request: MergeRequest) -> Result<MergeReport, StoreError> {
        let source = self.version(&request.source_version_id)?;
        let target = self.version(&request.target_version_id)?;
        if source.id == target.id {
            return Err(StoreError::InvalidInput("a version cannot be merged into itself"));
        }
        let depth = self.config.max_inheritance_depth;
        let graph = load_graph(self.conn(), None)?;
        let source_leaves = version_heads(self.conn(), &source, depth)?;
        let target_heads = version_heads(self.conn(), &target, depth)?;

        let source_view = VersionGraph::new(graph.clone(), source_leaves.clone(), Membership::Reachable)
            .map_err(|err| graph_error(&source.id, err))?;
        let target_view = VersionGraph::new(graph, target_heads, Membership::Reachable)
            .map_err(|err| graph_error(&target.id, err))?;
        let plan = plan_merge(&source_view, &target_view, &source_leaves, request.policy)
            .map_err(|err| graph_error(&target.id, err))?;
        self.apply_merge_plan(&target, &plan, 0)
    }

    fn merge_from(
        &mut self,
        source_conn: &Connection,
        source_view: &VersionGraph,
        source_leaves: &[String],
        request: &MergeRequest,
    ) -> Result<MergeReport, StoreError> {
        let target = self.version(&request.target_version_id)?;
        let target_heads = version_heads(self.conn(), &target, self.config.max_inheritance_depth)?;
        let target_view = VersionGraph::new(load_graph(self.conn(), None)?, target_heads, Membership::Store)
            .map_err(|err| graph_error(&target.id, err))?;
        let plan = plan_merge(source_view, &target_view, source_leaves, request.policy)
            .map_err(|err| graph_error(&target.id, err))?;

        let rows = rows_to_copy(source_conn, self.conn(), source_view.graph(), target_view.graph(), &plan)?;
        let copied = rows.iter().filter(|row| row.kind == SyncRowKind::Change).count();
        self.copy_rows(&rows)?;
        self.apply_merge_plan(&target, &plan, copied)
    }

    fn apply_merge_plan(
        &mut self,
        target: &Version,
        plan: &MergePlan,
        copied_changes: usize,
    ) -> Result<MergeReport, StoreError> {
        for decision in plan.winners() {
            let change = require_change(self.conn(), &decision.source_change_id)?;
            self.set_pointer(target, &change)?;
        }
        let mut conflicts = Vec::new();
        for detected in plan.conflicts() {
            let conflict = record_conflict(self.conn(), &target.id, &detected)?;
            if !conflict.is_resolved() {
                conflicts.push(conflict);
            }
        }

        let report = MergeReport {
            inserted: plan.count(MergeOutcome::Insert),
            source_wins: plan.count(MergeOutcome::SourceWins),
            convergent: plan.count(MergeOutcome::Convergent),
            already_present: plan.already_present,
            copied_changes,
            conflicts,
        };
        tracing::info!(
            target_version_id = %target.id,
            inserted = report.inserted,
            source_wins = report.source_wins,
            convergent = report.convergent,
            conflicts = report.conflicts.len(),
            copied = report.copied_changes,
            "merge applied"
        );
        Ok(report)
    }
}

/// Current change ids of a version, inherited ones and tombstones included.
fn version_heads(conn: &Connection, version: &Version, max_depth: usize) -> Result<Vec<String>, StoreError> {
    Ok(resolve_live_all(conn, &version.id, max_depth)?
        .into_iter()
        .map(|row| row.change_id)
        .collect())
}

/// Source rows the target lacks for every change the plan refers to, in dependency order:
/// schemas, then snapshots, then changes parents first.
fn rows_to_copy(
    source_conn: &Connection,
    target_conn: &Connection,
    source_graph: &ChangeGraph,
    target_graph: &ChangeGraph,
    plan: &MergePlan,
) -> Result<Vec<SyncRow>, StoreError> {
    // Convergent leaves are skipped: the target already holds their value.
    let needed = source_graph.ancestors_inclusive(
        plan.decisions
            .iter()
            .filter(|decision| decision.outcome != MergeOutcome::Convergent)
            .map(|decision| decision.source_change_id.as_str()),
    );
    let order = source_graph
        .topological_order()
        .map_err(|err| StoreError::graph("merge_store", "", err))?;

    let mut schemas = BTreeSet::new();
    let mut snapshots = BTreeSet::new();
    let mut schema_rows = Vec::new();
    let mut snapshot_rows = Vec::new();
    let mut change_rows = Vec::new();
    for change_id in order
        .iter()
        .filter(|id| needed.contains(id.as_str()) && !target_graph.contains(id))
    {
        let change = require_change(source_conn, change_id)?;
        let schema_id = schema_row_id(&change.schema_key, &change.schema_version);
        if schemas.insert(schema_id.clone())
            && super::schemas::schema_definition(target_conn, &change.schema_key, &change.schema_version)?.is_none()
        {
            if let Some(row) = sync_row(source_conn, SyncRowKind::Schema, &schema_id)? {
                schema_rows.push(row);
            }
        }
        if let Some(snapshot_id) = change.snapshot_id.as_deref() {
            if snapshots.insert(snapshot_id.to_string()) && !snapshot_exists(target_conn, snapshot_id)? {
                snapshot_rows.push(source_row(source_conn, SyncRowKind::Snapshot, snapshot_id)?);
            }
        }
        change_rows.push(source_row(source_conn, SyncRowKind::Change, change_id)?);
    }

    schema_rows.extend(snapshot_rows);
    schema_rows.extend(change_rows);
    Ok(schema_rows)
}

fn source_row(conn: &Connection, kind: SyncRowKind, row_id: &str) -> Result<SyncRow, StoreError> {
    sync_row(conn, kind, row_id)?.ok_or_else(|| {
        StoreError::graph(
            "merge_store",
            row_id,
            format!("{} row is missing from the source log", kind.as_str()),
        )
    })
}

fn graph_error(version_id: &str, err: GraphError) -> StoreError {
    StoreError::graph("merge", version_id, err)
}
