#![forbid(unsafe_code)]

use super::arena::{ChangeGraph, GraphError};
use crate::change::EntityKey;
use std::collections::{HashMap, HashSet};

/// How "present in this graph" is decided when another graph is compared against it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Membership {
    /// Any change stored in the graph counts (store-to-store comparison).
    Store,
    /// Only changes reachable from the version heads count (version-to-version comparison).
    Reachable,
}

/// A change graph seen from one version: the heads are the version's current changes and the
/// reachable set is their ancestor closure.
#[derive(Clone, Debug)]
pub struct VersionGraph {
    graph: ChangeGraph,
    heads: Vec<String>,
    head_by_key: HashMap<EntityKey, String>,
    reachable: HashSet<String>,
    membership: Membership,
}

impl VersionGraph {
    pub fn new(
        graph: ChangeGraph,
        heads: impl IntoIterator<Item = String>,
        membership: Membership,
    ) -> Result<Self, GraphError> {
        let mut heads = heads.into_iter().collect::<Vec<_>>();
        heads.sort();
        heads.dedup();
        if let Some(missing) = heads.iter().find(|id| !graph.contains(id)) {
            return Err(GraphError::UnknownChange(missing.clone()));
        }
        let reachable = graph.ancestors_inclusive(heads.iter().map(String::as_str));
        let head_by_key = heads
            .iter()
            .filter_map(|id| graph.get(id).map(|change| (change.key.clone(), id.clone())))
            .collect();
        Ok(Self {
            graph,
            heads,
            head_by_key,
            reachable,
            membership,
        })
    }

    pub fn graph(&self) -> &ChangeGraph {
        &self.graph
    }

    pub fn heads(&self) -> &[String] {
        &self.heads
    }

    /// The version's current change for `key`, tombstones included.
    pub fn head_for(&self, key: &EntityKey) -> Option<&str> {
        self.head_by_key.get(key).map(String::as_str)
    }

    pub fn membership(&self) -> Membership {
        self.membership
    }

    pub fn is_reachable(&self, change_id: &str) -> bool {
        self.reachable.contains(change_id)
    }

    pub fn reachable_count(&self) -> usize {
        self.reachable.len()
    }

    /// Current change descending from `change_id` in this version, if the change is visible here.
    pub fn leaf_of(&self, change_id: &str) -> Result<Option<String>, GraphError> {
        if !self.graph.contains(change_id) {
            return Ok(None);
        }
        self.graph
            .leaf_of(change_id, |id| self.reachable.contains(id))
    }
}
