#![forbid(unsafe_code)]

//! Conflict detection between two change graphs.
//!
//! For every leaf that only the source has, the nearest ancestor that the target also has is
//! the common ancestor. The target's current leaf for that ancestor decides the outcome: no
//! further target edit means the source wins, a different value is a conflict, and an equal
//! value is a convergent edit.
//!
//! When the ancestor is known to the target but not visible from its version (store-to-store
//! merges), the version's own current change for the entity takes the place of that leaf.

use crate::change::EntityKey;
use crate::graph::{ConflictId, GraphError, Membership, VersionGraph};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};

pub trait GraphView {
    /// Whether the change counts as already known to this side.
    fn contains(&self, change_id: &str) -> bool;
    fn parents(&self, change_id: &str) -> Vec<String>;
    fn leaf_in_view(&self, change_id: &str) -> Result<Option<String>, GraphError>;
    /// Outer `None`: unknown change. Inner `None`: tombstone.
    fn snapshot_of(&self, change_id: &str) -> Option<Option<String>>;
    fn key_of(&self, change_id: &str) -> Option<EntityKey>;
    /// Current change of the entity on this side, if it has one.
    fn head_for(&self, key: &EntityKey) -> Option<String>;
}

impl GraphView for VersionGraph {
    fn contains(&self, change_id: &str) -> bool {
        match self.membership() {
            Membership::Store => self.graph().contains(change_id),
            Membership::Reachable => self.is_reachable(change_id),
        }
    }

    fn parents(&self, change_id: &str) -> Vec<String> {
        self.graph()
            .parents(change_id)
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    fn leaf_in_view(&self, change_id: &str) -> Result<Option<String>, GraphError> {
        self.leaf_of(change_id)
    }

    fn snapshot_of(&self, change_id: &str) -> Option<Option<String>> {
        self.graph()
            .get(change_id)
            .map(|change| change.snapshot_id.clone())
    }

    fn key_of(&self, change_id: &str) -> Option<EntityKey> {
        self.graph().get(change_id).map(|change| change.key.clone())
    }

    fn head_for(&self, key: &EntityKey) -> Option<String> {
        VersionGraph::head_for(self, key).map(str::to_string)
    }
}

/// Whether equal values reached through different histories are reported.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    #[default]
    ConvergentIsClean,
    ReportConvergent,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeOutcome {
    /// No common ancestor: the entity history is new to the target.
    Insert,
    /// Target did not move past the common ancestor.
    SourceWins,
    /// Both sides moved to the same value.
    Convergent,
    Conflict,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    DivergentValues,
    ConvergentValues,
}

impl ConflictReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DivergentValues => "divergent_values",
            Self::ConvergentValues => "convergent_values",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "divergent_values" => Some(Self::DivergentValues),
            "convergent_values" => Some(Self::ConvergentValues),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeDecision {
    pub key: EntityKey,
    pub source_change_id: String,
    pub base_change_id: Option<String>,
    pub target_change_id: Option<String>,
    pub outcome: MergeOutcome,
    pub reason: Option<ConflictReason>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DetectedConflict {
    pub conflict_id: ConflictId,
    pub key: EntityKey,
    pub change_id: String,
    pub conflicting_change_id: String,
    pub base_change_id: Option<String>,
    pub reason: ConflictReason,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MergePlan {
    pub decisions: Vec<MergeDecision>,
    /// Source leaves the target already has.
    pub already_present: usize,
}

impl MergePlan {
    pub fn conflicts(&self) -> Vec<DetectedConflict> {
        self.decisions
            .iter()
            .filter(|decision| decision.outcome == MergeOutcome::Conflict)
            .filter_map(|decision| {
                let conflicting = decision.target_change_id.as_ref()?;
                Some(DetectedConflict {
                    conflict_id: ConflictId::for_pair(
                        &decision.key,
                        &decision.source_change_id,
                        conflicting,
                    ),
                    key: decision.key.clone(),
                    change_id: decision.source_change_id.clone(),
                    conflicting_change_id: conflicting.clone(),
                    base_change_id: decision.base_change_id.clone(),
                    reason: decision
                        .reason
                        .unwrap_or(ConflictReason::DivergentValues),
                })
            })
            .collect()
    }

    /// Decisions whose source change becomes the target's current change.
    pub fn winners(&self) -> impl Iterator<Item = &MergeDecision> {
        self.decisions.iter().filter(|decision| {
            matches!(
                decision.outcome,
                MergeOutcome::Insert | MergeOutcome::SourceWins
            )
        })
    }

    pub fn count(&self, outcome: MergeOutcome) -> usize {
        self.decisions
            .iter()
            .filter(|decision| decision.outcome == outcome)
            .count()
    }
}

pub fn plan_merge<S, T>(
    source: &S,
    target: &T,
    source_leaves: &[String],
    policy: MergePolicy,
) -> Result<MergePlan, GraphError>
where
    S: GraphView + ?Sized,
    T: GraphView + ?Sized,
{
    let mut leaves = source_leaves.to_vec();
    leaves.sort();
    leaves.dedup();

    let mut plan = MergePlan::default();
    for leaf in leaves {
        if target.contains(&leaf) {
            plan.already_present += 1;
            continue;
        }
        let key = source
            .key_of(&leaf)
            .ok_or_else(|| GraphError::UnknownChange(leaf.clone()))?;

        let Some(base) = lowest_common_ancestor(source, &leaf, |id| target.contains(id)) else {
            plan.decisions.push(MergeDecision {
                key,
                source_change_id: leaf,
                base_change_id: None,
                target_change_id: None,
                outcome: MergeOutcome::Insert,
                reason: None,
            });
            continue;
        };

        let target_leaf = match target.leaf_in_view(&base)? {
            Some(leaf) => Some(leaf),
            None => target.head_for(&key),
        };
        let (outcome, reason) = match target_leaf.as_deref() {
            None => (MergeOutcome::SourceWins, None),
            Some(current) if current == base => (MergeOutcome::SourceWins, None),
            Some(current) if descends_from(source, &leaf, current) => {
                (MergeOutcome::SourceWins, None)
            }
            Some(current) => {
                let theirs = source.snapshot_of(&leaf);
                let ours = target.snapshot_of(current);
                if theirs.is_some() && theirs == ours {
                    match policy {
                        MergePolicy::ConvergentIsClean => (MergeOutcome::Convergent, None),
                        MergePolicy::ReportConvergent => (
                            MergeOutcome::Conflict,
                            Some(ConflictReason::ConvergentValues),
                        ),
                    }
                } else {
                    (
                        MergeOutcome::Conflict,
                        Some(ConflictReason::DivergentValues),
                    )
                }
            }
        };

        plan.decisions.push(MergeDecision {
            key,
            source_change_id: leaf,
            base_change_id: Some(base),
            target_change_id: target_leaf,
            outcome,
            reason,
        });
    }
    Ok(plan)
}

fn descends_from<S>(source: &S, change_id: &str, ancestor: &str) -> bool
where
    S: GraphView + ?Sized,
{
    lowest_common_ancestor(source, change_id, |id| id == ancestor).is_some()
}

/// Walks the source graph parent-by-parent, breadth first, until `present` holds.
pub fn lowest_common_ancestor<S, F>(source: &S, change_id: &str, present: F) -> Option<String>
where
    S: GraphView + ?Sized,
    F: Fn(&str) -> bool,
{
    let mut visited = HashSet::new();
    let mut queue = VecDeque::from([change_id.to_string()]);
    while let Some(current) = queue.pop_front() {
        if !visited.insert(current.clone()) {
            continue;
        }
        if present(&current) {
            return Some(current);
        }
        let mut parents = source.parents(&current);
        parents.sort();
        queue.extend(parents);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ChangeGraph, GraphChange};

    fn add(graph: &mut ChangeGraph, id: &str, snapshot: &str, parent: Option<&str>) {
        graph.insert(GraphChange {
            id: id.to_string(),
            key: EntityKey::new("e1", "f1", "todo"),
            snapshot_id: Some(snapshot.to_string()),
        });
        if let Some(parent) = parent {
            graph.link(parent, id).unwrap();
        }
    }

    fn store(changes: &[(&str, &str, Option<&str>)], head: &str) -> VersionGraph {
        let mut graph = ChangeGraph::new();
        for (id, snapshot, parent) in changes {
            add(&mut graph, id, snapshot, *parent);
        }
        VersionGraph::new(graph, [head.to_string()], Membership::Store).unwrap()
    }

    #[test]
    fn divergent_edits_conflict_in_both_directions() {
        let s1 = store(&[("c1", "a1", None), ("c2", "a2", Some("c1"))], "c2");
        let s2 = store(&[("c1", "a1", None), ("c3", "a3", Some("c1"))], "c3");

        let into_s1 = plan_merge(&s2, &s1, &["c3".to_string()], MergePolicy::default()).unwrap();
        let into_s2 = plan_merge(&s1, &s2, &["c2".to_string()], MergePolicy::default()).unwrap();

        let left = into_s1.conflicts();
        let right = into_s2.conflicts();
        assert_eq!(left.len(), 1);
        assert_eq!(right.len(), 1);
        assert_eq!(left[0].base_change_id.as_deref(), Some("c1"));
        assert_eq!(right[0].base_change_id.as_deref(), Some("c1"));
        assert_eq!(left[0].conflict_id, right[0].conflict_id);
        assert_eq!(left[0].change_id, "c3");
        assert_eq!(left[0].conflicting_change_id, "c2");
    }

    #[test]
    fn untouched_target_lets_source_win() {
        let target = store(&[("c1", "a1", None)], "c1");
        let source = store(&[("c1", "a1", None), ("c2", "a2", Some("c1"))], "c2");
        let plan = plan_merge(&source, &target, &["c2".to_string()], MergePolicy::default()).unwrap();
        assert_eq!(plan.count(MergeOutcome::SourceWins), 1);
        assert!(plan.conflicts().is_empty());
        assert_eq!(plan.winners().count(), 1);
    }

    #[test]
    fn convergent_values_follow_policy() {
        let target = store(&[("c1", "a1", None), ("c2", "a2", Some("c1"))], "c2");
        let source = store(
            &[
                ("c1", "a1", None),
                ("c5", "a5", Some("c1")),
                ("c6", "a2", Some("c5")),
            ],
            "c6",
        );

        let clean = plan_merge(&source, &target, &["c6".to_string()], MergePolicy::default()).unwrap();
        assert_eq!(clean.count(MergeOutcome::Convergent), 1);
        assert!(clean.conflicts().is_empty());

        let strict = plan_merge(
            &source,
            &target,
            &["c6".to_string()],
            MergePolicy::ReportConvergent,
        )
        .unwrap();
        let conflicts = strict.conflicts();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].reason, ConflictReason::ConvergentValues);
    }

    #[test]
    fn ancestor_outside_the_target_version_compares_against_its_own_value() {
        // The target store knows c1 through another version; this version only has t9.
        let target = store(&[("c1", "a1", None), ("t9", "a9", None)], "t9");
        let source = store(&[("c1", "a1", None), ("c2", "a2", Some("c1"))], "c2");

        let plan = plan_merge(&source, &target, &["c2".to_string()], MergePolicy::default()).unwrap();
        let conflicts = plan.conflicts();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflicting_change_id, "t9");
        assert_eq!(conflicts[0].base_change_id.as_deref(), Some("c1"));
        assert_eq!(plan.winners().count(), 0);

        let same = store(&[("c1", "a1", None), ("t9", "a2", None)], "t9");
        let plan = plan_merge(&source, &same, &["c2".to_string()], MergePolicy::default()).unwrap();
        assert_eq!(plan.count(MergeOutcome::Convergent), 1);
    }

    #[test]
    fn ancestor_outside_the_target_version_wins_when_its_value_is_older() {
        // The version sits at c1 while another version of the target store moved on to c2.
        let target = store(&[("c1", "a1", None), ("c2", "a2", Some("c1"))], "c1");
        let source = store(
            &[
                ("c1", "a1", None),
                ("c2", "a2", Some("c1")),
                ("c3", "a3", Some("c2")),
            ],
            "c3",
        );
        let plan = plan_merge(&source, &target, &["c3".to_string()], MergePolicy::default()).unwrap();
        assert_eq!(plan.count(MergeOutcome::SourceWins), 1);
        assert!(plan.conflicts().is_empty());
    }

    #[test]
    fn unrelated_history_is_an_insertion_and_known_leaves_are_skipped() {
        let target = store(&[("t1", "a1", None)], "t1");
        let source = store(&[("s1", "b1", None), ("t1", "a1", None)], "s1");
        let plan = plan_merge(
            &source,
            &target,
            &["s1".to_string(), "t1".to_string()],
            MergePolicy::default(),
        )
        .unwrap();
        assert_eq!(plan.already_present, 1);
        assert_eq!(plan.count(MergeOutcome::Insert), 1);
        assert_eq!(plan.decisions[0].base_change_id, None);
    }
}
