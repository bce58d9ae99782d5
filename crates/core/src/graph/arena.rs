#![forbid(unsafe_code)]

use crate::change::EntityKey;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GraphError {
    UnknownChange(String),
    SelfEdge(String),
    KeyMismatch { parent: String, child: String },
    Cycle { remaining: usize },
    AmbiguousLeaf { change_id: String, leaves: Vec<String> },
}

impl std::fmt::Display for GraphError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownChange(id) => write!(f, "unknown change {id}"),
            Self::SelfEdge(id) => write!(f, "change {id} cannot be its own parent"),
            Self::KeyMismatch { parent, child } => write!(
                f,
                "parent {parent} and child {child} belong to different entities"
            ),
            Self::Cycle { remaining } => {
                write!(f, "change graph contains a cycle ({remaining} changes unordered)")
            }
            Self::AmbiguousLeaf { change_id, leaves } => write!(
                f,
                "change {change_id} resolves to {} leaves ({})",
                leaves.len(),
                leaves.join(",")
            ),
        }
    }
}

impl std::error::Error for GraphError {}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GraphChange {
    pub id: String,
    pub key: EntityKey,
    pub snapshot_id: Option<String>,
}

#[derive(Clone, Debug)]
struct Node {
    change: GraphChange,
    parents: Vec<usize>,
    children: Vec<usize>,
}

/// Arena of changes with a parent/child index. Walks are plain graph algorithms over it.
#[derive(Clone, Debug, Default)]
pub struct ChangeGraph {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
}

impl ChangeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns `false` when the change was already present.
    pub fn insert(&mut self, change: GraphChange) -> bool {
        if self.index.contains_key(&change.id) {
            return false;
        }
        self.index.insert(change.id.clone(), self.nodes.len());
        self.nodes.push(Node {
            change,
            parents: Vec::new(),
            children: Vec::new(),
        });
        true
    }

    pub fn link(&mut self, parent_id: &str, child_id: &str) -> Result<(), GraphError> {
        if parent_id == child_id {
            return Err(GraphError::SelfEdge(child_id.to_string()));
        }
        let parent = self.position(parent_id)?;
        let child = self.position(child_id)?;
        if self.nodes[parent].change.key != self.nodes[child].change.key {
            return Err(GraphError::KeyMismatch {
                parent: parent_id.to_string(),
                child: child_id.to_string(),
            });
        }
        if self.nodes[parent].children.contains(&child) {
            return Ok(());
        }
        self.nodes[parent].children.push(child);
        self.nodes[child].parents.push(parent);
        Ok(())
    }

    pub fn contains(&self, change_id: &str) -> bool {
        self.index.contains_key(change_id)
    }

    pub fn get(&self, change_id: &str) -> Option<&GraphChange> {
        self.index.get(change_id).map(|&pos| &self.nodes[pos].change)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|node| node.change.id.as_str())
    }

    pub fn parents(&self, change_id: &str) -> Vec<&str> {
        self.neighbours(change_id, |node| &node.parents)
    }

    pub fn children(&self, change_id: &str) -> Vec<&str> {
        self.neighbours(change_id, |node| &node.children)
    }

    /// The given changes plus everything reachable through parent edges.
    pub fn ancestors_inclusive<'a>(
        &self,
        change_ids: impl IntoIterator<Item = &'a str>,
    ) -> HashSet<String> {
        let mut out = HashSet::new();
        let mut stack = change_ids
            .into_iter()
            .filter_map(|id| self.index.get(id).copied())
            .collect::<Vec<_>>();
        while let Some(pos) = stack.pop() {
            let node = &self.nodes[pos];
            if !out.insert(node.change.id.clone()) {
                continue;
            }
            stack.extend(node.parents.iter().copied());
        }
        out
    }

    /// Follows child edges restricted to `in_view` until no qualifying child remains.
    ///
    /// Returns `Ok(None)` when the starting change itself is outside the view. More than one
    /// terminal change violates leaf uniqueness and is reported as [`GraphError::AmbiguousLeaf`].
    pub fn leaf_of<F>(&self, change_id: &str, in_view: F) -> Result<Option<String>, GraphError>
    where
        F: Fn(&str) -> bool,
    {
        let start = self.position(change_id)?;
        if !in_view(change_id) {
            return Ok(None);
        }

        let mut visited = vec![false; self.nodes.len()];
        let mut leaves = BTreeSet::new();
        let mut stack = vec![start];
        while let Some(current) = stack.pop() {
            if std::mem::replace(&mut visited[current], true) {
                continue;
            }
            let next = self.nodes[current]
                .children
                .iter()
                .copied()
                .filter(|&child| in_view(&self.nodes[child].change.id))
                .collect::<Vec<_>>();
            if next.is_empty() {
                leaves.insert(self.nodes[current].change.id.clone());
            } else {
                stack.extend(next);
            }
        }

        match leaves.len() {
            0 => Ok(None),
            1 => Ok(leaves.into_iter().next()),
            _ => Err(GraphError::AmbiguousLeaf {
                change_id: change_id.to_string(),
                leaves: leaves.into_iter().collect(),
            }),
        }
    }

    /// Changes in the view that have no child in the view.
    pub fn leaves<F>(&self, in_view: F) -> Vec<String>
    where
        F: Fn(&str) -> bool,
    {
        let mut out = self
            .nodes
            .iter()
            .filter(|node| in_view(&node.change.id))
            .filter(|node| {
                !node
                    .children
                    .iter()
                    .any(|&child| in_view(&self.nodes[child].change.id))
            })
            .map(|node| node.change.id.clone())
            .collect::<Vec<_>>();
        out.sort();
        out
    }

    /// Parents before children; ties broken by id so the order is deterministic.
    pub fn topological_order(&self) -> Result<Vec<String>, GraphError> {
        let mut indegree = self
            .nodes
            .iter()
            .map(|node| node.parents.len())
            .collect::<Vec<_>>();
        let mut ready = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(pos, _)| indegree[*pos] == 0)
            .map(|(pos, node)| (node.change.id.clone(), pos))
            .collect::<BTreeSet<_>>();
        let mut out = Vec::with_capacity(self.nodes.len());

        while let Some(first) = ready.pop_first() {
            let (id, pos) = first;
            out.push(id);
            for &child in &self.nodes[pos].children {
                indegree[child] -= 1;
                if indegree[child] == 0 {
                    ready.insert((self.nodes[child].change.id.clone(), child));
                }
            }
        }

        if out.len() != self.nodes.len() {
            return Err(GraphError::Cycle {
                remaining: self.nodes.len() - out.len(),
            });
        }
        Ok(out)
    }

    /// Breadth-first walk over parents (starting at `change_id` itself) until `present` holds.
    pub fn nearest_ancestor<F>(&self, change_id: &str, present: F) -> Result<Option<String>, GraphError>
    where
        F: Fn(&str) -> bool,
    {
        let start = self.position(change_id)?;
        let mut visited = vec![false; self.nodes.len()];
        let mut queue = VecDeque::from([start]);
        while let Some(current) = queue.pop_front() {
            if std::mem::replace(&mut visited[current], true) {
                continue;
            }
            let id = &self.nodes[current].change.id;
            if present(id) {
                return Ok(Some(id.clone()));
            }
            let mut parents = self.nodes[current].parents.clone();
            parents.sort_by(|a, b| self.nodes[*a].change.id.cmp(&self.nodes[*b].change.id));
            queue.extend(parents);
        }
        Ok(None)
    }

    fn position(&self, change_id: &str) -> Result<usize, GraphError> {
        self.index
            .get(change_id)
            .copied()
            .ok_or_else(|| GraphError::UnknownChange(change_id.to_string()))
    }

    fn neighbours<F>(&self, change_id: &str, select: F) -> Vec<&str>
    where
        F: Fn(&Node) -> &Vec<usize>,
    {
        let Some(&pos) = self.index.get(change_id) else {
            return Vec::new();
        };
        let mut out = select(&self.nodes[pos])
            .iter()
            .map(|&other| self.nodes[other].change.id.as_str())
            .collect::<Vec<_>>();
        out.sort();
        out
    }
}
