#![forbid(unsafe_code)]

use lix_core::{ConflictReason, EntityKey, MergePolicy};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One resolved entity as seen from a version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateRow {
    pub entity_id: String,
    pub file_id: String,
    pub schema_key: String,
    pub schema_version: String,
    pub plugin_key: String,
    pub version_id: String,
    pub change_id: String,
    /// `None` for tombstones (only visible through `state_with_tombstones`).
    pub snapshot_content: Option<Value>,
    pub inherited_from_version_id: Option<String>,
}

impl StateRow {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.entity_id, &self.file_id, &self.schema_key)
    }

    pub fn is_tombstone(&self) -> bool {
        self.snapshot_content.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub id: String,
    pub name: String,
    /// Last committed change set, `None` until the first commit.
    pub change_set_id: Option<String>,
    pub working_change_set_id: String,
    pub inherits_from_version_id: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub id: String,
    pub sealed: bool,
    pub created_at_ms: i64,
    pub labels: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSetElement {
    pub change_set_id: String,
    pub change_id: String,
    pub entity_id: String,
    pub file_id: String,
    pub schema_key: String,
}

impl ChangeSetElement {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.entity_id, &self.file_id, &self.schema_key)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub id: String,
    pub change_set_id: String,
    pub author: String,
    pub message: String,
    pub created_at_ms: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: String,
    pub version_id: String,
    pub entity_id: String,
    pub file_id: String,
    pub schema_key: String,
    pub change_id: String,
    pub conflicting_change_id: String,
    pub base_change_id: Option<String>,
    pub reason: ConflictReason,
    pub resolved_with_change_id: Option<String>,
    pub created_at_ms: i64,
    pub resolved_at_ms: Option<i64>,
}

impl Conflict {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.entity_id, &self.file_id, &self.schema_key)
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved_with_change_id.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionDiff {
    pub key: EntityKey,
    pub left_change_id: Option<String>,
    pub right_change_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateVersionRequest {
    pub name: String,
    /// Version whose last commit the new version starts from. Defaults to the active version.
    pub from_version_id: Option<String>,
    /// Defaults to `global`.
    pub inherits_from_version_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitRequest {
    /// Defaults to the active version.
    pub version_id: Option<String>,
    pub author: String,
    pub message: String,
    pub labels: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeRequest {
    pub source_version_id: String,
    pub target_version_id: String,
    pub policy: MergePolicy,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub inserted: usize,
    pub source_wins: usize,
    pub convergent: usize,
    pub already_present: usize,
    /// Changes copied over from another store.
    pub copied_changes: usize,
    pub conflicts: Vec<Conflict>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ResolveWith {
    /// Make an existing change current.
    Change(String),
    /// Write a new value descending from both conflicting changes.
    Value(Value),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileRecord {
    pub id: String,
    pub path: String,
    pub data: Vec<u8>,
    pub metadata: Option<String>,
    pub updated_at_ms: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueEntry {
    pub id: i64,
    pub file_id: String,
    pub path: String,
    pub version_id: String,
    pub before_data: Option<Vec<u8>>,
    pub after_data: Vec<u8>,
    pub enqueued_at_ms: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SettleOutcome {
    pub entry_id: i64,
    pub file_id: String,
    pub plugin_key: Option<String>,
    pub changes_written: usize,
}
