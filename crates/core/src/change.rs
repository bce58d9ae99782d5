#![forbid(unsafe_code)]

use crate::ids::{IdentifierError, canonical_identifier};
use crate::snapshot::{canonical_json, sha256_hex};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identity of one tracked entity: at most one change per key is current in a version.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_id: String,
    pub file_id: String,
    pub schema_key: String,
}

impl EntityKey {
    pub fn new(
        entity_id: impl Into<String>,
        file_id: impl Into<String>,
        schema_key: impl Into<String>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            file_id: file_id.into(),
            schema_key: schema_key.into(),
        }
    }

    pub fn canonicalize(&self) -> Result<Self, IdentifierError> {
        Ok(Self {
            entity_id: canonical_identifier("entity_id", &self.entity_id)?,
            file_id: canonical_identifier("file_id", &self.file_id)?,
            schema_key: canonical_identifier("schema_key", &self.schema_key)?,
        })
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.schema_key, self.file_id, self.entity_id)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub id: String,
    pub entity_id: String,
    pub file_id: String,
    pub schema_key: String,
    pub schema_version: String,
    pub plugin_key: String,
    /// `None` marks a tombstone.
    pub snapshot_id: Option<String>,
    pub created_at_ms: i64,
}

impl Change {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.entity_id, &self.file_id, &self.schema_key)
    }

    pub fn is_tombstone(&self) -> bool {
        self.snapshot_id.is_none()
    }
}

/// A change that has not been written yet. Its id is derived from its content and parents.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewChange {
    pub key: EntityKey,
    pub schema_version: String,
    pub plugin_key: String,
    pub snapshot_id: Option<String>,
    pub parents: Vec<String>,
}

impl NewChange {
    pub fn sorted_parents(&self) -> Vec<String> {
        let mut parents = self.parents.clone();
        parents.sort();
        parents.dedup();
        parents
    }

    pub fn content_id(&self) -> String {
        let payload = serde_json::json!([
            "lix.change.v1",
            self.key.entity_id,
            self.key.file_id,
            self.key.schema_key,
            self.schema_version,
            self.plugin_key,
            self.snapshot_id,
            self.sorted_parents(),
        ]);
        sha256_hex(canonical_json(&payload).as_bytes())
    }

    pub fn into_change(self, created_at_ms: i64) -> Change {
        Change {
            id: self.content_id(),
            entity_id: self.key.entity_id,
            file_id: self.key.file_id,
            schema_key: self.key.schema_key,
            schema_version: self.schema_version,
            plugin_key: self.plugin_key,
            snapshot_id: self.snapshot_id,
            created_at_ms,
        }
    }
}

/// Entity-level change reported by a plugin (or handed to one for materialization).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectedChange {
    pub entity_id: String,
    pub schema_key: String,
    pub schema_version: String,
    /// `None` means the entity was removed from the file.
    pub snapshot: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_change(parents: Vec<&str>, snapshot: Option<&str>) -> NewChange {
        NewChange {
            key: EntityKey::new("e1", "f1", "todo"),
            schema_version: "1".to_string(),
            plugin_key: "lix_own_entity".to_string(),
            snapshot_id: snapshot.map(str::to_string),
            parents: parents.into_iter().map(str::to_string).collect(),
        }
    }

    #[test]
    fn content_id_is_stable_under_parent_order() {
        let left = new_change(vec!["p2", "p1"], Some("s1"));
        let right = new_change(vec!["p1", "p2", "p1"], Some("s1"));
        assert_eq!(left.content_id(), right.content_id());
    }

    #[test]
    fn content_id_distinguishes_tombstones_and_parents() {
        let live = new_change(vec!["p1"], Some("s1"));
        let tomb = new_change(vec!["p1"], None);
        let orphan = new_change(vec![], Some("s1"));
        assert_ne!(live.content_id(), tomb.content_id());
        assert_ne!(live.content_id(), orphan.content_id());
        assert!(tomb.into_change(0).is_tombstone());
    }
}
