#![forbid(unsafe_code)]

pub mod causality;
pub mod change;
pub mod graph;
pub mod ids;
pub mod labels;
pub mod merge;
pub mod plugin;
pub mod schema;
pub mod snapshot;

pub use causality::CausalityToken;
pub use change::{Change, DetectedChange, EntityKey, NewChange};
pub use graph::{
    ChangeGraph, ConflictId, ConflictIdError, GraphChange, GraphError, Membership, VersionGraph,
};
pub use ids::{
    FilePath, FilePathError, IdentifierError, VersionName, VersionNameError, canonical_identifier,
};
pub use labels::{CHECKPOINT_LABEL, LabelError, normalize_label, normalize_labels};
pub use merge::{
    ConflictReason, DetectedConflict, GraphView, MergeDecision, MergeOutcome, MergePlan,
    MergePolicy, lowest_common_ancestor, plan_merge,
};
pub use plugin::{FileDescriptor, Plugin, PluginError, PluginRegistry, glob_match};
pub use schema::{JsonType, PropertySchema, SchemaDefinition, SchemaError};
pub use snapshot::{canonical_json, sha256_hex, snapshot_id};

/// Version every other version inherits from unless told otherwise.
pub const GLOBAL_VERSION_ID: &str = "global";
pub const GLOBAL_VERSION_NAME: &str = "global";
pub const MAIN_VERSION_NAME: &str = "main";
