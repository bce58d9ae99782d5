#![forbid(unsafe_code)]

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("schema violation (schema={schema_key}, entity={entity_id}): {reason}")]
    SchemaViolation {
        schema_key: String,
        entity_id: String,
        reason: String,
    },
    #[error("unknown schema {schema_key}@{schema_version}")]
    UnknownSchema {
        schema_key: String,
        schema_version: String,
    },
    #[error("graph invariant violated by {operation} (entity={entity_id}): {reason}")]
    GraphInvariant {
        operation: &'static str,
        entity_id: String,
        reason: String,
    },
    #[error("unknown version {0}")]
    UnknownVersion(String),
    #[error("version already exists: {0}")]
    VersionAlreadyExists(String),
    #[error("unknown change {0}")]
    UnknownChange(String),
    #[error("unknown change set {0}")]
    UnknownChangeSet(String),
    #[error("unknown conflict {0}")]
    UnknownConflict(String),
    #[error("conflict already resolved")]
    ConflictAlreadyResolved,
    #[error("entity already exists: {entity_id}")]
    EntityExists { entity_id: String },
    #[error("unknown entity: {entity_id}")]
    UnknownEntity { entity_id: String },
    #[error("version inheritance cycle")]
    InheritanceCycle,
    #[error("version inheritance depth exceeded")]
    InheritanceDepthExceeded,
    #[error("plugin {plugin_key} failed: {message}")]
    Plugin { plugin_key: String, message: String },
    #[error("reset required: {0}")]
    ResetRequired(&'static str),
}

impl StoreError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Io(_) => "IO",
            Self::Sql(_) => "SQL",
            Self::Json(_) => "JSON",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::SchemaViolation { .. } => "SCHEMA_VIOLATION",
            Self::UnknownSchema { .. } => "UNKNOWN_SCHEMA",
            Self::GraphInvariant { .. } => "GRAPH_INVARIANT",
            Self::UnknownVersion(_) => "UNKNOWN_VERSION",
            Self::VersionAlreadyExists(_) => "VERSION_ALREADY_EXISTS",
            Self::UnknownChange(_) => "UNKNOWN_CHANGE",
            Self::UnknownChangeSet(_) => "UNKNOWN_CHANGE_SET",
            Self::UnknownConflict(_) => "UNKNOWN_CONFLICT",
            Self::ConflictAlreadyResolved => "CONFLICT_ALREADY_RESOLVED",
            Self::EntityExists { .. } => "ENTITY_EXISTS",
            Self::UnknownEntity { .. } => "UNKNOWN_ENTITY",
            Self::InheritanceCycle => "INHERITANCE_CYCLE",
            Self::InheritanceDepthExceeded => "INHERITANCE_DEPTH_EXCEEDED",
            Self::Plugin { .. } => "PLUGIN_FAILED",
            Self::ResetRequired(_) => "RESET_REQUIRED",
        }
    }

    pub(crate) fn graph(operation: &'static str, entity_id: &str, reason: impl ToString) -> Self {
        Self::GraphInvariant {
            operation,
            entity_id: entity_id.to_string(),
            reason: reason.to_string(),
        }
    }
}
