#![forbid(unsafe_code)]

use lix_storage::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("peer rejected the request ({status} {code}): {message}")]
    Rejected {
        status: u16,
        code: String,
        message: String,
    },
    #[error("transport: {0}")]
    Transport(String),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    pub fn code(&self) -> &str {
        match self {
            Self::Store(err) => err.code(),
            Self::Rejected { code, .. } => code,
            Self::Transport(_) => "TRANSPORT",
            Self::Json(_) => "JSON",
        }
    }

    /// Whether retrying the same request later can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Rejected { status, .. } => *status >= 500,
            Self::Store(_) | Self::Json(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("queue worker stopped")]
    Stopped,
    #[error("queue worker task failed: {0}")]
    Join(String),
}
