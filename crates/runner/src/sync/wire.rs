#![forbid(unsafe_code)]

use lix_core::CausalityToken;
use lix_storage::SyncRow;
use serde::{Deserialize, Serialize};

pub const TOKEN_CONFLICT: &str = "token_conflict";
pub const UNAUTHORIZED: &str = "unauthorized";
pub const BAD_REQUEST: &str = "bad_request";
pub const INTERNAL: &str = "internal";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SyncRoute {
    Push,
    Pull,
}

impl SyncRoute {
    pub fn path(self) -> &'static str {
        match self {
            Self::Push => "/push",
            Self::Pull => "/pull",
        }
    }

    pub fn from_path(path: &str) -> Option<Self> {
        match path {
            "/push" => Some(Self::Push),
            "/pull" => Some(Self::Pull),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    pub store_id: String,
    /// The client's last acknowledged view of the server.
    pub causality_token: CausalityToken,
    pub rows: Vec<SyncRow>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushResponse {
    pub causality_token: CausalityToken,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub store_id: String,
    /// Everything the client already holds.
    pub causality_token: CausalityToken,
    pub limit: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PullResponse {
    pub rows: Vec<SyncRow>,
    pub causality_token: CausalityToken,
    pub has_more: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl ErrorBody {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Status plus JSON body, as a server answers one request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WireResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl WireResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}
