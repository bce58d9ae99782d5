#![forbid(unsafe_code)]

use super::server::SyncServer;
use super::wire::{
    ErrorBody, PullRequest, PullResponse, PushRequest, PushResponse, SyncRoute, WireResponse,
};
use crate::SyncError;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;

/// Carries sync requests to a remote store.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn push(&self, request: &PushRequest) -> Result<PushResponse, SyncError>;
    async fn pull(&self, request: &PullRequest) -> Result<PullResponse, SyncError>;
}

/// In-process transport to a [`SyncServer`]. Requests still go through JSON encoding so both
/// sides see exactly what a network peer would send.
#[derive(Clone, Debug)]
pub struct LoopbackTransport {
    server: Arc<SyncServer>,
}

impl LoopbackTransport {
    pub fn new(server: Arc<SyncServer>) -> Self {
        Self { server }
    }

    async fn round_trip<Req: Serialize + Sync, Resp: DeserializeOwned>(
        &self,
        route: SyncRoute,
        request: &Req,
    ) -> Result<Resp, SyncError> {
        let body = serde_json::to_vec(request)?;
        let response = self.server.handle(route, &body).await;
        decode_response(route, response)
    }
}

#[async_trait]
impl SyncTransport for LoopbackTransport {
    async fn push(&self, request: &PushRequest) -> Result<PushResponse, SyncError> {
        self.round_trip(SyncRoute::Push, request).await
    }

    async fn pull(&self, request: &PullRequest) -> Result<PullResponse, SyncError> {
        self.round_trip(SyncRoute::Pull, request).await
    }
}

/// Maps a status and body to the typed response or a [`SyncError::Rejected`].
pub(crate) fn decode_response<T: DeserializeOwned>(
    route: SyncRoute,
    response: WireResponse,
) -> Result<T, SyncError> {
    if response.is_success() {
        return Ok(serde_json::from_slice(&response.body)?);
    }
    let body = serde_json::from_slice::<ErrorBody>(&response.body).unwrap_or_else(|_| {
        ErrorBody::new(
            "unknown",
            format!("{} answered {} without an error body", route.path(), response.status),
        )
    });
    Err(SyncError::Rejected {
        status: response.status,
        code: body.code,
        message: body.message,
    })
}
