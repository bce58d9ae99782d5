#![forbid(unsafe_code)]

use super::wire::{
    BAD_REQUEST, ErrorBody, INTERNAL, PullRequest, PullResponse, PushRequest, PushResponse,
    SyncRoute, TOKEN_CONFLICT, UNAUTHORIZED, WireResponse,
};
use crate::{SharedStore, SyncServerConfig};
use lix_storage::StoreError;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// A refused request: HTTP-style status plus `{code, message}`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rejection {
    pub status: u16,
    pub body: ErrorBody,
}

impl Rejection {
    fn new(status: u16, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody::new(code, message),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, BAD_REQUEST, message)
    }
}

/// Server side of the sync protocol over a shared store.
#[derive(Clone, Debug)]
pub struct SyncServer {
    store: SharedStore,
    config: SyncServerConfig,
}

impl SyncServer {
    pub fn new(store: SharedStore, config: SyncServerConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Decodes a JSON request body, dispatches it and encodes the answer.
    pub async fn handle(&self, route: SyncRoute, body: &[u8]) -> WireResponse {
        match route {
            SyncRoute::Push => match decode::<PushRequest>(body) {
                Ok(request) => respond(self.push(request).await),
                Err(rejection) => respond::<PushResponse>(Err(rejection)),
            },
            SyncRoute::Pull => match decode::<PullRequest>(body) {
                Ok(request) => respond(self.pull(request).await),
                Err(rejection) => respond::<PullResponse>(Err(rejection)),
            },
        }
    }

    /// Ingests pushed rows. The client's token must not claim anything this store lacks.
    pub async fn push(&self, request: PushRequest) -> Result<PushResponse, Rejection> {
        self.authorize(&request.store_id)?;
        let mut store = self.store.lock().await;
        let clock = store.causality_token().map_err(store_rejection)?;
        if !clock.dominates(&request.causality_token) {
            tracing::warn!(
                store_id = %request.store_id,
                claimed = %request.causality_token.encode(),
                local = %clock.encode(),
                "push rejected: token claims unseen rows"
            );
            return Err(Rejection::new(
                409,
                TOKEN_CONFLICT,
                "causality token covers rows this store never received",
            ));
        }

        let applied = store.ingest_rows(&request.rows).map_err(|err| {
            tracing::warn!(store_id = %request.store_id, error = %err, "push rejected");
            store_rejection(err)
        })?;
        let causality_token = store.causality_token().map_err(store_rejection)?;
        tracing::info!(
            store_id = %request.store_id,
            received = request.rows.len(),
            applied,
            "push accepted"
        );
        Ok(PushResponse { causality_token })
    }

    /// Rows the caller's token does not cover, oldest first.
    pub async fn pull(&self, request: PullRequest) -> Result<PullResponse, Rejection> {
        self.authorize(&request.store_id)?;
        let limit = match self.config.max_pull_limit {
            Some(max) => request.limit.clamp(1, max),
            None => request.limit.max(1),
        };
        let store = self.store.lock().await;
        let batch = store
            .unsynced_rows(&request.causality_token, limit)
            .map_err(store_rejection)?;
        tracing::debug!(
            store_id = %request.store_id,
            rows = batch.rows.len(),
            has_more = batch.has_more,
            "pull served"
        );
        Ok(PullResponse {
            rows: batch.rows,
            causality_token: batch.causality_token,
            has_more: batch.has_more,
        })
    }

    fn authorize(&self, store_id: &str) -> Result<(), Rejection> {
        if store_id.trim().is_empty() {
            return Err(Rejection::bad_request("store_id is required"));
        }
        if !self.config.is_allowed(store_id) {
            tracing::warn!(store_id, "sync request from unknown store");
            return Err(Rejection::new(403, UNAUTHORIZED, "store is not allowed to sync"));
        }
        Ok(())
    }
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, Rejection> {
    serde_json::from_slice(body).map_err(|err| Rejection::bad_request(err.to_string()))
}

fn respond<T: Serialize>(result: Result<T, Rejection>) -> WireResponse {
    let (status, encoded) = match result {
        Ok(body) => (200, serde_json::to_vec(&body)),
        Err(rejection) => (rejection.status, serde_json::to_vec(&rejection.body)),
    };
    match encoded {
        Ok(body) => WireResponse { status, body },
        Err(err) => WireResponse {
            status: 500,
            body: format!(r#"{{"code":"{INTERNAL}","message":"{}"}}"#, err.to_string().replace('"', "'"))
                .into_bytes(),
        },
    }
}

/// Rows that break the receiving store's invariants are the caller's fault; anything else is
/// an internal failure.
fn store_rejection(err: StoreError) -> Rejection {
    match err {
        StoreError::GraphInvariant { .. }
        | StoreError::SchemaViolation { .. }
        | StoreError::UnknownSchema { .. }
        | StoreError::InvalidInput(_)
        | StoreError::Json(_) => Rejection::bad_request(err.to_string()),
        other => Rejection::new(500, INTERNAL, other.to_string()),
    }
}
