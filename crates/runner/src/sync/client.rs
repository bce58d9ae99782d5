#![forbid(unsafe_code)]

use super::transport::SyncTransport;
use super::wire::{PullRequest, PushRequest};
use crate::{SharedStore, SyncConfig, SyncError};
use lix_core::CausalityToken;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PushOutcome {
    pub sent: usize,
    pub has_more: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PullOutcome {
    pub received: usize,
    pub applied: usize,
    pub has_more: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub rounds: usize,
    pub pushed: usize,
    pub pulled: usize,
    pub applied: usize,
    /// Both directions drained before `max_rounds` ran out.
    pub idle: bool,
}

/// Replicates the local store with one remote.
///
/// `remote` names the peer locally; the last token it acknowledged is stored under that name.
pub struct SyncClient<T> {
    store: SharedStore,
    transport: T,
    remote: String,
    config: SyncConfig,
}

impl<T: SyncTransport> SyncClient<T> {
    pub fn new(store: SharedStore, transport: T, remote: impl Into<String>, config: SyncConfig) -> Self {
        Self {
            store,
            transport,
            remote: remote.into(),
            config,
        }
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// What the remote is known to hold.
    pub async fn acknowledged(&self) -> Result<CausalityToken, SyncError> {
        Ok(self.store.lock().await.peer_token(&self.remote)?)
    }

    /// Drops the stored token so the next push resends everything. Used after a
    /// `token_conflict`, e.g. when the remote was restored from an older image.
    pub async fn forget_remote(&self) -> Result<(), SyncError> {
        self.store
            .lock()
            .await
            .set_peer_token(&self.remote, &CausalityToken::new())?;
        tracing::info!(remote = %self.remote, "sync token reset");
        Ok(())
    }

    /// Sends one batch of rows the remote has not acknowledged.
    pub async fn push_once(&self) -> Result<PushOutcome, SyncError> {
        let (request, has_more) = {
            let store = self.store.lock().await;
            let acknowledged = store.peer_token(&self.remote)?;
            let batch = store.unsynced_rows(&acknowledged, self.config.batch_limit)?;
            if batch.rows.is_empty() {
                return Ok(PushOutcome::default());
            }
            let request = PushRequest {
                store_id: store.store_id().to_string(),
                causality_token: acknowledged,
                rows: batch.rows,
            };
            (request, batch.has_more)
        };

        let response = self.transport.push(&request).await.inspect_err(|err| {
            tracing::warn!(remote = %self.remote, code = err.code(), error = %err, "push failed");
        })?;

        let acknowledged = request.causality_token.merge(&response.causality_token);
        self.store
            .lock()
            .await
            .set_peer_token(&self.remote, &acknowledged)?;
        tracing::info!(remote = %self.remote, rows = request.rows.len(), has_more, "push acknowledged");
        Ok(PushOutcome {
            sent: request.rows.len(),
            has_more,
        })
    }

    /// Fetches and ingests one batch of rows the local store lacks.
    pub async fn pull_once(&self) -> Result<PullOutcome, SyncError> {
        let request = {
            let store = self.store.lock().await;
            PullRequest {
                store_id: store.store_id().to_string(),
                causality_token: store.causality_token()?,
                limit: self.config.batch_limit,
            }
        };

        let response = self.transport.pull(&request).await.inspect_err(|err| {
            tracing::warn!(remote = %self.remote, code = err.code(), error = %err, "pull failed");
        })?;

        let mut store = self.store.lock().await;
        // The remote holds everything its clock covers, so the push side can skip those rows.
        let acknowledged = store.peer_token(&self.remote)?.merge(&response.causality_token);
        let applied = store.transact(|tx| {
            let applied = tx.ingest_rows(&response.rows)?;
            tx.set_peer_token(&self.remote, &acknowledged)?;
            Ok(applied)
        })?;
        if !response.rows.is_empty() {
            tracing::info!(
                remote = %self.remote,
                received = response.rows.len(),
                applied,
                has_more = response.has_more,
                "pull applied"
            );
        }
        Ok(PullOutcome {
            received: response.rows.len(),
            applied,
            has_more: response.has_more,
        })
    }

    /// Pulls then pushes until neither side has rows left or `max_rounds` is reached.
    pub async fn sync_until_idle(&self) -> Result<SyncSummary, SyncError> {
        let mut summary = SyncSummary::default();
        while summary.rounds < self.config.max_rounds {
            summary.rounds += 1;
            let pulled = self.pull_once().await?;
            let pushed = self.push_once().await?;
            summary.pulled += pulled.received;
            summary.applied += pulled.applied;
            summary.pushed += pushed.sent;
            if !pulled.has_more && !pushed.has_more {
                summary.idle = true;
                break;
            }
        }
        tracing::info!(
            remote = %self.remote,
            rounds = summary.rounds,
            pushed = summary.pushed,
            pulled = summary.pulled,
            idle = summary.idle,
            "sync finished"
        );
        Ok(summary)
    }
}
