#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueWorkerConfig {
    /// Idle wait between queue checks when nobody wakes the worker.
    pub poll_interval: Duration,
    /// Entries settled per store lock.
    pub batch_size: usize,
    /// Wait after a failed settlement before the entry is retried.
    pub retry_backoff: Duration,
}

impl Default for QueueWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            batch_size: 32,
            retry_backoff: Duration::from_secs(1),
        }
    }
}

impl QueueWorkerConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncConfig {
    /// Rows per push or pull request.
    pub batch_limit: usize,
    /// Upper bound on push/pull rounds in one `sync_until_idle` call.
    pub max_rounds: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_limit: 500,
            max_rounds: 64,
        }
    }
}

impl SyncConfig {
    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = limit.max(1);
        self
    }

    pub fn with_max_rounds(mut self, rounds: usize) -> Self {
        self.max_rounds = rounds.max(1);
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncServerConfig {
    /// When set, only these store ids may push or pull.
    pub allowed_stores: Option<BTreeSet<String>>,
    /// Cap on rows returned by one pull, whatever the client asks for.
    pub max_pull_limit: Option<usize>,
}

impl SyncServerConfig {
    pub fn allow_store(mut self, store_id: impl Into<String>) -> Self {
        self.allowed_stores
            .get_or_insert_with(BTreeSet::new)
            .insert(store_id.into());
        self
    }

    pub fn with_max_pull_limit(mut self, limit: usize) -> Self {
        self.max_pull_limit = Some(limit.max(1));
        self
    }

    pub fn is_allowed(&self, store_id: &str) -> bool {
        self.allowed_stores
            .as_ref()
            .is_none_or(|allowed| allowed.contains(store_id))
    }
}
