#![forbid(unsafe_code)]

//! Background settlement of the file queue.
//!
//! The worker drains the queue oldest entry first, in batches, and publishes the pending count
//! after every batch. A failing entry blocks the queue and is retried after a backoff. Because
//! the queue lives in the store, a restarted worker resumes from the oldest unsettled entry.

use crate::{QueueWorkerConfig, RunnerError, SharedStore};
use lix_storage::{QueueEntry, SqliteStore, StoreError};
use std::sync::Arc;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

/// Handle to a running worker. Dropping it stops the worker after its current batch.
#[derive(Debug)]
pub struct QueueWorker {
    store: SharedStore,
    pending: watch::Receiver<usize>,
    wake: Arc<Notify>,
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl QueueWorker {
    pub async fn spawn(store: SharedStore, config: QueueWorkerConfig) -> Result<Self, RunnerError> {
        let initial = store.lock().await.pending_count()?;
        let (pending_tx, pending) = watch::channel(initial);
        let (stop, stop_rx) = watch::channel(false);
        let wake = Arc::new(Notify::new());
        let handle = tokio::spawn(run(
            store.clone(),
            config,
            pending_tx,
            wake.clone(),
            stop_rx,
        ));
        tracing::debug!(pending = initial, "queue worker started");
        Ok(Self {
            store,
            pending,
            wake,
            stop,
            handle,
        })
    }

    /// Writes a file through the shared store and wakes the worker.
    pub async fn write_file(
        &self,
        path: &str,
        data: &[u8],
        version_id: Option<&str>,
    ) -> Result<Option<QueueEntry>, RunnerError> {
        let entry = self.store.lock().await.write_file(path, data, version_id)?;
        if entry.is_some() {
            self.wake();
        }
        Ok(entry)
    }

    /// Asks the worker to check the queue now instead of after its poll interval.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Pending count as of the worker's last batch.
    pub fn pending(&self) -> usize {
        *self.pending.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.pending.clone()
    }

    /// Resolves once the queue is empty. Dropping the future leaves the worker running.
    ///
    /// The worker is woken once; after that its own schedule drives retries, so a failing
    /// entry is retried at `retry_backoff` pace however long the caller waits.
    pub async fn settled(&self) -> Result<(), RunnerError> {
        let mut pending = self.pending.clone();
        let mut woken = false;
        loop {
            pending.borrow_and_update();
            if self.store.lock().await.pending_count()? == 0 {
                return Ok(());
            }
            if !woken {
                self.wake();
                woken = true;
            }
            pending.changed().await.map_err(|_| RunnerError::Stopped)?;
        }
    }

    pub async fn shutdown(self) -> Result<(), RunnerError> {
        self.stop.send_replace(true);
        self.wake.notify_one();
        self.handle
            .await
            .map_err(|err| RunnerError::Join(err.to_string()))?;
        tracing::debug!("queue worker stopped");
        Ok(())
    }
}

async fn run(
    store: SharedStore,
    config: QueueWorkerConfig,
    pending: watch::Sender<usize>,
    wake: Arc<Notify>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        let step = {
            let mut guard = store.lock().await;
            let drained = drain_batch(&mut guard, config.batch_size);
            let remaining = guard.pending_count();
            (drained, remaining)
        };
        let delay = match step {
            (Ok(_), Ok(0)) => {
                pending.send_replace(0);
                config.poll_interval
            }
            (Ok(settled), Ok(remaining)) => {
                pending.send_replace(remaining);
                if settled == 0 {
                    config.poll_interval
                } else {
                    std::time::Duration::ZERO
                }
            }
            (Err(err), remaining) => {
                tracing::warn!(error = %err, code = err.code(), "queue settlement failed");
                if let Ok(remaining) = remaining {
                    pending.send_replace(remaining);
                }
                config.retry_backoff
            }
            (Ok(_), Err(err)) => {
                tracing::warn!(error = %err, "queue count failed");
                config.retry_backoff
            }
        };

        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = wake.notified() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Settles up to `limit` entries. Stops at the first failure; earlier entries stay settled.
fn drain_batch(store: &mut SqliteStore, limit: usize) -> Result<usize, StoreError> {
    let mut settled = 0usize;
    while settled < limit {
        match store.settle_next()? {
            Some(outcome) => {
                tracing::debug!(
                    entry_id = outcome.entry_id,
                    changes = outcome.changes_written,
                    "queue entry applied"
                );
                settled += 1;
            }
            None => break,
        }
    }
    Ok(settled)
}
