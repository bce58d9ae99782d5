#![forbid(unsafe_code)]

//! Long-lived async tasks around a [`lix_storage::SqliteStore`]: the file queue worker and the
//! sync protocol (wire types, server handler, transports and the push/pull client).
//!
//! The store itself is synchronous. Tasks share it through [`SharedStore`] and only hold the
//! lock for the duration of one storage call, never across network I/O.

mod config;
mod error;
mod queue_worker;
pub mod sync;

pub use config::{QueueWorkerConfig, SyncConfig, SyncServerConfig};
pub use error::{RunnerError, SyncError};
pub use queue_worker::QueueWorker;
pub use sync::{
    ErrorBody, LoopbackTransport, PullOutcome, PullRequest, PullResponse, PushOutcome,
    PushRequest, PushResponse, Rejection, SyncClient, SyncRoute, SyncServer, SyncSummary,
    SyncTransport, WireResponse,
};

use lix_storage::SqliteStore;
use std::sync::Arc;
use tokio::sync::Mutex;

pub type SharedStore = Arc<Mutex<SqliteStore>>;

pub fn shared(store: SqliteStore) -> SharedStore {
    Arc::new(Mutex::new(store))
}
