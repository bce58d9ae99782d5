#![forbid(unsafe_code)]

//! Push/pull replication between stores.
//!
//! A client keeps, per remote, the last causality token the remote acknowledged. Push sends
//! the local rows that token does not cover; pull sends the local clock and ingests what the
//! remote has beyond it. Tokens only move after the remote answered successfully, so an
//! interrupted round is simply repeated.

mod client;
mod server;
mod transport;
mod wire;

pub use client::{PullOutcome, PushOutcome, SyncClient, SyncSummary};
pub use server::{Rejection, SyncServer};
pub use transport::{LoopbackTransport, SyncTransport};
pub use wire::{
    ErrorBody, PullRequest, PullResponse, PushRequest, PushResponse, SyncRoute, WireResponse,
};
