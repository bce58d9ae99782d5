#![forbid(unsafe_code)]

//! Embedded change-control engine on SQLite.
//!
//! Every write becomes an immutable, content-addressed change in a per-entity graph. Versions
//! point into that graph through change sets, reads go through a per-schema cache, and stores
//! exchange rows through a replication log.

mod store;

pub use store::*;
