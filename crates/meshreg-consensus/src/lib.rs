//! meshreg consensus substrate.
//!
//! The meta tier treats consensus as a black box that yields a leader
//! and a monotonic epoch. This crate defines that box and ships a local
//! single-writer implementation.
//!
//! # Architecture
//!
//! - **`typ`** — `Change` payloads and `Committed` log entries
//! - **`log_store`** — redb-backed commit log replayed on restart
//! - **`substrate`** — the `Consensus` trait and `LocalConsensus`

pub mod log_store;
pub mod substrate;
pub mod typ;

pub use log_store::CommitLog;
pub use substrate::{Consensus, LocalConsensus, SharedConsensus};
pub use typ::{Change, Committed};
