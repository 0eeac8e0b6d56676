//! meshreg-core — shared types for the meshreg service registry.
//!
//! The registry is split into three tiers: meta nodes own membership
//! and the slot table, data nodes own the sharded registry data, and
//! session nodes front client connections. This crate holds what all
//! three agree on:
//!
//! - **`types`** — node identities, slot tables, datums, subscribers
//! - **`error`** — the `RegistryError` taxonomy
//! - **`rpc`** — heartbeat and provide-data messages
//! - **`config`** — `meshreg.toml` parsing

pub mod config;
pub mod error;
pub mod rpc;
pub mod types;

pub use config::{MetaConfig, NodeConfig, RegistryConfig, SessionConfig};
pub use error::{RegistryError, RegistryResult};
pub use types::*;
