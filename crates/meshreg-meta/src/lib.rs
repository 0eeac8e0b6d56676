//! meshreg-meta — the meta tier of the meshreg registry.
//!
//! Meta nodes track which session and data nodes are alive and which
//! data node owns each slot of the key space.
//!
//! # Architecture
//!
//! - **`lease`** — immutable lease snapshots behind an atomic reference
//! - **`manager`** — `LeaseManager`: register/renew/evict through consensus
//! - **`slot`** — deterministic slot rebalancer and `SlotTableManager`
//! - **`heartbeat`** — heartbeat handler shaping replies by node type
//! - **`provide_data`** — versioned provide-data records
//! - **`sweeper`** — periodic eviction of expired leases
//! - **`server`** — axum RPC router

pub mod heartbeat;
pub mod lease;
pub mod manager;
pub mod provide_data;
pub mod server;
pub mod slot;
pub mod sweeper;

pub use heartbeat::{HeartbeatHandler, build_response};
pub use lease::{Lease, LeaseSnapshot, LeaseStore};
pub use manager::LeaseManager;
pub use provide_data::ProvideDataRegistry;
pub use server::{MetaState, build_router};
pub use slot::{SlotTableManager, compute_slot_table, rebalance};
pub use sweeper::{run_sweeper, sweep_once};
