//! Consensus substrate interface.
//!
//! The meta tier never talks to a concrete consensus protocol. Lease and
//! slot mutations go through [`Consensus::propose`], which returns the
//! epoch the change was committed at. Only the leader accepts proposals.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use meshreg_core::{Epoch, NodeIdentity, RegistryError, RegistryResult};

use crate::log_store::CommitLog;
use crate::typ::{Change, Committed};

/// Single-writer replication substrate consumed by the meta tier.
#[async_trait]
pub trait Consensus: Send + Sync {
    /// Replicate `change` and return the epoch it was committed at.
    ///
    /// Fails with `RegistryError::Leadership` on a non-leader replica.
    async fn propose(&self, change: Change) -> RegistryResult<Epoch>;

    /// Whether this replica currently leads.
    fn is_leader(&self) -> bool;

    /// Identity of the current leader, if one is known.
    fn current_leader(&self) -> Option<NodeIdentity>;

    /// Epoch of the newest committed change.
    fn committed_epoch(&self) -> Epoch;

    /// Committed changes with an epoch greater than `after`.
    fn committed_after(&self, after: Epoch) -> RegistryResult<Vec<Committed>>;
}

/// Convenience alias for a shared substrate handle.
pub type SharedConsensus = Arc<dyn Consensus>;

/// Local substrate that commits synchronously into a redb log.
///
/// Leadership is assigned externally through [`LocalConsensus::set_leader`],
/// which lets tests and single-node deployments drive failover by hand.
pub struct LocalConsensus {
    local: NodeIdentity,
    leader: ArcSwapOption<NodeIdentity>,
    log: CommitLog,
    /// Serializes proposals so epochs are assigned without gaps.
    write_lock: Mutex<()>,
    epoch: AtomicU64,
}

impl LocalConsensus {
    /// Open a substrate over an existing log. Starts without a leader.
    pub fn open(local: NodeIdentity, log: CommitLog) -> RegistryResult<Self> {
        let epoch = log.last_epoch()?;
        info!(%local, epoch, "consensus substrate opened");
        Ok(Self {
            local,
            leader: ArcSwapOption::empty(),
            log,
            write_lock: Mutex::new(()),
            epoch: AtomicU64::new(epoch),
        })
    }

    /// A single-node substrate that leads itself, backed by an in-memory log.
    pub fn single_node(local: NodeIdentity) -> RegistryResult<Self> {
        let consensus = Self::open(local.clone(), CommitLog::open_in_memory()?)?;
        consensus.set_leader(Some(local));
        Ok(consensus)
    }

    /// Install the leader elected by the outside world.
    pub fn set_leader(&self, leader: Option<NodeIdentity>) {
        match &leader {
            Some(l) => info!(leader = %l, "leader changed"),
            None => info!("leader lost"),
        }
        self.leader.store(leader.map(Arc::new));
    }

    pub fn local(&self) -> &NodeIdentity {
        &self.local
    }
}

#[async_trait]
impl Consensus for LocalConsensus {
    async fn propose(&self, change: Change) -> RegistryResult<Epoch> {
        let _guard = self.write_lock.lock().await;

        if !self.is_leader() {
            return Err(RegistryError::Leadership {
                leader: self.current_leader().map(|l| l.address),
            });
        }

        let epoch = self.epoch.load(Ordering::Acquire) + 1;
        let kind = change.kind();
        self.log.append(&Committed { epoch, change })?;
        self.epoch.store(epoch, Ordering::Release);

        debug!(epoch, kind, "change committed");
        Ok(epoch)
    }

    fn is_leader(&self) -> bool {
        self.leader
            .load()
            .as_deref()
            .is_some_and(|leader| *leader == self.local)
    }

    fn current_leader(&self) -> Option<NodeIdentity> {
        self.leader.load_full().map(|l| (*l).clone())
    }

    fn committed_epoch(&self) -> Epoch {
        self.epoch.load(Ordering::Acquire)
    }

    fn committed_after(&self, after: Epoch) -> RegistryResult<Vec<Committed>> {
        self.log.entries_after(after)
    }
}
