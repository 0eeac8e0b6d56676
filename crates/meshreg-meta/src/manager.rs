//! Lease manager — register, renew, evict and list cluster nodes.
//!
//! Membership changes (join, leave, eviction) are proposed to the
//! consensus substrate and applied to the lease store only after commit,
//! so every meta replica converges on the same membership and epoch.
//! Pure deadline refreshes are applied locally on the leader without a
//! consensus round.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use meshreg_consensus::{Change, Committed, SharedConsensus};
use meshreg_core::{Epoch, MetaConfig, NodeIdentity, NodeType, RegistryError, RegistryResult};

use crate::lease::{Lease, LeaseSnapshot, LeaseStore};

/// Owns the lease store and funnels its mutations through consensus.
pub struct LeaseManager {
    consensus: SharedConsensus,
    store: LeaseStore,
    config: MetaConfig,
    /// Serializes writers. Holds the newest log epoch this manager has applied.
    applied: Mutex<Epoch>,
}

impl LeaseManager {
    pub fn new(consensus: SharedConsensus, config: MetaConfig) -> Self {
        Self {
            consensus,
            store: LeaseStore::new(),
            config,
            applied: Mutex::new(0),
        }
    }

    /// Register a node, or refresh its lease if it already holds one.
    pub async fn register(&self, node: &NodeIdentity, requested: Duration) -> RegistryResult<Lease> {
        let mut applied = self.applied.lock().await;
        self.ensure_leader()?;
        let duration = self.config.clamp_lease(requested);

        let snapshot = self.store.load();
        if let Some(existing) = snapshot.get(node) {
            let lease = existing.renewed(duration);
            self.store
                .replace(snapshot.with_lease(lease.clone(), snapshot.epoch));
            debug!(%node, "register refreshed existing lease");
            return Ok(lease);
        }

        let change = Change::Register {
            node: node.clone(),
            lease_secs: duration.as_secs(),
        };
        let epoch = self.consensus.propose(change.clone()).await?;
        self.apply(&Committed { epoch, change });
        *applied = epoch;

        info!(%node, epoch, lease = ?duration, "node registered");
        self.store
            .load()
            .get(node)
            .cloned()
            .ok_or_else(|| RegistryError::LeaseNotFound(node.clone()))
    }

    /// Extend a node's lease to `now + requested` (clamped).
    ///
    /// Returns the current cluster epoch. A renewal never changes
    /// membership, so it never advances the epoch.
    pub async fn renew(&self, node: &NodeIdentity, requested: Duration) -> RegistryResult<Epoch> {
        let _applied = self.applied.lock().await;
        self.ensure_leader()?;

        let snapshot = self.store.load();
        let existing = snapshot
            .get(node)
            .ok_or_else(|| RegistryError::LeaseNotFound(node.clone()))?;

        let lease = existing.renewed(self.config.clamp_lease(requested));
        self.store
            .replace(snapshot.with_lease(lease, snapshot.epoch));
        Ok(self.get_epoch())
    }

    /// Remove a node's lease because it expired.
    pub async fn evict(&self, node: &NodeIdentity) -> RegistryResult<Epoch> {
        self.remove(node, Change::Evict { node: node.clone() }).await
    }

    /// Remove a node's lease because it left gracefully.
    pub async fn deregister(&self, node: &NodeIdentity) -> RegistryResult<Epoch> {
        self.remove(node, Change::Deregister { node: node.clone() }).await
    }

    async fn remove(&self, node: &NodeIdentity, change: Change) -> RegistryResult<Epoch> {
        let mut applied = self.applied.lock().await;
        self.ensure_leader()?;
        if !self.store.load().contains(node) {
            return Err(RegistryError::LeaseNotFound(node.clone()));
        }

        let kind = change.kind();
        let epoch = self.consensus.propose(change.clone()).await?;
        self.apply(&Committed { epoch, change });
        *applied = epoch;

        info!(%node, epoch, kind, "node removed");
        Ok(epoch)
    }

    /// Evict every node whose deadline has passed.
    ///
    /// Runs on each sweep. Failures are logged and retried next cycle.
    /// Returns the nodes actually evicted.
    pub async fn evict_expired(&self) -> Vec<NodeIdentity> {
        if !self.consensus.is_leader() {
            debug!("not leader, skipping lease sweep");
            return Vec::new();
        }

        let candidates = self.store.load().expired(Instant::now());
        let mut evicted = Vec::new();

        for node in candidates {
            // A renewal may have landed since the snapshot was taken.
            let still_expired = self
                .store
                .load()
                .get(&node)
                .is_some_and(|l| l.is_expired(Instant::now()));
            if !still_expired {
                continue;
            }

            match self.evict(&node).await {
                Ok(epoch) => {
                    warn!(%node, epoch, "evicted expired lease");
                    evicted.push(node);
                }
                Err(RegistryError::LeaseNotFound(_)) => {}
                Err(e) => {
                    warn!(%node, error = %e, "lease eviction failed, retrying next sweep");
                }
            }
        }

        evicted
    }

    /// Apply committed changes this manager has not seen yet.
    ///
    /// Used on startup to rebuild the lease store from the commit log,
    /// and by followers to catch up with the leader. Recovered leases get
    /// a fresh full-duration deadline.
    pub async fn recover(&self) -> RegistryResult<usize> {
        let mut applied = self.applied.lock().await;
        let entries = self.consensus.committed_after(*applied)?;
        let count = entries.len();
        for entry in &entries {
            self.apply(entry);
            *applied = entry.epoch;
        }
        if count > 0 {
            info!(entries = count, epoch = *applied, members = self.store.load().len(), "lease store caught up");
        }
        Ok(count)
    }

    fn apply(&self, committed: &Committed) {
        let snapshot = self.store.load();
        let next = match &committed.change {
            Change::Register { node, lease_secs } => {
                let lease = Lease::new(
                    node.clone(),
                    Duration::from_secs(*lease_secs),
                    committed.epoch,
                );
                snapshot.with_lease(lease, committed.epoch)
            }
            Change::Deregister { node } | Change::Evict { node } => {
                snapshot.without(node, committed.epoch)
            }
            Change::AssignSlots { .. } => return,
        };
        self.store.replace(next);
    }

    fn ensure_leader(&self) -> RegistryResult<()> {
        if self.consensus.is_leader() {
            Ok(())
        } else {
            Err(RegistryError::Leadership {
                leader: self.consensus.current_leader().map(|l| l.address),
            })
        }
    }

    /// Live nodes of every tier in registration order.
    pub fn get_cluster_members(&self) -> Vec<NodeIdentity> {
        self.store.load().members()
    }

    /// Live nodes of one tier in registration order.
    pub fn members_of(&self, node_type: NodeType) -> Vec<NodeIdentity> {
        self.store.load().members_of(node_type)
    }

    /// Current cluster epoch.
    pub fn get_epoch(&self) -> Epoch {
        self.consensus.committed_epoch()
    }

    pub fn get_lease(&self, node: &NodeIdentity) -> Option<Lease> {
        self.store.load().get(node).cloned()
    }

    /// The current lease snapshot.
    pub fn snapshot(&self) -> Arc<LeaseSnapshot> {
        self.store.load()
    }

    pub fn is_leader(&self) -> bool {
        self.consensus.is_leader()
    }

    pub fn current_leader(&self) -> Option<NodeIdentity> {
        self.consensus.current_leader()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshreg_consensus::{CommitLog, LocalConsensus};

    fn meta() -> NodeIdentity {
        NodeIdentity::meta("m1:9615", "zone-a")
    }

    fn data(addr: &str) -> NodeIdentity {
        NodeIdentity::data(addr, "zone-a")
    }

    fn manager() -> (Arc<LocalConsensus>, LeaseManager) {
        let consensus = Arc::new(LocalConsensus::single_node(meta()).unwrap());
        let mgr = LeaseManager::new(consensus.clone(), MetaConfig::default());
        (consensus, mgr)
    }

    #[tokio::test]
    async fn register_bumps_epoch_once() {
        let (_, mgr) = manager();
        let lease = mgr.register(&data("d1"), Duration::from_secs(15)).await.unwrap();
        assert_eq!(lease.registered_epoch, 1);
        assert_eq!(mgr.get_epoch(), 1);
        assert_eq!(mgr.get_cluster_members(), vec![data("d1")]);
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let (_, mgr) = manager();
        mgr.register(&data("d1"), Duration::from_secs(15)).await.unwrap();
        mgr.register(&data("d1"), Duration::from_secs(15)).await.unwrap();

        assert_eq!(mgr.get_epoch(), 1);
        assert_eq!(mgr.get_cluster_members().len(), 1);
    }

    #[tokio::test]
    async fn renew_does_not_advance_epoch() {
        let (_, mgr) = manager();
        mgr.register(&data("d1"), Duration::from_secs(15)).await.unwrap();

        for _ in 0..5 {
            let epoch = mgr.renew(&data("d1"), Duration::from_secs(15)).await.unwrap();
            assert_eq!(epoch, 1);
        }
    }

    #[tokio::test]
    async fn renew_clamps_duration() {
        let (_, mgr) = manager();
        mgr.register(&data("d1"), Duration::from_secs(15)).await.unwrap();
        mgr.renew(&data("d1"), Duration::from_secs(3600)).await.unwrap();

        let lease = mgr.get_lease(&data("d1")).unwrap();
        assert_eq!(lease.duration, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn renew_unknown_node_fails() {
        let (_, mgr) = manager();
        let err = mgr.renew(&data("ghost"), Duration::from_secs(15)).await.unwrap_err();
        assert!(matches!(err, RegistryError::LeaseNotFound(_)));
    }

    #[tokio::test]
    async fn mutations_rejected_on_follower() {
        let (consensus, mgr) = manager();
        mgr.register(&data("d1"), Duration::from_secs(15)).await.unwrap();
        consensus.set_leader(Some(NodeIdentity::meta("m2:9615", "zone-a")));

        let err = mgr.renew(&data("d1"), Duration::from_secs(15)).await.unwrap_err();
        assert!(matches!(err, RegistryError::Leadership { leader: Some(ref l) } if l == "m2:9615"));
        assert!(mgr.register(&data("d2"), Duration::from_secs(15)).await.is_err());
        assert_eq!(mgr.get_epoch(), 1);
    }

    #[tokio::test]
    async fn evict_and_deregister_each_bump_epoch() {
        let (_, mgr) = manager();
        mgr.register(&data("d1"), Duration::from_secs(15)).await.unwrap();
        mgr.register(&data("d2"), Duration::from_secs(15)).await.unwrap();

        assert_eq!(mgr.evict(&data("d1")).await.unwrap(), 3);
        assert_eq!(mgr.deregister(&data("d2")).await.unwrap(), 4);
        assert!(mgr.get_cluster_members().is_empty());

        let err = mgr.evict(&data("d1")).await.unwrap_err();
        assert!(matches!(err, RegistryError::LeaseNotFound(_)));
        assert_eq!(mgr.get_epoch(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_evicts_only_expired_leases() {
        let (_, mgr) = manager();
        mgr.register(&data("d1"), Duration::from_secs(15)).await.unwrap();
        mgr.register(&data("d2"), Duration::from_secs(15)).await.unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        mgr.renew(&data("d2"), Duration::from_secs(15)).await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;

        let evicted = mgr.evict_expired().await;
        assert_eq!(evicted, vec![data("d1")]);
        assert_eq!(mgr.get_epoch(), 3);
        assert_eq!(mgr.get_cluster_members(), vec![data("d2")]);

        // Nothing left to evict: the sweep is idempotent.
        assert!(mgr.evict_expired().await.is_empty());
        assert_eq!(mgr.get_epoch(), 3);
    }

    #[tokio::test]
    async fn recover_rebuilds_from_commit_log() {
        let log = CommitLog::open_in_memory().unwrap();
        {
            let consensus = Arc::new(LocalConsensus::open(meta(), log.clone()).unwrap());
            consensus.set_leader(Some(meta()));
            let mgr = LeaseManager::new(consensus, MetaConfig::default());
            mgr.register(&data("d1"), Duration::from_secs(15)).await.unwrap();
            mgr.register(&data("d2"), Duration::from_secs(15)).await.unwrap();
            mgr.evict(&data("d1")).await.unwrap();
        }

        let consensus = Arc::new(LocalConsensus::open(meta(), log).unwrap());
        let mgr = LeaseManager::new(consensus, MetaConfig::default());
        assert_eq!(mgr.recover().await.unwrap(), 3);
        assert_eq!(mgr.get_cluster_members(), vec![data("d2")]);
        assert_eq!(mgr.get_epoch(), 3);
        assert_eq!(mgr.recover().await.unwrap(), 0);
    }
}
