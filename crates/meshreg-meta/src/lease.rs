//! Lease store — versioned map from node identity to its lease.
//!
//! The store holds one immutable [`LeaseSnapshot`] behind an atomically
//! swappable reference. Readers load the current snapshot without
//! locking; writers (only the [`LeaseManager`](crate::LeaseManager))
//! build a new snapshot and swap it in.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use indexmap::IndexMap;
use tokio::time::Instant;

use meshreg_core::{Epoch, NodeIdentity, NodeType};

/// A time-bounded claim of liveness for one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub owner: NodeIdentity,
    /// Duration granted on the last renewal, after clamping.
    pub duration: Duration,
    pub deadline: Instant,
    pub last_renewed: Instant,
    /// Epoch at which the node joined.
    pub registered_epoch: Epoch,
}

impl Lease {
    pub fn new(owner: NodeIdentity, duration: Duration, registered_epoch: Epoch) -> Self {
        let now = Instant::now();
        Self {
            owner,
            duration,
            deadline: now + duration,
            last_renewed: now,
            registered_epoch,
        }
    }

    /// A copy of this lease extended to `now + duration`.
    pub fn renewed(&self, duration: Duration) -> Self {
        let now = Instant::now();
        Self {
            duration,
            deadline: now + duration,
            last_renewed: now,
            ..self.clone()
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

/// Immutable view of every live lease at one epoch.
#[derive(Debug, Clone, Default)]
pub struct LeaseSnapshot {
    /// Epoch of the last membership change applied to this snapshot.
    pub epoch: Epoch,
    /// Leases in registration order.
    pub leases: IndexMap<NodeIdentity, Lease>,
}

impl LeaseSnapshot {
    pub fn get(&self, node: &NodeIdentity) -> Option<&Lease> {
        self.leases.get(node)
    }

    pub fn contains(&self, node: &NodeIdentity) -> bool {
        self.leases.contains_key(node)
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    /// Live nodes in registration order.
    pub fn members(&self) -> Vec<NodeIdentity> {
        self.leases.keys().cloned().collect()
    }

    /// Live nodes of one tier in registration order.
    pub fn members_of(&self, node_type: NodeType) -> Vec<NodeIdentity> {
        self.leases
            .keys()
            .filter(|n| n.node_type == node_type)
            .cloned()
            .collect()
    }

    /// Nodes whose deadline has passed at `now`.
    pub fn expired(&self, now: Instant) -> Vec<NodeIdentity> {
        self.leases
            .values()
            .filter(|l| l.is_expired(now))
            .map(|l| l.owner.clone())
            .collect()
    }

    /// A new snapshot with `lease` inserted or replaced in place.
    pub fn with_lease(&self, lease: Lease, epoch: Epoch) -> Self {
        let mut leases = self.leases.clone();
        leases.insert(lease.owner.clone(), lease);
        Self { epoch, leases }
    }

    /// A new snapshot without `node`, preserving the order of the rest.
    pub fn without(&self, node: &NodeIdentity, epoch: Epoch) -> Self {
        let mut leases = self.leases.clone();
        leases.shift_remove(node);
        Self { epoch, leases }
    }
}

/// Swappable holder of the current [`LeaseSnapshot`].
pub struct LeaseStore {
    current: ArcSwap<LeaseSnapshot>,
}

impl LeaseStore {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(LeaseSnapshot::default()),
        }
    }

    /// The current snapshot. Never blocks.
    pub fn load(&self) -> Arc<LeaseSnapshot> {
        self.current.load_full()
    }

    /// Replace the current snapshot.
    pub(crate) fn replace(&self, snapshot: LeaseSnapshot) {
        self.current.store(Arc::new(snapshot));
    }
}

impl Default for LeaseStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(addr: &str, node_type: NodeType) -> Lease {
        Lease::new(
            NodeIdentity::new(addr, node_type, "zone-a"),
            Duration::from_secs(10),
            1,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn lease_expires_after_duration() {
        let l = lease("d1", NodeType::Data);
        assert!(!l.is_expired(Instant::now()));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(l.is_expired(Instant::now()));

        let renewed = l.renewed(Duration::from_secs(5));
        assert!(!renewed.is_expired(Instant::now()));
        assert_eq!(renewed.registered_epoch, 1);
    }

    #[tokio::test]
    async fn snapshot_preserves_insertion_order() {
        let snap = LeaseSnapshot::default()
            .with_lease(lease("d2", NodeType::Data), 1)
            .with_lease(lease("s1", NodeType::Session), 2)
            .with_lease(lease("d1", NodeType::Data), 3);

        let addrs: Vec<_> = snap.members().into_iter().map(|n| n.address).collect();
        assert_eq!(addrs, vec!["d2", "s1", "d1"]);

        let data: Vec<_> = snap
            .members_of(NodeType::Data)
            .into_iter()
            .map(|n| n.address)
            .collect();
        assert_eq!(data, vec!["d2", "d1"]);

        let removed = snap.without(&NodeIdentity::session("s1", "zone-a"), 4);
        assert_eq!(removed.len(), 2);
        assert_eq!(removed.epoch, 4);
        // The earlier snapshot is untouched.
        assert_eq!(snap.len(), 3);
    }

    #[tokio::test]
    async fn store_swaps_whole_snapshots() {
        let store = LeaseStore::new();
        let before = store.load();
        store.replace(before.with_lease(lease("d1", NodeType::Data), 1));

        assert!(before.is_empty());
        assert_eq!(store.load().len(), 1);
        assert_eq!(store.load().epoch, 1);
    }
}
