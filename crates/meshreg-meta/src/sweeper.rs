//! Background lease sweep.
//!
//! Every sweep interval the leader evicts expired leases and then
//! recomputes the slot table against the live data nodes. The recompute
//! is a no-op while the assignment is unchanged, so a failed refresh
//! elsewhere is retried here. Followers replay the commit log instead so
//! their view stays current for a later failover.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use meshreg_core::NodeType;

use crate::manager::LeaseManager;
use crate::slot::SlotTableManager;

/// Run one sweep cycle. Returns the number of evicted nodes.
pub async fn sweep_once(leases: &LeaseManager, slots: &SlotTableManager) -> usize {
    if !leases.is_leader() {
        if let Err(e) = leases.recover().await {
            error!(error = %e, "lease replay failed");
        }
        if let Err(e) = slots.recover().await {
            error!(error = %e, "slot table replay failed");
        }
        return 0;
    }

    let evicted = leases.evict_expired().await;
    let data_evicted = evicted.iter().filter(|n| n.node_type == NodeType::Data).count();
    match slots.refresh().await {
        Ok(Some(epoch)) => info!(epoch, data_evicted, "slot table recomputed"),
        Ok(None) => {}
        Err(e) => error!(error = %e, "slot refresh failed, retrying next sweep"),
    }
    evicted.len()
}

/// Sweep until `shutdown` flips.
pub async fn run_sweeper(
    leases: Arc<LeaseManager>,
    slots: Arc<SlotTableManager>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(?interval, "lease sweeper starting");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                sweep_once(&leases, &slots).await;
            }
            _ = shutdown.changed() => {
                debug!("lease sweeper shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use meshreg_consensus::{Change, Committed, Consensus, LocalConsensus, SharedConsensus};
    use meshreg_core::rpc::{HeartbeatRequest, HeartbeatResponse};
    use meshreg_core::{Epoch, MetaConfig, NodeIdentity, RegistryError, RegistryResult};

    use crate::heartbeat::HeartbeatHandler;

    /// Fails the first slot assignment with a storage error.
    struct FlakySlotCommit {
        inner: LocalConsensus,
        failed: AtomicBool,
    }

    #[async_trait]
    impl Consensus for FlakySlotCommit {
        async fn propose(&self, change: Change) -> RegistryResult<Epoch> {
            if matches!(change, Change::AssignSlots { .. }) && !self.failed.swap(true, Ordering::SeqCst) {
                return Err(RegistryError::Storage("transient disk error".into()));
            }
            self.inner.propose(change).await
        }

        fn is_leader(&self) -> bool {
            self.inner.is_leader()
        }

        fn current_leader(&self) -> Option<NodeIdentity> {
            self.inner.current_leader()
        }

        fn committed_epoch(&self) -> Epoch {
            self.inner.committed_epoch()
        }

        fn committed_after(&self, after: Epoch) -> RegistryResult<Vec<Committed>> {
            self.inner.committed_after(after)
        }
    }

    fn managers() -> (Arc<LeaseManager>, Arc<SlotTableManager>) {
        let consensus: SharedConsensus =
            Arc::new(LocalConsensus::single_node(NodeIdentity::meta("m1", "z")).unwrap());
        managers_with(consensus)
    }

    fn managers_with(consensus: SharedConsensus) -> (Arc<LeaseManager>, Arc<SlotTableManager>) {
        let config = MetaConfig {
            slot_num: 12,
            ..MetaConfig::default()
        };
        let leases = Arc::new(LeaseManager::new(consensus.clone(), config.clone()));
        let slots = Arc::new(SlotTableManager::new(consensus, leases.clone(), &config));
        (leases, slots)
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_evicts_and_reassigns_slots() {
        let (leases, slots) = managers();
        let ttl = Duration::from_secs(15);
        for addr in ["d1", "d2", "d3"] {
            leases.register(&NodeIdentity::data(addr, "z"), ttl).await.unwrap();
        }
        slots.refresh().await.unwrap();
        assert_eq!(slots.get_data_node_managed_slot("d1", false).leaders.len(), 4);

        // d2 and d3 keep renewing every 5s; d1 goes silent.
        for _ in 0..4 {
            tokio::time::advance(Duration::from_secs(5)).await;
            leases.renew(&NodeIdentity::data("d2", "z"), ttl).await.unwrap();
            leases.renew(&NodeIdentity::data("d3", "z"), ttl).await.unwrap();
        }

        let before = leases.get_epoch();
        assert_eq!(sweep_once(&leases, &slots).await, 1);
        // One epoch for the eviction, one for the slot reassignment.
        assert_eq!(leases.get_epoch(), before + 2);

        assert!(slots.get_data_node_managed_slot("d1", false).leaders.is_empty());
        assert_eq!(slots.get_data_node_managed_slot("d2", false).leaders.len(), 6);
        assert_eq!(slots.get_data_node_managed_slot("d3", false).leaders.len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_slot_commit_is_retried_by_next_sweep() {
        let consensus: SharedConsensus = Arc::new(FlakySlotCommit {
            inner: LocalConsensus::single_node(NodeIdentity::meta("m1", "z")).unwrap(),
            failed: AtomicBool::new(false),
        });
        let (leases, slots) = managers_with(consensus);
        let heartbeat = HeartbeatHandler::new(leases.clone(), slots.clone(), Vec::new());
        let d1 = NodeIdentity::data("d1", "z");

        // The lease commits but the slot assignment does not.
        let resp = heartbeat.handle(HeartbeatRequest::new(d1.clone(), 15)).await;
        assert!(!resp.success);
        assert!(leases.get_lease(&d1).is_some());
        assert!(slots.slot_table().is_empty());

        assert_eq!(sweep_once(&leases, &slots).await, 0);
        assert_eq!(slots.slot_table().len(), 12);

        let resp = heartbeat.handle(HeartbeatRequest::new(d1, 15)).await;
        let HeartbeatResponse::Data(body) = resp.into_result().unwrap() else {
            panic!("expected data response");
        };
        assert_eq!(body.slots.leaders.len(), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_with_stable_membership_keeps_epoch() {
        let (leases, slots) = managers();
        leases
            .register(&NodeIdentity::data("d1", "z"), Duration::from_secs(15))
            .await
            .unwrap();
        sweep_once(&leases, &slots).await;
        let epoch = leases.get_epoch();

        sweep_once(&leases, &slots).await;
        assert_eq!(leases.get_epoch(), epoch);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_stops_on_shutdown() {
        let (leases, slots) = managers();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_sweeper(leases, slots, Duration::from_secs(5), rx));

        tokio::time::advance(Duration::from_secs(11)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
