//! Slot table manager — partitions the slot space across live data nodes.
//!
//! Assignment is a deterministic greedy rebalance:
//!
//! 1. Each live data node gets a quota of `slot_num / k` slots; the
//!    `slot_num % k` leftover slots go to the nodes that already own the
//!    most, ties broken by address.
//! 2. A slot keeps its previous leader while that leader is live and
//!    under quota.
//! 3. Remaining slots go to the node with the largest unfilled quota,
//!    ties broken by smallest address.
//! 4. Followers are the next nodes after the leader in address order.
//!
//! Rebalancing a balanced table against the same node set is a no-op, so
//! repeated recomputation with stable membership never moves a slot.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use meshreg_consensus::{Change, SharedConsensus};
use meshreg_core::{
    DataNodeSlot, Epoch, MetaConfig, NodeType, RegistryResult, Slot, SlotId, SlotTable, slot_of_key,
};

use crate::manager::LeaseManager;

/// Compute a fresh table for `nodes`, as if no slot had an owner yet.
pub fn compute_slot_table(nodes: &[String], slot_num: u32, replicas: u32) -> SlotTable {
    rebalance(&SlotTable::empty(), nodes, slot_num, replicas)
}

/// Recompute `previous` for the live `nodes`, moving as few slots as the
/// balance constraint allows.
///
/// The returned table carries epoch 0; the committing manager stamps it.
pub fn rebalance(previous: &SlotTable, nodes: &[String], slot_num: u32, replicas: u32) -> SlotTable {
    let mut nodes: Vec<&str> = nodes.iter().map(String::as_str).collect();
    nodes.sort_unstable();
    nodes.dedup();

    let k = nodes.len();
    if k == 0 || slot_num == 0 {
        return SlotTable::empty();
    }

    let index_of = |addr: &str| nodes.binary_search(&addr).ok();

    // Previous leader of each slot, if still live.
    let prior: Vec<Option<usize>> = (0..slot_num)
        .map(|id| previous.leader_of(id).and_then(index_of))
        .collect();

    let mut owned = vec![0usize; k];
    for idx in prior.iter().flatten() {
        owned[*idx] += 1;
    }

    let total = slot_num as usize;
    let base = total / k;
    let extra = total % k;
    let mut by_ownership: Vec<usize> = (0..k).collect();
    by_ownership.sort_by(|a, b| owned[*b].cmp(&owned[*a]).then(nodes[*a].cmp(nodes[*b])));
    let mut quota = vec![base; k];
    for idx in by_ownership.into_iter().take(extra) {
        quota[idx] += 1;
    }

    let mut assigned = vec![0usize; k];
    let mut leaders: Vec<Option<usize>> = vec![None; total];
    for (slot, prev) in prior.iter().enumerate() {
        if let Some(idx) = *prev {
            if assigned[idx] < quota[idx] {
                assigned[idx] += 1;
                leaders[slot] = Some(idx);
            }
        }
    }

    for leader in leaders.iter_mut().filter(|l| l.is_none()) {
        // Quotas sum to `total`, so some node always has room.
        let mut best = 0;
        for idx in 1..k {
            if quota[idx] - assigned[idx] > quota[best] - assigned[best] {
                best = idx;
            }
        }
        assigned[best] += 1;
        *leader = Some(best);
    }

    let follower_count = (replicas.saturating_sub(1) as usize).min(k - 1);
    let slots = leaders
        .into_iter()
        .enumerate()
        .filter_map(|(slot, leader)| {
            let idx = leader?;
            let id = slot as SlotId;
            let followers = (1..=follower_count)
                .map(|step| nodes[(idx + step) % k].to_string())
                .collect();
            Some((
                id,
                Slot {
                    id,
                    leader: nodes[idx].to_string(),
                    followers,
                },
            ))
        })
        .collect();

    SlotTable { epoch: 0, slots }
}

/// Holds the committed slot table and recomputes it on membership change.
pub struct SlotTableManager {
    consensus: SharedConsensus,
    leases: Arc<LeaseManager>,
    current: ArcSwap<SlotTable>,
    slot_num: u32,
    replicas: u32,
    /// Serializes refreshes. Holds the newest log epoch applied here.
    applied: Mutex<Epoch>,
}

impl SlotTableManager {
    pub fn new(consensus: SharedConsensus, leases: Arc<LeaseManager>, config: &MetaConfig) -> Self {
        Self {
            consensus,
            leases,
            current: ArcSwap::from_pointee(SlotTable::empty()),
            slot_num: config.slot_num,
            replicas: config.slot_replicas,
            applied: Mutex::new(0),
        }
    }

    /// Recompute the table against the live data nodes.
    ///
    /// Commits a new table only when the assignment actually changes, and
    /// returns its epoch. Non-leaders never propose.
    pub async fn refresh(&self) -> RegistryResult<Option<Epoch>> {
        let mut applied = self.applied.lock().await;
        if !self.consensus.is_leader() {
            debug!("not leader, skipping slot refresh");
            return Ok(None);
        }

        let nodes: Vec<String> = self
            .leases
            .members_of(NodeType::Data)
            .into_iter()
            .map(|n| n.address)
            .collect();

        let current = self.current.load_full();
        let mut next = rebalance(&current, &nodes, self.slot_num, self.replicas);
        if next.same_assignment(&current) {
            return Ok(None);
        }

        let epoch = self
            .consensus
            .propose(Change::AssignSlots { table: next.clone() })
            .await?;
        next.epoch = epoch;
        let moved = moved_slots(&current, &next);
        self.current.store(Arc::new(next));
        *applied = epoch;

        info!(epoch, data_nodes = nodes.len(), moved, "slot table reassigned");
        Ok(Some(epoch))
    }

    /// Rebuild the table from committed slot assignments.
    pub async fn recover(&self) -> RegistryResult<usize> {
        let mut applied = self.applied.lock().await;
        let mut replayed = 0;
        for entry in self.consensus.committed_after(*applied)? {
            *applied = entry.epoch;
            if let Change::AssignSlots { mut table } = entry.change {
                table.epoch = entry.epoch;
                self.current.store(Arc::new(table));
                replayed += 1;
            }
        }
        if replayed > 0 {
            info!(replayed, epoch = self.current.load().epoch, "slot table recovered");
        }
        Ok(replayed)
    }

    /// The current table. Never blocks.
    pub fn slot_table(&self) -> Arc<SlotTable> {
        self.current.load_full()
    }

    /// Slots owned by `data_node` in the current table.
    pub fn get_data_node_managed_slot(&self, data_node: &str, include_followers: bool) -> DataNodeSlot {
        self.current.load().managed_by(data_node, include_followers)
    }

    /// Address of the data node leading the slot that `key` hashes to.
    pub fn leader_for_key(&self, key: &str) -> Option<String> {
        let slot = slot_of_key(key, self.slot_num);
        self.current.load().leader_of(slot).map(str::to_string)
    }

    pub fn slot_num(&self) -> u32 {
        self.slot_num
    }
}

fn moved_slots(before: &SlotTable, after: &SlotTable) -> usize {
    after
        .slots
        .values()
        .filter(|s| before.leader_of(s.id) != Some(s.leader.as_str()))
        .count()
}
