//! Domain types shared by the meta and session tiers.
//!
//! These types describe cluster nodes, the slot table that partitions
//! registry data across data nodes, and the per-data-center datum
//! snapshots that session nodes push to subscribers. All types are
//! serializable so they can travel in heartbeat responses and be
//! recorded in the consensus commit log.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Monotonic version of cluster membership and slot-table state.
pub type Epoch = u64;

/// Identifier of one partition of the key space.
pub type SlotId = u32;

/// Partition key of registry data (a "data info id").
pub type DataInfoId = String;

/// Client-assigned id of a publisher or subscriber registration.
pub type RegisterId = String;

// ── Nodes ──────────────────────────────────────────────────────────

/// Tier a node belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Client,
    Session,
    Data,
    Meta,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeType::Client => "client",
            NodeType::Session => "session",
            NodeType::Data => "data",
            NodeType::Meta => "meta",
        };
        f.write_str(s)
    }
}

/// Identity of a cluster node. Used as the lease-store key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// `ip:port` the node is reachable on.
    pub address: String,
    pub node_type: NodeType,
    /// Region / zone the node runs in.
    pub region: String,
}

impl NodeIdentity {
    pub fn new(address: impl Into<String>, node_type: NodeType, region: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            node_type,
            region: region.into(),
        }
    }

    pub fn session(address: impl Into<String>, region: impl Into<String>) -> Self {
        Self::new(address, NodeType::Session, region)
    }

    pub fn data(address: impl Into<String>, region: impl Into<String>) -> Self {
        Self::new(address, NodeType::Data, region)
    }

    pub fn meta(address: impl Into<String>, region: impl Into<String>) -> Self {
        Self::new(address, NodeType::Meta, region)
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node_type, self.address)
    }
}

// ── Slots ──────────────────────────────────────────────────────────

/// Ownership of a single slot: one leader plus optional followers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: SlotId,
    /// Address of the owning data node.
    pub leader: String,
    /// Addresses of replica data nodes, never containing the leader.
    pub followers: Vec<String>,
}

/// Assignment of every slot to a data node, tagged with the epoch that
/// produced it.
///
/// An empty table (no slots) means no data node is live: every lookup
/// returns no owner.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SlotTable {
    pub epoch: Epoch,
    pub slots: BTreeMap<SlotId, Slot>,
}

impl SlotTable {
    /// The table used before any data node has joined.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, id: SlotId) -> Option<&Slot> {
        self.slots.get(&id)
    }

    /// Address of the leader owning `id`, if any.
    pub fn leader_of(&self, id: SlotId) -> Option<&str> {
        self.slots.get(&id).map(|s| s.leader.as_str())
    }

    /// Every data node that leads or follows at least one slot.
    pub fn data_servers(&self) -> BTreeSet<String> {
        let mut servers = BTreeSet::new();
        for slot in self.slots.values() {
            servers.insert(slot.leader.clone());
            servers.extend(slot.followers.iter().cloned());
        }
        servers
    }

    /// Whether both tables assign every slot identically, ignoring epochs.
    pub fn same_assignment(&self, other: &SlotTable) -> bool {
        self.slots == other.slots
    }

    /// Slots led (and optionally followed) by `data_node`.
    pub fn managed_by(&self, data_node: &str, include_followers: bool) -> DataNodeSlot {
        let mut leaders = Vec::new();
        let mut followers = Vec::new();
        for slot in self.slots.values() {
            if slot.leader == data_node {
                leaders.push(slot.id);
            } else if include_followers && slot.followers.iter().any(|f| f == data_node) {
                followers.push(slot.id);
            }
        }
        DataNodeSlot {
            data_node: data_node.to_string(),
            epoch: self.epoch,
            leaders,
            followers,
        }
    }
}

/// Slots managed by one data node at a given table epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataNodeSlot {
    pub data_node: String,
    pub epoch: Epoch,
    pub leaders: Vec<SlotId>,
    pub followers: Vec<SlotId>,
}

/// Map a partition key onto the slot space `0..slot_num`.
pub fn slot_of_key(key: &str, slot_num: u32) -> SlotId {
    (fnv1a(key) % u64::from(slot_num.max(1))) as SlotId
}

/// FNV-1a 64-bit. Stable across processes and platforms.
fn fnv1a(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in s.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

// ── Registry data ──────────────────────────────────────────────────

/// One published value for a partition key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publisher {
    pub register_id: RegisterId,
    /// Zone (cell) the publishing client lives in.
    pub zone: String,
    pub source_address: String,
    pub data: Vec<String>,
}

/// Snapshot of one partition key's publishers in one data center.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Datum {
    pub data_info_id: DataInfoId,
    pub data_center: String,
    pub version: u64,
    pub publishers: BTreeMap<RegisterId, Publisher>,
}

impl Datum {
    pub fn new(data_info_id: impl Into<String>, data_center: impl Into<String>, version: u64) -> Self {
        Self {
            data_info_id: data_info_id.into(),
            data_center: data_center.into(),
            version,
            publishers: BTreeMap::new(),
        }
    }

    /// Builder: add a publisher.
    pub fn with_publisher(mut self, publisher: Publisher) -> Self {
        self.publishers.insert(publisher.register_id.clone(), publisher);
        self
    }

    pub fn publisher_size(&self) -> usize {
        self.publishers.len()
    }
}

/// Breadth of a subscriber's interest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Zone,
    DataCenter,
    Global,
}

impl Scope {
    pub const ALL: [Scope; 3] = [Scope::Zone, Scope::DataCenter, Scope::Global];
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Scope::Zone => "zone",
            Scope::DataCenter => "data_center",
            Scope::Global => "global",
        };
        f.write_str(s)
    }
}

/// Push protocol spoken by a subscribing client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientVersion {
    /// Receives one multi-data-center payload per push.
    StoreData,
    /// Legacy client that receives merged datum payloads.
    MergeDatum,
}

/// A client's subscription to a partition key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub register_id: RegisterId,
    pub data_info_id: DataInfoId,
    /// Client connection address the push is delivered to.
    pub source_address: String,
    pub scope: Scope,
    pub client_version: ClientVersion,
    /// Zone the subscribing client lives in.
    pub zone: String,
}

/// Versioned configuration value served by the meta tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvideData {
    pub data_info_id: DataInfoId,
    pub version: u64,
    pub value: Option<serde_json::Value>,
}
