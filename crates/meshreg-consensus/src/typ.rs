//! Change payloads replicated through the consensus substrate.
//!
//! Every membership-affecting mutation on the meta tier is expressed as
//! a `Change`. The substrate assigns it the next epoch on commit.

use meshreg_core::{Epoch, NodeIdentity, SlotTable};

/// A mutation proposed to the consensus substrate.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Change {
    /// A node obtained its first lease.
    Register { node: NodeIdentity, lease_secs: u64 },
    /// A node left gracefully.
    Deregister { node: NodeIdentity },
    /// The sweeper removed a node whose lease expired.
    Evict { node: NodeIdentity },
    /// A recomputed slot table replaces the previous one.
    AssignSlots { table: SlotTable },
}

impl Change {
    pub fn kind(&self) -> &'static str {
        match self {
            Change::Register { .. } => "register",
            Change::Deregister { .. } => "deregister",
            Change::Evict { .. } => "evict",
            Change::AssignSlots { .. } => "assign_slots",
        }
    }
}

/// A change together with the epoch it was committed at.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Committed {
    pub epoch: Epoch,
    pub change: Change,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn committed_serializes_roundtrip() {
        let c = Committed {
            epoch: 7,
            change: Change::Register {
                node: NodeIdentity::data("10.0.0.1:9620", "zone-a"),
                lease_secs: 15,
            },
        };
        let json = serde_json::to_string(&c).unwrap();
        let back: Committed = serde_json::from_str(&json).unwrap();
        assert_eq!(back, c);
        assert_eq!(back.change.kind(), "register");
    }
}
