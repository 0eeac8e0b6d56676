//! Messages exchanged between session/data nodes and the meta tier.
//!
//! Logical failures travel inside a [`GenericResponse`] envelope with
//! `success = false`, never as transport errors, so callers' retry logic
//! can tell "not leader" apart from "connection refused".

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::types::{DataInfoId, DataNodeSlot, Datum, Epoch, NodeIdentity, NodeType, SlotTable};

/// Success/failure envelope for every meta RPC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenericResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> GenericResponse<T> {
    pub fn succeed(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message.into()),
        }
    }

    /// The payload of a successful response, or the diagnostic message.
    pub fn into_result(self) -> Result<T, String> {
        match (self.success, self.data) {
            (true, Some(data)) => Ok(data),
            (true, None) => Err("empty response".to_string()),
            (false, _) => Err(self.message.unwrap_or_else(|| "unknown failure".to_string())),
        }
    }
}

/// Lease renewal sent by every non-client node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub node: Option<NodeIdentity>,
    /// Requested lease duration; the meta tier clamps it.
    pub duration_secs: u64,
}

impl HeartbeatRequest {
    pub fn new(node: NodeIdentity, duration_secs: u64) -> Self {
        Self {
            node: Some(node),
            duration_secs,
        }
    }
}

/// Heartbeat reply for session nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHeartbeat {
    pub epoch: Epoch,
    pub slot_table: SlotTable,
    pub cluster_members: Vec<NodeIdentity>,
    pub session_nodes: BTreeMap<String, NodeIdentity>,
    pub data_centers: BTreeSet<String>,
}

/// Heartbeat reply for data nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataHeartbeat {
    pub epoch: Epoch,
    pub cluster_members: Vec<NodeIdentity>,
    pub session_nodes: BTreeMap<String, NodeIdentity>,
    /// Slots led by the heartbeating data node.
    pub slots: DataNodeSlot,
    pub data_centers: BTreeSet<String>,
}

/// Heartbeat reply for meta peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaHeartbeat {
    pub epoch: Epoch,
    pub slot_table: SlotTable,
    pub cluster_members: Vec<NodeIdentity>,
    pub data_centers: BTreeSet<String>,
}

/// Heartbeat reply shaped by the caller's node type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HeartbeatResponse {
    Session(SessionHeartbeat),
    Data(DataHeartbeat),
    Meta(MetaHeartbeat),
}

impl HeartbeatResponse {
    pub fn epoch(&self) -> Epoch {
        match self {
            HeartbeatResponse::Session(r) => r.epoch,
            HeartbeatResponse::Data(r) => r.epoch,
            HeartbeatResponse::Meta(r) => r.epoch,
        }
    }

    pub fn cluster_members(&self) -> &[NodeIdentity] {
        match self {
            HeartbeatResponse::Session(r) => &r.cluster_members,
            HeartbeatResponse::Data(r) => &r.cluster_members,
            HeartbeatResponse::Meta(r) => &r.cluster_members,
        }
    }

    pub fn data_centers(&self) -> &BTreeSet<String> {
        match self {
            HeartbeatResponse::Session(r) => &r.data_centers,
            HeartbeatResponse::Data(r) => &r.data_centers,
            HeartbeatResponse::Meta(r) => &r.data_centers,
        }
    }

    /// Session-node directory, for the variants that carry one.
    pub fn session_nodes(&self) -> Option<&BTreeMap<String, NodeIdentity>> {
        match self {
            HeartbeatResponse::Session(r) => Some(&r.session_nodes),
            HeartbeatResponse::Data(r) => Some(&r.session_nodes),
            HeartbeatResponse::Meta(_) => None,
        }
    }

    pub fn slot_table(&self) -> Option<&SlotTable> {
        match self {
            HeartbeatResponse::Session(r) => Some(&r.slot_table),
            HeartbeatResponse::Meta(r) => Some(&r.slot_table),
            HeartbeatResponse::Data(_) => None,
        }
    }

    /// Live members of the given tier, in cluster-member order.
    pub fn members_of(&self, node_type: NodeType) -> impl Iterator<Item = &NodeIdentity> {
        self.cluster_members()
            .iter()
            .filter(move |m| m.node_type == node_type)
    }
}

/// Request for a provide-data record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchProvideDataRequest {
    pub data_info_id: DataInfoId,
}

/// Session-to-data request for one data center's datum of a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchDatumRequest {
    pub data_info_id: DataInfoId,
    pub data_center: String,
}

/// `datum` is `None` when the key has no publishers in that data center.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchDatumResponse {
    pub datum: Option<Datum>,
}

/// A meta node's view of leadership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderInfo {
    pub leader: Option<NodeIdentity>,
    pub epoch: Epoch,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_envelope_omits_data() {
        let resp: GenericResponse<u64> = GenericResponse::failed("not leader");
        let json = serde_json::to_string(&resp).unwrap();
        assert!(!json.contains("data"));
        assert_eq!(resp.into_result().unwrap_err(), "not leader");
    }

    #[test]
    fn heartbeat_response_is_tagged_by_node_type() {
        let resp = HeartbeatResponse::Meta(MetaHeartbeat {
            epoch: 4,
            slot_table: SlotTable::empty(),
            cluster_members: vec![NodeIdentity::meta("m1", "z")],
            data_centers: BTreeSet::new(),
        });
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["type"], "meta");

        let back: HeartbeatResponse = serde_json::from_value(json).unwrap();
        assert_eq!(back.epoch(), 4);
        assert!(back.session_nodes().is_none());
        assert_eq!(back.members_of(NodeType::Meta).count(), 1);
    }

    #[test]
    fn heartbeat_envelope_decodes_with_and_without_data() {
        let resp = GenericResponse::succeed(HeartbeatResponse::Meta(MetaHeartbeat {
            epoch: 9,
            slot_table: SlotTable::empty(),
            cluster_members: vec![NodeIdentity::meta("m1", "z")],
            data_centers: BTreeSet::from(["dc2".to_string()]),
        }));
        let json = serde_json::to_string(&resp).unwrap();
        let back: GenericResponse<HeartbeatResponse> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, resp);

        let failed: GenericResponse<HeartbeatResponse> =
            serde_json::from_str(r#"{"success":false,"message":"not leader"}"#).unwrap();
        assert!(failed.data.is_none());
        assert_eq!(failed.into_result().unwrap_err(), "not leader");
    }
}
