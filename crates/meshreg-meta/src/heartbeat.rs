//! Heartbeat protocol handler.
//!
//! Every session, data and meta node heartbeats the meta leader. A
//! heartbeat renews the caller's lease (registering it on first contact)
//! and returns a response shaped by the caller's node type. Failures are
//! returned inside a [`GenericResponse`] envelope, never as transport
//! errors.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use meshreg_core::rpc::{
    DataHeartbeat, GenericResponse, HeartbeatRequest, HeartbeatResponse, MetaHeartbeat,
    SessionHeartbeat,
};
use meshreg_core::{Epoch, NodeIdentity, NodeType, RegistryError, RegistryResult, SlotTable};

use crate::manager::LeaseManager;
use crate::slot::SlotTableManager;

pub struct HeartbeatHandler {
    leases: Arc<LeaseManager>,
    slots: Arc<SlotTableManager>,
    /// Remote data centers advertised to every caller.
    data_centers: BTreeSet<String>,
}

impl HeartbeatHandler {
    pub fn new(
        leases: Arc<LeaseManager>,
        slots: Arc<SlotTableManager>,
        data_centers: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            leases,
            slots,
            data_centers: data_centers.into_iter().collect(),
        }
    }

    /// Handle one heartbeat. Never fails at the transport level.
    pub async fn handle(&self, request: HeartbeatRequest) -> GenericResponse<HeartbeatResponse> {
        match self.process(request).await {
            Ok(response) => GenericResponse::succeed(response),
            Err(e) => {
                warn!(error = %e, "heartbeat rejected");
                GenericResponse::failed(e.to_string())
            }
        }
    }

    async fn process(&self, request: HeartbeatRequest) -> RegistryResult<HeartbeatResponse> {
        let node = validate(request.node)?;
        let duration = Duration::from_secs(request.duration_secs);

        match self.leases.renew(&node, duration).await {
            Ok(_) => debug!(%node, "lease renewed"),
            Err(RegistryError::LeaseNotFound(_)) => {
                self.leases.register(&node, duration).await?;
                info!(%node, "node joined via heartbeat");
                if node.node_type == NodeType::Data {
                    self.slots.refresh().await?;
                }
            }
            Err(e) => return Err(e),
        }

        let table = self.slots.slot_table();
        build_response(
            &node,
            self.leases.get_cluster_members(),
            &table,
            self.leases.get_epoch(),
            &self.data_centers,
        )
        .ok_or_else(|| unsupported(&node))
    }
}

fn validate(node: Option<NodeIdentity>) -> RegistryResult<NodeIdentity> {
    let node = node.ok_or_else(|| RegistryError::MalformedRequest("missing node identity".into()))?;
    if node.address.trim().is_empty() {
        return Err(RegistryError::MalformedRequest("empty node address".into()));
    }
    if node.node_type == NodeType::Client {
        return Err(unsupported(&node));
    }
    Ok(node)
}

fn unsupported(node: &NodeIdentity) -> RegistryError {
    RegistryError::MalformedRequest(format!("unsupported node type {}", node.node_type))
}

/// Build the heartbeat response for `node` from one membership snapshot
/// and one slot table.
///
/// Pure: the same inputs always produce the same response. Client nodes
/// do not heartbeat and get `None`.
pub fn build_response(
    node: &NodeIdentity,
    members: Vec<NodeIdentity>,
    table: &SlotTable,
    epoch: Epoch,
    data_centers: &BTreeSet<String>,
) -> Option<HeartbeatResponse> {
    let data_centers = data_centers.clone();
    let response = match node.node_type {
        NodeType::Data => HeartbeatResponse::Data(DataHeartbeat {
            epoch,
            session_nodes: session_directory(&members),
            cluster_members: members,
            slots: table.managed_by(&node.address, false),
            data_centers,
        }),
        NodeType::Meta => HeartbeatResponse::Meta(MetaHeartbeat {
            epoch,
            slot_table: table.clone(),
            cluster_members: members,
            data_centers,
        }),
        NodeType::Session => HeartbeatResponse::Session(SessionHeartbeat {
            epoch,
            slot_table: table.clone(),
            session_nodes: session_directory(&members),
            cluster_members: members,
            data_centers,
        }),
        NodeType::Client => return None,
    };
    Some(response)
}

/// Live session nodes keyed by address.
fn session_directory(members: &[NodeIdentity]) -> BTreeMap<String, NodeIdentity> {
    members
        .iter()
        .filter(|m| m.node_type == NodeType::Session)
        .map(|m| (m.address.clone(), m.clone()))
        .collect()
}
