//! Meta RPC router.
//!
//! # Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/heartbeat` | Renew a lease, get the cluster view |
//! | POST | `/api/v1/provide-data/fetch` | Fetch a provide-data record |
//! | PUT | `/api/v1/provide-data/{id}` | Publish a provide-data record |
//! | GET | `/api/v1/leader` | This replica's view of the leader |
//! | GET | `/api/v1/members` | Live cluster members |
//! | DELETE | `/api/v1/nodes` | Graceful leave for the node in the body |
//! | GET | `/api/v1/slots` | Current slot table |
//!
//! Every route answers 200 with a `GenericResponse` envelope; logical
//! failures are reported through `success = false`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post, put};
use tracing::{info, warn};
use axum::{Json, Router};

use meshreg_core::rpc::{FetchProvideDataRequest, GenericResponse, HeartbeatRequest, LeaderInfo};
use meshreg_core::{Epoch, NodeIdentity, NodeType};

use crate::heartbeat::HeartbeatHandler;
use crate::manager::LeaseManager;
use crate::provide_data::ProvideDataRegistry;
use crate::slot::SlotTableManager;

/// Shared state for meta RPC handlers.
#[derive(Clone)]
pub struct MetaState {
    pub leases: Arc<LeaseManager>,
    pub slots: Arc<SlotTableManager>,
    pub heartbeat: Arc<HeartbeatHandler>,
    pub provide_data: Arc<ProvideDataRegistry>,
}

pub fn build_router(state: MetaState) -> Router {
    let api_routes = Router::new()
        .route("/heartbeat", post(heartbeat))
        .route("/provide-data/fetch", post(fetch_provide_data))
        .route("/provide-data/{id}", put(put_provide_data))
        .route("/leader", get(leader))
        .route("/members", get(members))
        .route("/nodes", delete(deregister))
        .route("/slots", get(slots))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}

/// POST /api/v1/heartbeat
async fn heartbeat(
    State(state): State<MetaState>,
    Json(request): Json<HeartbeatRequest>,
) -> impl IntoResponse {
    Json(state.heartbeat.handle(request).await)
}

/// POST /api/v1/provide-data/fetch
async fn fetch_provide_data(
    State(state): State<MetaState>,
    Json(request): Json<FetchProvideDataRequest>,
) -> impl IntoResponse {
    Json(state.provide_data.handle_fetch(&request))
}

/// PUT /api/v1/provide-data/{id}
async fn put_provide_data(
    State(state): State<MetaState>,
    Path(id): Path<String>,
    Json(value): Json<serde_json::Value>,
) -> impl IntoResponse {
    let value = (!value.is_null()).then_some(value);
    Json(GenericResponse::succeed(state.provide_data.put(&id, value)))
}

/// GET /api/v1/leader
async fn leader(State(state): State<MetaState>) -> impl IntoResponse {
    Json(GenericResponse::succeed(LeaderInfo {
        leader: state.leases.current_leader(),
        epoch: state.leases.get_epoch(),
    }))
}

/// GET /api/v1/members
async fn members(State(state): State<MetaState>) -> impl IntoResponse {
    Json(GenericResponse::succeed(state.leases.get_cluster_members()))
}

/// DELETE /api/v1/nodes
async fn deregister(
    State(state): State<MetaState>,
    Json(node): Json<NodeIdentity>,
) -> impl IntoResponse {
    let epoch = match state.leases.deregister(&node).await {
        Ok(epoch) => epoch,
        Err(e) => {
            warn!(%node, error = %e, "deregistration rejected");
            return Json(GenericResponse::<Epoch>::failed(e.to_string()));
        }
    };
    info!(%node, epoch, "node left");
    if node.node_type == NodeType::Data {
        // The next sweep retries a failed recompute.
        if let Err(e) = state.slots.refresh().await {
            warn!(%node, error = %e, "slot refresh after leave failed");
        }
    }
    Json(GenericResponse::succeed(state.leases.get_epoch()))
}

/// GET /api/v1/slots
async fn slots(State(state): State<MetaState>) -> impl IntoResponse {
    Json(GenericResponse::succeed((*state.slots.slot_table()).clone()))
}
