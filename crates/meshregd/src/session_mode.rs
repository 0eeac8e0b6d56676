//! Session mode — fronts clients and pushes registry changes to them.
//!
//! In this mode, the daemon:
//! 1. Renews its lease with the meta leader and caches the cluster view
//! 2. Runs the change dispatcher that turns change notifications into pushes
//! 3. Runs the push worker that delivers them with retry
//! 4. Serves the session API for subscriptions and change notifications
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/subscribers` | Register a subscriber |
//! | DELETE | `/api/v1/subscribers/{id}` | Remove a subscriber |
//! | DELETE | `/api/v1/connections/{address}` | Drop a closed client connection |
//! | POST | `/api/v1/changes` | Notify that a partition key changed |
//! | GET | `/api/v1/cluster` | Cached cluster view |

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio::sync::watch;
use tracing::info;

use meshreg_core::rpc::GenericResponse;
use meshreg_core::{DataInfoId, NodeIdentity, RegistryConfig, Subscriber};
use meshreg_session::{
    ChangeFetchPipeline, ChangeNotifier, DatumCache, HttpDatumFetcher, HttpMetaChannel,
    HttpPushDelivery, MembershipCache, PushPolicy, PushWorker, SessionInterests, change_channel,
    push_channel,
};

/// Shared state for session API handlers.
#[derive(Clone)]
pub struct SessionApiState {
    pub interests: Arc<SessionInterests>,
    pub notifier: ChangeNotifier,
    pub worker: Arc<PushWorker>,
    pub membership: Arc<MembershipCache>,
}

#[derive(Debug, Deserialize)]
pub struct ChangeNotification {
    pub data_info_id: DataInfoId,
}

pub async fn run_session(port: u16, config: RegistryConfig) -> anyhow::Result<()> {
    info!("meshreg daemon starting in session mode");
    let session = config.session;
    let local = NodeIdentity::session(config.node.address, config.node.region);
    let timeout = session.rpc_timeout();

    // ── Membership cache ─────────────────────────────────────────
    let membership = Arc::new(MembershipCache::new(
        local.clone(),
        config.node.data_center,
        Arc::new(HttpMetaChannel::new(timeout)),
        session.meta_servers.clone(),
        session.lease_secs,
    ));

    // ── Fetch & push pipeline ────────────────────────────────────
    let interests = Arc::new(SessionInterests::new());
    let datums = Arc::new(DatumCache::new(Arc::new(HttpDatumFetcher::new(
        membership.clone(),
        timeout,
    ))));
    let (queue, push_rx) = push_channel(session.push_queue_capacity);
    let pipeline = Arc::new(ChangeFetchPipeline::new(
        interests.clone(),
        datums,
        membership.clone(),
        queue,
        Duration::from_secs(session.push_task_expiry_secs),
    ));
    let (notifier, dispatcher) = change_channel(
        pipeline,
        session.push_queue_capacity,
        session.data_change_fetch_retry_times,
    );
    let worker = Arc::new(PushWorker::new(
        Arc::new(HttpPushDelivery::new(timeout)),
        PushPolicy::from_config(&session),
    ));

    // ── Shutdown signal ──────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let renew_handle = tokio::spawn(
        membership
            .clone()
            .run(session.renew_interval(), shutdown_rx.clone()),
    );
    let dispatch_handle = tokio::spawn(dispatcher.run(shutdown_rx.clone()));
    let push_handle = tokio::spawn(worker.clone().run(push_rx, shutdown_rx));

    // ── Session API ──────────────────────────────────────────────
    let router = build_session_router(SessionApiState {
        interests,
        notifier,
        worker,
        membership,
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, node = %local, "session API starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for Ctrl-C");
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    let _ = renew_handle.await;
    let _ = dispatch_handle.await;
    let _ = push_handle.await;
    info!("session node stopped");
    Ok(())
}

pub fn build_session_router(state: SessionApiState) -> Router {
    let api_routes = Router::new()
        .route("/subscribers", post(add_subscriber))
        .route("/subscribers/{id}", delete(remove_subscriber))
        .route("/connections/{address}", delete(close_connection))
        .route("/changes", post(notify_change))
        .route("/cluster", get(cluster))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}

/// POST /api/v1/subscribers
async fn add_subscriber(
    State(state): State<SessionApiState>,
    Json(subscriber): Json<Subscriber>,
) -> impl IntoResponse {
    let key = subscriber.data_info_id.clone();
    state.interests.add(subscriber);
    // New subscribers get the current data through a regular fetch.
    state.notifier.notify(&key);
    Json(GenericResponse::succeed(key))
}

/// DELETE /api/v1/subscribers/{id}
async fn remove_subscriber(
    State(state): State<SessionApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.interests.remove(&id) {
        Some(subscriber) => Json(GenericResponse::succeed(subscriber)),
        None => Json(GenericResponse::failed(format!("subscriber not found: {id}"))),
    }
}

/// DELETE /api/v1/connections/{address}
async fn close_connection(
    State(state): State<SessionApiState>,
    Path(address): Path<String>,
) -> impl IntoResponse {
    let removed = state.interests.remove_by_connection(&address);
    state.worker.forget_address(&address);
    Json(GenericResponse::succeed(removed.len()))
}

/// POST /api/v1/changes
async fn notify_change(
    State(state): State<SessionApiState>,
    Json(change): Json<ChangeNotification>,
) -> impl IntoResponse {
    if change.data_info_id.is_empty() {
        return Json(GenericResponse::failed("malformed request: empty data info id"));
    }
    Json(GenericResponse::succeed(state.notifier.notify(&change.data_info_id)))
}

/// GET /api/v1/cluster
async fn cluster(State(state): State<SessionApiState>) -> impl IntoResponse {
    Json(GenericResponse::succeed((*state.membership.state()).clone()))
}
