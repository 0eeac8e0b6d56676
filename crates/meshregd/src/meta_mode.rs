//! Meta mode — owns cluster membership and the slot table.
//!
//! In this mode, the daemon:
//! 1. Opens the redb commit log and the local consensus substrate
//! 2. Replays committed changes into the lease store and slot table
//! 3. Starts the lease sweeper
//! 4. Serves heartbeats and provide-data over the meta RPC router

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use meshreg_consensus::{CommitLog, LocalConsensus, SharedConsensus};
use meshreg_core::{NodeIdentity, RegistryConfig};
use meshreg_meta::{
    HeartbeatHandler, LeaseManager, MetaState, ProvideDataRegistry, SlotTableManager,
    build_router, run_sweeper,
};

pub async fn run_meta(port: u16, config: RegistryConfig) -> anyhow::Result<()> {
    info!("meshreg daemon starting in meta mode");
    let meta = config.meta;
    let local = NodeIdentity::meta(config.node.address, config.node.region);

    // ── Consensus substrate ──────────────────────────────────────
    std::fs::create_dir_all(&meta.data_dir)?;
    let log_path = meta.data_dir.join("meshreg-meta.redb");
    let log = CommitLog::open(&log_path)?;
    info!(path = ?log_path, "commit log opened");

    let substrate = Arc::new(LocalConsensus::open(local.clone(), log)?);
    // Without an external election this node leads itself.
    substrate.set_leader(Some(local.clone()));
    let consensus: SharedConsensus = substrate;

    // ── Managers ─────────────────────────────────────────────────
    let leases = Arc::new(LeaseManager::new(consensus.clone(), meta.clone()));
    let slots = Arc::new(SlotTableManager::new(consensus, leases.clone(), &meta));
    let replayed = leases.recover().await?;
    slots.recover().await?;
    info!(
        replayed,
        epoch = leases.get_epoch(),
        members = leases.get_cluster_members().len(),
        "meta state recovered"
    );

    let heartbeat = Arc::new(HeartbeatHandler::new(
        leases.clone(),
        slots.clone(),
        meta.data_centers.clone(),
    ));

    // ── Shutdown signal ──────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sweeper_handle = tokio::spawn(run_sweeper(
        leases.clone(),
        slots.clone(),
        meta.sweep_interval(),
        shutdown_rx,
    ));

    // ── RPC server ───────────────────────────────────────────────
    let router = build_router(MetaState {
        leases,
        slots,
        heartbeat,
        provide_data: Arc::new(ProvideDataRegistry::new()),
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, node = %local, "meta RPC server starting");

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

    let _ = sweeper_handle.await;
    info!("meta node stopped");
    Ok(())
}
