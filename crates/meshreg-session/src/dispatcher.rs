//! Change dispatcher.
//!
//! Receives "this key changed" notifications and schedules one fetch per
//! key. A notification for a key that is already queued is merged into
//! the queued fetch. Failed fetches are retried up to a ceiling and then
//! dropped.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

use meshreg_core::{DataInfoId, RegistryError};

use crate::fetch_task::ChangeFetchPipeline;

/// Sending side: accepts change notifications.
#[derive(Clone)]
pub struct ChangeNotifier {
    tx: mpsc::Sender<DataInfoId>,
    pending: Arc<DashSet<DataInfoId>>,
}

impl ChangeNotifier {
    /// Schedule a fetch for `data_info_id`.
    ///
    /// Returns `false` when the notification was merged into an already
    /// queued fetch or dropped because the queue is full.
    pub fn notify(&self, data_info_id: &str) -> bool {
        if !self.pending.insert(data_info_id.to_string()) {
            debug!(key = data_info_id, "change coalesced into queued fetch");
            return false;
        }
        match self.tx.try_send(data_info_id.to_string()) {
            Ok(()) => true,
            Err(e) => {
                self.pending.remove(data_info_id);
                warn!(key = data_info_id, error = %e, "change queue unavailable, notification dropped");
                false
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Receiving side: runs the fetch pipeline for each queued key.
pub struct ChangeDispatcher {
    rx: mpsc::Receiver<DataInfoId>,
    pending: Arc<DashSet<DataInfoId>>,
    pipeline: Arc<ChangeFetchPipeline>,
    retry_times: u32,
    retry_delay: Duration,
}

/// Create a dispatcher with room for `capacity` queued keys.
pub fn change_channel(
    pipeline: Arc<ChangeFetchPipeline>,
    capacity: usize,
    retry_times: u32,
) -> (ChangeNotifier, ChangeDispatcher) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let pending = Arc::new(DashSet::new());
    (
        ChangeNotifier {
            tx,
            pending: Arc::clone(&pending),
        },
        ChangeDispatcher {
            rx,
            pending,
            pipeline,
            retry_times,
            retry_delay: Duration::from_millis(200),
        },
    )
}

impl ChangeDispatcher {
    /// Process one key with retries. Returns whether it eventually
    /// succeeded.
    pub async fn dispatch(&self, data_info_id: &str) -> bool {
        // Cleared before the fetch so a change arriving mid-fetch queues
        // another run.
        self.pending.remove(data_info_id);

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.pipeline.on_change(data_info_id).await {
                Ok(_) => return true,
                Err(e) if !e.is_retryable() => {
                    error!(key = data_info_id, error = %e, "change fetch rejected, not retrying");
                    return false;
                }
                Err(e) if attempt > self.retry_times => {
                    let exhausted = RegistryError::TaskExhausted {
                        task: format!("change fetch {data_info_id}"),
                        attempts: attempt,
                    };
                    error!(key = data_info_id, last_error = %e, "{exhausted}");
                    return false;
                }
                Err(e) => {
                    debug!(key = data_info_id, attempt, error = %e, "change fetch failed, retrying");
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }

    /// Drain notifications until shutdown or until every notifier is gone.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        debug!("change dispatcher starting");
        loop {
            tokio::select! {
                key = self.rx.recv() => {
                    let Some(key) = key else {
                        debug!("change queue closed");
                        break;
                    };
                    self.dispatch(&key).await;
                }
                _ = shutdown.changed() => {
                    debug!("change dispatcher shutting down");
                    break;
                }
            }
        }
    }

    /// Take the next queued key without waiting.
    pub fn try_next(&mut self) -> Option<DataInfoId> {
        self.rx.try_recv().ok()
    }
}
