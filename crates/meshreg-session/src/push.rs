//! Push queue and delivery worker.
//!
//! The fetch pipeline submits [`PushTask`]s into a bounded queue; when
//! the queue is full new tasks are dropped rather than buffered. The
//! [`PushWorker`] drains the queue and hands each task to a
//! [`PushDelivery`] transport, retrying transport failures with
//! exponential backoff until the task expires or runs out of attempts.
//! A closed connection is terminal and never retried.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use meshreg_core::{DataInfoId, Datum, RegisterId, RegistryError, SessionConfig};

use crate::error::{SessionError, SessionResult};

const TARGET: &str = "meshreg::push";

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// What a push carries, by client protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum PushPayload {
    /// Every visible data center's datum, for store-data clients.
    MultiDataCenter(BTreeMap<String, Datum>),
    /// One datum merged across data centers, for legacy zone subscribers.
    Merged(Datum),
    /// One datum per data center, for legacy wider-scope subscribers.
    MultiDatum(Vec<Datum>),
}

impl PushPayload {
    pub fn publisher_count(&self) -> usize {
        match self {
            PushPayload::MultiDataCenter(m) => m.values().map(Datum::publisher_size).sum(),
            PushPayload::Merged(d) => d.publisher_size(),
            PushPayload::MultiDatum(v) => v.iter().map(Datum::publisher_size).sum(),
        }
    }
}

/// One unit of delivery work for one client address.
#[derive(Debug, Clone)]
pub struct PushTask {
    pub id: u64,
    pub address: String,
    pub data_info_id: DataInfoId,
    /// Registrations at `address` this push answers.
    pub register_ids: Vec<RegisterId>,
    pub payload: PushPayload,
    /// Source datum version per data center.
    pub versions: BTreeMap<String, u64>,
    pub attempts: u32,
    pub expires_at: Instant,
}

impl PushTask {
    pub fn new(
        address: impl Into<String>,
        data_info_id: impl Into<String>,
        register_ids: Vec<RegisterId>,
        payload: PushPayload,
        versions: BTreeMap<String, u64>,
        ttl: Duration,
    ) -> Self {
        Self {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            address: address.into(),
            data_info_id: data_info_id.into(),
            register_ids,
            payload,
            versions,
            attempts: 0,
            expires_at: Instant::now() + ttl,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Sending half of the bounded push queue.
#[derive(Clone)]
pub struct PushQueue {
    tx: mpsc::Sender<PushTask>,
}

/// Create a push queue holding at most `capacity` pending tasks.
pub fn push_channel(capacity: usize) -> (PushQueue, mpsc::Receiver<PushTask>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (PushQueue { tx }, rx)
}

impl PushQueue {
    /// Enqueue without waiting. A full queue drops the task.
    pub fn submit(&self, task: PushTask) -> SessionResult<()> {
        match self.tx.try_send(task) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(task)) => {
                warn!(
                    target: TARGET,
                    task = task.id,
                    address = %task.address,
                    key = %task.data_info_id,
                    "push queue full, dropping task"
                );
                Err(SessionError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SessionError::QueueClosed),
        }
    }
}

/// Result of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Failed(String),
    /// The client connection is gone.
    ConnectionClosed,
}

/// Transport that delivers pushes to client connections.
#[async_trait]
pub trait PushDelivery: Send + Sync {
    async fn deliver(&self, task: &PushTask) -> DeliveryOutcome;
}

/// Retry policy of the push worker.
#[derive(Debug, Clone)]
pub struct PushPolicy {
    pub max_attempts: u32,
    pub task_ttl: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl PushPolicy {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            max_attempts: config.push_max_attempts.max(1),
            task_ttl: Duration::from_secs(config.push_task_expiry_secs),
            backoff_base: Duration::from_millis(config.push_backoff_base_ms),
            backoff_max: Duration::from_millis(config.push_backoff_max_ms),
        }
    }

    /// Delay before retry number `attempt` (1-based): doubles each time,
    /// capped at `backoff_max`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.backoff_base.saturating_mul(factor).min(self.backoff_max)
    }
}

/// Terminal state of a push task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Delivered,
    /// A newer version was already delivered to this address.
    Stale,
    ConnectionClosed,
    Expired,
    Exhausted,
}

pub struct PushWorker {
    delivery: Arc<dyn PushDelivery>,
    policy: PushPolicy,
    /// Last delivered datum version per data center, by (address, key).
    delivered: DashMap<(String, DataInfoId), BTreeMap<String, u64>>,
}

impl PushWorker {
    pub fn new(delivery: Arc<dyn PushDelivery>, policy: PushPolicy) -> Self {
        Self {
            delivery,
            policy,
            delivered: DashMap::new(),
        }
    }

    /// Drain `rx` until shutdown, executing tasks concurrently.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<PushTask>, mut shutdown: watch::Receiver<bool>) {
        debug!(target: TARGET, "push worker starting");
        loop {
            tokio::select! {
                task = rx.recv() => {
                    let Some(task) = task else {
                        debug!(target: TARGET, "push queue closed");
                        break;
                    };
                    let worker = Arc::clone(&self);
                    tokio::spawn(async move {
                        worker.execute(task).await;
                    });
                }
                _ = shutdown.changed() => {
                    debug!(target: TARGET, "push worker shutting down");
                    break;
                }
            }
        }
    }

    /// Deliver one task, retrying until it succeeds or gives up.
    pub async fn execute(&self, mut task: PushTask) -> PushOutcome {
        loop {
            if self.is_stale(&task) {
                debug!(target: TARGET, task = task.id, address = %task.address, key = %task.data_info_id, "stale push suppressed");
                return PushOutcome::Stale;
            }
            if task.is_expired(Instant::now()) {
                warn!(target: TARGET, task = task.id, address = %task.address, attempts = task.attempts, "push task expired");
                return PushOutcome::Expired;
            }

            task.attempts += 1;
            match self.delivery.deliver(&task).await {
                DeliveryOutcome::Delivered => {
                    self.record_delivered(&task);
                    info!(
                        target: TARGET,
                        task = task.id,
                        address = %task.address,
                        key = %task.data_info_id,
                        subscribers = task.register_ids.len(),
                        attempts = task.attempts,
                        "push delivered"
                    );
                    return PushOutcome::Delivered;
                }
                DeliveryOutcome::ConnectionClosed => {
                    info!(target: TARGET, task = task.id, address = %task.address, "connection closed, push dropped");
                    return PushOutcome::ConnectionClosed;
                }
                DeliveryOutcome::Failed(reason) => {
                    if task.attempts >= self.policy.max_attempts {
                        let e = RegistryError::TaskExhausted {
                            task: format!("push {} to {}", task.id, task.address),
                            attempts: task.attempts,
                        };
                        error!(target: TARGET, key = %task.data_info_id, %reason, "{e}");
                        return PushOutcome::Exhausted;
                    }
                    let delay = self.policy.backoff(task.attempts);
                    debug!(target: TARGET, task = task.id, attempts = task.attempts, ?delay, %reason, "push failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// A task is stale when every data center it carries is older than
    /// what this address has already received.
    fn is_stale(&self, task: &PushTask) -> bool {
        if task.versions.is_empty() {
            return false;
        }
        let key = (task.address.clone(), task.data_info_id.clone());
        let Some(seen) = self.delivered.get(&key) else {
            return false;
        };
        task.versions
            .iter()
            .all(|(dc, v)| seen.get(dc).is_some_and(|last| v < last))
    }

    fn record_delivered(&self, task: &PushTask) {
        let key = (task.address.clone(), task.data_info_id.clone());
        let mut seen = self.delivered.entry(key).or_default();
        for (dc, version) in &task.versions {
            let last = seen.entry(dc.clone()).or_insert(0);
            *last = (*last).max(*version);
        }
    }

    /// Forget delivery history of a client whose connection closed.
    pub fn forget_address(&self, address: &str) {
        self.delivered.retain(|(addr, _), _| addr != address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Replays a script of outcomes, then delivers.
    struct ScriptedDelivery {
        script: Mutex<Vec<DeliveryOutcome>>,
        calls: Mutex<Vec<u64>>,
    }

    impl ScriptedDelivery {
        fn new(mut script: Vec<DeliveryOutcome>) -> Arc<Self> {
            script.reverse();
            Arc::new(Self {
                script: Mutex::new(script),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl PushDelivery for ScriptedDelivery {
        async fn deliver(&self, task: &PushTask) -> DeliveryOutcome {
            self.calls.lock().unwrap().push(task.id);
            self.script
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(DeliveryOutcome::Delivered)
        }
    }

    fn policy() -> PushPolicy {
        PushPolicy {
            max_attempts: 3,
            task_ttl: Duration::from_secs(30),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(10),
        }
    }

    fn task(version: u64) -> PushTask {
        let datum = Datum::new("svc", "dc1", version);
        PushTask::new(
            "10.0.0.1:5000",
            "svc",
            vec!["r1".to_string()],
            PushPayload::Merged(datum),
            [("dc1".to_string(), version)].into_iter().collect(),
            Duration::from_secs(30),
        )
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.backoff(1), Duration::from_millis(500));
        assert_eq!(p.backoff(2), Duration::from_secs(1));
        assert_eq!(p.backoff(3), Duration::from_secs(2));
        assert_eq!(p.backoff(10), Duration::from_secs(10));
        assert_eq!(p.backoff(64), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let delivery = ScriptedDelivery::new(vec![DeliveryOutcome::Failed("reset".into())]);
        let worker = PushWorker::new(delivery.clone(), policy());

        assert_eq!(worker.execute(task(1)).await, PushOutcome::Delivered);
        assert_eq!(delivery.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_stop_at_ceiling() {
        let failures = vec![DeliveryOutcome::Failed("reset".into()); 5];
        let delivery = ScriptedDelivery::new(failures);
        let worker = PushWorker::new(delivery.clone(), policy());

        assert_eq!(worker.execute(task(1)).await, PushOutcome::Exhausted);
        assert_eq!(delivery.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_connection_is_not_retried() {
        let delivery = ScriptedDelivery::new(vec![DeliveryOutcome::ConnectionClosed]);
        let worker = PushWorker::new(delivery.clone(), policy());

        assert_eq!(worker.execute(task(1)).await, PushOutcome::ConnectionClosed);
        assert_eq!(delivery.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_task_is_dropped() {
        let delivery = ScriptedDelivery::new(Vec::new());
        let worker = PushWorker::new(delivery.clone(), policy());
        let t = task(1);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(worker.execute(t).await, PushOutcome::Expired);
        assert_eq!(delivery.calls(), 0);
    }

    #[tokio::test]
    async fn older_versions_are_suppressed() {
        let delivery = ScriptedDelivery::new(Vec::new());
        let worker = PushWorker::new(delivery.clone(), policy());

        assert_eq!(worker.execute(task(5)).await, PushOutcome::Delivered);
        assert_eq!(worker.execute(task(4)).await, PushOutcome::Stale);
        // Same version again is not older: it is delivered.
        assert_eq!(worker.execute(task(5)).await, PushOutcome::Delivered);
        assert_eq!(delivery.calls(), 2);

        worker.forget_address("10.0.0.1:5000");
        assert_eq!(worker.execute(task(4)).await, PushOutcome::Delivered);
    }

    #[tokio::test]
    async fn full_queue_drops_new_tasks() {
        let (queue, mut rx) = push_channel(1);
        queue.submit(task(1)).unwrap();
        assert!(matches!(queue.submit(task(2)), Err(SessionError::QueueFull)));

        assert_eq!(rx.recv().await.unwrap().versions["dc1"], 1);
        drop(rx);
        assert!(matches!(queue.submit(task(3)), Err(SessionError::QueueClosed)));
    }
}
