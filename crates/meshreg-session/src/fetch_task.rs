//! Change fetch pipeline.
//!
//! For one changed partition key: fetch the key's datum from every data
//! center, walk the subscriber index scope by scope, and submit one push
//! task per client address. Data centers that fail to answer are left out
//! of the push; a key with no datum anywhere produces no push.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use meshreg_core::{RegisterId, RegistryError, Scope};

use crate::converter::build_payload;
use crate::datum_cache::DatumCache;
use crate::error::{SessionError, SessionResult};
use crate::interests::Interests;
use crate::membership::ClusterView;
use crate::push::{PushQueue, PushTask};

/// What one pipeline run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchReport {
    /// Push tasks accepted by the queue.
    pub pushed: usize,
    /// Push tasks dropped because the queue was full.
    pub dropped: usize,
    /// Data centers whose fetch failed.
    pub missing: Vec<String>,
}

pub struct ChangeFetchPipeline {
    interests: Arc<dyn Interests>,
    datums: Arc<DatumCache>,
    cluster: Arc<dyn ClusterView>,
    queue: PushQueue,
    push_ttl: Duration,
}

impl ChangeFetchPipeline {
    pub fn new(
        interests: Arc<dyn Interests>,
        datums: Arc<DatumCache>,
        cluster: Arc<dyn ClusterView>,
        queue: PushQueue,
        push_ttl: Duration,
    ) -> Self {
        Self {
            interests,
            datums,
            cluster,
            queue,
            push_ttl,
        }
    }

    /// Handle a change notification: drop cached datums for the key and
    /// push fresh ones.
    pub async fn on_change(&self, data_info_id: &str) -> SessionResult<FetchReport> {
        self.datums.invalidate(data_info_id);
        self.process(data_info_id).await
    }

    /// Push the current datums of `data_info_id` to every subscriber.
    pub async fn process(&self, data_info_id: &str) -> SessionResult<FetchReport> {
        if data_info_id.is_empty() {
            return Err(RegistryError::MalformedRequest("empty data info id".into()).into());
        }

        let data_centers = self.cluster.data_centers();
        let fetched = self.datums.get_values(data_info_id, &data_centers).await;
        let mut report = FetchReport {
            missing: fetched.failed.clone(),
            ..FetchReport::default()
        };

        if fetched.is_partial() {
            let e = RegistryError::PartialData {
                missing: fetched.failed.clone(),
            };
            warn!(key = data_info_id, fetched = fetched.datums.len(), "{e}");
        }
        if fetched.is_empty() {
            info!(key = data_info_id, "no datum from any data center, nothing to push");
            return Ok(report);
        }

        let versions: BTreeMap<String, u64> = fetched
            .datums
            .iter()
            .map(|(dc, d)| (dc.clone(), d.version))
            .collect();
        let local_dc = self.cluster.local_data_center();

        for scope in Scope::ALL {
            let index = self.interests.query_subscriber_index(data_info_id, scope);
            if index.is_empty() {
                continue;
            }

            for (address, subscribers) in index.iter() {
                let Some(representative) = subscribers.values().next() else {
                    continue;
                };
                let register_ids: Vec<RegisterId> = subscribers.keys().cloned().collect();

                if let Some(tracker) = self.interests.resubscribers() {
                    let cleared = tracker.remove_resubscribers(&register_ids);
                    if cleared > 0 {
                        debug!(%address, key = data_info_id, cleared, "pending re-subscribers superseded");
                    }
                }

                let payload = build_payload(data_info_id, representative, &fetched.datums, local_dc);
                let task = PushTask::new(
                    address.clone(),
                    data_info_id,
                    register_ids,
                    payload,
                    versions.clone(),
                    self.push_ttl,
                );

                match self.queue.submit(task) {
                    Ok(()) => report.pushed += 1,
                    Err(SessionError::QueueFull) => report.dropped += 1,
                    Err(e) => return Err(e),
                }
            }
        }

        debug!(
            key = data_info_id,
            pushed = report.pushed,
            dropped = report.dropped,
            "change fetch complete"
        );
        Ok(report)
    }
}
