//! HTTP implementations of the data-tier fetcher and client push
//! delivery, used by the daemon.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::Method;
use serde::Serialize;
use tracing::debug;

use meshreg_core::rpc::{FetchDatumRequest, FetchDatumResponse, GenericResponse};
use meshreg_core::{Datum, RegisterId, RegistryError, RegistryResult, slot_of_key};

use crate::client::{CallError, http_call, json_call};
use crate::datum_cache::DatumFetcher;
use crate::membership::MembershipCache;
use crate::push::{DeliveryOutcome, PushDelivery, PushPayload, PushTask};

/// Fetches datums from the data node leading the key's slot.
pub struct HttpDatumFetcher {
    cluster: Arc<MembershipCache>,
    timeout: Duration,
}

impl HttpDatumFetcher {
    pub fn new(cluster: Arc<MembershipCache>, timeout: Duration) -> Self {
        Self { cluster, timeout }
    }
}

#[async_trait]
impl DatumFetcher for HttpDatumFetcher {
    async fn fetch(&self, data_info_id: &str, data_center: &str) -> RegistryResult<Option<Datum>> {
        let state = self.cluster.state();
        let table = &state.slot_table;
        let slot = slot_of_key(data_info_id, table.len() as u32);
        let Some(leader) = table.leader_of(slot) else {
            // No live data node: data temporarily unavailable.
            debug!(data_info_id, slot, "slot has no leader");
            return Ok(None);
        };

        let request = FetchDatumRequest {
            data_info_id: data_info_id.to_string(),
            data_center: data_center.to_string(),
        };
        let envelope: GenericResponse<FetchDatumResponse> = json_call(
            leader,
            Method::POST,
            "/api/v1/datum/fetch",
            Some(&request),
            self.timeout,
        )
        .await?;

        envelope
            .into_result()
            .map(|r| r.datum)
            .map_err(|message| RegistryError::Transport(format!("data node {leader}: {message}")))
    }
}

#[derive(Serialize)]
struct PushMessage<'a> {
    data_info_id: &'a str,
    register_ids: &'a [RegisterId],
    payload: &'a PushPayload,
}

/// Posts push payloads to the client address.
pub struct HttpPushDelivery {
    timeout: Duration,
}

impl HttpPushDelivery {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl PushDelivery for HttpPushDelivery {
    async fn deliver(&self, task: &PushTask) -> DeliveryOutcome {
        let message = PushMessage {
            data_info_id: &task.data_info_id,
            register_ids: &task.register_ids,
            payload: &task.payload,
        };
        let body = match serde_json::to_vec(&message) {
            Ok(body) => body,
            Err(e) => return DeliveryOutcome::Failed(e.to_string()),
        };

        match http_call(&task.address, Method::POST, "/api/v1/push", body, self.timeout).await {
            Ok(_) => DeliveryOutcome::Delivered,
            Err(CallError::Connect(_)) => DeliveryOutcome::ConnectionClosed,
            Err(CallError::Exchange(reason)) => DeliveryOutcome::Failed(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn refused_connection_is_closed_not_failed() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let task = PushTask::new(
            addr,
            "svc",
            vec!["r1".to_string()],
            PushPayload::MultiDatum(Vec::new()),
            BTreeMap::new(),
            Duration::from_secs(30),
        );
        let delivery = HttpPushDelivery::new(Duration::from_secs(1));
        assert_eq!(delivery.deliver(&task).await, DeliveryOutcome::ConnectionClosed);
    }
}
