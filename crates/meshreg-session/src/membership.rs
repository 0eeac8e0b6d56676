//! Client-side membership cache.
//!
//! Session and data nodes heartbeat the meta leader on a fixed interval
//! and cache the returned cluster view as one immutable [`ClusterState`].
//! A new state replaces the old one in a single atomic swap, so readers
//! never see a half-applied update. Failed cycles leave the previous
//! state in place and force leader re-resolution on the next cycle.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::{ArcSwap, ArcSwapOption};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use meshreg_core::rpc::{HeartbeatRequest, HeartbeatResponse};
use meshreg_core::{Epoch, NodeIdentity, NodeType, ProvideData, RegistryError, SlotTable};

use crate::client::MetaChannel;
use crate::error::{SessionError, SessionResult};

/// Cluster view returned by the last successful heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClusterState {
    pub epoch: Epoch,
    /// Remote data centers advertised by the meta tier.
    pub data_centers: BTreeSet<String>,
    /// Live session nodes keyed by address.
    pub session_nodes: BTreeMap<String, NodeIdentity>,
    /// Addresses of live data nodes.
    pub data_servers: BTreeSet<String>,
    /// Addresses of live meta nodes.
    pub meta_servers: BTreeSet<String>,
    /// Empty for data nodes, which only learn their own slots.
    pub slot_table: SlotTable,
}

impl ClusterState {
    pub fn from_response(response: &HeartbeatResponse) -> Self {
        let session_nodes = match response.session_nodes() {
            Some(nodes) => nodes.clone(),
            None => response
                .members_of(NodeType::Session)
                .map(|n| (n.address.clone(), n.clone()))
                .collect(),
        };
        Self {
            epoch: response.epoch(),
            data_centers: response.data_centers().clone(),
            session_nodes,
            data_servers: addresses(response, NodeType::Data),
            meta_servers: addresses(response, NodeType::Meta),
            slot_table: response.slot_table().cloned().unwrap_or_default(),
        }
    }
}

fn addresses(response: &HeartbeatResponse, node_type: NodeType) -> BTreeSet<String> {
    response
        .members_of(node_type)
        .map(|n| n.address.clone())
        .collect()
}

/// Read-only view of the cluster used by the push pipeline.
pub trait ClusterView: Send + Sync {
    /// Every data center to fetch datums from, local one included.
    fn data_centers(&self) -> BTreeSet<String>;

    fn local_data_center(&self) -> &str;
}

pub struct MembershipCache {
    local: NodeIdentity,
    local_data_center: String,
    channel: Arc<dyn MetaChannel>,
    /// Seed list used to re-resolve the leader.
    meta_servers: Vec<String>,
    lease_secs: u64,
    leader: ArcSwapOption<String>,
    state: ArcSwap<ClusterState>,
}

impl MembershipCache {
    pub fn new(
        local: NodeIdentity,
        local_data_center: impl Into<String>,
        channel: Arc<dyn MetaChannel>,
        meta_servers: Vec<String>,
        lease_secs: u64,
    ) -> Self {
        Self {
            local,
            local_data_center: local_data_center.into(),
            channel,
            meta_servers,
            lease_secs,
            leader: ArcSwapOption::empty(),
            state: ArcSwap::from_pointee(ClusterState::default()),
        }
    }

    /// Run one renewal cycle against the leader.
    ///
    /// Returns the epoch of the cached state after the cycle.
    pub async fn renew_once(&self) -> SessionResult<Epoch> {
        let leader = match self.leader.load_full() {
            Some(leader) => (*leader).clone(),
            None => self.resolve_leader().await?,
        };

        let request = HeartbeatRequest::new(self.local.clone(), self.lease_secs);
        let envelope = match self.channel.renew(&leader, &request).await {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(%leader, error = %e, "heartbeat failed, keeping cached state");
                self.leader.store(None);
                return Err(e.into());
            }
        };

        let response = match envelope.into_result() {
            Ok(response) => response,
            Err(message) => {
                warn!(%leader, %message, "heartbeat rejected, keeping cached state");
                self.leader.store(None);
                return Err(SessionError::Rejected(message));
            }
        };

        Ok(self.apply(&response))
    }

    /// Swap in the state carried by `response` unless it is older than
    /// the cached one. Returns the epoch now cached.
    pub fn apply(&self, response: &HeartbeatResponse) -> Epoch {
        let current = self.state.load();
        if response.epoch() < current.epoch {
            debug!(
                cached = current.epoch,
                received = response.epoch(),
                "ignoring stale cluster state"
            );
            return current.epoch;
        }

        let next = ClusterState::from_response(response);
        if next.epoch > current.epoch {
            info!(
                epoch = next.epoch,
                sessions = next.session_nodes.len(),
                data_servers = next.data_servers.len(),
                "cluster state updated"
            );
        }
        let epoch = next.epoch;
        self.state.store(Arc::new(next));
        epoch
    }

    /// Ask each known meta node who leads, and remember the answer.
    pub async fn resolve_leader(&self) -> SessionResult<String> {
        let mut candidates: Vec<String> = self.meta_servers.clone();
        for peer in &self.state.load().meta_servers {
            if !candidates.contains(peer) {
                candidates.push(peer.clone());
            }
        }

        for meta in &candidates {
            match self.channel.leader(meta).await {
                Ok(envelope) => match envelope.into_result() {
                    Ok(info) => {
                        if let Some(leader) = info.leader {
                            info!(%meta, leader = %leader.address, "meta leader resolved");
                            self.leader.store(Some(Arc::new(leader.address.clone())));
                            return Ok(leader.address);
                        }
                        debug!(%meta, "meta node knows no leader");
                    }
                    Err(message) => debug!(%meta, %message, "leader query rejected"),
                },
                Err(e) => debug!(%meta, error = %e, "leader query failed"),
            }
        }

        Err(RegistryError::Leadership { leader: None }.into())
    }

    /// Renew until `shutdown` flips. Failures are logged and retried on
    /// the next tick.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        debug!(node = %self.local, ?interval, "membership renewal starting");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.renew_once().await {
                        debug!(error = %e, "renewal cycle failed");
                    }
                }
                _ = shutdown.changed() => {
                    debug!("membership renewal shutting down");
                    break;
                }
            }
        }
    }

    /// Fetch a provide-data record from the leader.
    pub async fn fetch_provide_data(&self, data_info_id: &str) -> SessionResult<ProvideData> {
        let leader = match self.leader.load_full() {
            Some(leader) => (*leader).clone(),
            None => self.resolve_leader().await?,
        };
        self.channel
            .fetch_provide_data(&leader, data_info_id)
            .await?
            .into_result()
            .map_err(SessionError::Rejected)
    }

    /// The current cached state. Never blocks.
    pub fn state(&self) -> Arc<ClusterState> {
        self.state.load_full()
    }

    pub fn epoch(&self) -> Epoch {
        self.state.load().epoch
    }

    pub fn leader(&self) -> Option<String> {
        self.leader.load_full().map(|l| (*l).clone())
    }

    /// Session nodes in `zone`, or every session node when `zone` is `None`.
    pub fn zone_session_servers(&self, zone: Option<&str>) -> Vec<NodeIdentity> {
        self.state
            .load()
            .session_nodes
            .values()
            .filter(|n| zone.is_none_or(|z| n.region == z))
            .cloned()
            .collect()
    }

    pub fn data_servers(&self) -> BTreeSet<String> {
        self.state.load().data_servers.clone()
    }
}

impl ClusterView for MembershipCache {
    fn data_centers(&self) -> BTreeSet<String> {
        let mut all = self.state.load().data_centers.clone();
        all.insert(self.local_data_center.clone());
        all
    }

    fn local_data_center(&self) -> &str {
        &self.local_data_center
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use meshreg_core::rpc::{GenericResponse, LeaderInfo, SessionHeartbeat};
    use meshreg_core::RegistryResult;

    /// Scripted meta tier: answers leader queries with `leader` and
    /// heartbeats from a queue of canned responses.
    struct FakeMeta {
        leader: Option<String>,
        replies: Mutex<Vec<RegistryResult<GenericResponse<HeartbeatResponse>>>>,
        renew_targets: Mutex<Vec<String>>,
    }

    impl FakeMeta {
        fn new(leader: &str, mut replies: Vec<RegistryResult<GenericResponse<HeartbeatResponse>>>) -> Self {
            replies.reverse();
            Self {
                leader: Some(leader.to_string()),
                replies: Mutex::new(replies),
                renew_targets: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl MetaChannel for FakeMeta {
        async fn renew(
            &self,
            meta: &str,
            _request: &HeartbeatRequest,
        ) -> RegistryResult<GenericResponse<HeartbeatResponse>> {
            self.renew_targets.lock().unwrap().push(meta.to_string());
            self.replies
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(RegistryError::Transport("no reply scripted".into())))
        }

        async fn leader(&self, _meta: &str) -> RegistryResult<GenericResponse<LeaderInfo>> {
            Ok(GenericResponse::succeed(LeaderInfo {
                leader: self.leader.as_ref().map(|l| NodeIdentity::meta(l.clone(), "z")),
                epoch: 0,
            }))
        }

        async fn fetch_provide_data(
            &self,
            _meta: &str,
            data_info_id: &str,
        ) -> RegistryResult<GenericResponse<ProvideData>> {
            Ok(GenericResponse::succeed(ProvideData {
                data_info_id: data_info_id.to_string(),
                version: 1,
                value: None,
            }))
        }
    }

    fn session_reply(epoch: Epoch, sessions: &[(&str, &str)]) -> RegistryResult<GenericResponse<HeartbeatResponse>> {
        let mut members: Vec<NodeIdentity> = sessions
            .iter()
            .map(|(addr, zone)| NodeIdentity::session(*addr, *zone))
            .collect();
        members.push(NodeIdentity::data("d1", "zone-a"));
        Ok(GenericResponse::succeed(HeartbeatResponse::Session(SessionHeartbeat {
            epoch,
            slot_table: SlotTable::empty(),
            session_nodes: members
                .iter()
                .filter(|m| m.node_type == NodeType::Session)
                .map(|m| (m.address.clone(), m.clone()))
                .collect(),
            cluster_members: members,
            data_centers: ["dc2".to_string()].into_iter().collect(),
        })))
    }

    fn cache(meta: Arc<FakeMeta>) -> MembershipCache {
        MembershipCache::new(
            NodeIdentity::session("s1", "zone-a"),
            "dc1",
            meta,
            vec!["m1:9615".to_string()],
            15,
        )
    }

    #[tokio::test]
    async fn successful_renewal_replaces_state() {
        let meta = Arc::new(FakeMeta::new("m1:9615", vec![session_reply(3, &[("s1", "zone-a"), ("s2", "zone-b")])]));
        let cache = cache(meta.clone());

        assert_eq!(cache.renew_once().await.unwrap(), 3);
        assert_eq!(cache.leader().as_deref(), Some("m1:9615"));

        let state = cache.state();
        assert_eq!(state.session_nodes.len(), 2);
        assert!(state.data_servers.contains("d1"));
        assert_eq!(state.data_centers.len(), 1);
        assert_eq!(cache.data_centers().len(), 2);
        assert_eq!(cache.zone_session_servers(Some("zone-b")).len(), 1);
        assert_eq!(cache.zone_session_servers(None).len(), 2);
    }

    #[tokio::test]
    async fn older_epoch_is_ignored() {
        let meta = Arc::new(FakeMeta::new(
            "m1:9615",
            vec![session_reply(5, &[("s1", "zone-a")]), session_reply(4, &[])],
        ));
        let cache = cache(meta);

        cache.renew_once().await.unwrap();
        assert_eq!(cache.renew_once().await.unwrap(), 5);
        assert_eq!(cache.state().session_nodes.len(), 1);
    }

    #[tokio::test]
    async fn failure_keeps_state_and_drops_leader() {
        let meta = Arc::new(FakeMeta::new(
            "m1:9615",
            vec![
                session_reply(2, &[("s1", "zone-a")]),
                Ok(GenericResponse::failed("not leader (current leader: unknown)")),
                Err(RegistryError::Transport("connection refused".into())),
            ],
        ));
        let cache = cache(meta);
        cache.renew_once().await.unwrap();

        let err = cache.renew_once().await.unwrap_err();
        assert!(matches!(err, SessionError::Rejected(_)));
        assert!(cache.leader().is_none());
        assert_eq!(cache.epoch(), 2);

        assert!(cache.renew_once().await.is_err());
        assert_eq!(cache.state().session_nodes.len(), 1);
    }

    #[tokio::test]
    async fn unresolvable_leader_is_a_leadership_error() {
        let meta = Arc::new(FakeMeta {
            leader: None,
            replies: Mutex::new(Vec::new()),
            renew_targets: Mutex::new(Vec::new()),
        });
        let cache = cache(meta.clone());

        let err = cache.renew_once().await.unwrap_err();
        assert!(matches!(err, SessionError::Registry(RegistryError::Leadership { .. })));
        assert!(meta.renew_targets.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn provide_data_goes_to_leader() {
        let meta = Arc::new(FakeMeta::new("m1:9615", Vec::new()));
        let cache = cache(meta);
        let data = cache.fetch_provide_data("switch").await.unwrap();
        assert_eq!(data.data_info_id, "switch");
    }
}
