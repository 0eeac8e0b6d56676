//! Subscriber index.
//!
//! Subscriptions are indexed by (partition key, scope), then by client
//! address. Each (key, scope) bucket is an immutable map replaced on
//! every write, so the push pipeline always works on a consistent copy
//! even while clients subscribe and unsubscribe concurrently.
//!
//! Re-subscription tracking is an optional capability: an index that
//! supports it returns a [`ReSubscribers`] handle from
//! [`Interests::resubscribers`]. A registration added again under the
//! same register id (a client re-subscribing after a reconnect) is
//! tracked until a push covering it goes out.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use meshreg_core::{DataInfoId, RegisterId, Scope, Subscriber};

/// Subscribers of one (key, scope), grouped by client address.
pub type SubscriberIndex = BTreeMap<String, BTreeMap<RegisterId, Subscriber>>;

/// Read side of the subscriber index used by the push pipeline.
pub trait Interests: Send + Sync {
    /// Snapshot of the subscribers of `data_info_id` with `scope`.
    fn query_subscriber_index(&self, data_info_id: &str, scope: Scope) -> Arc<SubscriberIndex>;

    /// Re-subscription tracking, if this index supports it.
    fn resubscribers(&self) -> Option<&dyn ReSubscribers> {
        None
    }
}

/// Subscribers waiting for a push that an earlier event scheduled.
pub trait ReSubscribers: Send + Sync {
    fn mark_resubscriber(&self, subscriber: &Subscriber);

    /// Stop tracking the given registrations. Returns how many were tracked.
    fn remove_resubscribers(&self, register_ids: &[RegisterId]) -> usize;

    fn is_resubscriber(&self, register_id: &str) -> bool;
}

/// In-memory subscriber index of a session node.
#[derive(Default)]
pub struct SessionInterests {
    index: DashMap<(DataInfoId, Scope), Arc<SubscriberIndex>>,
    by_id: DashMap<RegisterId, Subscriber>,
    resubscribers: DashMap<RegisterId, Subscriber>,
}

impl SessionInterests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a subscription. Replacing marks it as a re-subscriber.
    pub fn add(&self, subscriber: Subscriber) {
        if let Some(previous) = self.by_id.insert(subscriber.register_id.clone(), subscriber.clone()) {
            self.unindex(&previous);
            self.mark_resubscriber(&subscriber);
            debug!(register_id = %subscriber.register_id, "re-subscription");
        }

        let mut bucket = self
            .index
            .entry((subscriber.data_info_id.clone(), subscriber.scope))
            .or_default();
        let mut next = (**bucket).clone();
        next.entry(subscriber.source_address.clone())
            .or_default()
            .insert(subscriber.register_id.clone(), subscriber);
        *bucket = Arc::new(next);
    }

    /// Remove one subscription.
    pub fn remove(&self, register_id: &str) -> Option<Subscriber> {
        let (_, subscriber) = self.by_id.remove(register_id)?;
        self.unindex(&subscriber);
        self.resubscribers.remove(register_id);
        Some(subscriber)
    }

    /// Remove every subscription owned by a client whose connection closed.
    pub fn remove_by_connection(&self, source_address: &str) -> Vec<Subscriber> {
        let owned: Vec<RegisterId> = self
            .by_id
            .iter()
            .filter(|s| s.source_address == source_address)
            .map(|s| s.register_id.clone())
            .collect();

        let removed: Vec<Subscriber> = owned.iter().filter_map(|id| self.remove(id)).collect();
        if !removed.is_empty() {
            debug!(%source_address, count = removed.len(), "connection closed, subscribers removed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    fn unindex(&self, subscriber: &Subscriber) {
        let key = (subscriber.data_info_id.clone(), subscriber.scope);
        let Some(mut bucket) = self.index.get_mut(&key) else {
            return;
        };
        let mut next = (**bucket).clone();
        if let Some(regs) = next.get_mut(&subscriber.source_address) {
            regs.remove(&subscriber.register_id);
            if regs.is_empty() {
                next.remove(&subscriber.source_address);
            }
        }
        let now_empty = next.is_empty();
        *bucket = Arc::new(next);
        drop(bucket);

        if now_empty {
            self.index.remove_if(&key, |_, b| b.is_empty());
        }
    }
}

impl Interests for SessionInterests {
    fn query_subscriber_index(&self, data_info_id: &str, scope: Scope) -> Arc<SubscriberIndex> {
        self.index
            .get(&(data_info_id.to_string(), scope))
            .map(|b| Arc::clone(&b))
            .unwrap_or_default()
    }

    fn resubscribers(&self) -> Option<&dyn ReSubscribers> {
        Some(self)
    }
}

impl ReSubscribers for SessionInterests {
    fn mark_resubscriber(&self, subscriber: &Subscriber) {
        self.resubscribers
            .insert(subscriber.register_id.clone(), subscriber.clone());
    }

    fn remove_resubscribers(&self, register_ids: &[RegisterId]) -> usize {
        register_ids
            .iter()
            .filter(|id| self.resubscribers.remove(*id).is_some())
            .count()
    }

    fn is_resubscriber(&self, register_id: &str) -> bool {
        self.resubscribers.contains_key(register_id)
    }
}
