//! meshreg-session — the session tier of the meshreg registry.
//!
//! Session nodes hold client connections. They keep a cached view of the
//! cluster from meta heartbeats, and turn data-change notifications into
//! pushes to subscribed clients.
//!
//! # Architecture
//!
//! - **`client`** — `MetaChannel` trait and its HTTP implementation
//! - **`membership`** — `MembershipCache`: periodic renewal + cluster snapshot
//! - **`interests`** — subscriber index with re-subscriber tracking
//! - **`datum_cache`** — per-(key, data center) datum cache
//! - **`converter`** — scope filtering and datum merging
//! - **`fetch_task`** — `ChangeFetchPipeline`: fetch, fan out, enqueue
//! - **`dispatcher`** — coalescing change queue with retry ceiling
//! - **`push`** — bounded push queue and retrying delivery worker
//! - **`transport`** — HTTP datum fetcher and push delivery

pub mod client;
pub mod converter;
pub mod datum_cache;
pub mod dispatcher;
pub mod error;
pub mod fetch_task;
pub mod interests;
pub mod membership;
pub mod push;
pub mod transport;

pub use client::{HttpMetaChannel, MetaChannel};
pub use datum_cache::{DatumCache, DatumFetcher, FetchedDatums};
pub use dispatcher::{ChangeDispatcher, ChangeNotifier, change_channel};
pub use error::{SessionError, SessionResult};
pub use fetch_task::{ChangeFetchPipeline, FetchReport};
pub use interests::{Interests, ReSubscribers, SessionInterests, SubscriberIndex};
pub use membership::{ClusterState, ClusterView, MembershipCache};
pub use push::{
    DeliveryOutcome, PushDelivery, PushOutcome, PushPayload, PushPolicy, PushQueue, PushTask,
    PushWorker, push_channel,
};
pub use transport::{HttpDatumFetcher, HttpPushDelivery};
