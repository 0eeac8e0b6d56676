//! Datum cache keyed by (partition key, data center).
//!
//! Misses go to the data tier through a [`DatumFetcher`]. A change
//! notification invalidates every data center's entry for the key so the
//! next read fetches fresh snapshots.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, warn};

use meshreg_core::{DataInfoId, Datum, RegistryResult};

/// Remote read access to the data tier.
#[async_trait]
pub trait DatumFetcher: Send + Sync {
    /// Latest datum of `data_info_id` in `data_center`; `None` when the
    /// key has no publishers there.
    async fn fetch(&self, data_info_id: &str, data_center: &str) -> RegistryResult<Option<Datum>>;
}

/// Datums gathered from several data centers for one key.
#[derive(Debug, Clone, Default)]
pub struct FetchedDatums {
    pub datums: BTreeMap<String, Arc<Datum>>,
    /// Data centers whose fetch failed.
    pub failed: Vec<String>,
}

impl FetchedDatums {
    pub fn is_empty(&self) -> bool {
        self.datums.is_empty()
    }

    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty()
    }
}

pub struct DatumCache {
    fetcher: Arc<dyn DatumFetcher>,
    entries: DashMap<(DataInfoId, String), Arc<Datum>>,
}

impl DatumCache {
    pub fn new(fetcher: Arc<dyn DatumFetcher>) -> Self {
        Self {
            fetcher,
            entries: DashMap::new(),
        }
    }

    /// Cached datum, fetched on a miss.
    pub async fn get(&self, data_info_id: &str, data_center: &str) -> RegistryResult<Option<Arc<Datum>>> {
        let key = (data_info_id.to_string(), data_center.to_string());
        if let Some(hit) = self.entries.get(&key) {
            return Ok(Some(Arc::clone(&hit)));
        }

        let Some(datum) = self.fetcher.fetch(data_info_id, data_center).await? else {
            return Ok(None);
        };
        let datum = Arc::new(datum);
        // Keep the newer of two racing fetches.
        let stored = self
            .entries
            .entry(key)
            .and_modify(|cur| {
                if cur.version < datum.version {
                    *cur = Arc::clone(&datum);
                }
            })
            .or_insert_with(|| Arc::clone(&datum))
            .clone();
        Ok(Some(stored))
    }

    /// Fetch `data_info_id` from every data center in `data_centers`.
    ///
    /// Individual failures are logged and reported in
    /// [`FetchedDatums::failed`]; they never fail the whole call.
    pub async fn get_values(&self, data_info_id: &str, data_centers: &BTreeSet<String>) -> FetchedDatums {
        let mut fetched = FetchedDatums::default();
        for dc in data_centers {
            match self.get(data_info_id, dc).await {
                Ok(Some(datum)) => {
                    fetched.datums.insert(dc.clone(), datum);
                }
                Ok(None) => debug!(data_info_id, data_center = %dc, "no datum"),
                Err(e) => {
                    warn!(data_info_id, data_center = %dc, error = %e, "datum fetch failed");
                    fetched.failed.push(dc.clone());
                }
            }
        }
        fetched
    }

    /// Drop every cached data center entry for `data_info_id`.
    pub fn invalidate(&self, data_info_id: &str) {
        self.entries.retain(|(key, _), _| key != data_info_id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use meshreg_core::RegistryError;

    struct CountingFetcher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DatumFetcher for CountingFetcher {
        async fn fetch(&self, data_info_id: &str, data_center: &str) -> RegistryResult<Option<Datum>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as u64;
            match data_center {
                "down" => Err(RegistryError::Transport("connection refused".into())),
                "empty" => Ok(None),
                _ => Ok(Some(Datum::new(data_info_id, data_center, n + 1))),
            }
        }
    }

    fn cache() -> (Arc<CountingFetcher>, DatumCache) {
        let fetcher = Arc::new(CountingFetcher {
            calls: AtomicUsize::new(0),
        });
        (fetcher.clone(), DatumCache::new(fetcher))
    }

    fn dcs(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn hits_do_not_refetch() {
        let (fetcher, cache) = cache();
        cache.get("svc", "dc1").await.unwrap();
        cache.get("svc", "dc1").await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

        cache.invalidate("svc");
        assert!(cache.is_empty());
        let datum = cache.get("svc", "dc1").await.unwrap().unwrap();
        assert_eq!(datum.version, 2);
    }

    #[tokio::test]
    async fn get_values_reports_failures_separately() {
        let (_, cache) = cache();
        let fetched = cache.get_values("svc", &dcs(&["dc1", "down", "empty"])).await;
        assert_eq!(fetched.datums.len(), 1);
        assert_eq!(fetched.failed, vec!["down".to_string()]);
        assert!(fetched.is_partial());
    }
}
