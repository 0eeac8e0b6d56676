//! Provide-data registry — versioned configuration values served to
//! session and data nodes by the Fetch Provided-Data RPC.

use dashmap::DashMap;
use tracing::{debug, info};

use meshreg_core::rpc::{FetchProvideDataRequest, GenericResponse};
use meshreg_core::{DataInfoId, ProvideData};

#[derive(Default)]
pub struct ProvideDataRegistry {
    records: DashMap<DataInfoId, ProvideData>,
}

impl ProvideDataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `data_info_id`, bumping its version.
    pub fn put(&self, data_info_id: &str, value: Option<serde_json::Value>) -> ProvideData {
        let mut entry = self
            .records
            .entry(data_info_id.to_string())
            .or_insert_with(|| ProvideData {
                data_info_id: data_info_id.to_string(),
                version: 0,
                value: None,
            });
        entry.version += 1;
        entry.value = value;
        info!(data_info_id, version = entry.version, "provide data updated");
        entry.clone()
    }

    pub fn get(&self, data_info_id: &str) -> Option<ProvideData> {
        self.records.get(data_info_id).map(|r| r.clone())
    }

    pub fn handle_fetch(&self, request: &FetchProvideDataRequest) -> GenericResponse<ProvideData> {
        if request.data_info_id.is_empty() {
            return GenericResponse::failed("malformed request: empty data info id");
        }
        match self.get(&request.data_info_id) {
            Some(data) => GenericResponse::succeed(data),
            None => {
                debug!(data_info_id = %request.data_info_id, "provide data not found");
                GenericResponse::failed(format!("no provide data for {}", request.data_info_id))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetch(id: &str) -> FetchProvideDataRequest {
        FetchProvideDataRequest {
            data_info_id: id.to_string(),
        }
    }

    #[test]
    fn put_bumps_version() {
        let registry = ProvideDataRegistry::new();
        assert_eq!(registry.put("session.switch", Some(serde_json::json!(true))).version, 1);
        let second = registry.put("session.switch", Some(serde_json::json!(false)));
        assert_eq!(second.version, 2);
        assert_eq!(second.value, Some(serde_json::json!(false)));
    }

    #[test]
    fn fetch_returns_envelope() {
        let registry = ProvideDataRegistry::new();
        registry.put("blacklist", Some(serde_json::json!(["10.0.0.1"])));

        let ok = registry.handle_fetch(&fetch("blacklist"));
        assert!(ok.success);
        assert_eq!(ok.data.unwrap().version, 1);

        let missing = registry.handle_fetch(&fetch("nope"));
        assert!(!missing.success);
        assert!(!registry.handle_fetch(&fetch("")).success);
    }
}
