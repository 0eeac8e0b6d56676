//! meshreg.toml configuration parser.
//!
//! Every section and field is optional; missing values fall back to the
//! defaults below so a node can start from an empty file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub node: NodeConfig,
    pub meta: MetaConfig,
    pub session: SessionConfig,
}

/// Identity of the local process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub address: String,
    pub region: String,
    pub data_center: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:9615".to_string(),
            region: "default-zone".to_string(),
            data_center: "default-dc".to_string(),
        }
    }
}

/// Meta tier settings: lease bounds, sweep cadence and slot layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaConfig {
    pub min_lease_secs: u64,
    pub max_lease_secs: u64,
    pub sweep_interval_secs: u64,
    pub slot_num: u32,
    /// Leader plus followers per slot.
    pub slot_replicas: u32,
    /// Remote data centers advertised to session nodes.
    pub data_centers: Vec<String>,
    pub data_dir: PathBuf,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            min_lease_secs: 5,
            max_lease_secs: 60,
            sweep_interval_secs: 5,
            slot_num: 256,
            slot_replicas: 2,
            data_centers: Vec::new(),
            data_dir: PathBuf::from("/var/lib/meshreg"),
        }
    }
}

impl MetaConfig {
    /// Clamp a node-requested lease duration into the server bounds.
    pub fn clamp_lease(&self, requested: Duration) -> Duration {
        let min = Duration::from_secs(self.min_lease_secs);
        let max = Duration::from_secs(self.max_lease_secs.max(self.min_lease_secs));
        requested.clamp(min, max)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Session tier settings: meta renewal, fetch retries and push delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub meta_servers: Vec<String>,
    pub renew_interval_secs: u64,
    pub lease_secs: u64,
    pub rpc_timeout_ms: u64,
    pub data_change_fetch_retry_times: u32,
    pub push_queue_capacity: usize,
    pub push_max_attempts: u32,
    pub push_task_expiry_secs: u64,
    pub push_backoff_base_ms: u64,
    pub push_backoff_max_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            meta_servers: vec!["127.0.0.1:9615".to_string()],
            renew_interval_secs: 5,
            lease_secs: 15,
            rpc_timeout_ms: 3000,
            data_change_fetch_retry_times: 3,
            push_queue_capacity: 1024,
            push_max_attempts: 5,
            push_task_expiry_secs: 30,
            push_backoff_base_ms: 500,
            push_backoff_max_ms: 10_000,
        }
    }
}

impl SessionConfig {
    pub fn renew_interval(&self) -> Duration {
        Duration::from_secs(self.renew_interval_secs.max(1))
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

impl RegistryConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: RegistryConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = RegistryConfig::from_toml_str("").unwrap();
        assert_eq!(config.meta.slot_num, 256);
        assert_eq!(config.session.lease_secs, 15);
        assert_eq!(config.node.data_center, "default-dc");
    }

    #[test]
    fn parse_partial_sections() {
        let toml_str = r#"
[node]
address = "10.0.0.5:9615"
data_center = "dc1"

[meta]
slot_num = 16
data_centers = ["dc2"]

[session]
meta_servers = ["10.0.0.1:9615", "10.0.0.2:9615"]
"#;
        let config = RegistryConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.node.address, "10.0.0.5:9615");
        assert_eq!(config.node.region, "default-zone");
        assert_eq!(config.meta.slot_num, 16);
        assert_eq!(config.meta.max_lease_secs, 60);
        assert_eq!(config.meta.data_centers, vec!["dc2"]);
        assert_eq!(config.session.meta_servers.len(), 2);
    }

    #[test]
    fn clamp_lease_respects_bounds() {
        let meta = MetaConfig::default();
        assert_eq!(meta.clamp_lease(Duration::from_secs(1)), Duration::from_secs(5));
        assert_eq!(meta.clamp_lease(Duration::from_secs(600)), Duration::from_secs(60));
        assert_eq!(meta.clamp_lease(Duration::from_secs(15)), Duration::from_secs(15));
    }

    #[test]
    fn roundtrip_through_toml() {
        let config = RegistryConfig::default();
        let s = config.to_toml_string().unwrap();
        assert!(s.contains("slot_replicas"));
    }
}
