//! Configuration schema and loader for quorus storage nodes.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's listen address.
    pub listen: SocketAddr,

    /// Known cluster member addresses (including this node).
    #[serde(default)]
    pub members: Vec<String>,

    /// Replication parameters.
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// CPU watchdog participates in adaptive throttling.
    #[serde(default = "default_true")]
    pub wd_cpu_enabled: bool,

    /// Disk watchdog participates in adaptive throttling.
    #[serde(default = "default_true")]
    pub wd_disk_enabled: bool,

    /// Minimum seconds between auto-compaction runs.
    #[serde(default = "default_auto_compaction_interval")]
    pub auto_compaction_interval: u64,

    /// Parallelism handed to the store's compactor.
    #[serde(default = "default_auto_compaction_parallel_procs")]
    pub auto_compaction_parallel_procs: usize,

    /// Peer RPC deadline, milliseconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,

    /// Worker-pool admission high-water mark.
    #[serde(default = "default_worker_pool_pending_limit")]
    pub worker_pool_pending_limit: usize,

    /// Pause before reading compactor state on a fragmentation alarm.
    #[serde(default = "default_compaction_pre_wait_ms")]
    pub compaction_pre_wait_ms: u64,

    /// Storage containers on this node.
    #[serde(default = "default_containers")]
    pub containers: u32,

    /// Virtual nodes per ring.
    #[serde(default = "default_vnodes")]
    pub vnodes: u32,

    /// Optional Prometheus metrics HTTP port.
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Replication factor (N).
    #[serde(default = "default_n")]
    pub n: usize,

    /// Write quorum (W).
    #[serde(default = "default_w")]
    pub w: usize,

    /// Read quorum (R).
    #[serde(default = "default_r")]
    pub r: usize,

    /// Delete quorum (D).
    #[serde(default = "default_d")]
    pub d: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            n: default_n(),
            w: default_w(),
            r: default_r(),
            d: default_d(),
        }
    }
}

impl NodeConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout)
    }

    pub fn compaction_pre_wait(&self) -> Duration {
        Duration::from_millis(self.compaction_pre_wait_ms)
    }

    /// Validate that configuration values are consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let rep = &self.replication;
        if rep.n == 0 {
            return Err(ConfigError::Invalid("replication.n must be > 0".into()));
        }
        for (name, q) in [("w", rep.w), ("r", rep.r), ("d", rep.d)] {
            if q == 0 {
                return Err(ConfigError::Invalid(format!(
                    "replication.{} must be > 0",
                    name
                )));
            }
            if q > rep.n {
                return Err(ConfigError::Invalid(format!(
                    "replication.{} ({}) must be <= replication.n ({})",
                    name, q, rep.n
                )));
            }
        }
        if self.containers == 0 {
            return Err(ConfigError::Invalid("containers must be > 0".into()));
        }
        if self.vnodes == 0 {
            return Err(ConfigError::Invalid("vnodes must be > 0".into()));
        }
        if self.worker_pool_pending_limit == 0 {
            return Err(ConfigError::Invalid(
                "worker_pool_pending_limit must be > 0".into(),
            ));
        }
        Ok(())
    }
}

// --- Defaults ---

fn default_true() -> bool {
    true
}
fn default_n() -> usize {
    3
}
fn default_w() -> usize {
    2
}
fn default_r() -> usize {
    1
}
fn default_d() -> usize {
    2
}
fn default_auto_compaction_interval() -> u64 {
    3600
}
fn default_auto_compaction_parallel_procs() -> usize {
    2
}
fn default_request_timeout() -> u64 {
    5000
}
fn default_worker_pool_pending_limit() -> usize {
    200
}
fn default_compaction_pre_wait_ms() -> u64 {
    100
}
fn default_containers() -> u32 {
    8
}
fn default_vnodes() -> u32 {
    128
}

// --- Loading ---

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Load a `NodeConfig` from a YAML file path.
pub fn load_from_file(path: &std::path::Path) -> Result<NodeConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    load_from_str(&contents)
}

/// Load a `NodeConfig` from a YAML string.
pub fn load_from_str(yaml: &str) -> Result<NodeConfig, ConfigError> {
    let config: NodeConfig = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r#"
listen: "127.0.0.1:7100"
members:
  - "127.0.0.1:7100"
  - "127.0.0.1:7101"
"#;
        let config = load_from_str(yaml).unwrap();
        assert_eq!(config.listen.port(), 7100);
        assert_eq!(config.members.len(), 2);
        assert_eq!(config.replication.n, 3);
        assert_eq!(config.replication.w, 2);
        assert_eq!(config.replication.r, 1);
        assert_eq!(config.replication.d, 2);
        assert_eq!(config.request_timeout, 5000);
        assert_eq!(config.worker_pool_pending_limit, 200);
        assert_eq!(config.compaction_pre_wait_ms, 100);
        assert!(config.wd_cpu_enabled);
        assert!(config.wd_disk_enabled);
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
listen: "0.0.0.0:8000"
members: []
replication:
  n: 5
  w: 3
  r: 2
  d: 3
wd_cpu_enabled: false
wd_disk_enabled: true
auto_compaction_interval: 1800
auto_compaction_parallel_procs: 4
request_timeout: 3000
worker_pool_pending_limit: 500
compaction_pre_wait_ms: 250
containers: 16
vnodes: 256
metrics_port: 9100
"#;
        let config = load_from_str(yaml).unwrap();
        assert_eq!(config.replication.n, 5);
        assert!(!config.wd_cpu_enabled);
        assert_eq!(config.auto_compaction_interval, 1800);
        assert_eq!(config.request_timeout(), Duration::from_secs(3));
        assert_eq!(config.compaction_pre_wait(), Duration::from_millis(250));
        assert_eq!(config.metrics_port, Some(9100));
    }

    #[test]
    fn test_roundtrip_yaml() {
        let yaml = r#"
listen: "127.0.0.1:9000"
members: []
"#;
        let config = load_from_str(yaml).unwrap();
        let serialized = serde_yaml::to_string(&config).unwrap();
        let config2 = load_from_str(&serialized).unwrap();
        assert_eq!(config.listen, config2.listen);
        assert_eq!(config.replication.n, config2.replication.n);
    }

    #[test]
    fn test_rejects_w_greater_than_n() {
        let yaml = r#"
listen: "127.0.0.1:7100"
replication:
  n: 3
  w: 4
"#;
        let err = load_from_str(yaml).unwrap_err().to_string();
        assert!(err.contains("replication.w"), "got: {}", err);
    }

    #[test]
    fn test_rejects_zero_quorum() {
        let yaml = r#"
listen: "127.0.0.1:7100"
replication:
  n: 3
  d: 0
"#;
        let err = load_from_str(yaml).unwrap_err().to_string();
        assert!(err.contains("replication.d"), "got: {}", err);
    }

    #[test]
    fn test_rejects_zero_containers() {
        let yaml = r#"
listen: "127.0.0.1:7100"
containers: 0
"#;
        let err = load_from_str(yaml).unwrap_err().to_string();
        assert!(err.contains("containers"), "got: {}", err);
    }
}
