use crate::error::{CortexError, Result};
use crate::types::{NodeId, NodeRole};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Mesh-VPN peer discovery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// How often to poll the mesh control plane
    #[serde(default = "default_discovery_poll_ms")]
    pub poll_interval_ms: u64,

    /// Mesh tag identifying members of this cluster
    #[serde(default = "default_cluster_tag")]
    pub cluster_tag: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_discovery_poll_ms(),
            cluster_tag: default_cluster_tag(),
        }
    }
}

/// Local telemetry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_poll_ms")]
    pub poll_interval_ms: u64,

    /// Process names whose presence marks the host as gaming
    #[serde(default = "default_gaming_processes")]
    pub gaming_processes: Vec<String>,

    /// GPU utilization above this percentage also counts as gaming
    #[serde(default = "default_gaming_gpu_threshold")]
    pub gaming_gpu_threshold_pct: f64,

    /// How long after gaming ends GPU-heavy scheduling stays deferred
    #[serde(default = "default_gaming_cooldown_ms")]
    pub gaming_cooldown_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_monitor_poll_ms(),
            gaming_processes: default_gaming_processes(),
            gaming_gpu_threshold_pct: default_gaming_gpu_threshold(),
            gaming_cooldown_ms: default_gaming_cooldown_ms(),
        }
    }
}

/// Health derivation thresholds, warn/error percentages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_check_ms")]
    pub check_interval_ms: u64,

    #[serde(default = "default_memory_warn")]
    pub memory_warn_pct: f64,
    #[serde(default = "default_memory_error")]
    pub memory_error_pct: f64,

    #[serde(default = "default_cpu_warn")]
    pub cpu_warn_pct: f64,
    #[serde(default = "default_cpu_error")]
    pub cpu_error_pct: f64,

    #[serde(default = "default_disk_warn")]
    pub disk_warn_pct: f64,
    #[serde(default = "default_disk_error")]
    pub disk_error_pct: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: default_health_check_ms(),
            memory_warn_pct: default_memory_warn(),
            memory_error_pct: default_memory_error(),
            cpu_warn_pct: default_cpu_warn(),
            cpu_error_pct: default_cpu_error(),
            disk_warn_pct: default_disk_warn(),
            disk_error_pct: default_disk_error(),
        }
    }
}

/// Consensus timer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    #[serde(default = "default_election_min_ms")]
    pub election_timeout_min_ms: u64,
    #[serde(default = "default_election_max_ms")]
    pub election_timeout_max_ms: u64,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_interval_ms: u64,
    /// Deadline for a single RequestVote RPC
    #[serde(default = "default_vote_rpc_timeout_ms")]
    pub vote_rpc_timeout_ms: u64,
}

impl RaftConfig {
    /// Deadline for one AppendEntries replication round
    pub fn append_rpc_timeout_ms(&self) -> u64 {
        self.heartbeat_interval_ms * 3
    }
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min_ms: default_election_min_ms(),
            election_timeout_max_ms: default_election_max_ms(),
            heartbeat_interval_ms: default_heartbeat_ms(),
            vote_rpc_timeout_ms: default_vote_rpc_timeout_ms(),
        }
    }
}

/// Node-report pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    #[serde(default = "default_report_interval_ms")]
    pub report_interval_ms: u64,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            report_interval_ms: default_report_interval_ms(),
        }
    }
}

/// Peer transport settings (keepalive, message caps, optional mutual TLS)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,
    #[serde(default = "default_keepalive_timeout_ms")]
    pub keepalive_timeout_ms: u64,
    /// Default deadline applied to calls that specify none
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: default_max_message_bytes(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
            keepalive_timeout_ms: default_keepalive_timeout_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            tls: None,
        }
    }
}

/// Mutual TLS material, all peers sharing one trust root
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub ca_cert_path: String,
    pub cert_path: String,
    pub key_path: String,
    /// Domain name expected on peer certificates
    pub domain: String,
}

/// Top-level daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Stable id; generated and persisted on first start when absent
    #[serde(default)]
    pub node_id: Option<NodeId>,

    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,

    #[serde(default = "default_role")]
    pub role: NodeRole,

    #[serde(default = "default_grpc_bind")]
    pub grpc_bind: String,

    /// Endpoint advertised to peers; defaults to the mesh IP + bind port
    #[serde(default)]
    pub grpc_endpoint: Option<String>,

    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub raft: RaftConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub transport: TransportConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            cluster_id: default_cluster_id(),
            role: default_role(),
            grpc_bind: default_grpc_bind(),
            grpc_endpoint: None,
            data_dir: default_data_dir(),
            discovery: DiscoveryConfig::default(),
            monitor: MonitorConfig::default(),
            health: HealthConfig::default(),
            raft: RaftConfig::default(),
            report: ReportConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Load from a YAML file, filling unset fields with defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .build()
            .map_err(|e| CortexError::config(e.to_string()))?;

        let cfg: NodeConfig = settings
            .try_deserialize()
            .map_err(|e| CortexError::config(e.to_string()))?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Invariant checks; violations are fatal at startup.
    pub fn validate(&self) -> Result<()> {
        if self.raft.election_timeout_min_ms == 0
            || self.raft.election_timeout_min_ms >= self.raft.election_timeout_max_ms
        {
            return Err(CortexError::config(format!(
                "election timeout range [{}, {}] is invalid",
                self.raft.election_timeout_min_ms, self.raft.election_timeout_max_ms
            )));
        }
        if self.raft.heartbeat_interval_ms >= self.raft.election_timeout_min_ms {
            return Err(CortexError::config(
                "heartbeat interval must be shorter than the minimum election timeout",
            ));
        }
        if self.discovery.poll_interval_ms == 0
            || self.monitor.poll_interval_ms == 0
            || self.health.check_interval_ms == 0
            || self.report.report_interval_ms == 0
        {
            return Err(CortexError::config("poll intervals must be non-zero"));
        }
        if self.monitor.gaming_gpu_threshold_pct <= 0.0
            || self.monitor.gaming_gpu_threshold_pct > 100.0
        {
            return Err(CortexError::config("gaming GPU threshold must be in (0, 100]"));
        }
        if self.health.memory_warn_pct > self.health.memory_error_pct
            || self.health.cpu_warn_pct > self.health.cpu_error_pct
            || self.health.disk_warn_pct > self.health.disk_error_pct
        {
            return Err(CortexError::config(
                "warn thresholds must not exceed error thresholds",
            ));
        }
        if self.cluster_id.is_empty() {
            return Err(CortexError::config("cluster_id must not be empty"));
        }
        Ok(())
    }

    /// Grace window before an offline member is proposed for draining.
    pub fn failure_grace_ms(&self) -> u64 {
        self.discovery.poll_interval_ms * 3
    }
}

fn default_cluster_id() -> String {
    "cortex".to_string()
}

fn default_role() -> NodeRole {
    NodeRole::Voter
}

fn default_grpc_bind() -> String {
    "0.0.0.0:7400".to_string()
}

fn default_data_dir() -> String {
    "/var/lib/cortex".to_string()
}

fn default_discovery_poll_ms() -> u64 {
    15_000
}

fn default_cluster_tag() -> String {
    "tag:cortex".to_string()
}

fn default_monitor_poll_ms() -> u64 {
    5_000
}

fn default_gaming_processes() -> Vec<String> {
    [
        "steam", "steamwebhelper", "lutris", "heroic", "gamescope", "wine", "proton",
        "retroarch", "minecraft",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_gaming_gpu_threshold() -> f64 {
    70.0
}

fn default_gaming_cooldown_ms() -> u64 {
    30_000
}

fn default_health_check_ms() -> u64 {
    10_000
}

fn default_memory_warn() -> f64 {
    90.0
}

fn default_memory_error() -> f64 {
    95.0
}

fn default_cpu_warn() -> f64 {
    95.0
}

fn default_cpu_error() -> f64 {
    98.0
}

fn default_disk_warn() -> f64 {
    95.0
}

fn default_disk_error() -> f64 {
    98.0
}

fn default_election_min_ms() -> u64 {
    150
}

fn default_election_max_ms() -> u64 {
    300
}

fn default_heartbeat_ms() -> u64 {
    50
}

fn default_vote_rpc_timeout_ms() -> u64 {
    2_000
}

fn default_report_interval_ms() -> u64 {
    10_000
}

fn default_max_message_bytes() -> usize {
    50 * 1024 * 1024
}

fn default_keepalive_interval_ms() -> u64 {
    10_000
}

fn default_keepalive_timeout_ms() -> u64 {
    5_000
}

fn default_call_timeout_ms() -> u64 {
    2_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = NodeConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.raft.election_timeout_min_ms, 150);
        assert_eq!(cfg.raft.election_timeout_max_ms, 300);
        assert_eq!(cfg.raft.heartbeat_interval_ms, 50);
        assert_eq!(cfg.failure_grace_ms(), 45_000);
        assert_eq!(cfg.transport.max_message_bytes, 50 * 1024 * 1024);
    }

    #[test]
    fn test_rejects_inverted_election_range() {
        let mut cfg = NodeConfig::default();
        cfg.raft.election_timeout_min_ms = 400;
        cfg.raft.election_timeout_max_ms = 300;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_heartbeat_slower_than_election() {
        let mut cfg = NodeConfig::default();
        cfg.raft.heartbeat_interval_ms = 200;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_from_yaml() {
        let mut file = tempfile::NamedTempFile::with_suffix(".yaml").unwrap();
        writeln!(
            file,
            "cluster_id: lab\nrole: observer\ndiscovery:\n  poll_interval_ms: 5000\n  cluster_tag: \"tag:lab\"\n"
        )
        .unwrap();

        let cfg = NodeConfig::load(file.path()).unwrap();
        assert_eq!(cfg.cluster_id, "lab");
        assert_eq!(cfg.role, NodeRole::Observer);
        assert_eq!(cfg.discovery.poll_interval_ms, 5_000);
        assert_eq!(cfg.discovery.cluster_tag, "tag:lab");
        // untouched sections keep defaults
        assert_eq!(cfg.monitor.poll_interval_ms, 5_000);
        assert_eq!(cfg.health.memory_warn_pct, 90.0);
    }
}
