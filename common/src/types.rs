use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Stable opaque identifier assigned to a node at first join.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    /// Generate a fresh id for a node joining for the first time.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Node role in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    /// Full consensus participant with a vote
    Voter,

    /// Receives replicated state, never votes
    Observer,

    /// Serves the MCP surface only; no consensus participation
    McpOnly,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Voter => write!(f, "voter"),
            NodeRole::Observer => write!(f, "observer"),
            NodeRole::McpOnly => write!(f, "mcp-only"),
        }
    }
}

/// Membership lifecycle status.
///
/// Transitions are monotone: pending → active → draining → drained → gone.
/// Regression happens only via an explicit leader-committed reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Active,
    Draining,
    Drained,
    Gone,
}

impl NodeStatus {
    fn rank(self) -> u8 {
        match self {
            NodeStatus::Pending => 0,
            NodeStatus::Active => 1,
            NodeStatus::Draining => 2,
            NodeStatus::Drained => 3,
            NodeStatus::Gone => 4,
        }
    }

    /// Whether moving to `next` respects the monotone lifecycle.
    pub fn can_transition_to(self, next: NodeStatus) -> bool {
        next.rank() > self.rank()
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Active => "active",
            NodeStatus::Draining => "draining",
            NodeStatus::Drained => "drained",
            NodeStatus::Gone => "gone",
        };
        write!(f, "{s}")
    }
}

/// A peer as seen by the mesh-VPN probe (discovery view, not membership).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub node_id: NodeId,
    pub hostname: String,
    pub mesh_ip: String,
    pub online: bool,
    /// Unix seconds of the last poll that saw this peer.
    pub last_seen: u64,
    pub tags: BTreeSet<String>,
}

/// A cluster member as committed through consensus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub hostname: String,
    pub mesh_ip: String,
    pub online: bool,
    pub last_seen: u64,
    pub tags: BTreeSet<String>,
    pub status: NodeStatus,
    pub role: NodeRole,
    /// Unix seconds at leader-committed join.
    pub joined_at: u64,
    pub resources: Option<ResourceSnapshot>,
    pub grpc_endpoint: String,
}

impl NodeInfo {
    pub fn from_peer(peer: &PeerRecord, role: NodeRole, grpc_endpoint: String) -> Self {
        Self {
            node_id: peer.node_id.clone(),
            hostname: peer.hostname.clone(),
            mesh_ip: peer.mesh_ip.clone(),
            online: peer.online,
            last_seen: peer.last_seen,
            tags: peer.tags.clone(),
            status: NodeStatus::Pending,
            role,
            joined_at: now_unix(),
            resources: None,
            grpc_endpoint,
        }
    }
}

/// CPU usage portion of a snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuStats {
    pub cores: u32,
    pub usage_percent: f64,
    pub load_avg: [f64; 3],
}

/// Memory usage portion of a snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub used_pct: f64,
}

/// Disk usage portion of a snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskStats {
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub used_pct: f64,
}

/// A single GPU as reported by the device probe
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuStats {
    pub index: u32,
    pub name: String,
    pub memory_total_bytes: u64,
    pub memory_free_bytes: u64,
    pub utilization_pct: f64,
    pub in_use_for_gaming: bool,
}

/// One local telemetry snapshot. Produced every monitor poll; only the most
/// recent snapshot is retained.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// Unix milliseconds; node reports are coalesced by this field.
    pub timestamp: u64,
    pub cpu: CpuStats,
    pub memory: MemoryStats,
    pub disk: DiskStats,
    pub gpus: Vec<GpuStats>,
    pub gaming_detected: bool,
}

/// Severity of a health issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Warning,
    Error,
}

/// A single issue raised during a health check tick
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthIssue {
    pub severity: IssueSeverity,
    pub code: String,
    pub message: String,
    pub timestamp: u64,
}

impl HealthIssue {
    pub fn warning(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: IssueSeverity::Warning,
            code: code.into(),
            message: message.into(),
            timestamp: now_unix(),
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: IssueSeverity::Error,
            code: code.into(),
            message: message.into(),
            timestamp: now_unix(),
        }
    }
}

/// Health report derived from the latest snapshot plus the running-task set.
/// Each tick supersedes the previous report; issues are never accumulated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub message: String,
    pub last_check: u64,
    pub uptime_seconds: u64,
    pub active_tasks: Vec<String>,
    pub issues: Vec<HealthIssue>,
}

impl HealthStatus {
    pub fn has_errors(&self) -> bool {
        self.issues
            .iter()
            .any(|i| i.severity == IssueSeverity::Error)
    }
}

/// Fleet-wide capacity counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceTotals {
    pub cpu_cores: u32,
    pub memory_bytes: u64,
    pub gpu_count: u32,
    pub gpu_memory_bytes: u64,
}

/// Aggregate cluster view: membership roster plus capacity, leader, term.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterState {
    pub cluster_id: String,
    pub leader_id: Option<NodeId>,
    pub term: u64,
    pub nodes: Vec<NodeInfo>,
    pub total_resources: ResourceTotals,
    pub available_resources: ResourceTotals,
    pub active_tasks: u32,
    pub queued_tasks: u32,
}

/// Current unix time in whole seconds
pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Current unix time in milliseconds
pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions_are_monotone() {
        assert!(NodeStatus::Pending.can_transition_to(NodeStatus::Active));
        assert!(NodeStatus::Active.can_transition_to(NodeStatus::Draining));
        assert!(NodeStatus::Draining.can_transition_to(NodeStatus::Drained));
        assert!(NodeStatus::Drained.can_transition_to(NodeStatus::Gone));
        assert!(NodeStatus::Pending.can_transition_to(NodeStatus::Gone));

        assert!(!NodeStatus::Active.can_transition_to(NodeStatus::Pending));
        assert!(!NodeStatus::Gone.can_transition_to(NodeStatus::Active));
        assert!(!NodeStatus::Draining.can_transition_to(NodeStatus::Draining));
    }

    #[test]
    fn test_node_id_generate_is_unique() {
        let a = NodeId::generate();
        let b = NodeId::generate();
        assert_ne!(a, b);
        assert!(!a.as_str().is_empty());
    }

    #[test]
    fn test_health_status_error_detection() {
        let status = HealthStatus {
            healthy: false,
            message: "degraded".into(),
            last_check: now_unix(),
            uptime_seconds: 10,
            active_tasks: vec![],
            issues: vec![
                HealthIssue::warning("HIGH_MEMORY", "memory at 91%"),
                HealthIssue::error("HIGH_DISK", "disk at 99%"),
            ],
        };
        assert!(status.has_errors());
    }
}
