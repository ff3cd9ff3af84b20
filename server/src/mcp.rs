use crate::gateway::MessagingGateway;
use cortex_cluster::membership::MembershipManager;
use cortex_cluster::state::ClusterStateView;
use cortex_common::{CortexError, NodeId, NodeInfo, Result};
use cortex_consensus::RaftNode;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

/// MCP handler maps over the shared cluster state.
///
/// The registry and transport live in the external MCP plugin; this
/// surface only supplies the handlers. Every resource is a JSON projection
/// derived strictly from the membership roster and the cluster-state
/// cache: byte counts as GiB with one decimal, timestamps ISO-8601, node
/// records sanitized to their public fields.
pub struct McpSurface {
    membership: Arc<MembershipManager>,
    view: Arc<ClusterStateView>,
    raft: Arc<RaftNode>,
    messaging: Arc<MessagingGateway>,
}

/// Resource URIs this surface serves
pub const RESOURCE_URIS: &[&str] = &[
    "cluster://state",
    "cluster://nodes",
    "cluster://nodes/active",
    "cluster://approvals",
];

/// Tool names this surface serves
pub const TOOL_NAMES: &[&str] = &[
    "cluster_status",
    "node_list",
    "drain_node",
    "transfer_leadership",
    "messaging_notify",
];

fn gib(bytes: u64) -> f64 {
    let value = bytes as f64 / (1024.0 * 1024.0 * 1024.0);
    (value * 10.0).round() / 10.0
}

fn iso8601(unix_seconds: u64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp(unix_seconds as i64, 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_default()
}

fn node_projection(node: &NodeInfo) -> Value {
    let resources = node.resources.as_ref().map(|r| {
        json!({
            "cpu_cores": r.cpu.cores,
            "cpu_usage_pct": r.cpu.usage_percent,
            "memory_gib": gib(r.memory.total_bytes),
            "memory_available_gib": gib(r.memory.available_bytes),
            "disk_gib": gib(r.disk.total_bytes),
            "gpus": r.gpus.iter().map(|g| json!({
                "name": g.name,
                "memory_gib": gib(g.memory_total_bytes),
                "utilization_pct": g.utilization_pct,
            })).collect::<Vec<_>>(),
            "gaming_detected": r.gaming_detected,
        })
    });

    json!({
        "node_id": node.node_id.to_string(),
        "hostname": node.hostname,
        "status": node.status.to_string(),
        "role": node.role.to_string(),
        "online": node.online,
        "joined_at": iso8601(node.joined_at),
        "last_seen": iso8601(node.last_seen),
        "resources": resources,
    })
}

impl McpSurface {
    pub fn new(
        membership: Arc<MembershipManager>,
        view: Arc<ClusterStateView>,
        raft: Arc<RaftNode>,
        messaging: Arc<MessagingGateway>,
    ) -> Arc<Self> {
        Arc::new(Self {
            membership,
            view,
            raft,
            messaging,
        })
    }

    /// Serve one resource read.
    pub async fn read_resource(&self, uri: &str) -> Result<Value> {
        match uri {
            "cluster://state" => {
                let state = self.view.current();
                Ok(json!({
                    "cluster_id": state.cluster_id,
                    "leader_id": state.leader_id.as_ref().map(|id| id.to_string()),
                    "term": state.term,
                    "node_count": state.nodes.len(),
                    "total_resources": {
                        "cpu_cores": state.total_resources.cpu_cores,
                        "memory_gib": gib(state.total_resources.memory_bytes),
                        "gpu_count": state.total_resources.gpu_count,
                        "gpu_memory_gib": gib(state.total_resources.gpu_memory_bytes),
                    },
                    "available_resources": {
                        "cpu_cores": state.available_resources.cpu_cores,
                        "memory_gib": gib(state.available_resources.memory_bytes),
                        "gpu_count": state.available_resources.gpu_count,
                        "gpu_memory_gib": gib(state.available_resources.gpu_memory_bytes),
                    },
                    "active_tasks": state.active_tasks,
                    "queued_tasks": state.queued_tasks,
                }))
            }
            "cluster://nodes" => Ok(Value::Array(
                self.membership
                    .get_all_nodes()
                    .iter()
                    .map(node_projection)
                    .collect(),
            )),
            "cluster://nodes/active" => Ok(Value::Array(
                self.membership
                    .get_active_nodes()
                    .iter()
                    .map(node_projection)
                    .collect(),
            )),
            "cluster://approvals" => Ok(Value::Array(
                self.membership
                    .get_pending_approvals()
                    .iter()
                    .map(node_projection)
                    .collect(),
            )),
            other => Err(CortexError::Internal(format!("unknown resource {other}"))),
        }
    }

    /// Dispatch one tool call.
    pub async fn call_tool(&self, name: &str, args: Value) -> Result<Value> {
        match name {
            "cluster_status" => self.read_resource("cluster://state").await,
            "node_list" => {
                let active_only = args
                    .get("active_only")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let uri = if active_only {
                    "cluster://nodes/active"
                } else {
                    "cluster://nodes"
                };
                self.read_resource(uri).await
            }
            "drain_node" => {
                let node_id = args
                    .get("node_id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| CortexError::Internal("drain_node requires node_id".into()))?;
                info!(node = node_id, "drain requested via mcp");
                self.membership.drain(NodeId(node_id.to_string())).await?;
                Ok(json!({"success": true, "node_id": node_id, "status": "draining"}))
            }
            "transfer_leadership" => {
                let target = args
                    .get("target_node_id")
                    .and_then(Value::as_str)
                    .map(|id| NodeId(id.to_string()));
                let outcome = self.raft.transfer_leadership(target).await?;
                Ok(json!({"success": outcome.success, "message": outcome.message}))
            }
            "messaging_notify" => {
                let message = args.get("message").and_then(Value::as_str).ok_or_else(|| {
                    CortexError::Internal("messaging_notify requires message".into())
                })?;
                self.messaging.notify(message).await?;
                Ok(json!({"success": true, "delivered": self.messaging.is_connected()}))
            }
            other => Err(CortexError::Internal(format!("unknown tool {other}"))),
        }
    }
}
