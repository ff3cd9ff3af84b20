//! Generated gRPC stubs plus conversions between wire messages and the
//! domain types in `cortex-common`.
//!
//! Byte counts are carried as decimal strings on the wire so that very large
//! hosts never hit JSON/number precision issues in downstream consumers;
//! conversions must preserve every numeric field exactly.

tonic::include_proto!("cortex");

use cortex_common::{
    CortexError, CpuStats, DiskStats, GpuStats, HealthIssue, HealthStatus, IssueSeverity,
    MemoryStats, NodeId, NodeInfo as DomainNodeInfo, NodeRole, NodeStatus, ResourceSnapshot,
    ResourceTotals as DomainTotals, Result,
};

fn parse_bytes(field: &str, value: &str) -> Result<u64> {
    value
        .parse::<u64>()
        .map_err(|_| CortexError::Serialization(format!("invalid byte count for {field}: {value:?}")))
}

/// Domain snapshot → wire resources.
pub fn resources_to_proto(snapshot: &ResourceSnapshot) -> Resources {
    Resources {
        timestamp_ms: snapshot.timestamp,
        cpu: Some(Cpu {
            cores: snapshot.cpu.cores,
            usage_percent: snapshot.cpu.usage_percent,
            load_avg: snapshot.cpu.load_avg.to_vec(),
        }),
        memory: Some(Memory {
            total_bytes: snapshot.memory.total_bytes.to_string(),
            available_bytes: snapshot.memory.available_bytes.to_string(),
            used_pct: snapshot.memory.used_pct,
        }),
        disk: Some(Disk {
            total_bytes: snapshot.disk.total_bytes.to_string(),
            available_bytes: snapshot.disk.available_bytes.to_string(),
            used_pct: snapshot.disk.used_pct,
        }),
        gpus: snapshot
            .gpus
            .iter()
            .map(|g| Gpu {
                index: g.index,
                name: g.name.clone(),
                memory_total_bytes: g.memory_total_bytes.to_string(),
                memory_free_bytes: g.memory_free_bytes.to_string(),
                utilization_pct: g.utilization_pct,
                in_use_for_gaming: g.in_use_for_gaming,
            })
            .collect(),
        gaming_detected: snapshot.gaming_detected,
    }
}

/// Wire resources → domain snapshot. Missing sub-messages become defaults,
/// matching the monitor's own behavior for failed probes.
pub fn resources_from_proto(proto: &Resources) -> Result<ResourceSnapshot> {
    let cpu = proto
        .cpu
        .as_ref()
        .map(|c| {
            let mut load_avg = [0.0; 3];
            for (slot, value) in load_avg.iter_mut().zip(c.load_avg.iter()) {
                *slot = *value;
            }
            CpuStats {
                cores: c.cores,
                usage_percent: c.usage_percent,
                load_avg,
            }
        })
        .unwrap_or_default();

    let memory = match proto.memory.as_ref() {
        Some(m) => MemoryStats {
            total_bytes: parse_bytes("memory.total_bytes", &m.total_bytes)?,
            available_bytes: parse_bytes("memory.available_bytes", &m.available_bytes)?,
            used_pct: m.used_pct,
        },
        None => MemoryStats::default(),
    };

    let disk = match proto.disk.as_ref() {
        Some(d) => DiskStats {
            total_bytes: parse_bytes("disk.total_bytes", &d.total_bytes)?,
            available_bytes: parse_bytes("disk.available_bytes", &d.available_bytes)?,
            used_pct: d.used_pct,
        },
        None => DiskStats::default(),
    };

    let mut gpus = Vec::with_capacity(proto.gpus.len());
    for g in &proto.gpus {
        gpus.push(GpuStats {
            index: g.index,
            name: g.name.clone(),
            memory_total_bytes: parse_bytes("gpu.memory_total_bytes", &g.memory_total_bytes)?,
            memory_free_bytes: parse_bytes("gpu.memory_free_bytes", &g.memory_free_bytes)?,
            utilization_pct: g.utilization_pct,
            in_use_for_gaming: g.in_use_for_gaming,
        });
    }

    Ok(ResourceSnapshot {
        timestamp: proto.timestamp_ms,
        cpu,
        memory,
        disk,
        gpus,
        gaming_detected: proto.gaming_detected,
    })
}

pub fn health_to_proto(status: &HealthStatus) -> Health {
    Health {
        healthy: status.healthy,
        message: status.message.clone(),
        last_check: status.last_check,
        uptime_seconds: status.uptime_seconds,
        active_tasks: status.active_tasks.clone(),
        issues: status
            .issues
            .iter()
            .map(|i| Issue {
                severity: match i.severity {
                    IssueSeverity::Warning => "warning".to_string(),
                    IssueSeverity::Error => "error".to_string(),
                },
                code: i.code.clone(),
                message: i.message.clone(),
                timestamp: i.timestamp,
            })
            .collect(),
    }
}

pub fn health_from_proto(proto: &Health) -> Result<HealthStatus> {
    let mut issues = Vec::with_capacity(proto.issues.len());
    for i in &proto.issues {
        let severity = match i.severity.as_str() {
            "warning" => IssueSeverity::Warning,
            "error" => IssueSeverity::Error,
            other => {
                return Err(CortexError::Serialization(format!(
                    "unknown issue severity {other:?}"
                )))
            }
        };
        issues.push(HealthIssue {
            severity,
            code: i.code.clone(),
            message: i.message.clone(),
            timestamp: i.timestamp,
        });
    }

    Ok(HealthStatus {
        healthy: proto.healthy,
        message: proto.message.clone(),
        last_check: proto.last_check,
        uptime_seconds: proto.uptime_seconds,
        active_tasks: proto.active_tasks.clone(),
        issues,
    })
}

fn status_to_str(status: NodeStatus) -> String {
    status.to_string()
}

fn status_from_str(s: &str) -> Result<NodeStatus> {
    match s {
        "pending" => Ok(NodeStatus::Pending),
        "active" => Ok(NodeStatus::Active),
        "draining" => Ok(NodeStatus::Draining),
        "drained" => Ok(NodeStatus::Drained),
        "gone" => Ok(NodeStatus::Gone),
        other => Err(CortexError::Serialization(format!(
            "unknown node status {other:?}"
        ))),
    }
}

fn role_from_str(s: &str) -> Result<NodeRole> {
    match s {
        "voter" => Ok(NodeRole::Voter),
        "observer" => Ok(NodeRole::Observer),
        "mcp-only" => Ok(NodeRole::McpOnly),
        other => Err(CortexError::Serialization(format!(
            "unknown node role {other:?}"
        ))),
    }
}

pub fn node_info_to_proto(node: &DomainNodeInfo) -> NodeInfo {
    NodeInfo {
        node_id: node.node_id.to_string(),
        hostname: node.hostname.clone(),
        mesh_ip: node.mesh_ip.clone(),
        online: node.online,
        last_seen: node.last_seen,
        tags: node.tags.iter().cloned().collect(),
        status: status_to_str(node.status),
        role: node.role.to_string(),
        joined_at: node.joined_at,
        resources: node.resources.as_ref().map(resources_to_proto),
        grpc_endpoint: node.grpc_endpoint.clone(),
    }
}

pub fn node_info_from_proto(proto: &NodeInfo) -> Result<DomainNodeInfo> {
    Ok(DomainNodeInfo {
        node_id: NodeId(proto.node_id.clone()),
        hostname: proto.hostname.clone(),
        mesh_ip: proto.mesh_ip.clone(),
        online: proto.online,
        last_seen: proto.last_seen,
        tags: proto.tags.iter().cloned().collect(),
        status: status_from_str(&proto.status)?,
        role: role_from_str(&proto.role)?,
        joined_at: proto.joined_at,
        resources: proto
            .resources
            .as_ref()
            .map(resources_from_proto)
            .transpose()?,
        grpc_endpoint: proto.grpc_endpoint.clone(),
    })
}

pub fn totals_to_proto(totals: &DomainTotals) -> ResourceTotals {
    ResourceTotals {
        cpu_cores: totals.cpu_cores,
        memory_bytes: totals.memory_bytes.to_string(),
        gpu_count: totals.gpu_count,
        gpu_memory_bytes: totals.gpu_memory_bytes.to_string(),
    }
}

pub fn totals_from_proto(proto: &ResourceTotals) -> Result<DomainTotals> {
    Ok(DomainTotals {
        cpu_cores: proto.cpu_cores,
        memory_bytes: parse_bytes("totals.memory_bytes", &proto.memory_bytes)?,
        gpu_count: proto.gpu_count,
        gpu_memory_bytes: parse_bytes("totals.gpu_memory_bytes", &proto.gpu_memory_bytes)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn sample_snapshot() -> ResourceSnapshot {
        ResourceSnapshot {
            timestamp: 1_722_000_000_123,
            cpu: CpuStats {
                cores: 16,
                usage_percent: 42.5,
                load_avg: [1.25, 0.75, 0.5],
            },
            memory: MemoryStats {
                total_bytes: 68_719_476_736,
                available_bytes: 34_359_738_368,
                used_pct: 50.0,
            },
            disk: DiskStats {
                total_bytes: 2_000_398_934_016,
                available_bytes: 1_000_000_000_000,
                used_pct: 50.01,
            },
            gpus: vec![GpuStats {
                index: 0,
                name: "RTX 4090".into(),
                memory_total_bytes: 25_769_803_776,
                memory_free_bytes: 12_884_901_888,
                utilization_pct: 88.0,
                in_use_for_gaming: true,
            }],
            gaming_detected: true,
        }
    }

    #[test]
    fn test_resources_round_trip_preserves_all_fields() {
        let snapshot = sample_snapshot();
        let proto = resources_to_proto(&snapshot);
        assert_eq!(proto.memory.as_ref().unwrap().total_bytes, "68719476736");
        let back = resources_from_proto(&proto).unwrap();
        assert_eq!(back, snapshot);
    }

    #[test]
    fn test_resources_rejects_malformed_byte_strings() {
        let mut proto = resources_to_proto(&sample_snapshot());
        proto.memory.as_mut().unwrap().total_bytes = "not-a-number".into();
        assert!(resources_from_proto(&proto).is_err());
    }

    #[test]
    fn test_health_round_trip() {
        let status = HealthStatus {
            healthy: false,
            message: "1 issue".into(),
            last_check: 1_722_000_000,
            uptime_seconds: 3_600,
            active_tasks: vec!["bench-42".into()],
            issues: vec![HealthIssue::error("HIGH_DISK", "disk at 99%")],
        };
        let proto = health_to_proto(&status);
        let back = health_from_proto(&proto).unwrap();
        assert_eq!(back.healthy, status.healthy);
        assert_eq!(back.issues.len(), 1);
        assert_eq!(back.issues[0].severity, IssueSeverity::Error);
        assert_eq!(back.active_tasks, status.active_tasks);
    }

    #[test]
    fn test_node_info_round_trip() {
        let node = DomainNodeInfo {
            node_id: NodeId("n1".into()),
            hostname: "gpu-box".into(),
            mesh_ip: "100.64.0.7".into(),
            online: true,
            last_seen: 1_722_000_000,
            tags: BTreeSet::from(["tag:cortex".to_string()]),
            status: NodeStatus::Active,
            role: NodeRole::Voter,
            joined_at: 1_700_000_000,
            resources: Some(sample_snapshot()),
            grpc_endpoint: "http://100.64.0.7:7400".into(),
        };
        let proto = node_info_to_proto(&node);
        assert_eq!(proto.status, "active");
        assert_eq!(proto.role, "voter");
        let back = node_info_from_proto(&proto).unwrap();
        assert_eq!(back.node_id, node.node_id);
        assert_eq!(back.status, node.status);
        assert_eq!(back.role, node.role);
        assert_eq!(back.resources, node.resources);
    }
}
