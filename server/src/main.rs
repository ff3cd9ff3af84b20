mod gateway;
mod grpc;
mod mcp;

use anyhow::{Context, Result};
use clap::Parser;
use cortex_cluster::{
    ActivationController, ClusterStateView, GrpcRaftTransport, LateBoundResolver, LeaderGated,
    MembershipManager, NodeReporter, PeerDiscovery, PeerTransport, TailscaleProvider,
};
use cortex_common::{NodeConfig, NodeId, NodeInfo, NodeRole, NodeStatus};
use cortex_consensus::{FileStore, RaftEvent, RaftNode, RaftRole};
use cortex_monitor::{HealthReporter, ResourceMonitor};
use cortex_proto::agent_service_server::AgentServiceServer;
use cortex_proto::cluster_service_server::ClusterServiceServer;
use cortex_proto::raft_service_server::RaftServiceServer;
use gateway::{MessagingGateway, SchedulerSeat, TaskRegistry, WorkloadView};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Cortex cluster agent daemon
#[derive(Debug, Parser)]
#[command(name = "cortexd", version, about)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Expose the MCP tool/resource surface to the plugin registry
    #[arg(long)]
    mcp: bool,

    /// Observe the cluster without advertising this node for membership
    #[arg(long)]
    invisible: bool,

    /// Run without mesh discovery (single-node / test mode)
    #[arg(long)]
    isolated: bool,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("\x1b[31merror:\x1b[0m {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut config = match &cli.config {
        Some(path) => NodeConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => NodeConfig::default(),
    };
    if cli.invisible {
        config.role = NodeRole::Observer;
    }

    let node_id = resolve_node_id(&config).await?;
    let hostname = sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_string());
    let grpc_port = config
        .grpc_bind
        .rsplit(':')
        .next()
        .and_then(|p| p.parse::<u16>().ok())
        .context("grpc_bind must end in a port")?;
    let advertised_endpoint = config
        .grpc_endpoint
        .clone()
        .unwrap_or_else(|| format!("http://{hostname}:{grpc_port}"));

    info!(node = %node_id, %hostname, cluster = %config.cluster_id, "starting cortexd");

    // Storage and transport
    let store = Arc::new(
        FileStore::open(Path::new(&config.data_dir).join("raft"))
            .await
            .context("opening consensus store")?,
    );
    let peer_transport = PeerTransport::new(config.transport.clone())
        .await
        .context("building peer transport")?;

    // Consensus first, against a resolver bound to the roster below
    let resolver = LateBoundResolver::new();
    let raft_transport = Arc::new(GrpcRaftTransport::new(
        peer_transport.clone(),
        resolver.clone(),
    ));
    let raft = RaftNode::new(
        node_id.clone(),
        Vec::new(),
        config.raft.clone(),
        store,
        raft_transport,
    )
    .await
    .context("restoring consensus state")?;

    // Membership projects committed entries and proposes through consensus
    let membership = MembershipManager::new(
        node_id.clone(),
        grpc_port,
        Duration::from_millis(config.failure_grace_ms()),
        raft.clone(),
    );
    resolver.bind(membership.clone());
    {
        let membership = membership.clone();
        raft.register_applier(Box::new(move |entry| membership.apply(entry)));
    }

    // Keep the voting set in sync with the committed roster
    spawn_peer_sync(raft.clone(), membership.clone());

    // Telemetry and health
    let registry = TaskRegistry::new();
    let monitor = ResourceMonitor::new(config.monitor.clone());
    let health = HealthReporter::new(config.health.clone(), monitor.clone(), registry.clone());

    // Aggregate view and leader-gated singletons
    let scheduler = SchedulerSeat::new();
    let workload = Arc::new(WorkloadView {
        registry: registry.clone(),
        scheduler: scheduler.clone(),
    });
    let view = ClusterStateView::new(
        config.cluster_id.clone(),
        membership.clone(),
        raft.clone(),
        workload,
    );
    let messaging = MessagingGateway::new(Vec::new());
    let activation = ActivationController::new(vec![
        messaging.clone() as Arc<dyn LeaderGated>,
        scheduler.clone() as Arc<dyn LeaderGated>,
    ]);

    // Node-report pipeline
    let reporter = NodeReporter::new(
        node_id.clone(),
        config.report.clone(),
        monitor.clone(),
        health.clone(),
        membership.clone(),
        raft.clone(),
        peer_transport.clone(),
    );

    // Mesh discovery, unless isolated
    let discovery = if cli.isolated {
        info!("isolated mode: mesh discovery disabled");
        None
    } else {
        let discovery = PeerDiscovery::new(config.discovery.clone(), Arc::new(TailscaleProvider));
        membership.start(&discovery);
        discovery.start();
        Some(discovery)
    };

    if !cli.invisible {
        spawn_self_enrollment(
            raft.clone(),
            membership.clone(),
            local_node_info(&node_id, &hostname, &config, &advertised_endpoint),
        );
    }

    monitor.start();
    health.start();
    raft.start().await;
    activation.start(&raft).await;
    view.start();
    reporter.start();

    // The external plugin registry consumes these handler maps; the
    // surface lives for the daemon's lifetime
    let _mcp_surface = cli.mcp.then(|| {
        info!(
            resources = ?mcp::RESOURCE_URIS,
            tools = ?mcp::TOOL_NAMES,
            "mcp surface enabled"
        );
        mcp::McpSurface::new(
            membership.clone(),
            view.clone(),
            raft.clone(),
            messaging.clone(),
        )
    });

    // gRPC server
    let bind_addr: std::net::SocketAddr = config
        .grpc_bind
        .parse()
        .with_context(|| format!("invalid grpc_bind {}", config.grpc_bind))?;
    let limit = config.transport.max_message_bytes;

    let mut builder = Server::builder()
        .http2_keepalive_interval(Some(Duration::from_millis(
            config.transport.keepalive_interval_ms,
        )))
        .http2_keepalive_timeout(Some(Duration::from_millis(
            config.transport.keepalive_timeout_ms,
        )));

    if let Some(tls) = &config.transport.tls {
        let cert = tokio::fs::read(&tls.cert_path).await.context("tls cert")?;
        let key = tokio::fs::read(&tls.key_path).await.context("tls key")?;
        let ca = tokio::fs::read(&tls.ca_cert_path).await.context("tls ca")?;
        builder = builder
            .tls_config(
                ServerTlsConfig::new()
                    .identity(Identity::from_pem(cert, key))
                    .client_ca_root(Certificate::from_pem(ca)),
            )
            .context("configuring server tls")?;
        info!("mutual tls enabled");
    }

    let raft_service = RaftServiceServer::new(grpc::RaftGrpc::new(raft.clone()))
        .max_decoding_message_size(limit)
        .max_encoding_message_size(limit);
    let cluster_service = ClusterServiceServer::new(grpc::ClusterGrpc::new(
        raft.clone(),
        membership.clone(),
        view.clone(),
    ))
    .max_decoding_message_size(limit)
    .max_encoding_message_size(limit);
    let agent_service = AgentServiceServer::new(grpc::AgentGrpc::new(
        monitor.clone(),
        health.clone(),
        registry.clone(),
    ))
    .max_decoding_message_size(limit)
    .max_encoding_message_size(limit);

    info!(addr = %bind_addr, "grpc server listening");
    builder
        .add_service(raft_service)
        .add_service(cluster_service)
        .add_service(agent_service)
        .serve_with_shutdown(bind_addr, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("grpc server failed")?;

    // Orderly teardown: stop tickers, release leadership-gated singletons
    if let Some(discovery) = discovery {
        discovery.stop();
    }
    membership.stop();
    reporter.stop();
    view.stop();
    activation.stop().await;
    health.stop();
    monitor.stop();
    raft.stop().await;
    peer_transport.close_all();

    info!("cortexd stopped");
    Ok(())
}

/// Stable node identity: configured, or generated once and persisted under
/// the data dir.
async fn resolve_node_id(config: &NodeConfig) -> Result<NodeId> {
    if let Some(id) = &config.node_id {
        return Ok(id.clone());
    }
    let path = Path::new(&config.data_dir).join("node-id");
    match tokio::fs::read_to_string(&path).await {
        Ok(existing) => Ok(NodeId(existing.trim().to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let id = NodeId::generate();
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, id.as_str()).await?;
            info!(node = %id, "generated node identity");
            Ok(id)
        }
        Err(e) => Err(e).context("reading node-id"),
    }
}

fn local_node_info(
    node_id: &NodeId,
    hostname: &str,
    config: &NodeConfig,
    endpoint: &str,
) -> NodeInfo {
    NodeInfo {
        node_id: node_id.clone(),
        hostname: hostname.to_string(),
        mesh_ip: String::new(),
        online: true,
        last_seen: cortex_common::now_unix(),
        tags: BTreeSet::from([config.discovery.cluster_tag.clone()]),
        status: NodeStatus::Pending,
        role: config.role,
        joined_at: cortex_common::now_unix(),
        resources: None,
        grpc_endpoint: endpoint.to_string(),
    }
}

/// Push committed roster changes into the consensus voting set.
fn spawn_peer_sync(raft: Arc<RaftNode>, membership: Arc<MembershipManager>) {
    let mut changes = membership.subscribe_changes();
    tokio::spawn(async move {
        while changes.recv().await.is_ok() {
            raft.set_peers(membership.voter_peers()).await;
        }
    });
}

/// On gaining leadership, make sure this node is enrolled and approved in
/// the roster (bootstrap for fresh clusters).
fn spawn_self_enrollment(
    raft: Arc<RaftNode>,
    membership: Arc<MembershipManager>,
    local: NodeInfo,
) {
    let mut events = raft.subscribe();
    tokio::spawn(async move {
        loop {
            // Commit events re-check so the approval follows once the join
            // lands on a multi-node cluster
            match events.recv().await {
                Ok(RaftEvent::StateChange {
                    role: RaftRole::Leader,
                    ..
                })
                | Ok(RaftEvent::Commit { .. }) => {
                    if !raft.is_leader().await {
                        continue;
                    }
                    let status = membership.get_node(&local.node_id).map(|n| n.status);
                    if status.is_none() || status == Some(NodeStatus::Gone) {
                        if let Err(e) = membership.join(local.clone()).await {
                            warn!(error = %e, "self-join failed");
                            continue;
                        }
                    }
                    if membership.get_node(&local.node_id).map(|n| n.status)
                        == Some(NodeStatus::Pending)
                    {
                        if let Err(e) = membership.approve(local.node_id.clone()).await {
                            warn!(error = %e, "self-approval failed");
                        }
                    }
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    });
}
