use cortex_common::config::DiscoveryConfig;
use cortex_common::{now_unix, CortexError, NodeId, PeerRecord, Result};
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One peer as reported by the mesh control plane
#[derive(Debug, Clone)]
pub struct MeshPeer {
    pub id: NodeId,
    pub hostname: String,
    pub ips: Vec<String>,
    pub online: bool,
    pub tags: BTreeSet<String>,
    pub last_seen: u64,
}

/// A full mesh poll: ourselves plus every visible peer
#[derive(Debug, Clone)]
pub struct MeshView {
    pub self_id: NodeId,
    pub peers: Vec<MeshPeer>,
}

/// Seam to the mesh-VPN control plane. Production shells out to the mesh
/// CLI; tests supply fixture polls.
#[async_trait::async_trait]
pub trait MeshProvider: Send + Sync {
    async fn poll(&self) -> Result<MeshView>;
}

/// Events emitted as the cluster-tagged mesh roster changes
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    NodeDiscovered(PeerRecord),
    NodeOnline(NodeId),
    NodeOffline(NodeId),
    NodeRemoved(NodeId),
    Error(String),
}

/// Maintains the live mesh roster for this cluster's tag and publishes a
/// diff event stream. Deterministic given a poll result: the same poll
/// applied twice produces no events the second time.
pub struct PeerDiscovery {
    config: DiscoveryConfig,
    provider: Arc<dyn MeshProvider>,
    roster: RwLock<HashMap<NodeId, PeerRecord>>,
    events: broadcast::Sender<DiscoveryEvent>,
    cancel: CancellationToken,
}

impl PeerDiscovery {
    pub fn new(config: DiscoveryConfig, provider: Arc<dyn MeshProvider>) -> Arc<Self> {
        let (events, _) = broadcast::channel(128);
        Arc::new(Self {
            config,
            provider,
            roster: RwLock::new(HashMap::new()),
            events,
            cancel: CancellationToken::new(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }

    /// Current cluster-tagged roster.
    pub fn get_cluster_nodes(&self) -> Vec<PeerRecord> {
        self.roster.read().values().cloned().collect()
    }

    /// Case-insensitive hostname lookup.
    pub fn resolve_hostname(&self, name: &str) -> Option<PeerRecord> {
        let lower = name.to_lowercase();
        self.roster
            .read()
            .values()
            .find(|p| p.hostname.to_lowercase() == lower)
            .cloned()
    }

    pub fn start(self: &Arc<Self>) {
        let discovery = self.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(discovery.config.poll_interval_ms));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = discovery.cancel.cancelled() => {
                        debug!("peer discovery stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        discovery.poll_once().await;
                    }
                }
            }
        });
        info!(tag = %self.config.cluster_tag, "peer discovery started");
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Run one poll and diff it against the previous roster. A failing
    /// probe emits `Error` and leaves the roster untouched.
    pub async fn poll_once(&self) {
        let view = match self.provider.poll().await {
            Ok(view) => view,
            Err(e) => {
                warn!(error = %e, "mesh probe failed; keeping previous roster");
                let _ = self.events.send(DiscoveryEvent::Error(e.to_string()));
                return;
            }
        };

        let mut events = Vec::new();
        {
            let mut roster = self.roster.write();
            let mut seen: BTreeSet<NodeId> = BTreeSet::new();

            for peer in &view.peers {
                if peer.id == view.self_id {
                    continue;
                }
                if !peer.tags.contains(&self.config.cluster_tag) {
                    continue;
                }
                seen.insert(peer.id.clone());

                let record = PeerRecord {
                    node_id: peer.id.clone(),
                    hostname: peer.hostname.clone(),
                    mesh_ip: peer.ips.first().cloned().unwrap_or_default(),
                    online: peer.online,
                    last_seen: peer.last_seen,
                    tags: peer.tags.clone(),
                };

                match roster.get(&peer.id) {
                    None => {
                        events.push(DiscoveryEvent::NodeDiscovered(record.clone()));
                        if record.online {
                            events.push(DiscoveryEvent::NodeOnline(peer.id.clone()));
                        }
                        roster.insert(peer.id.clone(), record);
                    }
                    Some(previous) => {
                        if !previous.online && record.online {
                            events.push(DiscoveryEvent::NodeOnline(peer.id.clone()));
                        } else if previous.online && !record.online {
                            events.push(DiscoveryEvent::NodeOffline(peer.id.clone()));
                        }
                        roster.insert(peer.id.clone(), record);
                    }
                }
            }

            let removed: Vec<NodeId> = roster
                .keys()
                .filter(|id| !seen.contains(*id))
                .cloned()
                .collect();
            for id in removed {
                roster.remove(&id);
                events.push(DiscoveryEvent::NodeRemoved(id));
            }
        }

        for event in events {
            debug!(?event, "discovery event");
            let _ = self.events.send(event);
        }
    }
}

// ---------------------------------------------------------------------------
// Tailscale provider
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TailscaleStatus {
    #[serde(rename = "Self")]
    this_node: TailscaleNode,
    #[serde(rename = "Peer", default)]
    peers: HashMap<String, TailscaleNode>,
}

#[derive(Debug, Deserialize)]
struct TailscaleNode {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "HostName", default)]
    hostname: String,
    #[serde(rename = "TailscaleIPs", default)]
    ips: Vec<String>,
    #[serde(rename = "Online", default)]
    online: bool,
    #[serde(rename = "Tags", default)]
    tags: Vec<String>,
}

/// Polls the mesh via `tailscale status --json`.
pub struct TailscaleProvider;

#[async_trait::async_trait]
impl MeshProvider for TailscaleProvider {
    async fn poll(&self) -> Result<MeshView> {
        let output = tokio::process::Command::new("tailscale")
            .args(["status", "--json"])
            .output()
            .await
            .map_err(|e| CortexError::Mesh(format!("failed to run tailscale: {e}")))?;

        if !output.status.success() {
            return Err(CortexError::Mesh(format!(
                "tailscale status exited with {:?}",
                output.status.code()
            )));
        }

        let status: TailscaleStatus = serde_json::from_slice(&output.stdout)
            .map_err(|e| CortexError::Mesh(format!("unparseable tailscale status: {e}")))?;

        let now = now_unix();
        let peers = status
            .peers
            .into_values()
            .map(|node| MeshPeer {
                id: NodeId(node.id),
                hostname: node.hostname,
                ips: node.ips,
                online: node.online,
                tags: node.tags.into_iter().collect(),
                last_seen: now,
            })
            .collect();

        Ok(MeshView {
            self_id: NodeId(status.this_node.id),
            peers,
        })
    }
}
