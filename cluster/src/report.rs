use crate::membership::MembershipManager;
use crate::transport::{EndpointResolver, PeerTransport};
use cortex_common::config::ReportConfig;
use cortex_common::{CortexError, NodeId, Result};
use cortex_consensus::Proposer;
use cortex_monitor::{HealthReporter, ResourceMonitor};
use cortex_proto::cluster_service_client::ClusterServiceClient;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const REPORT_RETRIES: u32 = 3;
const REPORT_RETRY_BASE_MS: u64 = 250;

/// Periodic node-report pipeline: every tick, this node's health and
/// resource snapshot are applied through consensus — locally when we lead,
/// otherwise forwarded to the leader's `ReportHealth` endpoint with
/// exponential backoff. The leader keeps only the newest report per node.
pub struct NodeReporter {
    local_id: NodeId,
    config: ReportConfig,
    monitor: Arc<ResourceMonitor>,
    health: Arc<HealthReporter>,
    membership: Arc<MembershipManager>,
    proposer: Arc<dyn Proposer>,
    transport: Arc<PeerTransport>,
    cancel: CancellationToken,
}

impl NodeReporter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_id: NodeId,
        config: ReportConfig,
        monitor: Arc<ResourceMonitor>,
        health: Arc<HealthReporter>,
        membership: Arc<MembershipManager>,
        proposer: Arc<dyn Proposer>,
        transport: Arc<PeerTransport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_id,
            config,
            monitor,
            health,
            membership,
            proposer,
            transport,
            cancel: CancellationToken::new(),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let reporter = self.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(reporter.config.report_interval_ms));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = reporter.cancel.cancelled() => {
                        debug!("node reporter stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = reporter.report_once().await {
                            warn!(error = %e, "node report failed; will retry next tick");
                        }
                    }
                }
            }
        });
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Collect and ship one report. A node without a snapshot yet has
    /// nothing to report.
    pub async fn report_once(&self) -> Result<()> {
        let resources = match self.monitor.latest() {
            Some(snapshot) => snapshot,
            None => {
                debug!("no resource snapshot yet; skipping report");
                return Ok(());
            }
        };
        let health = self.health.current();

        if self.proposer.is_leader().await {
            self.membership
                .update_resources(self.local_id.clone(), health, resources)
                .await?;
            return Ok(());
        }

        let leader = self
            .proposer
            .leader_id()
            .await
            .ok_or_else(|| CortexError::transport("no known leader for node report"))?;
        let endpoint = self
            .membership
            .endpoint_of(&leader)
            .ok_or_else(|| CortexError::transport(format!("no endpoint for leader {leader}")))?;

        let request = cortex_proto::ReportHealthRequest {
            node_id: self.local_id.to_string(),
            health: Some(cortex_proto::health_to_proto(&health)),
            resources: Some(cortex_proto::resources_to_proto(&resources)),
        };

        self.send_with_backoff(&endpoint, request).await
    }

    /// Forward to the leader, retrying transient transport failures with
    /// exponential backoff.
    async fn send_with_backoff(
        &self,
        endpoint: &str,
        request: cortex_proto::ReportHealthRequest,
    ) -> Result<()> {
        let limit = self.transport.max_message_bytes();
        let mut last_error = None;

        for attempt in 0..=REPORT_RETRIES {
            if attempt > 0 {
                let delay = REPORT_RETRY_BASE_MS * (1u64 << (attempt - 1));
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }

            let channel = self.transport.connection(endpoint)?;
            let mut client = ClusterServiceClient::new(channel)
                .max_decoding_message_size(limit)
                .max_encoding_message_size(limit);

            let call = client.report_health(tonic::Request::new(request.clone()));
            match tokio::time::timeout(self.transport.call_timeout(), call).await {
                Ok(Ok(response)) => {
                    let response = response.into_inner();
                    if response.success {
                        return Ok(());
                    }
                    // Leadership may have moved between ticks; the next
                    // tick re-resolves the leader
                    return Err(CortexError::transport(format!(
                        "leader rejected report: {}",
                        response.message
                    )));
                }
                Ok(Err(status)) => {
                    debug!(attempt, code = ?status.code(), "report rpc failed");
                    last_error = Some(CortexError::transport(status.to_string()));
                }
                Err(_) => {
                    debug!(attempt, "report rpc timed out");
                    last_error = Some(CortexError::Timeout);
                }
            }
        }

        self.transport.evict(endpoint);
        Err(last_error.unwrap_or(CortexError::Timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cortex_common::config::{HealthConfig, MonitorConfig, TransportConfig};
    use cortex_consensus::{EntryKind, LogPosition};
    use cortex_monitor::TaskSource;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct NoTasks;

    impl TaskSource for NoTasks {
        fn active_tasks(&self) -> Vec<String> {
            Vec::new()
        }
    }

    struct RecordingProposer {
        leader: AtomicBool,
        proposals: Mutex<Vec<(EntryKind, Vec<u8>)>>,
    }

    #[async_trait::async_trait]
    impl Proposer for RecordingProposer {
        async fn propose(&self, kind: EntryKind, payload: Vec<u8>) -> Result<LogPosition> {
            self.proposals.lock().push((kind, payload));
            Ok(LogPosition { index: 1, term: 1 })
        }

        async fn is_leader(&self) -> bool {
            self.leader.load(Ordering::Relaxed)
        }

        async fn leader_id(&self) -> Option<NodeId> {
            None
        }
    }

    async fn reporter(leader: bool) -> (Arc<NodeReporter>, Arc<RecordingProposer>, Arc<ResourceMonitor>) {
        let proposer = Arc::new(RecordingProposer {
            leader: AtomicBool::new(leader),
            proposals: Mutex::new(Vec::new()),
        });
        let monitor = ResourceMonitor::new(MonitorConfig::default());
        let health = HealthReporter::new(HealthConfig::default(), monitor.clone(), Arc::new(NoTasks));
        let membership = MembershipManager::new(
            NodeId("local".into()),
            7400,
            Duration::from_secs(45),
            proposer.clone(),
        );
        let transport = PeerTransport::new(TransportConfig::default()).await.unwrap();
        let reporter = NodeReporter::new(
            NodeId("local".into()),
            ReportConfig::default(),
            monitor.clone(),
            health,
            membership,
            proposer.clone(),
            transport,
        );
        (reporter, proposer, monitor)
    }

    #[tokio::test]
    async fn test_no_snapshot_means_no_report() {
        let (reporter, proposer, _monitor) = reporter(true).await;
        reporter.report_once().await.unwrap();
        assert!(proposer.proposals.lock().is_empty());
    }

    #[tokio::test]
    async fn test_leader_applies_report_locally() {
        let (reporter, proposer, monitor) = reporter(true).await;
        monitor.poll_once().await;

        reporter.report_once().await.unwrap();

        let proposals = proposer.proposals.lock();
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].0, EntryKind::NodeReport);
        let report: crate::membership::NodeReport =
            bincode::deserialize(&proposals[0].1).unwrap();
        assert_eq!(report.node_id.as_str(), "local");
        assert!(report.resources.timestamp > 0);
    }

    #[tokio::test]
    async fn test_follower_without_leader_errors() {
        let (reporter, _proposer, monitor) = reporter(false).await;
        monitor.poll_once().await;

        let err = reporter.report_once().await.unwrap_err();
        assert!(matches!(err, CortexError::Transport { .. }));
    }
}
