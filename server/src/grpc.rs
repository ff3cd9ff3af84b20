use crate::gateway::TaskRegistry;
use cortex_cluster::membership::MembershipManager;
use cortex_cluster::state::ClusterStateView;
use cortex_cluster::transport::{append_request_from_proto, vote_request_from_proto};
use cortex_common::CortexError;
use cortex_consensus::RaftNode;
use cortex_monitor::{HealthReporter, ResourceMonitor};
use cortex_proto::agent_service_server::AgentService;
use cortex_proto::cluster_service_server::ClusterService;
use cortex_proto::raft_service_server::RaftService;
use cortex_proto::{
    AppendEntriesRequest, AppendEntriesResponse, ApproveNodeRequest, CancelTaskRequest,
    ClusterStateResponse, CommandResponse, DrainNodeRequest, GetClusterStateRequest,
    GetHealthRequest, GetResourcesRequest, Health, JoinClusterRequest, JoinClusterResponse,
    ListNodesRequest, ListNodesResponse, ReportHealthRequest, Resources, RunTaskRequest,
    RunTaskResponse, TransferLeadershipRequest, VoteRequest, VoteResponse,
};
use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{debug, info};

/// Structured failure mapping: handlers answer with a response body, never
/// a transport error, so clients can follow leader hints.
fn command_failure(error: CortexError) -> CommandResponse {
    match error {
        CortexError::NotLeader { leader_hint } => CommandResponse {
            success: false,
            message: "not the leader".to_string(),
            leader_hint: leader_hint.map(|id| id.to_string()).unwrap_or_default(),
        },
        other => CommandResponse {
            success: false,
            message: other.to_string(),
            leader_hint: String::new(),
        },
    }
}

fn command_ok(message: impl Into<String>) -> CommandResponse {
    CommandResponse {
        success: true,
        message: message.into(),
        leader_hint: String::new(),
    }
}

// ---------------------------------------------------------------------------
// RaftService
// ---------------------------------------------------------------------------

pub struct RaftGrpc {
    raft: Arc<RaftNode>,
}

impl RaftGrpc {
    pub fn new(raft: Arc<RaftNode>) -> Self {
        Self { raft }
    }
}

#[tonic::async_trait]
impl RaftService for RaftGrpc {
    async fn request_vote(
        &self,
        request: Request<VoteRequest>,
    ) -> Result<Response<VoteResponse>, Status> {
        let response = self
            .raft
            .handle_request_vote(vote_request_from_proto(&request.into_inner()))
            .await;
        Ok(Response::new(VoteResponse {
            term: response.term,
            vote_granted: response.vote_granted,
        }))
    }

    async fn append_entries(
        &self,
        request: Request<AppendEntriesRequest>,
    ) -> Result<Response<AppendEntriesResponse>, Status> {
        let response = self
            .raft
            .handle_append_entries(append_request_from_proto(&request.into_inner()))
            .await;
        Ok(Response::new(AppendEntriesResponse {
            term: response.term,
            success: response.success,
            conflict_index: response.conflict_index,
            conflict_term: response.conflict_term,
        }))
    }
}

// ---------------------------------------------------------------------------
// ClusterService
// ---------------------------------------------------------------------------

pub struct ClusterGrpc {
    raft: Arc<RaftNode>,
    membership: Arc<MembershipManager>,
    view: Arc<ClusterStateView>,
}

impl ClusterGrpc {
    pub fn new(
        raft: Arc<RaftNode>,
        membership: Arc<MembershipManager>,
        view: Arc<ClusterStateView>,
    ) -> Self {
        Self {
            raft,
            membership,
            view,
        }
    }
}

#[tonic::async_trait]
impl ClusterService for ClusterGrpc {
    async fn get_cluster_state(
        &self,
        _request: Request<GetClusterStateRequest>,
    ) -> Result<Response<ClusterStateResponse>, Status> {
        let state = self.view.current();
        Ok(Response::new(ClusterStateResponse {
            cluster_id: state.cluster_id.clone(),
            leader_id: state
                .leader_id
                .as_ref()
                .map(|id| id.to_string())
                .unwrap_or_default(),
            term: state.term,
            nodes: state.nodes.iter().map(cortex_proto::node_info_to_proto).collect(),
            total_resources: Some(cortex_proto::totals_to_proto(&state.total_resources)),
            available_resources: Some(cortex_proto::totals_to_proto(&state.available_resources)),
            active_tasks: state.active_tasks,
            queued_tasks: state.queued_tasks,
        }))
    }

    async fn list_nodes(
        &self,
        request: Request<ListNodesRequest>,
    ) -> Result<Response<ListNodesResponse>, Status> {
        let nodes = if request.into_inner().active_only {
            self.membership.get_active_nodes()
        } else {
            self.membership.get_all_nodes()
        };
        Ok(Response::new(ListNodesResponse {
            nodes: nodes.iter().map(cortex_proto::node_info_to_proto).collect(),
        }))
    }

    async fn join_cluster(
        &self,
        request: Request<JoinClusterRequest>,
    ) -> Result<Response<JoinClusterResponse>, Status> {
        let proto_node = request
            .into_inner()
            .node
            .ok_or_else(|| Status::invalid_argument("missing node info"))?;
        let node = cortex_proto::node_info_from_proto(&proto_node)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;
        let node_id = node.node_id.clone();

        info!(node = %node_id, "join requested");
        match self.membership.join(node).await {
            Ok(_) => Ok(Response::new(JoinClusterResponse {
                accepted: true,
                node_id: node_id.to_string(),
                message: "join committed; awaiting approval".to_string(),
            })),
            Err(e) => {
                let failure = command_failure(e);
                Ok(Response::new(JoinClusterResponse {
                    accepted: false,
                    node_id: node_id.to_string(),
                    message: if failure.leader_hint.is_empty() {
                        failure.message
                    } else {
                        format!("{} (leader: {})", failure.message, failure.leader_hint)
                    },
                }))
            }
        }
    }

    async fn approve_node(
        &self,
        request: Request<ApproveNodeRequest>,
    ) -> Result<Response<CommandResponse>, Status> {
        let node_id = request.into_inner().node_id;
        let response = match self.membership.approve(node_id.as_str().into()).await {
            Ok(_) => command_ok(format!("{node_id} approved")),
            Err(e) => command_failure(e),
        };
        Ok(Response::new(response))
    }

    async fn drain_node(
        &self,
        request: Request<DrainNodeRequest>,
    ) -> Result<Response<CommandResponse>, Status> {
        let node_id = request.into_inner().node_id;
        let response = match self.membership.drain(node_id.as_str().into()).await {
            Ok(_) => command_ok(format!("{node_id} draining")),
            Err(e) => command_failure(e),
        };
        Ok(Response::new(response))
    }

    async fn transfer_leadership(
        &self,
        request: Request<TransferLeadershipRequest>,
    ) -> Result<Response<CommandResponse>, Status> {
        let target = request.into_inner().target_node_id.map(|id| id.into());
        let response = match self.raft.transfer_leadership(target).await {
            Ok(outcome) => CommandResponse {
                success: outcome.success,
                message: outcome.message,
                leader_hint: String::new(),
            },
            Err(e) => command_failure(e),
        };
        Ok(Response::new(response))
    }

    async fn report_health(
        &self,
        request: Request<ReportHealthRequest>,
    ) -> Result<Response<CommandResponse>, Status> {
        let request = request.into_inner();
        let health = match request.health.as_ref().map(cortex_proto::health_from_proto) {
            Some(Ok(health)) => health,
            Some(Err(e)) => return Err(Status::invalid_argument(e.to_string())),
            None => return Err(Status::invalid_argument("missing health")),
        };
        let resources = match request
            .resources
            .as_ref()
            .map(cortex_proto::resources_from_proto)
        {
            Some(Ok(resources)) => resources,
            Some(Err(e)) => return Err(Status::invalid_argument(e.to_string())),
            None => return Err(Status::invalid_argument("missing resources")),
        };

        debug!(node = %request.node_id, "node report received");
        let response = match self
            .membership
            .update_resources(request.node_id.as_str().into(), health, resources)
            .await
        {
            Ok(_) => command_ok("report applied"),
            Err(e) => command_failure(e),
        };
        Ok(Response::new(response))
    }
}

// ---------------------------------------------------------------------------
// AgentService
// ---------------------------------------------------------------------------

pub struct AgentGrpc {
    monitor: Arc<ResourceMonitor>,
    health: Arc<HealthReporter>,
    registry: Arc<TaskRegistry>,
}

impl AgentGrpc {
    pub fn new(
        monitor: Arc<ResourceMonitor>,
        health: Arc<HealthReporter>,
        registry: Arc<TaskRegistry>,
    ) -> Self {
        Self {
            monitor,
            health,
            registry,
        }
    }
}

#[tonic::async_trait]
impl AgentService for AgentGrpc {
    async fn get_health(
        &self,
        _request: Request<GetHealthRequest>,
    ) -> Result<Response<Health>, Status> {
        Ok(Response::new(cortex_proto::health_to_proto(
            &self.health.current(),
        )))
    }

    async fn get_resources(
        &self,
        _request: Request<GetResourcesRequest>,
    ) -> Result<Response<Resources>, Status> {
        let snapshot = match self.monitor.latest() {
            Some(snapshot) => snapshot,
            None => self.monitor.poll_once().await,
        };
        Ok(Response::new(cortex_proto::resources_to_proto(&snapshot)))
    }

    async fn run_task(
        &self,
        request: Request<RunTaskRequest>,
    ) -> Result<Response<RunTaskResponse>, Status> {
        let request = request.into_inner();
        if request.name.is_empty() {
            return Err(Status::invalid_argument("task name must not be empty"));
        }
        let task_id = self.registry.register(&request.name);
        info!(task = %request.name, id = %task_id, "task registered");
        Ok(Response::new(RunTaskResponse {
            accepted: true,
            task_id,
            message: "task registered".to_string(),
        }))
    }

    async fn cancel_task(
        &self,
        request: Request<CancelTaskRequest>,
    ) -> Result<Response<CommandResponse>, Status> {
        let task_id = request.into_inner().task_id;
        let response = if self.registry.remove(&task_id) {
            command_ok(format!("task {task_id} cancelled"))
        } else {
            CommandResponse {
                success: false,
                message: format!("unknown task {task_id}"),
                leader_hint: String::new(),
            }
        };
        Ok(Response::new(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cortex_common::NodeId;

    #[test]
    fn test_command_failure_carries_leader_hint() {
        let response = command_failure(CortexError::NotLeader {
            leader_hint: Some(NodeId("n2".into())),
        });
        assert!(!response.success);
        assert_eq!(response.leader_hint, "n2");
    }

    #[test]
    fn test_command_failure_without_hint() {
        let response = command_failure(CortexError::Timeout);
        assert!(!response.success);
        assert!(response.leader_hint.is_empty());
    }
}
