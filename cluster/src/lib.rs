pub mod activation;
pub mod discovery;
pub mod membership;
pub mod report;
pub mod state;
pub mod transport;

pub use activation::{ActivationController, LeaderGated};
pub use discovery::{DiscoveryEvent, MeshPeer, MeshProvider, MeshView, PeerDiscovery, TailscaleProvider};
pub use membership::{MembershipChange, MembershipManager, NodeReport};
pub use report::NodeReporter;
pub use state::{AllocationSource, ClusterStateView, NoAllocations};
pub use transport::{EndpointResolver, GrpcRaftTransport, LateBoundResolver, PeerTransport};
