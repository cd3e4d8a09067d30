//! This mod is meant to hold most of the code for the library's client-facing API.
mod event_bus;
mod node;
mod options;
mod rpc_handle;
mod types;
mod wiring;

pub use event_bus::RaftEvent;
pub use event_bus::RaftEventListener;
pub use node::AppendLogError;
pub use node::AppendLogOutput;
pub use node::MembershipChangeError;
pub use node::RaftNode;
pub use node::RegisterStateMachineError;
pub use node::ReplicaExited;
pub use options::RaftOptions;
pub use rpc_handle::RaftRpcHandle;
pub use types::NodeStatus;
pub use types::RaftEntryId;
pub use types::RaftLeaderInfo;
pub use types::RaftMemberInfo;
pub use types::RaftMemberInfoBlob;
pub use wiring::create_raft_node;
pub use wiring::NodeCreationError;
pub use wiring::RaftNodeConfig;
