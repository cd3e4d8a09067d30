mod actor;
mod api;
mod commitlog;
mod replica;
mod server;
mod transport;
mod grpc {
    include!("../generated/raft.rs");
}

pub use api::create_raft_node;
pub use api::AppendLogError;
pub use api::AppendLogOutput;
pub use api::MembershipChangeError;
pub use api::NodeCreationError;
pub use api::NodeStatus;
pub use api::RaftEntryId;
pub use api::RaftEvent;
pub use api::RaftEventListener;
pub use api::RaftLeaderInfo;
pub use api::RaftMemberInfo;
pub use api::RaftMemberInfoBlob;
pub use api::RaftNode;
pub use api::RaftNodeConfig;
pub use api::RaftOptions;
pub use api::RaftRpcHandle;
pub use api::RegisterStateMachineError;
pub use api::ReplicaExited;
pub use commitlog::Index;
pub use replica::AppendEntriesError;
pub use replica::AppendEntriesInput;
pub use replica::AppendEntriesOutput;
pub use replica::EntryAbandoned;
pub use replica::EntryKind;
pub use replica::InstallSnapshotError;
pub use replica::InstallSnapshotInput;
pub use replica::InstallSnapshotOutput;
pub use replica::LeaderRedirectInfo;
pub use replica::NoOpStateMachine;
pub use replica::ReplicaId;
pub use replica::ReplicaInfoBlob;
pub use replica::ReplicaMetadata;
pub use replica::MAX_REPLICA_ID_LEN;
pub use replica::RequestVoteError;
pub use replica::RequestVoteInput;
pub use replica::RequestVoteOutput;
pub use replica::Role;
pub use replica::RoleStateSnapshot;
pub use replica::StateMachine;
pub use replica::StateMachineError;
pub use replica::StateMachineOutput;
pub use replica::Term;
pub use replica::TermOutOfDateInfo;
pub use replica::WriteAheadLogEntry;
pub use server::shutdown_signal;
pub use server::RpcServer;
pub use server::RpcServerShutdownHandle;
pub use server::RpcServerShutdownSignal;
pub use transport::FaultConfig;
pub use transport::GrpcPeerConnector;
pub use transport::InProcessNetwork;
pub use transport::PeerClient;
pub use transport::PeerConnector;
pub use transport::TransportError;

// Learning 1: `create::{root_mod}` should not have any code. Just `mod` and `pub use` statements.
// Learning 2: All `mod` statements, anywhere, should not be `pub`. Only export `pub` via individual
//             use statements.
//
// This keeps the `crate::{root_mod}` root_mod only responsible for exporting types to the rest of
// crate, and allows me to organize my root_mod impl however I want.
