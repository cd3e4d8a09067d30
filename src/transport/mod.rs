//! The seam between the replica and the network. The replica only ever talks to peers through
//! `PeerClient`, so the same core runs over gRPC in production and over an in-process router in
//! tests.

mod grpc_client;
mod in_process;
mod proto_codec;

pub use grpc_client::GrpcPeerConnector;
pub use in_process::FaultConfig;
pub use in_process::InProcessNetwork;
pub(crate) use proto_codec::{
    decode_append_entries_input, decode_install_snapshot_input, decode_request_vote_input,
    encode_append_entries_result, encode_install_snapshot_result, encode_request_vote_result,
};

use crate::replica::{
    AppendEntriesError, AppendEntriesInput, AppendEntriesOutput, InstallSnapshotError, InstallSnapshotInput,
    InstallSnapshotOutput, ReplicaMetadata, RequestVoteError, RequestVoteInput, RequestVoteOutput,
};
use std::sync::Arc;

/// PeerClient calls the Raft RPCs on one remote replica.
///
/// The outer `Result` is the transport's: the request may or may not have been delivered. The
/// inner one is the remote replica's answer. Implementations must not retry on their own, the
/// replica decides that.
#[async_trait::async_trait]
pub trait PeerClient: Send + Sync {
    async fn request_vote(
        &self,
        input: RequestVoteInput,
    ) -> Result<Result<RequestVoteOutput, RequestVoteError>, TransportError>;

    async fn append_entries(
        &self,
        input: AppendEntriesInput,
    ) -> Result<Result<AppendEntriesOutput, AppendEntriesError>, TransportError>;

    async fn install_snapshot(
        &self,
        input: InstallSnapshotInput,
    ) -> Result<Result<InstallSnapshotOutput, InstallSnapshotError>, TransportError>;
}

/// PeerConnector creates a client per peer. Called lazily the first time a replica needs to talk
/// to a peer, so connecting must not block.
pub trait PeerConnector: Send + Sync {
    fn connect(&self, peer: &ReplicaMetadata) -> Arc<dyn PeerClient>;
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Peer is unreachable: {0}")]
    Unreachable(String),
    #[error("Message was dropped")]
    Dropped,
    #[error("Malformed reply: {0}")]
    MalformedReply(String),
    #[error("RPC failure: {0}")]
    Rpc(String),
}
