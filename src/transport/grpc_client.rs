use crate::grpc::grpc_raft_client::GrpcRaftClient;
use crate::replica::{
    AppendEntriesError, AppendEntriesInput, AppendEntriesOutput, InstallSnapshotError, InstallSnapshotInput,
    InstallSnapshotOutput, ReplicaMetadata, RequestVoteError, RequestVoteInput, RequestVoteOutput,
};
use crate::transport::proto_codec;
use crate::transport::{PeerClient, PeerConnector, TransportError};
use std::sync::Arc;
use tonic::transport::{Channel, Endpoint};

/// GrpcPeerConnector talks to peers over the `GrpcRaft` service. Connections are lazy, so an
/// unreachable peer costs nothing until we call it.
pub struct GrpcPeerConnector {
    logger: slog::Logger,
}

impl GrpcPeerConnector {
    pub fn new(logger: slog::Logger) -> Self {
        GrpcPeerConnector { logger }
    }
}

impl PeerConnector for GrpcPeerConnector {
    fn connect(&self, peer: &ReplicaMetadata) -> Arc<dyn PeerClient> {
        let socket_addr = peer.socket_addr();
        let url = format!("http://{}", socket_addr);
        let logger = self.logger.new(slog::o!("Peer" => peer.replica_id().to_string()));

        let client = Endpoint::from_shared(url.clone())
            .map_err(|e| e.to_string())
            .and_then(|endpoint| endpoint.connect_lazy().map_err(|e| e.to_string()))
            .map(GrpcRaftClient::new)
            .map_err(|e| {
                slog::error!(logger, "Invalid endpoint {}: {}", url, e);
                e
            });

        Arc::new(GrpcPeerClient { client })
    }
}

struct GrpcPeerClient {
    client: Result<GrpcRaftClient<Channel>, String>,
}

impl GrpcPeerClient {
    fn client(&self) -> Result<GrpcRaftClient<Channel>, TransportError> {
        // Clones share the underlying channel.
        self.client.clone().map_err(TransportError::Unreachable)
    }
}

fn rpc_error(status: tonic::Status) -> TransportError {
    match status.code() {
        tonic::Code::Unavailable => TransportError::Unreachable(status.message().to_string()),
        _ => TransportError::Rpc(status.to_string()),
    }
}

fn malformed(e: proto_codec::MalformedMessage) -> TransportError {
    TransportError::MalformedReply(e.0)
}

#[async_trait::async_trait]
impl PeerClient for GrpcPeerClient {
    async fn request_vote(
        &self,
        input: RequestVoteInput,
    ) -> Result<Result<RequestVoteOutput, RequestVoteError>, TransportError> {
        let rpc_reply = self
            .client()?
            .request_vote(proto_codec::encode_request_vote_input(input))
            .await
            .map_err(rpc_error)?;

        proto_codec::decode_request_vote_result(rpc_reply.into_inner()).map_err(malformed)
    }

    async fn append_entries(
        &self,
        input: AppendEntriesInput,
    ) -> Result<Result<AppendEntriesOutput, AppendEntriesError>, TransportError> {
        let rpc_reply = self
            .client()?
            .append_entries(proto_codec::encode_append_entries_input(input))
            .await
            .map_err(rpc_error)?;

        proto_codec::decode_append_entries_result(rpc_reply.into_inner()).map_err(malformed)
    }

    async fn install_snapshot(
        &self,
        input: InstallSnapshotInput,
    ) -> Result<Result<InstallSnapshotOutput, InstallSnapshotError>, TransportError> {
        let rpc_reply = self
            .client()?
            .install_snapshot(proto_codec::encode_install_snapshot_input(input))
            .await
            .map_err(rpc_error)?;

        proto_codec::decode_install_snapshot_result(rpc_reply.into_inner()).map_err(malformed)
    }
}
