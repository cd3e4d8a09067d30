use crate::api::RaftRpcHandle;
use crate::grpc::grpc_raft_server::{GrpcRaft, GrpcRaftServer};
use crate::grpc::{
    ProtoAppendEntriesReq, ProtoAppendEntriesResult, ProtoInstallSnapshotReq, ProtoInstallSnapshotResult,
    ProtoRequestVoteReq, ProtoRequestVoteResult,
};
use crate::server::RpcServerShutdownSignal;
use crate::transport;
use std::net::SocketAddr;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

/// RpcServer is the type that implements the Raft gRPC interface.
pub struct RpcServer {
    logger: slog::Logger,
    local_replica: RaftRpcHandle,
}

impl RpcServer {
    pub fn new(logger: slog::Logger, local_replica: RaftRpcHandle) -> Self {
        RpcServer { logger, local_replica }
    }

    /// Serve until the shutdown signal fires. Returns an error if the address can't be bound.
    pub async fn run(
        self,
        socket_addr: SocketAddr,
        shutdown_signal: RpcServerShutdownSignal,
    ) -> Result<(), tonic::transport::Error> {
        let logger = self.logger.clone();
        slog::info!(logger, "Listening on '{:?}'", socket_addr);

        let result = Server::builder()
            .add_service(GrpcRaftServer::new(self))
            .serve_with_shutdown(socket_addr, shutdown_signal)
            .await;

        slog::info!(logger, "Server run() has exited: {:?}", result);
        result
    }

    async fn handle_request_vote(&self, rpc_request: ProtoRequestVoteReq) -> Result<ProtoRequestVoteResult, Status> {
        let app_input = transport::decode_request_vote_input(rpc_request).map_err(invalid_argument)?;
        let app_result = self.local_replica.request_vote(app_input).await;
        Ok(transport::encode_request_vote_result(app_result))
    }

    async fn handle_append_entries(
        &self,
        rpc_request: ProtoAppendEntriesReq,
    ) -> Result<ProtoAppendEntriesResult, Status> {
        let app_input = transport::decode_append_entries_input(rpc_request).map_err(invalid_argument)?;
        let app_result = self.local_replica.append_entries(app_input).await;
        Ok(transport::encode_append_entries_result(app_result))
    }

    async fn handle_install_snapshot(
        &self,
        rpc_request: ProtoInstallSnapshotReq,
    ) -> Result<ProtoInstallSnapshotResult, Status> {
        let app_input = transport::decode_install_snapshot_input(rpc_request).map_err(invalid_argument)?;
        let app_result = self.local_replica.install_snapshot(app_input).await;
        Ok(transport::encode_install_snapshot_result(app_result))
    }
}

fn invalid_argument(e: impl std::fmt::Display) -> Status {
    Status::invalid_argument(e.to_string())
}

#[async_trait::async_trait]
impl GrpcRaft for RpcServer {
    async fn request_vote(
        &self,
        rpc_request_wrapped: Request<ProtoRequestVoteReq>,
    ) -> Result<Response<ProtoRequestVoteResult>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(self.logger, "ServerWire - {:?}", rpc_request);
        let rpc_result = self.handle_request_vote(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }

    async fn append_entries(
        &self,
        rpc_request_wrapped: Request<ProtoAppendEntriesReq>,
    ) -> Result<Response<ProtoAppendEntriesResult>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(
            self.logger,
            "ServerWire - AppendEntries from {} term={} entries={}",
            rpc_request.client_node_id,
            rpc_request.term,
            rpc_request.new_entries.len()
        );
        let rpc_result = self.handle_append_entries(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }

    async fn install_snapshot(
        &self,
        rpc_request_wrapped: Request<ProtoInstallSnapshotReq>,
    ) -> Result<Response<ProtoInstallSnapshotResult>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(
            self.logger,
            "ServerWire - InstallSnapshot from {} through {} ({} bytes)",
            rpc_request.client_node_id,
            rpc_request.last_included_index,
            rpc_request.data.len()
        );
        let rpc_result = self.handle_install_snapshot(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }
}
