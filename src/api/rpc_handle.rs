use crate::actor::ActorClient;
use crate::replica::{
    AppendEntriesError, AppendEntriesInput, AppendEntriesOutput, InstallSnapshotError, InstallSnapshotInput,
    InstallSnapshotOutput, RequestVoteError, RequestVoteInput, RequestVoteOutput,
};

/// RaftRpcHandle is how an inbound transport hands decoded peer RPCs to the local replica. Cheap
/// to clone; every clone feeds the same replica.
#[derive(Clone)]
pub struct RaftRpcHandle {
    actor_client: ActorClient,
}

impl RaftRpcHandle {
    pub(crate) fn new(actor_client: ActorClient) -> Self {
        RaftRpcHandle { actor_client }
    }

    pub async fn request_vote(&self, input: RequestVoteInput) -> Result<RequestVoteOutput, RequestVoteError> {
        self.actor_client.request_vote(input).await
    }

    pub async fn append_entries(&self, input: AppendEntriesInput) -> Result<AppendEntriesOutput, AppendEntriesError> {
        self.actor_client.append_entries(input).await
    }

    pub async fn install_snapshot(
        &self,
        input: InstallSnapshotInput,
    ) -> Result<InstallSnapshotOutput, InstallSnapshotError> {
        self.actor_client.install_snapshot(input).await
    }
}
