use crate::api::RaftRpcHandle;
use crate::replica::{
    AppendEntriesError, AppendEntriesInput, AppendEntriesOutput, InstallSnapshotError, InstallSnapshotInput,
    InstallSnapshotOutput, ReplicaId, ReplicaMetadata, RequestVoteError, RequestVoteInput, RequestVoteOutput,
};
use crate::transport::{PeerClient, PeerConnector, TransportError};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Faults applied to every message, in each direction.
#[derive(Clone, Debug, Default)]
pub struct FaultConfig {
    /// Probability in [0, 1] that a request, or its reply, is lost.
    pub drop_rate: f64,
    /// Each delivery is delayed by a random duration up to this.
    pub max_delay: Duration,
}

/// InProcessNetwork routes RPCs between nodes in the same process. It can partition nodes and
/// inject drops and delays, which is what the cluster tests need.
#[derive(Clone, Default)]
pub struct InProcessNetwork {
    state: Arc<Mutex<NetworkState>>,
}

#[derive(Default)]
struct NetworkState {
    routes: HashMap<ReplicaId, RaftRpcHandle>,
    isolated: HashSet<ReplicaId>,
    faults: FaultConfig,
}

impl InProcessNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, replica_id: ReplicaId, handle: RaftRpcHandle) {
        self.lock().routes.insert(replica_id, handle);
    }

    pub fn unregister(&self, replica_id: &ReplicaId) {
        self.lock().routes.remove(replica_id);
    }

    /// Cut `replica_id` off from everyone, in both directions.
    pub fn isolate(&self, replica_id: &ReplicaId) {
        self.lock().isolated.insert(replica_id.clone());
    }

    pub fn heal(&self, replica_id: &ReplicaId) {
        self.lock().isolated.remove(replica_id);
    }

    pub fn heal_all(&self) {
        self.lock().isolated.clear();
    }

    pub fn set_faults(&self, faults: FaultConfig) {
        self.lock().faults = faults;
    }

    /// The connector for the node `my_replica_id`. Isolation applies to the sending side too, so
    /// each node needs its own.
    pub fn connector(&self, my_replica_id: ReplicaId) -> Arc<dyn PeerConnector> {
        Arc::new(InProcessConnector {
            network: self.clone(),
            from: my_replica_id,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetworkState> {
        self.state.lock().expect("InProcessNetwork mutex poisoned")
    }

    /// Decide the fate of one hop. On delivery, returns the destination and the delay to apply.
    fn route(&self, from: &ReplicaId, to: &ReplicaId) -> Result<(RaftRpcHandle, Duration), TransportError> {
        let state = self.lock();
        if state.isolated.contains(from) || state.isolated.contains(to) {
            return Err(TransportError::Dropped);
        }
        let handle = state
            .routes
            .get(to)
            .cloned()
            .ok_or_else(|| TransportError::Unreachable(format!("no route to {}", to)))?;

        let mut rng = rand::thread_rng();
        if state.faults.drop_rate > 0.0 && rng.gen_bool(state.faults.drop_rate.min(1.0)) {
            return Err(TransportError::Dropped);
        }
        let delay = if state.faults.max_delay > Duration::from_millis(0) {
            rng.gen_range(Duration::from_millis(0)..=state.faults.max_delay)
        } else {
            Duration::from_millis(0)
        };

        Ok((handle, delay))
    }

    /// The reply travels back over the same lossy link.
    fn reply_survives(&self, from: &ReplicaId, to: &ReplicaId) -> Result<(), TransportError> {
        let state = self.lock();
        if state.isolated.contains(from) || state.isolated.contains(to) {
            return Err(TransportError::Dropped);
        }
        if state.faults.drop_rate > 0.0 && rand::thread_rng().gen_bool(state.faults.drop_rate.min(1.0)) {
            return Err(TransportError::Dropped);
        }

        Ok(())
    }
}

struct InProcessConnector {
    network: InProcessNetwork,
    from: ReplicaId,
}

impl PeerConnector for InProcessConnector {
    fn connect(&self, peer: &ReplicaMetadata) -> Arc<dyn PeerClient> {
        Arc::new(InProcessPeerClient {
            network: self.network.clone(),
            from: self.from.clone(),
            to: peer.replica_id().clone(),
        })
    }
}

struct InProcessPeerClient {
    network: InProcessNetwork,
    from: ReplicaId,
    to: ReplicaId,
}

impl InProcessPeerClient {
    async fn deliver(&self) -> Result<RaftRpcHandle, TransportError> {
        let (handle, delay) = self.network.route(&self.from, &self.to)?;
        if delay > Duration::from_millis(0) {
            tokio::time::sleep(delay).await;
        }
        Ok(handle)
    }
}

#[async_trait::async_trait]
impl PeerClient for InProcessPeerClient {
    async fn request_vote(
        &self,
        input: RequestVoteInput,
    ) -> Result<Result<RequestVoteOutput, RequestVoteError>, TransportError> {
        let result = self.deliver().await?.request_vote(input).await;
        self.network.reply_survives(&self.to, &self.from)?;
        Ok(result)
    }

    async fn append_entries(
        &self,
        input: AppendEntriesInput,
    ) -> Result<Result<AppendEntriesOutput, AppendEntriesError>, TransportError> {
        let result = self.deliver().await?.append_entries(input).await;
        self.network.reply_survives(&self.to, &self.from)?;
        Ok(result)
    }

    async fn install_snapshot(
        &self,
        input: InstallSnapshotInput,
    ) -> Result<Result<InstallSnapshotOutput, InstallSnapshotError>, TransportError> {
        let result = self.deliver().await?.install_snapshot(input).await;
        self.network.reply_survives(&self.to, &self.from)?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorClient;
    use crate::replica::{ReplicaInfoBlob, Term};
    use std::net::Ipv4Addr;

    fn md(id: &str) -> ReplicaMetadata {
        ReplicaMetadata::new(ReplicaId::new(id), Ipv4Addr::LOCALHOST, 9000, ReplicaInfoBlob::new(0))
    }

    fn vote_request() -> RequestVoteInput {
        RequestVoteInput {
            candidate_term: Term::new(1),
            candidate_id: ReplicaId::new("a"),
            candidate_last_log_entry: None,
        }
    }

    #[tokio::test]
    async fn routes_isolation_and_drops() {
        let network = InProcessNetwork::new();
        let client = network.connector(ReplicaId::new("a")).connect(&md("b"));

        // No route yet.
        assert!(matches!(
            client.request_vote(vote_request()).await,
            Err(TransportError::Unreachable(_))
        ));

        // Routed to a replica whose actor is gone: delivered, and the replica's answer comes back.
        let (actor_client, actor_rx) = ActorClient::new(1);
        drop(actor_rx);
        network.register(ReplicaId::new("b"), crate::api::RaftRpcHandle::new(actor_client));
        assert!(matches!(
            client.request_vote(vote_request()).await,
            Ok(Err(RequestVoteError::ActorExited))
        ));

        // Isolating either end drops the message.
        network.isolate(&ReplicaId::new("a"));
        assert!(matches!(
            client.request_vote(vote_request()).await,
            Err(TransportError::Dropped)
        ));
        network.heal_all();
        network.isolate(&ReplicaId::new("b"));
        assert!(matches!(
            client.request_vote(vote_request()).await,
            Err(TransportError::Dropped)
        ));
        network.heal(&ReplicaId::new("b"));

        network.set_faults(FaultConfig {
            drop_rate: 1.0,
            max_delay: Duration::from_millis(0),
        });
        assert!(matches!(
            client.request_vote(vote_request()).await,
            Err(TransportError::Dropped)
        ));

        network.set_faults(FaultConfig::default());
        network.unregister(&ReplicaId::new("b"));
        assert!(matches!(
            client.request_vote(vote_request()).await,
            Err(TransportError::Unreachable(_))
        ));
    }
}
