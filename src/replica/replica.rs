use crate::actor::WeakActorClient;
use crate::commitlog::Log;
use crate::replica::election::{CurrentLeader, ElectionState, Role};
use crate::replica::local_state::{PersistentLocalState, Term};
use crate::replica::membership::ClusterTracker;
use crate::replica::peers::ReplicaId;
use crate::replica::replica_api::{
    EnqueueForReplicationError, EnqueueForReplicationInput, EnqueueForReplicationOutput, LeaderRedirectInfo,
    ReplicaStatus,
};
use crate::replica::snapshot::SnapshotManager;
use crate::replica::state_machine::{StateMachine, StateMachineError};
use crate::replica::write_ahead_log::{WriteAheadLog, WriteAheadLogEntry};
use crate::replica::EntryAbandoned;
use crate::transport::{PeerClient, PeerConnector};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

mod applying;
mod membership_changes;
mod peer_calls;
mod replication;
mod snapshots;
mod voting;

#[cfg(test)]
mod test_utils;

/// Knobs for how the leader talks to its peers.
#[derive(Clone, Debug)]
pub(crate) struct ReplicationSettings {
    pub(crate) append_entries_timeout: Duration,
    pub(crate) max_entries_per_append: usize,
    // Wait before retrying a RequestVote that failed in transit.
    pub(crate) request_vote_retry_delay: Duration,
}

/// Replica is the raft algorithm for a single member of the cluster. It's driven entirely by the
/// actor, one event at a time, so nothing in here needs locking.
pub(crate) struct Replica<L>
where
    L: Log<WriteAheadLogEntry>,
{
    logger: slog::Logger,
    my_replica_id: ReplicaId,
    cluster_tracker: ClusterTracker,
    local_state: Box<dyn PersistentLocalState>,
    election_state: ElectionState,
    wal: WriteAheadLog<L>,

    // Nothing that needs a state machine is applied until one is registered.
    state_machine: Option<Box<dyn StateMachine>>,
    snapshot_manager: SnapshotManager,
    // A snapshot was installed while no state machine was registered. The next registration
    // starts from it.
    snapshot_awaiting_state_machine: bool,

    peer_connector: Arc<dyn PeerConnector>,
    peer_clients: HashMap<ReplicaId, Arc<dyn PeerClient>>,
    actor_client: WeakActorClient,
    settings: ReplicationSettings,
    // Cancelled on shutdown. Every spawned peer call selects on it.
    peer_tasks: CancellationToken,
}

impl<L> Replica<L>
where
    L: Log<WriteAheadLogEntry>,
{
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        logger: slog::Logger,
        cluster_tracker: ClusterTracker,
        local_state: Box<dyn PersistentLocalState>,
        election_state: ElectionState,
        wal: WriteAheadLog<L>,
        snapshot_manager: SnapshotManager,
        peer_connector: Arc<dyn PeerConnector>,
        actor_client: WeakActorClient,
        settings: ReplicationSettings,
        peer_tasks: CancellationToken,
    ) -> Self {
        // After a restart the state machine starts from the stored snapshot.
        let snapshot_awaiting_state_machine = snapshot_manager.latest().is_some();
        let mut replica = Replica {
            logger,
            my_replica_id: cluster_tracker.my_replica_id().clone(),
            cluster_tracker,
            local_state,
            election_state,
            wal,
            state_machine: None,
            snapshot_manager,
            snapshot_awaiting_state_machine,
            peer_connector,
            peer_clients: HashMap::new(),
            actor_client,
            settings,
            peer_tasks,
        };
        // A membership entry appended before a restart is still in flight.
        replica.refresh_pending_membership();

        replica
    }

    pub(crate) fn handle_enqueue_for_replication(
        &mut self,
        input: EnqueueForReplicationInput,
    ) -> Result<EnqueueForReplicationOutput, EnqueueForReplicationError> {
        // Leader check
        match self.election_state.current_leader() {
            CurrentLeader::Me => { /* carry on */ }
            CurrentLeader::Other(leader) => return Err(EnqueueForReplicationError::LeaderRedirect(leader)),
            CurrentLeader::Unknown => return Err(EnqueueForReplicationError::NoLeader),
        }

        // > If command received from client: append entry to local log,
        // > respond after entry applied to state machine (§5.3)
        let term = self.local_state.current_term();
        let appended_index = self
            .wal
            .append(WriteAheadLogEntry::general(term, input.data))
            .map_err(EnqueueForReplicationError::LocalIoError)?;
        let applied = self.wal.register_listener(appended_index, term);

        self.replicate_to_idle_peers();
        // Single voter clusters commit on local append.
        self.try_advance_commit_index();

        Ok(EnqueueForReplicationOutput {
            enqueued_term: term,
            enqueued_index: appended_index,
            applied,
        })
    }

    /// A state machine that can't load the pending snapshot isn't installed. Apply stays paused
    /// until one that can is registered.
    pub(crate) fn register_state_machine(
        &mut self,
        mut state_machine: Box<dyn StateMachine>,
    ) -> Result<(), StateMachineError> {
        if self.snapshot_awaiting_state_machine {
            if let Some(snapshot) = self.snapshot_manager.latest() {
                if let Err(e) = state_machine.apply_snapshot(snapshot.data.clone()) {
                    slog::crit!(
                        self.logger,
                        "Registered state machine rejected snapshot at {:?}: {}",
                        snapshot.last_included_index,
                        e
                    );
                    return Err(e);
                }
            }
            self.snapshot_awaiting_state_machine = false;
        }

        if self.state_machine.replace(state_machine).is_some() {
            slog::warn!(self.logger, "Replaced previously registered state machine");
        } else {
            slog::info!(self.logger, "State machine registered");
        }

        self.apply_committed_entries();

        Ok(())
    }

    pub(crate) fn status(&self) -> ReplicaStatus {
        ReplicaStatus {
            role: self.election_state.current_state(),
            commit_index: self.wal.commit_index(),
            last_applied_index: self.wal.last_applied_index(),
            last_log_index: self.wal.last_index(),
            members: self.cluster_tracker.members(),
        }
    }

    pub(crate) fn shutdown(&mut self) {
        slog::info!(self.logger, "Shutting down. Election state: {:?}", self.election_state);
        self.peer_tasks.cancel();
        self.wal.abandon_listeners(EntryAbandoned::Shutdown);
    }

    /// > If RPC request or response contains term T > currentTerm:
    /// > set currentTerm = T, convert to follower (§5.1)
    ///
    /// Returns true if the term increased.
    fn observe_term(&mut self, term: Term, leader: Option<LeaderRedirectInfo>) -> Result<bool, io::Error> {
        let increased = self.local_state.store_term_if_increased(term)?;
        if increased {
            self.become_follower(term, leader);
        }

        Ok(increased)
    }

    fn become_follower(&mut self, term: Term, leader: Option<LeaderRedirectInfo>) {
        let was_leader = self.election_state.role() == Role::Leader;
        self.election_state.transition_to_follower(term, leader);
        if was_leader {
            self.wal.abandon_listeners(EntryAbandoned::LeadershipLost);
        }
        slog::info!(self.logger, "Transitioned to follower. Election state: {:?}", self.election_state);
    }

    fn leader_info(&self, replica_id: &ReplicaId) -> Option<LeaderRedirectInfo> {
        self.cluster_tracker.metadata(replica_id).map(LeaderRedirectInfo::from)
    }

    /// Clients are created on first use and cached until the peer leaves the cluster.
    fn peer_client(&mut self, peer_id: &ReplicaId) -> Option<Arc<dyn PeerClient>> {
        if let Some(client) = self.peer_clients.get(peer_id) {
            return Some(client.clone());
        }

        let metadata = self.cluster_tracker.metadata(peer_id)?;
        let client = self.peer_connector.connect(metadata);
        self.peer_clients.insert(peer_id.clone(), client.clone());

        Some(client)
    }
}
