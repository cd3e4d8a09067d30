use crate::actor::ActorClient;
use crate::actor::Event;
use crate::commitlog::InMemoryLog;
use crate::replica::replica::Replica;
use crate::replica::replica_api::{
    AppendEntriesError, AppendEntriesInput, AppendEntriesOutput, EnqueueForReplicationInput, FollowerTimeoutTick,
    InstallSnapshotError, InstallSnapshotInput, InstallSnapshotOutput, LeaderTimerTick, ReplicationPayload,
    ReplicationReplyFromPeer, ReplicationReplyFromPeerDescriptor, ReplicationReplyFromPeerError,
    RequestVoteError, RequestVoteInput, RequestVoteOutput, RequestVoteReplyFromPeer, RequestVoteResult,
};
use crate::replica::{
    create_replica, EntryOutcome, ReplicaConfig, ReplicaId, ReplicaInfoBlob, ReplicaMetadata, Role,
    SnapshotPolicy, StateMachine, StateMachineError, StateMachineOutput, Term, VolatileLocalState,
    WriteAheadLogEntry,
};
use crate::transport::{PeerClient, PeerConnector, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Peers that never answer. Replies are fed to the replica by hand instead.
struct SilentConnector;

impl PeerConnector for SilentConnector {
    fn connect(&self, _: &ReplicaMetadata) -> Arc<dyn PeerClient> {
        Arc::new(SilentPeer)
    }
}

struct SilentPeer;

#[async_trait]
impl PeerClient for SilentPeer {
    async fn request_vote(
        &self,
        _: RequestVoteInput,
    ) -> Result<Result<RequestVoteOutput, RequestVoteError>, TransportError> {
        std::future::pending().await
    }

    async fn append_entries(
        &self,
        _: AppendEntriesInput,
    ) -> Result<Result<AppendEntriesOutput, AppendEntriesError>, TransportError> {
        std::future::pending().await
    }

    async fn install_snapshot(
        &self,
        _: InstallSnapshotInput,
    ) -> Result<Result<InstallSnapshotOutput, InstallSnapshotError>, TransportError> {
        std::future::pending().await
    }
}

pub(super) struct Harness {
    pub(super) replica: Replica<InMemoryLog<WriteAheadLogEntry>>,
    // Keeps the queue alive so that timers don't see the actor as gone.
    _actor_client: ActorClient,
    _rx: mpsc::Receiver<Event>,
}

impl Harness {
    /// Leader only. Returns the receiver that resolves once the entry is applied.
    pub(super) fn enqueue(&mut self, data: Vec<u8>) -> oneshot::Receiver<EntryOutcome> {
        self.replica
            .handle_enqueue_for_replication(EnqueueForReplicationInput { data: Bytes::from(data) })
            .unwrap()
            .applied
    }
}

pub(super) fn md(id: &str) -> ReplicaMetadata {
    let port = 9000 + id.bytes().map(u16::from).sum::<u16>();
    ReplicaMetadata::new(ReplicaId::new(id), Ipv4Addr::LOCALHOST, port, ReplicaInfoBlob::new(0))
}

/// A follower of `members`, with timers too slow to ever fire during a test.
pub(super) fn replica(my_id: &str, members: &[&str]) -> Harness {
    replica_with_snapshot_threshold(my_id, members, 1000)
}

fn replica_with_snapshot_threshold(my_id: &str, members: &[&str], max_log_entries: u64) -> Harness {
    let (actor_client, rx) = ActorClient::new(16);
    let logger = slog::Logger::root(slog::Discard, slog::o!());
    let (replica, _) = create_replica(ReplicaConfig {
        logger,
        my_replica_id: ReplicaId::new(my_id),
        initial_members: members.iter().map(|id| md(id)).collect(),
        local_state: Box::new(VolatileLocalState::new(ReplicaId::new(my_id))),
        commit_log: InMemoryLog::create().unwrap(),
        snapshot_path: None,
        config_path: None,
        peer_connector: Arc::new(SilentConnector),
        actor_client: actor_client.weak(),
        leader_heartbeat_duration: Duration::from_secs(3600),
        follower_min_timeout: Duration::from_secs(3600),
        follower_max_timeout: Duration::from_secs(7200),
        append_entries_timeout: Duration::from_secs(3600),
        max_entries_per_append: 64,
        snapshot_policy: SnapshotPolicy {
            max_log_entries,
            max_age: None,
        },
        peer_tasks: CancellationToken::new(),
    })
    .unwrap();

    Harness {
        replica,
        _actor_client: actor_client,
        _rx: rx,
    }
}

/// Campaign and collect votes from every voting peer.
pub(super) fn elect(harness: &mut Harness) {
    let generation = harness.replica.election_state.timer_generation();
    harness
        .replica
        .handle_follower_timeout(FollowerTimeoutTick { generation });
    let term = harness.replica.local_state.current_term();
    for peer_id in harness.replica.cluster_tracker.voting_peer_ids() {
        harness
            .replica
            .handle_request_vote_reply_from_peer(vote(peer_id.as_str(), term.as_u64(), true));
    }
    assert_eq!(harness.replica.election_state.role(), Role::Leader);
}

/// Elected leader of term 1 with a `RecordingStateMachine` registered.
pub(super) fn leader(my_id: &str, members: &[&str]) -> Harness {
    leader_with_snapshot_threshold(my_id, members, 1000)
}

pub(super) fn leader_with_snapshot_threshold(my_id: &str, members: &[&str], max_log_entries: u64) -> Harness {
    let mut harness = replica_with_snapshot_threshold(my_id, members, max_log_entries);
    let (state_machine, _) = RecordingStateMachine::new();
    harness.replica.register_state_machine(Box::new(state_machine)).unwrap();
    elect(&mut harness);
    harness
}

pub(super) fn entry(term: u64) -> WriteAheadLogEntry {
    WriteAheadLogEntry::general(Term::new(term), Bytes::from(format!("t{}", term)))
}

pub(super) fn vote(peer_id: &str, term: u64, granted: bool) -> RequestVoteReplyFromPeer {
    RequestVoteReplyFromPeer {
        peer_id: ReplicaId::new(peer_id),
        term: Term::new(term),
        result: if granted {
            RequestVoteResult::VoteGranted
        } else {
            RequestVoteResult::VoteNotGranted
        },
    }
}

pub(super) fn tick(peer_id: &str, term: u64) -> LeaderTimerTick {
    LeaderTimerTick {
        peer_id: ReplicaId::new(peer_id),
        term: Term::new(term),
    }
}

fn descriptor(peer_id: &str, term: u64, seq_no: u64, payload: ReplicationPayload) -> ReplicationReplyFromPeerDescriptor {
    ReplicationReplyFromPeerDescriptor {
        peer_id: ReplicaId::new(peer_id),
        term: Term::new(term),
        seq_no,
        payload,
    }
}

pub(super) fn ack(peer_id: &str, term: u64, seq_no: u64, payload: ReplicationPayload) -> ReplicationReplyFromPeer {
    ReplicationReplyFromPeer {
        descriptor: descriptor(peer_id, term, seq_no, payload),
        result: Ok(()),
    }
}

fn failed(peer_id: &str, term: u64, seq_no: u64, error: ReplicationReplyFromPeerError) -> ReplicationReplyFromPeer {
    let payload = ReplicationPayload::Entries {
        previous_log_entry_index: None,
        num_log_entries: 0,
    };
    ReplicationReplyFromPeer {
        descriptor: descriptor(peer_id, term, seq_no, payload),
        result: Err(error),
    }
}

pub(super) fn stale_term_reply(peer_id: &str, term: u64, seq_no: u64, new_term: u64) -> ReplicationReplyFromPeer {
    failed(
        peer_id,
        term,
        seq_no,
        ReplicationReplyFromPeerError::StaleTerm {
            new_term: Term::new(new_term),
        },
    )
}

pub(super) fn retryable_failure(peer_id: &str, term: u64, seq_no: u64) -> ReplicationReplyFromPeer {
    failed(
        peer_id,
        term,
        seq_no,
        ReplicationReplyFromPeerError::RetryableFailure("test".into()),
    )
}

/// Echoes every command back as its output and records what it saw. Snapshots are recorded as
/// `snapshot:<data>`.
pub(super) struct RecordingStateMachine {
    seen: Arc<Mutex<Vec<Bytes>>>,
}

impl RecordingStateMachine {
    pub(super) fn new() -> (Self, Arc<Mutex<Vec<Bytes>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        (RecordingStateMachine { seen: seen.clone() }, seen)
    }
}

impl StateMachine for RecordingStateMachine {
    fn apply_command(&mut self, command: Bytes) -> StateMachineOutput {
        self.seen.lock().unwrap().push(command.clone());
        StateMachineOutput::Data(command)
    }

    fn generate_snapshot(&self) -> Bytes {
        Bytes::from(format!("{} commands", self.seen.lock().unwrap().len()))
    }

    fn apply_snapshot(&mut self, snapshot: Bytes) -> Result<(), StateMachineError> {
        let mut recorded = b"snapshot:".to_vec();
        recorded.extend_from_slice(&snapshot);
        self.seen.lock().unwrap().push(Bytes::from(recorded));
        Ok(())
    }
}
