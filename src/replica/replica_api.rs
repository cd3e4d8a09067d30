use crate::commitlog::Index;
use crate::replica::local_state::Term;
use crate::replica::peers::{ReplicaId, ReplicaInfoBlob, ReplicaMetadata};
use crate::replica::write_ahead_log::{EntryOutcome, WriteAheadLogEntry};
use crate::replica::{EntryKind, RoleStateSnapshot};
use bytes::Bytes;
use std::convert::TryFrom;
use std::io;
use std::net::Ipv4Addr;
use tokio::sync::oneshot;

// ------- Client requests (local) -------

#[derive(Debug)]
pub(crate) struct EnqueueForReplicationInput {
    pub(crate) data: Bytes,
}

#[derive(Debug)]
pub(crate) struct EnqueueForReplicationOutput {
    pub(crate) enqueued_term: Term,
    // TODO:2.5 Index is type from commitlog crate. Bad abstraction. Fix it.
    pub(crate) enqueued_index: Index,
    // Resolved once the entry is applied, or abandoned.
    pub(crate) applied: oneshot::Receiver<EntryOutcome>,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum EnqueueForReplicationError {
    #[error("I'm not leader")]
    LeaderRedirect(LeaderRedirectInfo),

    // Can be retried with exponential backoff with recommended initial delay of 200ms. Likely an
    // election is in progress.
    #[error("Cluster is in a tough shape. No one is leader.")]
    NoLeader,

    #[error("Failed to persist log")]
    LocalIoError(#[source] io::Error),

    #[error("Replica actor is dead RIP")]
    ActorExited,
}

/// A single-server membership change.
#[derive(Clone, Debug, PartialEq)]
pub enum MembershipChange {
    Add(ReplicaMetadata),
    Remove(ReplicaId),
}

impl MembershipChange {
    pub(crate) fn into_log_entry(self, term: Term) -> WriteAheadLogEntry {
        match self {
            MembershipChange::Add(metadata) => WriteAheadLogEntry {
                term,
                kind: EntryKind::AddNode,
                data: metadata.encode(),
            },
            MembershipChange::Remove(replica_id) => WriteAheadLogEntry {
                term,
                kind: EntryKind::RemoveNode,
                data: Bytes::from(replica_id.into_inner()),
            },
        }
    }

    pub(crate) fn replica_id(&self) -> &ReplicaId {
        match self {
            MembershipChange::Add(metadata) => metadata.replica_id(),
            MembershipChange::Remove(replica_id) => replica_id,
        }
    }
}

impl TryFrom<&WriteAheadLogEntry> for MembershipChange {
    type Error = io::Error;

    fn try_from(entry: &WriteAheadLogEntry) -> Result<Self, Self::Error> {
        match entry.kind {
            EntryKind::AddNode => ReplicaMetadata::decode(entry.data.clone()).map(MembershipChange::Add),
            EntryKind::RemoveNode => String::from_utf8(entry.data.to_vec())
                .map(|id| MembershipChange::Remove(ReplicaId::new(id)))
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "RemoveNode entry id is not utf8")),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{:?} entry is not a membership change", other),
            )),
        }
    }
}

#[derive(Debug)]
pub(crate) struct ChangeMembershipOutput {
    pub(crate) enqueued_index: Index,
    pub(crate) applied: oneshot::Receiver<EntryOutcome>,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ChangeMembershipError {
    #[error("I'm not leader")]
    LeaderRedirect(LeaderRedirectInfo),
    #[error("No one is leader")]
    NoLeader,
    #[error("Another membership change is still in progress")]
    ConcurrentMembershipChange,
    #[error("{0} is already a member")]
    AlreadyMember(ReplicaId),
    #[error("{0} is not a member")]
    NotMember(ReplicaId),
    #[error("Replica id is {0} bytes, longer than a peer descriptor can hold")]
    ReplicaIdTooLong(usize),
    #[error("Failed to persist log")]
    LocalIoError(#[source] io::Error),
    #[error("Replica actor is dead RIP")]
    ActorExited,
}

/// Why an entry's waiter was resolved without the entry being applied on its behalf.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum EntryAbandoned {
    #[error("Leadership was lost before the entry was applied")]
    LeadershipLost,
    #[error("The entry was overwritten by a different leader's entry")]
    Overwritten,
    #[error("The replica shut down")]
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LeaderRedirectInfo {
    pub replica_id: ReplicaId,
    pub ip_addr: Ipv4Addr,
    pub port: u16,
    pub replica_blob: ReplicaInfoBlob,
}

impl From<&ReplicaMetadata> for LeaderRedirectInfo {
    fn from(metadata: &ReplicaMetadata) -> Self {
        LeaderRedirectInfo {
            replica_id: metadata.replica_id().clone(),
            ip_addr: metadata.ip_addr(),
            port: metadata.port(),
            replica_blob: metadata.info_blob(),
        }
    }
}

/// Point in time view of the replica, for operators and tests.
#[derive(Debug, Clone)]
pub(crate) struct ReplicaStatus {
    pub(crate) role: RoleStateSnapshot,
    pub(crate) commit_index: Option<Index>,
    pub(crate) last_applied_index: Option<Index>,
    pub(crate) last_log_index: Option<Index>,
    pub(crate) members: Vec<ReplicaMetadata>,
}

// ------- Raft RPCs (peer to peer) -------

#[derive(Debug, Clone)]
pub struct RequestVoteInput {
    pub candidate_term: Term,
    pub candidate_id: ReplicaId,
    // TODO:2.5 Index is type from commitlog crate. Bad abstraction. Fix it.
    pub candidate_last_log_entry: Option<(Term, Index)>,
}

#[derive(Debug, Clone)]
pub struct RequestVoteOutput {
    pub vote_granted: bool,
}

#[derive(thiserror::Error, Debug)]
pub enum RequestVoteError {
    #[error("Requesting candidate is not in the cluster")]
    CandidateNotInCluster,
    #[error("Requesting candidate's term is out of date")]
    RequestTermOutOfDate(TermOutOfDateInfo),
    #[error("We (server) had an IO failure: {0:?}")]
    ServerIoError(#[source] io::Error),
    #[error("We (server) are unavailable because actor is dead RIP")]
    ActorExited,
}

#[derive(Debug, Clone)]
pub struct AppendEntriesInput {
    pub leader_term: Term,
    pub leader_id: ReplicaId,
    // "Previous log entry" is the log entry immediately preceding the new ones in AppendEntriesInput.
    pub leader_previous_log_entry: Option<(Term, Index)>,
    pub leader_commit_index: Option<Index>,
    pub new_entries: Vec<WriteAheadLogEntry>,
}

#[derive(Debug, Clone)]
pub struct AppendEntriesOutput {
    // Nothing
}

#[derive(thiserror::Error, Debug)]
pub enum AppendEntriesError {
    #[error("Client's term is out of date")]
    ClientTermOutOfDate(TermOutOfDateInfo),
    /// `next_index_hint` is where the leader should try next: our last index + 1 if our log is
    /// too short, otherwise the first index of the term that conflicts.
    #[error("We (server) are missing previous log entry")]
    ServerMissingPreviousLogEntry { next_index_hint: Index },
    #[error("We (server) had an IO failure: {0:?}")]
    ServerIoError(#[source] io::Error),
    #[error("We (server) are unavailable because actor is dead RIP")]
    ActorExited,
}

#[derive(Debug, Clone)]
pub struct InstallSnapshotInput {
    pub leader_term: Term,
    pub leader_id: ReplicaId,
    pub last_included_index: Index,
    pub last_included_term: Term,
    pub members: Vec<ReplicaMetadata>,
    pub data: Bytes,
}

#[derive(Debug, Clone)]
pub struct InstallSnapshotOutput {
    // Nothing
}

#[derive(thiserror::Error, Debug)]
pub enum InstallSnapshotError {
    #[error("Client's term is out of date")]
    ClientTermOutOfDate(TermOutOfDateInfo),
    #[error("State machine rejected the snapshot: {0}")]
    StateMachineFailure(String),
    #[error("We (server) had an IO failure: {0:?}")]
    ServerIoError(#[source] io::Error),
    #[error("We (server) are unavailable because actor is dead RIP")]
    ActorExited,
}

#[derive(Debug, Clone)]
pub struct TermOutOfDateInfo {
    pub current_term: Term,
}

// ------- Replies from peers, posted back into the actor -------

#[derive(Debug)]
pub(crate) struct RequestVoteReplyFromPeer {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) result: RequestVoteResult,
}

#[derive(Debug)]
pub(crate) enum RequestVoteResult {
    VoteGranted,
    VoteNotGranted,
    StaleTerm { new_term: Term },
    RetryableFailure,
}

#[derive(Debug)]
pub(crate) struct ReplicationReplyFromPeer {
    pub(crate) descriptor: ReplicationReplyFromPeerDescriptor,
    pub(crate) result: Result<(), ReplicationReplyFromPeerError>,
}

// This is basically info about the original request
#[derive(Debug)]
pub(crate) struct ReplicationReplyFromPeerDescriptor {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) seq_no: u64,
    pub(crate) payload: ReplicationPayload,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum ReplicationPayload {
    Entries {
        previous_log_entry_index: Option<Index>,
        num_log_entries: usize,
    },
    Snapshot {
        last_included_index: Index,
    },
}

#[derive(Debug)]
pub(crate) enum ReplicationReplyFromPeerError {
    PeerMissingPreviousLogEntry { next_index_hint: Index },
    RetryableFailure(String),
    StaleTerm { new_term: Term },
}

/// LeaderTimerTick contains info for a single tick of a leader's per-peer timer.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LeaderTimerTick {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
}

/// FollowerTimeoutTick is fired by the election timer armed for `generation`. A tick from any
/// older generation belongs to a role we already left, and is ignored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct FollowerTimeoutTick {
    pub(crate) generation: u64,
}
