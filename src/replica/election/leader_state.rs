use crate::commitlog::Index;
use crate::replica::election::timers::HeartbeatTimerHandle;
use crate::replica::{ReplicaId, ReplicationPayload};
use std::cmp;
use std::collections::HashMap;
use tokio::time::Instant;

pub(crate) struct LeaderStateTracker {
    peer_state: HashMap<ReplicaId, PeerState>,
}

impl LeaderStateTracker {
    pub(super) fn new(peer_state: HashMap<ReplicaId, PeerState>) -> Self {
        LeaderStateTracker { peer_state }
    }

    pub(crate) fn peer_state_mut(&mut self, peer_id: &ReplicaId) -> Option<&mut PeerState> {
        self.peer_state.get_mut(peer_id)
    }

    pub(crate) fn peer_state(&self, peer_id: &ReplicaId) -> Option<&PeerState> {
        self.peer_state.get(peer_id)
    }

    pub(crate) fn contains_peer(&self, peer_id: &ReplicaId) -> bool {
        self.peer_state.contains_key(peer_id)
    }

    pub(crate) fn peer_ids(&self) -> Vec<ReplicaId> {
        self.peer_state.keys().cloned().collect()
    }

    pub(super) fn insert_peer(&mut self, peer_id: ReplicaId, peer_state: PeerState) {
        self.peer_state.insert(peer_id, peer_state);
    }

    /// Dropping the PeerState stops its heartbeat timer.
    pub(crate) fn remove_peer(&mut self, peer_id: &ReplicaId) {
        self.peer_state.remove(peer_id);
    }
}

pub(crate) struct PeerState {
    // Held to send heartbeats for this peer
    heartbeat_timer: HeartbeatTimerHandle,

    // > index of the next log entry to send to that server
    // > (initialized to leader last log index + 1)
    next: Index,
    // > index of highest log entry known to be replicated on server
    // > (initialized to 0, increases monotonically)
    // After initial reconciliation of follower logs, this will converge
    // to always be the same as `next - 1`.
    matched: Option<Index>,
    last_ack: Option<Instant>,

    // SeqNo is a form of a logical clock that tracks a term leader's interactions with a peer. When
    // a replica becomes leader, it initializes last sent/received to 0. Each time leader sends a
    // request, it increments the last sent SeqNo and ensures the response will be associated with
    // that SeqNo. If a leader receives a SeqNo from earlier than a previously received SeqNo, it
    // discards it.
    last_sent_seq_no: u64,
    last_received_seq_no: u64,
}

impl PeerState {
    pub(super) fn new(heartbeat_timer: HeartbeatTimerHandle, previous_log_entry_index: Option<Index>) -> Self {
        PeerState {
            heartbeat_timer,
            next: previous_log_entry_index
                .map(|i| i.plus(1))
                .unwrap_or_else(Index::start_index),
            matched: None,
            last_ack: None,
            last_sent_seq_no: 0,
            last_received_seq_no: 0,
        }
    }

    pub(crate) fn next_and_previous_log_index(&self) -> (Index, Option<Index>) {
        (self.next, self.next.checked_minus(1))
    }

    pub(crate) fn matched(&self) -> Option<Index> {
        self.matched
    }

    pub(crate) fn last_ack(&self) -> Option<Instant> {
        self.last_ack
    }

    pub(crate) fn handle_replication_result(
        &mut self,
        logger: &slog::Logger,
        received_seq_no: u64,
        update: PeerStateUpdate,
    ) {
        if !self.ratchet_fwd_received_seq_no(received_seq_no) {
            slog::warn!(
                logger,
                "Dropping out of date seq-no({:?}): {:?}",
                received_seq_no,
                update
            );
            return;
        }

        match update {
            PeerStateUpdate::OtherError => { /* No action */ }
            PeerStateUpdate::Success(payload) => {
                self.last_ack = Some(Instant::now());
                self.update_log(logger, payload);
            }
            PeerStateUpdate::PeerLogBehind { next_index_hint } => {
                self.last_ack = Some(Instant::now());
                self.rewind_log(logger, next_index_hint);
            }
        }
    }

    fn update_log(&mut self, logger: &slog::Logger, payload: ReplicationPayload) {
        let new_matched = match payload {
            ReplicationPayload::Entries {
                previous_log_entry_index,
                num_log_entries,
            } => match (previous_log_entry_index, num_log_entries) {
                // Empty log on both sides. Nothing to learn.
                (None, 0) => return,
                (None, n) => Index::new_usize(n),
                (Some(prev), n) => prev.plus(n as u64),
            },
            ReplicationPayload::Snapshot { last_included_index } => last_included_index,
        };

        if let Some(matched) = self.matched {
            if new_matched < matched {
                // Don't panic here, because peer could return garbage data.
                slog::warn!(
                    logger,
                    "Matched can only ratchet forward. CurrentMatched={:?}, NewMatched={:?}",
                    matched,
                    new_matched
                );
                return;
            }
        }

        self.matched.replace(new_matched);
        self.next = cmp::max(self.next, new_matched.plus(1));
    }

    /// Accelerated back-off: jump to the follower's hint, but always move back at least one entry
    /// and never below what's already known to match.
    fn rewind_log(&mut self, logger: &slog::Logger, next_index_hint: Index) {
        let floor = self
            .matched
            .map(|m| m.plus(1))
            .unwrap_or_else(Index::start_index);

        let stepped_back = match self.next.checked_minus(1) {
            Some(new) => new,
            None => {
                slog::warn!(logger, "Can't rewind peer log, already at beginning of log.");
                return;
            }
        };

        self.next = cmp::max(floor, cmp::min(stepped_back, next_index_hint));
    }

    /// The peer's log is behind our snapshot boundary. Next request will be InstallSnapshot.
    pub(crate) fn needs_snapshot(&self, snapshot_boundary: Option<Index>) -> bool {
        matches!(snapshot_boundary, Some(boundary) if self.next <= boundary)
    }

    pub(crate) fn has_outstanding_request(&self) -> bool {
        self.last_received_seq_no < self.last_sent_seq_no
    }

    pub(crate) fn next_seq_no(&mut self) -> u64 {
        self.last_sent_seq_no += 1;
        self.last_sent_seq_no
    }

    /// returns true if the state was mutated.
    fn ratchet_fwd_received_seq_no(&mut self, received_seq_no: u64) -> bool {
        if self.last_received_seq_no < received_seq_no && received_seq_no <= self.last_sent_seq_no {
            self.last_received_seq_no = received_seq_no;
            true
        } else {
            false
        }
    }

    pub(crate) fn reset_heartbeat_timer(&self) {
        self.heartbeat_timer.reset_heartbeat_timer();
    }
}

#[derive(Debug)]
pub(crate) enum PeerStateUpdate {
    Success(ReplicationPayload),
    PeerLogBehind { next_index_hint: Index },
    OtherError,
}

/// Highest index replicated on a majority of `voters`. `matched` holds each voter's match index;
/// voters missing from it count as matching nothing.
pub(crate) fn quorum_match_index(mut matched: Vec<Option<Index>>, num_voters: usize) -> Option<Index> {
    if num_voters == 0 {
        return None;
    }
    matched.resize(cmp::max(matched.len(), num_voters), None);

    // Descending. The majority-th highest value is replicated on at least a majority.
    matched.sort_by(|a, b| b.cmp(a));
    let majority = (num_voters / 2) + 1;

    matched[majority - 1]
}
