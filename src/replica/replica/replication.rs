use crate::commitlog::{Index, Log};
use crate::replica::election::{quorum_match_index, Role};
use crate::replica::local_state::Term;
use crate::replica::peers::ReplicaId;
use crate::replica::replica::peer_calls::{self, PeerCall};
use crate::replica::replica::Replica;
use crate::replica::replica_api::{
    AppendEntriesError, AppendEntriesInput, AppendEntriesOutput, InstallSnapshotInput, LeaderTimerTick,
    MembershipChange, ReplicationPayload, ReplicationReplyFromPeer, ReplicationReplyFromPeerDescriptor,
    ReplicationReplyFromPeerError, TermOutOfDateInfo,
};
use crate::replica::write_ahead_log::WriteAheadLogEntry;
use crate::replica::election::PeerStateUpdate;
use std::cmp;
use std::convert::TryFrom;
use std::io;

impl<L> Replica<L>
where
    L: Log<WriteAheadLogEntry>,
{
    pub(crate) fn server_handle_append_entries(
        &mut self,
        input: AppendEntriesInput,
    ) -> Result<AppendEntriesOutput, AppendEntriesError> {
        // 1. Reply false if term < currentTerm (§5.1)
        self.accept_leader_rpc(input.leader_term, &input.leader_id)
            .map_err(|e| match e {
                AcceptLeaderError::TermOutOfDate(info) => AppendEntriesError::ClientTermOutOfDate(info),
                AcceptLeaderError::Io(e) => AppendEntriesError::ServerIoError(e),
            })?;

        // 2. Reply false if [my] log doesn't contain an entry at [leader's]
        // prevLogIndex whose term matches [leader's] prevLogTerm (§5.3)
        if let Some((leader_prev_entry_term, leader_prev_entry_index)) = input.leader_previous_log_entry {
            self.check_previous_log_entry(leader_prev_entry_term, leader_prev_entry_index)?;
        }

        // 3. If [my] existing entry conflicts with [leader's new entries]
        // (same index but different terms), delete [my] existing entry and
        // all that follow it (§5.3)
        // 4. Append any new entries not already in the log
        let mut next_entry_index = match input.leader_previous_log_entry {
            None => Index::start_index(),
            Some((_, leader_prev_entry_index)) => leader_prev_entry_index.plus(1),
        };
        let mut truncated = false;
        for new_entry in input.new_entries.iter() {
            // Compacted entries are committed, so they match the leader's by definition.
            if self.wal.is_compacted(next_entry_index) {
                next_entry_index = next_entry_index.plus(1);
                continue;
            }

            let opt_existing_term = self
                .wal
                .term_at(next_entry_index)
                .map_err(AppendEntriesError::ServerIoError)?;

            // 3. (if...)
            if let Some(existing_term) = opt_existing_term {
                if existing_term == new_entry.term {
                    // 4. (no-op)
                    next_entry_index = next_entry_index.plus(1);
                    continue;
                } else {
                    // 3. (delete)
                    slog::info!(
                        self.logger,
                        "Truncating log at {:?}, conflicting term {:?} != {:?}",
                        next_entry_index,
                        existing_term,
                        new_entry.term
                    );
                    self.wal
                        .truncate(next_entry_index)
                        .map_err(AppendEntriesError::ServerIoError)?;
                    truncated |= self.cluster_tracker.abandon_pending_from(next_entry_index);
                }
            }

            // 4. (append)
            let appended_index = self
                .wal
                .append(new_entry.clone())
                .map_err(AppendEntriesError::ServerIoError)?;
            assert_eq!(
                appended_index, next_entry_index,
                "Appended log entry to unexpected index."
            );

            if new_entry.kind.is_membership_change() {
                match MembershipChange::try_from(new_entry) {
                    Ok(change) => self.cluster_tracker.set_pending(appended_index, change),
                    Err(e) => slog::error!(self.logger, "Undecodable membership entry at {:?}: {:?}", appended_index, e),
                }
            }

            next_entry_index = next_entry_index.plus(1);
        }

        if truncated {
            // The change in flight was overwritten. An older one may still be in the log.
            self.refresh_pending_membership();
        }

        // 5. If leaderCommit > commitIndex, set commitIndex = min(leaderCommit, index of last new entry)
        if let (Some(leader_commit_index), Some(index_of_last_new_entry)) =
            (input.leader_commit_index, next_entry_index.checked_minus(1))
        {
            let new_commit_index = cmp::min(leader_commit_index, index_of_last_new_entry);
            self.wal.ratchet_fwd_commit_index(new_commit_index);
        }

        // > If commitIndex > lastApplied: increment lastApplied, apply
        // > log[lastApplied] to state machine (§5.3)
        self.apply_committed_entries();

        Ok(AppendEntriesOutput {})
    }

    fn check_previous_log_entry(&self, prev_term: Term, prev_index: Index) -> Result<(), AppendEntriesError> {
        match self.wal.term_at(prev_index).map_err(AppendEntriesError::ServerIoError)? {
            Some(my_term) if my_term == prev_term => Ok(()),
            Some(conflicting_term) => {
                let next_index_hint = self
                    .first_index_of_term(conflicting_term, prev_index)
                    .map_err(AppendEntriesError::ServerIoError)?;
                slog::info!(
                    self.logger,
                    "Previous entry {:?} has term {:?}, leader expected {:?}. Hinting {:?}.",
                    prev_index,
                    conflicting_term,
                    prev_term,
                    next_index_hint
                );
                Err(AppendEntriesError::ServerMissingPreviousLogEntry { next_index_hint })
            }
            // Below our snapshot: committed, so it matches.
            None if self.wal.is_compacted(prev_index) => Ok(()),
            None => {
                let next_index_hint = self
                    .wal
                    .last_index()
                    .map(|i| i.plus(1))
                    .unwrap_or_else(Index::start_index);
                Err(AppendEntriesError::ServerMissingPreviousLogEntry { next_index_hint })
            }
        }
    }

    /// Walk back from `index` to the first entry of `term`, stopping at the snapshot boundary.
    fn first_index_of_term(&self, term: Term, index: Index) -> Result<Index, io::Error> {
        let mut first = index;
        while let Some(previous) = first.checked_minus(1) {
            if self.wal.is_compacted(previous) || self.wal.term_at(previous)? != Some(term) {
                break;
            }
            first = previous;
        }

        Ok(first)
    }

    /// Term checks shared by AppendEntries and InstallSnapshot. On success the sender is our
    /// leader and our election timer is reset.
    pub(super) fn accept_leader_rpc(&mut self, leader_term: Term, leader_id: &ReplicaId) -> Result<(), AcceptLeaderError> {
        let current_term = self.local_state.current_term();
        if leader_term < current_term {
            return Err(AcceptLeaderError::TermOutOfDate(TermOutOfDateInfo { current_term }));
        }

        let leader_info = self.leader_info(leader_id);
        let increased = self
            .local_state
            .store_term_if_increased(leader_term)
            .map_err(AcceptLeaderError::Io)?;

        if increased {
            self.become_follower(leader_term, leader_info);
        } else {
            match self.election_state.role() {
                // > If AppendEntries RPC received from new leader: convert to follower
                Role::Candidate => self.become_follower(leader_term, leader_info),
                Role::Follower => {
                    if let Some(info) = &leader_info {
                        self.election_state.set_leader_if_unknown(info);
                    }
                }
                Role::Leader => {
                    slog::crit!(
                        self.logger,
                        "Two leaders in term {:?}: {:?} and me. Rejecting.",
                        leader_term,
                        leader_id
                    );
                    return Err(AcceptLeaderError::TermOutOfDate(TermOutOfDateInfo { current_term }));
                }
            }
        }

        // Reset follower timeout.
        self.election_state.reset_timeout_if_follower();
        Ok(())
    }

    pub(crate) fn handle_replication_reply_from_peer(&mut self, reply: ReplicationReplyFromPeer) {
        let descriptor = reply.descriptor;
        let logger = self.logger.new(slog::o!(
            "Peer" => descriptor.peer_id.to_string(),
            "SeqNo" => descriptor.seq_no
        ));
        slog::debug!(logger, "Replication reply from peer result: {:?}", reply.result);

        let current_term = self.local_state.current_term();
        if current_term != descriptor.term {
            slog::info!(
                logger,
                "Received replication reply for outdated term {:?}, but we're on term {:?}",
                descriptor.term,
                current_term
            );
            return;
        }
        if self.election_state.leader_state().is_none() {
            slog::info!(logger, "No longer leader");
            return;
        }

        // 1. Check for stale term rejection
        let peer_state_update = match reply.result {
            Err(ReplicationReplyFromPeerError::StaleTerm { new_term }) => {
                slog::warn!(logger, "Rejected by peer because my term is stale.");
                match self.observe_term(new_term, None) {
                    Ok(true) => return,
                    Ok(false) => {
                        slog::warn!(logger, "This should not happen (unless peer has bug). Treating non-incrementing StaleTerm err as generic failure.");
                        PeerStateUpdate::OtherError
                    }
                    Err(e) => {
                        slog::error!(logger, "Failed to persist term {:?}: {:?}", new_term, e);
                        return;
                    }
                }
            }
            Err(ReplicationReplyFromPeerError::PeerMissingPreviousLogEntry { next_index_hint }) => {
                slog::info!(logger, "Peer is missing previous log entry. Hint: {:?}", next_index_hint);
                PeerStateUpdate::PeerLogBehind { next_index_hint }
            }
            Err(ReplicationReplyFromPeerError::RetryableFailure(err_msg)) => {
                slog::warn!(logger, "Replication failure: {}", err_msg);
                PeerStateUpdate::OtherError
            }
            Ok(_) => PeerStateUpdate::Success(descriptor.payload),
        };
        // Retrying right away after a failure would just spin against a dead peer. The
        // heartbeat timer covers that.
        let send_more = !matches!(peer_state_update, PeerStateUpdate::OtherError);

        // 2. Update peer log tracker
        let peer_state = match self
            .election_state
            .leader_state_mut()
            .and_then(|ls| ls.peer_state_mut(&descriptor.peer_id))
        {
            Some(peer_state) => peer_state,
            None => {
                slog::info!(logger, "Peer is no longer a replication target");
                return;
            }
        };
        peer_state.handle_replication_result(&logger, descriptor.seq_no, peer_state_update);
        let (next_index, _) = peer_state.next_and_previous_log_index();

        // 3. Check for majority replication and apply new commits.
        self.try_advance_commit_index();

        // 4. Keep going if the peer is still behind.
        // > If last log index ≥ nextIndex for a follower: send
        // > AppendEntries RPC with log entries starting at nextIndex
        if send_more && matches!(self.wal.last_index(), Some(last) if last >= next_index) {
            self.replicate_to_peer(&descriptor.peer_id);
        }
    }

    /// Leader path.
    ///
    /// > If there exists an N such that N > commitIndex, a majority
    /// > of matchIndex[i] ≥ N, and log[N].term == currentTerm:
    /// > set commitIndex = N (§5.3, §5.4).
    ///
    /// Only voting members count. A node whose addition is still pending has a match index, but
    /// it isn't part of any majority yet.
    pub(super) fn try_advance_commit_index(&mut self) {
        let leader_state = match self.election_state.leader_state() {
            Some(ls) => ls,
            None => return,
        };

        let mut matched: Vec<Option<Index>> = self
            .cluster_tracker
            .voting_peer_ids()
            .iter()
            .map(|peer_id| leader_state.peer_state(peer_id).and_then(|ps| ps.matched()))
            .collect();
        if self.cluster_tracker.am_i_member() {
            matched.push(self.wal.last_index());
        }

        let tentative_new_commit_index = match quorum_match_index(matched, self.cluster_tracker.num_voting_replicas()) {
            Some(index) => index,
            None => return,
        };

        let current_term = self.local_state.current_term();
        match self
            .wal
            .ratchet_fwd_commit_index_if_valid(tentative_new_commit_index, current_term)
        {
            Ok(true) => {
                slog::debug!(self.logger, "Commit index is now {:?}", tentative_new_commit_index);
                self.apply_committed_entries();
            }
            Ok(false) => {}
            Err(ioe) => slog::warn!(
                self.logger,
                "IO failure while confirming new commit index {:?}: {:?}",
                tentative_new_commit_index,
                ioe
            ),
        }
    }

    pub(crate) fn handle_leader_timer(&mut self, tick: LeaderTimerTick) {
        let current_term = self.local_state.current_term();
        if current_term != tick.term {
            slog::debug!(
                self.logger,
                "Received leader heartbeat for outdated term {:?}, current term: {:?}",
                tick.term,
                current_term
            );
            return;
        }

        self.replicate_to_peer(&tick.peer_id);
    }

    /// Eagerly push new entries to every peer that isn't already waiting on a reply.
    pub(super) fn replicate_to_idle_peers(&mut self) {
        let idle_peers: Vec<ReplicaId> = match self.election_state.leader_state() {
            None => return,
            Some(ls) => ls
                .peer_ids()
                .into_iter()
                .filter(|peer_id| matches!(ls.peer_state(peer_id), Some(ps) if !ps.has_outstanding_request()))
                .collect(),
        };

        for peer_id in idle_peers {
            self.replicate_to_peer(&peer_id);
        }
    }

    fn replicate_to_peer(&mut self, peer_id: &ReplicaId) {
        let current_term = self.local_state.current_term();
        match self.try_replicate_to_peer(peer_id, current_term) {
            Ok(_) => {}
            Err(HandleLeaderTimerError::NoLongerLeader) => {
                slog::debug!(self.logger, "Received leader timer event but no longer leader.")
            }
            Err(HandleLeaderTimerError::PeerConcurrencyThrottle) => {
                slog::debug!(self.logger, "Request to peer {:?} still outstanding", peer_id)
            }
            Err(HandleLeaderTimerError::UnknownPeer) => {
                slog::warn!(self.logger, "No descriptor for peer {:?}", peer_id)
            }
            Err(HandleLeaderTimerError::DiskRead(index, ioe)) => {
                slog::error!(self.logger, "Failed to read log entry at index {:?}: {:?}", index, ioe);
            }
            Err(HandleLeaderTimerError::UnexpectedMissingLogEntry(index)) => {
                slog::error!(
                    self.logger,
                    "Wtf! LeaderStateTracker is tracking index {:?}, but entry is missing from log.",
                    index
                );
            }
            Err(HandleLeaderTimerError::MissingSnapshot) => {
                slog::error!(self.logger, "Log is compacted but there's no snapshot to send. Wtf!");
            }
            Err(HandleLeaderTimerError::LeaderStateMissingPeer) => {
                slog::debug!(self.logger, "Peer {:?} is no longer a replication target", peer_id)
            }
        }
    }

    fn try_replicate_to_peer(&mut self, peer_id: &ReplicaId, current_term: Term) -> Result<(), HandleLeaderTimerError> {
        if self.election_state.role() != Role::Leader {
            return Err(HandleLeaderTimerError::NoLongerLeader);
        }
        let client = self.peer_client(peer_id).ok_or(HandleLeaderTimerError::UnknownPeer)?;
        let call = PeerCall {
            logger: self.logger.new(slog::o!("Peer" => peer_id.to_string())),
            client,
            callback: self.actor_client.clone(),
            rpc_timeout: self.settings.append_entries_timeout,
            cancel: self.peer_tasks.clone(),
        };

        let leader_state = self
            .election_state
            .leader_state_mut()
            .ok_or(HandleLeaderTimerError::NoLongerLeader)?;
        let peer_state = leader_state
            .peer_state_mut(peer_id)
            .ok_or(HandleLeaderTimerError::LeaderStateMissingPeer)?;

        // Simplicity vs throughput tradeoff. We're just going to allow 1 outstanding request per
        // peer; no pipelining. Entries are still batched.
        if peer_state.has_outstanding_request() {
            return Err(HandleLeaderTimerError::PeerConcurrencyThrottle);
        }

        let snapshot_boundary = self.wal.snapshot_boundary().map(|(_, index)| index);
        if peer_state.needs_snapshot(snapshot_boundary) {
            let snapshot = self
                .snapshot_manager
                .latest()
                .ok_or(HandleLeaderTimerError::MissingSnapshot)?;
            let descriptor = ReplicationReplyFromPeerDescriptor {
                peer_id: peer_id.clone(),
                term: current_term,
                seq_no: peer_state.next_seq_no(),
                payload: ReplicationPayload::Snapshot {
                    last_included_index: snapshot.last_included_index,
                },
            };
            let input = InstallSnapshotInput {
                leader_term: current_term,
                leader_id: self.my_replica_id.clone(),
                last_included_index: snapshot.last_included_index,
                last_included_term: snapshot.last_included_term,
                members: snapshot.members.clone(),
                data: snapshot.data.clone(),
            };
            tokio::task::spawn(peer_calls::call_peer_install_snapshot(call, input, descriptor));
        } else {
            let (input, descriptor) = leader_timer_handler::new_append_entries_request(
                current_term,
                self.my_replica_id.clone(),
                peer_id.clone(),
                peer_state,
                &self.wal,
                self.settings.max_entries_per_append,
            )?;
            tokio::task::spawn(peer_calls::call_peer_append_entries(call, input, descriptor));
        }

        peer_state.reset_heartbeat_timer();

        Ok(())
    }

    /// Rebuild the in-flight membership change from the unapplied part of the log.
    pub(super) fn refresh_pending_membership(&mut self) {
        let latest = match self.wal.unapplied_membership_entries() {
            Ok(mut entries) => entries.pop(),
            Err(e) => {
                slog::error!(self.logger, "Failed to scan log for membership entries: {:?}", e);
                return;
            }
        };

        if let Some((index, entry)) = latest {
            match MembershipChange::try_from(&entry) {
                Ok(change) => self.cluster_tracker.set_pending(index, change),
                Err(e) => slog::error!(self.logger, "Undecodable membership entry at {:?}: {:?}", index, e),
            }
        }
    }
}

pub(super) enum AcceptLeaderError {
    TermOutOfDate(TermOutOfDateInfo),
    Io(io::Error),
}

enum HandleLeaderTimerError {
    NoLongerLeader,
    PeerConcurrencyThrottle,
    UnknownPeer,
    DiskRead(Index, io::Error),
    UnexpectedMissingLogEntry(Index),
    MissingSnapshot,
    LeaderStateMissingPeer,
}

mod leader_timer_handler {
    use super::HandleLeaderTimerError;
    use crate::commitlog::Log;
    use crate::replica::election::PeerState;
    use crate::replica::replica_api::{AppendEntriesInput, ReplicationPayload, ReplicationReplyFromPeerDescriptor};
    use crate::replica::write_ahead_log::{WriteAheadLog, WriteAheadLogEntry};
    use crate::replica::{ReplicaId, Term};

    pub(super) fn new_append_entries_request<L>(
        current_term: Term,
        my_id: ReplicaId,
        peer_id: ReplicaId,
        peer_state: &mut PeerState,
        wal: &WriteAheadLog<L>,
        max_entries: usize,
    ) -> Result<(AppendEntriesInput, ReplicationReplyFromPeerDescriptor), HandleLeaderTimerError>
    where
        L: Log<WriteAheadLogEntry>,
    {
        let (next_index, opt_previous_index) = peer_state.next_and_previous_log_index();
        let leader_previous_log_entry = match opt_previous_index {
            None => None,
            Some(previous_index) => match wal.term_at(previous_index) {
                Ok(Some(term)) => Some((term, previous_index)),
                Ok(None) => return Err(HandleLeaderTimerError::UnexpectedMissingLogEntry(previous_index)),
                Err(e) => return Err(HandleLeaderTimerError::DiskRead(previous_index, e)),
            },
        };

        let new_entries = wal
            .read_from(next_index, max_entries)
            .map_err(|e| HandleLeaderTimerError::DiskRead(next_index, e))?;

        // Only claim a seq-no once the request is certain to go out.
        let descriptor = ReplicationReplyFromPeerDescriptor {
            peer_id,
            term: current_term,
            seq_no: peer_state.next_seq_no(),
            payload: ReplicationPayload::Entries {
                previous_log_entry_index: opt_previous_index,
                num_log_entries: new_entries.len(),
            },
        };

        let input = AppendEntriesInput {
            leader_term: current_term,
            leader_id: my_id,
            leader_previous_log_entry,
            leader_commit_index: wal.commit_index(),
            new_entries,
        };

        Ok((input, descriptor))
    }
}
