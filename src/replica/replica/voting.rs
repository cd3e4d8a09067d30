use crate::commitlog::{Index, Log};
use crate::replica::election::Role;
use crate::replica::local_state::Term;
use crate::replica::peers::ReplicaId;
use crate::replica::replica::peer_calls::{self, PeerCall};
use crate::replica::replica::Replica;
use crate::replica::replica_api::{
    FollowerTimeoutTick, RequestVoteError, RequestVoteInput, RequestVoteOutput, RequestVoteReplyFromPeer,
    RequestVoteResult, TermOutOfDateInfo,
};
use crate::replica::write_ahead_log::WriteAheadLogEntry;
use tokio::time::Duration;

impl<L> Replica<L>
where
    L: Log<WriteAheadLogEntry>,
{
    pub(crate) fn server_handle_request_vote(
        &mut self,
        input: RequestVoteInput,
    ) -> Result<RequestVoteOutput, RequestVoteError> {
        // Ensure candidate is a voting member. A removed server would otherwise keep bumping our
        // term with elections it can never win.
        if !self.cluster_tracker.contains_member(&input.candidate_id) {
            slog::info!(
                self.logger,
                "Not granting vote. {:?} is not a member of the cluster.",
                input.candidate_id
            );
            return Err(RequestVoteError::CandidateNotInCluster);
        }

        // Read our local term/vote state as 1 atomic action.
        let (current_term, mut opt_voted_for) = self.local_state.voted_for_current_term();

        // 1. Reply false if term < currentTerm (§5.1)
        if input.candidate_term < current_term {
            slog::info!(self.logger, "Not granting vote. Client term is out of date.");
            return Err(RequestVoteError::RequestTermOutOfDate(TermOutOfDateInfo {
                current_term,
            }));
        }

        // > If RPC request or response contains term T > currentTerm:
        // > set currentTerm = T, convert to follower (§5.1)
        let increased = self
            .observe_term(input.candidate_term, None)
            .map_err(RequestVoteError::ServerIoError)?;
        if increased {
            // If we've increased the term, it means we haven't voted for anyone this term.
            opt_voted_for = None;
        }

        // 2. If votedFor is null or candidateId, and candidate’s log is at
        // least as up-to-date as receiver’s log, grant vote (§5.2, §5.4).

        // If votedFor is null or candidateId, and...
        if let Some(voted_for) = opt_voted_for {
            if *voted_for != input.candidate_id {
                slog::info!(self.logger, "Not granting vote. We already voted for {:?}.", voted_for);
                return Ok(RequestVoteOutput { vote_granted: false });
            }
        }

        // ...and candidate’s log is at least as up-to-date as receiver’s log...
        if !self.is_candidate_log_gte_mine(input.candidate_last_log_entry) {
            slog::info!(
                self.logger,
                "Not granting vote. Candidate log {:?} is behind mine {:?}.",
                input.candidate_last_log_entry,
                self.wal.latest_entry()
            );
            return Ok(RequestVoteOutput { vote_granted: false });
        }

        // ...grant vote
        let cas_success = self
            .local_state
            .store_vote_for_term_if_unvoted(input.candidate_term, input.candidate_id.clone())
            .map_err(RequestVoteError::ServerIoError)?;

        if cas_success {
            slog::info!(self.logger, "Voting for {:?}.", input.candidate_id);
            // > If election timeout elapses without receiving AppendEntries RPC from current
            // > leader or granting vote to candidate: convert to candidate
            self.election_state.reset_timeout_if_follower();
            return Ok(RequestVoteOutput { vote_granted: true });
        }

        // Vote was already stored. Re-read state and return success based on if the earlier
        // vote was the same one we'd make now (e.g. a retried request).
        if let (reread_current_term, Some(reread_voted_for)) = self.local_state.voted_for_current_term() {
            if reread_current_term == input.candidate_term && reread_voted_for.as_ref() == &input.candidate_id {
                return Ok(RequestVoteOutput { vote_granted: true });
            }
        }

        slog::info!(self.logger, "Not granting vote. Lost race storing vote.");
        Ok(RequestVoteOutput { vote_granted: false })
    }

    fn is_candidate_log_gte_mine(&self, candidate_last_entry: Option<(Term, Index)>) -> bool {
        // > Raft determines which of two logs is more up-to-date
        // > by comparing the index and term of the last entries in the
        // > logs. If the logs have last entries with different terms, then
        // > the log with the later term is more up-to-date. If the logs
        // > end with the same term, then whichever log is longer is
        // > more up-to-date.
        match (self.wal.latest_entry(), candidate_last_entry) {
            (None, _) => true,
            (Some(_), None) => false,
            (
                Some((my_last_entry_term, my_last_entry_index)),
                Some((candidate_last_entry_term, candidate_last_entry_index)),
            ) => {
                if candidate_last_entry_term != my_last_entry_term {
                    return candidate_last_entry_term > my_last_entry_term;
                }

                candidate_last_entry_index >= my_last_entry_index
            }
        }
    }

    pub(crate) fn handle_follower_timeout(&mut self, tick: FollowerTimeoutTick) {
        if !self.election_state.is_current_timer(tick.generation) {
            slog::debug!(self.logger, "Dropping stale election timeout {:?}", tick);
            return;
        }

        if !self.cluster_tracker.am_i_member() {
            // Not a voter in our applied configuration: either not added yet, or removed.
            slog::debug!(self.logger, "Election timeout, but not a voting member. Staying follower.");
            return;
        }

        // Write-ahead log style: Vote for self on local state before transitioning to candidate.
        let new_term = match self.local_state.increment_term_and_vote_for_self() {
            Ok(term) => term,
            Err(e) => {
                slog::error!(self.logger, "Failed to persist new term before campaigning: {:?}", e);
                return;
            }
        };
        self.election_state.transition_to_candidate_and_vote_for_self(new_term);
        slog::info!(
            self.logger,
            "Timed out as follower. Changed to candidate. Election state: {:?}",
            self.election_state,
        );

        if self.cluster_tracker.majority() <= 1 {
            self.become_leader(new_term);
            return;
        }

        for peer_id in self.cluster_tracker.voting_peer_ids() {
            self.spawn_request_vote(peer_id, new_term, None);
        }
    }

    pub(crate) fn handle_request_vote_reply_from_peer(&mut self, reply: RequestVoteReplyFromPeer) {
        let current_term = self.local_state.current_term();
        if current_term != reply.term {
            slog::info!(
                self.logger,
                "Received vote for outdated term {:?}, current term: {:?}.",
                reply.term,
                current_term,
            );
            return;
        }

        match reply.result {
            RequestVoteResult::VoteGranted => {
                if !self.cluster_tracker.contains_member(&reply.peer_id) {
                    slog::warn!(self.logger, "Ignoring vote from non-member {:?}", reply.peer_id);
                    return;
                }

                let num_votes_received = match self.election_state.add_vote_if_candidate(reply.peer_id) {
                    Some(v) => v,
                    None => {
                        slog::debug!(
                            self.logger,
                            "Received vote for term {:?} after transitioning to election state: {:?}",
                            reply.term,
                            self.election_state,
                        );
                        return;
                    }
                };

                slog::info!(
                    self.logger,
                    "Received {}/{} votes for term {:?}",
                    num_votes_received,
                    self.cluster_tracker.num_voting_replicas(),
                    reply.term,
                );

                if num_votes_received >= self.cluster_tracker.majority() {
                    self.become_leader(reply.term);
                }
            }
            RequestVoteResult::VoteNotGranted => {
                slog::info!(
                    self.logger,
                    "Vote not granted from {:?} for term {:?}",
                    reply.peer_id,
                    reply.term,
                );
            }
            RequestVoteResult::StaleTerm { new_term } => {
                if let Err(e) = self.observe_term(new_term, None) {
                    slog::error!(self.logger, "Failed to persist term {:?}: {:?}", new_term, e);
                }
            }
            RequestVoteResult::RetryableFailure => {
                if self.election_state.role() == Role::Candidate {
                    let delay = self.settings.request_vote_retry_delay;
                    self.spawn_request_vote(reply.peer_id, reply.term, Some(delay));
                }
            }
        }
    }

    fn become_leader(&mut self, term: Term) {
        // The last unapplied membership entry is the change in flight. Followers track it as they
        // append, but a restarted or freshly elected node rebuilds it from the log.
        self.refresh_pending_membership();

        let my_info = self.leader_info(&self.my_replica_id);
        let replication_targets = self
            .cluster_tracker
            .replication_targets()
            .iter()
            .map(|md| md.replica_id().clone())
            .collect();
        self.election_state.transition_to_leader(
            term,
            my_info,
            replication_targets,
            self.wal.last_index(),
        );
        slog::info!(self.logger, "Elected leader. Election state: {:?}", self.election_state);

        // A no-op from our own term lets us commit whatever earlier leaders left uncommitted.
        if let Err(e) = self.wal.append(WriteAheadLogEntry::no_op(term)) {
            slog::error!(self.logger, "Failed to append no-op as new leader: {:?}", e);
        }

        self.replicate_to_idle_peers();
        self.try_advance_commit_index();
    }

    fn spawn_request_vote(&mut self, peer_id: ReplicaId, term: Term, delay: Option<Duration>) {
        let client = match self.peer_client(&peer_id) {
            Some(client) => client,
            None => {
                slog::error!(self.logger, "Peer {:?} not found while sending RequestVote. Wtf!", peer_id);
                return;
            }
        };

        let input = RequestVoteInput {
            candidate_term: term,
            candidate_id: self.my_replica_id.clone(),
            candidate_last_log_entry: self.wal.latest_entry(),
        };
        let call = PeerCall {
            logger: self.logger.new(slog::o!("Peer" => peer_id.to_string())),
            client,
            callback: self.actor_client.clone(),
            rpc_timeout: self.settings.append_entries_timeout,
            cancel: self.peer_tasks.clone(),
        };

        tokio::task::spawn(peer_calls::call_peer_request_vote(call, peer_id, input, delay));
    }
}
