use crate::actor::WeakActorClient;
use crate::commitlog::Index;
use crate::replica::election::state_change_listener::RoleStateChangeNotifier;
use crate::replica::election::timers::{ElectionTimerHandle, HeartbeatTimerHandle};
use crate::replica::election::{state_change_listener, LeaderStateTracker, PeerState, Role};
use crate::replica::{LeaderRedirectInfo, ReplicaId, RoleStateChangeListener, RoleStateSnapshot, Term};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

#[derive(Clone)]
pub(crate) struct ElectionConfig {
    pub my_replica_id: ReplicaId,
    pub leader_heartbeat_duration: Duration,
    pub follower_min_timeout: Duration,
    pub follower_max_timeout: Duration,
}

/// ElectionState is responsible for holding state specific to the stage in an election. Its
/// methods are responsible for "what" to do. It is NOT responsible for validating anything
/// specific to logs, terms, peers, etc. or knowing "when" to do something.
///
/// Each role owns its timers, so replacing the role stops the old ones.
pub(crate) struct ElectionState {
    state: State,
    // Mirrors the persisted term, only so that published snapshots carry it.
    term: Term,
    config: ElectionConfig,
    actor_client: WeakActorClient,
    // Bumped every time an election timer is armed.
    timer_generation: u64,
    state_change_notifier: RoleStateChangeNotifier,
}

pub(crate) enum CurrentLeader {
    Me,
    Other(LeaderRedirectInfo),
    Unknown,
}

impl ElectionState {
    /// `new_follower()` creates a new ElectionState instance that starts out as a follower.
    pub(crate) fn new_follower(
        config: ElectionConfig,
        actor_client: WeakActorClient,
        term: Term,
    ) -> (Self, RoleStateChangeListener) {
        let timer_generation = 1;
        let initial_state = State::Follower(FollowerState::new(
            None,
            &config,
            actor_client.clone(),
            timer_generation,
        ));
        let (notifier, listener) = state_change_listener::new(Self::current_state_impl(&initial_state, term));

        let election_state = Self {
            state: initial_state,
            term,
            config,
            actor_client,
            timer_generation,
            state_change_notifier: notifier,
        };

        (election_state, listener)
    }

    pub(crate) fn transition_to_follower(&mut self, term: Term, new_leader: Option<LeaderRedirectInfo>) {
        let generation = self.next_timer_generation();
        self.term = term;
        self.state = State::Follower(FollowerState::new(
            new_leader,
            &self.config,
            self.actor_client.clone(),
            generation,
        ));
        self.notify_new_state();
    }

    pub(crate) fn transition_to_candidate_and_vote_for_self(&mut self, term: Term) {
        let generation = self.next_timer_generation();
        let mut cs = CandidateState::new(&self.config, self.actor_client.clone(), generation);

        // Vote for self
        cs.add_received_vote(self.config.my_replica_id.clone());

        self.term = term;
        self.state = State::Candidate(cs);
        self.notify_new_state();
    }

    pub(crate) fn transition_to_leader(
        &mut self,
        term: Term,
        my_info: Option<LeaderRedirectInfo>,
        peer_ids: Vec<ReplicaId>,
        previous_log_entry_index: Option<Index>,
    ) {
        self.term = term;
        self.state = State::Leader(LeaderState::new(
            my_info,
            peer_ids,
            previous_log_entry_index,
            self.config.leader_heartbeat_duration,
            self.actor_client.clone(),
            term,
        ));
        self.notify_new_state();
    }

    fn next_timer_generation(&mut self) -> u64 {
        self.timer_generation += 1;
        self.timer_generation
    }

    /// True if `generation` belongs to the election timer of the role we're in right now.
    pub(crate) fn is_current_timer(&self, generation: u64) -> bool {
        match &self.state {
            State::Leader(_) => false,
            State::Candidate(_) | State::Follower(_) => generation == self.timer_generation,
        }
    }

    #[cfg(test)]
    pub(crate) fn timer_generation(&self) -> u64 {
        self.timer_generation
    }

    pub(crate) fn current_state(&self) -> RoleStateSnapshot {
        Self::current_state_impl(&self.state, self.term)
    }

    fn current_state_impl(state: &State, term: Term) -> RoleStateSnapshot {
        let (role, leader) = match state {
            State::Leader(ls) => (Role::Leader, ls.my_info.clone()),
            State::Candidate(_) => (Role::Candidate, None),
            State::Follower(fs) => (Role::Follower, fs.leader.clone()),
        };

        RoleStateSnapshot { role, term, leader }
    }

    fn notify_new_state(&self) {
        self.state_change_notifier
            .notify_new_state(Self::current_state_impl(&self.state, self.term));
    }

    pub(crate) fn role(&self) -> Role {
        match &self.state {
            State::Leader(_) => Role::Leader,
            State::Candidate(_) => Role::Candidate,
            State::Follower(_) => Role::Follower,
        }
    }

    pub(crate) fn current_leader(&self) -> CurrentLeader {
        match &self.state {
            State::Leader(_) => CurrentLeader::Me,
            State::Follower(FollowerState {
                leader: Some(leader_info),
                ..
            }) => CurrentLeader::Other(leader_info.clone()),
            State::Follower(_) | State::Candidate(_) => CurrentLeader::Unknown,
        }
    }

    pub(crate) fn reset_timeout_if_follower(&self) {
        if let State::Follower(fs) = &self.state {
            fs.reset_timeout();
        }
    }

    // TODO:3 learn about Cow and consider using Cow<LeaderRedirectInfo>
    pub(crate) fn set_leader_if_unknown(&mut self, leader: &LeaderRedirectInfo) {
        if let State::Follower(fs) = &mut self.state {
            if fs.leader.is_none() {
                fs.leader.replace(leader.clone());
                self.notify_new_state();
            }
        }
    }

    /// Return number of votes received if candidate, or None if no longer Candidate.
    pub(crate) fn add_vote_if_candidate(&mut self, vote_from: ReplicaId) -> Option<usize> {
        if let State::Candidate(cs) = &mut self.state {
            Some(cs.add_received_vote(vote_from))
        } else {
            None
        }
    }

    pub(crate) fn leader_state_mut(&mut self) -> Option<&mut LeaderStateTracker> {
        if let State::Leader(ls) = &mut self.state {
            Some(&mut ls.tracker)
        } else {
            None
        }
    }

    pub(crate) fn leader_state(&self) -> Option<&LeaderStateTracker> {
        if let State::Leader(ls) = &self.state {
            Some(&ls.tracker)
        } else {
            None
        }
    }

    /// Start replicating to a new target. No-op unless we're leader and don't already track it.
    pub(crate) fn leader_add_peer(&mut self, peer_id: ReplicaId, previous_log_entry_index: Option<Index>) -> bool {
        let heartbeat_duration = self.config.leader_heartbeat_duration;
        let actor_client = self.actor_client.clone();
        let term = self.term;

        match self.leader_state_mut() {
            Some(tracker) if !tracker.contains_peer(&peer_id) => {
                let timer =
                    HeartbeatTimerHandle::spawn_timer_task(heartbeat_duration, actor_client, peer_id.clone(), term);
                tracker.insert_peer(peer_id, PeerState::new(timer, previous_log_entry_index));
                true
            }
            _ => false,
        }
    }
}

impl fmt::Debug for ElectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            State::Leader(_) => write!(f, "Leader(Term={:?})", self.term),
            State::Candidate(cs) => write!(
                f,
                "Candidate(Term={:?}, Votes={})",
                self.term,
                cs.received_votes_from.len()
            ),
            State::Follower(FollowerState {
                leader: Some(leader_info),
                ..
            }) => write!(f, "Follower(Term={:?}, Leader={:?})", self.term, leader_info.replica_id),
            State::Follower(FollowerState { leader: None, .. }) => {
                write!(f, "Follower(Term={:?}, Leader=None)", self.term)
            }
        }
    }
}

enum State {
    Leader(LeaderState),
    Candidate(CandidateState),
    Follower(FollowerState),
}

struct LeaderState {
    my_info: Option<LeaderRedirectInfo>,
    tracker: LeaderStateTracker,
}

struct CandidateState {
    received_votes_from: HashSet<ReplicaId>,
    _election_timer: ElectionTimerHandle,
}

struct FollowerState {
    leader: Option<LeaderRedirectInfo>,
    election_timer: ElectionTimerHandle,
}

impl LeaderState {
    fn new(
        my_info: Option<LeaderRedirectInfo>,
        peer_ids: Vec<ReplicaId>,
        previous_log_entry_index: Option<Index>,
        heartbeat_duration: Duration,
        actor_client: WeakActorClient,
        term: Term,
    ) -> Self {
        let mut peer_state = HashMap::with_capacity(peer_ids.len());
        for peer_id in peer_ids {
            // The timer task fires immediately, which is the initial broadcast.
            let timer =
                HeartbeatTimerHandle::spawn_timer_task(heartbeat_duration, actor_client.clone(), peer_id.clone(), term);
            peer_state.insert(peer_id, PeerState::new(timer, previous_log_entry_index));
        }

        Self {
            my_info,
            tracker: LeaderStateTracker::new(peer_state),
        }
    }
}

impl CandidateState {
    fn new(config: &ElectionConfig, actor_client: WeakActorClient, generation: u64) -> Self {
        Self {
            received_votes_from: HashSet::with_capacity(3),
            _election_timer: ElectionTimerHandle::spawn_timer_task(
                config.follower_min_timeout,
                config.follower_max_timeout,
                actor_client,
                generation,
            ),
        }
    }

    /// `add_received_vote()` returns the number of unique votes we've received after adding the
    /// provided `vote_from`
    fn add_received_vote(&mut self, vote_from: ReplicaId) -> usize {
        self.received_votes_from.insert(vote_from);
        self.received_votes_from.len()
    }
}

impl FollowerState {
    fn new(
        leader: Option<LeaderRedirectInfo>,
        config: &ElectionConfig,
        actor_client: WeakActorClient,
        generation: u64,
    ) -> Self {
        Self {
            leader,
            election_timer: ElectionTimerHandle::spawn_timer_task(
                config.follower_min_timeout,
                config.follower_max_timeout,
                actor_client,
                generation,
            ),
        }
    }

    fn reset_timeout(&self) {
        self.election_timer.reset_timeout();
    }
}
