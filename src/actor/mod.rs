use crate::commitlog;
use crate::replica;
use std::error::Error;
use std::fmt;
use std::fmt::Debug;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

pub(crate) fn create<L>(
    receiver: mpsc::Receiver<Event>,
    replica: replica::Replica<L>,
    shutdown: CancellationToken,
) -> ReplicaActor<L>
where
    L: commitlog::Log<replica::WriteAheadLogEntry> + Send + 'static,
{
    ReplicaActor {
        receiver,
        replica,
        shutdown,
    }
}

// v1 Design choice: Disk interaction will be synchronous. Future improvement: There should be a
//                   Disk Actor.
#[derive(Debug)]
pub(crate) enum Event {
    // Leader: Append to log, eagerly replicate. Callback carries a receiver for the applied result.
    // Candidate/Follower: Redirect.
    EnqueueForReplication(
        replica::EnqueueForReplicationInput,
        Callback<replica::EnqueueForReplicationOutput, replica::EnqueueForReplicationError>,
    ),

    // Leader: Validate and append a membership entry.
    // Candidate/Follower: Redirect.
    ChangeMembership(
        replica::MembershipChange,
        Callback<replica::ChangeMembershipOutput, replica::ChangeMembershipError>,
    ),

    // Any: Install the application state machine and resume applying committed entries. Fails if
    // it rejects the snapshot it has to start from.
    RegisterStateMachine(StateMachineRegistration, Callback<(), replica::StateMachineError>),

    // Any: Snapshot of role, log watermarks and membership.
    Status(oneshot::Sender<replica::ReplicaStatus>),

    // Leader: Grant vote if applicable (includes write to disk). Transition to follower.
    // Candidate: Grant vote if applicable (includes write to disk). Transition to follower.
    // Follower: Grant vote if applicable (includes write to disk).
    RequestVote(
        replica::RequestVoteInput,
        Callback<replica::RequestVoteOutput, replica::RequestVoteError>,
    ),

    // Leader: Transition to follower if applicable. Clean up log. Respond to request.
    // Candidate: Transition to follower if applicable. Clean up log. Respond to request.
    // Follower: Write to disk then respond. Reset timeout.
    AppendEntries(
        replica::AppendEntriesInput,
        Callback<replica::AppendEntriesOutput, replica::AppendEntriesError>,
    ),

    // Any: Same term rules as AppendEntries, then replace state machine and log prefix.
    InstallSnapshot(
        replica::InstallSnapshotInput,
        Callback<replica::InstallSnapshotOutput, replica::InstallSnapshotError>,
    ),

    // Leader: discard
    // Candidate: Update local state. Transition to leader if quorum vote.
    // Follower: discard
    RequestVoteReplyFromPeer(replica::RequestVoteReplyFromPeer),

    // Leader: Update peer progress, advance commit index, apply.
    // Candidate/Follower: discard
    ReplicationReplyFromPeer(replica::ReplicationReplyFromPeer),

    // Leader: Send AppendEntries (or InstallSnapshot) to the peer in the tick.
    // Candidate/Follower: discard
    LeaderTimer(replica::LeaderTimerTick),

    // Leader: discard
    // Candidate/Follower: Start a new election, if the tick's generation is still current.
    FollowerTimeout(replica::FollowerTimeoutTick),
}

pub(crate) struct Callback<O: Debug, E: Error>(oneshot::Sender<Result<O, E>>);

impl<O: Debug, E: Error> Callback<O, E> {
    pub(crate) fn send(self, message: Result<O, E>) {
        let _ = self.0.send(message);
    }
}

impl<O: Debug, E: Error> Debug for Callback<O, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Callback")
    }
}

pub(crate) struct StateMachineRegistration(pub(crate) Box<dyn replica::StateMachine>);

impl Debug for StateMachineRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StateMachineRegistration")
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Replica actor exited")]
pub(crate) struct ActorExited;

#[derive(Clone)]
pub(crate) struct ActorClient {
    sender: mpsc::Sender<Event>,
}

impl ActorClient {
    pub(crate) fn new(buffer_size: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(buffer_size);
        (ActorClient { sender: tx }, rx)
    }

    /// Timers and peer tasks hold a weak client, so they never keep a dead replica's queue open.
    pub(crate) fn weak(&self) -> WeakActorClient {
        WeakActorClient {
            sender: self.sender.downgrade(),
        }
    }

    pub(crate) async fn enqueue_for_replication(
        &self,
        input: replica::EnqueueForReplicationInput,
    ) -> Result<replica::EnqueueForReplicationOutput, replica::EnqueueForReplicationError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::EnqueueForReplication(input, Callback(tx)))
            .await
            .map_err(|_| replica::EnqueueForReplicationError::ActorExited)?;

        rx.await
            .unwrap_or(Err(replica::EnqueueForReplicationError::ActorExited))
    }

    pub(crate) async fn change_membership(
        &self,
        change: replica::MembershipChange,
    ) -> Result<replica::ChangeMembershipOutput, replica::ChangeMembershipError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::ChangeMembership(change, Callback(tx)))
            .await
            .map_err(|_| replica::ChangeMembershipError::ActorExited)?;

        rx.await.unwrap_or(Err(replica::ChangeMembershipError::ActorExited))
    }

    pub(crate) async fn register_state_machine(
        &self,
        state_machine: Box<dyn replica::StateMachine>,
    ) -> Result<Result<(), replica::StateMachineError>, ActorExited> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::RegisterStateMachine(StateMachineRegistration(state_machine), Callback(tx)))
            .await?;

        rx.await.map_err(|_| ActorExited)
    }

    pub(crate) async fn status(&self) -> Result<replica::ReplicaStatus, ActorExited> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::Status(tx)).await?;

        rx.await.map_err(|_| ActorExited)
    }

    pub(crate) async fn request_vote(
        &self,
        input: replica::RequestVoteInput,
    ) -> Result<replica::RequestVoteOutput, replica::RequestVoteError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::RequestVote(input, Callback(tx)))
            .await
            .map_err(|_| replica::RequestVoteError::ActorExited)?;

        rx.await.unwrap_or(Err(replica::RequestVoteError::ActorExited))
    }

    pub(crate) async fn append_entries(
        &self,
        input: replica::AppendEntriesInput,
    ) -> Result<replica::AppendEntriesOutput, replica::AppendEntriesError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::AppendEntries(input, Callback(tx)))
            .await
            .map_err(|_| replica::AppendEntriesError::ActorExited)?;

        rx.await.unwrap_or(Err(replica::AppendEntriesError::ActorExited))
    }

    pub(crate) async fn install_snapshot(
        &self,
        input: replica::InstallSnapshotInput,
    ) -> Result<replica::InstallSnapshotOutput, replica::InstallSnapshotError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::InstallSnapshot(input, Callback(tx)))
            .await
            .map_err(|_| replica::InstallSnapshotError::ActorExited)?;

        rx.await.unwrap_or(Err(replica::InstallSnapshotError::ActorExited))
    }

    async fn send(&self, event: Event) -> Result<(), ActorExited> {
        self.sender.send(event).await.map_err(|_| ActorExited)
    }
}

/// WeakActorClient is what timers and spawned peer calls hold. Every send first checks that the
/// actor's queue is still alive.
#[derive(Clone)]
pub(crate) struct WeakActorClient {
    sender: mpsc::WeakSender<Event>,
}

impl WeakActorClient {
    pub(crate) async fn leader_timer(&self, tick: replica::LeaderTimerTick) -> Result<(), ActorExited> {
        self.send(Event::LeaderTimer(tick)).await
    }

    pub(crate) async fn follower_timeout(&self, tick: replica::FollowerTimeoutTick) -> Result<(), ActorExited> {
        self.send(Event::FollowerTimeout(tick)).await
    }

    pub(crate) async fn notify_request_vote_reply_from_peer(
        &self,
        reply: replica::RequestVoteReplyFromPeer,
    ) -> Result<(), ActorExited> {
        self.send(Event::RequestVoteReplyFromPeer(reply)).await
    }

    pub(crate) async fn notify_replication_reply_from_peer(
        &self,
        reply: replica::ReplicationReplyFromPeer,
    ) -> Result<(), ActorExited> {
        self.send(Event::ReplicationReplyFromPeer(reply)).await
    }

    async fn send(&self, event: Event) -> Result<(), ActorExited> {
        match self.sender.upgrade() {
            Some(sender) => sender.send(event).await.map_err(|_| ActorExited),
            None => Err(ActorExited),
        }
    }
}

/// ReplicaActor is replica logic in actor model.
pub(crate) struct ReplicaActor<L>
where
    L: commitlog::Log<replica::WriteAheadLogEntry>,
{
    receiver: mpsc::Receiver<Event>,
    replica: replica::Replica<L>,
    shutdown: CancellationToken,
}

impl<L> ReplicaActor<L>
where
    L: commitlog::Log<replica::WriteAheadLogEntry> + Send + 'static,
{
    pub(crate) async fn run_event_loop(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                opt_event = self.receiver.recv() => match opt_event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
            }
        }

        self.receiver.close();
        self.replica.shutdown();
    }

    /// Registration before the event loop runs. Nothing else can reach the replica yet.
    pub(crate) fn register_state_machine(
        &mut self,
        state_machine: Box<dyn replica::StateMachine>,
    ) -> Result<(), replica::StateMachineError> {
        self.replica.register_state_machine(state_machine)
    }

    // This must NOT be async. Any long running work must be spawned on another task
    // and/or come as a callback to this actor.
    fn handle_event(&mut self, event: Event) {
        match event {
            Event::EnqueueForReplication(input, callback) => {
                let result = self.replica.handle_enqueue_for_replication(input);
                callback.send(result);
            }
            Event::ChangeMembership(change, callback) => {
                let result = self.replica.handle_change_membership(change);
                callback.send(result);
            }
            Event::RegisterStateMachine(StateMachineRegistration(state_machine), callback) => {
                let result = self.replica.register_state_machine(state_machine);
                callback.send(result);
            }
            Event::Status(callback) => {
                let _ = callback.send(self.replica.status());
            }
            Event::RequestVote(input, callback) => {
                let result = self.replica.server_handle_request_vote(input);
                callback.send(result);
            }
            Event::AppendEntries(input, callback) => {
                let result = self.replica.server_handle_append_entries(input);
                callback.send(result);
            }
            Event::InstallSnapshot(input, callback) => {
                let result = self.replica.server_handle_install_snapshot(input);
                callback.send(result);
            }
            Event::RequestVoteReplyFromPeer(reply) => {
                self.replica.handle_request_vote_reply_from_peer(reply);
            }
            Event::ReplicationReplyFromPeer(reply) => {
                self.replica.handle_replication_reply_from_peer(reply);
            }
            Event::LeaderTimer(tick) => {
                self.replica.handle_leader_timer(tick);
            }
            Event::FollowerTimeout(tick) => {
                self.replica.handle_follower_timeout(tick);
            }
        }
    }
}
