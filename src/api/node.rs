use crate::actor::{ActorClient, ReplicaActor};
use crate::api::event_bus::RaftEventListener;
use crate::api::rpc_handle::RaftRpcHandle;
use crate::api::types::{NodeStatus, RaftEntryId, RaftLeaderInfo, RaftMemberInfo};
use crate::commitlog::Log;
use crate::replica;
use crate::replica::{EntryAbandoned, RoleStateChangeListener, RoleStateSnapshot, StateMachine, StateMachineOutput};
use bytes::Bytes;
use std::io;
use std::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub(super) type NodeLog = Box<dyn Log<replica::WriteAheadLogEntry> + Send>;
pub(super) type NodeActor = ReplicaActor<NodeLog>;

/// RaftNode is one member of a Raft cluster. It owns the replica's event loop; everything else
/// (RPC handles, event listeners) just holds a way to talk to it. All methods take `&self`, so a
/// node can be shared behind an `Arc`.
pub struct RaftNode {
    logger: slog::Logger,
    actor_client: ActorClient,
    // Taken on `start()`.
    actor: Mutex<Option<NodeActor>>,
    actor_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
    role_state_change_listener: RoleStateChangeListener,
}

impl RaftNode {
    pub(super) fn new(
        logger: slog::Logger,
        actor_client: ActorClient,
        actor: NodeActor,
        shutdown: CancellationToken,
        role_state_change_listener: RoleStateChangeListener,
    ) -> Self {
        RaftNode {
            logger,
            actor_client,
            actor: Mutex::new(Some(actor)),
            actor_task: Mutex::new(None),
            shutdown,
            role_state_change_listener,
        }
    }

    /// Spawn the replica's event loop. Calling it again is a no-op.
    pub fn start(&self) {
        if let Some(actor) = self.actor.lock().expect("RaftNode mutex poisoned").take() {
            slog::info!(self.logger, "Starting replica event loop");
            let task = tokio::spawn(actor.run_event_loop());
            *self.actor_task.lock().expect("RaftNode mutex poisoned") = Some(task);
        }
    }

    /// Stop the event loop and wait for it to exit. Callers still waiting on an entry get
    /// `AppendLogError::Abandoned(EntryAbandoned::Shutdown)`.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self.actor_task.lock().expect("RaftNode mutex poisoned").take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                slog::error!(self.logger, "Replica event loop did not exit cleanly: {:?}", e);
            }
        }
        // Never started. Dropping the actor drops the replica and its timers.
        self.actor.lock().expect("RaftNode mutex poisoned").take();
        slog::info!(self.logger, "Shut down");
    }

    /// Append `data` to the replicated log and wait until it is applied to this (leader) node's
    /// state machine. Returns whatever the state machine produced for it.
    pub async fn append_log(&self, data: Bytes) -> Result<AppendLogOutput, AppendLogError> {
        let enqueued = self
            .actor_client
            .enqueue_for_replication(replica::EnqueueForReplicationInput { data })
            .await?;

        let entry_id = RaftEntryId {
            term: enqueued.enqueued_term,
            entry_index: enqueued.enqueued_index,
        };

        match enqueued.applied.await {
            Ok(Ok(output)) => Ok(AppendLogOutput { entry_id, output }),
            Ok(Err(abandoned)) => Err(AppendLogError::Abandoned(abandoned)),
            Err(_) => Err(AppendLogError::ReplicaExited),
        }
    }

    /// Add a member. Returns once the configuration change has been applied on this node.
    pub async fn add_server(&self, member: RaftMemberInfo) -> Result<(), MembershipChangeError> {
        self.change_membership(replica::MembershipChange::Add(member.into()))
            .await
    }

    /// Remove a member. Returns once the configuration change has been applied on this node. A
    /// leader removing itself steps down after that.
    pub async fn remove_server(&self, replica_id: &str) -> Result<(), MembershipChangeError> {
        self.change_membership(replica::MembershipChange::Remove(replica::ReplicaId::new(replica_id)))
            .await
    }

    async fn change_membership(&self, change: replica::MembershipChange) -> Result<(), MembershipChangeError> {
        slog::info!(self.logger, "Requesting membership change {:?}", change);
        let enqueued = self.actor_client.change_membership(change).await?;

        match enqueued.applied.await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(abandoned)) => Err(MembershipChangeError::Abandoned(abandoned)),
            Err(_) => Err(MembershipChangeError::ReplicaExited),
        }
    }

    pub fn role_state(&self) -> RoleStateSnapshot {
        self.role_state_change_listener.current()
    }

    /// Hand the node its state machine. Committed entries are only applied from then on. If the
    /// node holds a snapshot the state machine hasn't seen, it's loaded first; a state machine that
    /// rejects it is not installed.
    pub async fn register_state_machine(
        &self,
        state_machine: Box<dyn StateMachine>,
    ) -> Result<(), RegisterStateMachineError> {
        {
            let mut actor = self.actor.lock().expect("RaftNode mutex poisoned");
            if let Some(actor) = actor.as_mut() {
                return actor
                    .register_state_machine(state_machine)
                    .map_err(RegisterStateMachineError::SnapshotRejected);
            }
        }

        match self.actor_client.register_state_machine(state_machine).await {
            Ok(result) => result.map_err(RegisterStateMachineError::SnapshotRejected),
            Err(_) => Err(RegisterStateMachineError::ReplicaExited),
        }
    }

    pub async fn status(&self) -> Result<NodeStatus, ReplicaExited> {
        self.actor_client
            .status()
            .await
            .map(NodeStatus::from)
            .map_err(|_| ReplicaExited)
    }

    pub fn event_listener(&self) -> RaftEventListener {
        RaftEventListener::new(self.role_state_change_listener.clone())
    }

    /// The handle inbound transports deliver peer RPCs to.
    pub fn rpc_handle(&self) -> RaftRpcHandle {
        RaftRpcHandle::new(self.actor_client.clone())
    }
}

#[derive(Debug)]
pub struct AppendLogOutput {
    pub entry_id: RaftEntryId,
    pub output: StateMachineOutput,
}

#[derive(Debug, thiserror::Error)]
pub enum AppendLogError {
    #[error("I'm not leader")]
    LeaderRedirect(RaftLeaderInfo),

    // Can be retried with exponential backoff with recommended initial delay of 200ms. Likely an
    // election is in progress.
    #[error("Cluster is in a tough shape. No one is leader.")]
    NoLeader,

    #[error("Entry was appended but will not be applied: {0}")]
    Abandoned(EntryAbandoned),

    #[error("Failed to persist log")]
    LocalIoError(#[source] io::Error),

    // Replica logic runs on a background task. This error is returned if the task has exited.
    #[error("Replica task has exited")]
    ReplicaExited,
}

#[derive(Debug, thiserror::Error)]
pub enum MembershipChangeError {
    #[error("I'm not leader")]
    LeaderRedirect(RaftLeaderInfo),
    #[error("Cluster is in a tough shape. No one is leader.")]
    NoLeader,
    #[error("Another membership change is still in progress")]
    ConcurrentMembershipChange,
    #[error("{0} is already a member")]
    AlreadyMember(String),
    #[error("{0} is not a member")]
    NotMember(String),
    #[error("Replica id is {0} bytes, longer than the {} byte limit", replica::MAX_REPLICA_ID_LEN)]
    ReplicaIdTooLong(usize),
    #[error("Change was appended but will not be applied: {0}")]
    Abandoned(EntryAbandoned),
    #[error("Failed to persist log")]
    LocalIoError(#[source] io::Error),
    #[error("Replica task has exited")]
    ReplicaExited,
}

#[derive(Debug, thiserror::Error)]
pub enum RegisterStateMachineError {
    #[error("State machine rejected the snapshot it must start from")]
    SnapshotRejected(#[source] replica::StateMachineError),
    #[error("Replica task has exited")]
    ReplicaExited,
}

#[derive(Debug, thiserror::Error)]
#[error("Replica task has exited")]
pub struct ReplicaExited;

// ------- Conversions --------

impl From<replica::EnqueueForReplicationError> for AppendLogError {
    fn from(internal_error: replica::EnqueueForReplicationError) -> Self {
        match internal_error {
            replica::EnqueueForReplicationError::LeaderRedirect(leader_info) => {
                AppendLogError::LeaderRedirect(RaftLeaderInfo::from(leader_info))
            }
            replica::EnqueueForReplicationError::NoLeader => AppendLogError::NoLeader,
            replica::EnqueueForReplicationError::LocalIoError(e) => AppendLogError::LocalIoError(e),
            replica::EnqueueForReplicationError::ActorExited => AppendLogError::ReplicaExited,
        }
    }
}

impl From<replica::ChangeMembershipError> for MembershipChangeError {
    fn from(internal_error: replica::ChangeMembershipError) -> Self {
        match internal_error {
            replica::ChangeMembershipError::LeaderRedirect(leader_info) => {
                MembershipChangeError::LeaderRedirect(RaftLeaderInfo::from(leader_info))
            }
            replica::ChangeMembershipError::NoLeader => MembershipChangeError::NoLeader,
            replica::ChangeMembershipError::ConcurrentMembershipChange => {
                MembershipChangeError::ConcurrentMembershipChange
            }
            replica::ChangeMembershipError::AlreadyMember(id) => MembershipChangeError::AlreadyMember(id.into_inner()),
            replica::ChangeMembershipError::NotMember(id) => MembershipChangeError::NotMember(id.into_inner()),
            replica::ChangeMembershipError::ReplicaIdTooLong(len) => MembershipChangeError::ReplicaIdTooLong(len),
            replica::ChangeMembershipError::LocalIoError(e) => MembershipChangeError::LocalIoError(e),
            replica::ChangeMembershipError::ActorExited => MembershipChangeError::ReplicaExited,
        }
    }
}
