mod election;
mod local_state;
mod membership;
mod peers;
mod replica;
mod replica_api;
mod replica_wiring;
mod snapshot;
mod state_machine;
mod write_ahead_log;

pub(crate) use election::RoleStateChangeListener;
pub use election::{Role, RoleStateSnapshot};
pub use local_state::FileLocalState;
pub use local_state::PersistentLocalState;
pub use local_state::Term;
pub use local_state::VolatileLocalState;
pub use peers::ReplicaId;
pub use peers::ReplicaInfoBlob;
pub use peers::ReplicaMetadata;
pub use peers::MAX_REPLICA_ID_LEN;
pub(crate) use replica::Replica;
pub(crate) use replica_api::{
    ChangeMembershipError, ChangeMembershipOutput, EnqueueForReplicationError, EnqueueForReplicationInput,
    EnqueueForReplicationOutput, FollowerTimeoutTick, LeaderTimerTick, ReplicaStatus, ReplicationPayload,
    ReplicationReplyFromPeer, ReplicationReplyFromPeerDescriptor, ReplicationReplyFromPeerError,
    RequestVoteReplyFromPeer, RequestVoteResult,
};
pub use replica_api::{
    AppendEntriesError, AppendEntriesInput, AppendEntriesOutput, EntryAbandoned, InstallSnapshotError,
    InstallSnapshotInput, InstallSnapshotOutput, LeaderRedirectInfo, MembershipChange, RequestVoteError,
    RequestVoteInput, RequestVoteOutput, TermOutOfDateInfo,
};
pub(crate) use replica_wiring::{create_replica, ReplicaConfig};
pub use snapshot::Snapshot;
pub(crate) use snapshot::SnapshotPolicy;
pub use state_machine::NoOpStateMachine;
pub use state_machine::StateMachine;
pub use state_machine::StateMachineError;
pub use state_machine::StateMachineOutput;
pub(crate) use write_ahead_log::EntryOutcome;
pub use write_ahead_log::EntryKind;
pub use write_ahead_log::WriteAheadLogEntry;
