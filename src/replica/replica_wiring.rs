use crate::actor::WeakActorClient;
use crate::commitlog::Log;
use crate::replica::election::{ElectionConfig, ElectionState};
use crate::replica::membership::{ClusterTracker, ConfigFile};
use crate::replica::replica::{Replica, ReplicationSettings};
use crate::replica::snapshot::{SnapshotManager, SnapshotPolicy};
use crate::replica::write_ahead_log::WriteAheadLog;
use crate::replica::{PersistentLocalState, ReplicaId, ReplicaMetadata, RoleStateChangeListener, WriteAheadLogEntry};
use crate::transport::PeerConnector;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub(crate) struct ReplicaConfig<L> {
    pub(crate) logger: slog::Logger,
    pub(crate) my_replica_id: ReplicaId,
    // A node joining an existing cluster lists the current members, not itself.
    pub(crate) initial_members: Vec<ReplicaMetadata>,
    pub(crate) local_state: Box<dyn PersistentLocalState>,
    pub(crate) commit_log: L,
    // Where the latest snapshot and the applied configuration are kept. None keeps them in memory.
    pub(crate) snapshot_path: Option<PathBuf>,
    pub(crate) config_path: Option<PathBuf>,
    pub(crate) peer_connector: Arc<dyn PeerConnector>,
    pub(crate) actor_client: WeakActorClient,
    pub(crate) leader_heartbeat_duration: Duration,
    pub(crate) follower_min_timeout: Duration,
    pub(crate) follower_max_timeout: Duration,
    pub(crate) append_entries_timeout: Duration,
    pub(crate) max_entries_per_append: usize,
    pub(crate) snapshot_policy: SnapshotPolicy,
    pub(crate) peer_tasks: CancellationToken,
}

/// Load whatever the replica persisted and wire it up as a follower.
pub(crate) fn create_replica<L>(config: ReplicaConfig<L>) -> Result<(Replica<L>, RoleStateChangeListener), io::Error>
where
    L: Log<WriteAheadLogEntry>,
{
    let ReplicaConfig {
        logger,
        my_replica_id,
        initial_members,
        local_state,
        commit_log,
        snapshot_path,
        config_path,
        peer_connector,
        actor_client,
        leader_heartbeat_duration,
        follower_min_timeout,
        follower_max_timeout,
        append_entries_timeout,
        max_entries_per_append,
        snapshot_policy,
        peer_tasks,
    } = config;

    let snapshot_manager = match snapshot_path {
        Some(path) => SnapshotManager::open(snapshot_policy, path)?,
        None => SnapshotManager::new(snapshot_policy),
    };
    let snapshot = snapshot_manager.latest();
    let wal = WriteAheadLog::new(
        logger.new(slog::o!("Component" => "WAL")),
        commit_log,
        snapshot.map(|s| (s.last_included_term, s.last_included_index)),
    )?;
    let cluster_tracker = ClusterTracker::open(
        my_replica_id.clone(),
        initial_members,
        snapshot,
        config_path.map(ConfigFile::new),
    )?;

    // A restarted replica resumes from its persisted term.
    let current_term = local_state.current_term();
    let (election_state, role_state_change_listener) = ElectionState::new_follower(
        ElectionConfig {
            my_replica_id: my_replica_id.clone(),
            leader_heartbeat_duration,
            follower_min_timeout,
            follower_max_timeout,
        },
        actor_client.clone(),
        current_term,
    );

    let settings = ReplicationSettings {
        append_entries_timeout,
        max_entries_per_append,
        request_vote_retry_delay: leader_heartbeat_duration,
    };

    let replica = Replica::new(
        logger,
        cluster_tracker,
        local_state,
        election_state,
        wal,
        snapshot_manager,
        peer_connector,
        actor_client,
        settings,
        peer_tasks,
    );

    Ok((replica, role_state_change_listener))
}
