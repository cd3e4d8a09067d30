use crate::actor;
use crate::actor::ActorClient;
use crate::api::node::{NodeLog, RaftNode};
use crate::api::options::RaftOptionsValidated;
use crate::api::types::RaftMemberInfo;
use crate::api::RaftOptions;
use crate::commitlog::{FileLog, InMemoryLog};
use crate::replica;
use crate::replica::{FileLocalState, PersistentLocalState, ReplicaId, ReplicaMetadata, VolatileLocalState};
use crate::transport::PeerConnector;
use std::collections::HashSet;
use std::convert::TryFrom;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct RaftNodeConfig {
    pub my_replica_id: String,
    /// The cluster as this node should first see it. A node joining an existing cluster lists the
    /// current members (without itself) and waits for a leader to add it.
    pub initial_members: Vec<RaftMemberInfo>,
    pub options: RaftOptions,
    pub logger: slog::Logger,
    pub peer_connector: Arc<dyn PeerConnector>,
    /// Where to persist term and vote. The log, the latest snapshot and the applied membership go
    /// in sibling files with `.log`, `.snapshot` and `.members` appended to the name. `None` keeps
    /// all of it in memory, so a restarted node must be treated as a brand new one.
    pub local_state_path: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum NodeCreationError {
    #[error("Illegal options for configuring node: {0}")]
    IllegalOptions(String),
    #[error("Failed to load persisted term and vote")]
    LocalState(#[source] io::Error),
    #[error("Failed to initialize the log")]
    LogInitialization(#[source] io::Error),
    #[error("Initial members must not be empty")]
    NoMembers,
    #[error("Member {0} is listed more than once")]
    DuplicateMember(String),
    #[error("Replica id is {0} bytes, longer than the {} byte limit", replica::MAX_REPLICA_ID_LEN)]
    ReplicaIdTooLong(usize),
}

/// Build a node. Must be called from within a tokio runtime: the node's election timer starts
/// right away, though nothing happens until `RaftNode::start()`.
pub fn create_raft_node(config: RaftNodeConfig) -> Result<RaftNode, NodeCreationError> {
    let options = RaftOptionsValidated::try_from(config.options)
        .map_err(|e| NodeCreationError::IllegalOptions(e.to_string()))?;
    validate_members(&config.initial_members)?;

    let my_replica_id = ReplicaId::new(config.my_replica_id);
    if !my_replica_id.fits_descriptor() {
        return Err(NodeCreationError::ReplicaIdTooLong(my_replica_id.as_str().len()));
    }
    let logger = config
        .logger
        .new(slog::o!("Replica" => my_replica_id.as_str().to_string()));

    let data_paths = config.local_state_path.as_deref().map(DataPaths::beside);
    let local_state: Box<dyn PersistentLocalState> = match config.local_state_path {
        Some(path) => Box::new(
            FileLocalState::open(path, my_replica_id.clone()).map_err(NodeCreationError::LocalState)?,
        ),
        None => Box::new(VolatileLocalState::new(my_replica_id.clone())),
    };
    let commit_log: NodeLog = match &data_paths {
        Some(paths) => {
            let log = FileLog::<replica::WriteAheadLogEntry>::open(&paths.log);
            Box::new(log.map_err(NodeCreationError::LogInitialization)?)
        }
        None => {
            let log = InMemoryLog::<replica::WriteAheadLogEntry>::create();
            Box::new(log.map_err(NodeCreationError::LogInitialization)?)
        }
    };
    let (snapshot_path, config_path) = match data_paths {
        Some(paths) => (Some(paths.snapshot), Some(paths.members)),
        None => (None, None),
    };

    let (actor_client, actor_queue_rx) = ActorClient::new(options.actor_queue_size);
    let shutdown = CancellationToken::new();

    let (replica, role_state_change_listener) = replica::create_replica(replica::ReplicaConfig {
        logger: logger.clone(),
        my_replica_id,
        initial_members: config.initial_members.into_iter().map(ReplicaMetadata::from).collect(),
        local_state,
        commit_log,
        snapshot_path,
        config_path,
        peer_connector: config.peer_connector,
        actor_client: actor_client.weak(),
        leader_heartbeat_duration: options.leader_heartbeat_duration,
        follower_min_timeout: options.follower_min_timeout,
        follower_max_timeout: options.follower_max_timeout,
        append_entries_timeout: options.leader_append_entries_timeout,
        max_entries_per_append: options.max_entries_per_append,
        snapshot_policy: replica::SnapshotPolicy {
            max_log_entries: options.snapshot_max_log_entries,
            max_age: options.snapshot_max_age,
        },
        peer_tasks: shutdown.child_token(),
    })
    .map_err(NodeCreationError::LogInitialization)?;

    let replica_actor = actor::create(actor_queue_rx, replica, shutdown.clone());

    Ok(RaftNode::new(
        logger,
        actor_client,
        replica_actor,
        shutdown,
        role_state_change_listener,
    ))
}

fn validate_members(members: &[RaftMemberInfo]) -> Result<(), NodeCreationError> {
    if members.is_empty() {
        return Err(NodeCreationError::NoMembers);
    }

    let mut seen = HashSet::new();
    for member in members {
        if member.replica_id.len() > replica::MAX_REPLICA_ID_LEN {
            return Err(NodeCreationError::ReplicaIdTooLong(member.replica_id.len()));
        }
        if !seen.insert(member.replica_id.as_str()) {
            return Err(NodeCreationError::DuplicateMember(member.replica_id.clone()));
        }
    }

    Ok(())
}

struct DataPaths {
    log: PathBuf,
    snapshot: PathBuf,
    members: PathBuf,
}

impl DataPaths {
    fn beside(local_state_path: &Path) -> Self {
        let sibling = |suffix: &str| {
            let mut name = OsString::from(local_state_path.as_os_str());
            name.push(suffix);
            PathBuf::from(name)
        };

        DataPaths {
            log: sibling(".log"),
            snapshot: sibling(".snapshot"),
            members: sibling(".members"),
        }
    }
}
