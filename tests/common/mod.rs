#![allow(dead_code)]

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::Utc;
use raft_consensus as raft;
use raft_consensus::Role;
use slog::Drain;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use tokio::time::{Duration, Instant};

pub const HEARTBEAT: Duration = Duration::from_millis(50);

pub fn options() -> raft::RaftOptions {
    raft::RaftOptions {
        leader_heartbeat_duration: Some(HEARTBEAT),
        follower_min_timeout: Some(HEARTBEAT * 6),
        follower_max_timeout: Some(HEARTBEAT * 12),
        leader_append_entries_timeout: Some(HEARTBEAT * 2),
        ..raft::RaftOptions::default()
    }
}

pub fn repl_id(id: usize) -> String {
    format!("replica-{}", id + 1)
}

pub fn member_info(port_base: u16, id: usize) -> raft::RaftMemberInfo {
    raft::RaftMemberInfo {
        replica_id: repl_id(id),
        ip_addr: Ipv4Addr::LOCALHOST,
        raft_internal_rpc_port: port_base + id as u16,
        peer_redirect_info_blob: raft::RaftMemberInfoBlob::new(4000 + id as u128),
    }
}

// ------- State machine -------

/// Remembers every applied command in order. Snapshots are the whole list, length prefixed.
pub struct RecordingStateMachine {
    applied: Arc<Mutex<Vec<Bytes>>>,
}

impl RecordingStateMachine {
    pub fn new() -> (Self, Arc<Mutex<Vec<Bytes>>>) {
        let applied = Arc::new(Mutex::new(vec![]));
        (
            RecordingStateMachine {
                applied: applied.clone(),
            },
            applied,
        )
    }
}

impl raft::StateMachine for RecordingStateMachine {
    fn apply_command(&mut self, command: Bytes) -> raft::StateMachineOutput {
        let mut applied = self.applied.lock().unwrap();
        applied.push(command);
        raft::StateMachineOutput::Data(Bytes::from(applied.len().to_string()))
    }

    fn generate_snapshot(&self) -> Bytes {
        let applied = self.applied.lock().unwrap();
        let mut buf = BytesMut::new();
        for command in applied.iter() {
            buf.put_u32(command.len() as u32);
            buf.put_slice(command);
        }
        buf.freeze()
    }

    fn apply_snapshot(&mut self, mut snapshot: Bytes) -> Result<(), raft::StateMachineError> {
        let mut restored = vec![];
        while snapshot.has_remaining() {
            if snapshot.remaining() < 4 {
                return Err(raft::StateMachineError::CorruptSnapshot("truncated length".into()));
            }
            let len = snapshot.get_u32() as usize;
            if snapshot.remaining() < len {
                return Err(raft::StateMachineError::CorruptSnapshot("truncated command".into()));
            }
            restored.push(snapshot.split_to(len));
        }

        *self.applied.lock().unwrap() = restored;
        Ok(())
    }
}

// ------- In-process cluster -------

pub struct Cluster {
    pub network: raft::InProcessNetwork,
    pub nodes: HashMap<String, raft::RaftNode>,
    pub applied: HashMap<String, Arc<Mutex<Vec<Bytes>>>>,
    pub members: Vec<raft::RaftMemberInfo>,
    options: raft::RaftOptions,
}

impl Cluster {
    pub async fn start(num_members: usize) -> Self {
        Self::start_with_options(num_members, options()).await
    }

    pub async fn start_with_options(num_members: usize, options: raft::RaftOptions) -> Self {
        let members: Vec<_> = (0..num_members).map(|i| member_info(9000, i)).collect();
        let mut cluster = Cluster {
            network: raft::InProcessNetwork::new(),
            nodes: HashMap::new(),
            applied: HashMap::new(),
            members: members.clone(),
            options,
        };

        for member in members.iter() {
            cluster.spawn_node(&member.replica_id, members.clone()).await;
        }

        cluster
    }

    /// Start a node that knows `initial_members`. A node joining later passes the current members,
    /// without itself.
    pub async fn spawn_node(&mut self, replica_id: &str, initial_members: Vec<raft::RaftMemberInfo>) {
        let node = raft::create_raft_node(raft::RaftNodeConfig {
            my_replica_id: replica_id.to_string(),
            initial_members,
            options: self.options.clone(),
            logger: test_logger(replica_id),
            peer_connector: self.network.connector(raft::ReplicaId::new(replica_id)),
            local_state_path: None,
        })
        .expect("node config is valid");

        let (state_machine, applied) = RecordingStateMachine::new();
        node.register_state_machine(Box::new(state_machine))
            .await
            .expect("node is alive");
        self.network.register(raft::ReplicaId::new(replica_id), node.rpc_handle());
        node.start();

        self.applied.insert(replica_id.to_string(), applied);
        self.nodes.insert(replica_id.to_string(), node);
    }

    pub async fn shutdown(self) {
        for node in self.nodes.values() {
            node.shutdown().await;
        }
    }

    pub fn node(&self, replica_id: &str) -> &raft::RaftNode {
        self.nodes.get(replica_id).expect("unknown node")
    }

    pub fn applied(&self, replica_id: &str) -> Vec<Bytes> {
        self.applied.get(replica_id).expect("unknown node").lock().unwrap().clone()
    }

    /// Wait until exactly one of `candidates` sees itself as leader, and return it.
    pub async fn wait_for_leader_among(&self, candidates: &[String], timeout: Duration) -> String {
        let deadline = Instant::now() + timeout;
        loop {
            let leaders: Vec<_> = candidates
                .iter()
                .filter(|id| self.node(id).role_state().role == Role::Leader)
                .collect();
            if leaders.len() == 1 {
                return leaders[0].clone();
            }

            assert!(Instant::now() < deadline, "Timeout waiting for leader election");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn wait_for_leader(&self, timeout: Duration) -> String {
        let candidates: Vec<_> = self.nodes.keys().cloned().collect();
        self.wait_for_leader_among(&candidates, timeout).await
    }

    /// Append through any node, following redirects until the leader accepts.
    pub async fn append(&self, data: &str, timeout: Duration) -> raft::AppendLogOutput {
        let deadline = Instant::now() + timeout;
        let mut target = self.nodes.keys().next().expect("empty cluster").clone();
        loop {
            match self.node(&target).append_log(Bytes::from(data.to_string())).await {
                Ok(output) => return output,
                Err(raft::AppendLogError::LeaderRedirect(leader)) => target = leader.replica_id,
                Err(raft::AppendLogError::NoLeader) | Err(raft::AppendLogError::Abandoned(_)) => {
                    tokio::time::sleep(HEARTBEAT).await
                }
                Err(e) => panic!("Unexpected append failure: {:?}", e),
            }

            assert!(Instant::now() < deadline, "Timeout appending {:?}", data);
        }
    }

    /// Wait until `replica_id` has applied exactly `expected`.
    pub async fn wait_for_applied(&self, replica_id: &str, expected: &[Bytes], timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            let applied = self.applied(replica_id);
            if applied == expected {
                return;
            }

            assert!(
                Instant::now() < deadline,
                "Timeout waiting for {} to apply {:?}, has {:?}",
                replica_id,
                expected,
                applied
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

pub fn bytes_of(items: &[&str]) -> Vec<Bytes> {
    items.iter().map(|s| Bytes::from(s.to_string())).collect()
}

// ------- Logging -------

/// Quiet by default. Set `RAFT_TEST_LOG=1` for terminal logs.
pub fn test_logger(replica_id: &str) -> slog::Logger {
    if std::env::var("RAFT_TEST_LOG").is_ok() {
        create_root_logger_for_stdout(replica_id.to_string())
    } else {
        slog::Logger::root(slog::Discard, slog::o!())
    }
}

pub fn create_root_logger_for_file(directory_prefix: String, replica_id: String) -> slog::Logger {
    let now = Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
    let log_path = format!("{}/{}_{}_info.log", directory_prefix, replica_id, now);
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(log_path)
        .unwrap();

    let decorator = slog_term::PlainDecorator::new(file);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(drain, slog::o!())
}

pub fn create_root_logger_for_stdout(replica_id: String) -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).use_file_location().build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(drain, slog::o!("ReplicaId" => replica_id))
}
