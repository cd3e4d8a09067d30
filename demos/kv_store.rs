use raft_consensus as raft;
use slog::Drain;
use std::error::Error;
use std::net::Ipv4Addr;
use tokio::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let logger = create_root_logger_for_stdout();
    let network = raft::InProcessNetwork::new();
    let cluster = fake_cluster();

    let mut stores = Vec::with_capacity(cluster.len());
    for member in cluster.iter() {
        let store = kv_impl::KvStore::setup(
            logger.new(slog::o!("ReplicaId" => member.replica_id.clone())),
            member.replica_id.clone(),
            cluster.clone(),
            &network,
        )
        .await?;
        stores.push(store);
    }

    let leader = loop {
        if let Some(leader) = stores.iter().find(|s| s.is_leader()) {
            break leader;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    };

    assert_eq!(100, leader.add("k1".into(), 100).await?);
    assert_eq!(100, leader.add("k2".into(), 100).await?);
    assert_eq!(-1, leader.add("k1".into(), -101).await?);

    // Give followers a heartbeat to apply the last commit.
    tokio::time::sleep(Duration::from_millis(300)).await;
    for store in stores.iter() {
        assert_eq!(-1, store.get("k1"));
        assert_eq!(100, store.get("k2"));
    }
    slog::info!(logger, "All replicas agree");

    for store in stores.iter() {
        store.shutdown().await;
    }
    Ok(())
}

fn fake_cluster() -> Vec<raft::RaftMemberInfo> {
    ["id-1", "id-2", "id-3"]
        .iter()
        .enumerate()
        .map(|(i, id)| raft::RaftMemberInfo {
            replica_id: id.to_string(),
            ip_addr: Ipv4Addr::LOCALHOST,
            raft_internal_rpc_port: 2021 + i as u16,
            peer_redirect_info_blob: raft::RaftMemberInfoBlob::new(i as u128),
        })
        .collect()
}

fn create_root_logger_for_stdout() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let drain = slog::LevelFilter::new(drain, slog::Level::Info).fuse();

    slog::Logger::root(drain, slog::o!())
}

mod kv_impl {
    use super::raft;
    use bytes::{Buf, BufMut, Bytes, BytesMut};
    use std::collections::HashMap;
    use std::error::Error;
    use std::sync::{Arc, Mutex};

    pub struct KvStore {
        node: raft::RaftNode,
        state: Arc<Mutex<HashMap<String, i64>>>,
    }

    impl KvStore {
        pub async fn setup(
            logger: slog::Logger,
            my_replica_id: String,
            cluster: Vec<raft::RaftMemberInfo>,
            network: &raft::InProcessNetwork,
        ) -> Result<Self, Box<dyn Error>> {
            let node = raft::create_raft_node(raft::RaftNodeConfig {
                peer_connector: network.connector(raft::ReplicaId::new(my_replica_id.clone())),
                my_replica_id: my_replica_id.clone(),
                initial_members: cluster,
                options: raft::RaftOptions::default(),
                logger,
                local_state_path: None,
            })?;

            let state = Arc::new(Mutex::new(HashMap::new()));
            node.register_state_machine(Box::new(AccumulatorStateMachine {
                count_per_key: state.clone(),
            }))
            .await?;
            network.register(raft::ReplicaId::new(my_replica_id), node.rpc_handle());
            node.start();

            Ok(KvStore { node, state })
        }

        pub fn is_leader(&self) -> bool {
            self.node.role_state().role == raft::Role::Leader
        }

        /// Adds `value` to `key` and returns the new total, once it's applied.
        pub async fn add(&self, key: String, value: i64) -> Result<i64, Box<dyn Error>> {
            let output = self.node.append_log(encode_kv(&key, value)).await?;
            match output.output {
                raft::StateMachineOutput::Data(mut total) if total.len() == 8 => Ok(total.get_i64()),
                other => Err(format!("Unexpected state machine output {:?}", other).into()),
            }
        }

        pub fn get(&self, key: &str) -> i64 {
            *self.state.lock().unwrap().get(key).unwrap_or(&0)
        }

        pub async fn shutdown(&self) {
            self.node.shutdown().await;
        }
    }

    /// encode the key/value pair in the following way:
    /// | 8 bytes | variable length |
    /// |  value  |   key           |
    fn encode_kv(key: &str, value: i64) -> Bytes {
        let mut bytes = BytesMut::with_capacity(8 + key.len());
        bytes.put_i64(value);
        bytes.put_slice(key.as_bytes());

        bytes.freeze()
    }

    fn decode_kv(mut bytes: Bytes) -> (String, i64) {
        let value = bytes.get_i64();
        let key = String::from_utf8_lossy(&bytes);

        (key.into_owned(), value)
    }

    struct AccumulatorStateMachine {
        count_per_key: Arc<Mutex<HashMap<String, i64>>>,
    }

    impl raft::StateMachine for AccumulatorStateMachine {
        fn apply_command(&mut self, command: Bytes) -> raft::StateMachineOutput {
            let (key, value) = decode_kv(command);
            let mut counts = self.count_per_key.lock().unwrap();
            let total = counts.entry(key).or_insert(0);
            *total += value;

            let mut output = BytesMut::with_capacity(8);
            output.put_i64(*total);
            raft::StateMachineOutput::Data(output.freeze())
        }

        // Snapshot format: repeated | 8 bytes value | 2 bytes key len | key |
        fn generate_snapshot(&self) -> Bytes {
            let counts = self.count_per_key.lock().unwrap();
            let mut bytes = BytesMut::new();
            for (key, value) in counts.iter() {
                bytes.put_i64(*value);
                bytes.put_u16(key.len() as u16);
                bytes.put_slice(key.as_bytes());
            }

            bytes.freeze()
        }

        fn apply_snapshot(&mut self, mut snapshot: Bytes) -> Result<(), raft::StateMachineError> {
            let mut restored = HashMap::new();
            while snapshot.has_remaining() {
                if snapshot.remaining() < 10 {
                    return Err(raft::StateMachineError::CorruptSnapshot("truncated entry".into()));
                }
                let value = snapshot.get_i64();
                let key_len = snapshot.get_u16() as usize;
                if snapshot.remaining() < key_len {
                    return Err(raft::StateMachineError::CorruptSnapshot("truncated key".into()));
                }
                let key = String::from_utf8_lossy(&snapshot.split_to(key_len)).into_owned();
                restored.insert(key, value);
            }

            *self.count_per_key.lock().unwrap() = restored;
            Ok(())
        }
    }
}
