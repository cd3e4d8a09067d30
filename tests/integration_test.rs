mod common;

use bytes::Bytes;
use common::{bytes_of, Cluster};
use raft_consensus as raft;
use raft_consensus::{Role, StateMachineOutput};
use std::collections::HashMap;
use std::error::Error;
use std::sync::{Arc, Mutex};
use tokio::time::{Duration, Instant};

#[tokio::test]
async fn leader_election() -> Result<(), Box<dyn Error>> {
    let cluster = Cluster::start(5).await;
    let leader_id = cluster.wait_for_leader(Duration::from_secs(10)).await;

    // Everyone else eventually learns who won.
    for (id, node) in cluster.nodes.iter() {
        if *id == leader_id {
            continue;
        }
        let mut listener = node.event_listener();
        let deadline = Instant::now() + Duration::from_secs(5);
        while listener.current().leader.as_ref().map(|l| l.replica_id.as_str()) != Some(leader_id.as_str()) {
            tokio::time::timeout_at(deadline, listener.next_event())
                .await
                .expect("Timeout waiting for follower to learn leader")
                .expect("Expected event bus to be alive");
        }
        assert_eq!(listener.current().role, Role::Follower);
    }

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn follower_redirects_to_leader() -> Result<(), Box<dyn Error>> {
    let cluster = Cluster::start(3).await;
    let leader_id = cluster.wait_for_leader(Duration::from_secs(10)).await;

    // Give followers a heartbeat to learn the leader.
    tokio::time::sleep(common::HEARTBEAT * 3).await;

    let follower_id = cluster.nodes.keys().find(|id| **id != leader_id).unwrap().clone();
    match cluster.node(&follower_id).append_log(Bytes::from("x")).await {
        Err(raft::AppendLogError::LeaderRedirect(leader)) => {
            assert_eq!(leader.replica_id, leader_id);
            let leader_member = cluster.members.iter().find(|m| m.replica_id == leader_id).unwrap();
            assert_eq!(leader.info_blob, leader_member.peer_redirect_info_blob);
        }
        other => panic!("Expected redirect, got {:?}", other),
    }

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn simple_commit() -> Result<(), Box<dyn Error>> {
    let cluster = Cluster::start(5).await;
    cluster.wait_for_leader(Duration::from_secs(10)).await;

    let first = cluster.append("Hello world", Duration::from_secs(10)).await;
    assert_eq!(first.output, StateMachineOutput::Data(Bytes::from("1")));
    let second = cluster.append("it's me", Duration::from_secs(10)).await;
    assert_eq!(second.output, StateMachineOutput::Data(Bytes::from("2")));
    assert!(second.entry_id.index() > first.entry_id.index());

    let expected = bytes_of(&["Hello world", "it's me"]);
    for id in cluster.nodes.keys() {
        cluster.wait_for_applied(id, &expected, Duration::from_secs(5)).await;
    }

    let status = cluster.node(cluster.nodes.keys().next().unwrap()).status().await?;
    assert_eq!(status.members.len(), 5);
    assert!(status.commit_index >= Some(second.entry_id.index()));

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn partitioned_leader_is_replaced_and_catches_up_after_heal() -> Result<(), Box<dyn Error>> {
    let cluster = Cluster::start(5).await;
    let old_leader = cluster.wait_for_leader(Duration::from_secs(10)).await;
    cluster.append("before", Duration::from_secs(10)).await;

    cluster.network.isolate(&raft::ReplicaId::new(old_leader.clone()));
    let old_term = cluster.node(&old_leader).role_state().term;

    // The isolated node can't commit anything on its own.
    let stuck = cluster.node(&old_leader).append_log(Bytes::from("lost"));
    let stuck = tokio::time::timeout(common::HEARTBEAT * 10, stuck).await;
    assert!(stuck.is_err(), "Isolated leader must not commit");

    let majority: Vec<_> = cluster.nodes.keys().filter(|id| **id != old_leader).cloned().collect();
    let new_leader = cluster.wait_for_leader_among(&majority, Duration::from_secs(10)).await;
    assert!(cluster.node(&new_leader).role_state().term > old_term);

    let output = cluster.node(&new_leader).append_log(Bytes::from("after")).await?;
    assert_eq!(output.output, StateMachineOutput::Data(Bytes::from("2")));

    cluster.network.heal_all();
    let expected = bytes_of(&["before", "after"]);
    cluster.wait_for_applied(&old_leader, &expected, Duration::from_secs(10)).await;
    assert_eq!(cluster.node(&old_leader).role_state().role, Role::Follower);

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn at_most_one_leader_per_term_under_message_loss() -> Result<(), Box<dyn Error>> {
    let cluster = Arc::new(Cluster::start(5).await);
    cluster.network.set_faults(raft::FaultConfig {
        drop_rate: 0.2,
        max_delay: Duration::from_millis(40),
    });

    let leaders_by_term: Arc<Mutex<HashMap<u64, String>>> = Arc::new(Mutex::new(HashMap::new()));
    let mut watchers = vec![];
    for (id, node) in cluster.nodes.iter() {
        let id = id.clone();
        let mut listener = node.event_listener();
        let leaders_by_term = leaders_by_term.clone();
        let cluster = cluster.clone();
        watchers.push(tokio::spawn(async move {
            let mut sample = tokio::time::interval(Duration::from_millis(5));
            let mut last_commit_index = None;
            loop {
                tokio::select! {
                    event = listener.next_event() => match event {
                        Some(raft::RaftEvent::Role(state)) => {
                            if state.role != Role::Leader {
                                continue;
                            }
                            let mut leaders = leaders_by_term.lock().unwrap();
                            let previous = leaders.entry(state.term.as_u64()).or_insert_with(|| id.clone());
                            assert_eq!(*previous, id, "Two leaders in term {}", state.term);
                        }
                        _ => break,
                    },
                    _ = sample.tick() => {
                        // Fails once the node has shut down.
                        if let Ok(status) = cluster.node(&id).status().await {
                            assert!(
                                status.commit_index >= last_commit_index,
                                "{} commit index went back from {:?} to {:?}",
                                id,
                                last_commit_index,
                                status.commit_index
                            );
                            last_commit_index = status.commit_index;
                        }
                    }
                }
            }
        }));
    }

    // Churn leadership by isolating whoever leads, a few times over, and keep writing through it.
    for round in 0..3 {
        let leader = cluster.wait_for_leader(Duration::from_secs(20)).await;
        cluster
            .append(&format!("before-{}", round), Duration::from_secs(20))
            .await;

        cluster.network.isolate(&raft::ReplicaId::new(leader.clone()));
        // May land on the isolated leader and never finish. What matters is the log stays consistent.
        let _ = tokio::time::timeout(
            common::HEARTBEAT * 20,
            cluster.append(&format!("during-{}", round), Duration::from_secs(60)),
        )
        .await;
        cluster.network.heal_all();
    }
    cluster.network.set_faults(raft::FaultConfig::default());
    cluster.wait_for_leader(Duration::from_secs(20)).await;
    cluster.append("after", Duration::from_secs(20)).await;

    let longest = cluster
        .nodes
        .keys()
        .map(|id| cluster.applied(id))
        .max_by_key(|applied| applied.len())
        .unwrap();
    for id in cluster.nodes.keys() {
        let applied = cluster.applied(id);
        assert_eq!(
            applied[..],
            longest[..applied.len()],
            "{} applied entries that diverge from the longest history",
            id
        );
    }
    assert_eq!(longest.last(), Some(&Bytes::from("after")));
    for id in cluster.nodes.keys() {
        cluster.wait_for_applied(id, &longest, Duration::from_secs(10)).await;
    }

    for node in cluster.nodes.values() {
        node.shutdown().await;
    }
    for watcher in watchers {
        // A failed assertion inside a watcher surfaces as a JoinError.
        watcher.await?;
    }
    assert!(!leaders_by_term.lock().unwrap().is_empty());

    Ok(())
}

#[tokio::test]
async fn add_then_remove_server() -> Result<(), Box<dyn Error>> {
    let mut cluster = Cluster::start(3).await;
    let leader_id = cluster.wait_for_leader(Duration::from_secs(10)).await;
    cluster.append("one", Duration::from_secs(10)).await;

    let newcomer = common::member_info(9000, 3);
    let existing = cluster.members.clone();
    cluster.spawn_node(&newcomer.replica_id, existing).await;
    cluster.node(&leader_id).add_server(newcomer.clone()).await?;

    // A second add while nothing is pending is fine, but re-adding is not.
    match cluster.node(&leader_id).add_server(newcomer.clone()).await {
        Err(raft::MembershipChangeError::AlreadyMember(id)) => assert_eq!(id, newcomer.replica_id),
        other => panic!("Expected AlreadyMember, got {:?}", other),
    }

    cluster.append("two", Duration::from_secs(10)).await;
    let expected = bytes_of(&["one", "two"]);
    cluster.wait_for_applied(&newcomer.replica_id, &expected, Duration::from_secs(10)).await;
    assert_eq!(cluster.node(&newcomer.replica_id).status().await?.members.len(), 4);

    // Remove a follower that isn't the newcomer.
    let victim = cluster
        .members
        .iter()
        .map(|m| m.replica_id.clone())
        .find(|id| *id != leader_id)
        .unwrap();
    cluster.node(&leader_id).remove_server(&victim).await?;
    let status = cluster.node(&leader_id).status().await?;
    assert_eq!(status.members.len(), 3);
    assert!(status.members.iter().all(|m| m.replica_id != victim));

    // The victim no longer counts, and isn't needed.
    cluster.network.isolate(&raft::ReplicaId::new(victim.clone()));
    cluster.node(&leader_id).append_log(Bytes::from("three")).await?;

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn lagging_follower_catches_up_through_snapshot() -> Result<(), Box<dyn Error>> {
    let options = raft::RaftOptions {
        snapshot_max_log_entries: Some(5),
        max_entries_per_append: Some(2),
        ..common::options()
    };
    let cluster = Cluster::start_with_options(3, options).await;
    let leader_id = cluster.wait_for_leader(Duration::from_secs(10)).await;

    let laggard = cluster.nodes.keys().find(|id| **id != leader_id).unwrap().clone();
    cluster.network.isolate(&raft::ReplicaId::new(laggard.clone()));

    let mut expected = vec![];
    for i in 0..12 {
        let data = format!("entry-{}", i);
        cluster.node(&leader_id).append_log(Bytes::from(data.clone())).await?;
        expected.push(Bytes::from(data));
    }

    cluster.network.heal_all();
    cluster.wait_for_applied(&laggard, &expected, Duration::from_secs(10)).await;

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn shutdown_abandons_waiting_callers() -> Result<(), Box<dyn Error>> {
    let mut cluster = Cluster::start(3).await;
    let leader_id = cluster.wait_for_leader(Duration::from_secs(10)).await;

    // Nobody can ack, so the entry stays pending until shutdown.
    for id in cluster.nodes.keys() {
        if *id != leader_id {
            cluster.network.isolate(&raft::ReplicaId::new(id.clone()));
        }
    }

    let leader = cluster.nodes.remove(&leader_id).unwrap();
    let rpc_handle = leader.rpc_handle();
    let pending = {
        let append = leader.append_log(Bytes::from("doomed"));
        tokio::pin!(append);
        // Let the append reach the actor before shutting down.
        assert!(tokio::time::timeout(common::HEARTBEAT * 2, &mut append).await.is_err());
        leader.shutdown().await;
        append.await
    };
    match pending {
        Err(raft::AppendLogError::Abandoned(raft::EntryAbandoned::Shutdown)) => {}
        other => panic!("Expected Shutdown, got {:?}", other),
    }

    // The inbound side reports the replica as gone.
    let vote = rpc_handle
        .request_vote(raft::RequestVoteInput {
            candidate_term: raft::Term::new(100),
            candidate_id: raft::ReplicaId::new("replica-2"),
            candidate_last_log_entry: None,
        })
        .await;
    assert!(matches!(vote, Err(raft::RequestVoteError::ActorExited)));

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn term_and_vote_survive_restart() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("replica-1.state");
    let members = vec![common::member_info(9000, 0)];

    let config = |path| raft::RaftNodeConfig {
        my_replica_id: common::repl_id(0),
        initial_members: members.clone(),
        options: common::options(),
        logger: common::test_logger("replica-1"),
        peer_connector: raft::InProcessNetwork::new().connector(raft::ReplicaId::new("replica-1")),
        local_state_path: Some(path),
    };

    // A single-node cluster elects itself.
    let node = raft::create_raft_node(config(path.clone()))?;
    node.start();
    let deadline = Instant::now() + Duration::from_secs(5);
    while node.role_state().role != Role::Leader {
        assert!(Instant::now() < deadline, "Timeout waiting for self-election");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let term_before = node.role_state().term;
    node.shutdown().await;

    let restarted = raft::create_raft_node(config(path))?;
    assert_eq!(restarted.role_state().term, term_before);
    assert_eq!(restarted.role_state().role, Role::Follower);

    Ok(())
}

async fn wait_until_leader(node: &raft::RaftNode) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while node.role_state().role != Role::Leader {
        assert!(Instant::now() < deadline, "Timeout waiting for self-election");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A single-node cluster persisting under `path`, with a fresh state machine registered.
async fn start_single_node(
    path: &std::path::Path,
    options: raft::RaftOptions,
) -> Result<(raft::RaftNode, Arc<Mutex<Vec<Bytes>>>), Box<dyn Error>> {
    let node = raft::create_raft_node(raft::RaftNodeConfig {
        my_replica_id: common::repl_id(0),
        initial_members: vec![common::member_info(9000, 0)],
        options,
        logger: common::test_logger("replica-1"),
        peer_connector: raft::InProcessNetwork::new().connector(raft::ReplicaId::new("replica-1")),
        local_state_path: Some(path.to_path_buf()),
    })?;
    let (state_machine, applied) = common::RecordingStateMachine::new();
    node.register_state_machine(Box::new(state_machine)).await?;
    node.start();

    Ok((node, applied))
}

async fn wait_for(applied: &Arc<Mutex<Vec<Bytes>>>, expected: &[Bytes]) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while applied.lock().unwrap()[..] != expected[..] {
        assert!(
            Instant::now() < deadline,
            "Timeout waiting to apply {:?}, has {:?}",
            expected,
            applied.lock().unwrap()
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn committed_entries_survive_restart() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("replica-1.state");

    let (node, applied) = start_single_node(&path, common::options()).await?;
    wait_until_leader(&node).await;
    let appended = node.append_log(Bytes::from("committed")).await?;
    // Index 1 is the new leader's no-op.
    assert_eq!(appended.entry_id.index(), 2);
    assert_eq!(*applied.lock().unwrap(), bytes_of(&["committed"]));
    node.shutdown().await;
    drop(node);

    let (restarted, reapplied) = start_single_node(&path, common::options()).await?;
    wait_until_leader(&restarted).await;
    wait_for(&reapplied, &bytes_of(&["committed"])).await;
    let status = restarted.status().await?;
    assert!(status.last_log_index >= Some(2));
    assert!(status.commit_index >= Some(2));

    restarted.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn snapshot_and_log_suffix_survive_restart() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("replica-1.state");
    let options = || raft::RaftOptions {
        snapshot_max_log_entries: Some(3),
        ..common::options()
    };
    let commands = ["a", "b", "c", "d", "e", "f", "g"];

    let (node, applied) = start_single_node(&path, options()).await?;
    wait_until_leader(&node).await;
    for command in commands.iter() {
        node.append_log(Bytes::from(*command)).await?;
    }
    assert_eq!(*applied.lock().unwrap(), bytes_of(&commands));
    node.shutdown().await;
    drop(node);

    // The state machine starts from the stored snapshot, then the leader replays what followed it.
    let (restarted, reapplied) = start_single_node(&path, options()).await?;
    wait_until_leader(&restarted).await;
    wait_for(&reapplied, &bytes_of(&commands)).await;
    assert_eq!(restarted.status().await?.members.len(), 1);

    restarted.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn illegal_configs_are_rejected() {
    let base = || raft::RaftNodeConfig {
        my_replica_id: common::repl_id(0),
        initial_members: vec![common::member_info(9000, 0)],
        options: common::options(),
        logger: common::test_logger("replica-1"),
        peer_connector: raft::InProcessNetwork::new().connector(raft::ReplicaId::new("replica-1")),
        local_state_path: None,
    };

    let no_members = raft::RaftNodeConfig {
        initial_members: vec![],
        ..base()
    };
    assert!(matches!(
        raft::create_raft_node(no_members),
        Err(raft::NodeCreationError::NoMembers)
    ));

    let duplicate = raft::RaftNodeConfig {
        initial_members: vec![common::member_info(9000, 0), common::member_info(9000, 0)],
        ..base()
    };
    assert!(matches!(
        raft::create_raft_node(duplicate),
        Err(raft::NodeCreationError::DuplicateMember(_))
    ));

    let bad_options = raft::RaftNodeConfig {
        options: raft::RaftOptions {
            max_entries_per_append: Some(0),
            ..common::options()
        },
        ..base()
    };
    assert!(matches!(
        raft::create_raft_node(bad_options),
        Err(raft::NodeCreationError::IllegalOptions(_))
    ));

    let long_id = "r".repeat(raft::MAX_REPLICA_ID_LEN + 1);
    let oversized_self = raft::RaftNodeConfig {
        my_replica_id: long_id.clone(),
        ..base()
    };
    assert!(matches!(
        raft::create_raft_node(oversized_self),
        Err(raft::NodeCreationError::ReplicaIdTooLong(len)) if len == raft::MAX_REPLICA_ID_LEN + 1
    ));

    let mut oversized_member = common::member_info(9001, 1);
    oversized_member.replica_id = long_id;
    let oversized_members = raft::RaftNodeConfig {
        initial_members: vec![common::member_info(9000, 0), oversized_member],
        ..base()
    };
    assert!(matches!(
        raft::create_raft_node(oversized_members),
        Err(raft::NodeCreationError::ReplicaIdTooLong(_))
    ));
}
