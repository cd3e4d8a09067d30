use crate::commitlog::Log;
use crate::replica::election::CurrentLeader;
use crate::replica::replica::Replica;
use crate::replica::replica_api::{ChangeMembershipError, ChangeMembershipOutput, MembershipChange};
use crate::replica::write_ahead_log::WriteAheadLogEntry;

impl<L> Replica<L>
where
    L: Log<WriteAheadLogEntry>,
{
    /// Leader path for adding or removing a single server.
    ///
    /// The change is only a log entry until it's applied. Until then it blocks any other change,
    /// and an added server already receives replication so it can catch up.
    pub(crate) fn handle_change_membership(
        &mut self,
        change: MembershipChange,
    ) -> Result<ChangeMembershipOutput, ChangeMembershipError> {
        match self.election_state.current_leader() {
            CurrentLeader::Me => { /* carry on */ }
            CurrentLeader::Other(leader) => return Err(ChangeMembershipError::LeaderRedirect(leader)),
            CurrentLeader::Unknown => return Err(ChangeMembershipError::NoLeader),
        }

        self.cluster_tracker.validate_change(&change)?;

        let term = self.local_state.current_term();
        let appended_index = self
            .wal
            .append(change.clone().into_log_entry(term))
            .map_err(ChangeMembershipError::LocalIoError)?;
        let applied = self.wal.register_listener(appended_index, term);
        slog::info!(self.logger, "Appended membership change {:?} at {:?}", change, appended_index);

        let new_peer = match &change {
            MembershipChange::Add(metadata) if *metadata.replica_id() != self.my_replica_id => {
                Some(metadata.replica_id().clone())
            }
            _ => None,
        };
        self.cluster_tracker.set_pending(appended_index, change);

        if let Some(peer_id) = new_peer {
            // Start from our latest entry. Log repair walks it back to wherever the new server is.
            self.election_state
                .leader_add_peer(peer_id, self.wal.last_index());
        }

        self.replicate_to_idle_peers();
        // Removing a peer from a two node cluster commits on local append.
        self.try_advance_commit_index();

        Ok(ChangeMembershipOutput {
            enqueued_index: appended_index,
            applied,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::commitlog::Index;
    use crate::replica::election::Role;
    use crate::replica::replica::test_utils::{self, md};
    use crate::replica::replica_api::{ChangeMembershipError, MembershipChange, ReplicationPayload};
    use crate::replica::{ReplicaId, StateMachineOutput};

    #[tokio::test]
    async fn pending_add_replicates_but_is_excluded_from_quorum() {
        let mut harness = test_utils::leader("a", &["a", "b"]);
        // The no-op needs b's ack to commit in a two node cluster.
        harness.replica.handle_replication_reply_from_peer(test_utils::ack(
            "b",
            1,
            1,
            ReplicationPayload::Entries {
                previous_log_entry_index: None,
                num_log_entries: 1,
            },
        ));
        assert_eq!(harness.replica.wal.commit_index(), Some(Index::new(1)));

        let mut added = harness
            .replica
            .handle_change_membership(MembershipChange::Add(md("c")))
            .unwrap();
        assert_eq!(added.enqueued_index, Index::new(2));

        // c is tracked for replication but isn't a voter yet.
        let leader_state = harness.replica.election_state.leader_state().unwrap();
        assert!(leader_state.contains_peer(&ReplicaId::new("c")));
        assert!(!harness.replica.cluster_tracker.contains_member(&ReplicaId::new("c")));

        // Only one change at a time.
        match harness
            .replica
            .handle_change_membership(MembershipChange::Remove(ReplicaId::new("b")))
        {
            Err(ChangeMembershipError::ConcurrentMembershipChange) => {}
            other => panic!("Unexpected result {:?}", other),
        }

        // c catching up alone isn't a majority of the old {a, b} configuration.
        harness.replica.handle_replication_reply_from_peer(test_utils::ack(
            "c",
            1,
            1,
            ReplicationPayload::Entries {
                previous_log_entry_index: Some(Index::new(2)),
                num_log_entries: 0,
            },
        ));
        assert_eq!(harness.replica.wal.commit_index(), Some(Index::new(1)));

        // b's ack commits and applies the change.
        harness.replica.handle_replication_reply_from_peer(test_utils::ack(
            "b",
            1,
            2,
            ReplicationPayload::Entries {
                previous_log_entry_index: Some(Index::new(1)),
                num_log_entries: 1,
            },
        ));
        assert_eq!(harness.replica.wal.last_applied_index(), Some(Index::new(2)));
        assert_eq!(added.applied.try_recv().unwrap(), Ok(StateMachineOutput::NoData));
        assert!(harness.replica.cluster_tracker.contains_member(&ReplicaId::new("c")));
        assert_eq!(harness.replica.cluster_tracker.num_voting_replicas(), 3);
        assert!(!harness.replica.cluster_tracker.has_pending_change());
    }

    #[tokio::test]
    async fn invalid_changes_and_followers_are_rejected() {
        let mut harness = test_utils::leader("a", &["a", "b", "c"]);
        match harness
            .replica
            .handle_change_membership(MembershipChange::Add(md("b")))
        {
            Err(ChangeMembershipError::AlreadyMember(id)) => assert_eq!(id, ReplicaId::new("b")),
            other => panic!("Unexpected result {:?}", other),
        }
        match harness
            .replica
            .handle_change_membership(MembershipChange::Remove(ReplicaId::new("z")))
        {
            Err(ChangeMembershipError::NotMember(id)) => assert_eq!(id, ReplicaId::new("z")),
            other => panic!("Unexpected result {:?}", other),
        }

        let mut follower = test_utils::replica("b", &["a", "b", "c"]);
        match follower
            .replica
            .handle_change_membership(MembershipChange::Remove(ReplicaId::new("c")))
        {
            Err(ChangeMembershipError::NoLeader) => {}
            other => panic!("Unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn leader_removing_itself_steps_down_once_applied() {
        let mut harness = test_utils::leader("a", &["a", "b"]);
        harness.replica.handle_replication_reply_from_peer(test_utils::ack(
            "b",
            1,
            1,
            ReplicationPayload::Entries {
                previous_log_entry_index: None,
                num_log_entries: 1,
            },
        ));

        let mut removed = harness
            .replica
            .handle_change_membership(MembershipChange::Remove(ReplicaId::new("a")))
            .unwrap();
        assert_eq!(harness.replica.election_state.role(), Role::Leader);

        harness.replica.handle_replication_reply_from_peer(test_utils::ack(
            "b",
            1,
            2,
            ReplicationPayload::Entries {
                previous_log_entry_index: Some(Index::new(1)),
                num_log_entries: 1,
            },
        ));

        assert_eq!(removed.applied.try_recv().unwrap(), Ok(StateMachineOutput::NoData));
        assert_eq!(harness.replica.election_state.role(), Role::Follower);
        assert!(!harness.replica.cluster_tracker.am_i_member());
    }
}
