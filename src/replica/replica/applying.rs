use crate::commitlog::{Index, Log};
use crate::replica::election::Role;
use crate::replica::replica::Replica;
use crate::replica::replica_api::MembershipChange;
use crate::replica::state_machine::StateMachineOutput;
use crate::replica::write_ahead_log::{EntryKind, WriteAheadLogEntry};
use std::convert::TryFrom;

impl<L> Replica<L>
where
    L: Log<WriteAheadLogEntry>,
{
    /// > If commitIndex > lastApplied: increment lastApplied, apply
    /// > log[lastApplied] to state machine (§5.3)
    ///
    /// Applies in log order and stops at the first application command if no state machine is
    /// registered yet. Membership entries take effect here, and only here.
    pub(super) fn apply_committed_entries(&mut self) {
        let mut config_changed = false;

        loop {
            let (index, entry) = match self.wal.next_entry_to_apply() {
                Ok(Some(next)) => next,
                Ok(None) => break,
                Err(e) => {
                    slog::error!(self.logger, "Failed to read next committed entry: {:?}", e);
                    break;
                }
            };

            let mut applied_change = None;
            let output = match entry.kind {
                EntryKind::NoOp => StateMachineOutput::NoData,
                EntryKind::General => match self.state_machine.as_mut() {
                    Some(state_machine) => state_machine.apply_command(entry.data.clone()),
                    None => {
                        slog::debug!(self.logger, "No state machine registered. Pausing apply at {:?}", index);
                        break;
                    }
                },
                EntryKind::AddNode | EntryKind::RemoveNode => match MembershipChange::try_from(&entry) {
                    Ok(change) => match self.cluster_tracker.apply(index, change.clone()) {
                        Ok(true) => {
                            slog::info!(self.logger, "Applied membership change {:?} at {:?}", change, index);
                            applied_change = Some(change);
                            StateMachineOutput::NoData
                        }
                        // Replayed after a restart. The stored configuration already has it.
                        Ok(false) => StateMachineOutput::NoData,
                        Err(e) => {
                            slog::crit!(
                                self.logger,
                                "Failed to persist membership change at {:?}: {:?}. Halting apply.",
                                index,
                                e
                            );
                            break;
                        }
                    },
                    Err(e) => {
                        slog::crit!(
                            self.logger,
                            "Committed membership entry at {:?} can't be decoded: {:?}. Halting apply.",
                            index,
                            e
                        );
                        break;
                    }
                },
            };

            self.wal.mark_applied(index, entry.term, output);

            if let Some(change) = applied_change {
                self.on_membership_applied(index, change);
                config_changed = true;
            }
        }

        // The voting set changed, and with it the majority.
        if config_changed && self.election_state.role() == Role::Leader {
            self.try_advance_commit_index();
        }

        self.maybe_take_snapshot();
    }

    fn on_membership_applied(&mut self, index: Index, change: MembershipChange) {
        let is_leader = self.election_state.role() == Role::Leader;
        match change {
            MembershipChange::Remove(replica_id) => {
                self.peer_clients.remove(&replica_id);
                if replica_id == self.my_replica_id {
                    if is_leader {
                        slog::info!(self.logger, "Removed myself from the cluster at {:?}. Stepping down.", index);
                        let term = self.local_state.current_term();
                        self.become_follower(term, None);
                    }
                } else if let Some(leader_state) = self.election_state.leader_state_mut() {
                    leader_state.remove_peer(&replica_id);
                }
            }
            MembershipChange::Add(metadata) => {
                if is_leader && *metadata.replica_id() != self.my_replica_id {
                    let previous_log_entry_index = self.wal.last_index();
                    self.election_state
                        .leader_add_peer(metadata.replica_id().clone(), previous_log_entry_index);
                }
            }
        }
    }
}
