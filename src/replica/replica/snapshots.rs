use crate::commitlog::Log;
use crate::replica::replica::replication::AcceptLeaderError;
use crate::replica::replica::Replica;
use crate::replica::replica_api::{InstallSnapshotError, InstallSnapshotInput, InstallSnapshotOutput};
use crate::replica::snapshot::Snapshot;
use crate::replica::write_ahead_log::WriteAheadLogEntry;
use tokio::time::Instant;

impl<L> Replica<L>
where
    L: Log<WriteAheadLogEntry>,
{
    pub(crate) fn server_handle_install_snapshot(
        &mut self,
        input: InstallSnapshotInput,
    ) -> Result<InstallSnapshotOutput, InstallSnapshotError> {
        self.accept_leader_rpc(input.leader_term, &input.leader_id)
            .map_err(|e| match e {
                AcceptLeaderError::TermOutOfDate(info) => InstallSnapshotError::ClientTermOutOfDate(info),
                AcceptLeaderError::Io(e) => InstallSnapshotError::ServerIoError(e),
            })?;

        // Everything the snapshot covers is already committed here. Nothing to do, and it's how
        // a retried or duplicated InstallSnapshot stays harmless.
        if matches!(self.wal.commit_index(), Some(ci) if input.last_included_index <= ci) {
            slog::debug!(
                self.logger,
                "Ignoring snapshot through {:?}, already committed through {:?}",
                input.last_included_index,
                self.wal.commit_index()
            );
            return Ok(InstallSnapshotOutput {});
        }

        match self.state_machine.as_mut() {
            Some(state_machine) => {
                if let Err(e) = state_machine.apply_snapshot(input.data.clone()) {
                    slog::crit!(
                        self.logger,
                        "State machine rejected snapshot through {:?}: {}",
                        input.last_included_index,
                        e
                    );
                    return Err(InstallSnapshotError::StateMachineFailure(e.to_string()));
                }
            }
            None => self.snapshot_awaiting_state_machine = true,
        }

        // Durable before the log prefix it replaces is dropped.
        self.snapshot_manager
            .store(
                Snapshot {
                    last_included_index: input.last_included_index,
                    last_included_term: input.last_included_term,
                    members: input.members.clone(),
                    data: input.data,
                },
                Instant::now(),
            )
            .map_err(InstallSnapshotError::ServerIoError)?;
        self.wal
            .install_snapshot(input.last_included_term, input.last_included_index)
            .map_err(InstallSnapshotError::ServerIoError)?;
        self.cluster_tracker
            .restore(input.last_included_index, input.members.clone())
            .map_err(InstallSnapshotError::ServerIoError)?;
        // A change in the kept suffix may still be pending.
        self.refresh_pending_membership();

        slog::info!(
            self.logger,
            "Installed snapshot from {:?} through {:?} (term {:?}) with {} members",
            input.leader_id,
            input.last_included_index,
            input.last_included_term,
            input.members.len()
        );

        // The kept suffix may hold committed entries past the snapshot.
        self.apply_committed_entries();

        Ok(InstallSnapshotOutput {})
    }

    /// Take a snapshot at the last applied entry once enough has been applied since the previous
    /// one, then drop the log prefix it covers.
    pub(super) fn maybe_take_snapshot(&mut self) {
        let state_machine = match self.state_machine.as_ref() {
            Some(sm) => sm,
            None => return,
        };
        if !self
            .snapshot_manager
            .should_snapshot(self.wal.applied_since_snapshot(), Instant::now())
        {
            return;
        }
        let last_applied_index = match self.wal.last_applied_index() {
            Some(index) => index,
            None => return,
        };
        let last_included_term = match self.wal.term_at(last_applied_index) {
            Ok(Some(term)) => term,
            Ok(None) => {
                slog::error!(self.logger, "No term for last applied entry {:?}", last_applied_index);
                return;
            }
            Err(e) => {
                slog::error!(self.logger, "Failed to read last applied entry {:?}: {:?}", last_applied_index, e);
                return;
            }
        };

        let snapshot = Snapshot {
            last_included_index: last_applied_index,
            last_included_term,
            members: self.cluster_tracker.members(),
            data: state_machine.generate_snapshot(),
        };
        slog::info!(
            self.logger,
            "Took snapshot through {:?} ({} bytes)",
            last_applied_index,
            snapshot.data.len()
        );
        if let Err(e) = self.snapshot_manager.store(snapshot, Instant::now()) {
            slog::error!(self.logger, "Failed to persist snapshot through {:?}: {:?}", last_applied_index, e);
            return;
        }

        if let Err(e) = self.wal.compact_through(last_applied_index) {
            slog::error!(self.logger, "Failed to compact log through {:?}: {:?}", last_applied_index, e);
        }
    }
}
