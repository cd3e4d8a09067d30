use crate::commitlog;
use crate::commitlog::Index;
use crate::replica::local_state::Term;
use crate::replica::write_ahead_log::listeners::{EntryListeners, EntryOutcome};
use crate::replica::{EntryAbandoned, StateMachineOutput, WriteAheadLogEntry};
use std::cmp;
use std::io;
use tokio::sync::oneshot;

/// WriteAheadLog is the raft-specific log facade.
///
/// Note: A log entry has 3 states (not modeled directly in code):
/// 1. Persisted - written to disk, not yet replicated to majority
/// 2. Committed - written to disk, replicated to majority
/// 3. Applied - a committed entry that has also been applied to the state machine
///
/// A log entry's state has no global truth. Each replica will have their own local view of what
/// state the log entry is in.
///
/// Entries at or below the snapshot boundary have been compacted away. The boundary's term is
/// still known, which is all the consistency check in AppendEntries ever needs from them.
pub(crate) struct WriteAheadLog<L>
where
    L: commitlog::Log<WriteAheadLogEntry>,
{
    // Application's info/debug log.
    logger: slog::Logger,

    // This is the log that we're replicating.
    log: L,
    // Metadata about the highest log entry still held in `log`. It must be updated atomically.
    latest_entry_metadata: Option<(Term, Index)>,
    // Last (term, index) covered by the most recent snapshot. None until the first snapshot.
    snapshot_boundary: Option<(Term, Index)>,

    // Index of highest log entry known to be committed. None if nothing is committed.
    commit_index: Option<Index>,
    // Index of highest log entry applied to state machine. None if nothing is applied.
    last_applied_index: Option<Index>,

    // Callers waiting for their entry to be applied.
    listeners: EntryListeners,
}

impl<L> WriteAheadLog<L>
where
    L: commitlog::Log<WriteAheadLogEntry>,
{
    /// Picks up wherever `log` left off. `snapshot_boundary` is the (term, index) of the latest
    /// persisted snapshot, if any. Everything through it counts as committed and applied; entries
    /// after it are applied again once the leader tells us they're committed.
    pub(crate) fn new(
        logger: slog::Logger,
        mut log: L,
        snapshot_boundary: Option<(Term, Index)>,
    ) -> Result<Self, io::Error> {
        match snapshot_boundary {
            Some((boundary_term, boundary_index)) => {
                if log.first_index() > boundary_index.plus(1) {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!(
                            "log starts at {:?}, past the snapshot through {:?}",
                            log.first_index(),
                            boundary_index
                        ),
                    ));
                }
                // We may have crashed between persisting a snapshot and trimming the log it
                // covers. Finish the job, dropping a suffix that doesn't follow the snapshot.
                let held_term = log.read(boundary_index)?.map(|entry| entry.term);
                if matches!(held_term, Some(term) if term != boundary_term) {
                    log.truncate(boundary_index.plus(1))?;
                }
                log.discard_through(boundary_index)?;
            }
            None if log.first_index() != Index::start_index() => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("log starts at {:?} but there's no snapshot", log.first_index()),
                ));
            }
            None => {}
        }

        let latest_entry_metadata = match log.next_index().checked_minus(1) {
            Some(last_index) if last_index >= log.first_index() => match log.read(last_index)? {
                Some(entry) => Some((entry.term, last_index)),
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("last log entry {:?} is missing", last_index),
                    ))
                }
            },
            _ => None,
        };
        let recovered_through = snapshot_boundary.map(|(_, index)| index);

        if let Some((term, index)) = latest_entry_metadata {
            slog::info!(logger, "Recovered log through {:?} (term {:?})", index, term);
        }

        Ok(WriteAheadLog {
            logger,
            log,
            latest_entry_metadata,
            snapshot_boundary,
            commit_index: recovered_through,
            last_applied_index: recovered_through,
            listeners: EntryListeners::new(),
        })
    }

    /// (term, index) of the last entry in the log, counting the snapshot boundary as an entry.
    pub(crate) fn latest_entry(&self) -> Option<(Term, Index)> {
        self.latest_entry_metadata.or(self.snapshot_boundary)
    }

    pub(crate) fn last_index(&self) -> Option<Index> {
        self.latest_entry().map(|(_, index)| index)
    }

    pub(crate) fn snapshot_boundary(&self) -> Option<(Term, Index)> {
        self.snapshot_boundary
    }

    /// True if the entry at `index` was discarded by compaction, meaning the only way to hand it
    /// to a peer is via InstallSnapshot.
    pub(crate) fn is_compacted(&self, index: Index) -> bool {
        matches!(self.snapshot_boundary, Some((_, boundary)) if index <= boundary)
    }

    pub(crate) fn read(&self, index: Index) -> Result<Option<WriteAheadLogEntry>, io::Error> {
        self.log.read(index)
    }

    fn read_required(&self, index: Index) -> Result<WriteAheadLogEntry, io::Error> {
        match self.read(index)? {
            Some(entry) => Ok(entry),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("expected log entry at index {:?}", index),
            )),
        }
    }

    /// Read at most `max` consecutive entries starting at `start`.
    pub(crate) fn read_from(&self, start: Index, max: usize) -> Result<Vec<WriteAheadLogEntry>, io::Error> {
        let mut entries = Vec::new();
        let mut index = start;
        while entries.len() < max {
            match self.read(index)? {
                Some(entry) => entries.push(entry),
                None => break,
            }
            index = index.plus(1);
        }

        Ok(entries)
    }

    /// Term of the entry at `index`. Also answers for the snapshot boundary. None if we don't have
    /// the entry, or if it's compacted below the boundary.
    pub(crate) fn term_at(&self, index: Index) -> Result<Option<Term>, io::Error> {
        if let Some((boundary_term, boundary_index)) = self.snapshot_boundary {
            if index == boundary_index {
                return Ok(Some(boundary_term));
            }
        }

        Ok(self.read(index)?.map(|entry| entry.term))
    }

    /// Remove anything starting at `index` and later. Committed entries are immutable, so asking
    /// to truncate one is a bug somewhere in the cluster, and we refuse.
    pub(crate) fn truncate(&mut self, index: Index) -> Result<(), io::Error> {
        if matches!(self.commit_index, Some(ci) if index <= ci) {
            slog::crit!(
                self.logger,
                "Refusing to truncate log at {:?}, which is at or below commit index {:?}",
                index,
                self.commit_index
            );
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "attempted to truncate committed log entries",
            ));
        }

        let mut new_latest_entry_metadata = None;
        if let Some(new_latest_entry_index) = index.checked_minus(1) {
            new_latest_entry_metadata = self
                .read(new_latest_entry_index)?
                .map(|latest_entry| (latest_entry.term, new_latest_entry_index));
        }

        self.log.truncate(index)?;
        self.latest_entry_metadata = new_latest_entry_metadata;
        self.listeners.abandon_from(index);
        Ok(())
    }

    pub(crate) fn append(&mut self, entry: WriteAheadLogEntry) -> Result<Index, io::Error> {
        let appended_term = entry.term;
        let appended_index = self.log.append(entry)?;
        // Only update state after log action completes.
        self.latest_entry_metadata = Some((appended_term, appended_index));

        Ok(appended_index)
    }

    pub(crate) fn commit_index(&self) -> Option<Index> {
        self.commit_index
    }

    pub(crate) fn last_applied_index(&self) -> Option<Index> {
        self.last_applied_index
    }

    /// Leader path.
    ///
    /// > If there exists an N such that N > commitIndex, a majority
    /// > of matchIndex[i] ≥ N, and log[N].term == currentTerm:
    /// > set commitIndex = N (§5.3, §5.4).
    ///
    /// Returns true if the commit index moved.
    pub(crate) fn ratchet_fwd_commit_index_if_valid(
        &mut self,
        tentative_new_commit_index: Index,
        current_term: Term,
    ) -> Result<bool, io::Error> {
        if !self.is_ahead_of_commit_index(tentative_new_commit_index) {
            return Ok(false);
        }

        match self.term_at(tentative_new_commit_index)? {
            Some(term) if term == current_term => Ok(self.ratchet_fwd_commit_index(tentative_new_commit_index)),
            // Entry from an older term. It will be committed indirectly once an entry from our
            // term on top of it reaches majority.
            _ => Ok(false),
        }
    }

    /// Follower path. Silently ignores anything not beyond the current commit index.
    ///
    /// Returns true if the commit index moved.
    pub(crate) fn ratchet_fwd_commit_index(&mut self, new_commit_index: Index) -> bool {
        if !self.is_ahead_of_commit_index(new_commit_index) {
            return false;
        }

        // Assert we only mark as committed if we have the entry locally.
        let latest_locally_written_index = self
            .last_index()
            .expect("Can't ratchet commit index forward if we don't have any local logs");
        assert!(
            latest_locally_written_index >= new_commit_index,
            "Can't ratchet commit index forwards past our local log. Expected [latest log] {:?} >= {:?} [input]",
            latest_locally_written_index,
            new_commit_index,
        );

        self.commit_index.replace(new_commit_index);
        true
    }

    fn is_ahead_of_commit_index(&self, index: Index) -> bool {
        match self.commit_index {
            None => true,
            Some(current) => index > current,
        }
    }

    /// Returns the next committed-but-unapplied entry, if any. The apply loop must call
    /// `mark_applied()` once it has handled it.
    pub(crate) fn next_entry_to_apply(&self) -> Result<Option<(Index, WriteAheadLogEntry)>, io::Error> {
        let commit_index = match self.commit_index {
            Some(ci) => ci,
            None => return Ok(None),
        };

        let next_index = match self.last_applied_index {
            None => Index::start_index(),
            Some(applied) if applied < commit_index => applied.plus(1),
            Some(_) => return Ok(None),
        };

        let entry = self.read_required(next_index)?;
        Ok(Some((next_index, entry)))
    }

    pub(crate) fn mark_applied(&mut self, index: Index, term: Term, output: StateMachineOutput) {
        let expected = self
            .last_applied_index
            .map(|i| i.plus(1))
            .unwrap_or_else(Index::start_index);
        assert_eq!(index, expected, "Entries must be applied in order without gaps.");

        self.last_applied_index.replace(index);
        self.listeners.resolve(index, term, output);
    }

    pub(crate) fn register_listener(&mut self, index: Index, term: Term) -> oneshot::Receiver<EntryOutcome> {
        self.listeners.register(index, term)
    }

    pub(crate) fn abandon_listeners(&mut self, reason: EntryAbandoned) {
        if self.listeners.len() > 0 {
            slog::info!(self.logger, "Abandoning {} pending entries: {}", self.listeners.len(), reason);
        }
        self.listeners.abandon_all(reason);
    }

    /// Membership entries that haven't been applied yet, in log order. The last one is the
    /// configuration change still in flight.
    pub(crate) fn unapplied_membership_entries(&self) -> Result<Vec<(Index, WriteAheadLogEntry)>, io::Error> {
        let start = match self.last_applied_index {
            Some(applied) => applied.plus(1),
            None => self.log.first_index(),
        };
        let start = cmp::max(start, self.log.first_index());

        let mut found = Vec::new();
        let mut index = start;
        while let Some(entry) = self.read(index)? {
            if entry.kind.is_membership_change() {
                found.push((index, entry));
            }
            index = index.plus(1);
        }

        Ok(found)
    }

    /// Number of entries applied since the last snapshot was taken or installed.
    pub(crate) fn applied_since_snapshot(&self) -> u64 {
        let applied = self.last_applied_index.map(|i| i.as_u64()).unwrap_or(0);
        let boundary = self.snapshot_boundary.map(|(_, i)| i.as_u64()).unwrap_or(0);
        applied.saturating_sub(boundary)
    }

    /// After the state machine produced a snapshot covering everything up to `index`, drop the
    /// log prefix it made redundant.
    pub(crate) fn compact_through(&mut self, index: Index) -> Result<(), io::Error> {
        assert!(
            matches!(self.last_applied_index, Some(applied) if index <= applied),
            "Can only compact applied entries. Index={:?}, Applied={:?}",
            index,
            self.last_applied_index,
        );

        let term = self.term_at(index)?.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no term known for compaction point {:?}", index),
            )
        })?;

        self.log.discard_through(index)?;
        self.snapshot_boundary = Some((term, index));
        if matches!(self.latest_entry_metadata, Some((_, latest)) if latest <= index) {
            self.latest_entry_metadata = None;
        }

        slog::info!(self.logger, "Compacted log through {:?} (term {:?})", index, term);
        Ok(())
    }

    /// Follower path for InstallSnapshot. Keeps any log suffix that provably follows the snapshot
    /// (an entry at `index` with the same term); otherwise drops the whole log.
    pub(crate) fn install_snapshot(&mut self, term: Term, index: Index) -> Result<(), io::Error> {
        let suffix_matches = self.read(index)?.map(|e| e.term) == Some(term);

        // Truncate before discarding: if we crash in between, reopening still sees the entry at
        // `index` and knows whether the suffix belongs.
        if !suffix_matches {
            // Whatever follows is from a diverging history.
            self.log.truncate(index.plus(1))?;
            self.latest_entry_metadata = None;
            self.listeners.abandon_from(index.plus(1));
        }
        self.log.discard_through(index)?;
        if matches!(self.latest_entry_metadata, Some((_, latest)) if latest <= index) {
            self.latest_entry_metadata = None;
        }

        self.snapshot_boundary = Some((term, index));
        if self.is_ahead_of_commit_index(index) {
            self.commit_index.replace(index);
        }
        if !matches!(self.last_applied_index, Some(applied) if applied >= index) {
            self.last_applied_index.replace(index);
        }

        slog::info!(
            self.logger,
            "Installed snapshot at {:?} (term {:?}), kept suffix: {}",
            index,
            term,
            suffix_matches
        );
        Ok(())
    }
}
