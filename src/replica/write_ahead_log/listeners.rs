use crate::commitlog::Index;
use crate::replica::{EntryAbandoned, StateMachineOutput, Term};
use std::collections::BTreeMap;
use tokio::sync::oneshot;

pub type EntryOutcome = Result<StateMachineOutput, EntryAbandoned>;

/// EntryListeners is the table of callers waiting for a specific log entry to be applied. Each
/// waiter is resolved exactly once: either when the entry is applied, or when the replica knows
/// it will never see that entry applied on its behalf (lost leadership, truncation, shutdown).
pub(crate) struct EntryListeners {
    pending: BTreeMap<Index, PendingEntry>,
}

struct PendingEntry {
    // The term the entry was appended in. If a different entry ends up applied at the same index,
    // the waiter's entry was overwritten.
    term: Term,
    callback: oneshot::Sender<EntryOutcome>,
}

impl EntryListeners {
    pub(crate) fn new() -> Self {
        EntryListeners {
            pending: BTreeMap::new(),
        }
    }

    pub(crate) fn register(&mut self, index: Index, term: Term) -> oneshot::Receiver<EntryOutcome> {
        let (tx, rx) = oneshot::channel();
        if let Some(previous) = self.pending.insert(index, PendingEntry { term, callback: tx }) {
            // Only possible if an index got reused without us hearing about the truncation.
            let _ = previous.callback.send(Err(EntryAbandoned::Overwritten));
        }

        rx
    }

    /// Called by the apply loop after applying `index`.
    pub(crate) fn resolve(&mut self, index: Index, applied_term: Term, output: StateMachineOutput) {
        if let Some(pending) = self.pending.remove(&index) {
            let outcome = if pending.term == applied_term {
                Ok(output)
            } else {
                Err(EntryAbandoned::Overwritten)
            };
            // Receiver may have given up waiting. That's fine.
            let _ = pending.callback.send(outcome);
        }
    }

    /// Fails every waiter at `index` or later. Used when the log is truncated.
    pub(crate) fn abandon_from(&mut self, index: Index) {
        let truncated = self.pending.split_off(&index);
        for (_, pending) in truncated {
            let _ = pending.callback.send(Err(EntryAbandoned::Overwritten));
        }
    }

    pub(crate) fn abandon_all(&mut self, reason: EntryAbandoned) {
        let pending = std::mem::take(&mut self.pending);
        for (_, pending) in pending {
            let _ = pending.callback.send(Err(reason.clone()));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}
