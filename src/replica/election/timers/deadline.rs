use std::sync::{Arc, Mutex};
use tokio::time::Instant;

/// A timer's deadline, shared by the role state that pushes it back and the task that sleeps on
/// it. Dropping the `DeadlinePusher` closes the slot, which is how the task learns that the role
/// it was armed for is gone.
pub(super) fn new() -> (DeadlinePusher, DeadlineWatch) {
    let slot = Arc::new(Mutex::new(Slot {
        pushed: None,
        closed: false,
    }));

    (DeadlinePusher { slot: slot.clone() }, DeadlineWatch { slot })
}

struct Slot {
    // Latest deadline not yet seen by the task.
    pushed: Option<Instant>,
    closed: bool,
}

#[derive(Debug, PartialEq)]
pub(super) enum Poll {
    /// Someone pushed the deadline back. Sleep until it.
    Sleep(Instant),
    /// Nothing was pushed since we last looked, so the previous deadline is the one that passed.
    Elapsed,
    Closed,
}

pub(super) struct DeadlinePusher {
    slot: Arc<Mutex<Slot>>,
}

impl DeadlinePusher {
    pub(super) fn push(&self, deadline: Instant) {
        lock(&self.slot).pushed = Some(deadline);
    }
}

impl Drop for DeadlinePusher {
    fn drop(&mut self) {
        let mut slot = lock(&self.slot);
        slot.closed = true;
        slot.pushed = None;
    }
}

pub(super) struct DeadlineWatch {
    slot: Arc<Mutex<Slot>>,
}

impl DeadlineWatch {
    pub(super) fn poll(&self) -> Poll {
        let mut slot = lock(&self.slot);
        if slot.closed {
            return Poll::Closed;
        }

        match slot.pushed.take() {
            Some(deadline) => Poll::Sleep(deadline),
            None => Poll::Elapsed,
        }
    }

    /// Re-arm from the task side, e.g. after firing a heartbeat. Does nothing once closed.
    pub(super) fn rearm(&self, deadline: Instant) {
        let mut slot = lock(&self.slot);
        if !slot.closed && slot.pushed.is_none() {
            slot.pushed = Some(deadline);
        }
    }
}

fn lock(slot: &Mutex<Slot>) -> std::sync::MutexGuard<'_, Slot> {
    slot.lock().expect("Deadline mutex poisoned")
}
