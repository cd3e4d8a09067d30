use crate::replica::{RoleStateChangeListener, RoleStateSnapshot};

/// An event that happened, as observed by the local raft replica.
#[derive(Clone, Debug, PartialEq)]
pub enum RaftEvent {
    /// The replica changed role, term or known leader. Consuming this event type is subtle. It
    /// doesn't queue intermediate events. If there are multiple events between when application
    /// awaits the next event, those events will be clobbered into only the most recent event.
    Role(RoleStateSnapshot),
}

pub struct RaftEventListener {
    role_state_change_listener: RoleStateChangeListener,
}

impl RaftEventListener {
    pub(crate) fn new(role_state_change_listener: RoleStateChangeListener) -> Self {
        RaftEventListener {
            role_state_change_listener,
        }
    }

    /// `next_event()` returns the next event that this local raft replica observes. Returns
    /// `None` once the replica has shut down.
    pub async fn next_event(&mut self) -> Option<RaftEvent> {
        self.role_state_change_listener.next().await.map(RaftEvent::Role)
    }

    /// The most recent role state, without waiting.
    pub fn current(&self) -> RoleStateSnapshot {
        self.role_state_change_listener.current()
    }
}
