use crate::replica::{LeaderRedirectInfo, Term};
use tokio::sync::watch;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Role {
    Leader,
    Candidate,
    Follower,
}

/// RoleStateSnapshot is an immutable view of the replica's role at some point in time.
#[derive(Clone, Debug, PartialEq)]
pub struct RoleStateSnapshot {
    pub role: Role,
    pub term: Term,
    /// Known leader. For a leader, this is itself.
    pub leader: Option<LeaderRedirectInfo>,
}

pub(super) fn new(initial_state: RoleStateSnapshot) -> (RoleStateChangeNotifier, RoleStateChangeListener) {
    let (snd, rcv) = watch::channel(initial_state);

    (RoleStateChangeNotifier { snd }, RoleStateChangeListener { rcv })
}

pub(super) struct RoleStateChangeNotifier {
    snd: watch::Sender<RoleStateSnapshot>,
}

impl RoleStateChangeNotifier {
    pub(super) fn notify_new_state(&self, new_state: RoleStateSnapshot) {
        // Skip no-op notifications so listeners only wake up on real changes.
        if *self.snd.borrow() == new_state {
            return;
        }
        let _ = self.snd.send(new_state);
    }
}

#[derive(Clone)]
pub(crate) struct RoleStateChangeListener {
    rcv: watch::Receiver<RoleStateSnapshot>,
}

impl RoleStateChangeListener {
    /// Waits for the next change. Intermediate states between two calls are clobbered into the
    /// most recent one. Returns None once the replica is gone.
    pub(crate) async fn next(&mut self) -> Option<RoleStateSnapshot> {
        match self.rcv.changed().await {
            Ok(_) => Some(self.rcv.borrow().clone()),
            Err(_) => None,
        }
    }

    pub(crate) fn current(&self) -> RoleStateSnapshot {
        self.rcv.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn listener_sees_latest_state_only() {
        let follower = RoleStateSnapshot {
            role: Role::Follower,
            term: Term::new(0),
            leader: None,
        };
        let (notifier, mut listener) = new(follower.clone());
        assert_eq!(listener.current(), follower);

        let candidate = RoleStateSnapshot {
            role: Role::Candidate,
            term: Term::new(1),
            leader: None,
        };
        let leader = RoleStateSnapshot {
            role: Role::Leader,
            term: Term::new(1),
            leader: None,
        };
        notifier.notify_new_state(candidate);
        notifier.notify_new_state(leader.clone());

        assert_eq!(listener.next().await, Some(leader));

        drop(notifier);
        assert_eq!(listener.next().await, None);
    }
}
