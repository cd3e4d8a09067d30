use crate::actor::Event;
use crate::replica::{FollowerTimeoutTick, LeaderTimerTick};
use std::time::Duration;
use tokio::sync::mpsc;

/// FakeActorQueue stands in for the replica actor and asserts on what timers post to it.
pub(super) struct FakeActorQueue {
    rx: mpsc::Receiver<Event>,
}

impl FakeActorQueue {
    pub(super) fn new(rx: mpsc::Receiver<Event>) -> Self {
        FakeActorQueue { rx }
    }

    async fn next(&mut self) -> Event {
        tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .expect("Timed out waiting for a timer event")
            .expect("Actor queue closed")
    }

    pub(super) async fn expect_leader_tick(&mut self, expected: &LeaderTimerTick) {
        match self.next().await {
            Event::LeaderTimer(tick) => assert_eq!(&tick, expected),
            other => panic!("Expected leader tick, got {:?}", other),
        }
    }

    pub(super) async fn expect_election_timeout(&mut self, generation: u64) {
        match self.next().await {
            Event::FollowerTimeout(tick) => assert_eq!(tick, FollowerTimeoutTick { generation }),
            other => panic!("Expected election timeout, got {:?}", other),
        }
    }

    /// Real time passes here, not mock time. It only gives the timer task a chance to run.
    pub(super) async fn expect_quiet(&mut self) {
        if let Ok(event) = tokio::time::timeout(Duration::from_millis(10), self.rx.recv()).await {
            panic!("Expected no event, got {:?}", event);
        }
    }
}
