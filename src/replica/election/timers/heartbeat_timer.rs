use crate::replica::election::timers::deadline;
use crate::replica::election::timers::deadline::{DeadlinePusher, DeadlineWatch};
use crate::replica::election::timers::time::{Clock, RealClock};
use crate::{actor, replica};
use tokio::time::Duration;

/// HeartbeatTimerHandle is held by the leader, one per replication target. The timer task exits
/// once the handle is dropped.
pub(crate) struct HeartbeatTimerHandle<C: Clock = RealClock> {
    deadline: DeadlinePusher,
    heartbeat_duration: Duration,
    clock: C,
}

struct HeartbeatTimerTask<C: Clock> {
    deadline: DeadlineWatch,
    heartbeat_duration: Duration,
    actor_client: actor::WeakActorClient,
    tick: replica::LeaderTimerTick,
    clock: C,
}

impl HeartbeatTimerHandle {
    pub(crate) fn spawn_timer_task(
        heartbeat_duration: Duration,
        actor_client: actor::WeakActorClient,
        peer_id: replica::ReplicaId,
        term: replica::Term,
    ) -> Self {
        // Add minimal logic in this constructor, as it is untested.
        let (task, handle) = HeartbeatTimerTask::new(heartbeat_duration, actor_client, peer_id, term, RealClock);
        tokio::task::spawn(task.run());

        handle
    }

    /// A handle with no task behind it.
    #[cfg(test)]
    pub(crate) fn inert() -> Self {
        let (deadline, _) = deadline::new();
        HeartbeatTimerHandle {
            deadline,
            heartbeat_duration: Duration::from_secs(3600),
            clock: RealClock,
        }
    }
}

impl<C: Clock + Send + Sync + 'static> HeartbeatTimerHandle<C> {
    /// Push the next periodic heartbeat to one full period from now. Called whenever we send
    /// this peer something anyway.
    pub(crate) fn reset_heartbeat_timer(&self) {
        self.deadline.push(self.clock.now() + self.heartbeat_duration);
    }
}

impl<C: Clock + Send + Sync + 'static> HeartbeatTimerTask<C> {
    fn new(
        heartbeat_duration: Duration,
        actor_client: actor::WeakActorClient,
        peer_id: replica::ReplicaId,
        term: replica::Term,
        clock: C,
    ) -> (Self, HeartbeatTimerHandle<C>) {
        let (pusher, watch) = deadline::new();

        let task = HeartbeatTimerTask {
            deadline: watch,
            heartbeat_duration,
            actor_client,
            tick: replica::LeaderTimerTick { peer_id, term },
            clock: clock.clone(),
        };
        let handle = HeartbeatTimerHandle {
            deadline: pusher,
            heartbeat_duration,
            clock,
        };

        (task, handle)
    }

    async fn run(mut self) {
        // Nothing is pushed at first, so the first poll fires right away. A newly elected leader
        // (or a newly added peer) should hear from us as soon as possible.
        loop {
            match self.deadline.poll() {
                // We sent this peer something recently, so no heartbeat is due until then.
                deadline::Poll::Sleep(wake_time) => self.clock.sleep_until(wake_time).await,
                deadline::Poll::Elapsed => {
                    if self.actor_client.leader_timer(self.tick.clone()).await.is_err() {
                        return;
                    }
                    self.deadline.rearm(self.clock.now() + self.heartbeat_duration);
                }
                // The handle dropped: we are no longer leader in this term, or the peer is gone.
                deadline::Poll::Closed => return,
            }
        }
    }
}
