use crate::actor;
use crate::replica::election::timers::deadline;
use crate::replica::election::timers::deadline::{DeadlinePusher, DeadlineWatch};
use crate::replica::election::timers::time::{Clock, RealClock};
use crate::replica::FollowerTimeoutTick;
use std::ops::RangeInclusive;
use tokio::time::Duration;

/// ElectionTimerHandle is held by a follower or candidate. While it's alive, the timer task fires
/// a `FollowerTimeoutTick` whenever the randomized election timeout elapses without a reset.
pub(crate) struct ElectionTimerHandle<C: Clock = RealClock> {
    deadline: DeadlinePusher,
    timeout_range: RangeInclusive<Duration>,
    clock: C,
}

struct ElectionTimerTask<C: Clock> {
    deadline: DeadlineWatch,
    actor_client: actor::WeakActorClient,
    tick: FollowerTimeoutTick,
    clock: C,
    // Static wait between two consecutive timeouts fired to the actor, for when the actor keeps
    // us alive without resetting (e.g. a non-voting node that can't campaign).
    timeout_backoff: Duration,
}

impl ElectionTimerHandle {
    pub(crate) fn spawn_timer_task(
        min_timeout: Duration,
        max_timeout: Duration,
        actor_client: actor::WeakActorClient,
        generation: u64,
    ) -> Self {
        let (task, handle) = ElectionTimerTask::new(min_timeout, max_timeout, actor_client, generation, RealClock);
        tokio::task::spawn(task.run());

        handle
    }
}

impl<C: Clock + Send + Sync + 'static> ElectionTimerHandle<C> {
    pub(crate) fn reset_timeout(&self) {
        self.deadline.push(self.clock.jittered_deadline(&self.timeout_range));
    }
}

impl<C: Clock + Send + Sync + 'static> ElectionTimerTask<C> {
    fn new(
        min_timeout: Duration,
        max_timeout: Duration,
        actor_client: actor::WeakActorClient,
        generation: u64,
        clock: C,
    ) -> (Self, ElectionTimerHandle<C>) {
        let (pusher, watch) = deadline::new();

        let task = ElectionTimerTask {
            deadline: watch,
            actor_client,
            tick: FollowerTimeoutTick { generation },
            clock: clock.clone(),
            timeout_backoff: min_timeout,
        };
        let handle = ElectionTimerHandle {
            deadline: pusher,
            timeout_range: RangeInclusive::new(min_timeout, max_timeout),
            clock,
        };

        // Timer task must have a timeout value present when it starts, otherwise it may
        // trigger a timeout immediately after we become a follower.
        handle.reset_timeout();

        (task, handle)
    }

    async fn run(mut self) {
        loop {
            match self.deadline.poll() {
                // We've heard from the leader (or just started), so sleep until the next
                // possible timeout.
                deadline::Poll::Sleep(wake_time) => self.clock.sleep_until(wake_time).await,
                // We slept until the deadline and nobody pushed it back. The actor drops ticks
                // from an older generation, so a tick racing with a role change is harmless.
                deadline::Poll::Elapsed => {
                    if self.actor_client.follower_timeout(self.tick).await.is_err() {
                        return;
                    }
                    self.clock.sleep(self.timeout_backoff).await;
                }
                // The handle dropped: we left the role this timer was armed for.
                deadline::Poll::Closed => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorClient;
    use crate::replica::election::timers::test_utils::FakeActorQueue;
    use crate::replica::election::timers::time;

    #[tokio::test]
    async fn reset_pushes_timeout_back() {
        let timeout = Duration::from_millis(100);
        let (strong_actor_client, rx) = ActorClient::new(10);
        let mut actor = FakeActorQueue::new(rx);
        let (mock_clock, mut mock_clock_controller) = time::mocked_clock();

        // We are not testing jitter, so min == max.
        let (timer_task, timer_handle) =
            ElectionTimerTask::new(timeout, timeout, strong_actor_client.weak(), 7, mock_clock);
        tokio::task::spawn(timer_task.run());
        actor.expect_quiet().await;

        for _ in 0..5 {
            mock_clock_controller.advance(timeout / 2);
            timer_handle.reset_timeout();
        }
        actor.expect_quiet().await;
        assert_eq!(mock_clock_controller.elapsed_time(), timeout * 5 / 2);

        // Last reset was at T=2.5, so nothing before T=3.5.
        let one_ns = Duration::from_nanos(1);
        mock_clock_controller.advance(timeout - one_ns);
        actor.expect_quiet().await;

        // The tick carries the generation the timer was armed for.
        mock_clock_controller.advance(one_ns);
        actor.expect_election_timeout(7).await;
    }

    #[tokio::test]
    async fn keeps_firing_until_reset() {
        let timeout = Duration::from_millis(100);
        let (strong_actor_client, rx) = ActorClient::new(10);
        let mut actor = FakeActorQueue::new(rx);
        let (mock_clock, mut mock_clock_controller) = time::mocked_clock();

        let (timer_task, timer_handle) =
            ElectionTimerTask::new(timeout, timeout, strong_actor_client.weak(), 1, mock_clock);
        tokio::task::spawn(timer_task.run());

        mock_clock_controller.advance(timeout);
        actor.expect_election_timeout(1).await;
        actor.expect_quiet().await;

        // Nobody reset us, so after the backoff we fire again.
        mock_clock_controller.advance(timeout);
        actor.expect_election_timeout(1).await;

        // A reset queued behind a timeout in the actor is fine, the task lives on.
        timer_handle.reset_timeout();
        for _ in 0..5 {
            mock_clock_controller.advance(timeout / 2);
            timer_handle.reset_timeout();
        }
        actor.expect_quiet().await;
    }

    #[tokio::test]
    async fn task_exits_when_handle_drops() {
        let timeout = Duration::from_millis(100);
        let (strong_actor_client, rx) = ActorClient::new(10);
        let mut actor = FakeActorQueue::new(rx);
        let (mock_clock, mut mock_clock_controller) = time::mocked_clock();

        let (timer_task, timer_handle) =
            ElectionTimerTask::new(timeout, timeout, strong_actor_client.weak(), 1, mock_clock);
        let task_join_handle = tokio::task::spawn(timer_task.run());
        drop(timer_handle);

        // Past the point where it would have fired.
        mock_clock_controller.advance(timeout * 2);
        task_join_handle.await.unwrap();
        actor.expect_quiet().await;
    }

    #[tokio::test]
    async fn task_exits_when_actor_is_gone() {
        let timeout = Duration::from_millis(100);
        let (strong_actor_client, rx) = ActorClient::new(10);
        let weak = strong_actor_client.weak();
        drop(strong_actor_client);
        drop(rx);
        let (mock_clock, mut mock_clock_controller) = time::mocked_clock();

        let (timer_task, _timer_handle) = ElectionTimerTask::new(timeout, timeout, weak, 1, mock_clock);
        let task_join_handle = tokio::task::spawn(timer_task.run());

        mock_clock_controller.advance(timeout);
        tokio::time::timeout(Duration::from_secs(5), task_join_handle)
            .await
            .expect("timer task should exit")
            .unwrap();
    }
}
