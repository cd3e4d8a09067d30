use rand::Rng;
use std::ops::RangeInclusive;
use tokio::time::{Duration, Instant};

/// Clock is what the timer tasks read time from, so tests can drive them by hand.
#[async_trait::async_trait]
pub(crate) trait Clock: Clone {
    fn now(&self) -> Instant;
    async fn sleep_until(&mut self, deadline: Instant);

    async fn sleep(&mut self, duration: Duration) {
        let deadline = self.now() + duration;
        self.sleep_until(deadline).await;
    }

    /// A deadline picked uniformly from `range` after now. Spreading election timeouts out is
    /// what keeps split votes rare.
    fn jittered_deadline(&self, range: &RangeInclusive<Duration>) -> Instant {
        self.now() + rand::thread_rng().gen_range(range.clone())
    }
}

#[derive(Copy, Clone)]
pub(crate) struct RealClock;

#[async_trait::async_trait]
impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep_until(&mut self, deadline: Instant) {
        tokio::time::sleep_until(deadline).await;
    }
}

#[cfg(test)]
pub(crate) use mock::{mocked_clock, MockClock, MockClockController};

#[cfg(test)]
mod mock {
    use super::Clock;
    use tokio::sync::watch;
    use tokio::time::{Duration, Instant};

    /// A clock that only moves when its controller says so.
    pub(crate) fn mocked_clock() -> (MockClock, MockClockController) {
        let start = Instant::now();
        let (tx, rx) = watch::channel(start);

        (MockClock { now: rx }, MockClockController { now: tx, start })
    }

    #[derive(Clone)]
    pub(crate) struct MockClock {
        now: watch::Receiver<Instant>,
    }

    #[async_trait::async_trait]
    impl Clock for MockClock {
        fn now(&self) -> Instant {
            *self.now.borrow()
        }

        async fn sleep_until(&mut self, deadline: Instant) {
            while *self.now.borrow_and_update() < deadline {
                if self.now.changed().await.is_err() {
                    // Controller is gone, time will never reach the deadline.
                    std::future::pending::<()>().await;
                }
            }
        }
    }

    pub(crate) struct MockClockController {
        now: watch::Sender<Instant>,
        start: Instant,
    }

    impl MockClockController {
        pub(crate) fn elapsed_time(&self) -> Duration {
            *self.now.borrow() - self.start
        }

        /// Sleepers only promise to wake at or after their deadline. Advance in steps smaller
        /// than what the test wants to observe, or several deadlines collapse into one wakeup.
        pub(crate) fn advance(&mut self, duration: Duration) {
            let next = *self.now.borrow() + duration;
            let _ = self.now.send(next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_sleep_wakes_only_at_deadline() {
        let (mut clock, mut controller) = mocked_clock();
        let deadline = clock.now() + Duration::from_millis(100);

        let sleeper = tokio::spawn(async move {
            clock.sleep_until(deadline).await;
            clock.now()
        });

        controller.advance(Duration::from_millis(60));
        tokio::task::yield_now().await;
        assert!(!sleeper.is_finished());

        controller.advance(Duration::from_millis(60));
        let woke_at = tokio::time::timeout(Duration::from_secs(5), sleeper)
            .await
            .expect("sleeper should wake")
            .unwrap();
        assert_eq!(woke_at, deadline + Duration::from_millis(20));
        assert_eq!(controller.elapsed_time(), Duration::from_millis(120));
    }

    #[test]
    fn jitter_stays_in_range() {
        let clock = RealClock;
        let range = Duration::from_millis(150)..=Duration::from_millis(300);
        for _ in 0..100 {
            let now = clock.now();
            let deadline = clock.jittered_deadline(&range);
            assert!(deadline >= now + *range.start());
            assert!(deadline <= Instant::now() + *range.end());
        }
    }
}
