#[cfg(test)]
use tokio::sync::watch;
use tokio::time::{Duration, Instant};

/// Monotonic clock used by timers, commit deadlines and retry backoff. Tests swap in
/// [`MockClock`] to drive time by hand.
#[async_trait::async_trait]
pub trait Clock: Clone + Send + Sync + 'static {
    fn now(&self) -> Instant;
    async fn sleep_until(&mut self, deadline: Instant);

    async fn sleep(&mut self, duration: Duration) {
        let deadline = self.now() + duration;
        self.sleep_until(deadline).await;
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct RealClock;

#[async_trait::async_trait]
impl Clock for RealClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now()
    }

    async fn sleep_until(&mut self, deadline: Instant) {
        tokio::time::sleep_until(deadline).await;
    }
}

/// Wall clock time in milliseconds since the unix epoch. Only the leader reads this, when it
/// stamps a mutation; replicas apply the stamped value.
pub fn wall_clock_millis() -> u64 {
    let millis = chrono::Utc::now().timestamp_millis();
    if millis < 0 {
        0
    } else {
        millis as u64
    }
}

/// Clock that only moves when its controller says so.
#[cfg(test)]
pub(crate) fn mocked_clock() -> (MockClock, MockClockController) {
    let started_at = Instant::now();
    let (now_tx, now_rx) = watch::channel(started_at);

    (MockClock { now: now_rx }, MockClockController { now: now_tx, started_at })
}

#[cfg(test)]
#[derive(Clone)]
pub(crate) struct MockClock {
    now: watch::Receiver<Instant>,
}

#[cfg(test)]
#[async_trait::async_trait]
impl Clock for MockClock {
    fn now(&self) -> Instant {
        *self.now.borrow()
    }

    async fn sleep_until(&mut self, deadline: Instant) {
        while self.now() < deadline {
            if self.now.changed().await.is_err() {
                panic!("MockClockController dropped while a sleeper waits");
            }
        }
    }
}

#[cfg(test)]
pub(crate) struct MockClockController {
    now: watch::Sender<Instant>,
    started_at: Instant,
}

#[cfg(test)]
impl MockClockController {
    pub(crate) fn current_time(&self) -> Instant {
        *self.now.borrow()
    }

    pub(crate) fn elapsed_time(&self) -> Duration {
        self.current_time() - self.started_at
    }

    /// Advance in steps smaller than what the test wants to observe. A sleeper only learns that
    /// `now` is at or past its deadline, not by how much.
    pub(crate) fn advance(&mut self, duration: Duration) {
        let next = self.current_time() + duration;
        // Stored even with no sleepers left, for later `now()` reads.
        self.now.send_replace(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn mock_clock_wakes_sleepers_in_order() {
        let tick = Duration::from_millis(500);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let (mut mock_clock, mut controller) = mocked_clock();
        let start = controller.current_time();

        tokio::spawn(async move {
            let mut next_wake = start;
            for n in 1..=4u32 {
                next_wake += tick;
                mock_clock.sleep_until(next_wake).await;
                tx.send(n).expect("receiver shouldn't drop");
            }
        });

        controller.advance(tick / 2);
        tokio::time::timeout(Duration::from_millis(20), rx.recv())
            .await
            .expect_err("Expected timeout");

        controller.advance(tick);
        assert_eq!(rx.recv().await, Some(1));

        // A big leap releases every sleeper whose deadline passed.
        controller.advance(tick * 3);
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, Some(3));
        assert_eq!(rx.recv().await, Some(4));
        assert_eq!(controller.elapsed_time(), tick * 9 / 2);
    }

    #[test]
    fn wall_clock_is_after_2020() {
        assert!(wall_clock_millis() > 1_577_836_800_000);
    }
}
