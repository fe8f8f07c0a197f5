use crate::actor;
use crate::clock::{Clock, RealClock};
use crate::replica::election::timers::wake_time::WakeTime;
use rand::Rng;
use std::ops::RangeInclusive;
use std::sync::{Arc, Weak};
use tokio::time::Duration;

/// Held by followers and candidates. The replica calls an election once the handle goes a random
/// timeout without being reset. Dropping the handle stops the task.
pub(crate) struct ElectionTimerHandle<C: Clock = RealClock> {
    shared: Arc<Shared<C>>,
}

struct Shared<C: Clock> {
    next_wake_time: WakeTime,
    timeout_range: RangeInclusive<Duration>,
    clock: C,
}

struct ElectionTimerTask<C: Clock> {
    weak_shared: Weak<Shared<C>>,
    next_wake_time: WakeTime,
    actor_client: actor::WeakActorClient,
    clock: C,
    // Pause between repeated timeouts while the replica keeps ignoring them, e.g. when the
    // timeout event raced with a heartbeat.
    timeout_backoff: Duration,
}

impl ElectionTimerHandle {
    pub(crate) fn spawn_timer_task(
        min_timeout: Duration,
        max_timeout: Duration,
        actor_client: actor::WeakActorClient,
    ) -> Self {
        let (task, handle) = ElectionTimerTask::new(min_timeout, max_timeout, actor_client, RealClock);
        tokio::task::spawn(task.run());

        handle
    }
}

impl<C: Clock> ElectionTimerHandle<C> {
    pub(crate) fn reset_timeout(&self) {
        self.shared.reset_timeout();
    }
}

impl<C: Clock> Shared<C> {
    fn reset_timeout(&self) {
        let rand_timeout = rand::thread_rng().gen_range(self.timeout_range.clone());
        self.next_wake_time.replace(self.clock.now() + rand_timeout);
    }
}

impl<C: Clock> ElectionTimerTask<C> {
    fn new(
        min_timeout: Duration,
        max_timeout: Duration,
        actor_client: actor::WeakActorClient,
        clock: C,
    ) -> (Self, ElectionTimerHandle<C>) {
        let next_wake_time = WakeTime::new();
        let shared = Arc::new(Shared {
            next_wake_time: next_wake_time.clone(),
            timeout_range: RangeInclusive::new(min_timeout, max_timeout),
            clock: clock.clone(),
        });

        // The task must find a wake time on its first iteration, otherwise it would time out
        // immediately.
        shared.reset_timeout();

        let task = ElectionTimerTask {
            weak_shared: Arc::downgrade(&shared),
            next_wake_time,
            actor_client,
            clock,
            timeout_backoff: min_timeout,
        };

        (task, ElectionTimerHandle { shared })
    }

    fn handle_dropped(&self) -> bool {
        self.weak_shared.strong_count() == 0
    }

    async fn run(mut self) {
        loop {
            match self.next_wake_time.take() {
                Some(wake_time) => {
                    self.clock.sleep_until(wake_time).await;
                }
                None => {
                    // Nobody reset the timeout while we slept. Keep firing until the handle is
                    // dropped, in case the replica stayed a follower after a racing heartbeat.
                    if self.handle_dropped() {
                        return;
                    }
                    self.actor_client.election_timeout().await;
                    self.clock.sleep(self.timeout_backoff).await;
                }
            }

            if self.handle_dropped() {
                return;
            }
        }
    }
}
