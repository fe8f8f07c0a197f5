use crate::clock::{Clock, RealClock};
use crate::replica::election::timers::wake_time::WakeTime;
use crate::{actor, replica};
use std::sync::{Arc, Weak};
use tokio::time::{Duration, Instant};

/// Held by the leader, one per peer. Ticks ask the replica to replicate to (or heartbeat) that
/// peer when nothing was sent to it for a heartbeat duration.
pub(crate) struct HeartbeatTimerHandle<C: Clock = RealClock> {
    shared: Arc<Shared<C>>,
}

struct Shared<C: Clock> {
    heartbeat_duration: Duration,
    next_heartbeat_time: WakeTime,
    clock: C,
}

struct HeartbeatTimerTask<C: Clock> {
    weak_shared: Weak<Shared<C>>,
    next_heartbeat_time: WakeTime,
    actor_client: actor::WeakActorClient,
    event: replica::HeartbeatTick,
    clock: C,
}

impl HeartbeatTimerHandle {
    pub(crate) fn spawn_timer_task(
        heartbeat_duration: Duration,
        actor_client: actor::WeakActorClient,
        peer_id: replica::ReplicaId,
        term: replica::Term,
    ) -> Self {
        let (task, handle) = HeartbeatTimerTask::new(heartbeat_duration, actor_client, peer_id, term, RealClock);
        tokio::task::spawn(task.run());

        handle
    }
}

impl<C: Clock> HeartbeatTimerHandle<C> {
    /// Something was just sent to the peer; the next tick can wait a full heartbeat duration.
    pub(crate) fn reset_heartbeat_timer(&self) {
        self.shared.reset_heartbeat_timer();
    }
}

impl<C: Clock> Shared<C> {
    fn reset_heartbeat_timer(&self) {
        let new_timeout: Instant = self.clock.now() + self.heartbeat_duration;
        self.next_heartbeat_time.replace(new_timeout);
    }
}

impl<C: Clock> HeartbeatTimerTask<C> {
    fn new(
        heartbeat_duration: Duration,
        actor_client: actor::WeakActorClient,
        peer_id: replica::ReplicaId,
        term: replica::Term,
        clock: C,
    ) -> (Self, HeartbeatTimerHandle<C>) {
        let next_heartbeat_time = WakeTime::new();
        let shared = Arc::new(Shared {
            heartbeat_duration,
            next_heartbeat_time: next_heartbeat_time.clone(),
            clock: clock.clone(),
        });

        let task = HeartbeatTimerTask {
            weak_shared: Arc::downgrade(&shared),
            next_heartbeat_time,
            actor_client,
            event: replica::HeartbeatTick { peer_id, term },
            clock,
        };

        (task, HeartbeatTimerHandle { shared })
    }

    async fn run(mut self) {
        // The slot starts empty, so a new leader ticks right away and asserts itself to the peer.
        loop {
            match self.next_heartbeat_time.take() {
                Some(wake_time) => {
                    self.clock.sleep_until(wake_time).await;
                }
                None => match self.weak_shared.upgrade() {
                    Some(shared) => {
                        self.actor_client.heartbeat_tick(self.event.clone()).await;
                        shared.reset_heartbeat_timer();
                    }
                    // No longer leader of this term.
                    None => return,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::test_utils::TestUtilActor;
    use crate::actor::ActorClient;
    use crate::clock;
    use crate::replica::{HeartbeatTick, ReplicaId, Term};

    fn expected_tick() -> HeartbeatTick {
        HeartbeatTick {
            peer_id: ReplicaId::new("peer-123"),
            term: Term::new(10),
        }
    }

    #[tokio::test]
    async fn heartbeat_timer_lifecycle() {
        // -- setup --
        let heartbeat_duration = Duration::from_millis(100);
        let (strong_actor_client, rx) = ActorClient::new(10);
        let mut actor = TestUtilActor::new(rx);
        let (mock_clock, mut mock_clock_controller) = clock::mocked_clock();

        let (timer_task, timer_handle) = HeartbeatTimerTask::new(
            heartbeat_duration,
            strong_actor_client.weak(),
            ReplicaId::new("peer-123"),
            Term::new(10),
            mock_clock,
        );
        let task_join_handle = tokio::task::spawn(timer_task.run());

        // -- execute & verify --
        // 1. First tick is immediate.
        actor.assert_heartbeat_event(expected_tick()).await;
        actor.assert_no_event().await;

        // 2. One tick per heartbeat duration.
        for _ in 0..5 {
            mock_clock_controller.advance(heartbeat_duration);
            actor.assert_heartbeat_event(expected_tick()).await;
            actor.assert_no_event().await;
        }

        // 3. A big leap still produces a single tick.
        mock_clock_controller.advance(heartbeat_duration * 5);
        actor.assert_heartbeat_event(expected_tick()).await;
        actor.assert_no_event().await;

        // 4. Dropping the handle stops the task.
        drop(timer_handle);
        mock_clock_controller.advance(heartbeat_duration);
        task_join_handle.await.unwrap();
        actor.assert_no_event().await;
    }

    #[tokio::test]
    async fn heartbeat_timer_reset_postpones_tick() {
        let heartbeat_duration = Duration::from_millis(100);
        let (strong_actor_client, rx) = ActorClient::new(10);
        let mut actor = TestUtilActor::new(rx);
        let (mock_clock, mut mock_clock_controller) = clock::mocked_clock();

        let (timer_task, timer_handle) = HeartbeatTimerTask::new(
            heartbeat_duration,
            strong_actor_client.weak(),
            ReplicaId::new("peer-123"),
            Term::new(10),
            mock_clock,
        );
        tokio::task::spawn(timer_task.run());
        actor.assert_heartbeat_event(expected_tick()).await;

        for _ in 0..5 {
            mock_clock_controller.advance(heartbeat_duration / 2);
            timer_handle.reset_heartbeat_timer();
        }
        actor.assert_no_event().await;
        assert_eq!(mock_clock_controller.elapsed_time(), heartbeat_duration * 5 / 2);

        // Due at T=3.5.
        mock_clock_controller.advance(heartbeat_duration / 2);
        actor.assert_no_event().await;
        mock_clock_controller.advance(heartbeat_duration / 2);
        actor.assert_heartbeat_event(expected_tick()).await;
    }
}
