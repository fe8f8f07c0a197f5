use std::sync::{Arc, Mutex};
use tokio::time::Instant;

/// The next time a timer task should act. Handles push it forward; the task takes it before
/// sleeping, so an empty slot after a sleep means nobody pushed it since.
#[derive(Clone, Default)]
pub(super) struct WakeTime {
    data: Arc<Mutex<Option<Instant>>>,
}

impl WakeTime {
    pub(super) fn new() -> Self {
        WakeTime::default()
    }

    pub(super) fn replace(&self, wake_time: Instant) {
        self.data
            .lock()
            .expect("WakeTime.replace() mutex guard poison")
            .replace(wake_time);
    }

    pub(super) fn take(&self) -> Option<Instant> {
        self.data.lock().expect("WakeTime.take() mutex guard poison").take()
    }
}
