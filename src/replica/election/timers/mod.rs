mod election_timer;
mod heartbeat_timer;
mod wake_time;

pub(super) use election_timer::ElectionTimerHandle;
pub(super) use heartbeat_timer::HeartbeatTimerHandle;
