mod election_state;
mod leader_state;
mod state_change_listener;
mod timers;

pub(crate) use election_state::CurrentLeader;
pub(crate) use election_state::ElectionConfig;
pub(crate) use election_state::ElectionState;
pub(crate) use leader_state::LeaderStateTracker;
pub(crate) use leader_state::PeerState;
pub(crate) use leader_state::PeerStateUpdate;
pub use state_change_listener::ReplicaState;
pub use state_change_listener::ReplicaStatus;
pub use state_change_listener::ReplicaStatusListener;
#[cfg(test)]
pub(crate) use state_change_listener::test_listener;
