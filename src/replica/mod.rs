mod election;
mod local_state;
mod mutation_log;
mod peer_client;
mod peers;
mod replica;
mod replica_api;

pub use election::ReplicaState;
pub use election::ReplicaStatus;
pub use election::ReplicaStatusListener;
#[cfg(test)]
pub(crate) use election::test_listener;
pub(crate) use local_state::FileLocalState;
pub(crate) use local_state::PersistentLocalState;
pub use local_state::Term;
pub use mutation_log::MutationRecord;
pub use peer_client::PeerConnectError;
pub(crate) use peers::ClusterTracker;
pub use peers::MemberInfo;
pub use peers::ReplicaId;
pub(crate) use replica::Replica;
pub(crate) use replica::ReplicaConfig;
pub(crate) use replica::ReplicaOptions;
pub use replica::ReplicaRecoveryError;
pub use replica::SnapshotThreshold;
pub use replica_api::*;
