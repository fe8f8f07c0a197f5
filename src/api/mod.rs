//! Client-facing API of a cell: construction, options and the proposal interface the other
//! subsystems build on.
mod cell;
mod committer;
mod heartbeat_gate;
mod options;

pub use cell::try_create_hydra_cell;
pub use cell::CellCreationError;
pub use cell::HydraCell;
pub use cell::HydraCellConfig;
pub use committer::MutationCommitter;
pub use heartbeat_gate::HeartbeatError;
pub use heartbeat_gate::HeartbeatGate;
pub use options::HydraOptions;

#[cfg(test)]
pub(crate) use committer::test_utils;
