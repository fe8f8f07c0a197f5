//! The consensus-facing view of the mutation log, on top of the storage-level `commitlog`.

mod log;
mod record;

pub use record::MutationRecord;

pub(crate) use log::MutationLog;
pub(crate) use record::NO_OP_MUTATION_TYPE;
