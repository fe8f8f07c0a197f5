mod supervisor;
mod timestamp;
mod transaction;
mod transaction_manager;

pub use supervisor::TransactionSupervisor;
pub use supervisor::TransactionSupervisorError;
pub use timestamp::MonotonicTimestampProvider;
pub use transaction::TransactionError;
pub use transaction::TransactionState;
pub use transaction::INVALID_TRANSACTION_STATE;
pub use transaction::NO_SUCH_TRANSACTION;
pub use transaction::STALE_TIMESTAMP;
pub use transaction::TRANSACTION_ALREADY_EXISTS;
pub use transaction_manager::TransactionManager;
pub use transaction_manager::ABORT_TRANSACTION;
pub use transaction_manager::COMMIT_TRANSACTION;
pub use transaction_manager::GET_TRANSACTION;
pub use transaction_manager::PREPARE_TRANSACTION_COMMIT;
pub use transaction_manager::START_TRANSACTION;
