use crate::api::MutationCommitter;
use crate::automaton::{encode_message, MutationError};
use crate::payloads::{
    ReqAbortTransaction, ReqCommitTransaction, ReqGetTransaction, ReqPrepareTransactionCommit, ReqStartTransaction,
    RspGetTransaction,
};
use crate::replica::{CommitMutationError, MutationResponse, QueryError};
use crate::transaction_supervisor::timestamp::MonotonicTimestampProvider;
use crate::transaction_supervisor::transaction::TransactionState;
use crate::transaction_supervisor::transaction_manager::{
    ABORT_TRANSACTION, COMMIT_TRANSACTION, GET_TRANSACTION, PREPARE_TRANSACTION_COMMIT, START_TRANSACTION,
};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum TransactionSupervisorError {
    #[error("Mutation did not commit: {0}")]
    Commit(#[from] CommitMutationError),
    /// The transaction manager refused the request; `code` is one of the transaction error codes.
    #[error("Transaction request failed: {0}")]
    Transaction(MutationError),
    #[error("Query failed: {0}")]
    Query(#[from] QueryError),
    #[error("Malformed response: {0}")]
    MalformedResponse(String),
}

/// Drives prepare/commit/abort through the cell's log and re-raises whatever error the applied
/// mutation carried back.
pub struct TransactionSupervisor {
    logger: slog::Logger,
    committer: Arc<dyn MutationCommitter>,
    timestamp_provider: Arc<MonotonicTimestampProvider>,
}

impl TransactionSupervisor {
    pub fn new(
        logger: slog::Logger,
        committer: Arc<dyn MutationCommitter>,
        timestamp_provider: Arc<MonotonicTimestampProvider>,
    ) -> Self {
        TransactionSupervisor {
            logger,
            committer,
            timestamp_provider,
        }
    }

    pub fn generate_timestamp(&self) -> u64 {
        self.timestamp_provider.generate_timestamp()
    }

    /// Returns the start timestamp.
    pub async fn start_transaction(&self, transaction_id: &str) -> Result<u64, TransactionSupervisorError> {
        let start_timestamp = self.generate_timestamp();
        let request = ReqStartTransaction {
            transaction_id: transaction_id.to_string(),
            start_timestamp,
        };
        let response = self
            .committer
            .commit_mutation(START_TRANSACTION, encode_message(&request))
            .await?;
        recover_error_from_mutation_response(response)?;
        Ok(start_timestamp)
    }

    /// A non-persistent prepare runs once on the leader's state and is never retried: it skips
    /// the log, so a replay could apply it twice.
    pub async fn prepare_transaction_commit(
        &self,
        transaction_id: &str,
        persistent: bool,
        prepare_timestamp: u64,
    ) -> Result<(), TransactionSupervisorError> {
        let request = ReqPrepareTransactionCommit {
            transaction_id: transaction_id.to_string(),
            persistent,
            prepare_timestamp,
        };
        slog::debug!(self.logger, "Preparing"; "TransactionId" => transaction_id, "Persistent" => persistent);

        if !persistent {
            return self
                .committer
                .execute_transient(PREPARE_TRANSACTION_COMMIT, encode_message(&request))
                .await?
                .map(|_| ())
                .map_err(TransactionSupervisorError::Transaction);
        }

        let response = self
            .committer
            .commit_mutation(PREPARE_TRANSACTION_COMMIT, encode_message(&request))
            .await?;
        recover_error_from_mutation_response(response)
    }

    pub async fn commit_transaction(
        &self,
        transaction_id: &str,
        commit_timestamp: u64,
    ) -> Result<(), TransactionSupervisorError> {
        let request = ReqCommitTransaction {
            transaction_id: transaction_id.to_string(),
            commit_timestamp,
        };
        let response = self
            .committer
            .commit_mutation(COMMIT_TRANSACTION, encode_message(&request))
            .await?;
        recover_error_from_mutation_response(response)
    }

    pub async fn abort_transaction(&self, transaction_id: &str, force: bool) -> Result<(), TransactionSupervisorError> {
        let request = ReqAbortTransaction {
            transaction_id: transaction_id.to_string(),
            force,
        };
        let response = self
            .committer
            .commit_mutation(ABORT_TRANSACTION, encode_message(&request))
            .await?;
        recover_error_from_mutation_response(response)
    }

    /// State as seen by the replica serving the query.
    pub async fn transaction_state(
        &self,
        transaction_id: &str,
    ) -> Result<Option<TransactionState>, TransactionSupervisorError> {
        let request = ReqGetTransaction {
            transaction_id: transaction_id.to_string(),
        };
        let bytes = self
            .committer
            .query(GET_TRANSACTION, encode_message(&request))
            .await?;
        let response: RspGetTransaction = prost::Message::decode(bytes.as_slice())
            .map_err(|e: prost::DecodeError| TransactionSupervisorError::MalformedResponse(e.to_string()))?;

        match response.transaction {
            Some(record) if response.found => TransactionState::from_u32(record.state)
                .map(Some)
                .ok_or_else(|| TransactionSupervisorError::MalformedResponse(format!("state {}", record.state))),
            _ => Ok(None),
        }
    }
}

fn recover_error_from_mutation_response(response: MutationResponse) -> Result<(), TransactionSupervisorError> {
    response
        .result
        .map(|_| ())
        .map_err(TransactionSupervisorError::Transaction)
}
