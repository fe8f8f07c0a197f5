use crate::automaton::{decode_payload, encode_message, AutomatonPart, HandlerError, MutationContext};
use crate::payloads::{
    ReqAbortTransaction, ReqCommitTransaction, ReqGetTransaction, ReqPrepareTransactionCommit, ReqStartTransaction,
    RspGetTransaction, TransactionManagerSnapshot,
};
use crate::transaction_supervisor::transaction::{Transaction, TransactionError};
use std::collections::BTreeMap;

pub const START_TRANSACTION: &str = "transaction.start";
pub const PREPARE_TRANSACTION_COMMIT: &str = "transaction.prepare";
pub const COMMIT_TRANSACTION: &str = "transaction.commit";
pub const ABORT_TRANSACTION: &str = "transaction.abort";
pub const GET_TRANSACTION: &str = "transaction.get";

/// Automaton part owning every transaction of the cell. Finished transactions stay around so
/// that repeated commits and aborts resolve as no-ops.
pub struct TransactionManager {
    logger: slog::Logger,
    transactions: BTreeMap<String, Transaction>,
}

impl TransactionManager {
    pub fn new(logger: slog::Logger) -> Self {
        TransactionManager {
            logger,
            transactions: BTreeMap::new(),
        }
    }

    fn start(&mut self, request: ReqStartTransaction) -> Result<(), TransactionError> {
        if self.transactions.contains_key(&request.transaction_id) {
            return Err(TransactionError::AlreadyExists(request.transaction_id));
        }
        let transaction = Transaction::new(request.transaction_id.clone(), request.start_timestamp);
        self.transactions.insert(request.transaction_id, transaction);
        Ok(())
    }

    fn prepare(&mut self, request: ReqPrepareTransactionCommit) -> Result<(), TransactionError> {
        self.find_transaction(&request.transaction_id)?
            .prepare(request.persistent, request.prepare_timestamp)
    }

    fn commit(&mut self, request: ReqCommitTransaction) -> Result<(), TransactionError> {
        self.find_transaction(&request.transaction_id)?
            .commit(request.commit_timestamp)
    }

    fn abort(&mut self, request: ReqAbortTransaction) -> Result<(), TransactionError> {
        self.find_transaction(&request.transaction_id)?.abort(request.force)
    }

    fn find_transaction(&mut self, transaction_id: &str) -> Result<&mut Transaction, TransactionError> {
        self.transactions
            .get_mut(transaction_id)
            .ok_or_else(|| TransactionError::NoSuchTransaction(transaction_id.to_string()))
    }

    fn log_outcome(&self, sequence_number: u64, mutation_type: &str, result: &Result<(), TransactionError>) {
        match result {
            Ok(()) => slog::debug!(self.logger, "Applied"; "SeqNo" => sequence_number, "Type" => mutation_type),
            Err(e) => {
                slog::info!(self.logger, "Rejected: {}", e; "SeqNo" => sequence_number, "Type" => mutation_type)
            }
        }
    }
}

/// Only persistent prepares go through the log.
fn decode_logged_prepare(payload: &[u8]) -> Result<ReqPrepareTransactionCommit, HandlerError> {
    let request: ReqPrepareTransactionCommit = decode_payload(PREPARE_TRANSACTION_COMMIT, payload)?;
    if !request.persistent {
        return Err(HandlerError::MalformedPayload {
            mutation_type: PREPARE_TRANSACTION_COMMIT.to_string(),
            reason: "Logged prepare must be persistent".to_string(),
        });
    }
    Ok(request)
}

impl AutomatonPart for TransactionManager {
    fn name(&self) -> &'static str {
        "transaction_manager"
    }

    fn mutation_types(&self) -> Vec<&'static str> {
        vec![
            START_TRANSACTION,
            PREPARE_TRANSACTION_COMMIT,
            COMMIT_TRANSACTION,
            ABORT_TRANSACTION,
        ]
    }

    fn transient_types(&self) -> Vec<&'static str> {
        vec![PREPARE_TRANSACTION_COMMIT]
    }

    fn query_types(&self) -> Vec<&'static str> {
        vec![GET_TRANSACTION]
    }

    fn validate_mutation(&self, mutation_type: &str, payload: &[u8]) -> Result<(), HandlerError> {
        match mutation_type {
            START_TRANSACTION => decode_payload::<ReqStartTransaction>(mutation_type, payload).map(drop),
            PREPARE_TRANSACTION_COMMIT => decode_logged_prepare(payload).map(drop),
            COMMIT_TRANSACTION => decode_payload::<ReqCommitTransaction>(mutation_type, payload).map(drop),
            ABORT_TRANSACTION => decode_payload::<ReqAbortTransaction>(mutation_type, payload).map(drop),
            _ => Err(HandlerError::UnknownMutationType(mutation_type.to_string())),
        }
    }

    fn apply_mutation(
        &mut self,
        context: &MutationContext,
        mutation_type: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, HandlerError> {
        let result = match mutation_type {
            START_TRANSACTION => self.start(decode_payload(mutation_type, payload)?),
            PREPARE_TRANSACTION_COMMIT => self.prepare(decode_logged_prepare(payload)?),
            COMMIT_TRANSACTION => self.commit(decode_payload(mutation_type, payload)?),
            ABORT_TRANSACTION => self.abort(decode_payload(mutation_type, payload)?),
            _ => return Err(HandlerError::UnknownMutationType(mutation_type.to_string())),
        };

        self.log_outcome(context.sequence_number, mutation_type, &result);
        result?;
        Ok(Vec::new())
    }

    fn execute_transient(
        &mut self,
        _timestamp: u64,
        mutation_type: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, HandlerError> {
        if mutation_type != PREPARE_TRANSACTION_COMMIT {
            return Err(HandlerError::UnknownMutationType(mutation_type.to_string()));
        }
        let mut request: ReqPrepareTransactionCommit = decode_payload(mutation_type, payload)?;
        request.persistent = false;
        self.prepare(request)?;
        Ok(Vec::new())
    }

    fn query(&self, query_type: &str, payload: &[u8]) -> Result<Vec<u8>, HandlerError> {
        if query_type != GET_TRANSACTION {
            return Err(HandlerError::UnknownMutationType(query_type.to_string()));
        }
        let request: ReqGetTransaction = decode_payload(query_type, payload)?;
        let response = match self.transactions.get(&request.transaction_id) {
            Some(transaction) => RspGetTransaction {
                found: true,
                transaction: Some(transaction.to_observed_record()),
            },
            None => RspGetTransaction {
                found: false,
                transaction: None,
            },
        };
        Ok(encode_message(&response))
    }

    fn save_snapshot(&self) -> Vec<u8> {
        let snapshot = TransactionManagerSnapshot {
            transactions: self.transactions.values().map(Transaction::to_record).collect(),
        };
        encode_message(&snapshot)
    }

    fn load_snapshot(&mut self, state: &[u8]) -> Result<(), HandlerError> {
        let snapshot: TransactionManagerSnapshot =
            prost::Message::decode(state).map_err(|e: prost::DecodeError| HandlerError::CorruptSnapshot {
                part: self.name().to_string(),
                reason: e.to_string(),
            })?;

        for record in snapshot.transactions {
            let transaction_id = record.transaction_id.clone();
            let transaction = Transaction::from_record(record).ok_or_else(|| HandlerError::CorruptSnapshot {
                part: "transaction_manager".to_string(),
                reason: format!("Transaction {} has an invalid state", transaction_id),
            })?;
            self.transactions.insert(transaction_id, transaction);
        }
        Ok(())
    }

    fn clear(&mut self) {
        self.transactions.clear();
    }

    /// Transient preparations live on the leader only.
    fn on_stop_leading(&mut self) {
        for transaction in self.transactions.values_mut() {
            transaction.clear_transient_state();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automaton::test_util::context;
    use crate::transaction_supervisor::transaction::{TransactionState, INVALID_TRANSACTION_STATE, NO_SUCH_TRANSACTION};

    fn manager() -> TransactionManager {
        TransactionManager::new(slog::Logger::root(slog::Discard, slog::o!()))
    }

    fn apply<M: prost::Message>(
        manager: &mut TransactionManager,
        seq: u64,
        mutation_type: &str,
        request: &M,
    ) -> Result<Vec<u8>, HandlerError> {
        manager.apply_mutation(&context(seq), mutation_type, &encode_message(request))
    }

    fn observed_state(manager: &TransactionManager, id: &str) -> Option<TransactionState> {
        let request = ReqGetTransaction {
            transaction_id: id.to_string(),
        };
        let bytes = manager.query(GET_TRANSACTION, &encode_message(&request)).unwrap();
        let response: RspGetTransaction = prost::Message::decode(bytes.as_slice()).unwrap();
        response
            .transaction
            .and_then(|t| TransactionState::from_u32(t.state))
    }

    fn start(manager: &mut TransactionManager, id: &str) {
        let request = ReqStartTransaction {
            transaction_id: id.to_string(),
            start_timestamp: 10,
        };
        apply(manager, 1, START_TRANSACTION, &request).unwrap();
    }

    #[test]
    fn errors_surface_as_rejections_with_codes() {
        let mut m = manager();
        let commit = ReqCommitTransaction {
            transaction_id: "missing".into(),
            commit_timestamp: 20,
        };
        match apply(&mut m, 1, COMMIT_TRANSACTION, &commit) {
            Err(HandlerError::Rejected(e)) => assert_eq!(e.code, NO_SUCH_TRANSACTION),
            other => panic!("Unexpected {:?}", other),
        }

        start(&mut m, "t");
        let commit = ReqCommitTransaction {
            transaction_id: "t".into(),
            commit_timestamp: 20,
        };
        match apply(&mut m, 2, COMMIT_TRANSACTION, &commit) {
            Err(HandlerError::Rejected(e)) => assert_eq!(e.code, INVALID_TRANSACTION_STATE),
            other => panic!("Unexpected {:?}", other),
        }
    }

    #[test]
    fn transient_prepare_is_not_logged_or_snapshotted() {
        let mut m = manager();
        start(&mut m, "t");
        let prepare = ReqPrepareTransactionCommit {
            transaction_id: "t".into(),
            persistent: false,
            prepare_timestamp: 15,
        };
        // A non-persistent prepare never belongs in the log. If one gets there anyway it's a
        // plain rejection that leaves the transaction alone.
        assert!(m
            .validate_mutation(PREPARE_TRANSACTION_COMMIT, &encode_message(&prepare))
            .is_err());
        match apply(&mut m, 2, PREPARE_TRANSACTION_COMMIT, &prepare) {
            Err(e @ HandlerError::MalformedPayload { .. }) => assert!(!e.is_fatal()),
            other => panic!("Unexpected {:?}", other),
        }
        assert_eq!(observed_state(&m, "t"), Some(TransactionState::Active));

        m.execute_transient(0, PREPARE_TRANSACTION_COMMIT, &encode_message(&prepare))
            .unwrap();
        assert_eq!(observed_state(&m, "t"), Some(TransactionState::TransientlyPrepared));

        let mut follower = manager();
        follower.load_snapshot(&m.save_snapshot()).unwrap();
        assert_eq!(observed_state(&follower, "t"), Some(TransactionState::Active));

        m.on_stop_leading();
        assert_eq!(m.save_snapshot(), follower.save_snapshot());
    }

    #[test]
    fn persistent_prepare_then_commit_survives_snapshot() {
        let mut m = manager();
        start(&mut m, "t");
        let prepare = ReqPrepareTransactionCommit {
            transaction_id: "t".into(),
            persistent: true,
            prepare_timestamp: 15,
        };
        apply(&mut m, 2, PREPARE_TRANSACTION_COMMIT, &prepare).unwrap();

        let mut restored = manager();
        restored.load_snapshot(&m.save_snapshot()).unwrap();
        assert_eq!(observed_state(&restored, "t"), Some(TransactionState::Prepared));

        let commit = ReqCommitTransaction {
            transaction_id: "t".into(),
            commit_timestamp: 30,
        };
        apply(&mut restored, 3, COMMIT_TRANSACTION, &commit).unwrap();
        assert_eq!(observed_state(&restored, "t"), Some(TransactionState::Committed));

        let abort = ReqAbortTransaction {
            transaction_id: "t".into(),
            force: true,
        };
        assert!(apply(&mut restored, 4, ABORT_TRANSACTION, &abort).is_err());
        assert_eq!(observed_state(&restored, "t"), Some(TransactionState::Committed));
    }

    #[test]
    fn garbage_payloads_fail_validation_and_leave_state_alone() {
        let mut m = manager();
        start(&mut m, "t");
        let before = m.save_snapshot();
        let garbage = [0xff, 0xff, 0xff];

        for mutation_type in m.mutation_types() {
            assert!(matches!(
                m.validate_mutation(mutation_type, &garbage),
                Err(HandlerError::MalformedPayload { .. })
            ));
            let err = m.apply_mutation(&context(2), mutation_type, &garbage).unwrap_err();
            assert!(!err.is_fatal());
        }
        assert_eq!(m.save_snapshot(), before);

        let valid = ReqStartTransaction {
            transaction_id: "u".into(),
            start_timestamp: 11,
        };
        assert!(m
            .validate_mutation(START_TRANSACTION, &encode_message(&valid))
            .is_ok());
    }
}
