use crate::automaton::{HandlerError, MutationError};
use crate::payloads::TransactionRecord;
use std::fmt;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TransactionState {
    Active,
    /// Prepared on the leader only, without a log record. Never snapshotted.
    TransientlyPrepared,
    Prepared,
    Committed,
    Aborted,
}

impl TransactionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::Aborted)
    }

    pub(super) fn to_u32(self) -> u32 {
        match self {
            TransactionState::Active => 1,
            TransactionState::TransientlyPrepared => 2,
            TransactionState::Prepared => 3,
            TransactionState::Committed => 4,
            TransactionState::Aborted => 5,
        }
    }

    pub(super) fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(TransactionState::Active),
            2 => Some(TransactionState::TransientlyPrepared),
            3 => Some(TransactionState::Prepared),
            4 => Some(TransactionState::Committed),
            5 => Some(TransactionState::Aborted),
            _ => None,
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Domain failures of the two-phase protocol. Each has a stable code so it survives the trip
/// through a mutation response.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum TransactionError {
    #[error("No such transaction {0}")]
    NoSuchTransaction(String),
    #[error("Transaction {0} already exists")]
    AlreadyExists(String),
    #[error("Cannot {action} transaction {transaction_id} in state {state}")]
    InvalidState {
        transaction_id: String,
        state: TransactionState,
        action: &'static str,
    },
    #[error("{kind} timestamp {timestamp} of transaction {transaction_id} is below {lower_bound}")]
    StaleTimestamp {
        transaction_id: String,
        kind: &'static str,
        timestamp: u64,
        lower_bound: u64,
    },
}

pub const NO_SUCH_TRANSACTION: u32 = 1001;
pub const TRANSACTION_ALREADY_EXISTS: u32 = 1002;
pub const INVALID_TRANSACTION_STATE: u32 = 1003;
pub const STALE_TIMESTAMP: u32 = 1004;

impl TransactionError {
    pub fn code(&self) -> u32 {
        match self {
            TransactionError::NoSuchTransaction(_) => NO_SUCH_TRANSACTION,
            TransactionError::AlreadyExists(_) => TRANSACTION_ALREADY_EXISTS,
            TransactionError::InvalidState { .. } => INVALID_TRANSACTION_STATE,
            TransactionError::StaleTimestamp { .. } => STALE_TIMESTAMP,
        }
    }
}

impl From<TransactionError> for MutationError {
    fn from(e: TransactionError) -> Self {
        MutationError::new(e.code(), e.to_string())
    }
}

impl From<TransactionError> for HandlerError {
    fn from(e: TransactionError) -> Self {
        HandlerError::Rejected(e.into())
    }
}

/// Persistent state plus an optional leader-local overlay. All transitions validate first and
/// only then mutate, so a rejected call leaves the transaction untouched.
#[derive(Clone, Debug, PartialEq)]
pub(super) struct Transaction {
    id: String,
    persistent_state: TransactionState,
    transient_prepare_timestamp: Option<u64>,
    start_timestamp: u64,
    prepare_timestamp: u64,
    commit_timestamp: u64,
}

impl Transaction {
    pub(super) fn new(id: String, start_timestamp: u64) -> Self {
        Transaction {
            id,
            persistent_state: TransactionState::Active,
            transient_prepare_timestamp: None,
            start_timestamp,
            prepare_timestamp: 0,
            commit_timestamp: 0,
        }
    }

    /// What an observer on this replica sees.
    pub(super) fn state(&self) -> TransactionState {
        if self.persistent_state == TransactionState::Active && self.transient_prepare_timestamp.is_some() {
            TransactionState::TransientlyPrepared
        } else {
            self.persistent_state
        }
    }

    #[cfg(test)]
    pub(super) fn persistent_state(&self) -> TransactionState {
        self.persistent_state
    }

    pub(super) fn prepare(&mut self, persistent: bool, prepare_timestamp: u64) -> Result<(), TransactionError> {
        match self.persistent_state {
            TransactionState::Active => {}
            // Repeated prepares are harmless.
            TransactionState::Prepared => return Ok(()),
            state => return Err(self.invalid_state(state, "prepare")),
        }
        if prepare_timestamp < self.start_timestamp {
            return Err(TransactionError::StaleTimestamp {
                transaction_id: self.id.clone(),
                kind: "Prepare",
                timestamp: prepare_timestamp,
                lower_bound: self.start_timestamp,
            });
        }

        if persistent {
            self.persistent_state = TransactionState::Prepared;
            self.prepare_timestamp = prepare_timestamp;
            self.transient_prepare_timestamp = None;
        } else {
            self.transient_prepare_timestamp = Some(prepare_timestamp);
        }
        Ok(())
    }

    pub(super) fn commit(&mut self, commit_timestamp: u64) -> Result<(), TransactionError> {
        match self.persistent_state {
            TransactionState::Prepared => {}
            TransactionState::Committed => return Ok(()),
            state => return Err(self.invalid_state(state, "commit")),
        }
        if commit_timestamp < self.prepare_timestamp {
            return Err(TransactionError::StaleTimestamp {
                transaction_id: self.id.clone(),
                kind: "Commit",
                timestamp: commit_timestamp,
                lower_bound: self.prepare_timestamp,
            });
        }

        self.persistent_state = TransactionState::Committed;
        self.commit_timestamp = commit_timestamp;
        Ok(())
    }

    pub(super) fn abort(&mut self, force: bool) -> Result<(), TransactionError> {
        match self.persistent_state {
            TransactionState::Aborted => return Ok(()),
            TransactionState::Committed => return Err(self.invalid_state(TransactionState::Committed, "abort")),
            TransactionState::Prepared if !force => {
                return Err(self.invalid_state(TransactionState::Prepared, "abort"))
            }
            _ => {}
        }

        self.persistent_state = TransactionState::Aborted;
        self.transient_prepare_timestamp = None;
        Ok(())
    }

    pub(super) fn clear_transient_state(&mut self) {
        self.transient_prepare_timestamp = None;
    }

    fn invalid_state(&self, state: TransactionState, action: &'static str) -> TransactionError {
        TransactionError::InvalidState {
            transaction_id: self.id.clone(),
            state,
            action,
        }
    }

    /// Only the persistent half goes into records; transient preparation is forgotten.
    pub(super) fn to_record(&self) -> TransactionRecord {
        TransactionRecord {
            transaction_id: self.id.clone(),
            state: self.persistent_state.to_u32(),
            start_timestamp: self.start_timestamp,
            prepare_timestamp: self.prepare_timestamp,
            commit_timestamp: self.commit_timestamp,
        }
    }

    /// Like `to_record`, but with the state an observer on this replica sees.
    pub(super) fn to_observed_record(&self) -> TransactionRecord {
        TransactionRecord {
            state: self.state().to_u32(),
            prepare_timestamp: self.transient_prepare_timestamp.unwrap_or(self.prepare_timestamp),
            ..self.to_record()
        }
    }

    pub(super) fn from_record(record: TransactionRecord) -> Option<Self> {
        let persistent_state = TransactionState::from_u32(record.state)?;
        if persistent_state == TransactionState::TransientlyPrepared {
            return None;
        }
        Some(Transaction {
            id: record.transaction_id,
            persistent_state,
            transient_prepare_timestamp: None,
            start_timestamp: record.start_timestamp,
            prepare_timestamp: record.prepare_timestamp,
            commit_timestamp: record.commit_timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txn() -> Transaction {
        Transaction::new("t1".into(), 100)
    }

    #[test]
    fn two_phase_commit_path() {
        let mut t = txn();
        t.prepare(false, 110).unwrap();
        assert_eq!(t.state(), TransactionState::TransientlyPrepared);
        assert_eq!(t.persistent_state(), TransactionState::Active);

        t.prepare(true, 120).unwrap();
        assert_eq!(t.state(), TransactionState::Prepared);

        t.commit(130).unwrap();
        assert_eq!(t.state(), TransactionState::Committed);
        // Repeated commit is a no-op.
        t.commit(140).unwrap();
        assert_eq!(t.to_record().commit_timestamp, 130);
    }

    #[test]
    fn no_transition_leaves_a_terminal_state() {
        let mut committed = txn();
        committed.prepare(true, 110).unwrap();
        committed.commit(120).unwrap();
        assert!(matches!(
            committed.abort(true),
            Err(TransactionError::InvalidState { state: TransactionState::Committed, .. })
        ));
        assert!(committed.prepare(true, 130).is_err());
        assert_eq!(committed.state(), TransactionState::Committed);

        let mut aborted = txn();
        aborted.abort(false).unwrap();
        assert!(aborted.commit(120).is_err());
        assert!(aborted.prepare(false, 120).is_err());
        aborted.abort(true).unwrap();
        assert_eq!(aborted.state(), TransactionState::Aborted);
    }

    #[test]
    fn commit_requires_persistent_prepare() {
        let mut t = txn();
        assert!(t.commit(120).is_err());
        t.prepare(false, 110).unwrap();
        assert!(matches!(
            t.commit(120),
            Err(TransactionError::InvalidState { state: TransactionState::Active, .. })
        ));
    }

    #[test]
    fn force_abort_succeeds_from_every_non_terminal_state() {
        let mut active = txn();
        active.abort(true).unwrap();

        let mut transient = txn();
        transient.prepare(false, 110).unwrap();
        transient.abort(true).unwrap();
        assert_eq!(transient.state(), TransactionState::Aborted);

        let mut prepared = txn();
        prepared.prepare(true, 110).unwrap();
        assert!(prepared.abort(false).is_err());
        assert_eq!(prepared.state(), TransactionState::Prepared);
        prepared.abort(true).unwrap();
        assert_eq!(prepared.state(), TransactionState::Aborted);
    }

    #[test]
    fn stale_timestamps_are_rejected_without_side_effects() {
        let mut t = txn();
        assert!(matches!(
            t.prepare(true, 99),
            Err(TransactionError::StaleTimestamp { kind: "Prepare", .. })
        ));
        assert_eq!(t.state(), TransactionState::Active);

        t.prepare(true, 150).unwrap();
        assert!(matches!(
            t.commit(149),
            Err(TransactionError::StaleTimestamp { kind: "Commit", .. })
        ));
        assert_eq!(t.state(), TransactionState::Prepared);
    }

    #[test]
    fn records_drop_transient_preparation() {
        let mut t = txn();
        t.prepare(false, 110).unwrap();
        assert_eq!(t.to_observed_record().state, TransactionState::TransientlyPrepared.to_u32());

        let reloaded = Transaction::from_record(t.to_record()).unwrap();
        assert_eq!(reloaded.state(), TransactionState::Active);
    }
}
