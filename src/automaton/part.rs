/// Everything a handler may learn about the mutation it applies. Handlers must derive all
/// nondeterministic inputs (time, ids) from here.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationContext {
    pub sequence_number: u64,
    pub term: u64,
    /// Leader wall clock at proposal time, in milliseconds since the unix epoch.
    pub timestamp: u64,
}

/// Domain error produced by a handler. It travels back to the proposer inside the mutation
/// response; replicas treat the mutation as applied.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error("[{code}] {message}")]
pub struct MutationError {
    pub code: u32,
    pub message: String,
}

/// Code of the rejection a committed mutation gets when its payload doesn't decode.
pub const MALFORMED_MUTATION: u32 = 1;

impl MutationError {
    pub fn new<M: Into<String>>(code: u32, message: M) -> Self {
        MutationError {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Rejected(#[from] MutationError),
    #[error("Malformed {mutation_type} payload: {reason}")]
    MalformedPayload {
        mutation_type: String,
        reason: String,
    },
    #[error("No handler registered for {0}")]
    UnknownMutationType(String),
    #[error("Snapshot of part {part} is corrupt: {reason}")]
    CorruptSnapshot { part: String, reason: String },
}

impl HandlerError {
    /// Whether a replica may keep running after this error surfaced while applying a committed
    /// mutation. Decoding is deterministic, so a malformed payload fails alike on every replica.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, HandlerError::Rejected(_) | HandlerError::MalformedPayload { .. })
    }
}

/// One slice of replicated state, e.g. the chunk registry. Parts register the mutation types
/// they own with the [`CompositeAutomaton`](super::CompositeAutomaton).
///
/// `apply_mutation` runs on every replica in sequence number order and must be deterministic:
/// the same mutations applied to the same state yield the same state and the same response.
/// A handler that returns `Rejected` must leave the state untouched.
pub trait AutomatonPart: Send {
    fn name(&self) -> &'static str;

    fn mutation_types(&self) -> Vec<&'static str>;

    /// Types accepted by `execute_transient`. These run on the leader only and are never logged.
    fn transient_types(&self) -> Vec<&'static str> {
        Vec::new()
    }

    fn query_types(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Static checks the leader runs before logging a mutation. Must not depend on state.
    fn validate_mutation(&self, _mutation_type: &str, _payload: &[u8]) -> Result<(), HandlerError> {
        Ok(())
    }

    /// A handler that fails with `MalformedPayload` must do so before touching any state.
    fn apply_mutation(
        &mut self,
        context: &MutationContext,
        mutation_type: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, HandlerError>;

    fn execute_transient(
        &mut self,
        _timestamp: u64,
        mutation_type: &str,
        _payload: &[u8],
    ) -> Result<Vec<u8>, HandlerError> {
        Err(HandlerError::UnknownMutationType(mutation_type.to_string()))
    }

    fn query(&self, query_type: &str, _payload: &[u8]) -> Result<Vec<u8>, HandlerError> {
        Err(HandlerError::UnknownMutationType(query_type.to_string()))
    }

    fn save_snapshot(&self) -> Vec<u8>;

    /// Replaces the part's state. Called on a cleared part.
    fn load_snapshot(&mut self, state: &[u8]) -> Result<(), HandlerError>;

    fn clear(&mut self);

    /// Called when this replica stops leading. Leader-local state must be dropped here.
    fn on_stop_leading(&mut self) {}
}
