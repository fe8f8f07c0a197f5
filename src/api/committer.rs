use crate::actor::{ActorClient, WeakActorClient};
use crate::automaton::MutationError;
use crate::replica::{
    CommitMutationError, CommitMutationInput, ExecuteTransientInput, MutationResponse, QueryError, QueryInput,
};
use bytes::Bytes;

/// Proposal side of a cell. Subsystems above the automaton (supervisors, heartbeat endpoints,
/// the lease checker) only ever propose and await through this.
#[async_trait::async_trait]
pub trait MutationCommitter: Send + Sync {
    /// Resolves once the mutation is committed by a quorum and applied locally.
    async fn commit_mutation(
        &self,
        mutation_type: &str,
        payload: Vec<u8>,
    ) -> Result<MutationResponse, CommitMutationError>;

    /// Runs on the leader's state without going through the log.
    async fn execute_transient(
        &self,
        mutation_type: &str,
        payload: Vec<u8>,
    ) -> Result<Result<Vec<u8>, MutationError>, CommitMutationError>;

    /// Reads local state of whichever replica serves the call.
    async fn query(&self, query_type: &str, payload: Vec<u8>) -> Result<Vec<u8>, QueryError>;
}

#[async_trait::async_trait]
impl MutationCommitter for ActorClient {
    async fn commit_mutation(
        &self,
        mutation_type: &str,
        payload: Vec<u8>,
    ) -> Result<MutationResponse, CommitMutationError> {
        ActorClient::commit_mutation(
            self,
            CommitMutationInput {
                mutation_type: mutation_type.to_string(),
                payload: Bytes::from(payload),
            },
        )
        .await
    }

    async fn execute_transient(
        &self,
        mutation_type: &str,
        payload: Vec<u8>,
    ) -> Result<Result<Vec<u8>, MutationError>, CommitMutationError> {
        ActorClient::execute_transient(
            self,
            ExecuteTransientInput {
                mutation_type: mutation_type.to_string(),
                payload: Bytes::from(payload),
            },
        )
        .await
    }

    async fn query(&self, query_type: &str, payload: Vec<u8>) -> Result<Vec<u8>, QueryError> {
        ActorClient::query(
            self,
            QueryInput {
                query_type: query_type.to_string(),
                payload: Bytes::from(payload),
            },
        )
        .await
    }
}

#[async_trait::async_trait]
impl MutationCommitter for WeakActorClient {
    async fn commit_mutation(
        &self,
        mutation_type: &str,
        payload: Vec<u8>,
    ) -> Result<MutationResponse, CommitMutationError> {
        WeakActorClient::commit_mutation(
            self,
            CommitMutationInput {
                mutation_type: mutation_type.to_string(),
                payload: Bytes::from(payload),
            },
        )
        .await
    }

    async fn execute_transient(
        &self,
        mutation_type: &str,
        payload: Vec<u8>,
    ) -> Result<Result<Vec<u8>, MutationError>, CommitMutationError> {
        WeakActorClient::execute_transient(
            self,
            ExecuteTransientInput {
                mutation_type: mutation_type.to_string(),
                payload: Bytes::from(payload),
            },
        )
        .await
    }

    async fn query(&self, query_type: &str, payload: Vec<u8>) -> Result<Vec<u8>, QueryError> {
        WeakActorClient::query(
            self,
            QueryInput {
                query_type: query_type.to_string(),
                payload: Bytes::from(payload),
            },
        )
        .await
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;
    use crate::automaton::{CompositeAutomaton, HandlerError, MutationContext};
    use crate::commitlog::Index;
    use std::sync::Mutex;

    /// Single-node stand-in for a cell: applies every proposal straight to an automaton.
    pub(crate) struct LocalCommitter {
        automaton: Mutex<(CompositeAutomaton, u64)>,
        pub(crate) timestamp: Mutex<u64>,
    }

    impl LocalCommitter {
        pub(crate) fn new(automaton: CompositeAutomaton) -> Self {
            LocalCommitter {
                automaton: Mutex::new((automaton, 0)),
                timestamp: Mutex::new(1_000),
            }
        }
    }

    fn handler_to_commit_error(e: HandlerError) -> CommitMutationError {
        match e {
            HandlerError::UnknownMutationType(t) => CommitMutationError::UnknownMutationType(t),
            other => CommitMutationError::MalformedPayload(other.to_string()),
        }
    }

    #[async_trait::async_trait]
    impl MutationCommitter for LocalCommitter {
        async fn commit_mutation(
            &self,
            mutation_type: &str,
            payload: Vec<u8>,
        ) -> Result<MutationResponse, CommitMutationError> {
            let timestamp = *self.timestamp.lock().unwrap();
            let mut guard = self.automaton.lock().unwrap();
            guard
                .0
                .validate_mutation(mutation_type, &payload)
                .map_err(handler_to_commit_error)?;
            guard.1 += 1;
            let sequence_number = guard.1;
            let context = MutationContext {
                sequence_number,
                term: 1,
                timestamp,
            };
            let result = match guard.0.apply_mutation(&context, mutation_type, &payload) {
                Ok(response) => Ok(response),
                Err(HandlerError::Rejected(e)) => Err(e),
                Err(e) => return Err(handler_to_commit_error(e)),
            };
            Ok(MutationResponse {
                sequence_number: Index::new(sequence_number),
                result,
            })
        }

        async fn execute_transient(
            &self,
            mutation_type: &str,
            payload: Vec<u8>,
        ) -> Result<Result<Vec<u8>, MutationError>, CommitMutationError> {
            let timestamp = *self.timestamp.lock().unwrap();
            let mut guard = self.automaton.lock().unwrap();
            match guard.0.execute_transient(timestamp, mutation_type, &payload) {
                Ok(response) => Ok(Ok(response)),
                Err(HandlerError::Rejected(e)) => Ok(Err(e)),
                Err(e) => Err(handler_to_commit_error(e)),
            }
        }

        async fn query(&self, query_type: &str, payload: Vec<u8>) -> Result<Vec<u8>, QueryError> {
            let guard = self.automaton.lock().unwrap();
            guard.0.query(query_type, &payload).map_err(|e| match e {
                HandlerError::Rejected(e) => QueryError::Rejected(e),
                other => QueryError::Handler(other.to_string()),
            })
        }
    }
}
