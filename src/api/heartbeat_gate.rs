use crate::api::MutationCommitter;
use crate::automaton::MutationError;
use crate::replica::CommitMutationError;
use tokio::sync::Semaphore;

#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    /// Too many heartbeats in flight. Retriable; the node resends on its next period.
    #[error("Too many concurrent heartbeats")]
    Throttled,
    #[error(transparent)]
    Commit(#[from] CommitMutationError),
    /// The owning part refused the heartbeat, e.g. for an unregistered node.
    #[error("Heartbeat rejected: {0}")]
    Rejected(MutationError),
    #[error("Malformed heartbeat response: {0}")]
    MalformedResponse(String),
}

/// Bounds the number of node heartbeat mutations in flight on one cell. Excess heartbeats fail
/// fast rather than queue behind the log.
pub struct HeartbeatGate {
    permits: Semaphore,
}

impl HeartbeatGate {
    pub fn new(max_concurrent_heartbeats: usize) -> Self {
        HeartbeatGate {
            permits: Semaphore::new(max_concurrent_heartbeats),
        }
    }

    pub async fn commit_heartbeat<R>(
        &self,
        committer: &dyn MutationCommitter,
        mutation_type: &str,
        payload: Vec<u8>,
    ) -> Result<R, HeartbeatError>
    where
        R: prost::Message + Default,
    {
        let _permit = self.permits.try_acquire().map_err(|_| HeartbeatError::Throttled)?;
        let response = committer.commit_mutation(mutation_type, payload).await?;
        let bytes = response.result.map_err(HeartbeatError::Rejected)?;
        R::decode(bytes.as_slice()).map_err(|e| HeartbeatError::MalformedResponse(e.to_string()))
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_utils::LocalCommitter;
    use crate::automaton::{encode_message, CompositeAutomaton};
    use crate::payloads::{ReqExecNodeHeartbeat, ReqRegisterExecNode, RspExecNodeHeartbeat};
    use crate::scheduler::{Scheduler, SchedulerConfig, EXEC_NODE_HEARTBEAT, NO_SUCH_EXEC_NODE, REGISTER_EXEC_NODE};

    fn committer() -> LocalCommitter {
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let mut automaton = CompositeAutomaton::new();
        automaton
            .register_part(Box::new(Scheduler::new(logger, SchedulerConfig::default())))
            .unwrap();
        LocalCommitter::new(automaton)
    }

    fn heartbeat(node_id: &str) -> Vec<u8> {
        encode_message(&ReqExecNodeHeartbeat {
            node_id: node_id.into(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn exhausted_gate_throttles_and_recovers() {
        let committer = committer();
        committer
            .commit_mutation(
                REGISTER_EXEC_NODE,
                encode_message(&ReqRegisterExecNode {
                    node_id: "n1".into(),
                    ..Default::default()
                }),
            )
            .await
            .unwrap();
        let gate = HeartbeatGate::new(1);

        // Hold the only permit.
        let held = gate.permits.try_acquire().unwrap();
        let throttled = gate
            .commit_heartbeat::<RspExecNodeHeartbeat>(&committer, EXEC_NODE_HEARTBEAT, heartbeat("n1"))
            .await;
        assert!(matches!(throttled, Err(HeartbeatError::Throttled)));

        drop(held);
        let response: RspExecNodeHeartbeat = gate
            .commit_heartbeat(&committer, EXEC_NODE_HEARTBEAT, heartbeat("n1"))
            .await
            .unwrap();
        assert!(!response.disable_jobs);
        assert_eq!(gate.available_permits(), 1);
    }

    #[tokio::test]
    async fn rejected_heartbeat_carries_the_part_error() {
        let committer = committer();
        let gate = HeartbeatGate::new(4);
        let result = gate
            .commit_heartbeat::<RspExecNodeHeartbeat>(&committer, EXEC_NODE_HEARTBEAT, heartbeat("ghost"))
            .await;
        match result {
            Err(HeartbeatError::Rejected(e)) => assert_eq!(e.code, NO_SUCH_EXEC_NODE),
            other => panic!("Expected a rejection, got {:?}", other),
        }
    }
}
