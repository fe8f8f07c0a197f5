use crate::api::MutationCommitter;
use crate::automaton::encode_message;
use crate::chunk_server::registry::CHECK_NODE_LEASES;
use crate::clock::{Clock, RealClock};
use crate::payloads::{ReqCheckNodeLeases, RspCheckNodeLeases};
use crate::replica::{CommitMutationError, ReplicaState, ReplicaStatusListener};
use std::sync::Arc;
use tokio::time::{Duration, Instant};

/// Periodically proposes `check_node_leases` while the local replica leads. Expiry is decided by
/// the applied mutation's timestamp, so every replica agrees on which nodes expired.
pub(crate) struct LeaseChecker<C: Clock = RealClock> {
    logger: slog::Logger,
    committer: Arc<dyn MutationCommitter>,
    status: ReplicaStatusListener,
    period: Duration,
    next_check: Instant,
    clock: C,
}

impl LeaseChecker {
    pub(crate) fn spawn(
        logger: slog::Logger,
        committer: Arc<dyn MutationCommitter>,
        status: ReplicaStatusListener,
        period: Duration,
    ) {
        let checker = LeaseChecker::new(logger, committer, status, period, RealClock);
        tokio::task::spawn(checker.run());
    }
}

impl<C: Clock> LeaseChecker<C> {
    fn new(
        logger: slog::Logger,
        committer: Arc<dyn MutationCommitter>,
        status: ReplicaStatusListener,
        period: Duration,
        clock: C,
    ) -> Self {
        LeaseChecker {
            logger,
            committer,
            status,
            period,
            next_check: clock.now() + period,
            clock,
        }
    }

    async fn run(mut self) {
        loop {
            self.clock.sleep_until(self.next_check).await;
            self.next_check += self.period;
            match self.status.current().state {
                ReplicaState::Stopped => return,
                ReplicaState::Leading => {}
                _ => continue,
            }
            if !self.check_once().await {
                return;
            }
        }
    }

    /// Returns false once the replica is gone.
    async fn check_once(&self) -> bool {
        let payload = encode_message(&ReqCheckNodeLeases {});
        match self.committer.commit_mutation(CHECK_NODE_LEASES, payload).await {
            Ok(response) => match response.result {
                Ok(bytes) => match prost::Message::decode(bytes.as_slice()) {
                    Ok(RspCheckNodeLeases { expired_nodes }) => {
                        if !expired_nodes.is_empty() {
                            slog::info!(self.logger, "Node leases expired"; "Nodes" => ?expired_nodes);
                        }
                    }
                    Err(e) => slog::warn!(self.logger, "Undecodable lease check response: {:?}", e),
                },
                Err(e) => slog::warn!(self.logger, "Lease check rejected: {}", e),
            },
            Err(CommitMutationError::ActorExited) | Err(CommitMutationError::Stopped) => return false,
            // Retried next period.
            Err(e) => slog::debug!(self.logger, "Lease check not committed: {}", e),
        }
        true
    }
}
