use crate::replica::{LeaderRedirectInfo, Term};
use tokio::sync::watch;

/// Externally visible peer state of a replica.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReplicaState {
    Stopped,
    /// Candidate, or follower that doesn't know the leader.
    Elections,
    /// Follower still catching up on the leader's commits, or installing a snapshot.
    FollowerRecovery,
    Following,
    /// Elected leader whose own-term no-op isn't committed yet.
    LeaderRecovery,
    Leading,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReplicaStatus {
    pub state: ReplicaState,
    pub term: Term,
    pub leader: Option<LeaderRedirectInfo>,
}

pub(super) fn new(initial_status: ReplicaStatus) -> (ReplicaStatusNotifier, ReplicaStatusListener) {
    let (snd, rcv) = watch::channel(initial_status.clone());

    (
        ReplicaStatusNotifier {
            snd,
            last: initial_status,
        },
        ReplicaStatusListener { rcv },
    )
}

pub(super) struct ReplicaStatusNotifier {
    snd: watch::Sender<ReplicaStatus>,
    last: ReplicaStatus,
}

impl ReplicaStatusNotifier {
    /// Publishes only actual changes, so listeners don't wake up for repeats.
    pub(super) fn notify_new_status(&mut self, new_status: ReplicaStatus) {
        if self.last != new_status {
            self.last = new_status.clone();
            let _ = self.snd.send(new_status);
        }
    }
}

/// Observes status changes. Intermediate statuses between two `next()` calls are coalesced into
/// the latest one.
#[derive(Clone)]
pub struct ReplicaStatusListener {
    rcv: watch::Receiver<ReplicaStatus>,
}

impl ReplicaStatusListener {
    pub async fn next(&mut self) -> Option<ReplicaStatus> {
        match self.rcv.changed().await {
            Ok(_) => Some(self.rcv.borrow().clone()),
            Err(_) => None,
        }
    }

    pub fn current(&self) -> ReplicaStatus {
        self.rcv.borrow().clone()
    }
}

/// Listener driven by hand, for tasks that only react to status.
#[cfg(test)]
pub(crate) fn test_listener(initial_status: ReplicaStatus) -> (watch::Sender<ReplicaStatus>, ReplicaStatusListener) {
    let (snd, rcv) = watch::channel(initial_status);
    (snd, ReplicaStatusListener { rcv })
}
