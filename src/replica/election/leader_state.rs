use crate::commitlog::Index;
use crate::replica::election::timers::HeartbeatTimerHandle;
use crate::replica::ReplicaId;
use std::cmp;
use std::collections::BTreeMap;

pub(crate) struct LeaderStateTracker {
    peer_state: BTreeMap<ReplicaId, PeerState>,
}

impl LeaderStateTracker {
    pub(super) fn new(peer_state: BTreeMap<ReplicaId, PeerState>) -> Self {
        LeaderStateTracker { peer_state }
    }

    pub(crate) fn peer_state_mut(&mut self, peer_id: &ReplicaId) -> Option<&mut PeerState> {
        self.peer_state.get_mut(peer_id)
    }

    #[cfg(test)]
    pub(crate) fn peer_ids(&self) -> Vec<ReplicaId> {
        self.peer_state.keys().cloned().collect()
    }

    pub(crate) fn peers_iter(&self) -> impl Iterator<Item = (&ReplicaId, &PeerState)> {
        self.peer_state.iter()
    }
}

pub(crate) struct PeerState {
    // Held to send heartbeats for this peer
    heartbeat_timer_handle: HeartbeatTimerHandle,

    // > index of the next log entry to send to that server
    // > (initialized to leader last log index + 1)
    next: Index,
    // > index of highest log entry known to be replicated on server
    // > (initialized to 0, increases monotonically)
    matched: Option<Index>,

    // SeqNo is a logical clock over one leader term's requests to one peer. Every request carries
    // the next SeqNo; replies older than the newest received one are discarded.
    last_sent_seq_no: u64,
    last_received_seq_no: u64,
}

impl PeerState {
    pub(super) fn new(heartbeat_timer_handle: HeartbeatTimerHandle, latest_log_index: Option<Index>) -> Self {
        PeerState {
            heartbeat_timer_handle,
            next: latest_log_index
                .map(|i| i.plus(1))
                .unwrap_or_else(Index::start_index),
            matched: None,
            last_sent_seq_no: 0,
            last_received_seq_no: 0,
        }
    }

    pub(crate) fn next_and_previous_log_index(&self) -> (Index, Option<Index>) {
        (self.next, self.next.checked_minus(1))
    }

    pub(crate) fn matched(&self) -> Option<Index> {
        self.matched
    }

    pub(crate) fn handle_replication_result(
        &mut self,
        logger: &slog::Logger,
        received_seq_no: u64,
        update: PeerStateUpdate,
    ) {
        if !self.ratchet_fwd_received_seq_no(received_seq_no) {
            slog::warn!(logger, "Dropping out of date seq-no({:?}): {:?}", received_seq_no, update);
            return;
        }

        match update {
            PeerStateUpdate::OtherError => { /* No action */ }
            PeerStateUpdate::Success {
                previous_log_entry,
                num_entries_replicated,
            } => {
                let last_replicated = match (previous_log_entry, num_entries_replicated) {
                    (None, 0) => return,
                    (None, n) => Index::new_usize(n),
                    (Some(prev), n) => prev.plus(n as u64),
                };
                self.update_log(logger, last_replicated);
            }
            PeerStateUpdate::SnapshotInstalled { last_included_index } => {
                self.update_log(logger, last_included_index);
            }
            PeerStateUpdate::PeerLogBehind { last_log_index } => {
                self.rewind_log(logger, last_log_index);
            }
        }
    }

    /// The peer's log matches ours through `new_matched`.
    fn update_log(&mut self, logger: &slog::Logger, new_matched: Index) {
        if let Some(matched) = self.matched {
            if new_matched < matched {
                // Peer could return garbage data; don't let it move us backwards.
                slog::warn!(
                    logger,
                    "Ignoring replication ack below matched index. CurrentMatched={:?}, NewMatched={:?}",
                    matched,
                    new_matched
                );
                return;
            }
        }

        self.matched.replace(new_matched);
        self.next = cmp::max(self.next, new_matched.plus(1));
    }

    /// The peer lacks our record at `next - 1`. Jump back to just past its last record when it
    /// told us where that is, otherwise step back by one.
    fn rewind_log(&mut self, logger: &slog::Logger, peer_last_log_index: Option<Index>) {
        let one_back = match self.next.checked_minus(1) {
            Some(index) => index,
            None => {
                slog::warn!(logger, "Can't rewind peer log, already at beginning of log.");
                return;
            }
        };
        let hinted = peer_last_log_index
            .map(|i| i.plus(1))
            .unwrap_or_else(Index::start_index);
        self.next = cmp::min(one_back, hinted);

        if let Some(matched) = self.matched {
            if matched >= self.next {
                // A peer that lost records it had acknowledged, e.g. restarted without a data
                // directory.
                slog::warn!(logger, "Peer lost acknowledged records"; "Matched" => ?matched, "Next" => ?self.next);
                self.matched = self.next.checked_minus(1);
            }
        }
    }

    pub(crate) fn has_outstanding_request(&self) -> bool {
        self.last_received_seq_no < self.last_sent_seq_no
    }

    pub(crate) fn next_seq_no(&mut self) -> u64 {
        self.last_sent_seq_no += 1;
        self.last_sent_seq_no
    }

    /// Gives up on the outstanding request, e.g. when it couldn't be built.
    pub(crate) fn abandon_outstanding_request(&mut self) {
        self.last_received_seq_no = self.last_sent_seq_no;
    }

    /// returns true if the state was mutated.
    fn ratchet_fwd_received_seq_no(&mut self, received_seq_no: u64) -> bool {
        if self.last_received_seq_no < received_seq_no && received_seq_no <= self.last_sent_seq_no {
            self.last_received_seq_no = received_seq_no;
            true
        } else {
            false
        }
    }

    pub(crate) fn reset_heartbeat_timer(&self) {
        self.heartbeat_timer_handle.reset_heartbeat_timer();
    }
}

#[derive(Debug)]
pub(crate) enum PeerStateUpdate {
    Success {
        previous_log_entry: Option<Index>,
        num_entries_replicated: usize,
    },
    SnapshotInstalled {
        last_included_index: Index,
    },
    PeerLogBehind {
        last_log_index: Option<Index>,
    },
    OtherError,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorClient;
    use crate::replica::Term;
    use std::time::Duration;

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    async fn peer_state(latest_log_index: u64) -> (PeerState, ActorClient) {
        // The timer needs a live runtime; its ticks go nowhere since the receiver is dropped.
        let (actor_client, _rx) = ActorClient::new(10);
        let handle = HeartbeatTimerHandle::spawn_timer_task(
            Duration::from_secs(60),
            actor_client.weak(),
            ReplicaId::new("peer"),
            Term::new(1),
        );
        (PeerState::new(handle, Index::from_u64(latest_log_index)), actor_client)
    }

    fn send(state: &mut PeerState) -> u64 {
        assert!(!state.has_outstanding_request());
        state.next_seq_no()
    }

    #[tokio::test]
    async fn success_moves_next_and_matched() {
        let logger = logger();
        let (mut state, _client) = peer_state(5).await;
        assert_eq!(state.next_and_previous_log_index(), (Index::new(6), Some(Index::new(5))));

        // Heartbeat ack at prev=5 proves the peer holds 5.
        let seq = send(&mut state);
        state.handle_replication_result(
            &logger,
            seq,
            PeerStateUpdate::Success {
                previous_log_entry: Some(Index::new(5)),
                num_entries_replicated: 0,
            },
        );
        assert_eq!(state.matched(), Some(Index::new(5)));

        let seq = send(&mut state);
        state.handle_replication_result(
            &logger,
            seq,
            PeerStateUpdate::Success {
                previous_log_entry: Some(Index::new(5)),
                num_entries_replicated: 3,
            },
        );
        assert_eq!(state.matched(), Some(Index::new(8)));
        assert_eq!(state.next_and_previous_log_index().0, Index::new(9));
    }

    #[tokio::test]
    async fn rewind_uses_peer_hint() {
        let logger = logger();
        let (mut state, _client) = peer_state(10).await;

        let seq = send(&mut state);
        state.handle_replication_result(
            &logger,
            seq,
            PeerStateUpdate::PeerLogBehind {
                last_log_index: Some(Index::new(3)),
            },
        );
        assert_eq!(state.next_and_previous_log_index(), (Index::new(4), Some(Index::new(3))));

        // A hint at or past our own position only steps back by one.
        let seq = send(&mut state);
        state.handle_replication_result(&logger, seq, PeerStateUpdate::PeerLogBehind { last_log_index: Some(Index::new(9)) });
        assert_eq!(state.next_and_previous_log_index().0, Index::new(3));

        let seq = send(&mut state);
        state.handle_replication_result(&logger, seq, PeerStateUpdate::PeerLogBehind { last_log_index: None });
        assert_eq!(state.next_and_previous_log_index(), (Index::new(1), None));
    }

    #[tokio::test]
    async fn stale_and_unsent_seq_nos_are_dropped() {
        let logger = logger();
        let (mut state, _client) = peer_state(0).await;

        let first = send(&mut state);
        state.handle_replication_result(&logger, first, PeerStateUpdate::OtherError);
        let second = send(&mut state);
        assert!(state.has_outstanding_request());

        // Replay of the first reply, and a reply to something never sent.
        state.handle_replication_result(
            &logger,
            first,
            PeerStateUpdate::SnapshotInstalled {
                last_included_index: Index::new(4),
            },
        );
        state.handle_replication_result(
            &logger,
            second + 1,
            PeerStateUpdate::SnapshotInstalled {
                last_included_index: Index::new(4),
            },
        );
        assert_eq!(state.matched(), None);
        assert!(state.has_outstanding_request());

        state.handle_replication_result(
            &logger,
            second,
            PeerStateUpdate::SnapshotInstalled {
                last_included_index: Index::new(4),
            },
        );
        assert_eq!(state.matched(), Some(Index::new(4)));
        assert_eq!(state.next_and_previous_log_index().0, Index::new(5));
        assert!(!state.has_outstanding_request());
    }
}
