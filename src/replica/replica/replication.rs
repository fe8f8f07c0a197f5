use super::{peer_calls, Replica};
use crate::commitlog::{Index, Log};
use crate::grpc::{ProtoAppendEntriesReq, ProtoInstallSnapshotReq, ProtoLogEntry};
use crate::replica::election::{PeerState, PeerStateUpdate};
use crate::replica::local_state::{PersistentLocalState, Term};
use crate::replica::mutation_log::{MutationLog, MutationRecord};
use crate::replica::peers::ReplicaId;
use crate::replica::replica_api::{
    HeartbeatTick, ReplicationAck, ReplicationDescriptor, ReplicationKind, ReplicationReplyError,
    ReplicationReplyFromPeer,
};
use std::{cmp, io};

impl<L, S> Replica<L, S>
where
    L: Log<MutationRecord> + 'static,
    S: PersistentLocalState,
{
    pub(crate) fn handle_heartbeat_tick(&mut self, tick: HeartbeatTick) {
        let current_term = self.local_state.current_term();
        if current_term != tick.term {
            slog::debug!(
                self.logger,
                "Received heartbeat tick for outdated term {:?}, current term: {:?}",
                tick.term,
                current_term
            );
            return;
        }

        self.replicate_to_peer(&tick.peer_id);
    }

    pub(super) fn replicate_to_all_peers(&mut self) {
        for peer_id in self.cluster_tracker.peer_ids() {
            self.replicate_to_peer(&peer_id);
        }
    }

    fn replicate_to_peer(&mut self, peer_id: &ReplicaId) {
        match self.try_replicate_to_peer(peer_id) {
            Ok(_) => {}
            Err(ReplicateError::NoLongerLeader) => {
                slog::debug!(self.logger, "Skipping replication, no longer leader.")
            }
            Err(ReplicateError::PeerConcurrencyThrottle) => {
                slog::debug!(self.logger, "Request to peer {:?} still outstanding", peer_id)
            }
            Err(ReplicateError::DiskRead(index, ioe)) => {
                slog::error!(self.logger, "Failed to read log record at index {:?}: {:?}", index, ioe);
            }
            Err(ReplicateError::UnexpectedMissingLogEntry(index)) => {
                slog::error!(
                    self.logger,
                    "Peer {:?} is tracked at index {:?}, but the record is missing from the log.",
                    peer_id,
                    index
                );
            }
            Err(ReplicateError::UnknownPeer) => {
                slog::error!(self.logger, "Peer {:?} is missing from cluster or leader state", peer_id);
            }
        }
    }

    fn try_replicate_to_peer(&mut self, peer_id: &ReplicaId) -> Result<(), ReplicateError> {
        let peer = self.cluster_tracker.peer(peer_id).ok_or(ReplicateError::UnknownPeer)?;
        let current_term = self.local_state.current_term();
        let leader_state = self
            .election_state
            .leader_state_mut()
            .ok_or(ReplicateError::NoLongerLeader)?;
        let peer_state = leader_state
            .peer_state_mut(peer_id)
            .ok_or(ReplicateError::UnknownPeer)?;

        let logger = self.logger.new(slog::o!("Peer" => peer_id.as_str().to_string()));
        let request = new_replication_request(
            current_term,
            &self.my_replica_id,
            peer_id,
            peer_state,
            &self.mutation_log,
            self.options.max_entries_per_append,
        );
        match request {
            Ok(ReplicationRequest::Entries(proto_request, descriptor)) => {
                tokio::task::spawn(peer_calls::call_peer_append_entries(
                    logger,
                    peer.client.clone(),
                    proto_request,
                    self.options.append_entries_timeout,
                    self.actor_client.clone(),
                    descriptor,
                ));
            }
            Ok(ReplicationRequest::Snapshot(proto_request, descriptor)) => {
                slog::info!(logger, "Peer is behind our snapshot; asking it to install one");
                tokio::task::spawn(peer_calls::call_peer_install_snapshot(
                    logger,
                    peer.client.clone(),
                    proto_request,
                    self.options.append_entries_timeout,
                    self.actor_client.clone(),
                    descriptor,
                ));
            }
            Err(e) => {
                if !matches!(e, ReplicateError::PeerConcurrencyThrottle) {
                    peer_state.abandon_outstanding_request();
                }
                return Err(e);
            }
        }

        peer_state.reset_heartbeat_timer();
        Ok(())
    }

    pub(crate) fn handle_replication_reply_from_peer(&mut self, reply: ReplicationReplyFromPeer) {
        let ReplicationReplyFromPeer { descriptor, result } = reply;
        let logger = self.logger.new(slog::o!(
            "Peer" => descriptor.peer_id.as_str().to_string(),
            "SeqNo" => descriptor.seq_no
        ));
        slog::debug!(logger, "Replication reply from peer: {:?}", result);

        let current_term = self.local_state.current_term();
        if current_term != descriptor.term {
            slog::info!(
                logger,
                "Received replication reply for outdated term {:?}, but we're on term {:?}",
                descriptor.term,
                current_term
            );
            return;
        }

        // 1. Check for stale term rejection
        let update = match result {
            Err(ReplicationReplyError::StaleTerm { new_term }) => {
                slog::warn!(logger, "Rejected by peer because my term is stale.");
                match self.local_state.store_term_if_increased(new_term) {
                    Ok(true) => {
                        self.become_follower(new_term, None);
                        return;
                    }
                    Ok(false) => {
                        slog::warn!(logger, "Peer reported a stale term that isn't newer than mine.");
                        PeerStateUpdate::OtherError
                    }
                    Err(e) => {
                        slog::error!(logger, "Failed to persist observed term: {:?}", e);
                        PeerStateUpdate::OtherError
                    }
                }
            }
            Err(ReplicationReplyError::PeerMissingPreviousLogEntry { last_log_index }) => {
                slog::info!(logger, "Peer is missing previous log entry"; "PeerLastLogIndex" => ?last_log_index);
                PeerStateUpdate::PeerLogBehind { last_log_index }
            }
            Err(ReplicationReplyError::RetryableFailure(err_msg)) => {
                slog::warn!(logger, "Replication failure: {}", err_msg);
                PeerStateUpdate::OtherError
            }
            Ok(ack) => match (ack, &descriptor.kind) {
                (
                    ReplicationAck::Appended,
                    ReplicationKind::Entries {
                        previous_log_entry_index,
                        num_log_entries,
                    },
                ) => PeerStateUpdate::Success {
                    previous_log_entry: *previous_log_entry_index,
                    num_entries_replicated: *num_log_entries,
                },
                (
                    ReplicationAck::SnapshotInstalled {
                        last_included_index: Some(last_included_index),
                    },
                    ReplicationKind::Snapshot { .. },
                ) => {
                    slog::info!(logger, "Peer installed snapshot"; "LastIncludedIndex" => ?last_included_index);
                    PeerStateUpdate::SnapshotInstalled { last_included_index }
                }
                (ReplicationAck::SnapshotInstalling, ReplicationKind::Snapshot { snapshot_id }) => {
                    slog::debug!(logger, "Peer is still installing snapshot {:?}", snapshot_id);
                    PeerStateUpdate::OtherError
                }
                (ack, kind) => {
                    slog::warn!(logger, "Reply {:?} doesn't fit request {:?}", ack, kind);
                    PeerStateUpdate::OtherError
                }
            },
        };
        let made_progress = !matches!(update, PeerStateUpdate::OtherError);

        // 2. Update peer log tracker
        let next_index = match self
            .election_state
            .leader_state_mut()
            .and_then(|leader_state| leader_state.peer_state_mut(&descriptor.peer_id))
        {
            Some(peer_state) => {
                peer_state.handle_replication_result(&logger, descriptor.seq_no, update);
                peer_state.next_and_previous_log_index().0
            }
            None => {
                slog::info!(logger, "No longer leader, or peer unknown");
                return;
            }
        };

        // 3. Check for quorum replication and apply new commits.
        self.try_advance_commit_index();

        // 4. Keep a peer that is behind busy instead of waiting for the next heartbeat.
        // > If last log index ≥ nextIndex for a follower: send AppendEntries RPC with log entries
        // > starting at nextIndex
        if made_progress && matches!(self.mutation_log.latest_index(), Some(latest) if latest >= next_index) {
            self.replicate_to_peer(&descriptor.peer_id);
        }
    }

    /// > If there exists an N such that N > commitIndex, a quorum of matchIndex[i] ≥ N, and
    /// > log[N].term == currentTerm: set commitIndex = N.
    pub(super) fn try_advance_commit_index(&mut self) {
        let peers_matched_index: Vec<_> = match self.election_state.leader_state() {
            Some(leader_state) => leader_state.peers_iter().map(|(_, peer)| peer.matched()).collect(),
            None => return,
        };

        let tentative_new_commit_index = match get_cluster_commit_index(
            self.mutation_log.latest_index(),
            peers_matched_index,
            self.options.quorum,
        ) {
            Some(index) => index,
            None => return,
        };

        match self
            .mutation_log
            .ratchet_fwd_commit_index_if_valid(tentative_new_commit_index, self.local_state.current_term())
        {
            Ok(true) => self.apply_committed_mutations(),
            Ok(false) => {}
            Err(ioe) => slog::warn!(
                self.logger,
                "IO failure while confirming new commit index {:?}: {:?}",
                tentative_new_commit_index,
                ioe
            ),
        }
    }
}

/// Highest index held by at least `quorum` replicas, counting ourselves.
pub(super) fn get_cluster_commit_index(
    my_latest_index: Option<Index>,
    mut peers_matched_indexes: Vec<Option<Index>>,
    quorum: usize,
) -> Option<Index> {
    peers_matched_indexes.push(my_latest_index);
    peers_matched_indexes.sort_by(|a, b| b.cmp(a));

    peers_matched_indexes
        .get(quorum.saturating_sub(1))
        .copied()
        .flatten()
}

enum ReplicateError {
    NoLongerLeader,
    PeerConcurrencyThrottle,
    UnknownPeer,
    DiskRead(Index, io::Error),
    UnexpectedMissingLogEntry(Index),
}

enum ReplicationRequest {
    Entries(ProtoAppendEntriesReq, ReplicationDescriptor),
    Snapshot(ProtoInstallSnapshotReq, ReplicationDescriptor),
}

/// Builds the next request for a peer. Only 1 request per peer is outstanding at a time; records
/// are batched up to `max_entries` instead.
fn new_replication_request<L>(
    current_term: Term,
    my_id: &ReplicaId,
    peer_id: &ReplicaId,
    peer_state: &mut PeerState,
    mutation_log: &MutationLog<L>,
    max_entries: usize,
) -> Result<ReplicationRequest, ReplicateError>
where
    L: Log<MutationRecord>,
{
    if peer_state.has_outstanding_request() {
        return Err(ReplicateError::PeerConcurrencyThrottle);
    }
    let seq_no = peer_state.next_seq_no();
    let (next_index, opt_previous_index) = peer_state.next_and_previous_log_index();

    if mutation_log.needs_snapshot_for(next_index) {
        let (_, snapshot_id) = mutation_log
            .snapshot_boundary()
            .expect("A peer can only need a snapshot if we have one");
        let proto_request = ProtoInstallSnapshotReq {
            client_node_id: my_id.as_str().to_string(),
            term: current_term.as_u64(),
            snapshot_id: snapshot_id.as_u64(),
        };
        let descriptor = ReplicationDescriptor {
            peer_id: peer_id.clone(),
            term: current_term,
            seq_no,
            kind: ReplicationKind::Snapshot { snapshot_id },
        };
        return Ok(ReplicationRequest::Snapshot(proto_request, descriptor));
    }

    let previous_log_entry = match opt_previous_index {
        None => None,
        Some(previous_index) => match mutation_log.term_at(previous_index) {
            Ok(Some(term)) => Some((term, previous_index)),
            Ok(None) => return Err(ReplicateError::UnexpectedMissingLogEntry(previous_index)),
            Err(e) => return Err(ReplicateError::DiskRead(previous_index, e)),
        },
    };

    let mut new_entries = Vec::new();
    if let Some(latest_index) = mutation_log.latest_index() {
        if latest_index >= next_index && max_entries > 0 {
            let last = cmp::min(latest_index, next_index.plus(max_entries as u64 - 1));
            for read in mutation_log.read_range(next_index, last) {
                match read {
                    Ok((_, record)) => new_entries.push(record),
                    Err(e) => return Err(ReplicateError::DiskRead(next_index, e)),
                }
            }
        }
    }

    let descriptor = ReplicationDescriptor {
        peer_id: peer_id.clone(),
        term: current_term,
        seq_no,
        kind: ReplicationKind::Entries {
            previous_log_entry_index: opt_previous_index,
            num_log_entries: new_entries.len(),
        },
    };
    let proto_request = build_append_entries_request(
        current_term,
        my_id,
        previous_log_entry,
        mutation_log.commit_index(),
        new_entries,
    );

    Ok(ReplicationRequest::Entries(proto_request, descriptor))
}

// This is the infallible part of creating the request object.
fn build_append_entries_request(
    current_term: Term,
    my_id: &ReplicaId,
    previous_log_entry: Option<(Term, Index)>,
    commit_index: Option<Index>,
    new_entries: Vec<MutationRecord>,
) -> ProtoAppendEntriesReq {
    let (previous_log_entry_term, previous_log_entry_index) = match previous_log_entry {
        None => (0, 0),
        Some((term, index)) => (term.as_u64(), index.as_u64()),
    };

    let new_entries = new_entries
        .into_iter()
        .map(|record| ProtoLogEntry {
            term: record.term.as_u64(),
            timestamp: record.timestamp,
            mutation_type: record.mutation_type,
            payload: record.payload.to_vec(),
        })
        .collect();

    ProtoAppendEntriesReq {
        client_node_id: my_id.as_str().to_string(),
        term: current_term.as_u64(),
        commit_index: commit_index.map(|ci| ci.as_u64()).unwrap_or(0),
        previous_log_entry_term,
        previous_log_entry_index,
        new_entries,
    }
}
