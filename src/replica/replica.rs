use crate::actor::{Callback, WeakActorClient};
use crate::automaton::{CompositeAutomaton, HandlerError, MutationContext, MutationError, MALFORMED_MUTATION};
use crate::clock;
use crate::commitlog::{Index, Log};
use crate::replica::election::{CurrentLeader, ElectionConfig, ElectionState, ReplicaState, ReplicaStatusListener};
use crate::replica::local_state::{PersistentLocalState, Term};
use crate::replica::mutation_log::{MutationLog, MutationRecord, NO_OP_MUTATION_TYPE};
use crate::replica::peers::{ClusterTracker, ReplicaId};
use crate::replica::replica_api::{
    AppendEntriesError, AppendEntriesInput, AppendEntriesOutput, CommitDeadline, CommitMutationError,
    CommitMutationInput, ExecuteTransientInput, InstallSnapshotError, InstallSnapshotInput, InstallSnapshotOutput,
    LeaderRedirectInfo, MutationResponse, QueryError, QueryInput, ReplicaDiagnostics, RequestVoteError,
    RequestVoteInput, RequestVoteOutput, RequestVoteReplyFromPeer, RequestVoteResult, TermOutOfDateInfo,
};
use crate::snapshot::{DownloadOptions, SnapshotStore};
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use std::{cmp, io, mem, process};

mod peer_calls;
mod replication;
mod snapshots;

/// When a replica serializes its automaton into a new local snapshot.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum SnapshotThreshold {
    Off,
    /// Every time the applied sequence number reaches a multiple of this.
    Mutations(u64),
}

#[derive(Clone, Debug)]
pub(crate) struct ReplicaOptions {
    pub(crate) leader_heartbeat_duration: Duration,
    pub(crate) follower_min_timeout: Duration,
    pub(crate) follower_max_timeout: Duration,
    pub(crate) append_entries_timeout: Duration,
    pub(crate) commit_timeout: Duration,
    pub(crate) quorum: usize,
    pub(crate) max_entries_per_append: usize,
    pub(crate) snapshot_threshold: SnapshotThreshold,
    pub(crate) snapshots_to_keep: usize,
    pub(crate) snapshot_download: DownloadOptions,
}

pub(crate) struct ReplicaConfig<L, S>
where
    L: Log<MutationRecord>,
    S: PersistentLocalState,
{
    pub(crate) logger: slog::Logger,
    pub(crate) cluster_tracker: ClusterTracker,
    pub(crate) mutation_log: L,
    pub(crate) local_state: S,
    pub(crate) snapshot_store: Arc<dyn SnapshotStore>,
    pub(crate) automaton: CompositeAutomaton,
    pub(crate) actor_client: WeakActorClient,
    pub(crate) options: ReplicaOptions,
}

#[derive(Debug, thiserror::Error)]
pub enum ReplicaRecoveryError {
    #[error("Failed to read local storage")]
    Io(#[from] io::Error),
    #[error("Latest local snapshot can't be loaded")]
    CorruptSnapshot(#[from] HandlerError),
}

struct PendingCommit {
    term: Term,
    callback: Callback<MutationResponse, CommitMutationError>,
}

/// Replica is one member of a replicated cell: it owns the mutation log, the automaton and the
/// election state. Every method runs on the actor task; anything slow is spawned and reports back
/// as an event.
pub(crate) struct Replica<L, S>
where
    L: Log<MutationRecord>,
    S: PersistentLocalState,
{
    logger: slog::Logger,
    my_replica_id: ReplicaId,
    cluster_tracker: ClusterTracker,
    local_state: S,
    election_state: ElectionState,
    mutation_log: MutationLog<L>,
    automaton: CompositeAutomaton,
    snapshot_store: Arc<dyn SnapshotStore>,
    actor_client: WeakActorClient,
    options: ReplicaOptions,

    // Leader only. Keyed by sequence number.
    pending_commits: BTreeMap<Index, PendingCommit>,
    leader_noop_index: Option<Index>,

    snapshot_in_progress: Option<Index>,
    downloading_snapshot: Option<Index>,
    // Highest commit index a leader told us about.
    leader_commit_index: Option<Index>,
}

impl<L, S> Replica<L, S>
where
    L: Log<MutationRecord> + 'static,
    S: PersistentLocalState,
{
    /// Loads the latest local snapshot into the automaton and recovers the log that continues it.
    /// Records past the snapshot are applied once a leader confirms they are committed.
    pub(crate) fn new(config: ReplicaConfig<L, S>) -> Result<(Self, ReplicaStatusListener), ReplicaRecoveryError> {
        let ReplicaConfig {
            logger,
            cluster_tracker,
            mutation_log,
            local_state,
            snapshot_store,
            mut automaton,
            actor_client,
            options,
        } = config;

        let snapshot_boundary = match snapshot_store.latest_snapshot_id(None)? {
            None => None,
            Some(snapshot_id) => {
                let snapshot = snapshot_store.read_state(snapshot_id)?.ok_or_else(|| {
                    io::Error::new(io::ErrorKind::NotFound, "Latest snapshot vanished while loading it")
                })?;
                automaton.load_snapshot(&snapshot.state)?;
                slog::info!(logger, "Loaded snapshot"; "SnapshotId" => ?snapshot_id);
                Some((Term::new(snapshot.meta.last_included_term), snapshot_id))
            }
        };
        let mutation_log = MutationLog::new(logger.new(slog::o!()), mutation_log, snapshot_boundary)?;

        let my_replica_id = cluster_tracker.my_replica_id().clone();
        let (election_state, status_listener) = ElectionState::new_follower(
            ElectionConfig {
                my_replica_id: my_replica_id.clone(),
                leader_heartbeat_duration: options.leader_heartbeat_duration,
                follower_min_timeout: options.follower_min_timeout,
                follower_max_timeout: options.follower_max_timeout,
            },
            actor_client.clone(),
            local_state.current_term(),
        );

        slog::info!(
            logger,
            "Recovered replica";
            "Term" => ?local_state.current_term(),
            "LatestLogIndex" => ?mutation_log.latest_index(),
            "SnapshotId" => ?snapshot_boundary.map(|(_, id)| id)
        );

        let replica = Replica {
            logger,
            my_replica_id,
            cluster_tracker,
            local_state,
            election_state,
            mutation_log,
            automaton,
            snapshot_store,
            actor_client,
            options,
            pending_commits: BTreeMap::new(),
            leader_noop_index: None,
            snapshot_in_progress: None,
            downloading_snapshot: None,
            leader_commit_index: None,
        };

        Ok((replica, status_listener))
    }

    pub(crate) fn handle_commit_mutation(
        &mut self,
        input: CommitMutationInput,
        callback: Callback<MutationResponse, CommitMutationError>,
    ) {
        if let Err(e) = self.check_active_leader() {
            callback.send(Err(e));
            return;
        }
        if input.mutation_type == NO_OP_MUTATION_TYPE || !self.automaton.handles_mutation(&input.mutation_type) {
            callback.send(Err(CommitMutationError::UnknownMutationType(input.mutation_type)));
            return;
        }
        if let Err(e) = self.automaton.validate_mutation(&input.mutation_type, &input.payload) {
            callback.send(Err(CommitMutationError::MalformedPayload(e.to_string())));
            return;
        }

        let term = self.local_state.current_term();
        let record = MutationRecord {
            term,
            timestamp: clock::wall_clock_millis(),
            mutation_type: input.mutation_type,
            payload: input.payload,
        };
        let index = match self.mutation_log.append(record) {
            Ok(index) => index,
            Err(e) => {
                callback.send(Err(CommitMutationError::LocalIoError(e)));
                return;
            }
        };

        self.pending_commits.insert(index, PendingCommit { term, callback });
        self.spawn_commit_deadline(CommitDeadline { term, index });

        // A cell without peers commits on its own.
        self.try_advance_commit_index();
        self.replicate_to_all_peers();
    }

    pub(crate) fn handle_execute_transient(
        &mut self,
        input: ExecuteTransientInput,
    ) -> Result<Result<Vec<u8>, MutationError>, CommitMutationError> {
        self.check_active_leader()?;

        match self
            .automaton
            .execute_transient(clock::wall_clock_millis(), &input.mutation_type, &input.payload)
        {
            Ok(response) => Ok(Ok(response)),
            Err(HandlerError::Rejected(e)) => Ok(Err(e)),
            Err(HandlerError::UnknownMutationType(t)) => Err(CommitMutationError::UnknownMutationType(t)),
            Err(e) => Err(CommitMutationError::MalformedPayload(e.to_string())),
        }
    }

    /// Reads local state, which may lag the leader.
    pub(crate) fn handle_query(&self, input: QueryInput) -> Result<Vec<u8>, QueryError> {
        self.automaton
            .query(&input.query_type, &input.payload)
            .map_err(|e| match e {
                HandlerError::Rejected(e) => QueryError::Rejected(e),
                other => QueryError::Handler(other.to_string()),
            })
    }

    pub(crate) fn diagnose(&self) -> ReplicaDiagnostics {
        ReplicaDiagnostics {
            status: self.election_state.current_status(),
            commit_index: self.mutation_log.commit_index(),
            last_applied_index: self.mutation_log.last_applied_index(),
            latest_log_index: self.mutation_log.latest_index(),
            snapshot_id: self.mutation_log.snapshot_boundary().map(|(_, id)| id),
            state_hash: self.automaton.state_hash(),
        }
    }

    pub(crate) fn shutdown(&mut self) {
        self.election_state.transition_to_stopped();
        self.fail_pending_commits(|| CommitMutationError::Stopped);
        slog::info!(self.logger, "Replica stopped");
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.election_state.is_stopped()
    }

    fn check_active_leader(&self) -> Result<(), CommitMutationError> {
        let status = self.election_state.current_status();
        match status.state {
            ReplicaState::Leading => Ok(()),
            ReplicaState::LeaderRecovery => Err(CommitMutationError::NotActiveLeader(status.state)),
            ReplicaState::Stopped => Err(CommitMutationError::Stopped),
            _ => match self.election_state.current_leader() {
                CurrentLeader::Other(leader) => Err(CommitMutationError::LeaderRedirect(leader)),
                CurrentLeader::Me | CurrentLeader::Unknown => Err(CommitMutationError::NoLeader),
            },
        }
    }

    fn spawn_commit_deadline(&self, deadline: CommitDeadline) {
        let actor_client = self.actor_client.clone();
        let commit_timeout = self.options.commit_timeout;
        tokio::task::spawn(async move {
            tokio::time::sleep(commit_timeout).await;
            actor_client.commit_deadline(deadline).await;
        });
    }

    pub(crate) fn handle_commit_deadline(&mut self, deadline: CommitDeadline) {
        match self.pending_commits.get(&deadline.index) {
            Some(pending) if pending.term == deadline.term => {}
            _ => return,
        }

        slog::warn!(
            self.logger,
            "Mutation wasn't committed in time. Stepping down.";
            "SequenceNumber" => ?deadline.index,
            "Term" => ?deadline.term
        );
        if let Some(pending) = self.pending_commits.remove(&deadline.index) {
            pending.callback.send(Err(CommitMutationError::CommitTimeout));
        }
        if self.election_state.is_leader() && self.local_state.current_term() == deadline.term {
            self.become_follower(deadline.term, None);
        }
    }

    fn fail_pending_commits<F: Fn() -> CommitMutationError>(&mut self, error: F) {
        for (_, pending) in mem::take(&mut self.pending_commits) {
            pending.callback.send(Err(error()));
        }
    }

    fn become_follower(&mut self, term: Term, leader: Option<LeaderRedirectInfo>) {
        let was_leader = self.election_state.is_leader();
        self.election_state.transition_to_follower(term, leader);
        if was_leader {
            self.leader_noop_index = None;
            self.automaton.on_stop_leading();
            self.fail_pending_commits(|| CommitMutationError::LeadershipLost);
            slog::info!(self.logger, "Stepped down as leader"; "Term" => ?term);
        }
        self.update_follower_recovery();
    }

    fn become_leader(&mut self, term: Term) {
        self.election_state.transition_to_leader(
            term,
            self.cluster_tracker.peer_ids(),
            self.mutation_log.latest_index(),
        );

        // Committing a record of our own term commits everything before it.
        match self
            .mutation_log
            .append(MutationRecord::no_op(term, clock::wall_clock_millis()))
        {
            Ok(index) => {
                self.leader_noop_index = Some(index);
                slog::info!(self.logger, "Became leader"; "Term" => ?term, "NoOpIndex" => ?index);
            }
            Err(e) => {
                slog::error!(self.logger, "Failed to append leader no-op: {:?}", e);
                self.become_follower(term, None);
                return;
            }
        }

        self.try_advance_commit_index();
    }

    fn update_follower_recovery(&mut self) {
        let behind_leader = match (self.leader_commit_index, self.mutation_log.last_applied_index()) {
            (Some(leader_commit), Some(applied)) => applied < leader_commit,
            (Some(_), None) => true,
            (None, _) => false,
        };
        self.election_state
            .set_follower_recovering(behind_leader || self.downloading_snapshot.is_some());
    }

    /// Applies every committed record not yet applied, in order.
    fn apply_committed_mutations(&mut self) {
        while let Some(index) = self.mutation_log.next_to_apply() {
            let record = match self.mutation_log.read(index) {
                Ok(Some(record)) => record,
                Ok(None) => self.abort_on_apply_failure(index, "<missing>", "Committed record is missing from the log"),
                Err(e) => {
                    // Retried on the next commit.
                    slog::error!(self.logger, "Failed to read committed record {:?}: {:?}", index, e);
                    return;
                }
            };

            let result = if record.is_no_op() {
                Ok(Vec::new())
            } else {
                self.apply_record(index, &record)
            };
            self.mutation_log.mark_applied(index);

            if let Some(pending) = self.pending_commits.remove(&index) {
                if pending.term == record.term {
                    pending.callback.send(Ok(MutationResponse {
                        sequence_number: index,
                        result,
                    }));
                } else {
                    pending.callback.send(Err(CommitMutationError::LeadershipLost));
                }
            }
            if self.leader_noop_index == Some(index) {
                self.election_state.mark_leader_recovered();
            }
            self.maybe_build_snapshot(index, record.term);
        }

        self.update_follower_recovery();
    }

    fn apply_record(&mut self, index: Index, record: &MutationRecord) -> Result<Vec<u8>, MutationError> {
        let context = MutationContext {
            sequence_number: index.as_u64(),
            term: record.term.as_u64(),
            timestamp: record.timestamp,
        };

        let automaton = &mut self.automaton;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            automaton.apply_mutation(&context, &record.mutation_type, &record.payload)
        }));

        match outcome {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(HandlerError::Rejected(e))) => Err(e),
            Ok(Err(e @ HandlerError::MalformedPayload { .. })) => {
                slog::warn!(self.logger, "Committed mutation doesn't decode: {}", e; "SequenceNumber" => ?index);
                Err(MutationError::new(MALFORMED_MUTATION, e.to_string()))
            }
            Ok(Err(e)) => self.abort_on_apply_failure(index, &record.mutation_type, &e.to_string()),
            Err(panic_payload) => {
                let message = panic_payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic_payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "<non-string panic>".to_string());
                self.abort_on_apply_failure(index, &record.mutation_type, &message)
            }
        }
    }

    /// Replicas that can't apply a committed mutation would diverge from the rest of the cell.
    fn abort_on_apply_failure(&self, index: Index, mutation_type: &str, error: &str) -> ! {
        slog::crit!(
            self.logger,
            "Failed to apply committed mutation";
            "SequenceNumber" => ?index,
            "MutationType" => mutation_type,
            "Error" => error
        );
        // The async drain may not flush before abort.
        eprintln!(
            "Failed to apply committed mutation {:?} ({}): {}",
            index, mutation_type, error
        );
        process::abort();
    }

    pub(crate) fn server_handle_request_vote(
        &mut self,
        input: RequestVoteInput,
    ) -> Result<RequestVoteOutput, RequestVoteError> {
        // Ensure candidate is known member.
        if !self.cluster_tracker.contains_member(&input.candidate_id) {
            return Err(RequestVoteError::CandidateNotInCluster);
        }

        let (current_term, mut opt_voted_for) = self.local_state.voted_for_current_term();

        // > Reply false if term < currentTerm
        if input.candidate_term < current_term {
            slog::info!(self.logger, "Not granting vote. Candidate term is out of date."; "Candidate" => ?input.candidate_id);
            return Ok(RequestVoteOutput {
                vote_granted: false,
                current_term,
            });
        }

        // > If RPC request or response contains term T > currentTerm:
        // > set currentTerm = T, convert to follower
        let increased = self
            .local_state
            .store_term_if_increased(input.candidate_term)
            .map_err(RequestVoteError::ServerIoError)?;
        if increased {
            self.become_follower(input.candidate_term, None);
            slog::info!(
                self.logger,
                "Observed increased term in RequestVote call. Election state: {:?}",
                self.election_state
            );
            opt_voted_for = None;
        }
        let current_term = input.candidate_term;
        let not_granted = Ok(RequestVoteOutput {
            vote_granted: false,
            current_term,
        });

        if let Some(voted_for) = opt_voted_for {
            if *voted_for != input.candidate_id {
                slog::info!(self.logger, "Not granting vote. We already voted for {:?}.", voted_for);
                return not_granted;
            }
        }

        if !self.is_candidate_log_gte_mine(input.candidate_last_log_entry) {
            slog::info!(self.logger, "Not granting vote. Candidate log is out of date.");
            return not_granted;
        }

        let cas_success = self
            .local_state
            .store_vote_for_term_if_unvoted(input.candidate_term, input.candidate_id.clone())
            .map_err(RequestVoteError::ServerIoError)?;
        let granted = cas_success
            || matches!(
                self.local_state.voted_for_current_term(),
                (term, Some(voted_for)) if term == input.candidate_term && *voted_for == input.candidate_id
            );

        if granted {
            slog::info!(self.logger, "Voting for {:?}.", input.candidate_id);
            self.election_state.reset_timeout_if_follower();
            Ok(RequestVoteOutput {
                vote_granted: true,
                current_term,
            })
        } else {
            not_granted
        }
    }

    fn is_candidate_log_gte_mine(&self, candidate_last_entry: Option<(Term, Index)>) -> bool {
        // > If the logs have last entries with different terms, then the log with the later term
        // > is more up-to-date. If the logs end with the same term, then whichever log is longer
        // > is more up-to-date.
        match (self.mutation_log.latest_entry(), candidate_last_entry) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some((my_term, my_index)), Some((candidate_term, candidate_index))) => {
                (candidate_term, candidate_index) >= (my_term, my_index)
            }
        }
    }

    pub(crate) fn handle_election_timeout(&mut self) {
        if self.election_state.is_leader() || self.election_state.is_stopped() {
            // Timer event that raced with a transition.
            return;
        }

        // Write-ahead: vote for self on local state before transitioning to candidate.
        let new_term = match self.local_state.increment_term_and_vote_for_self() {
            Ok(term) => term,
            Err(e) => {
                slog::error!(self.logger, "Failed to persist new term. Not starting election: {:?}", e);
                return;
            }
        };
        self.election_state.transition_to_candidate_and_vote_for_self(new_term);
        slog::info!(
            self.logger,
            "Election timeout. Changed to candidate. Election state: {:?}",
            self.election_state
        );

        if self.options.quorum <= 1 {
            self.become_leader(new_term);
            return;
        }

        for peer in self.cluster_tracker.iter_peers() {
            tokio::task::spawn(peer_calls::call_peer_request_vote(
                self.logger.new(slog::o!("Peer" => peer.member.replica_id.as_str().to_string())),
                peer.client.clone(),
                peer.member.replica_id.clone(),
                self.new_request_vote_request(new_term),
                self.options.append_entries_timeout,
                None,
                self.actor_client.clone(),
                new_term,
            ));
        }
    }

    fn new_request_vote_request(&self, term: Term) -> crate::grpc::ProtoRequestVoteReq {
        let (last_log_entry_term, last_log_entry_index) = match self.mutation_log.latest_entry() {
            None => (0, 0),
            Some((term, index)) => (term.as_u64(), index.as_u64()),
        };

        crate::grpc::ProtoRequestVoteReq {
            client_node_id: self.my_replica_id.as_str().to_string(),
            term: term.as_u64(),
            last_log_entry_index,
            last_log_entry_term,
        }
    }

    pub(crate) fn handle_request_vote_reply_from_peer(&mut self, reply: RequestVoteReplyFromPeer) {
        let current_term = self.local_state.current_term();
        if current_term != reply.term {
            slog::info!(
                self.logger,
                "Received vote for outdated term {:?}, current term: {:?}.",
                reply.term,
                current_term
            );
            return;
        }

        match reply.result {
            RequestVoteResult::VoteGranted => {
                let num_votes_received = match self.election_state.add_vote_if_candidate(reply.peer_id) {
                    Some(v) => v,
                    None => return,
                };

                slog::info!(
                    self.logger,
                    "Received {}/{} votes for term {:?}",
                    num_votes_received,
                    self.options.quorum,
                    reply.term
                );
                if num_votes_received >= self.options.quorum {
                    self.become_leader(reply.term);
                }
            }
            RequestVoteResult::VoteNotGranted { peer_term } => {
                slog::info!(self.logger, "Vote not granted from {:?} for term {:?}", reply.peer_id, reply.term);
                if peer_term > current_term {
                    match self.local_state.store_term_if_increased(peer_term) {
                        Ok(true) => self.become_follower(peer_term, None),
                        Ok(false) => {}
                        Err(e) => slog::error!(self.logger, "Failed to persist observed term: {:?}", e),
                    }
                }
            }
            RequestVoteResult::RetryableFailure | RequestVoteResult::MalformedReply => {
                if !self.election_state.is_candidate() {
                    return;
                }
                if let Some(peer) = self.cluster_tracker.peer(&reply.peer_id) {
                    tokio::task::spawn(peer_calls::call_peer_request_vote(
                        self.logger.new(slog::o!("Peer" => reply.peer_id.as_str().to_string())),
                        peer.client.clone(),
                        reply.peer_id.clone(),
                        self.new_request_vote_request(reply.term),
                        self.options.append_entries_timeout,
                        Some(self.options.leader_heartbeat_duration),
                        self.actor_client.clone(),
                        reply.term,
                    ));
                }
            }
        }
    }

    pub(crate) fn server_handle_append_entries(
        &mut self,
        input: AppendEntriesInput,
    ) -> Result<AppendEntriesOutput, AppendEntriesError> {
        let leader = match self.cluster_tracker.member(&input.leader_id) {
            Some(member) => LeaderRedirectInfo::from(member),
            None => return Err(AppendEntriesError::ClientNotInCluster),
        };

        let current_term = self.local_state.current_term();
        if input.leader_term < current_term {
            return Err(AppendEntriesError::ClientTermOutOfDate(TermOutOfDateInfo { current_term }));
        }
        if !self
            .observe_leader(input.leader_term, leader)
            .map_err(AppendEntriesError::ServerIoError)?
        {
            return Err(AppendEntriesError::ClientTermOutOfDate(TermOutOfDateInfo { current_term }));
        }

        // > Reply false if log doesn't contain an entry at prevLogIndex whose term matches
        // > prevLogTerm
        if let Some((leader_prev_term, leader_prev_index)) = input.leader_previous_log_entry {
            let covered_by_snapshot =
                matches!(self.mutation_log.snapshot_boundary(), Some((_, boundary)) if leader_prev_index <= boundary);
            let matches_mine = covered_by_snapshot
                || self
                    .mutation_log
                    .term_at(leader_prev_index)
                    .map_err(AppendEntriesError::ServerIoError)?
                    == Some(leader_prev_term);
            if !matches_mine {
                let last_log_index = match (leader_prev_index.checked_minus(1), self.mutation_log.latest_index()) {
                    (Some(before_prev), Some(latest)) => Some(cmp::min(before_prev, latest)),
                    _ => None,
                };
                return Err(AppendEntriesError::ServerMissingPreviousLogEntry { last_log_index });
            }
        }

        // > If an existing entry conflicts with a new one (same index but different terms),
        // > delete the existing entry and all that follow it. Append any new entries not already
        // > in the log.
        let first_writable = self.mutation_log.first_index();
        let commit_index = self.mutation_log.commit_index();
        let mut next_entry_index = input
            .leader_previous_log_entry
            .map(|(_, index)| index.plus(1))
            .unwrap_or_else(Index::start_index);
        for new_entry in input.new_entries {
            let index = next_entry_index;
            next_entry_index = next_entry_index.plus(1);

            // Committed records agree with every leader's.
            if index < first_writable || matches!(commit_index, Some(ci) if index <= ci) {
                continue;
            }

            match self
                .mutation_log
                .term_at(index)
                .map_err(AppendEntriesError::ServerIoError)?
            {
                Some(existing_term) if existing_term == new_entry.term => continue,
                Some(_) => {
                    slog::info!(self.logger, "Truncating conflicting log suffix"; "From" => ?index);
                    self.mutation_log
                        .truncate(index)
                        .map_err(AppendEntriesError::ServerIoError)?;
                }
                None => {}
            }

            let appended_index = self
                .mutation_log
                .append(new_entry)
                .map_err(AppendEntriesError::ServerIoError)?;
            assert_eq!(appended_index, index, "Appended log entry to unexpected index.");
        }

        // > If leaderCommit > commitIndex, set commitIndex = min(leaderCommit, index of last new
        // > entry)
        if let Some(leader_commit_index) = input.leader_commit_index {
            if let Some(last_new_index) = next_entry_index.checked_minus(1) {
                self.mutation_log
                    .ratchet_fwd_commit_index_if_changed(cmp::min(leader_commit_index, last_new_index));
            }
            self.leader_commit_index = cmp::max(self.leader_commit_index, Some(leader_commit_index));
        }

        self.apply_committed_mutations();

        Ok(AppendEntriesOutput {})
    }

    pub(crate) fn server_handle_install_snapshot(
        &mut self,
        input: InstallSnapshotInput,
    ) -> Result<InstallSnapshotOutput, InstallSnapshotError> {
        let leader = match self.cluster_tracker.member(&input.leader_id) {
            Some(member) => LeaderRedirectInfo::from(member),
            None => return Err(InstallSnapshotError::ClientNotInCluster),
        };

        let current_term = self.local_state.current_term();
        if input.leader_term < current_term {
            return Err(InstallSnapshotError::ClientTermOutOfDate(TermOutOfDateInfo { current_term }));
        }
        if !self
            .observe_leader(input.leader_term, leader)
            .map_err(InstallSnapshotError::ServerIoError)?
        {
            return Err(InstallSnapshotError::ClientTermOutOfDate(TermOutOfDateInfo { current_term }));
        }

        self.leader_commit_index = cmp::max(self.leader_commit_index, Some(input.snapshot_id));
        let applied = self.mutation_log.last_applied_index();
        if matches!(applied, Some(applied) if applied >= input.snapshot_id) {
            self.update_follower_recovery();
            return Ok(InstallSnapshotOutput {
                installed: true,
                last_included_index: applied,
            });
        }

        if self.downloading_snapshot.is_none() {
            self.start_snapshot_download(input.snapshot_id);
        }
        self.update_follower_recovery();

        Ok(InstallSnapshotOutput {
            installed: false,
            last_included_index: None,
        })
    }

    /// Follows the leader of `leader_term`, which is at least our current term. Returns false if
    /// we lead that same term ourselves, which means the caller is confused.
    fn observe_leader(&mut self, leader_term: Term, leader: LeaderRedirectInfo) -> io::Result<bool> {
        let increased = self.local_state.store_term_if_increased(leader_term)?;
        if increased || self.election_state.is_candidate() {
            self.become_follower(leader_term, Some(leader));
        } else if self.election_state.is_leader() {
            slog::error!(
                self.logger,
                "Another replica claims leadership of my term";
                "Other" => ?leader.replica_id,
                "Term" => ?leader_term
            );
            return Ok(false);
        } else {
            self.election_state.set_leader_if_unknown(&leader);
        }

        self.election_state.reset_timeout_if_follower();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{ActorClient, ReplicaActor};
    use crate::automaton::test_util::{list_automaton, APPEND, ECHO, LEN, PUSH_U64, PUSH_U64_UNCHECKED, REJECT};
    use crate::commitlog::{SegmentedDiskLog, StorageConfig};
    use crate::replica::local_state::VolatileLocalState;
    use crate::replica::peers::MemberInfo;
    use crate::snapshot::{BackoffOptions, FileSnapshotStore};
    use bytes::Bytes;
    use std::net::Ipv4Addr;
    use std::path::Path;

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn options(snapshot_threshold: SnapshotThreshold) -> ReplicaOptions {
        ReplicaOptions {
            leader_heartbeat_duration: Duration::from_millis(20),
            follower_min_timeout: Duration::from_millis(30),
            follower_max_timeout: Duration::from_millis(60),
            append_entries_timeout: Duration::from_millis(100),
            commit_timeout: Duration::from_secs(5),
            quorum: 1,
            max_entries_per_append: 16,
            snapshot_threshold,
            snapshots_to_keep: 2,
            snapshot_download: DownloadOptions {
                block_size: 1024,
                rpc_timeout: Duration::from_millis(100),
                backoff: BackoffOptions::default(),
            },
        }
    }

    fn single_member() -> MemberInfo {
        MemberInfo {
            replica_id: ReplicaId::new("solo"),
            ip: Ipv4Addr::LOCALHOST,
            port: 1,
        }
    }

    /// Starts a single-replica cell on `dir` and waits until it leads.
    async fn start_solo(dir: &Path) -> (ActorClient, tokio::task::JoinHandle<()>) {
        let (actor_client, rx) = ActorClient::new(16);
        let cluster_tracker = ClusterTracker::create_valid_cluster(single_member(), vec![single_member()]).unwrap();
        let log = SegmentedDiskLog::open(StorageConfig {
            directory: dir.join("changelog"),
            segment_max_bytes: 512,
        })
        .unwrap();
        let (replica, mut listener) = Replica::new(ReplicaConfig {
            logger: logger(),
            cluster_tracker,
            mutation_log: log,
            local_state: VolatileLocalState::new(ReplicaId::new("solo")),
            snapshot_store: Arc::new(FileSnapshotStore::open(dir.join("snapshots")).unwrap()),
            automaton: list_automaton(),
            actor_client: actor_client.weak(),
            options: options(SnapshotThreshold::Mutations(3)),
        })
        .unwrap();
        let join = tokio::spawn(ReplicaActor::new(logger(), rx, replica).run_event_loop());

        loop {
            let status = listener.next().await.unwrap();
            if status.state == ReplicaState::Leading {
                break;
            }
        }
        (actor_client, join)
    }

    async fn append(client: &ActorClient, item: &'static [u8]) -> MutationResponse {
        client
            .commit_mutation(CommitMutationInput {
                mutation_type: APPEND.to_string(),
                payload: Bytes::from_static(item),
            })
            .await
            .unwrap()
    }

    #[test]
    fn test_commit_checker_logic() {
        fn run(expected: u64, me: u64, peers: Vec<u64>, quorum: usize) {
            let peers = peers.into_iter().map(Index::from_u64).collect();
            assert_eq!(
                Index::from_u64(expected),
                replication::get_cluster_commit_index(Index::from_u64(me), peers, quorum)
            );
        }

        // 3-cluster
        run(0, 0, vec![0, 0], 2);
        run(9, 9, vec![0, 9], 2);
        run(9, 9, vec![8, 9], 2);
        run(8, 9, vec![8, 0], 2);

        // 5-cluster
        run(0, 9, vec![0, 0, 0, 9], 3);
        run(8, 9, vec![0, 0, 8, 9], 3);
        run(8, 9, vec![0, 7, 8, 9], 3);
        run(7, 9, vec![6, 0, 8, 7], 3);

        // Larger quorums wait for more peers.
        run(7, 9, vec![6, 7, 8, 9], 4);
        run(6, 9, vec![6, 7, 8, 9], 5);

        // Single replica
        run(4, 4, vec![], 1);
    }

    #[tokio::test]
    async fn solo_replica_commits_applies_and_answers() {
        let dir = tempfile::tempdir().unwrap();
        let (client, _join) = start_solo(dir.path()).await;

        // Sequence number 1 is the leader's no-op.
        let response = append(&client, b"a").await;
        assert_eq!(response.sequence_number, Index::new(2));
        assert_eq!(response.result, Ok(1u64.to_le_bytes().to_vec()));

        let rejected = client
            .commit_mutation(CommitMutationInput {
                mutation_type: REJECT.to_string(),
                payload: Bytes::new(),
            })
            .await
            .unwrap();
        assert_eq!(rejected.sequence_number, Index::new(3));
        assert_eq!(rejected.result.unwrap_err().code, 7);

        let unknown = client
            .commit_mutation(CommitMutationInput {
                mutation_type: "nobody.handles".to_string(),
                payload: Bytes::new(),
            })
            .await;
        assert!(matches!(unknown, Err(CommitMutationError::UnknownMutationType(_))));

        let echoed = client
            .execute_transient(ExecuteTransientInput {
                mutation_type: ECHO.to_string(),
                payload: Bytes::from_static(b"hi"),
            })
            .await
            .unwrap();
        assert_eq!(echoed, Ok(b"hi".to_vec()));

        let len = client
            .query(QueryInput {
                query_type: LEN.to_string(),
                payload: Bytes::new(),
            })
            .await
            .unwrap();
        assert_eq!(len, 1u64.to_le_bytes().to_vec());

        let diagnostics = client.diagnose().await.unwrap();
        assert_eq!(diagnostics.status.state, ReplicaState::Leading);
        assert_eq!(diagnostics.commit_index, Some(Index::new(3)));
        assert_eq!(diagnostics.last_applied_index, Some(Index::new(3)));

        client.shutdown().await.unwrap();
        let after = append_after_shutdown(&client).await;
        assert!(matches!(after, Err(CommitMutationError::ActorExited)));
    }

    async fn append_after_shutdown(client: &ActorClient) -> Result<MutationResponse, CommitMutationError> {
        client
            .commit_mutation(CommitMutationInput {
                mutation_type: APPEND.to_string(),
                payload: Bytes::from_static(b"late"),
            })
            .await
    }

    #[tokio::test]
    async fn malformed_payloads_are_refused_or_rejected_without_stopping_the_replica() {
        let dir = tempfile::tempdir().unwrap();
        let (client, _join) = start_solo(dir.path()).await;

        let refused = client
            .commit_mutation(CommitMutationInput {
                mutation_type: PUSH_U64.to_string(),
                payload: Bytes::from_static(b"garbage"),
            })
            .await;
        assert!(matches!(refused, Err(CommitMutationError::MalformedPayload(_))));

        // The refused mutation took no sequence number; the apply-time failure does.

        let rejected = client
            .commit_mutation(CommitMutationInput {
                mutation_type: PUSH_U64_UNCHECKED.to_string(),
                payload: Bytes::from_static(b"garbage"),
            })
            .await
            .unwrap();
        assert_eq!(rejected.sequence_number, Index::new(2));
        assert_eq!(rejected.result.unwrap_err().code, MALFORMED_MUTATION);

        let pushed = client
            .commit_mutation(CommitMutationInput {
                mutation_type: PUSH_U64.to_string(),
                payload: Bytes::copy_from_slice(&9u64.to_le_bytes()),
            })
            .await
            .unwrap();
        assert_eq!(pushed.sequence_number, Index::new(3));
        assert_eq!(pushed.result, Ok(1u64.to_le_bytes().to_vec()));

        let diagnostics = client.diagnose().await.unwrap();
        assert_eq!(diagnostics.status.state, ReplicaState::Leading);
        assert_eq!(diagnostics.last_applied_index, Some(Index::new(3)));
    }

    #[tokio::test]
    async fn restart_recovers_from_snapshot_and_log_tail() {
        let dir = tempfile::tempdir().unwrap();

        let (client, join) = start_solo(dir.path()).await;
        for item in &["a", "b", "c", "d", "e"] {
            client
                .commit_mutation(CommitMutationInput {
                    mutation_type: APPEND.to_string(),
                    payload: Bytes::copy_from_slice(item.as_bytes()),
                })
                .await
                .unwrap();
        }
        // Snapshot writes finish in the background.
        let mut before = client.diagnose().await.unwrap();
        for _ in 0..100 {
            if before.snapshot_id.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            before = client.diagnose().await.unwrap();
        }
        assert!(before.snapshot_id.is_some());
        client.shutdown().await.unwrap();
        join.await.unwrap();

        let (client, _join) = start_solo(dir.path()).await;
        let after = client.diagnose().await.unwrap();
        assert_eq!(after.state_hash, before.state_hash);
        let len = client
            .query(QueryInput {
                query_type: LEN.to_string(),
                payload: Bytes::new(),
            })
            .await
            .unwrap();
        assert_eq!(len, 5u64.to_le_bytes().to_vec());
    }
}
