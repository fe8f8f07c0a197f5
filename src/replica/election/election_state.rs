use crate::actor::WeakActorClient;
use crate::commitlog::Index;
use crate::replica::election::state_change_listener::{self, ReplicaStatusNotifier};
use crate::replica::election::timers::{ElectionTimerHandle, HeartbeatTimerHandle};
use crate::replica::election::{LeaderStateTracker, PeerState, ReplicaState, ReplicaStatus, ReplicaStatusListener};
use crate::replica::{LeaderRedirectInfo, ReplicaId, Term};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::time::Duration;

#[derive(Clone)]
pub(crate) struct ElectionConfig {
    pub my_replica_id: ReplicaId,
    pub leader_heartbeat_duration: Duration,
    pub follower_min_timeout: Duration,
    pub follower_max_timeout: Duration,
}

/// Who a request should go to, as far as this replica knows.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum CurrentLeader {
    Me,
    Other(LeaderRedirectInfo),
    Unknown,
}

/// ElectionState holds the state specific to the replica's stage in an election and owns the
/// timers of that stage. Its methods are responsible for "what" to do. It is NOT responsible for
/// validating anything specific to logs, terms or peers, or knowing "when" to do something.
///
/// Every transition publishes a [`ReplicaStatus`].
pub(crate) struct ElectionState {
    state: State,
    term: Term,
    config: ElectionConfig,
    actor_client: WeakActorClient,
    status_notifier: ReplicaStatusNotifier,
}

impl ElectionState {
    /// `new_follower()` creates a new ElectionState instance that starts out as a follower without
    /// a known leader.
    pub(crate) fn new_follower(
        config: ElectionConfig,
        actor_client: WeakActorClient,
        term: Term,
    ) -> (Self, ReplicaStatusListener) {
        let initial_state = State::Follower(FollowerState::new(None, &config, actor_client.clone()));
        let (status_notifier, listener) = state_change_listener::new(Self::status_impl(&initial_state, term));

        let election_state = ElectionState {
            state: initial_state,
            term,
            config,
            actor_client,
            status_notifier,
        };

        (election_state, listener)
    }

    pub(crate) fn transition_to_follower(&mut self, term: Term, new_leader: Option<LeaderRedirectInfo>) {
        if self.is_stopped() {
            return;
        }
        self.term = term;
        self.state = State::Follower(FollowerState::new(new_leader, &self.config, self.actor_client.clone()));
        self.notify_new_status();
    }

    pub(crate) fn transition_to_candidate_and_vote_for_self(&mut self, term: Term) {
        if self.is_stopped() {
            return;
        }
        let mut cs = CandidateState::new(&self.config, self.actor_client.clone());
        cs.add_received_vote(self.config.my_replica_id.clone());

        self.term = term;
        self.state = State::Candidate(cs);
        self.notify_new_status();
    }

    /// The new leader starts in recovery; see [`mark_leader_recovered`](Self::mark_leader_recovered).
    pub(crate) fn transition_to_leader(&mut self, term: Term, peer_ids: Vec<ReplicaId>, latest_log_index: Option<Index>) {
        if self.is_stopped() {
            return;
        }
        self.term = term;
        self.state = State::Leader(LeaderState::new(
            peer_ids,
            latest_log_index,
            self.config.leader_heartbeat_duration,
            self.actor_client.clone(),
            term,
        ));
        self.notify_new_status();
    }

    /// Drops every timer. Final.
    pub(crate) fn transition_to_stopped(&mut self) {
        self.state = State::Stopped;
        self.notify_new_status();
    }

    pub(crate) fn mark_leader_recovered(&mut self) {
        if let State::Leader(ls) = &mut self.state {
            if ls.recovering {
                ls.recovering = false;
                self.notify_new_status();
            }
        }
    }

    pub(crate) fn set_follower_recovering(&mut self, recovering: bool) {
        if let State::Follower(fs) = &mut self.state {
            if fs.recovering != recovering {
                fs.recovering = recovering;
                self.notify_new_status();
            }
        }
    }

    pub(crate) fn is_stopped(&self) -> bool {
        matches!(self.state, State::Stopped)
    }

    pub(crate) fn is_leader(&self) -> bool {
        matches!(self.state, State::Leader(_))
    }

    pub(crate) fn is_candidate(&self) -> bool {
        matches!(self.state, State::Candidate(_))
    }

    pub(crate) fn current_status(&self) -> ReplicaStatus {
        Self::status_impl(&self.state, self.term)
    }

    pub(crate) fn current_leader(&self) -> CurrentLeader {
        match &self.state {
            State::Leader(_) => CurrentLeader::Me,
            State::Follower(FollowerState {
                leader: Some(leader), ..
            }) => CurrentLeader::Other(leader.clone()),
            _ => CurrentLeader::Unknown,
        }
    }

    fn status_impl(state: &State, term: Term) -> ReplicaStatus {
        let (state, leader) = match state {
            State::Stopped => (ReplicaState::Stopped, None),
            State::Leader(ls) if ls.recovering => (ReplicaState::LeaderRecovery, None),
            State::Leader(_) => (ReplicaState::Leading, None),
            State::Candidate(_) => (ReplicaState::Elections, None),
            State::Follower(FollowerState { leader: None, .. }) => (ReplicaState::Elections, None),
            State::Follower(FollowerState {
                leader: Some(leader),
                recovering,
                ..
            }) => {
                let state = if *recovering {
                    ReplicaState::FollowerRecovery
                } else {
                    ReplicaState::Following
                };
                (state, Some(leader.clone()))
            }
        };

        ReplicaStatus { state, term, leader }
    }

    fn notify_new_status(&mut self) {
        let status = Self::status_impl(&self.state, self.term);
        self.status_notifier.notify_new_status(status);
    }

    pub(crate) fn reset_timeout_if_follower(&self) {
        if let State::Follower(fs) = &self.state {
            fs.election_timer.reset_timeout();
        }
    }

    pub(crate) fn set_leader_if_unknown(&mut self, leader: &LeaderRedirectInfo) {
        if let State::Follower(fs) = &mut self.state {
            if fs.leader.is_none() {
                fs.leader.replace(leader.clone());
                self.notify_new_status();
            }
        }
    }

    /// Return number of votes received if candidate, or None if no longer Candidate.
    pub(crate) fn add_vote_if_candidate(&mut self, vote_from: ReplicaId) -> Option<usize> {
        if let State::Candidate(cs) = &mut self.state {
            Some(cs.add_received_vote(vote_from))
        } else {
            None
        }
    }

    pub(crate) fn leader_state_mut(&mut self) -> Option<&mut LeaderStateTracker> {
        if let State::Leader(ls) = &mut self.state {
            Some(&mut ls.tracker)
        } else {
            None
        }
    }

    pub(crate) fn leader_state(&self) -> Option<&LeaderStateTracker> {
        if let State::Leader(ls) = &self.state {
            Some(&ls.tracker)
        } else {
            None
        }
    }
}

impl fmt::Debug for ElectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            State::Stopped => write!(f, "Stopped"),
            State::Leader(ls) => write!(f, "Leader(Recovering={})", ls.recovering),
            State::Candidate(_) => write!(f, "Candidate"),
            State::Follower(FollowerState {
                leader: Some(leader_info),
                ..
            }) => write!(f, "Follower(Leader={:?})", leader_info.replica_id),
            State::Follower(FollowerState { leader: None, .. }) => write!(f, "Follower(Leader=None)"),
        }
    }
}

enum State {
    Stopped,
    Leader(LeaderState),
    Candidate(CandidateState),
    Follower(FollowerState),
}

struct LeaderState {
    tracker: LeaderStateTracker,
    recovering: bool,
}

struct CandidateState {
    received_votes_from: HashSet<ReplicaId>,
    _election_timer: ElectionTimerHandle,
}

struct FollowerState {
    leader: Option<LeaderRedirectInfo>,
    recovering: bool,
    election_timer: ElectionTimerHandle,
}

impl LeaderState {
    fn new(
        peer_ids: Vec<ReplicaId>,
        latest_log_index: Option<Index>,
        heartbeat_duration: Duration,
        actor_client: WeakActorClient,
        term: Term,
    ) -> Self {
        let mut peer_state = BTreeMap::new();
        for peer_id in peer_ids {
            let heartbeat_timer_handle =
                HeartbeatTimerHandle::spawn_timer_task(heartbeat_duration, actor_client.clone(), peer_id.clone(), term);
            peer_state.insert(peer_id, PeerState::new(heartbeat_timer_handle, latest_log_index));
        }

        LeaderState {
            tracker: LeaderStateTracker::new(peer_state),
            recovering: true,
        }
    }
}

impl CandidateState {
    fn new(config: &ElectionConfig, actor_client: WeakActorClient) -> Self {
        CandidateState {
            received_votes_from: HashSet::with_capacity(3),
            _election_timer: ElectionTimerHandle::spawn_timer_task(
                config.follower_min_timeout,
                config.follower_max_timeout,
                actor_client,
            ),
        }
    }

    /// `add_received_vote()` returns the number of unique votes we've received after adding the
    /// provided `vote_from`
    fn add_received_vote(&mut self, vote_from: ReplicaId) -> usize {
        self.received_votes_from.insert(vote_from);
        self.received_votes_from.len()
    }
}

impl FollowerState {
    fn new(leader: Option<LeaderRedirectInfo>, config: &ElectionConfig, actor_client: WeakActorClient) -> Self {
        FollowerState {
            leader,
            recovering: false,
            election_timer: ElectionTimerHandle::spawn_timer_task(
                config.follower_min_timeout,
                config.follower_max_timeout,
                actor_client,
            ),
        }
    }
}
