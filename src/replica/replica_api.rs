use crate::automaton::MutationError;
use crate::commitlog::Index;
use crate::replica::election::{ReplicaState, ReplicaStatus};
use crate::replica::local_state::Term;
use crate::replica::mutation_log::MutationRecord;
use crate::replica::peers::{MemberInfo, ReplicaId};
use crate::snapshot::SnapshotError;
use bytes::Bytes;
use std::io;
use std::net::Ipv4Addr;

/// The replica actor's event loop has exited, or it dropped the request.
#[derive(Debug, thiserror::Error)]
#[error("Replica actor is dead RIP")]
pub struct ActorExited;

#[derive(Debug)]
pub struct CommitMutationInput {
    pub mutation_type: String,
    pub payload: Bytes,
}

/// Outcome of a committed and applied mutation.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationResponse {
    pub sequence_number: Index,
    /// `Err` when the handler rejected the mutation; it still occupies its sequence number.
    pub result: Result<Vec<u8>, MutationError>,
}

#[derive(Debug, thiserror::Error)]
pub enum CommitMutationError {
    #[error("I'm not leader")]
    LeaderRedirect(LeaderRedirectInfo),

    // Can be retried with exponential backoff. Likely an election is in progress.
    #[error("Cluster is in a tough shape. No one is leader.")]
    NoLeader,

    #[error("Leader is not active yet: {0:?}")]
    NotActiveLeader(ReplicaState),

    #[error("Mutation was not committed in time; leader stepped down")]
    CommitTimeout,

    /// The mutation may or may not commit under the next leader.
    #[error("Leadership was lost before the mutation committed")]
    LeadershipLost,

    #[error("No handler registered for {0}")]
    UnknownMutationType(String),

    /// The payload failed the owning part's static checks and was never logged.
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Failed to persist log")]
    LocalIoError(io::Error),

    #[error("Replica is stopped")]
    Stopped,

    #[error("Replica actor is dead RIP")]
    ActorExited,
}

impl From<ActorExited> for CommitMutationError {
    fn from(_: ActorExited) -> Self {
        CommitMutationError::ActorExited
    }
}

#[derive(Debug)]
pub struct ExecuteTransientInput {
    pub mutation_type: String,
    pub payload: Bytes,
}

#[derive(Debug)]
pub struct QueryInput {
    pub query_type: String,
    pub payload: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("Query failed: {0}")]
    Handler(String),
    #[error("Query was rejected: {0}")]
    Rejected(MutationError),
    #[error("Replica actor is dead RIP")]
    ActorExited,
}

impl From<ActorExited> for QueryError {
    fn from(_: ActorExited) -> Self {
        QueryError::ActorExited
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LeaderRedirectInfo {
    pub replica_id: ReplicaId,
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl From<&MemberInfo> for LeaderRedirectInfo {
    fn from(member: &MemberInfo) -> Self {
        LeaderRedirectInfo {
            replica_id: member.replica_id.clone(),
            ip: member.ip,
            port: member.port,
        }
    }
}

/// Point-in-time view of a replica.
#[derive(Clone, Debug, PartialEq)]
pub struct ReplicaDiagnostics {
    pub status: ReplicaStatus,
    pub commit_index: Option<Index>,
    pub last_applied_index: Option<Index>,
    pub latest_log_index: Option<Index>,
    pub snapshot_id: Option<Index>,
    /// crc32 of the serialized automaton state.
    pub state_hash: u32,
}

#[derive(Debug)]
pub(crate) struct RequestVoteInput {
    pub(crate) candidate_term: Term,
    pub(crate) candidate_id: ReplicaId,
    pub(crate) candidate_last_log_entry: Option<(Term, Index)>,
}

#[derive(Debug)]
pub(crate) struct RequestVoteOutput {
    pub(crate) vote_granted: bool,
    pub(crate) current_term: Term,
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum RequestVoteError {
    #[error("Requesting candidate is not in the cluster")]
    CandidateNotInCluster,
    #[error("We (server) had an IO failure: {0:?}")]
    ServerIoError(io::Error),
    #[error("We (server) are unavailable because actor is dead RIP")]
    ActorExited,
}

impl From<ActorExited> for RequestVoteError {
    fn from(_: ActorExited) -> Self {
        RequestVoteError::ActorExited
    }
}

#[derive(Debug)]
pub(crate) struct AppendEntriesInput {
    pub(crate) leader_term: Term,
    pub(crate) leader_id: ReplicaId,
    // "Previous log entry" is the record immediately preceding the new ones.
    pub(crate) leader_previous_log_entry: Option<(Term, Index)>,
    pub(crate) leader_commit_index: Option<Index>,
    pub(crate) new_entries: Vec<MutationRecord>,
}

#[derive(Debug)]
pub(crate) struct AppendEntriesOutput {
    // Nothing
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum AppendEntriesError {
    #[error("Client is not in cluster")]
    ClientNotInCluster,
    #[error("Client's term is out of date")]
    ClientTermOutOfDate(TermOutOfDateInfo),
    #[error("We (server) are missing previous log entry")]
    ServerMissingPreviousLogEntry { last_log_index: Option<Index> },
    #[error("We (server) had an IO failure: {0:?}")]
    ServerIoError(io::Error),
    #[error("We (server) are unavailable because actor is dead RIP")]
    ActorExited,
}

impl From<ActorExited> for AppendEntriesError {
    fn from(_: ActorExited) -> Self {
        AppendEntriesError::ActorExited
    }
}

#[derive(Debug)]
pub(crate) struct InstallSnapshotInput {
    pub(crate) leader_term: Term,
    pub(crate) leader_id: ReplicaId,
    pub(crate) snapshot_id: Index,
}

#[derive(Debug)]
pub(crate) struct InstallSnapshotOutput {
    /// false while the download is still running.
    pub(crate) installed: bool,
    pub(crate) last_included_index: Option<Index>,
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum InstallSnapshotError {
    #[error("Client is not in cluster")]
    ClientNotInCluster,
    #[error("Client's term is out of date")]
    ClientTermOutOfDate(TermOutOfDateInfo),
    #[error("We (server) had an IO failure: {0:?}")]
    ServerIoError(io::Error),
    #[error("We (server) are unavailable because actor is dead RIP")]
    ActorExited,
}

impl From<ActorExited> for InstallSnapshotError {
    fn from(_: ActorExited) -> Self {
        InstallSnapshotError::ActorExited
    }
}

#[derive(Debug)]
pub(crate) struct TermOutOfDateInfo {
    pub(crate) current_term: Term,
}

#[derive(Debug)]
pub(crate) struct RequestVoteReplyFromPeer {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) result: RequestVoteResult,
}

#[derive(Debug)]
pub(crate) enum RequestVoteResult {
    VoteGranted,
    VoteNotGranted { peer_term: Term },
    RetryableFailure,
    MalformedReply,
}

#[derive(Debug)]
pub(crate) struct ReplicationReplyFromPeer {
    pub(crate) descriptor: ReplicationDescriptor,
    pub(crate) result: Result<ReplicationAck, ReplicationReplyError>,
}

// This is basically info about the original request
#[derive(Debug)]
pub(crate) struct ReplicationDescriptor {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) seq_no: u64,
    pub(crate) kind: ReplicationKind,
}

#[derive(Debug)]
pub(crate) enum ReplicationKind {
    Entries {
        previous_log_entry_index: Option<Index>,
        num_log_entries: usize,
    },
    Snapshot {
        snapshot_id: Index,
    },
}

#[derive(Debug)]
pub(crate) enum ReplicationAck {
    Appended,
    SnapshotInstalled { last_included_index: Option<Index> },
    SnapshotInstalling,
}

#[derive(Debug)]
pub(crate) enum ReplicationReplyError {
    PeerMissingPreviousLogEntry { last_log_index: Option<Index> },
    RetryableFailure(String),
    StaleTerm { new_term: Term },
}

/// HeartbeatTick contains info for a single tick of a leader's per-peer timer.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct HeartbeatTick {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
}

/// The commit deadline of the mutation at `index`, proposed in `term`, has passed.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CommitDeadline {
    pub(crate) term: Term,
    pub(crate) index: Index,
}

#[derive(Debug)]
pub(crate) struct SnapshotBuilt {
    pub(crate) snapshot_id: Index,
    pub(crate) term: Term,
    /// Ids of older snapshots garbage-collected after the write.
    pub(crate) result: Result<Vec<Index>, io::Error>,
}

#[derive(Debug)]
pub(crate) struct SnapshotDownloaded {
    pub(crate) result: Result<Index, SnapshotError>,
}
