// -- Shared --

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Resources {
    #[prost(int64, tag = "1")]
    pub user_slots: i64,
    #[prost(int64, tag = "2")]
    pub cpu: i64,
    #[prost(int64, tag = "3")]
    pub memory: i64,
    #[prost(int64, tag = "4")]
    pub disk_quota: i64,
    #[prost(int64, tag = "5")]
    pub gpu: i64,
}
// -- Chunk registry --

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChunkReplicaRef {
    #[prost(string, tag = "1")]
    pub node_id: ::prost::alloc::string::String,
    #[prost(uint32, tag = "2")]
    pub replica_index: u32,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReqRegisterNode {
    #[prost(string, tag = "1")]
    pub node_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub rack: ::prost::alloc::string::String,
    #[prost(int64, tag = "3")]
    pub total_space: i64,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReplicaUpdate {
    #[prost(string, tag = "1")]
    pub chunk_id: ::prost::alloc::string::String,
    #[prost(uint32, tag = "2")]
    pub replica_index: u32,
    /// 1 = Healthy, 2 = Missing, 3 = Decommissioning. 0 means the node dropped the replica.
    #[prost(uint32, tag = "3")]
    pub state: u32,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChunkJobStatus {
    #[prost(string, tag = "1")]
    pub job_id: ::prost::alloc::string::String,
    /// 1 = Running, 2 = Completed, 3 = Failed, 4 = Aborted
    #[prost(uint32, tag = "2")]
    pub state: u32,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReqChunkNodeHeartbeat {
    #[prost(string, tag = "1")]
    pub node_id: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "2")]
    pub replicas: ::prost::alloc::vec::Vec<ReplicaUpdate>,
    #[prost(message, repeated, tag = "3")]
    pub jobs: ::prost::alloc::vec::Vec<ChunkJobStatus>,
    #[prost(int64, tag = "4")]
    pub used_space: i64,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChunkJobSpec {
    #[prost(string, tag = "1")]
    pub job_id: ::prost::alloc::string::String,
    /// 1 = Replicate, 2 = Repair, 3 = Remove
    #[prost(uint32, tag = "2")]
    pub job_type: u32,
    #[prost(string, tag = "3")]
    pub chunk_id: ::prost::alloc::string::String,
    #[prost(uint32, tag = "4")]
    pub replica_index: u32,
    #[prost(string, tag = "5")]
    pub node_id: ::prost::alloc::string::String,
    #[prost(string, repeated, tag = "6")]
    pub target_nodes: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(uint32, repeated, tag = "7")]
    pub erased_indexes: ::prost::alloc::vec::Vec<u32>,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RspChunkNodeHeartbeat {
    #[prost(message, repeated, tag = "1")]
    pub jobs_to_start: ::prost::alloc::vec::Vec<ChunkJobSpec>,
    #[prost(string, repeated, tag = "2")]
    pub jobs_to_abort: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReqCreateChunk {
    #[prost(string, tag = "1")]
    pub chunk_id: ::prost::alloc::string::String,
    #[prost(uint32, tag = "2")]
    pub replication_factor: u32,
    /// Both zero for regular (replicated) chunks.
    #[prost(uint32, tag = "3")]
    pub data_parts: u32,
    #[prost(uint32, tag = "4")]
    pub parity_parts: u32,
    #[prost(message, repeated, tag = "5")]
    pub replicas: ::prost::alloc::vec::Vec<ChunkReplicaRef>,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReqDeleteChunk {
    #[prost(string, tag = "1")]
    pub chunk_id: ::prost::alloc::string::String,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReqDecommissionNode {
    #[prost(string, tag = "1")]
    pub node_id: ::prost::alloc::string::String,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReqCheckNodeLeases {}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RspCheckNodeLeases {
    #[prost(string, repeated, tag = "1")]
    pub expired_nodes: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReqGetChunk {
    #[prost(string, tag = "1")]
    pub chunk_id: ::prost::alloc::string::String,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChunkReplicaState {
    #[prost(string, tag = "1")]
    pub node_id: ::prost::alloc::string::String,
    #[prost(uint32, tag = "2")]
    pub replica_index: u32,
    #[prost(uint32, tag = "3")]
    pub state: u32,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RspGetChunk {
    #[prost(bool, tag = "1")]
    pub found: bool,
    #[prost(uint32, tag = "2")]
    pub replication_factor: u32,
    #[prost(uint32, tag = "3")]
    pub data_parts: u32,
    #[prost(uint32, tag = "4")]
    pub parity_parts: u32,
    #[prost(message, repeated, tag = "5")]
    pub replicas: ::prost::alloc::vec::Vec<ChunkReplicaState>,
    #[prost(string, repeated, tag = "6")]
    pub job_ids: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RspListChunkJobs {
    #[prost(message, repeated, tag = "1")]
    pub jobs: ::prost::alloc::vec::Vec<ChunkJobSpec>,
    #[prost(uint32, repeated, tag = "2")]
    pub states: ::prost::alloc::vec::Vec<u32>,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeRecord {
    #[prost(string, tag = "1")]
    pub node_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub rack: ::prost::alloc::string::String,
    #[prost(int64, tag = "3")]
    pub total_space: i64,
    #[prost(int64, tag = "4")]
    pub used_space: i64,
    /// 1 = Online, 2 = Offline, 3 = Decommissioned
    #[prost(uint32, tag = "5")]
    pub state: u32,
    #[prost(uint64, tag = "6")]
    pub last_seen: u64,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChunkRecord {
    #[prost(string, tag = "1")]
    pub chunk_id: ::prost::alloc::string::String,
    #[prost(uint32, tag = "2")]
    pub replication_factor: u32,
    #[prost(uint32, tag = "3")]
    pub data_parts: u32,
    #[prost(uint32, tag = "4")]
    pub parity_parts: u32,
    #[prost(message, repeated, tag = "5")]
    pub replicas: ::prost::alloc::vec::Vec<ChunkReplicaState>,
    #[prost(string, tag = "6")]
    pub job_id: ::prost::alloc::string::String,
    #[prost(bool, tag = "7")]
    pub removal_requested: bool,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChunkJobRecord {
    #[prost(message, optional, tag = "1")]
    pub spec: ::core::option::Option<ChunkJobSpec>,
    #[prost(uint32, tag = "2")]
    pub state: u32,
    #[prost(uint64, tag = "3")]
    pub start_time: u64,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChunkRegistrySnapshot {
    #[prost(message, repeated, tag = "1")]
    pub nodes: ::prost::alloc::vec::Vec<NodeRecord>,
    #[prost(message, repeated, tag = "2")]
    pub chunks: ::prost::alloc::vec::Vec<ChunkRecord>,
    #[prost(message, repeated, tag = "3")]
    pub jobs: ::prost::alloc::vec::Vec<ChunkJobRecord>,
    #[prost(uint64, tag = "4")]
    pub next_job_seq: u64,
}
// -- Scheduler --

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReqRegisterExecNode {
    #[prost(string, tag = "1")]
    pub node_id: ::prost::alloc::string::String,
    #[prost(string, repeated, tag = "2")]
    pub tags: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(message, optional, tag = "3")]
    pub resource_limits: ::core::option::Option<Resources>,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReqStartOperation {
    #[prost(string, tag = "1")]
    pub operation_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub pool: ::prost::alloc::string::String,
    #[prost(double, tag = "3")]
    pub weight: f64,
    /// Every tag must be present on a node for the operation's jobs to land there.
    #[prost(string, repeated, tag = "4")]
    pub tag_filter: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(uint32, tag = "5")]
    pub task_count: u32,
    #[prost(message, optional, tag = "6")]
    pub task_resources: ::core::option::Option<Resources>,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReqAbortOperation {
    #[prost(string, tag = "1")]
    pub operation_id: ::prost::alloc::string::String,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExecJobStatus {
    #[prost(string, tag = "1")]
    pub job_id: ::prost::alloc::string::String,
    /// 1 = Running, 2 = Completed, 3 = Failed, 4 = Aborted
    #[prost(uint32, tag = "2")]
    pub state: u32,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReqExecNodeHeartbeat {
    #[prost(string, tag = "1")]
    pub node_id: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "2")]
    pub jobs: ::prost::alloc::vec::Vec<ExecJobStatus>,
    #[prost(message, optional, tag = "3")]
    pub resource_limits: ::core::option::Option<Resources>,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StartedJob {
    #[prost(string, tag = "1")]
    pub job_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub operation_id: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "3")]
    pub resources: ::core::option::Option<Resources>,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RspExecNodeHeartbeat {
    #[prost(bool, tag = "1")]
    pub disable_jobs: bool,
    #[prost(message, repeated, tag = "2")]
    pub jobs_to_start: ::prost::alloc::vec::Vec<StartedJob>,
    #[prost(string, repeated, tag = "3")]
    pub jobs_to_abort: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReqGetOperation {
    #[prost(string, tag = "1")]
    pub operation_id: ::prost::alloc::string::String,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RspGetOperation {
    #[prost(bool, tag = "1")]
    pub found: bool,
    /// 1 = Running, 2 = Completed, 3 = Aborted
    #[prost(uint32, tag = "2")]
    pub state: u32,
    #[prost(uint32, tag = "3")]
    pub pending_tasks: u32,
    #[prost(uint32, tag = "4")]
    pub running_jobs: u32,
    #[prost(uint32, tag = "5")]
    pub completed_tasks: u32,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExecNodeRecord {
    #[prost(string, tag = "1")]
    pub node_id: ::prost::alloc::string::String,
    #[prost(string, repeated, tag = "2")]
    pub tags: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(message, optional, tag = "3")]
    pub resource_limits: ::core::option::Option<Resources>,
    /// 0 when the node is within its limits.
    #[prost(uint64, tag = "4")]
    pub overcommit_since: u64,
    #[prost(uint64, tag = "5")]
    pub last_preemptive_scheduling: u64,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OperationRecord {
    #[prost(string, tag = "1")]
    pub operation_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub pool: ::prost::alloc::string::String,
    #[prost(double, tag = "3")]
    pub weight: f64,
    #[prost(string, repeated, tag = "4")]
    pub tag_filter: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(message, optional, tag = "5")]
    pub task_resources: ::core::option::Option<Resources>,
    /// Failed or preempted tasks waiting to run again.
    #[prost(uint32, repeated, tag = "6")]
    pub requeued_tasks: ::prost::alloc::vec::Vec<u32>,
    #[prost(uint32, tag = "7")]
    pub completed_tasks: u32,
    #[prost(uint32, tag = "8")]
    pub state: u32,
    #[prost(uint64, tag = "9")]
    pub starving_since: u64,
    #[prost(uint32, tag = "10")]
    pub task_count: u32,
    #[prost(uint32, tag = "11")]
    pub next_task_index: u32,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExecJobRecord {
    #[prost(string, tag = "1")]
    pub job_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub operation_id: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub node_id: ::prost::alloc::string::String,
    #[prost(uint32, tag = "4")]
    pub task_index: u32,
    #[prost(message, optional, tag = "5")]
    pub resources: ::core::option::Option<Resources>,
    /// 0 = Created, 1 = Running
    #[prost(uint32, tag = "6")]
    pub state: u32,
    #[prost(uint64, tag = "7")]
    pub start_time: u64,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SchedulerSnapshot {
    #[prost(message, repeated, tag = "1")]
    pub nodes: ::prost::alloc::vec::Vec<ExecNodeRecord>,
    #[prost(message, repeated, tag = "2")]
    pub operations: ::prost::alloc::vec::Vec<OperationRecord>,
    #[prost(message, repeated, tag = "3")]
    pub jobs: ::prost::alloc::vec::Vec<ExecJobRecord>,
    #[prost(uint64, tag = "4")]
    pub next_job_seq: u64,
}
// -- Transactions --

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReqStartTransaction {
    #[prost(string, tag = "1")]
    pub transaction_id: ::prost::alloc::string::String,
    #[prost(uint64, tag = "2")]
    pub start_timestamp: u64,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReqPrepareTransactionCommit {
    #[prost(string, tag = "1")]
    pub transaction_id: ::prost::alloc::string::String,
    #[prost(bool, tag = "2")]
    pub persistent: bool,
    #[prost(uint64, tag = "3")]
    pub prepare_timestamp: u64,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReqCommitTransaction {
    #[prost(string, tag = "1")]
    pub transaction_id: ::prost::alloc::string::String,
    #[prost(uint64, tag = "2")]
    pub commit_timestamp: u64,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReqAbortTransaction {
    #[prost(string, tag = "1")]
    pub transaction_id: ::prost::alloc::string::String,
    #[prost(bool, tag = "2")]
    pub force: bool,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReqGetTransaction {
    #[prost(string, tag = "1")]
    pub transaction_id: ::prost::alloc::string::String,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TransactionRecord {
    #[prost(string, tag = "1")]
    pub transaction_id: ::prost::alloc::string::String,
    /// 1 = Active, 2 = TransientlyPrepared, 3 = Prepared, 4 = Committed, 5 = Aborted
    #[prost(uint32, tag = "2")]
    pub state: u32,
    #[prost(uint64, tag = "3")]
    pub start_timestamp: u64,
    #[prost(uint64, tag = "4")]
    pub prepare_timestamp: u64,
    #[prost(uint64, tag = "5")]
    pub commit_timestamp: u64,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RspGetTransaction {
    #[prost(bool, tag = "1")]
    pub found: bool,
    #[prost(message, optional, tag = "2")]
    pub transaction: ::core::option::Option<TransactionRecord>,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TransactionManagerSnapshot {
    #[prost(message, repeated, tag = "1")]
    pub transactions: ::prost::alloc::vec::Vec<TransactionRecord>,
}
