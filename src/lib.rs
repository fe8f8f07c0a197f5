mod actor;
mod api;
mod automaton;
mod chunk_server;
mod clock;
mod commitlog;
mod replica;
mod scheduler;
mod server;
mod snapshot;
mod transaction_supervisor;
mod grpc {
    include!("../generated/hydra.rs");
}
mod payloads {
    include!("../generated/parts.rs");
}

pub use api::try_create_hydra_cell;
pub use api::CellCreationError;
pub use api::HeartbeatError;
pub use api::HeartbeatGate;
pub use api::HydraCell;
pub use api::HydraCellConfig;
pub use api::HydraOptions;
pub use api::MutationCommitter;
pub use automaton::decode_payload;
pub use automaton::encode_message;
pub use automaton::AutomatonPart;
pub use automaton::CompositeAutomaton;
pub use automaton::HandlerError;
pub use automaton::MutationContext;
pub use automaton::MutationError;
pub use automaton::RegistrationError;
pub use automaton::MALFORMED_MUTATION;
pub use chunk_server::ChunkCache;
pub use chunk_server::ChunkHandle;
pub use chunk_server::ChunkJob;
pub use chunk_server::ChunkJobReport;
pub use chunk_server::ChunkJobType;
pub use chunk_server::ChunkLocation;
pub use chunk_server::ChunkRegistry;
pub use chunk_server::ChunkRegistryConfig;
pub use chunk_server::ChunkRegistryError;
pub use chunk_server::ChunkStore;
pub use chunk_server::DataNode;
pub use chunk_server::NodeState;
pub use chunk_server::PlacementCandidate;
pub use chunk_server::ReplicaHealth;
pub use chunk_server::TargetCollector;
pub use chunk_server::CHECK_NODE_LEASES;
pub use chunk_server::CHUNK_ALREADY_EXISTS;
pub use chunk_server::CREATE_CHUNK;
pub use chunk_server::DECOMMISSION_NODE;
pub use chunk_server::DELETE_CHUNK;
pub use chunk_server::GET_CHUNK;
pub use chunk_server::INVALID_CHUNK_SPEC;
pub use chunk_server::LIST_JOBS;
pub use chunk_server::NODE_HEARTBEAT;
pub use chunk_server::NO_SUCH_CHUNK;
pub use chunk_server::NO_SUCH_NODE;
pub use chunk_server::REGISTER_NODE;
pub use commitlog::Entry;
pub use commitlog::InMemoryLog;
pub use commitlog::Index;
pub use commitlog::Log;
pub use commitlog::SegmentedDiskLog;
pub use commitlog::StorageConfig;
pub use payloads::ChunkJobSpec;
pub use payloads::ChunkJobStatus;
pub use payloads::ChunkReplicaRef;
pub use payloads::ExecJobStatus;
pub use payloads::ReplicaUpdate;
pub use payloads::ReqAbortOperation;
pub use payloads::ReqChunkNodeHeartbeat;
pub use payloads::ReqCreateChunk;
pub use payloads::ReqDecommissionNode;
pub use payloads::ReqDeleteChunk;
pub use payloads::ReqExecNodeHeartbeat;
pub use payloads::ReqGetChunk;
pub use payloads::ReqGetOperation;
pub use payloads::ReqRegisterExecNode;
pub use payloads::ReqRegisterNode;
pub use payloads::ReqStartOperation;
pub use payloads::Resources;
pub use payloads::RspChunkNodeHeartbeat;
pub use payloads::RspExecNodeHeartbeat;
pub use payloads::RspGetChunk;
pub use payloads::RspGetOperation;
pub use payloads::RspListChunkJobs;
pub use payloads::StartedJob;
pub use replica::ActorExited;
pub use replica::CommitMutationError;
pub use replica::LeaderRedirectInfo;
pub use replica::MemberInfo;
pub use replica::MutationRecord;
pub use replica::MutationResponse;
pub use replica::PeerConnectError;
pub use replica::QueryError;
pub use replica::ReplicaDiagnostics;
pub use replica::ReplicaId;
pub use replica::ReplicaRecoveryError;
pub use replica::ReplicaState;
pub use replica::ReplicaStatus;
pub use replica::ReplicaStatusListener;
pub use replica::SnapshotThreshold;
pub use replica::Term;
pub use scheduler::FairShareTreeJobScheduler;
pub use scheduler::JobPreemptionLevel;
pub use scheduler::JobResources;
pub use scheduler::NodeDescriptor;
pub use scheduler::OperationPreemptionPriority;
pub use scheduler::OperationState;
pub use scheduler::ReportedJobState;
pub use scheduler::Scheduler;
pub use scheduler::SchedulerConfig;
pub use scheduler::SchedulerError;
pub use scheduler::SchedulingContext;
pub use scheduler::SchedulingTagFilter;
pub use scheduler::ABORT_OPERATION;
pub use scheduler::EXEC_NODE_HEARTBEAT;
pub use scheduler::GET_OPERATION;
pub use scheduler::INVALID_OPERATION_SPEC;
pub use scheduler::NO_SUCH_EXEC_NODE;
pub use scheduler::NO_SUCH_OPERATION;
pub use scheduler::OPERATION_ALREADY_EXISTS;
pub use scheduler::REGISTER_EXEC_NODE;
pub use scheduler::START_OPERATION;
pub use snapshot::BackoffOptions;
pub use snapshot::DownloadOptions;
pub use snapshot::FileSnapshotStore;
pub use snapshot::InMemorySnapshotStore;
pub use snapshot::Snapshot;
pub use snapshot::SnapshotError;
pub use snapshot::SnapshotMeta;
pub use snapshot::SnapshotStore;
pub use transaction_supervisor::MonotonicTimestampProvider;
pub use transaction_supervisor::TransactionError;
pub use transaction_supervisor::TransactionState;
pub use transaction_supervisor::TransactionSupervisor;
pub use transaction_supervisor::TransactionSupervisorError;
pub use transaction_supervisor::ABORT_TRANSACTION;
pub use transaction_supervisor::COMMIT_TRANSACTION;
pub use transaction_supervisor::GET_TRANSACTION;
pub use transaction_supervisor::INVALID_TRANSACTION_STATE;
pub use transaction_supervisor::NO_SUCH_TRANSACTION;
pub use transaction_supervisor::PREPARE_TRANSACTION_COMMIT;
pub use transaction_supervisor::STALE_TIMESTAMP;
pub use transaction_supervisor::START_TRANSACTION;
pub use transaction_supervisor::TRANSACTION_ALREADY_EXISTS;

// `crate::{root_mod}` holds no code, just `mod` and `pub use` statements. No `mod` is `pub`; types
// are exported individually so each root_mod can organize its impl however it wants.
