mod config;
mod data_node;
mod job;
mod lease_checker;
mod registry;
mod target_collector;

pub use config::ChunkRegistryConfig;
pub use data_node::ChunkCache;
pub use data_node::ChunkHandle;
pub use data_node::ChunkLocation;
pub use data_node::ChunkStore;
pub use data_node::DataNode;
pub use job::ChunkJob;
pub use job::ChunkJobType;
pub(crate) use lease_checker::LeaseChecker;
pub use registry::ChunkJobReport;
pub use registry::ChunkRegistry;
pub use registry::ChunkRegistryError;
pub use registry::NodeState;
pub use registry::ReplicaHealth;
pub use registry::CHECK_NODE_LEASES;
pub use registry::CHUNK_ALREADY_EXISTS;
pub use registry::CREATE_CHUNK;
pub use registry::DECOMMISSION_NODE;
pub use registry::DELETE_CHUNK;
pub use registry::GET_CHUNK;
pub use registry::INVALID_CHUNK_SPEC;
pub use registry::LIST_JOBS;
pub use registry::NODE_HEARTBEAT;
pub use registry::NO_SUCH_CHUNK;
pub use registry::NO_SUCH_NODE;
pub use registry::REGISTER_NODE;
pub use target_collector::PlacementCandidate;
pub use target_collector::TargetCollector;
