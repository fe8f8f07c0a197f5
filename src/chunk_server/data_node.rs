use crate::chunk_server::registry::{ChunkJobReport, ReplicaHealth};
use crate::chunk_server::ChunkJobType;
use crate::payloads::{
    ChunkJobSpec, ChunkJobStatus, ReplicaUpdate, ReqChunkNodeHeartbeat, ReqRegisterNode, RspChunkNodeHeartbeat,
};
use std::collections::{BTreeMap, VecDeque};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ChunkLocation {
    Store,
    Cache,
}

/// Result of a chunk lookup on a data node.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChunkHandle {
    pub chunk_id: String,
    pub replica_index: u32,
    pub size: i64,
    pub location: ChunkLocation,
}

#[derive(Clone, Debug)]
struct StoredChunk {
    replica_index: u32,
    size: i64,
}

/// Chunks this node holds as registered replicas.
#[derive(Default)]
pub struct ChunkStore {
    chunks: BTreeMap<String, StoredChunk>,
    used_space: i64,
}

impl ChunkStore {
    pub fn add_chunk(&mut self, chunk_id: &str, replica_index: u32, size: i64) {
        if let Some(previous) = self
            .chunks
            .insert(chunk_id.to_string(), StoredChunk { replica_index, size })
        {
            self.used_space -= previous.size;
        }
        self.used_space += size;
    }

    pub fn remove_chunk(&mut self, chunk_id: &str) -> bool {
        match self.chunks.remove(chunk_id) {
            Some(chunk) => {
                self.used_space -= chunk.size;
                true
            }
            None => false,
        }
    }

    pub fn find_chunk(&self, chunk_id: &str) -> Option<ChunkHandle> {
        self.chunks.get(chunk_id).map(|chunk| ChunkHandle {
            chunk_id: chunk_id.to_string(),
            replica_index: chunk.replica_index,
            size: chunk.size,
            location: ChunkLocation::Store,
        })
    }

    pub fn used_space(&self) -> i64 {
        self.used_space
    }
}

/// Unregistered copies of remote chunks, e.g. read-through blocks. Evicts the oldest entries once
/// `capacity` bytes are exceeded.
pub struct ChunkCache {
    capacity: i64,
    used: i64,
    chunks: BTreeMap<String, StoredChunk>,
    insertion_order: VecDeque<String>,
}

impl ChunkCache {
    pub fn new(capacity: i64) -> Self {
        ChunkCache {
            capacity,
            used: 0,
            chunks: BTreeMap::new(),
            insertion_order: VecDeque::new(),
        }
    }

    /// Returns the ids evicted to make room.
    pub fn put(&mut self, chunk_id: &str, replica_index: u32, size: i64) -> Vec<String> {
        if let Some(previous) = self
            .chunks
            .insert(chunk_id.to_string(), StoredChunk { replica_index, size })
        {
            self.used -= previous.size;
            self.insertion_order.retain(|id| id != chunk_id);
        }
        self.used += size;
        self.insertion_order.push_back(chunk_id.to_string());

        let mut evicted = Vec::new();
        while self.used > self.capacity {
            let oldest = match self.insertion_order.pop_front() {
                Some(oldest) => oldest,
                None => break,
            };
            if let Some(chunk) = self.chunks.remove(&oldest) {
                self.used -= chunk.size;
            }
            evicted.push(oldest);
        }
        evicted
    }

    pub fn find_chunk(&self, chunk_id: &str) -> Option<ChunkHandle> {
        self.chunks.get(chunk_id).map(|chunk| ChunkHandle {
            chunk_id: chunk_id.to_string(),
            replica_index: chunk.replica_index,
            size: chunk.size,
            location: ChunkLocation::Cache,
        })
    }
}

/// Data node side of the chunk registry protocol: local chunk lookup, replica reports and the
/// jobs the registry assigned to this node.
pub struct DataNode {
    logger: slog::Logger,
    node_id: String,
    rack: Option<String>,
    total_space: i64,
    store: ChunkStore,
    cache: ChunkCache,
    pending_replica_updates: Vec<ReplicaUpdate>,
    jobs: BTreeMap<String, (ChunkJobSpec, ChunkJobReport)>,
}

impl DataNode {
    pub fn new(
        logger: slog::Logger,
        node_id: String,
        rack: Option<String>,
        total_space: i64,
        cache_capacity: i64,
    ) -> Self {
        DataNode {
            logger: logger.new(slog::o!("DataNode" => node_id.clone())),
            node_id,
            rack,
            total_space,
            store: ChunkStore::default(),
            cache: ChunkCache::new(cache_capacity),
            pending_replica_updates: Vec::new(),
            jobs: BTreeMap::new(),
        }
    }

    /// The store is checked first, then the cache.
    pub fn find_chunk(&self, chunk_id: &str) -> Option<ChunkHandle> {
        self.store
            .find_chunk(chunk_id)
            .or_else(|| self.cache.find_chunk(chunk_id))
    }

    pub fn registration(&self) -> ReqRegisterNode {
        ReqRegisterNode {
            node_id: self.node_id.clone(),
            rack: self.rack.clone().unwrap_or_default(),
            total_space: self.total_space,
        }
    }

    pub fn store_chunk(&mut self, chunk_id: &str, replica_index: u32, size: i64) {
        self.store.add_chunk(chunk_id, replica_index, size);
        self.queue_replica_update(chunk_id, replica_index, Some(ReplicaHealth::Healthy));
    }

    pub fn cache_chunk(&mut self, chunk_id: &str, replica_index: u32, size: i64) {
        let evicted = self.cache.put(chunk_id, replica_index, size);
        if !evicted.is_empty() {
            slog::debug!(self.logger, "Evicted cached chunks"; "ChunkIds" => ?evicted);
        }
    }

    /// A stored replica failed its checksum or its disk went away.
    pub fn mark_chunk_missing(&mut self, chunk_id: &str) {
        if let Some(handle) = self.store.find_chunk(chunk_id) {
            self.queue_replica_update(chunk_id, handle.replica_index, Some(ReplicaHealth::Missing));
        }
    }

    pub fn drop_chunk(&mut self, chunk_id: &str) {
        if let Some(handle) = self.store.find_chunk(chunk_id) {
            self.store.remove_chunk(chunk_id);
            self.queue_replica_update(chunk_id, handle.replica_index, None);
        }
    }

    fn queue_replica_update(&mut self, chunk_id: &str, replica_index: u32, state: Option<ReplicaHealth>) {
        self.pending_replica_updates.push(ReplicaUpdate {
            chunk_id: chunk_id.to_string(),
            replica_index,
            state: state.map(ReplicaHealth::to_u32).unwrap_or(0),
        });
    }

    /// Drains queued replica reports. Terminal job reports are sent once.
    pub fn build_heartbeat(&mut self) -> ReqChunkNodeHeartbeat {
        let jobs = self
            .jobs
            .iter()
            .map(|(job_id, (_, report))| ChunkJobStatus {
                job_id: job_id.clone(),
                state: report.to_u32(),
            })
            .collect();
        self.jobs.retain(|_, (_, report)| *report == ChunkJobReport::Running);

        ReqChunkNodeHeartbeat {
            node_id: self.node_id.clone(),
            replicas: std::mem::take(&mut self.pending_replica_updates),
            jobs,
            used_space: self.store.used_space(),
        }
    }

    pub fn handle_heartbeat_response(&mut self, response: RspChunkNodeHeartbeat) {
        for job_id in response.jobs_to_abort {
            if self.jobs.remove(&job_id).is_some() {
                slog::info!(self.logger, "Aborted job"; "JobId" => &job_id);
            }
        }
        for spec in response.jobs_to_start {
            if !self.jobs.contains_key(&spec.job_id) {
                slog::info!(self.logger, "Starting job"; "JobId" => &spec.job_id, "ChunkId" => &spec.chunk_id);
                self.jobs
                    .insert(spec.job_id.clone(), (spec, ChunkJobReport::Running));
            }
        }
    }

    pub fn running_jobs(&self) -> Vec<ChunkJobSpec> {
        self.jobs
            .values()
            .filter(|(_, report)| *report == ChunkJobReport::Running)
            .map(|(spec, _)| spec.clone())
            .collect()
    }

    /// Records the outcome of a running job. A completed removal drops the local replica; the
    /// registry accounts for it from the job report.
    pub fn finish_job(&mut self, job_id: &str, completed: bool) {
        let entry = match self.jobs.get_mut(job_id) {
            Some(entry) => entry,
            None => return,
        };
        entry.1 = if completed {
            ChunkJobReport::Completed
        } else {
            ChunkJobReport::Failed
        };
        if completed && ChunkJobType::from_u32(entry.0.job_type) == Some(ChunkJobType::Remove) {
            let chunk_id = entry.0.chunk_id.clone();
            self.store.remove_chunk(&chunk_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automaton::{encode_message, AutomatonPart, MutationContext};
    use crate::chunk_server::registry::{CREATE_CHUNK, NODE_HEARTBEAT, REGISTER_NODE};
    use crate::chunk_server::{ChunkRegistry, ChunkRegistryConfig};
    use crate::payloads::{ChunkReplicaRef, ReqCreateChunk};

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn node(node_id: &str) -> DataNode {
        DataNode::new(logger(), node_id.to_string(), None, 1_000, 100)
    }

    #[test]
    fn find_chunk_prefers_store_over_cache() {
        let mut node = node("n1");
        assert_eq!(node.find_chunk("c1"), None);

        node.cache_chunk("c1", 0, 10);
        assert_eq!(node.find_chunk("c1").map(|h| h.location), Some(ChunkLocation::Cache));

        node.store_chunk("c1", 0, 10);
        assert_eq!(node.find_chunk("c1").map(|h| h.location), Some(ChunkLocation::Store));

        node.drop_chunk("c1");
        assert_eq!(node.find_chunk("c1").map(|h| h.location), Some(ChunkLocation::Cache));
    }

    #[test]
    fn cache_evicts_oldest_over_capacity() {
        let mut cache = ChunkCache::new(100);
        assert!(cache.put("a", 0, 40).is_empty());
        assert!(cache.put("b", 0, 40).is_empty());
        assert_eq!(cache.put("c", 0, 40), vec!["a".to_string()]);
        assert!(cache.find_chunk("a").is_none());
        assert!(cache.find_chunk("b").is_some());
    }

    #[test]
    fn heartbeat_reports_are_sent_once() {
        let mut node = node("n1");
        node.store_chunk("c1", 0, 50);
        let first = node.build_heartbeat();
        assert_eq!(first.replicas.len(), 1);
        assert_eq!(first.used_space, 50);
        assert!(node.build_heartbeat().replicas.is_empty());
    }

    #[test]
    fn replication_round_trip_through_registry() {
        let mut registry = ChunkRegistry::new(logger(), ChunkRegistryConfig::default());
        let mut n1 = node("n1");
        let n2 = node("n2");
        let ctx = MutationContext {
            sequence_number: 1,
            term: 1,
            timestamp: 10,
        };
        for data_node in [&n1, &n2].iter() {
            registry
                .apply_mutation(&ctx, REGISTER_NODE, &encode_message(&data_node.registration()))
                .unwrap();
        }
        n1.store_chunk("c1", 0, 10);
        let create = ReqCreateChunk {
            chunk_id: "c1".into(),
            replication_factor: 2,
            replicas: vec![ChunkReplicaRef {
                node_id: "n1".into(),
                replica_index: 0,
            }],
            ..Default::default()
        };
        registry
            .apply_mutation(&ctx, CREATE_CHUNK, &encode_message(&create))
            .unwrap();

        let mut exchange = |node: &mut DataNode| {
            let request = encode_message(&node.build_heartbeat());
            let bytes = registry.apply_mutation(&ctx, NODE_HEARTBEAT, &request).unwrap();
            node.handle_heartbeat_response(prost::Message::decode(bytes.as_slice()).unwrap());
        };

        exchange(&mut n1);
        let running = n1.running_jobs();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].target_nodes, vec!["n2".to_string()]);

        let job_id = running[0].job_id.clone();
        n1.finish_job(&job_id, true);
        exchange(&mut n1);
        assert!(n1.running_jobs().is_empty());
        exchange(&mut n1);
        assert!(n1.running_jobs().is_empty());
    }
}
