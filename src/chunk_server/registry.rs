use crate::automaton::{decode_payload, encode_message, AutomatonPart, HandlerError, MutationContext, MutationError};
use crate::chunk_server::job::ChunkJob;
use crate::chunk_server::target_collector::{PlacementCandidate, TargetCollector};
use crate::chunk_server::{ChunkJobType, ChunkRegistryConfig};
use crate::payloads::{
    ChunkJobRecord, ChunkRecord, ChunkReplicaState, ChunkRegistrySnapshot, NodeRecord, ReqCheckNodeLeases,
    ReqChunkNodeHeartbeat, ReqCreateChunk, ReqDecommissionNode, ReqDeleteChunk, ReqGetChunk, ReqRegisterNode,
    RspCheckNodeLeases, RspChunkNodeHeartbeat, RspGetChunk, RspListChunkJobs,
};
use std::collections::{BTreeMap, BTreeSet};

pub const REGISTER_NODE: &str = "chunk_registry.register_node";
pub const NODE_HEARTBEAT: &str = "chunk_registry.node_heartbeat";
pub const CREATE_CHUNK: &str = "chunk_registry.create_chunk";
pub const DELETE_CHUNK: &str = "chunk_registry.delete_chunk";
pub const DECOMMISSION_NODE: &str = "chunk_registry.decommission_node";
pub const CHECK_NODE_LEASES: &str = "chunk_registry.check_node_leases";
pub const GET_CHUNK: &str = "chunk_registry.get_chunk";
pub const LIST_JOBS: &str = "chunk_registry.list_jobs";

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ChunkRegistryError {
    #[error("No such node {0}")]
    NoSuchNode(String),
    #[error("No such chunk {0}")]
    NoSuchChunk(String),
    #[error("Chunk {0} already exists")]
    ChunkAlreadyExists(String),
    #[error("Invalid chunk {chunk_id}: {reason}")]
    InvalidChunkSpec { chunk_id: String, reason: &'static str },
}

pub const NO_SUCH_NODE: u32 = 3001;
pub const NO_SUCH_CHUNK: u32 = 3002;
pub const CHUNK_ALREADY_EXISTS: u32 = 3003;
pub const INVALID_CHUNK_SPEC: u32 = 3004;

impl ChunkRegistryError {
    pub fn code(&self) -> u32 {
        match self {
            ChunkRegistryError::NoSuchNode(_) => NO_SUCH_NODE,
            ChunkRegistryError::NoSuchChunk(_) => NO_SUCH_CHUNK,
            ChunkRegistryError::ChunkAlreadyExists(_) => CHUNK_ALREADY_EXISTS,
            ChunkRegistryError::InvalidChunkSpec { .. } => INVALID_CHUNK_SPEC,
        }
    }
}

impl From<ChunkRegistryError> for HandlerError {
    fn from(e: ChunkRegistryError) -> Self {
        HandlerError::Rejected(MutationError::new(e.code(), e.to_string()))
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NodeState {
    Online,
    Offline,
    Decommissioned,
}

impl NodeState {
    fn to_u32(self) -> u32 {
        match self {
            NodeState::Online => 1,
            NodeState::Offline => 2,
            NodeState::Decommissioned => 3,
        }
    }

    fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(NodeState::Online),
            2 => Some(NodeState::Offline),
            3 => Some(NodeState::Decommissioned),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReplicaHealth {
    Healthy,
    Missing,
    Decommissioning,
}

impl ReplicaHealth {
    pub fn to_u32(self) -> u32 {
        match self {
            ReplicaHealth::Healthy => 1,
            ReplicaHealth::Missing => 2,
            ReplicaHealth::Decommissioning => 3,
        }
    }

    /// `None` for 0, which a heartbeat uses for a dropped replica.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(ReplicaHealth::Healthy),
            2 => Some(ReplicaHealth::Missing),
            3 => Some(ReplicaHealth::Decommissioning),
            _ => None,
        }
    }
}

/// Job state as a data node reports it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ChunkJobReport {
    Running,
    Completed,
    Failed,
    Aborted,
}

impl ChunkJobReport {
    pub fn to_u32(self) -> u32 {
        match self {
            ChunkJobReport::Running => 1,
            ChunkJobReport::Completed => 2,
            ChunkJobReport::Failed => 3,
            ChunkJobReport::Aborted => 4,
        }
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(ChunkJobReport::Running),
            2 => Some(ChunkJobReport::Completed),
            3 => Some(ChunkJobReport::Failed),
            4 => Some(ChunkJobReport::Aborted),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
struct Node {
    rack: Option<String>,
    total_space: i64,
    used_space: i64,
    state: NodeState,
    last_seen: u64,
}

impl Node {
    fn fill_factor(&self) -> f64 {
        if self.total_space <= 0 {
            return 1.0;
        }
        self.used_space as f64 / self.total_space as f64
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
struct ChunkReplica {
    node_id: String,
    replica_index: u32,
    state: ReplicaHealth,
}

#[derive(Clone, Debug)]
struct Chunk {
    replication_factor: u32,
    data_parts: u32,
    parity_parts: u32,
    replicas: Vec<ChunkReplica>,
    job_id: Option<String>,
    removal_requested: bool,
}

impl Chunk {
    fn is_erasure(&self) -> bool {
        self.data_parts > 0
    }

    /// (replica index, wanted healthy copies) per slot.
    fn slots(&self) -> Vec<(u32, usize)> {
        if self.is_erasure() {
            (0..self.data_parts + self.parity_parts).map(|i| (i, 1)).collect()
        } else {
            vec![(0, self.replication_factor as usize)]
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum JobState {
    Created,
    Running,
}

#[derive(Clone, Debug)]
struct JobEntry {
    job: ChunkJob,
    state: JobState,
    start_time: u64,
}

enum Plan {
    Replicate {
        replica_index: u32,
        source: String,
        targets: Vec<String>,
    },
    Repair {
        node: String,
        targets: Vec<String>,
        erased_indexes: Vec<u32>,
    },
    Remove {
        replica_index: u32,
        node: String,
    },
    DropUnreachableReplicas,
    DropChunk,
}

/// Automaton part tracking data nodes, chunk replicas and the replication jobs that restore a
/// chunk's replica set. A chunk has at most one outstanding job.
pub struct ChunkRegistry {
    logger: slog::Logger,
    config: ChunkRegistryConfig,
    nodes: BTreeMap<String, Node>,
    chunks: BTreeMap<String, Chunk>,
    jobs: BTreeMap<String, JobEntry>,
    next_job_seq: u64,
}

impl ChunkRegistry {
    pub fn new(logger: slog::Logger, config: ChunkRegistryConfig) -> Self {
        ChunkRegistry {
            logger,
            config,
            nodes: BTreeMap::new(),
            chunks: BTreeMap::new(),
            jobs: BTreeMap::new(),
            next_job_seq: 1,
        }
    }

    fn register_node(&mut self, now: u64, request: ReqRegisterNode) {
        let rack = if request.rack.is_empty() {
            None
        } else {
            Some(request.rack)
        };
        let node_id = request.node_id;
        slog::info!(self.logger, "Registering node"; "NodeId" => &node_id, "Rack" => ?rack);
        let node = self.nodes.entry(node_id.clone()).or_insert(Node {
            rack: None,
            total_space: 0,
            used_space: 0,
            state: NodeState::Online,
            last_seen: now,
        });
        node.rack = rack;
        node.total_space = request.total_space;
        node.last_seen = now;
        if node.state == NodeState::Offline {
            node.state = NodeState::Online;
            // Replicas are reported afresh by the heartbeats that follow.
            self.drop_missing_replicas(&node_id);
        }
        self.refresh_all_chunks(now);
    }

    /// Forgets the replicas a node lost while its lease was expired. Returns the affected chunks.
    fn drop_missing_replicas(&mut self, node_id: &str) -> Vec<String> {
        let mut affected = Vec::new();
        for (chunk_id, chunk) in self.chunks.iter_mut() {
            let before = chunk.replicas.len();
            chunk
                .replicas
                .retain(|r| !(r.node_id == node_id && r.state == ReplicaHealth::Missing));
            if chunk.replicas.len() != before {
                affected.push(chunk_id.clone());
            }
        }
        if !affected.is_empty() {
            slog::info!(self.logger, "Dropped missing replicas"; "NodeId" => node_id, "Chunks" => affected.len());
        }
        affected
    }

    fn node_heartbeat(
        &mut self,
        now: u64,
        request: ReqChunkNodeHeartbeat,
    ) -> Result<RspChunkNodeHeartbeat, ChunkRegistryError> {
        let node_id = request.node_id;
        let node = self
            .nodes
            .get_mut(&node_id)
            .ok_or_else(|| ChunkRegistryError::NoSuchNode(node_id.clone()))?;
        node.last_seen = now;
        node.used_space = request.used_space;
        let back_online = node.state == NodeState::Offline;
        if back_online {
            slog::info!(self.logger, "Node is back online"; "NodeId" => &node_id);
            node.state = NodeState::Online;
        }

        let mut touched = BTreeSet::new();
        for update in request.replicas {
            self.on_replica_heartbeat(&node_id, &update.chunk_id, update.replica_index, update.state);
            touched.insert(update.chunk_id);
        }
        if back_online {
            // Whatever the node still holds it reported just now.
            touched.extend(self.drop_missing_replicas(&node_id));
        }

        let mut jobs_to_abort = Vec::new();
        let mut reported = BTreeSet::new();
        for status in request.jobs {
            let report = match ChunkJobReport::from_u32(status.state) {
                Some(report) => report,
                None => continue,
            };
            let known = matches!(self.jobs.get(&status.job_id), Some(entry) if entry.job.node_id == node_id);
            if !known {
                if report == ChunkJobReport::Running {
                    jobs_to_abort.push(status.job_id);
                }
                continue;
            }
            reported.insert(status.job_id.clone());
            match report {
                ChunkJobReport::Running => {
                    if let Some(entry) = self.jobs.get_mut(&status.job_id) {
                        entry.state = JobState::Running;
                    }
                }
                ChunkJobReport::Completed => touched.extend(self.finish_job(&status.job_id, true)),
                ChunkJobReport::Failed | ChunkJobReport::Aborted => {
                    touched.extend(self.finish_job(&status.job_id, false))
                }
            }
        }

        let lost: Vec<String> = self
            .jobs
            .iter()
            .filter(|(job_id, entry)| {
                entry.job.node_id == node_id && entry.state == JobState::Running && !reported.contains(*job_id)
            })
            .map(|(job_id, _)| job_id.clone())
            .collect();
        for job_id in lost {
            slog::info!(self.logger, "Job lost"; "JobId" => &job_id, "NodeId" => &node_id);
            touched.extend(self.finish_job(&job_id, false));
        }

        for chunk_id in &touched {
            self.refresh_chunk(chunk_id, now);
        }

        let jobs_to_start = self
            .jobs
            .values()
            .filter(|entry| entry.job.node_id == node_id && entry.state == JobState::Created)
            .map(|entry| entry.job.to_spec())
            .collect();
        Ok(RspChunkNodeHeartbeat {
            jobs_to_start,
            jobs_to_abort,
        })
    }

    /// Applies one replica state report of a node.
    fn on_replica_heartbeat(&mut self, node_id: &str, chunk_id: &str, replica_index: u32, state: u32) {
        let decommissioned = matches!(self.nodes.get(node_id), Some(node) if node.state == NodeState::Decommissioned);
        let chunk = match self.chunks.get_mut(chunk_id) {
            Some(chunk) => chunk,
            None => {
                slog::debug!(self.logger, "Replica of unknown chunk"; "ChunkId" => chunk_id, "NodeId" => node_id);
                return;
            }
        };
        let replica_index = if chunk.is_erasure() { replica_index } else { 0 };
        match ReplicaHealth::from_u32(state) {
            Some(mut state) => {
                if decommissioned && state == ReplicaHealth::Healthy {
                    state = ReplicaHealth::Decommissioning;
                }
                upsert_replica(chunk, node_id, replica_index, state);
            }
            None => chunk
                .replicas
                .retain(|r| !(r.node_id == node_id && r.replica_index == replica_index)),
        }
    }

    /// Removes a job and, when it completed, records its effect on the replica set. Returns the
    /// chunk the job belonged to.
    fn finish_job(&mut self, job_id: &str, completed: bool) -> Option<String> {
        let entry = self.jobs.remove(job_id)?;
        let job = entry.job;
        slog::info!(
            self.logger,
            "Job finished";
            "JobId" => job_id,
            "Type" => ?job.job_type,
            "ChunkId" => &job.chunk_id,
            "Completed" => completed
        );

        let target_decommissioned: BTreeSet<&String> = job
            .target_nodes
            .iter()
            .filter(|t| matches!(self.nodes.get(*t), Some(node) if node.state == NodeState::Decommissioned))
            .collect();
        let chunk = self.chunks.get_mut(&job.chunk_id)?;
        if chunk.job_id.as_deref() == Some(job_id) {
            chunk.job_id = None;
        }
        if !completed {
            return Some(job.chunk_id);
        }

        let state_on = |node_id: &String| {
            if target_decommissioned.contains(node_id) {
                ReplicaHealth::Decommissioning
            } else {
                ReplicaHealth::Healthy
            }
        };
        match job.job_type {
            ChunkJobType::Replicate => {
                for target in &job.target_nodes {
                    upsert_replica(chunk, target, job.replica_index, state_on(target));
                }
            }
            ChunkJobType::Repair => {
                for (target, index) in job.target_nodes.iter().zip(job.erased_indexes.iter()) {
                    upsert_replica(chunk, target, *index, state_on(target));
                }
            }
            ChunkJobType::Remove => {
                chunk
                    .replicas
                    .retain(|r| !(r.node_id == job.node_id && r.replica_index == job.replica_index));
            }
        }
        Some(job.chunk_id)
    }

    fn cancel_job(&mut self, job_id: &str) {
        if let Some(entry) = self.jobs.remove(job_id) {
            if let Some(chunk) = self.chunks.get_mut(&entry.job.chunk_id) {
                if chunk.job_id.as_deref() == Some(job_id) {
                    chunk.job_id = None;
                }
            }
        }
    }

    fn create_chunk(&mut self, now: u64, request: ReqCreateChunk) -> Result<(), ChunkRegistryError> {
        let chunk_id = request.chunk_id;
        if self.chunks.contains_key(&chunk_id) {
            return Err(ChunkRegistryError::ChunkAlreadyExists(chunk_id));
        }
        let invalid = |reason: &'static str| ChunkRegistryError::InvalidChunkSpec {
            chunk_id: chunk_id.clone(),
            reason,
        };

        let erasure = request.data_parts > 0;
        if !erasure && request.parity_parts > 0 {
            return Err(invalid("parity parts without data parts"));
        }
        if !erasure && request.replication_factor == 0 {
            return Err(invalid("replication factor must be positive"));
        }

        let mut replicas: Vec<ChunkReplica> = Vec::new();
        for replica in request.replicas {
            if !self.nodes.contains_key(&replica.node_id) {
                return Err(ChunkRegistryError::NoSuchNode(replica.node_id));
            }
            if replicas.iter().any(|r| r.node_id == replica.node_id) {
                return Err(invalid("two replicas on one node"));
            }
            if erasure && replica.replica_index >= request.data_parts + request.parity_parts {
                return Err(invalid("part index out of range"));
            }
            replicas.push(ChunkReplica {
                node_id: replica.node_id,
                replica_index: if erasure { replica.replica_index } else { 0 },
                state: ReplicaHealth::Healthy,
            });
        }

        let chunk = Chunk {
            replication_factor: if erasure { 1 } else { request.replication_factor },
            data_parts: request.data_parts,
            parity_parts: request.parity_parts,
            replicas,
            job_id: None,
            removal_requested: false,
        };
        self.chunks.insert(chunk_id.clone(), chunk);
        self.refresh_chunk(&chunk_id, now);
        Ok(())
    }

    fn delete_chunk(&mut self, now: u64, request: ReqDeleteChunk) -> Result<(), ChunkRegistryError> {
        let chunk = self
            .chunks
            .get_mut(&request.chunk_id)
            .ok_or_else(|| ChunkRegistryError::NoSuchChunk(request.chunk_id.clone()))?;
        chunk.removal_requested = true;
        // A running job of a deleted chunk is aborted once its node reports it as unknown.
        if let Some(job_id) = chunk.job_id.clone() {
            self.cancel_job(&job_id);
        }
        self.refresh_chunk(&request.chunk_id, now);
        Ok(())
    }

    fn decommission_node(&mut self, now: u64, request: ReqDecommissionNode) -> Result<(), ChunkRegistryError> {
        let node = self
            .nodes
            .get_mut(&request.node_id)
            .ok_or_else(|| ChunkRegistryError::NoSuchNode(request.node_id.clone()))?;
        node.state = NodeState::Decommissioned;
        slog::info!(self.logger, "Decommissioning node"; "NodeId" => &request.node_id);

        for chunk in self.chunks.values_mut() {
            for replica in chunk.replicas.iter_mut() {
                if replica.node_id == request.node_id && replica.state == ReplicaHealth::Healthy {
                    replica.state = ReplicaHealth::Decommissioning;
                }
            }
        }
        self.refresh_all_chunks(now);
        Ok(())
    }

    fn check_node_leases(&mut self, now: u64) -> RspCheckNodeLeases {
        let timeout = self.config.node_lease_timeout_millis();
        let expired: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.state != NodeState::Offline && now.saturating_sub(node.last_seen) > timeout)
            .map(|(node_id, _)| node_id.clone())
            .collect();

        for node_id in &expired {
            slog::warn!(self.logger, "Node lease expired"; "NodeId" => node_id);
            if let Some(node) = self.nodes.get_mut(node_id) {
                node.state = NodeState::Offline;
            }
            for chunk in self.chunks.values_mut() {
                for replica in chunk.replicas.iter_mut() {
                    if &replica.node_id == node_id {
                        replica.state = ReplicaHealth::Missing;
                    }
                }
            }
            let aborted: Vec<String> = self
                .jobs
                .iter()
                .filter(|(_, entry)| entry.job.involves(node_id))
                .map(|(job_id, _)| job_id.clone())
                .collect();
            for job_id in aborted {
                slog::info!(self.logger, "Aborting job of expired node"; "JobId" => &job_id, "NodeId" => node_id);
                self.cancel_job(&job_id);
            }
        }

        if !expired.is_empty() {
            self.refresh_all_chunks(now);
        }
        RspCheckNodeLeases { expired_nodes: expired }
    }

    fn refresh_all_chunks(&mut self, now: u64) {
        let idle: Vec<String> = self
            .chunks
            .iter()
            .filter(|(_, chunk)| chunk.job_id.is_none())
            .map(|(chunk_id, _)| chunk_id.clone())
            .collect();
        for chunk_id in idle {
            self.refresh_chunk(&chunk_id, now);
        }
    }

    /// Schedules the next job of a chunk, unless one is outstanding.
    fn refresh_chunk(&mut self, chunk_id: &str, now: u64) {
        let plan = match self.chunks.get(chunk_id) {
            Some(chunk) if chunk.job_id.is_none() => {
                if chunk.removal_requested {
                    self.plan_removal(chunk)
                } else {
                    self.plan_job(chunk_id, chunk)
                }
            }
            _ => None,
        };
        let plan = match plan {
            Some(plan) => plan,
            None => return,
        };

        let job_id = format!("chunk-job-{}", self.next_job_seq);
        let job = match plan {
            Plan::Replicate {
                replica_index,
                source,
                targets,
            } => ChunkJob::create_replicate(job_id, chunk_id, replica_index, &source, targets),
            Plan::Repair {
                node,
                targets,
                erased_indexes,
            } => ChunkJob::create_repair(job_id, chunk_id, &node, targets, erased_indexes),
            Plan::Remove { replica_index, node } => ChunkJob::create_remove(job_id, chunk_id, replica_index, &node),
            Plan::DropUnreachableReplicas => {
                let nodes = &self.nodes;
                if let Some(chunk) = self.chunks.get_mut(chunk_id) {
                    chunk.replicas.retain(|r| node_state(nodes, &r.node_id) != NodeState::Offline);
                }
                self.refresh_chunk(chunk_id, now);
                return;
            }
            Plan::DropChunk => {
                slog::info!(self.logger, "Chunk removed"; "ChunkId" => chunk_id);
                self.chunks.remove(chunk_id);
                return;
            }
        };

        self.next_job_seq += 1;
        slog::info!(
            self.logger,
            "Scheduling chunk job";
            "JobId" => &job.job_id,
            "Type" => ?job.job_type,
            "ChunkId" => chunk_id,
            "NodeId" => &job.node_id,
            "Targets" => ?job.target_nodes
        );
        if let Some(chunk) = self.chunks.get_mut(chunk_id) {
            chunk.job_id = Some(job.job_id.clone());
        }
        self.jobs.insert(
            job.job_id.clone(),
            JobEntry {
                job,
                state: JobState::Created,
                start_time: now,
            },
        );
    }

    fn plan_removal(&self, chunk: &Chunk) -> Option<Plan> {
        if chunk.replicas.is_empty() {
            return Some(Plan::DropChunk);
        }
        match chunk
            .replicas
            .iter()
            .find(|r| node_state(&self.nodes, &r.node_id) != NodeState::Offline)
        {
            Some(replica) => Some(Plan::Remove {
                replica_index: replica.replica_index,
                node: replica.node_id.clone(),
            }),
            None => Some(Plan::DropUnreachableReplicas),
        }
    }

    fn plan_job(&self, chunk_id: &str, chunk: &Chunk) -> Option<Plan> {
        let is_healthy = |r: &&ChunkReplica| {
            r.state == ReplicaHealth::Healthy && node_state(&self.nodes, &r.node_id) == NodeState::Online
        };
        let is_decommissioning = |r: &&ChunkReplica| {
            r.state == ReplicaHealth::Decommissioning && node_state(&self.nodes, &r.node_id) != NodeState::Offline
        };
        let copies = move |index: u32| chunk.replicas.iter().filter(move |r| r.replica_index == index);

        if chunk.is_erasure() {
            let erased: Vec<u32> = chunk
                .slots()
                .into_iter()
                .map(|(index, _)| index)
                .filter(|index| !copies(*index).any(|r| is_healthy(&r) || is_decommissioning(&r)))
                .collect();
            if !erased.is_empty() {
                let available = chunk.data_parts + chunk.parity_parts - erased.len() as u32;
                if available < chunk.data_parts {
                    slog::warn!(self.logger, "Chunk is lost"; "ChunkId" => chunk_id, "Erased" => ?erased);
                    return None;
                }
                let node = chunk
                    .replicas
                    .iter()
                    .filter(is_healthy)
                    .chain(chunk.replicas.iter().filter(is_decommissioning))
                    .map(|r| r.node_id.clone())
                    .next()?;
                let targets = self.allocate_targets(chunk, erased.len());
                if targets.len() < erased.len() {
                    slog::debug!(self.logger, "Not enough repair targets"; "ChunkId" => chunk_id);
                    return None;
                }
                return Some(Plan::Repair {
                    node,
                    targets,
                    erased_indexes: erased,
                });
            }
        }

        for (replica_index, wanted) in chunk.slots() {
            let healthy = copies(replica_index).filter(is_healthy).count();
            if healthy >= wanted {
                continue;
            }
            let source = copies(replica_index)
                .filter(is_healthy)
                .chain(copies(replica_index).filter(is_decommissioning))
                .map(|r| r.node_id.clone())
                .next();
            let source = match source {
                Some(source) => source,
                None => {
                    slog::warn!(self.logger, "Chunk has no live replica"; "ChunkId" => chunk_id, "Index" => replica_index);
                    continue;
                }
            };
            let targets = self.allocate_targets(chunk, wanted - healthy);
            if targets.is_empty() {
                slog::debug!(self.logger, "No replication targets"; "ChunkId" => chunk_id);
                continue;
            }
            return Some(Plan::Replicate {
                replica_index,
                source,
                targets,
            });
        }

        for (replica_index, wanted) in chunk.slots() {
            let healthy: Vec<&ChunkReplica> = copies(replica_index).filter(is_healthy).collect();
            if healthy.len() > wanted {
                // Drop the copy on the fullest node.
                let victim = healthy.iter().max_by(|a, b| {
                    let fa = self.nodes.get(&a.node_id).map(Node::fill_factor).unwrap_or(0.0);
                    let fb = self.nodes.get(&b.node_id).map(Node::fill_factor).unwrap_or(0.0);
                    fa.partial_cmp(&fb)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| b.node_id.cmp(&a.node_id))
                })?;
                return Some(Plan::Remove {
                    replica_index,
                    node: victim.node_id.clone(),
                });
            }
            if healthy.len() >= wanted {
                if let Some(replica) = copies(replica_index).find(is_decommissioning) {
                    return Some(Plan::Remove {
                        replica_index,
                        node: replica.node_id.clone(),
                    });
                }
            }
        }
        None
    }

    fn allocate_targets(&self, chunk: &Chunk, count: usize) -> Vec<String> {
        let stored = chunk
            .replicas
            .iter()
            .filter(|r| r.state != ReplicaHealth::Missing)
            .map(|r| {
                let rack = self.nodes.get(&r.node_id).and_then(|n| n.rack.as_deref());
                (r.node_id.as_str(), rack)
            });
        let mut collector = TargetCollector::new(self.config.max_replicas_per_rack, stored);
        for replica in &chunk.replicas {
            collector.forbid_node(&replica.node_id);
        }

        let candidates: Vec<PlacementCandidate> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.state == NodeState::Online && node.used_space < node.total_space)
            .map(|(node_id, node)| PlacementCandidate {
                node_id: node_id.clone(),
                rack: node.rack.clone(),
                fill_factor: node.fill_factor(),
                pending_placements: self
                    .jobs
                    .values()
                    .filter(|entry| entry.job.target_nodes.contains(node_id))
                    .count(),
            })
            .collect();
        collector.collect(&candidates, count)
    }

    fn get_chunk(&self, request: ReqGetChunk) -> RspGetChunk {
        match self.chunks.get(&request.chunk_id) {
            Some(chunk) => RspGetChunk {
                found: true,
                replication_factor: chunk.replication_factor,
                data_parts: chunk.data_parts,
                parity_parts: chunk.parity_parts,
                replicas: chunk.replicas.iter().map(replica_record).collect(),
                job_ids: chunk.job_id.iter().cloned().collect(),
            },
            None => RspGetChunk::default(),
        }
    }

    fn list_jobs(&self) -> RspListChunkJobs {
        RspListChunkJobs {
            jobs: self.jobs.values().map(|entry| entry.job.to_spec()).collect(),
            states: self.jobs.values().map(|entry| job_state_to_u32(entry.state)).collect(),
        }
    }

    fn corrupt(&self, reason: String) -> HandlerError {
        HandlerError::CorruptSnapshot {
            part: self.name().to_string(),
            reason,
        }
    }
}

fn node_state(nodes: &BTreeMap<String, Node>, node_id: &str) -> NodeState {
    nodes.get(node_id).map(|n| n.state).unwrap_or(NodeState::Offline)
}

fn upsert_replica(chunk: &mut Chunk, node_id: &str, replica_index: u32, state: ReplicaHealth) {
    match chunk
        .replicas
        .iter_mut()
        .find(|r| r.node_id == node_id && r.replica_index == replica_index)
    {
        Some(replica) => replica.state = state,
        None => chunk.replicas.push(ChunkReplica {
            node_id: node_id.to_string(),
            replica_index,
            state,
        }),
    }
}

fn replica_record(replica: &ChunkReplica) -> ChunkReplicaState {
    ChunkReplicaState {
        node_id: replica.node_id.clone(),
        replica_index: replica.replica_index,
        state: replica.state.to_u32(),
    }
}

fn job_state_to_u32(state: JobState) -> u32 {
    match state {
        JobState::Created => 0,
        JobState::Running => 1,
    }
}

impl AutomatonPart for ChunkRegistry {
    fn name(&self) -> &'static str {
        "chunk_registry"
    }

    fn mutation_types(&self) -> Vec<&'static str> {
        vec![
            REGISTER_NODE,
            NODE_HEARTBEAT,
            CREATE_CHUNK,
            DELETE_CHUNK,
            DECOMMISSION_NODE,
            CHECK_NODE_LEASES,
        ]
    }

    fn query_types(&self) -> Vec<&'static str> {
        vec![GET_CHUNK, LIST_JOBS]
    }

    fn validate_mutation(&self, mutation_type: &str, payload: &[u8]) -> Result<(), HandlerError> {
        match mutation_type {
            REGISTER_NODE => decode_payload::<ReqRegisterNode>(mutation_type, payload).map(drop),
            NODE_HEARTBEAT => decode_payload::<ReqChunkNodeHeartbeat>(mutation_type, payload).map(drop),
            CREATE_CHUNK => decode_payload::<ReqCreateChunk>(mutation_type, payload).map(drop),
            DELETE_CHUNK => decode_payload::<ReqDeleteChunk>(mutation_type, payload).map(drop),
            DECOMMISSION_NODE => decode_payload::<ReqDecommissionNode>(mutation_type, payload).map(drop),
            CHECK_NODE_LEASES => decode_payload::<ReqCheckNodeLeases>(mutation_type, payload).map(drop),
            _ => Err(HandlerError::UnknownMutationType(mutation_type.to_string())),
        }
    }

    fn apply_mutation(
        &mut self,
        context: &MutationContext,
        mutation_type: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, HandlerError> {
        let now = context.timestamp;
        match mutation_type {
            REGISTER_NODE => {
                self.register_node(now, decode_payload(mutation_type, payload)?);
                Ok(Vec::new())
            }
            NODE_HEARTBEAT => {
                let response = self.node_heartbeat(now, decode_payload(mutation_type, payload)?)?;
                Ok(encode_message(&response))
            }
            CREATE_CHUNK => {
                self.create_chunk(now, decode_payload(mutation_type, payload)?)?;
                Ok(Vec::new())
            }
            DELETE_CHUNK => {
                self.delete_chunk(now, decode_payload(mutation_type, payload)?)?;
                Ok(Vec::new())
            }
            DECOMMISSION_NODE => {
                self.decommission_node(now, decode_payload(mutation_type, payload)?)?;
                Ok(Vec::new())
            }
            CHECK_NODE_LEASES => {
                let _: ReqCheckNodeLeases = decode_payload(mutation_type, payload)?;
                Ok(encode_message(&self.check_node_leases(now)))
            }
            _ => Err(HandlerError::UnknownMutationType(mutation_type.to_string())),
        }
    }

    fn query(&self, query_type: &str, payload: &[u8]) -> Result<Vec<u8>, HandlerError> {
        match query_type {
            GET_CHUNK => Ok(encode_message(&self.get_chunk(decode_payload(query_type, payload)?))),
            LIST_JOBS => Ok(encode_message(&self.list_jobs())),
            _ => Err(HandlerError::UnknownMutationType(query_type.to_string())),
        }
    }

    fn save_snapshot(&self) -> Vec<u8> {
        let snapshot = ChunkRegistrySnapshot {
            nodes: self
                .nodes
                .iter()
                .map(|(node_id, node)| NodeRecord {
                    node_id: node_id.clone(),
                    rack: node.rack.clone().unwrap_or_default(),
                    total_space: node.total_space,
                    used_space: node.used_space,
                    state: node.state.to_u32(),
                    last_seen: node.last_seen,
                })
                .collect(),
            chunks: self
                .chunks
                .iter()
                .map(|(chunk_id, chunk)| ChunkRecord {
                    chunk_id: chunk_id.clone(),
                    replication_factor: chunk.replication_factor,
                    data_parts: chunk.data_parts,
                    parity_parts: chunk.parity_parts,
                    replicas: chunk.replicas.iter().map(replica_record).collect(),
                    job_id: chunk.job_id.clone().unwrap_or_default(),
                    removal_requested: chunk.removal_requested,
                })
                .collect(),
            jobs: self
                .jobs
                .values()
                .map(|entry| ChunkJobRecord {
                    spec: Some(entry.job.to_spec()),
                    state: job_state_to_u32(entry.state),
                    start_time: entry.start_time,
                })
                .collect(),
            next_job_seq: self.next_job_seq,
        };
        encode_message(&snapshot)
    }

    fn load_snapshot(&mut self, state: &[u8]) -> Result<(), HandlerError> {
        let snapshot: ChunkRegistrySnapshot =
            prost::Message::decode(state).map_err(|e: prost::DecodeError| self.corrupt(e.to_string()))?;

        for record in snapshot.nodes {
            let state = NodeState::from_u32(record.state)
                .ok_or_else(|| self.corrupt(format!("Node {} has state {}", record.node_id, record.state)))?;
            self.nodes.insert(
                record.node_id,
                Node {
                    rack: if record.rack.is_empty() { None } else { Some(record.rack) },
                    total_space: record.total_space,
                    used_space: record.used_space,
                    state,
                    last_seen: record.last_seen,
                },
            );
        }
        for record in snapshot.chunks {
            let chunk_id = record.chunk_id;
            let mut replicas = Vec::with_capacity(record.replicas.len());
            for replica in record.replicas {
                let state = ReplicaHealth::from_u32(replica.state)
                    .ok_or_else(|| self.corrupt(format!("Chunk {} has a replica in state {}", chunk_id, replica.state)))?;
                replicas.push(ChunkReplica {
                    node_id: replica.node_id,
                    replica_index: replica.replica_index,
                    state,
                });
            }
            self.chunks.insert(
                chunk_id,
                Chunk {
                    replication_factor: record.replication_factor,
                    data_parts: record.data_parts,
                    parity_parts: record.parity_parts,
                    replicas,
                    job_id: if record.job_id.is_empty() { None } else { Some(record.job_id) },
                    removal_requested: record.removal_requested,
                },
            );
        }
        for record in snapshot.jobs {
            let state = match record.state {
                0 => JobState::Created,
                1 => JobState::Running,
                other => return Err(self.corrupt(format!("Job in state {}", other))),
            };
            let job = record
                .spec
                .and_then(ChunkJob::from_spec)
                .ok_or_else(|| self.corrupt("Job without a valid spec".to_string()))?;
            self.jobs.insert(
                job.job_id.clone(),
                JobEntry {
                    job,
                    state,
                    start_time: record.start_time,
                },
            );
        }
        self.next_job_seq = snapshot.next_job_seq;
        Ok(())
    }

    fn clear(&mut self) {
        self.nodes.clear();
        self.chunks.clear();
        self.jobs.clear();
        self.next_job_seq = 1;
    }
}
