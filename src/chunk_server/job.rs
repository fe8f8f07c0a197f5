use crate::payloads::ChunkJobSpec;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ChunkJobType {
    Replicate,
    Repair,
    Remove,
}

impl ChunkJobType {
    pub fn to_u32(self) -> u32 {
        match self {
            ChunkJobType::Replicate => 1,
            ChunkJobType::Repair => 2,
            ChunkJobType::Remove => 3,
        }
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(ChunkJobType::Replicate),
            2 => Some(ChunkJobType::Repair),
            3 => Some(ChunkJobType::Remove),
            _ => None,
        }
    }
}

/// Work the registry hands to one data node. `node_id` is the node that runs the job: the source
/// of a replication, the reconstructing node of a repair, the holder of a removed replica.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChunkJob {
    pub job_id: String,
    pub job_type: ChunkJobType,
    pub chunk_id: String,
    pub replica_index: u32,
    pub node_id: String,
    pub target_nodes: Vec<String>,
    pub erased_indexes: Vec<u32>,
}

impl ChunkJob {
    pub fn create_replicate(
        job_id: String,
        chunk_id: &str,
        replica_index: u32,
        source_node: &str,
        target_nodes: Vec<String>,
    ) -> Self {
        ChunkJob {
            job_id,
            job_type: ChunkJobType::Replicate,
            chunk_id: chunk_id.to_string(),
            replica_index,
            node_id: source_node.to_string(),
            target_nodes,
            erased_indexes: Vec::new(),
        }
    }

    /// `target_nodes[i]` receives the reconstructed part `erased_indexes[i]`.
    pub fn create_repair(
        job_id: String,
        chunk_id: &str,
        node: &str,
        target_nodes: Vec<String>,
        erased_indexes: Vec<u32>,
    ) -> Self {
        ChunkJob {
            job_id,
            job_type: ChunkJobType::Repair,
            chunk_id: chunk_id.to_string(),
            replica_index: 0,
            node_id: node.to_string(),
            target_nodes,
            erased_indexes,
        }
    }

    pub fn create_remove(job_id: String, chunk_id: &str, replica_index: u32, node: &str) -> Self {
        ChunkJob {
            job_id,
            job_type: ChunkJobType::Remove,
            chunk_id: chunk_id.to_string(),
            replica_index,
            node_id: node.to_string(),
            target_nodes: Vec::new(),
            erased_indexes: Vec::new(),
        }
    }

    pub fn to_spec(&self) -> ChunkJobSpec {
        ChunkJobSpec {
            job_id: self.job_id.clone(),
            job_type: self.job_type.to_u32(),
            chunk_id: self.chunk_id.clone(),
            replica_index: self.replica_index,
            node_id: self.node_id.clone(),
            target_nodes: self.target_nodes.clone(),
            erased_indexes: self.erased_indexes.clone(),
        }
    }

    pub fn from_spec(spec: ChunkJobSpec) -> Option<Self> {
        Some(ChunkJob {
            job_type: ChunkJobType::from_u32(spec.job_type)?,
            job_id: spec.job_id,
            chunk_id: spec.chunk_id,
            replica_index: spec.replica_index,
            node_id: spec.node_id,
            target_nodes: spec.target_nodes,
            erased_indexes: spec.erased_indexes,
        })
    }

    /// Whether the job writes to or reads from `node_id`.
    pub fn involves(&self, node_id: &str) -> bool {
        self.node_id == node_id || self.target_nodes.iter().any(|t| t == node_id)
    }
}
