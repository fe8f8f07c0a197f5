use crate::commitlog::Index;
use std::io;

/// Describes a snapshot without its state.
#[derive(Clone, Debug, PartialEq)]
pub struct SnapshotMeta {
    /// Sequence number of the last mutation folded into the snapshot.
    pub snapshot_id: Index,
    pub last_included_term: u64,
    /// Peer that built the snapshot.
    pub builder: String,
    /// crc32 of `state`.
    pub checksum: u32,
    pub state_length: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    pub state: Vec<u8>,
}

impl Snapshot {
    pub fn new(snapshot_id: Index, last_included_term: u64, builder: String, state: Vec<u8>) -> Self {
        Snapshot {
            meta: SnapshotMeta {
                snapshot_id,
                last_included_term,
                builder,
                checksum: crc32fast::hash(&state),
                state_length: state.len() as u64,
            },
            state,
        }
    }
}

/// A range of a snapshot's serialized bytes, as served to downloading peers.
#[derive(Clone, Debug, PartialEq)]
pub struct SnapshotBlock {
    pub data: Vec<u8>,
    pub total_length: u64,
}

/// Snapshot files keyed by snapshot id. Snapshots are immutable once written. Calls are blocking
/// and should be made from `spawn_blocking` when issued from async code on a hot path.
pub trait SnapshotStore: Send + Sync {
    /// Highest snapshot id present, optionally bounded by `max_snapshot_id` (inclusive).
    fn latest_snapshot_id(&self, max_snapshot_id: Option<Index>) -> Result<Option<Index>, io::Error>;

    fn read_meta(&self, snapshot_id: Index) -> Result<Option<SnapshotMeta>, io::Error>;

    fn read_state(&self, snapshot_id: Index) -> Result<Option<Snapshot>, io::Error>;

    /// Reads up to `length` bytes of the serialized snapshot starting at `offset`.
    fn read_block(
        &self,
        snapshot_id: Index,
        offset: u64,
        length: u64,
    ) -> Result<Option<SnapshotBlock>, io::Error>;

    fn write(&self, snapshot: &Snapshot) -> Result<(), io::Error>;

    /// Stores bytes downloaded from a peer. The bytes must decode to a snapshot with id
    /// `snapshot_id` and a matching checksum, otherwise nothing becomes visible.
    fn write_raw(&self, snapshot_id: Index, bytes: Vec<u8>) -> Result<(), io::Error>;

    /// Deletes all but the newest `keep` snapshots and returns the ids removed.
    fn remove_older_than(&self, keep: usize) -> Result<Vec<Index>, io::Error>;

    fn contains(&self, snapshot_id: Index) -> Result<bool, io::Error> {
        Ok(self.read_meta(snapshot_id)?.is_some())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("No peer can supply snapshot {required:?} or a newer one")]
    Unavailable { required: Index },
    #[error("Snapshot storage failure")]
    Io(#[from] io::Error),
}

/// Ids to drop so that only the newest `keep` remain. `ids` must be sorted ascending.
pub(super) fn ids_to_remove(ids: &[Index], keep: usize) -> Vec<Index> {
    let excess = ids.len().saturating_sub(keep);
    ids[..excess].to_vec()
}
