use crate::commitlog::Index;
use crate::snapshot::format;
use crate::snapshot::store::{self, Snapshot, SnapshotBlock, SnapshotMeta, SnapshotStore};
use std::collections::BTreeMap;
use std::io::{self, ErrorKind};
use std::sync::Mutex;

/// Keeps encoded snapshots in memory, so block reads behave exactly like the file store.
#[derive(Default)]
pub struct InMemorySnapshotStore {
    snapshots: Mutex<BTreeMap<Index, Vec<u8>>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_snapshots<T, F: FnOnce(&mut BTreeMap<Index, Vec<u8>>) -> T>(&self, f: F) -> T {
        let mut guard = self
            .snapshots
            .lock()
            .expect("InMemorySnapshotStore mutex guard poison");
        f(&mut guard)
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn latest_snapshot_id(&self, max_snapshot_id: Option<Index>) -> Result<Option<Index>, io::Error> {
        Ok(self.with_snapshots(|snapshots| match max_snapshot_id {
            Some(max) => snapshots.range(..=max).next_back().map(|(id, _)| *id),
            None => snapshots.keys().next_back().copied(),
        }))
    }

    fn read_meta(&self, snapshot_id: Index) -> Result<Option<SnapshotMeta>, io::Error> {
        self.with_snapshots(|snapshots| match snapshots.get(&snapshot_id) {
            Some(bytes) => format::read_header(&mut &bytes[..]).map(Some),
            None => Ok(None),
        })
    }

    fn read_state(&self, snapshot_id: Index) -> Result<Option<Snapshot>, io::Error> {
        self.with_snapshots(|snapshots| match snapshots.get(&snapshot_id) {
            Some(bytes) => format::decode(bytes).map(Some),
            None => Ok(None),
        })
    }

    fn read_block(
        &self,
        snapshot_id: Index,
        offset: u64,
        length: u64,
    ) -> Result<Option<SnapshotBlock>, io::Error> {
        Ok(self.with_snapshots(|snapshots| {
            snapshots.get(&snapshot_id).map(|bytes| {
                let total_length = bytes.len() as u64;
                let start = std::cmp::min(offset, total_length) as usize;
                let end = std::cmp::min(offset.saturating_add(length), total_length) as usize;
                SnapshotBlock {
                    data: bytes[start..end].to_vec(),
                    total_length,
                }
            })
        }))
    }

    fn write(&self, snapshot: &Snapshot) -> Result<(), io::Error> {
        let bytes = format::encode(snapshot);
        self.with_snapshots(|snapshots| snapshots.insert(snapshot.meta.snapshot_id, bytes));
        Ok(())
    }

    fn write_raw(&self, snapshot_id: Index, bytes: Vec<u8>) -> Result<(), io::Error> {
        let snapshot = format::decode(&bytes)?;
        if snapshot.meta.snapshot_id != snapshot_id {
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                format!(
                    "expected snapshot {:?}, received {:?}",
                    snapshot_id, snapshot.meta.snapshot_id
                ),
            ));
        }
        self.with_snapshots(|snapshots| snapshots.insert(snapshot_id, bytes));
        Ok(())
    }

    fn remove_older_than(&self, keep: usize) -> Result<Vec<Index>, io::Error> {
        Ok(self.with_snapshots(|snapshots| {
            let ids: Vec<Index> = snapshots.keys().copied().collect();
            let removed = store::ids_to_remove(&ids, keep);
            for id in removed.iter() {
                snapshots.remove(id);
            }
            removed
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_latest_and_blocks() {
        let store = InMemorySnapshotStore::new();
        for id in &[3u64, 6, 9] {
            store
                .write(&Snapshot::new(Index::new(*id), 2, "p".into(), vec![1, 2, 3, 4]))
                .unwrap();
        }

        assert_eq!(store.latest_snapshot_id(Some(Index::new(8))).unwrap(), Some(Index::new(6)));
        assert_eq!(store.latest_snapshot_id(Some(Index::new(2))).unwrap(), None);

        let block = store.read_block(Index::new(9), 0, 5).unwrap().unwrap();
        assert_eq!(block.data.len(), 5);
        let tail = store
            .read_block(Index::new(9), block.total_length - 2, 100)
            .unwrap()
            .unwrap();
        assert_eq!(tail.data, vec![3, 4]);
        let past_end = store
            .read_block(Index::new(9), block.total_length + 10, 4)
            .unwrap()
            .unwrap();
        assert!(past_end.data.is_empty());

        assert_eq!(store.remove_older_than(1).unwrap(), vec![Index::new(3), Index::new(6)]);
        assert_eq!(store.latest_snapshot_id(None).unwrap(), Some(Index::new(9)));
    }
}
