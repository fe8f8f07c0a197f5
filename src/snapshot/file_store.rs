use crate::commitlog::Index;
use crate::snapshot::format;
use crate::snapshot::store::{self, Snapshot, SnapshotBlock, SnapshotMeta, SnapshotStore};
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const SNAPSHOT_SUFFIX: &str = ".snapshot";
const TEMP_SUFFIX: &str = ".snapshot.tmp";

/// Stores each snapshot as one file named after its id. Files are written to a temp file and
/// renamed into place, so readers only ever see complete snapshots.
pub struct FileSnapshotStore {
    directory: PathBuf,
}

impl FileSnapshotStore {
    pub fn open<P: Into<PathBuf>>(directory: P) -> Result<Self, io::Error> {
        let directory = directory.into();
        fs::create_dir_all(&directory)?;

        // Leftovers of writes interrupted by a crash.
        for dir_entry in fs::read_dir(&directory)? {
            let path = dir_entry?.path();
            if path.to_string_lossy().ends_with(TEMP_SUFFIX) {
                fs::remove_file(&path)?;
            }
        }

        Ok(FileSnapshotStore { directory })
    }

    fn path(&self, snapshot_id: Index) -> PathBuf {
        self.directory
            .join(format!("{:020}{}", snapshot_id.as_u64(), SNAPSHOT_SUFFIX))
    }

    fn list_ids(&self) -> Result<Vec<Index>, io::Error> {
        let mut ids = Vec::new();
        for dir_entry in fs::read_dir(&self.directory)? {
            if let Some(id) = parse_snapshot_name(&dir_entry?.path()) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn open_existing(&self, snapshot_id: Index) -> Result<Option<File>, io::Error> {
        match File::open(self.path(snapshot_id)) {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write_verified(&self, snapshot_id: Index, bytes: &[u8]) -> Result<(), io::Error> {
        let final_path = self.path(snapshot_id);
        let temp_path = self
            .directory
            .join(format!("{:020}{}", snapshot_id.as_u64(), TEMP_SUFFIX));

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, &final_path)?;
        File::open(&self.directory)?.sync_all()
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn latest_snapshot_id(&self, max_snapshot_id: Option<Index>) -> Result<Option<Index>, io::Error> {
        Ok(self
            .list_ids()?
            .into_iter()
            .filter(|id| max_snapshot_id.map_or(true, |max| *id <= max))
            .last())
    }

    fn read_meta(&self, snapshot_id: Index) -> Result<Option<SnapshotMeta>, io::Error> {
        match self.open_existing(snapshot_id)? {
            Some(mut file) => format::read_header(&mut file).map(Some),
            None => Ok(None),
        }
    }

    fn read_state(&self, snapshot_id: Index) -> Result<Option<Snapshot>, io::Error> {
        match self.open_existing(snapshot_id)? {
            Some(mut file) => {
                let mut bytes = Vec::new();
                file.read_to_end(&mut bytes)?;
                format::decode(&bytes).map(Some)
            }
            None => Ok(None),
        }
    }

    fn read_block(
        &self,
        snapshot_id: Index,
        offset: u64,
        length: u64,
    ) -> Result<Option<SnapshotBlock>, io::Error> {
        let mut file = match self.open_existing(snapshot_id)? {
            Some(file) => file,
            None => return Ok(None),
        };

        let total_length = file.metadata()?.len();
        let mut data = Vec::new();
        if offset < total_length {
            file.seek(SeekFrom::Start(offset))?;
            file.take(length).read_to_end(&mut data)?;
        }

        Ok(Some(SnapshotBlock { data, total_length }))
    }

    fn write(&self, snapshot: &Snapshot) -> Result<(), io::Error> {
        self.write_verified(snapshot.meta.snapshot_id, &format::encode(snapshot))
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
        self.write_verified(snapshot_id, &bytes)
    }

    fn remove_older_than(&self, keep: usize) -> Result<Vec<Index>, io::Error> {
        let removed = store::ids_to_remove(&self.list_ids()?, keep);
        for id in removed.iter() {
            fs::remove_file(self.path(*id))?;
        }
        Ok(removed)
    }
}

fn parse_snapshot_name(path: &Path) -> Option<Index> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(SNAPSHOT_SUFFIX)?;
    stem.parse::<u64>().ok().and_then(Index::from_u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(id: u64) -> Snapshot {
        Snapshot::new(Index::new(id), 1, "peer-a".to_string(), vec![id as u8; 64])
    }

    #[test]
    fn write_read_and_gc() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::open(dir.path()).unwrap();
        assert_eq!(store.latest_snapshot_id(None).unwrap(), None);

        for id in &[5, 10, 15] {
            store.write(&snapshot(*id)).unwrap();
        }
        assert_eq!(store.latest_snapshot_id(None).unwrap(), Some(Index::new(15)));
        assert_eq!(
            store.latest_snapshot_id(Some(Index::new(14))).unwrap(),
            Some(Index::new(10))
        );
        assert_eq!(store.read_state(Index::new(10)).unwrap(), Some(snapshot(10)));
        assert_eq!(store.read_meta(Index::new(5)).unwrap(), Some(snapshot(5).meta));
        assert!(!store.contains(Index::new(7)).unwrap());

        let removed = store.remove_older_than(2).unwrap();
        assert_eq!(removed, vec![Index::new(5)]);
        assert!(!store.contains(Index::new(5)).unwrap());
        assert!(store.contains(Index::new(10)).unwrap());
    }

    #[test]
    fn blocks_reassemble_into_verified_copy() {
        let src_dir = tempfile::tempdir().unwrap();
        let dst_dir = tempfile::tempdir().unwrap();
        let src = FileSnapshotStore::open(src_dir.path()).unwrap();
        let dst = FileSnapshotStore::open(dst_dir.path()).unwrap();
        src.write(&snapshot(7)).unwrap();

        let mut bytes = Vec::new();
        loop {
            let block = src
                .read_block(Index::new(7), bytes.len() as u64, 16)
                .unwrap()
                .unwrap();
            bytes.extend_from_slice(&block.data);
            if bytes.len() as u64 >= block.total_length {
                break;
            }
        }

        // Wrong id is refused.
        assert!(dst.write_raw(Index::new(8), bytes.clone()).is_err());
        // Corrupt bytes are refused.
        let mut corrupt = bytes.clone();
        let last = corrupt.len() - 1;
        corrupt[last] ^= 1;
        assert!(dst.write_raw(Index::new(7), corrupt).is_err());
        assert_eq!(dst.latest_snapshot_id(None).unwrap(), None);

        dst.write_raw(Index::new(7), bytes).unwrap();
        assert_eq!(dst.read_state(Index::new(7)).unwrap(), Some(snapshot(7)));
    }

    #[test]
    fn reading_missing_snapshot_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::open(dir.path()).unwrap();
        assert_eq!(store.read_block(Index::new(3), 0, 10).unwrap(), None);
        assert_eq!(store.read_state(Index::new(3)).unwrap(), None);
    }
}
