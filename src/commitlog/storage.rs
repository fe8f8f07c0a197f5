use crate::commitlog::{Entry, Index, Log};
use bytes::{Buf, BufMut, BytesMut};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

// Record layout, little endian:
//
// 0..4  : data size
// 4..8  : crc32 of data
// 8..   : data
//
// Segment files are named after the index of their first record, zero padded so that a plain
// directory listing sorts them.
const RECORD_HEADER_LEN: u64 = 8;
const SEGMENT_SUFFIX: &str = ".log";

// Generic config for initializing any type of disk-based commit log, independent of data
// model and algorithm.
#[derive(Clone, Debug)]
pub struct StorageConfig {
    pub directory: PathBuf,
    pub segment_max_bytes: u64,
}

struct Segment {
    first_index: Index,
    path: PathBuf,
    // Byte offset of each record within the file.
    offsets: Vec<u64>,
    size: u64,
}

impl Segment {
    fn next_index(&self) -> Index {
        self.first_index.plus(self.offsets.len() as u64)
    }

    fn offset_of(&self, index: Index) -> Option<u64> {
        if index < self.first_index {
            return None;
        }
        self.offsets
            .get(self.first_index.distance_to(index) as usize)
            .copied()
    }
}

/// SegmentedDiskLog is a durable log made of size-bounded segment files. Every append is fsynced
/// before it returns.
pub struct SegmentedDiskLog<E: Entry> {
    config: StorageConfig,
    segments: Vec<Segment>,
    // Append handle for the last segment.
    active: Option<File>,
    first_index: Index,
    next_index: Index,
    _pd: PhantomData<E>,
}

impl<E: Entry> SegmentedDiskLog<E> {
    /// Opens the log stored in `config.directory`, creating the directory if needed. A torn
    /// record at the tail of the last segment is cut off. Corruption anywhere else is an error.
    pub fn open(config: StorageConfig) -> Result<Self, io::Error> {
        fs::create_dir_all(&config.directory)?;

        let mut first_indexes = Vec::new();
        for dir_entry in fs::read_dir(&config.directory)? {
            let path = dir_entry?.path();
            if let Some(first_index) = parse_segment_name(&path) {
                first_indexes.push((first_index, path));
            }
        }
        first_indexes.sort_by_key(|(index, _)| *index);

        let segment_count = first_indexes.len();
        let mut segments: Vec<Segment> = Vec::with_capacity(segment_count);
        for (i, (first_index, path)) in first_indexes.into_iter().enumerate() {
            if let Some(prev) = segments.last() {
                if prev.next_index() != first_index {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!(
                            "Segment {:?} doesn't continue previous segment ending before {:?}",
                            path,
                            prev.next_index()
                        ),
                    ));
                }
            }

            let mut buf = Vec::new();
            File::open(&path)?.read_to_end(&mut buf)?;
            let (offsets, valid_len) = scan_records(&buf);
            if valid_len != buf.len() as u64 {
                let is_last = i + 1 == segment_count;
                if !is_last {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("Corrupt record in sealed segment {:?}", path),
                    ));
                }
                let file = OpenOptions::new().write(true).open(&path)?;
                file.set_len(valid_len)?;
                file.sync_all()?;
            }

            segments.push(Segment {
                first_index,
                path,
                offsets,
                size: valid_len,
            });
        }

        let (first_index, next_index) = match (segments.first(), segments.last()) {
            (Some(first), Some(last)) => (first.first_index, last.next_index()),
            _ => (Index::start_index(), Index::start_index()),
        };

        let mut log = SegmentedDiskLog {
            config,
            segments,
            active: None,
            first_index,
            next_index,
            _pd: PhantomData::default(),
        };
        log.reopen_active()?;

        Ok(log)
    }

    fn reopen_active(&mut self) -> Result<(), io::Error> {
        self.active = match self.segments.last() {
            Some(segment) => Some(OpenOptions::new().append(true).open(&segment.path)?),
            None => None,
        };
        Ok(())
    }

    fn start_segment(&mut self, first_index: Index) -> Result<(), io::Error> {
        let path = self
            .config
            .directory
            .join(format!("{:020}{}", first_index.as_u64(), SEGMENT_SUFFIX));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        file.set_len(0)?;
        file.sync_all()?;
        sync_directory(&self.config.directory)?;

        self.segments.push(Segment {
            first_index,
            path,
            offsets: Vec::new(),
            size: 0,
        });
        self.active = Some(file);
        Ok(())
    }

    fn remove_segments_from(&mut self, position: usize) -> Result<(), io::Error> {
        for segment in self.segments.drain(position..) {
            fs::remove_file(&segment.path)?;
        }
        sync_directory(&self.config.directory)
    }

    fn read_record(&self, segment: &Segment, offset: u64) -> Result<Vec<u8>, io::Error> {
        let mut file = File::open(&segment.path)?;
        file.seek(SeekFrom::Start(offset))?;

        let mut header = [0u8; RECORD_HEADER_LEN as usize];
        file.read_exact(&mut header)?;
        let mut header = &header[..];
        let len = header.get_u32_le() as usize;
        let crc = header.get_u32_le();

        let mut data = vec![0u8; len];
        file.read_exact(&mut data)?;
        if crc32fast::hash(&data) != crc {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Checksum mismatch in {:?} at offset {}", segment.path, offset),
            ));
        }

        Ok(data)
    }
}

impl<E: Entry> Log<E> for SegmentedDiskLog<E> {
    fn append(&mut self, entry: E) -> Result<Index, io::Error> {
        let needs_new_segment = match self.segments.last() {
            None => true,
            Some(segment) => {
                segment.size >= self.config.segment_max_bytes && !segment.offsets.is_empty()
            }
        };
        if needs_new_segment {
            self.start_segment(self.next_index)?;
        }

        let record = encode_record(&entry.into());
        let file = self
            .active
            .as_mut()
            .expect("active segment is opened together with the last segment");
        file.write_all(&record)?;
        file.sync_data()?;

        let segment = self
            .segments
            .last_mut()
            .expect("segment was created above");
        segment.offsets.push(segment.size);
        segment.size += record.len() as u64;

        let index = self.next_index;
        self.next_index = index.plus(1);
        Ok(index)
    }

    fn read(&self, index: Index) -> Result<Option<E>, io::Error> {
        if index < self.first_index || index >= self.next_index {
            return Ok(None);
        }

        let segment = self
            .segments
            .iter()
            .rev()
            .find(|segment| segment.first_index <= index);
        let (segment, offset) = match segment.and_then(|s| s.offset_of(index).map(|o| (s, o))) {
            Some(found) => found,
            None => return Ok(None),
        };

        let bytes = self.read_record(segment, offset)?;
        E::try_from(bytes).map(Some)
    }

    fn truncate(&mut self, index: Index) -> Result<(), io::Error> {
        if index >= self.next_index {
            return Ok(());
        }
        if index <= self.first_index {
            return self.reset(index);
        }

        let position = self
            .segments
            .iter()
            .position(|segment| segment.next_index() > index)
            .expect("first_index < index < next_index means a segment holds index");

        // Whole segments past the cut go away; the one holding `index` gets shortened.
        let cut_whole = self.segments[position].first_index == index;
        if cut_whole {
            self.remove_segments_from(position)?;
        } else {
            self.remove_segments_from(position + 1)?;
            let segment = &mut self.segments[position];
            let slot = segment.first_index.distance_to(index) as usize;
            let new_size = segment.offsets[slot];
            let file = OpenOptions::new().write(true).open(&segment.path)?;
            file.set_len(new_size)?;
            file.sync_all()?;
            segment.offsets.truncate(slot);
            segment.size = new_size;
        }

        self.next_index = index;
        self.reopen_active()
    }

    fn compact(&mut self, index: Index) -> Result<(), io::Error> {
        let index = std::cmp::min(index, self.next_index);
        if index <= self.first_index {
            return Ok(());
        }

        // The active segment is never removed, so compaction can't lose the append position.
        let removable = self
            .segments
            .iter()
            .take(self.segments.len().saturating_sub(1))
            .take_while(|segment| segment.next_index() <= index)
            .count();
        for segment in self.segments.drain(..removable) {
            fs::remove_file(&segment.path)?;
        }
        if removable > 0 {
            sync_directory(&self.config.directory)?;
        }

        self.first_index = index;
        Ok(())
    }

    fn reset(&mut self, next_index: Index) -> Result<(), io::Error> {
        self.active = None;
        self.remove_segments_from(0)?;

        // An empty segment remembers where the log continues after a restart.
        self.start_segment(next_index)?;
        self.first_index = next_index;
        self.next_index = next_index;
        Ok(())
    }

    fn first_index(&self) -> Index {
        self.first_index
    }

    fn next_index(&self) -> Index {
        self.next_index
    }
}

fn encode_record(data: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(RECORD_HEADER_LEN as usize + data.len());
    buf.put_u32_le(data.len() as u32);
    buf.put_u32_le(crc32fast::hash(data));
    buf.put_slice(data);
    buf
}

/// Returns the offset of every intact record and the length of the intact prefix.
fn scan_records(buf: &[u8]) -> (Vec<u64>, u64) {
    let mut offsets = Vec::new();
    let mut pos = 0usize;
    while buf.len() - pos >= RECORD_HEADER_LEN as usize {
        let mut header = &buf[pos..pos + RECORD_HEADER_LEN as usize];
        let len = header.get_u32_le() as usize;
        let crc = header.get_u32_le();

        let data_start = pos + RECORD_HEADER_LEN as usize;
        if buf.len() - data_start < len {
            break;
        }
        if crc32fast::hash(&buf[data_start..data_start + len]) != crc {
            break;
        }

        offsets.push(pos as u64);
        pos = data_start + len;
    }

    (offsets, pos as u64)
}

fn parse_segment_name(path: &Path) -> Option<Index> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(SEGMENT_SUFFIX)?;
    stem.parse::<u64>().ok().and_then(Index::from_u64)
}

fn sync_directory(directory: &Path) -> Result<(), io::Error> {
    File::open(directory)?.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitlog::in_memory::tests::TestEntry;

    fn config(dir: &Path, segment_max_bytes: u64) -> StorageConfig {
        StorageConfig {
            directory: dir.to_path_buf(),
            segment_max_bytes,
        }
    }

    fn entry(v: u8) -> TestEntry {
        TestEntry(vec![v; 10])
    }

    fn segment_count(dir: &Path) -> usize {
        fs::read_dir(dir)
            .unwrap()
            .filter(|e| parse_segment_name(&e.as_ref().unwrap().path()).is_some())
            .count()
    }

    #[test]
    fn entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut log = SegmentedDiskLog::open(config(dir.path(), 1024)).unwrap();
            for v in 1..=4 {
                assert_eq!(log.append(entry(v)).unwrap(), Index::new(v as u64));
            }
        }

        let log: SegmentedDiskLog<TestEntry> =
            SegmentedDiskLog::open(config(dir.path(), 1024)).unwrap();
        assert_eq!(log.next_index(), Index::new(5));
        assert_eq!(log.read(Index::new(2)).unwrap(), Some(entry(2)));
        assert_eq!(log.read(Index::new(5)).unwrap(), None);
    }

    #[test]
    fn rolls_segments_and_compacts_whole_ones() {
        let dir = tempfile::tempdir().unwrap();
        // Each record is 18 bytes, so every segment holds two records.
        let mut log = SegmentedDiskLog::open(config(dir.path(), 30)).unwrap();
        for v in 1..=6 {
            log.append(entry(v)).unwrap();
        }
        assert_eq!(segment_count(dir.path()), 3);

        log.compact(Index::new(4)).unwrap();
        assert_eq!(segment_count(dir.path()), 2);
        assert_eq!(log.first_index(), Index::new(4));
        assert_eq!(log.read(Index::new(3)).unwrap(), None);
        assert_eq!(log.read(Index::new(4)).unwrap(), Some(entry(4)));
        assert_eq!(log.append(entry(7)).unwrap(), Index::new(7));
    }

    #[test]
    fn truncate_across_segments() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = SegmentedDiskLog::open(config(dir.path(), 30)).unwrap();
        for v in 1..=6 {
            log.append(entry(v)).unwrap();
        }

        log.truncate(Index::new(4)).unwrap();
        assert_eq!(log.next_index(), Index::new(4));
        assert_eq!(segment_count(dir.path()), 2);
        assert_eq!(log.append(entry(40)).unwrap(), Index::new(4));
        drop(log);

        let log: SegmentedDiskLog<TestEntry> =
            SegmentedDiskLog::open(config(dir.path(), 30)).unwrap();
        assert_eq!(log.next_index(), Index::new(5));
        assert_eq!(log.read(Index::new(3)).unwrap(), Some(entry(3)));
        assert_eq!(log.read(Index::new(4)).unwrap(), Some(entry(40)));
    }

    #[test]
    fn torn_tail_is_cut_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut log = SegmentedDiskLog::open(config(dir.path(), 1024)).unwrap();
            log.append(entry(1)).unwrap();
            log.append(entry(2)).unwrap();
        }

        let segment = dir.path().join(format!("{:020}.log", 1));
        let mut file = OpenOptions::new().append(true).open(&segment).unwrap();
        // Header claims 10 bytes but only 3 follow.
        file.write_all(&[10, 0, 0, 0, 1, 2, 3, 4, 9, 9, 9]).unwrap();
        drop(file);

        let mut log: SegmentedDiskLog<TestEntry> =
            SegmentedDiskLog::open(config(dir.path(), 1024)).unwrap();
        assert_eq!(log.next_index(), Index::new(3));
        assert_eq!(log.append(entry(3)).unwrap(), Index::new(3));
        assert_eq!(log.read(Index::new(3)).unwrap(), Some(entry(3)));
    }

    #[test]
    fn reset_is_remembered() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut log = SegmentedDiskLog::open(config(dir.path(), 1024)).unwrap();
            log.append(entry(1)).unwrap();
            log.reset(Index::new(50)).unwrap();
        }

        let log: SegmentedDiskLog<TestEntry> =
            SegmentedDiskLog::open(config(dir.path(), 1024)).unwrap();
        assert_eq!(log.first_index(), Index::new(50));
        assert_eq!(log.next_index(), Index::new(50));
        assert_eq!(log.read(Index::new(1)).unwrap(), None);
    }
}
