use crate::commitlog::{Entry, Index, Log};
use std::collections::VecDeque;
use std::io;
use std::marker::PhantomData;

/// InMemoryLog is a volatile log for tests and for cells that don't need to survive a restart.
pub struct InMemoryLog<E: Entry> {
    // We don't *need* to convert these to bytes. We could just hold the original entry in memory,
    // but we want to exercise the conversion logic.
    log: VecDeque<Vec<u8>>,
    first_index: Index,
    _pd: PhantomData<E>,
}

impl<E: Entry> InMemoryLog<E> {
    pub fn create() -> Result<Self, io::Error> {
        Ok(InMemoryLog {
            log: VecDeque::new(),
            first_index: Index::start_index(),
            _pd: PhantomData::default(),
        })
    }

    fn slot(&self, index: Index) -> Option<usize> {
        if index < self.first_index {
            None
        } else {
            Some(self.first_index.distance_to(index) as usize)
        }
    }
}

impl<E: Entry> Log<E> for InMemoryLog<E> {
    fn append(&mut self, entry: E) -> Result<Index, io::Error> {
        self.log.push_back(entry.into());

        Ok(self.first_index.plus(self.log.len() as u64 - 1))
    }

    fn read(&self, index: Index) -> Result<Option<E>, io::Error> {
        match self.slot(index).and_then(|slot| self.log.get(slot)) {
            Some(bytes) => E::try_from(bytes.clone()).map(Some),
            None => Ok(None),
        }
    }

    fn truncate(&mut self, index: Index) -> Result<(), io::Error> {
        match self.slot(index) {
            Some(slot) => self.log.truncate(slot),
            None => {
                self.log.clear();
                self.first_index = index;
            }
        }
        Ok(())
    }

    fn compact(&mut self, index: Index) -> Result<(), io::Error> {
        let index = std::cmp::min(index, self.next_index());
        if let Some(slot) = self.slot(index) {
            self.log.drain(..slot);
            self.first_index = index;
        }
        Ok(())
    }

    fn reset(&mut self, next_index: Index) -> Result<(), io::Error> {
        self.log.clear();
        self.first_index = next_index;
        Ok(())
    }

    fn first_index(&self) -> Index {
        self.first_index
    }

    fn next_index(&self) -> Index {
        self.first_index.plus(self.log.len() as u64)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::convert::TryFrom;

    #[derive(Clone, Debug, PartialEq)]
    pub(crate) struct TestEntry(pub(crate) Vec<u8>);

    impl Entry for TestEntry {}

    impl From<TestEntry> for Vec<u8> {
        fn from(entry: TestEntry) -> Self {
            entry.0
        }
    }

    impl TryFrom<Vec<u8>> for TestEntry {
        type Error = io::Error;

        fn try_from(bytes: Vec<u8>) -> Result<Self, Self::Error> {
            Ok(TestEntry(bytes))
        }
    }

    fn entry(v: u8) -> TestEntry {
        TestEntry(vec![v; 3])
    }

    #[test]
    fn append_read_truncate() {
        let mut log = InMemoryLog::create().unwrap();
        for v in 1..=5 {
            assert_eq!(log.append(entry(v)).unwrap(), Index::new(v as u64));
        }
        assert_eq!(log.read(Index::new(3)).unwrap(), Some(entry(3)));
        assert_eq!(log.read(Index::new(6)).unwrap(), None);

        log.truncate(Index::new(4)).unwrap();
        assert_eq!(log.next_index(), Index::new(4));
        assert_eq!(log.read(Index::new(4)).unwrap(), None);
        assert_eq!(log.append(entry(9)).unwrap(), Index::new(4));
    }

    #[test]
    fn compaction_keeps_indexes_stable() {
        let mut log = InMemoryLog::create().unwrap();
        for v in 1..=5 {
            log.append(entry(v)).unwrap();
        }

        log.compact(Index::new(4)).unwrap();
        assert_eq!(log.first_index(), Index::new(4));
        assert_eq!(log.read(Index::new(3)).unwrap(), None);
        assert_eq!(log.read(Index::new(4)).unwrap(), Some(entry(4)));
        assert_eq!(log.append(entry(6)).unwrap(), Index::new(6));

        // Compacting past the end behaves like compacting everything.
        log.compact(Index::new(100)).unwrap();
        assert_eq!(log.first_index(), Index::new(7));
        assert_eq!(log.next_index(), Index::new(7));
    }

    #[test]
    fn reset_moves_next_index() {
        let mut log = InMemoryLog::create().unwrap();
        log.append(entry(1)).unwrap();
        log.reset(Index::new(42)).unwrap();
        assert_eq!(log.read(Index::new(1)).unwrap(), None);
        assert_eq!(log.append(entry(2)).unwrap(), Index::new(42));
    }
}
