use std::convert::TryFrom;
use std::{fmt, io};

#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash)]
struct U64NonZero(u64);

impl U64NonZero {
    fn new(val: u64) -> Self {
        assert_ne!(val, 0);
        U64NonZero(val)
    }
}

/// Index is an index of an entry in the log; i.e. a log entry's index. For the mutation log this
/// is the mutation's sequence number.
#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash)]
pub struct Index(U64NonZero);

impl Index {
    pub fn new(index: u64) -> Self {
        Index(U64NonZero::new(index))
    }

    pub fn new_usize(index: usize) -> Self {
        Self::new(index as u64)
    }

    /// Wire formats use 0 for "no index".
    pub fn from_u64(index: u64) -> Option<Self> {
        match index {
            0 => None,
            i => Some(Index::new(i)),
        }
    }

    pub fn start_index() -> Self {
        Self::new(1)
    }

    pub fn as_u64(&self) -> u64 {
        self.0 .0
    }

    pub fn plus(&self, delta: u64) -> Index {
        Index::new(self.as_u64() + delta)
    }

    pub fn checked_minus(&self, delta: u64) -> Option<Index> {
        self.as_u64().checked_sub(delta).and_then(Index::from_u64)
    }

    /// Number of entries in the half-open range `[self, end)`. Zero if `end <= self`.
    pub fn distance_to(&self, end: Index) -> u64 {
        end.as_u64().saturating_sub(self.as_u64())
    }
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0 .0)
    }
}

/// Log is an append only log intended for use as a replicated commit log in a database.
///
/// Log indexes entries starting from 1. There will be no entry existing at index 0. The first
/// entry is written at index 1. Compaction moves the first readable index forward; indexes are
/// never reused after compaction.
pub trait Log<E: Entry> {
    /// append() appends a log entry to the log at the next log entry index, then returns
    /// the log entry index that was just used to append the entry. The entry is durable once this
    /// returns.
    fn append(&mut self, entry: E) -> Result<Index, io::Error>;

    /// Read log entry at specified index. Returns None for indexes that were compacted away or
    /// haven't been written yet.
    fn read(&self, index: Index) -> Result<Option<E>, io::Error>;

    /// Deletes anything starting at `index` and later.
    fn truncate(&mut self, index: Index) -> Result<(), io::Error>;

    /// Discards entries strictly before `index`. Implementations may keep some of them readable
    /// until a storage unit can be reclaimed as a whole.
    fn compact(&mut self, index: Index) -> Result<(), io::Error>;

    /// Drops every entry. The next append lands at `next_index`.
    fn reset(&mut self, next_index: Index) -> Result<(), io::Error>;

    /// first_index returns the lowest index that may still be read.
    fn first_index(&self) -> Index;

    /// next_index returns the next index that will be used to append an entry.
    fn next_index(&self) -> Index;
}

pub trait Entry: Clone + Into<Vec<u8>> + TryFrom<Vec<u8>, Error = io::Error> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_arithmetic() {
        let i = Index::new(5);
        assert_eq!(i.plus(2), Index::new(7));
        assert_eq!(i.checked_minus(4), Some(Index::start_index()));
        assert_eq!(i.checked_minus(5), None);
        assert_eq!(i.checked_minus(6), None);
        assert_eq!(i.distance_to(Index::new(9)), 4);
        assert_eq!(i.distance_to(Index::new(2)), 0);
        assert_eq!(Index::from_u64(0), None);
        assert_eq!(format!("{:?}", i), "5");
    }
}
