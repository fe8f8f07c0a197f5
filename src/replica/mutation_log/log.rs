use crate::commitlog::{Index, Log};
use crate::replica::local_state::Term;
use crate::replica::mutation_log::MutationRecord;
use std::io;

/// MutationLog is the replica's view of the replicated log. It wraps a storage [`Log`] with the
/// bookkeeping consensus needs.
///
/// A record goes through 3 states, tracked per replica:
/// 1. Persisted - written to local storage, not yet known to be on a quorum
/// 2. Committed - known to be on a quorum
/// 3. Applied - committed and applied to the automaton
///
/// Everything at or below the snapshot boundary is folded into the latest local snapshot, counts
/// as committed and applied, and may be missing from storage.
pub(crate) struct MutationLog<L>
where
    L: Log<MutationRecord>,
{
    logger: slog::Logger,

    log: L,
    // Highest locally written record, or the snapshot boundary if the log holds nothing past it.
    latest_entry_metadata: Option<(Term, Index)>,
    snapshot_boundary: Option<(Term, Index)>,

    // Index of highest record known to be committed. None if nothing is committed.
    commit_index: Option<Index>,
    // Index of highest record applied to the automaton. None if nothing is applied.
    last_applied_index: Option<Index>,
}

impl<L> MutationLog<L>
where
    L: Log<MutationRecord>,
{
    /// Recovers from what storage holds. `snapshot_boundary` is the (term, id) of the snapshot the
    /// automaton was loaded from. Records past it are kept but not known to be committed; the
    /// leader re-commits them.
    pub(crate) fn new(
        logger: slog::Logger,
        mut log: L,
        snapshot_boundary: Option<(Term, Index)>,
    ) -> Result<Self, io::Error> {
        match snapshot_boundary {
            Some((_, boundary)) => {
                // The log must continue right after the snapshot. Anything else is unusable.
                let first_needed = boundary.plus(1);
                if log.next_index() <= first_needed || log.first_index() > first_needed {
                    if log.next_index() != first_needed {
                        slog::info!(
                            logger,
                            "Discarding log records that don't continue the snapshot";
                            "FirstIndex" => ?log.first_index(),
                            "NextIndex" => ?log.next_index(),
                            "SnapshotId" => ?boundary
                        );
                    }
                    log.reset(first_needed)?;
                }
            }
            None => {
                if log.first_index() > Index::start_index() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "Log prefix was compacted but there is no snapshot covering it",
                    ));
                }
            }
        }

        let mut latest_entry_metadata = snapshot_boundary;
        if let Some(last_index) = log.next_index().checked_minus(1) {
            if snapshot_boundary.map_or(true, |(_, b)| last_index > b) {
                let last = log.read(last_index)?.ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidData, "Last log record is unreadable")
                })?;
                latest_entry_metadata = Some((last.term, last_index));
            }
        }

        let boundary_index = snapshot_boundary.map(|(_, index)| index);
        Ok(MutationLog {
            logger,
            log,
            latest_entry_metadata,
            snapshot_boundary,
            commit_index: boundary_index,
            last_applied_index: boundary_index,
        })
    }

    pub(crate) fn latest_entry(&self) -> Option<(Term, Index)> {
        self.latest_entry_metadata
    }

    pub(crate) fn latest_index(&self) -> Option<Index> {
        self.latest_entry_metadata.map(|(_, index)| index)
    }

    pub(crate) fn snapshot_boundary(&self) -> Option<(Term, Index)> {
        self.snapshot_boundary
    }

    fn boundary_index(&self) -> Option<Index> {
        self.snapshot_boundary.map(|(_, index)| index)
    }

    /// First index readable from storage.
    pub(crate) fn first_index(&self) -> Index {
        match self.boundary_index() {
            Some(boundary) => boundary.plus(1),
            None => Index::start_index(),
        }
    }

    /// Records at or below the snapshot boundary are not readable.
    pub(crate) fn read(&self, index: Index) -> Result<Option<MutationRecord>, io::Error> {
        if index < self.first_index() {
            return Ok(None);
        }
        self.log.read(index)
    }

    fn read_required(&self, index: Index) -> Result<MutationRecord, io::Error> {
        match self.read(index) {
            Ok(Some(record)) => Ok(record),
            Ok(None) => panic!("read_required() found no log record for index {:?}", index),
            Err(ioe) => Err(ioe),
        }
    }

    /// Term of the record at `index`. Known for the snapshot boundary itself; unknown below it.
    pub(crate) fn term_at(&self, index: Index) -> Result<Option<Term>, io::Error> {
        if let Some((term, boundary)) = self.snapshot_boundary {
            if index == boundary {
                return Ok(Some(term));
            }
        }
        Ok(self.read(index)?.map(|record| record.term))
    }

    /// Lazily reads `[from, to]`. A record that vanished underneath (e.g. compacted) ends the
    /// range with an error.
    pub(crate) fn read_range(&self, from: Index, to: Index) -> RecordRange<'_, L> {
        RecordRange {
            log: self,
            next: from,
            end: to,
        }
    }

    /// Remove anything starting at `index` and later. Committed records are never removed.
    pub(crate) fn truncate(&mut self, index: Index) -> Result<(), io::Error> {
        if let Some(commit_index) = self.commit_index {
            assert!(
                index > commit_index,
                "Can't truncate committed records. Expected [input] {:?} > {:?} [commit]",
                index,
                commit_index
            );
        }

        let mut new_latest_entry_metadata = None;
        if let Some(new_latest_entry_index) = index.checked_minus(1) {
            new_latest_entry_metadata = self
                .term_at(new_latest_entry_index)?
                .map(|term| (term, new_latest_entry_index));
        }

        self.log.truncate(index)?;

        slog::debug!(self.logger, "Truncated log"; "From" => ?index);
        self.latest_entry_metadata = new_latest_entry_metadata;
        Ok(())
    }

    pub(crate) fn append(&mut self, record: MutationRecord) -> Result<Index, io::Error> {
        let appended_term = record.term;
        let appended_index = self.log.append(record)?;
        // Only update state after log action completes.
        self.latest_entry_metadata = Some((appended_term, appended_index));

        Ok(appended_index)
    }

    pub(crate) fn commit_index(&self) -> Option<Index> {
        self.commit_index
    }

    pub(crate) fn last_applied_index(&self) -> Option<Index> {
        self.last_applied_index
    }

    /// Leader side. Commits `tentative_new_commit_index` if it moves forward and holds a record of
    /// the current term; earlier terms only commit indirectly.
    pub(crate) fn ratchet_fwd_commit_index_if_valid(
        &mut self,
        tentative_new_commit_index: Index,
        current_term: Term,
    ) -> Result<bool, io::Error> {
        if matches!(self.commit_index, Some(ci) if tentative_new_commit_index <= ci) {
            return Ok(false);
        }

        let record = self.read_required(tentative_new_commit_index)?;
        if record.term != current_term {
            return Ok(false);
        }

        self.ratchet_fwd_commit_index_panicking(tentative_new_commit_index);
        Ok(true)
    }

    /// Follower side. Reordered replication messages may carry an older commit index; those are
    /// ignored.
    pub(crate) fn ratchet_fwd_commit_index_if_changed(&mut self, new_commit_index: Index) -> bool {
        if matches!(self.commit_index, Some(ci) if new_commit_index <= ci) {
            return false;
        }

        self.ratchet_fwd_commit_index_panicking(new_commit_index);
        true
    }

    fn ratchet_fwd_commit_index_panicking(&mut self, new_commit_index: Index) {
        if let Some(current_commit_index) = self.commit_index {
            assert!(
                new_commit_index > current_commit_index,
                "Can't ratchet commit index backwards. Expected [input] {:?} > {:?} [current]",
                new_commit_index,
                current_commit_index
            );
        }

        // Assert we only mark as committed if we have the record locally.
        let latest_locally_written_index = self
            .latest_index()
            .expect("Can't ratchet commit index forward if we don't have any local records");
        assert!(
            latest_locally_written_index >= new_commit_index,
            "Can't ratchet commit index forwards past our local log. Expected [latest log] {:?} >= {:?} [input]",
            latest_locally_written_index,
            new_commit_index
        );

        self.commit_index.replace(new_commit_index);
    }

    /// The next committed record to apply, if any. Apply order is strictly increasing.
    pub(crate) fn next_to_apply(&self) -> Option<Index> {
        let commit_index = self.commit_index?;
        let next = match self.last_applied_index {
            Some(applied) => applied.plus(1),
            None => Index::start_index(),
        };
        if next <= commit_index {
            Some(next)
        } else {
            None
        }
    }

    pub(crate) fn mark_applied(&mut self, index: Index) {
        assert_eq!(Some(index), self.next_to_apply(), "Records must be applied in order");
        self.last_applied_index.replace(index);
    }

    /// A local snapshot now covers `[1, snapshot_id]`; storage may drop that prefix.
    pub(crate) fn compact_through(&mut self, term: Term, snapshot_id: Index) -> Result<(), io::Error> {
        if matches!(self.boundary_index(), Some(b) if b >= snapshot_id) {
            return Ok(());
        }
        assert!(
            matches!(self.last_applied_index, Some(applied) if applied >= snapshot_id),
            "Can't compact past the applied index"
        );

        self.log.compact(snapshot_id.plus(1))?;
        self.snapshot_boundary = Some((term, snapshot_id));
        Ok(())
    }

    /// The automaton was replaced by a downloaded snapshot. Local records that agree with it are
    /// kept; otherwise the log restarts right after it.
    pub(crate) fn install_snapshot(&mut self, term: Term, snapshot_id: Index) -> Result<(), io::Error> {
        let agrees = match self.latest_index() {
            Some(latest) if latest > snapshot_id => self.term_at(snapshot_id)? == Some(term),
            _ => false,
        };

        if agrees {
            self.log.compact(snapshot_id.plus(1))?;
        } else {
            self.log.reset(snapshot_id.plus(1))?;
            self.latest_entry_metadata = Some((term, snapshot_id));
        }

        slog::info!(
            self.logger,
            "Installed snapshot into log";
            "SnapshotId" => ?snapshot_id,
            "KeptTail" => agrees
        );
        self.snapshot_boundary = Some((term, snapshot_id));
        if self.commit_index.map_or(true, |ci| ci < snapshot_id) {
            self.commit_index = Some(snapshot_id);
        }
        self.last_applied_index = Some(snapshot_id);
        Ok(())
    }

    /// Whether a peer expecting `next_index` can only be served a snapshot.
    pub(crate) fn needs_snapshot_for(&self, next_index: Index) -> bool {
        matches!(self.boundary_index(), Some(boundary) if next_index <= boundary)
    }
}

pub(crate) struct RecordRange<'a, L>
where
    L: Log<MutationRecord>,
{
    log: &'a MutationLog<L>,
    next: Index,
    end: Index,
}

impl<'a, L> Iterator for RecordRange<'a, L>
where
    L: Log<MutationRecord>,
{
    type Item = Result<(Index, MutationRecord), io::Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next > self.end {
            return None;
        }

        let index = self.next;
        self.next = index.plus(1);
        match self.log.read(index) {
            Ok(Some(record)) => Some(Ok((index, record))),
            Ok(None) => {
                // Stop after reporting the hole once.
                self.next = self.end.plus(1);
                Some(Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("No log record at index {:?}", index),
                )))
            }
            Err(e) => {
                self.next = self.end.plus(1);
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitlog::InMemoryLog;
    use bytes::Bytes;

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn record(term: u64, tag: &str) -> MutationRecord {
        MutationRecord {
            term: Term::new(term),
            timestamp: 0,
            mutation_type: "test".to_string(),
            payload: Bytes::copy_from_slice(tag.as_bytes()),
        }
    }

    fn log_with(terms: &[u64]) -> MutationLog<InMemoryLog<MutationRecord>> {
        let mut log = MutationLog::new(logger(), InMemoryLog::create().unwrap(), None).unwrap();
        for (i, term) in terms.iter().enumerate() {
            log.append(record(*term, &i.to_string())).unwrap();
        }
        log
    }

    #[test]
    fn commit_and_apply_in_order() {
        let mut log = log_with(&[1, 1, 2]);
        assert_eq!(log.latest_entry(), Some((Term::new(2), Index::new(3))));
        assert_eq!(log.next_to_apply(), None);

        // Index 2 belongs to an older term and can't be committed directly.
        assert!(!log.ratchet_fwd_commit_index_if_valid(Index::new(2), Term::new(2)).unwrap());
        assert!(log.ratchet_fwd_commit_index_if_valid(Index::new(3), Term::new(2)).unwrap());
        assert!(!log.ratchet_fwd_commit_index_if_valid(Index::new(3), Term::new(2)).unwrap());

        let mut applied = Vec::new();
        while let Some(index) = log.next_to_apply() {
            log.mark_applied(index);
            applied.push(index.as_u64());
        }
        assert_eq!(applied, vec![1, 2, 3]);

        // Stale follower commit index is ignored.
        assert!(!log.ratchet_fwd_commit_index_if_changed(Index::new(1)));
    }

    #[test]
    fn truncate_uncommitted_suffix() {
        let mut log = log_with(&[1, 1, 1, 1]);
        log.ratchet_fwd_commit_index_if_changed(Index::new(2));
        log.truncate(Index::new(3)).unwrap();
        assert_eq!(log.latest_entry(), Some((Term::new(1), Index::new(2))));

        log.append(record(3, "new")).unwrap();
        assert_eq!(log.term_at(Index::new(3)).unwrap(), Some(Term::new(3)));
    }

    #[test]
    #[should_panic]
    fn truncate_committed_panics() {
        let mut log = log_with(&[1, 1]);
        log.ratchet_fwd_commit_index_if_changed(Index::new(2));
        let _ = log.truncate(Index::new(2));
    }

    #[test]
    fn read_range_is_lazy_and_replayable() {
        let log = log_with(&[1, 1, 1, 1, 1]);
        let tags: Vec<_> = log
            .read_range(Index::new(2), Index::new(4))
            .map(|r| r.unwrap())
            .map(|(i, r)| (i.as_u64(), r.payload))
            .collect();
        assert_eq!(
            tags,
            vec![
                (2, Bytes::from_static(b"1")),
                (3, Bytes::from_static(b"2")),
                (4, Bytes::from_static(b"3"))
            ]
        );

        // A second pass yields the same records.
        assert_eq!(log.read_range(Index::new(2), Index::new(4)).count(), 3);

        // Reading past the end reports one hole and stops.
        let past_end: Vec<_> = log.read_range(Index::new(5), Index::new(9)).collect();
        assert_eq!(past_end.len(), 2);
        assert!(past_end[1].is_err());
    }

    #[test]
    fn compaction_moves_boundary() {
        let mut log = log_with(&[1, 1, 2, 2]);
        log.ratchet_fwd_commit_index_if_changed(Index::new(4));
        while let Some(index) = log.next_to_apply() {
            log.mark_applied(index);
        }

        log.compact_through(Term::new(1), Index::new(2)).unwrap();
        assert_eq!(log.first_index(), Index::new(3));
        assert_eq!(log.read(Index::new(1)).unwrap(), None);
        assert_eq!(log.term_at(Index::new(2)).unwrap(), Some(Term::new(1)));
        assert!(log.needs_snapshot_for(Index::new(2)));
        assert!(!log.needs_snapshot_for(Index::new(3)));
    }

    #[test]
    fn install_snapshot_keeps_agreeing_tail_and_drops_conflicting_one() {
        let mut agreeing = log_with(&[1, 1, 2, 2]);
        agreeing.install_snapshot(Term::new(1), Index::new(2)).unwrap();
        assert_eq!(agreeing.latest_entry(), Some((Term::new(2), Index::new(4))));
        assert_eq!(agreeing.last_applied_index(), Some(Index::new(2)));
        assert_eq!(agreeing.commit_index(), Some(Index::new(2)));

        let mut conflicting = log_with(&[1, 1, 1]);
        conflicting.install_snapshot(Term::new(3), Index::new(5)).unwrap();
        assert_eq!(conflicting.latest_entry(), Some((Term::new(3), Index::new(5))));
        assert_eq!(conflicting.read(Index::new(3)).unwrap(), None);
        assert_eq!(conflicting.append(record(3, "x")).unwrap(), Index::new(6));
    }

    #[test]
    fn recovery_resets_log_that_does_not_continue_snapshot() {
        let mut storage = InMemoryLog::create().unwrap();
        storage.append(record(1, "a")).unwrap();

        let log = MutationLog::new(logger(), storage, Some((Term::new(2), Index::new(10)))).unwrap();
        assert_eq!(log.latest_entry(), Some((Term::new(2), Index::new(10))));
        assert_eq!(log.commit_index(), Some(Index::new(10)));
        assert_eq!(log.next_to_apply(), None);
    }

    #[test]
    fn recovery_without_snapshot_refuses_compacted_log() {
        let mut storage = InMemoryLog::create().unwrap();
        storage.append(record(1, "a")).unwrap();
        storage.append(record(1, "b")).unwrap();
        storage.compact(Index::new(2)).unwrap();

        assert!(MutationLog::new(logger(), storage, None).is_err());
    }
}
