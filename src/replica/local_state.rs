use crate::replica::peers::ReplicaId;
use bytes::{Buf, BufMut};
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::fmt;

/// Election epoch. At most one leader exists per term.
#[derive(Copy, Clone, PartialOrd, Ord, PartialEq, Eq, Hash)]
pub struct Term(u64);

impl Term {
    pub fn new(term: u64) -> Self {
        Term(term)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub(crate) fn incr(&mut self) {
        self.0 += 1;
    }
}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// PersistentLocalState holds what election safety requires to survive a restart: the current
/// term and the vote cast in it.
///
/// Store methods are CAS-like: they return true iff they mutated state. State is durable before a
/// mutating method returns.
pub(crate) trait PersistentLocalState: Send + 'static {
    /// Set current term to `new_term` iff it is larger than the current term. Clears the vote.
    fn store_term_if_increased(&mut self, new_term: Term) -> io::Result<bool>;

    /// Store our vote iff `expected_current_term` is the current term and we haven't voted in it.
    fn store_vote_for_term_if_unvoted(&mut self, expected_current_term: Term, vote: ReplicaId) -> io::Result<bool>;

    /// Return the new term. Used when transitioning to candidate.
    fn increment_term_and_vote_for_self(&mut self) -> io::Result<Term>;

    fn current_term(&self) -> Term;
    fn voted_for_current_term(&self) -> (Term, Option<Arc<ReplicaId>>);
}

#[derive(Clone, Debug, PartialEq)]
struct TermAndVote {
    current_term: Term,
    voted_for_this_term: Option<Arc<ReplicaId>>,
}

impl TermAndVote {
    fn empty() -> Self {
        TermAndVote {
            current_term: Term::new(0),
            voted_for_this_term: None,
        }
    }

    fn next_for_term(&self, new_term: Term) -> Option<TermAndVote> {
        if new_term <= self.current_term {
            None
        } else {
            Some(TermAndVote {
                current_term: new_term,
                voted_for_this_term: None,
            })
        }
    }

    fn next_for_vote(&self, expected_term: Term, vote: ReplicaId) -> Option<TermAndVote> {
        if expected_term == self.current_term && self.voted_for_this_term.is_none() {
            Some(TermAndVote {
                current_term: self.current_term,
                voted_for_this_term: Some(Arc::new(vote)),
            })
        } else {
            None
        }
    }

    fn next_for_self_vote(&self, me: &Arc<ReplicaId>) -> TermAndVote {
        let mut current_term = self.current_term;
        current_term.incr();
        TermAndVote {
            current_term,
            voted_for_this_term: Some(me.clone()),
        }
    }
}

/// In-memory local state for tests.
#[cfg(test)]
pub(crate) struct VolatileLocalState {
    state: TermAndVote,
    my_replica_id: Arc<ReplicaId>,
}

#[cfg(test)]
impl VolatileLocalState {
    pub(crate) fn new(my_replica_id: ReplicaId) -> Self {
        VolatileLocalState {
            state: TermAndVote::empty(),
            my_replica_id: Arc::new(my_replica_id),
        }
    }
}

#[cfg(test)]
impl PersistentLocalState for VolatileLocalState {
    fn store_term_if_increased(&mut self, new_term: Term) -> io::Result<bool> {
        Ok(match self.state.next_for_term(new_term) {
            Some(next) => {
                self.state = next;
                true
            }
            None => false,
        })
    }

    fn store_vote_for_term_if_unvoted(&mut self, expected_term: Term, vote: ReplicaId) -> io::Result<bool> {
        Ok(match self.state.next_for_vote(expected_term, vote) {
            Some(next) => {
                self.state = next;
                true
            }
            None => false,
        })
    }

    fn increment_term_and_vote_for_self(&mut self) -> io::Result<Term> {
        self.state = self.state.next_for_self_vote(&self.my_replica_id);
        Ok(self.state.current_term)
    }

    fn current_term(&self) -> Term {
        self.state.current_term
    }

    fn voted_for_current_term(&self) -> (Term, Option<Arc<ReplicaId>>) {
        (self.state.current_term, self.state.voted_for_this_term.clone())
    }
}

const FORMAT_VERSION: u8 = 1;

/// Term and vote kept in a single small file. Every change rewrites the file through a temp file
/// and a rename, so a crash leaves either the old or the new state.
///
/// File layout: `[version u8][term u64 LE][vote length u16 LE][vote bytes][crc32 u32 LE]`, the crc
/// covering everything before it. A vote length of 0 means no vote.
pub(crate) struct FileLocalState {
    path: PathBuf,
    state: TermAndVote,
    my_replica_id: Arc<ReplicaId>,
}

impl FileLocalState {
    pub(crate) fn open<P: Into<PathBuf>>(path: P, my_replica_id: ReplicaId) -> io::Result<Self> {
        let path = path.into();
        let state = match fs::read(&path) {
            Ok(bytes) => decode(&bytes)?,
            Err(e) if e.kind() == ErrorKind::NotFound => TermAndVote::empty(),
            Err(e) => return Err(e),
        };

        Ok(FileLocalState {
            path,
            state,
            my_replica_id: Arc::new(my_replica_id),
        })
    }

    fn persist(&mut self, next: TermAndVote) -> io::Result<()> {
        let tmp_path = self.path.with_extension("tmp");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            file.write_all(&encode(&next))?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        if let Some(parent) = self.path.parent() {
            sync_directory(parent)?;
        }

        self.state = next;
        Ok(())
    }
}

impl PersistentLocalState for FileLocalState {
    fn store_term_if_increased(&mut self, new_term: Term) -> io::Result<bool> {
        match self.state.next_for_term(new_term) {
            Some(next) => self.persist(next).map(|_| true),
            None => Ok(false),
        }
    }

    fn store_vote_for_term_if_unvoted(&mut self, expected_term: Term, vote: ReplicaId) -> io::Result<bool> {
        match self.state.next_for_vote(expected_term, vote) {
            Some(next) => self.persist(next).map(|_| true),
            None => Ok(false),
        }
    }

    fn increment_term_and_vote_for_self(&mut self) -> io::Result<Term> {
        let next = self.state.next_for_self_vote(&self.my_replica_id);
        self.persist(next)?;
        Ok(self.state.current_term)
    }

    fn current_term(&self) -> Term {
        self.state.current_term
    }

    fn voted_for_current_term(&self) -> (Term, Option<Arc<ReplicaId>>) {
        (self.state.current_term, self.state.voted_for_this_term.clone())
    }
}

fn encode(state: &TermAndVote) -> Vec<u8> {
    let vote = state
        .voted_for_this_term
        .as_ref()
        .map(|id| id.as_str().as_bytes())
        .unwrap_or(&[]);

    let mut buf = Vec::with_capacity(1 + 8 + 2 + vote.len() + 4);
    buf.put_u8(FORMAT_VERSION);
    buf.put_u64_le(state.current_term.as_u64());
    buf.put_u16_le(vote.len() as u16);
    buf.put_slice(vote);
    let crc = crc32fast::hash(&buf);
    buf.put_u32_le(crc);
    buf
}

fn decode(bytes: &[u8]) -> io::Result<TermAndVote> {
    let invalid = |msg: &str| io::Error::new(ErrorKind::InvalidData, format!("local state file: {}", msg));

    if bytes.len() < 1 + 8 + 2 + 4 {
        return Err(invalid("too short"));
    }
    let (body, mut crc_bytes) = bytes.split_at(bytes.len() - 4);
    if crc32fast::hash(body) != crc_bytes.get_u32_le() {
        return Err(invalid("checksum mismatch"));
    }

    let mut body = body;
    let version = body.get_u8();
    if version != FORMAT_VERSION {
        return Err(invalid("unknown version"));
    }
    let current_term = Term::new(body.get_u64_le());
    let vote_len = body.get_u16_le() as usize;
    if body.remaining() != vote_len {
        return Err(invalid("vote length mismatch"));
    }
    let voted_for_this_term = if vote_len == 0 {
        None
    } else {
        let vote = String::from_utf8(body.to_vec()).map_err(|_| invalid("vote is not utf-8"))?;
        Some(Arc::new(ReplicaId::new(vote)))
    };

    Ok(TermAndVote {
        current_term,
        voted_for_this_term,
    })
}

fn sync_directory(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn me() -> ReplicaId {
        ReplicaId::new("me")
    }

    #[test]
    fn volatile_state_cas_semantics() {
        let mut state = VolatileLocalState::new(me());
        assert_eq!(state.current_term(), Term::new(0));

        assert!(state.store_term_if_increased(Term::new(3)).unwrap());
        assert!(!state.store_term_if_increased(Term::new(3)).unwrap());
        assert!(!state.store_term_if_increased(Term::new(2)).unwrap());

        // Wrong term, then a vote, then a second vote in the same term.
        assert!(!state.store_vote_for_term_if_unvoted(Term::new(2), ReplicaId::new("a")).unwrap());
        assert!(state.store_vote_for_term_if_unvoted(Term::new(3), ReplicaId::new("a")).unwrap());
        assert!(!state.store_vote_for_term_if_unvoted(Term::new(3), ReplicaId::new("b")).unwrap());
        assert_eq!(
            state.voted_for_current_term(),
            (Term::new(3), Some(Arc::new(ReplicaId::new("a"))))
        );

        // New term clears the vote.
        assert!(state.store_term_if_increased(Term::new(4)).unwrap());
        assert_eq!(state.voted_for_current_term(), (Term::new(4), None));

        assert_eq!(state.increment_term_and_vote_for_self().unwrap(), Term::new(5));
        assert_eq!(state.voted_for_current_term(), (Term::new(5), Some(Arc::new(me()))));
    }

    #[test]
    fn file_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local_state");

        {
            let mut state = FileLocalState::open(&path, me()).unwrap();
            assert_eq!(state.voted_for_current_term(), (Term::new(0), None));
            state.store_term_if_increased(Term::new(7)).unwrap();
            state
                .store_vote_for_term_if_unvoted(Term::new(7), ReplicaId::new("peer-2"))
                .unwrap();
        }

        let mut state = FileLocalState::open(&path, me()).unwrap();
        assert_eq!(
            state.voted_for_current_term(),
            (Term::new(7), Some(Arc::new(ReplicaId::new("peer-2"))))
        );
        assert!(!state
            .store_vote_for_term_if_unvoted(Term::new(7), ReplicaId::new("peer-3"))
            .unwrap());

        assert_eq!(state.increment_term_and_vote_for_self().unwrap(), Term::new(8));
        drop(state);
        let state = FileLocalState::open(&path, me()).unwrap();
        assert_eq!(state.voted_for_current_term(), (Term::new(8), Some(Arc::new(me()))));
    }

    #[test]
    fn corrupt_file_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local_state");
        {
            let mut state = FileLocalState::open(&path, me()).unwrap();
            state.store_term_if_increased(Term::new(2)).unwrap();
        }

        let mut bytes = fs::read(&path).unwrap();
        bytes[3] ^= 0xff;
        fs::write(&path, &bytes).unwrap();

        let err = FileLocalState::open(&path, me()).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }
}
