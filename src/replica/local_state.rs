use crate::replica::peers::ReplicaId;
use std::fs;
use std::io;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{fmt, str};

#[derive(Copy, Clone, PartialOrd, Ord, PartialEq, Eq, Hash, Default)]
pub struct Term(u64);

impl Term {
    pub fn new(term: u64) -> Self {
        Term(term)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    fn incr(&mut self) {
        self.0 += 1;
    }
}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// PersistentLocalState is used whenever raft requires that something is persisted to a
/// durable store to guarantee safety. Not everything that uses disk has to go through this, only
/// algorithm-correctness-critical ones: the current term and who we voted for in it.
///
/// Store methods should be implemented atomically via a CAS like operation. Similar to most CAS
/// method signatures, the CAS store methods will return true if we have mutated state. A store
/// method must not report success until the new value is durable.
pub trait PersistentLocalState: Send {
    /// Set current term to `new_term` atomically, iff it is larger than current term. Clears the
    /// vote, since we haven't voted in the new term yet.
    ///
    /// CAS: Return true if we successfully mutated state.
    fn store_term_if_increased(&mut self, new_term: Term) -> Result<bool, io::Error>;

    /// Store our vote for the latest term iff the latest term (internal state) is the same term as
    /// the one provided, and we have not stored a vote for the latest term.
    ///
    /// CAS: Return true if we successfully mutated state.
    fn store_vote_for_term_if_unvoted(&mut self, expected_current_term: Term, vote: ReplicaId) -> Result<bool, io::Error>;

    /// Return the new term. Used when transitioning to candidate.
    fn increment_term_and_vote_for_self(&mut self) -> Result<Term, io::Error>;

    fn current_term(&self) -> Term;
    fn voted_for_current_term(&self) -> (Term, Option<Arc<ReplicaId>>);
}

/// VolatileLocalState keeps term and vote in RAM. Good enough for tests and for clusters where a
/// restarted replica is treated as a brand new one.
pub struct VolatileLocalState {
    current_term: Term,
    voted_for_this_term: Option<Arc<ReplicaId>>,
    my_replica_id: Arc<ReplicaId>,
}

impl VolatileLocalState {
    pub fn new(my_replica_id: ReplicaId) -> Self {
        VolatileLocalState {
            current_term: Term::new(0),
            voted_for_this_term: None,
            my_replica_id: Arc::new(my_replica_id),
        }
    }
}

impl PersistentLocalState for VolatileLocalState {
    fn store_term_if_increased(&mut self, new_term: Term) -> Result<bool, io::Error> {
        if new_term <= self.current_term {
            return Ok(false);
        }

        self.current_term = new_term;
        self.voted_for_this_term = None;
        Ok(true)
    }

    fn store_vote_for_term_if_unvoted(&mut self, expected_term: Term, vote: ReplicaId) -> Result<bool, io::Error> {
        if expected_term != self.current_term || self.voted_for_this_term.is_some() {
            return Ok(false);
        }

        self.voted_for_this_term.replace(Arc::new(vote));
        Ok(true)
    }

    fn increment_term_and_vote_for_self(&mut self) -> Result<Term, io::Error> {
        self.current_term.incr();
        self.voted_for_this_term.replace(self.my_replica_id.clone());

        Ok(self.current_term)
    }

    fn current_term(&self) -> Term {
        self.current_term
    }

    fn voted_for_current_term(&self) -> (Term, Option<Arc<ReplicaId>>) {
        (self.current_term, self.voted_for_this_term.clone())
    }
}

/// FileLocalState persists term and vote to a single small file. Every write goes to a temp file
/// which is fsync'd and then renamed over the real one, so a crash leaves either the old or the
/// new state on disk, never a torn one.
///
/// File format (text, one line): `{term} {voted_for}` where `voted_for` may be empty.
pub struct FileLocalState {
    path: PathBuf,
    inner: VolatileLocalState,
}

impl FileLocalState {
    /// Opens (or creates) the state file at `path`. An existing file is loaded; a corrupt file is
    /// an error rather than being silently reset, because resetting could let us vote twice.
    pub fn open<P: AsRef<Path>>(path: P, my_replica_id: ReplicaId) -> Result<Self, io::Error> {
        let path = path.as_ref().to_path_buf();
        let mut inner = VolatileLocalState::new(my_replica_id);

        match fs::read(&path) {
            Ok(bytes) => {
                let (term, voted_for) = Self::decode(&bytes)?;
                inner.current_term = term;
                inner.voted_for_this_term = voted_for.map(Arc::new);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        Ok(FileLocalState { path, inner })
    }

    fn decode(bytes: &[u8]) -> Result<(Term, Option<ReplicaId>), io::Error> {
        let invalid = |msg: &str| io::Error::new(io::ErrorKind::InvalidData, format!("local state file: {}", msg));

        let text = str::from_utf8(bytes).map_err(|_| invalid("not utf8"))?;
        let line = text.trim_end_matches('\n');
        let (term_str, vote_str) = match line.find(' ') {
            Some(pos) => (&line[..pos], &line[pos + 1..]),
            None => return Err(invalid("missing separator")),
        };
        let term = term_str.parse::<u64>().map_err(|_| invalid("bad term"))?;
        let voted_for = if vote_str.is_empty() {
            None
        } else {
            Some(ReplicaId::new(vote_str))
        };

        Ok((Term::new(term), voted_for))
    }

    fn persist(&self, term: Term, voted_for: Option<&ReplicaId>) -> Result<(), io::Error> {
        let line = format!(
            "{} {}\n",
            term.as_u64(),
            voted_for.map(|id| id.as_str()).unwrap_or("")
        );

        replace_file(&self.path, line.as_bytes())
    }
}

/// Write `contents` to a temp file next to `path`, fsync it and rename it over `path`. Readers
/// see either the old file or the new one.
pub(crate) fn replace_file(path: &Path, contents: &[u8]) -> Result<(), io::Error> {
    let mut tmp_path = path.as_os_str().to_owned();
    tmp_path.push(".tmp");
    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)
}

impl PersistentLocalState for FileLocalState {
    fn store_term_if_increased(&mut self, new_term: Term) -> Result<bool, io::Error> {
        if new_term <= self.inner.current_term {
            return Ok(false);
        }

        self.persist(new_term, None)?;
        self.inner.store_term_if_increased(new_term)
    }

    fn store_vote_for_term_if_unvoted(&mut self, expected_term: Term, vote: ReplicaId) -> Result<bool, io::Error> {
        if expected_term != self.inner.current_term || self.inner.voted_for_this_term.is_some() {
            return Ok(false);
        }

        self.persist(expected_term, Some(&vote))?;
        self.inner.store_vote_for_term_if_unvoted(expected_term, vote)
    }

    fn increment_term_and_vote_for_self(&mut self) -> Result<Term, io::Error> {
        let new_term = Term::new(self.inner.current_term.as_u64() + 1);
        self.persist(new_term, Some(&self.inner.my_replica_id))?;
        self.inner.increment_term_and_vote_for_self()
    }

    fn current_term(&self) -> Term {
        self.inner.current_term()
    }

    fn voted_for_current_term(&self) -> (Term, Option<Arc<ReplicaId>>) {
        self.inner.voted_for_current_term()
    }
}
