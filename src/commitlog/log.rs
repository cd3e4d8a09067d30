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

/// Index is an index of an entry in the log; i.e. a log entry's index.
#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash)]
pub struct Index(U64NonZero);

impl Index {
    pub fn new(index: u64) -> Self {
        Index(U64NonZero::new(index))
    }

    pub fn new_usize(index: usize) -> Self {
        Self::new(index as u64)
    }

    /// Maps the wire/proto convention (0 means "no entry") to an optional index.
    pub fn from_u64_opt(index: u64) -> Option<Self> {
        match index {
            0 => None,
            i => Some(Self::new(i)),
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
        let new_value = self.as_u64().saturating_sub(delta);
        if new_value > 0 {
            Some(Index::new(new_value))
        } else {
            None
        }
    }
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0 .0)
    }
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0 .0)
    }
}

/// Log is an append only log intended for use as a replicated commit log in a database.
///
/// Log indexes entries starting from 1. There will be no entry existing at index 0. The first
/// entry is written at index 1. After compaction, the log only retains entries starting at
/// `first_index()`; reads below that return `None`.
pub trait Log<E: Entry> {
    /// append() appends a log entry to the log at the next log entry index, then returns
    /// the log entry index that was just used to append the entry.
    fn append(&mut self, entry: E) -> Result<Index, io::Error>;

    /// Read log entry at specified index. Fails with `InvalidData` if the stored bytes can't be
    /// decoded.
    fn read(&self, index: Index) -> Result<Option<E>, io::Error>;

    /// Deletes anything starting at `index` and later.
    fn truncate(&mut self, index: Index) -> Result<(), io::Error>;

    /// Deletes everything up to and including `index`. If `index` is at or past the end of the
    /// log, the log becomes empty and the next appended entry will be written at `index + 1`.
    fn discard_through(&mut self, index: Index) -> Result<(), io::Error>;

    /// first_index returns the lowest index still retained. Equal to `next_index()` when empty.
    fn first_index(&self) -> Index;

    /// next_index returns the next index that will be used to append an entry.
    fn next_index(&self) -> Index;
}

// A node picks its log at startup (in memory or on disk), so the replica holds it boxed.
impl<E: Entry, L: Log<E> + ?Sized> Log<E> for Box<L> {
    fn append(&mut self, entry: E) -> Result<Index, io::Error> {
        (**self).append(entry)
    }

    fn read(&self, index: Index) -> Result<Option<E>, io::Error> {
        (**self).read(index)
    }

    fn truncate(&mut self, index: Index) -> Result<(), io::Error> {
        (**self).truncate(index)
    }

    fn discard_through(&mut self, index: Index) -> Result<(), io::Error> {
        (**self).discard_through(index)
    }

    fn first_index(&self) -> Index {
        (**self).first_index()
    }

    fn next_index(&self) -> Index {
        (**self).next_index()
    }
}

// Choice of Vec<u8> vs Bytes will depend on whats easier for disk to use.
pub trait Entry: Clone + TryFrom<Vec<u8>, Error = io::Error> + Into<Vec<u8>> {}
