use crate::commitlog::{Entry, Index, Log};
use std::convert::TryFrom;
use std::io;
use std::marker::PhantomData;

// The log lives in RAM only, so it's for tests and for nodes without a data path. Anything that
// has to survive a restart uses `FileLog`.
pub struct InMemoryLog<E: Entry> {
    // We don't *need* to convert these to bytes. We could just hold the original entry in memory,
    // but we want to exercise the conversion logic.
    log: Vec<Vec<u8>>,
    // Index of `log[0]`. Moves forward when a prefix is discarded for compaction.
    first_index: Index,
    _pd: PhantomData<E>,
}

impl<E: Entry> InMemoryLog<E> {
    pub fn create() -> Result<Self, io::Error> {
        Ok(InMemoryLog {
            log: vec![],
            first_index: Index::start_index(),
            _pd: PhantomData::default(),
        })
    }

    fn vec_index(&self, index: Index) -> Option<usize> {
        if index < self.first_index {
            None
        } else {
            Some((index.as_u64() - self.first_index.as_u64()) as usize)
        }
    }
}

impl<E: Entry> Log<E> for InMemoryLog<E> {
    fn append(&mut self, entry: E) -> Result<Index, io::Error> {
        let index = self.next_index();
        self.log.push(entry.into());

        Ok(index)
    }

    fn read(&self, index: Index) -> Result<Option<E>, io::Error> {
        let bytes = match self.vec_index(index).and_then(|i| self.log.get(i)) {
            Some(bytes) => bytes.clone(),
            None => return Ok(None),
        };

        E::try_from(bytes).map(Some)
    }

    fn truncate(&mut self, index: Index) -> Result<(), io::Error> {
        match self.vec_index(index) {
            Some(vec_index) => self.log.truncate(vec_index),
            // Truncating below the compaction point would drop everything we still hold.
            None => self.log.clear(),
        }

        Ok(())
    }

    fn discard_through(&mut self, index: Index) -> Result<(), io::Error> {
        let new_first_index = index.plus(1);
        if new_first_index <= self.first_index {
            return Ok(());
        }

        if new_first_index >= self.next_index() {
            self.log.clear();
        } else {
            let num_to_drop = (new_first_index.as_u64() - self.first_index.as_u64()) as usize;
            self.log.drain(..num_to_drop);
        }
        self.first_index = new_first_index;

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
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct TestEntry(u8);

    impl Entry for TestEntry {}

    impl TryFrom<Vec<u8>> for TestEntry {
        type Error = io::Error;

        fn try_from(bytes: Vec<u8>) -> Result<Self, Self::Error> {
            match bytes.as_slice() {
                [b] => Ok(TestEntry(*b)),
                _ => Err(io::Error::new(io::ErrorKind::InvalidData, "expected 1 byte")),
            }
        }
    }

    impl From<TestEntry> for Vec<u8> {
        fn from(entry: TestEntry) -> Self {
            vec![entry.0]
        }
    }

    fn log_with(n: u8) -> InMemoryLog<TestEntry> {
        let mut log = InMemoryLog::create().unwrap();
        for i in 1..=n {
            let index = log.append(TestEntry(i)).unwrap();
            assert_eq!(index, Index::new(i as u64));
        }
        log
    }

    #[test]
    fn append_read_truncate() {
        let mut log = log_with(5);
        assert_eq!(log.first_index(), Index::new(1));
        assert_eq!(log.next_index(), Index::new(6));
        assert_eq!(log.read(Index::new(3)).unwrap(), Some(TestEntry(3)));
        assert_eq!(log.read(Index::new(6)).unwrap(), None);

        log.truncate(Index::new(4)).unwrap();
        assert_eq!(log.next_index(), Index::new(4));
        assert_eq!(log.read(Index::new(4)).unwrap(), None);
        assert_eq!(log.append(TestEntry(40)).unwrap(), Index::new(4));
        assert_eq!(log.read(Index::new(4)).unwrap(), Some(TestEntry(40)));
    }

    #[test]
    fn discard_prefix_keeps_suffix() {
        let mut log = log_with(5);
        log.discard_through(Index::new(3)).unwrap();

        assert_eq!(log.first_index(), Index::new(4));
        assert_eq!(log.next_index(), Index::new(6));
        assert_eq!(log.read(Index::new(3)).unwrap(), None);
        assert_eq!(log.read(Index::new(4)).unwrap(), Some(TestEntry(4)));

        // Going backwards is a no-op.
        log.discard_through(Index::new(2)).unwrap();
        assert_eq!(log.first_index(), Index::new(4));
    }

    #[test]
    fn discard_past_end_resets_log() {
        let mut log = log_with(2);
        log.discard_through(Index::new(10)).unwrap();

        assert_eq!(log.first_index(), Index::new(11));
        assert_eq!(log.next_index(), Index::new(11));
        assert_eq!(log.append(TestEntry(11)).unwrap(), Index::new(11));
    }

    #[test]
    fn corrupt_entry_is_an_error() {
        let mut log = log_with(1);
        log.log[0] = vec![1, 2, 3];

        let err = log.read(Index::new(1)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
