use crate::commitlog::{Entry, Index, Log};
use bytes::{Buf, BufMut, BytesMut};
use std::convert::TryFrom;
use std::fs;
use std::fs::{File, OpenOptions};
use std::io;
use std::io::{Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

const MAGIC: &[u8; 4] = b"RLOG";
const VERSION: u8 = 1;
// | magic (4) | version (1) | first index (u64) |
const HEADER_LEN: u64 = 4 + 1 + 8;
// | entry len (u32) |
const RECORD_HEADER_LEN: u64 = 4;

/// FileLog is a single-file durable log.
///
/// ```text
/// | "RLOG" | version u8 | first_index u64 | record* |
/// record = | len u32 | encoded entry |
/// ```
///
/// All integers big-endian. Appends and truncations are fsync'd before they return. Discarding a
/// prefix rewrites the retained suffix into a temp file which is renamed over the log, so a crash
/// leaves either the old or the new log. A record cut short by a crash mid-append was never
/// acknowledged, and is dropped when the log is reopened.
pub struct FileLog<E: Entry> {
    path: PathBuf,
    file: File,
    first_index: Index,
    // File offset of each retained record. `offsets[0]` holds `first_index`.
    offsets: Vec<u64>,
    end: u64,
    _pd: PhantomData<E>,
}

impl<E: Entry> FileLog<E> {
    /// Opens the log at `path`, creating an empty one if nothing is there.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, io::Error> {
        let path = path.as_ref().to_path_buf();

        match fs::read(&path) {
            Ok(bytes) => Self::recover(path, &bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                write_log_file(&path, Index::start_index(), &[])?;
                let file = open_rw(&path)?;
                Ok(FileLog {
                    path,
                    file,
                    first_index: Index::start_index(),
                    offsets: vec![],
                    end: HEADER_LEN,
                    _pd: PhantomData::default(),
                })
            }
            Err(e) => Err(e),
        }
    }

    fn recover(path: PathBuf, bytes: &[u8]) -> Result<Self, io::Error> {
        let mut buf = bytes;
        if (buf.len() as u64) < HEADER_LEN || &buf[..4] != MAGIC {
            return Err(invalid("missing log header"));
        }
        buf.advance(4);
        if buf.get_u8() != VERSION {
            return Err(invalid("unknown log version"));
        }
        let first_index = match buf.get_u64() {
            0 => return Err(invalid("first index is zero")),
            i => Index::new(i),
        };

        let mut offsets = vec![];
        let mut offset = HEADER_LEN;
        loop {
            if (buf.remaining() as u64) < RECORD_HEADER_LEN {
                break;
            }
            let len = (&buf[..4]).get_u32() as u64;
            if (buf.remaining() as u64) < RECORD_HEADER_LEN + len {
                break;
            }
            offsets.push(offset);
            buf.advance((RECORD_HEADER_LEN + len) as usize);
            offset += RECORD_HEADER_LEN + len;
        }

        let file = open_rw(&path)?;
        if buf.has_remaining() {
            // Torn tail from a crash mid-append.
            file.set_len(offset)?;
            file.sync_all()?;
        }

        Ok(FileLog {
            path,
            file,
            first_index,
            offsets,
            end: offset,
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

    fn read_record(&self, offset: u64) -> Result<Vec<u8>, io::Error> {
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))?;

        let mut len = [0u8; RECORD_HEADER_LEN as usize];
        file.read_exact(&mut len)?;
        let mut bytes = vec![0u8; u32::from_be_bytes(len) as usize];
        file.read_exact(&mut bytes)?;

        Ok(bytes)
    }

    fn truncate_file(&mut self, len: u64) -> Result<(), io::Error> {
        self.file.set_len(len)?;
        self.file.sync_all()?;
        self.end = len;
        Ok(())
    }
}

impl<E: Entry> Log<E> for FileLog<E> {
    fn append(&mut self, entry: E) -> Result<Index, io::Error> {
        let bytes: Vec<u8> = entry.into();
        if bytes.len() > u32::MAX as usize {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "log entry too large"));
        }
        let mut record = BytesMut::with_capacity(RECORD_HEADER_LEN as usize + bytes.len());
        record.put_u32(bytes.len() as u32);
        record.put_slice(&bytes);

        self.file.seek(SeekFrom::Start(self.end))?;
        if let Err(e) = self.file.write_all(&record).and_then(|_| self.file.sync_all()) {
            // Don't leave a half written record for the next append to land after.
            self.file.set_len(self.end)?;
            return Err(e);
        }

        let index = self.next_index();
        self.offsets.push(self.end);
        self.end += record.len() as u64;

        Ok(index)
    }

    fn read(&self, index: Index) -> Result<Option<E>, io::Error> {
        let offset = match self.vec_index(index).and_then(|i| self.offsets.get(i)) {
            Some(offset) => *offset,
            None => return Ok(None),
        };

        E::try_from(self.read_record(offset)?).map(Some)
    }

    fn truncate(&mut self, index: Index) -> Result<(), io::Error> {
        let keep = match self.vec_index(index) {
            Some(vec_index) if vec_index >= self.offsets.len() => return Ok(()),
            Some(vec_index) => vec_index,
            None => 0,
        };

        let new_end = self.offsets.get(keep).copied().unwrap_or(self.end);
        self.truncate_file(new_end)?;
        self.offsets.truncate(keep);

        Ok(())
    }

    fn discard_through(&mut self, index: Index) -> Result<(), io::Error> {
        let new_first_index = index.plus(1);
        if new_first_index <= self.first_index {
            return Ok(());
        }

        let num_to_drop = (new_first_index.as_u64() - self.first_index.as_u64()) as usize;
        let retained_from = self.offsets.get(num_to_drop).copied().unwrap_or(self.end);
        let mut retained = vec![0u8; (self.end - retained_from) as usize];
        {
            let mut file = &self.file;
            file.seek(SeekFrom::Start(retained_from))?;
            file.read_exact(&mut retained)?;
        }

        write_log_file(&self.path, new_first_index, &retained)?;
        self.file = open_rw(&self.path)?;

        let shift = retained_from - HEADER_LEN;
        self.offsets = self
            .offsets
            .iter()
            .skip(num_to_drop)
            .map(|offset| offset - shift)
            .collect();
        self.end -= shift;
        self.first_index = new_first_index;

        Ok(())
    }

    fn first_index(&self) -> Index {
        self.first_index
    }

    fn next_index(&self) -> Index {
        self.first_index.plus(self.offsets.len() as u64)
    }
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("log file: {}", msg))
}

fn open_rw(path: &Path) -> Result<File, io::Error> {
    OpenOptions::new().read(true).write(true).open(path)
}

/// Write a whole log file next to `path` and rename it into place.
fn write_log_file(path: &Path, first_index: Index, records: &[u8]) -> Result<(), io::Error> {
    let mut contents = BytesMut::with_capacity(HEADER_LEN as usize + records.len());
    contents.put_slice(MAGIC);
    contents.put_u8(VERSION);
    contents.put_u64(first_index.as_u64());
    contents.put_slice(records);

    let mut tmp_path = path.as_os_str().to_owned();
    tmp_path.push(".tmp");
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(&contents)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)
}
