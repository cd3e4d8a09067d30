use crate::commitlog;
use crate::replica::Term;
use bytes::Bytes;
use std::convert::TryFrom;
use std::io;

/// What a log entry means to the replica, as opposed to what it means to the application.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EntryKind {
    /// Appended by a newly elected leader so that entries from earlier terms get committed.
    NoOp,
    /// Opaque application command, handed to the state machine.
    General,
    /// Adds the member described by the entry's data (an encoded `ReplicaMetadata`).
    AddNode,
    /// Removes the member whose `ReplicaId` is the entry's data.
    RemoveNode,
}

// Code 2 was a joint-configuration entry. It is no longer written, and reading it is an error.
const KIND_NO_OP: u8 = 0;
const KIND_GENERAL: u8 = 1;
const KIND_ADD_NODE: u8 = 3;
const KIND_REMOVE_NODE: u8 = 4;

impl EntryKind {
    pub fn code(&self) -> u8 {
        match self {
            EntryKind::NoOp => KIND_NO_OP,
            EntryKind::General => KIND_GENERAL,
            EntryKind::AddNode => KIND_ADD_NODE,
            EntryKind::RemoveNode => KIND_REMOVE_NODE,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, io::Error> {
        match code {
            KIND_NO_OP => Ok(EntryKind::NoOp),
            KIND_GENERAL => Ok(EntryKind::General),
            KIND_ADD_NODE => Ok(EntryKind::AddNode),
            KIND_REMOVE_NODE => Ok(EntryKind::RemoveNode),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown log entry kind {}", other),
            )),
        }
    }

    pub fn is_membership_change(&self) -> bool {
        matches!(self, EntryKind::AddNode | EntryKind::RemoveNode)
    }
}

/// Byte representation:
///
/// ```text
/// |                                             1                       |
/// | 0 | 1 | 2 | 3 | 4 | 5 | 6 | 7 | 8 | 9 | 0 | 1 | 2 | 3 | 4 | 5 | ... |
/// +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+-...-+
/// |Vrs|Knd|       Term (8 bytes LE)           |   Data (variable)   ... |
/// +---+---+-----------------------------------+---------------------...-+
/// ```
///
/// * `Vrs` - version of the serialized payload
/// * `Knd` - entry kind code
/// * `Term` - raft leadership term when this entry was created
/// * `Data` - app specific data payload, or a membership change payload
///
/// Not needed:
///
/// * Checksum is not needed, it's guaranteed by underlying commitlog.
/// * Size/length of `Data` is not needed; the underlying commitlog will give us the correctly allocated array.
#[derive(Clone, Debug, PartialEq)]
pub struct WriteAheadLogEntry {
    pub term: Term,
    pub kind: EntryKind,
    pub data: Bytes,
}

const RAFT_LOG_ENTRY_FORMAT_VERSION: u8 = 2;
const HEADER_LEN: usize = 1 + 1 + 8;

impl WriteAheadLogEntry {
    pub fn general(term: Term, data: Bytes) -> Self {
        WriteAheadLogEntry {
            term,
            kind: EntryKind::General,
            data,
        }
    }

    pub fn no_op(term: Term) -> Self {
        WriteAheadLogEntry {
            term,
            kind: EntryKind::NoOp,
            data: Bytes::new(),
        }
    }
}

impl commitlog::Entry for WriteAheadLogEntry {}

impl TryFrom<Vec<u8>> for WriteAheadLogEntry {
    type Error = io::Error;

    fn try_from(bytes: Vec<u8>) -> Result<Self, Self::Error> {
        if bytes.len() < HEADER_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("log entry too short: {} bytes", bytes.len()),
            ));
        }
        if bytes[0] != RAFT_LOG_ENTRY_FORMAT_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown log entry version {}", bytes[0]),
            ));
        }

        let kind = EntryKind::from_code(bytes[1])?;
        let mut term_bytes = [0u8; 8];
        term_bytes.copy_from_slice(&bytes[2..HEADER_LEN]);
        let term = Term::new(u64::from_le_bytes(term_bytes));

        let mut bytes = bytes;
        let data = Bytes::from(bytes.split_off(HEADER_LEN));

        Ok(WriteAheadLogEntry { term, kind, data })
    }
}

impl From<WriteAheadLogEntry> for Vec<u8> {
    fn from(entry: WriteAheadLogEntry) -> Self {
        let mut bytes: Vec<u8> = Vec::with_capacity(HEADER_LEN + entry.data.len());

        bytes.push(RAFT_LOG_ENTRY_FORMAT_VERSION);
        bytes.push(entry.kind.code());
        bytes.extend_from_slice(&entry.term.as_u64().to_le_bytes());
        bytes.extend_from_slice(&entry.data);

        bytes
    }
}
