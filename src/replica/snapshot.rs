use crate::commitlog::Index;
use crate::replica::local_state;
use crate::replica::local_state::Term;
use crate::replica::peers;
use crate::replica::peers::ReplicaMetadata;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fs;
use std::io;
use std::path::PathBuf;
use tokio::time::{Duration, Instant};

const SNAPSHOT_FILE_VERSION: u8 = 1;

/// Snapshot is everything a replica needs to stand in for the log prefix through
/// `last_included_index`.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    pub last_included_index: Index,
    pub last_included_term: Term,
    // Configuration as of `last_included_index`. The membership entries it summarizes are gone
    // after compaction.
    pub members: Vec<ReplicaMetadata>,
    pub data: Bytes,
}

impl Snapshot {
    /// ```text
    /// | version u8 | last index u64 | last term u64 | members | data len u64 | data |
    /// ```
    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + 8 + 8 + 8 + self.data.len());
        buf.put_u8(SNAPSHOT_FILE_VERSION);
        buf.put_u64(self.last_included_index.as_u64());
        buf.put_u64(self.last_included_term.as_u64());
        peers::encode_members(&mut buf, &self.members);
        buf.put_u64(self.data.len() as u64);
        buf.put_slice(&self.data);

        buf.freeze()
    }

    fn decode(mut bytes: Bytes) -> Result<Self, io::Error> {
        let invalid = |msg: &str| io::Error::new(io::ErrorKind::InvalidData, format!("snapshot file: {}", msg));

        if bytes.remaining() < 1 + 8 + 8 {
            return Err(invalid("truncated header"));
        }
        if bytes.get_u8() != SNAPSHOT_FILE_VERSION {
            return Err(invalid("unknown version"));
        }
        let last_included_index = match bytes.get_u64() {
            0 => return Err(invalid("last included index is zero")),
            i => Index::new(i),
        };
        let last_included_term = Term::new(bytes.get_u64());
        let members = peers::decode_members(&mut bytes)?;
        if bytes.remaining() < 8 {
            return Err(invalid("truncated data length"));
        }
        let data_len = bytes.get_u64();
        if bytes.remaining() as u64 != data_len {
            return Err(invalid("data length mismatch"));
        }

        Ok(Snapshot {
            last_included_index,
            last_included_term,
            members,
            data: bytes,
        })
    }
}

#[derive(Clone, Debug)]
pub(crate) struct SnapshotPolicy {
    pub(crate) max_log_entries: u64,
    pub(crate) max_age: Option<Duration>,
}

/// SnapshotManager holds the most recent snapshot and decides when to take the next one. With a
/// path, the latest snapshot is also kept on disk and reloaded on restart.
pub(crate) struct SnapshotManager {
    policy: SnapshotPolicy,
    path: Option<PathBuf>,
    latest: Option<Snapshot>,
    last_taken_at: Instant,
}

impl SnapshotManager {
    pub(crate) fn new(policy: SnapshotPolicy) -> Self {
        SnapshotManager {
            policy,
            path: None,
            latest: None,
            last_taken_at: Instant::now(),
        }
    }

    /// Load the snapshot at `path`, if there is one, and persist every later one there.
    pub(crate) fn open(policy: SnapshotPolicy, path: PathBuf) -> Result<Self, io::Error> {
        let latest = match fs::read(&path) {
            Ok(bytes) => Some(Snapshot::decode(Bytes::from(bytes))?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e),
        };

        Ok(SnapshotManager {
            policy,
            path: Some(path),
            latest,
            last_taken_at: Instant::now(),
        })
    }

    pub(crate) fn latest(&self) -> Option<&Snapshot> {
        self.latest.as_ref()
    }

    pub(crate) fn should_snapshot(&self, applied_since_snapshot: u64, now: Instant) -> bool {
        if applied_since_snapshot == 0 {
            return false;
        }
        if applied_since_snapshot >= self.policy.max_log_entries {
            return true;
        }

        match self.policy.max_age {
            Some(max_age) => now.saturating_duration_since(self.last_taken_at) >= max_age,
            None => false,
        }
    }

    /// Keep `snapshot` as the latest. It's durable once this returns, so the log prefix it covers
    /// can go.
    pub(crate) fn store(&mut self, snapshot: Snapshot, now: Instant) -> Result<(), io::Error> {
        if let Some(existing) = &self.latest {
            // Snapshots only move forwards.
            if existing.last_included_index >= snapshot.last_included_index {
                return Ok(());
            }
        }

        if let Some(path) = &self.path {
            local_state::replace_file(path, &snapshot.encode())?;
        }
        self.latest = Some(snapshot);
        self.last_taken_at = now;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_at(index: u64) -> Snapshot {
        Snapshot {
            last_included_index: Index::new(index),
            last_included_term: Term::new(1),
            members: vec![],
            data: Bytes::from_static(b"state"),
        }
    }

    #[test]
    fn entry_count_threshold() {
        let manager = SnapshotManager::new(SnapshotPolicy {
            max_log_entries: 10,
            max_age: None,
        });
        let now = Instant::now();

        assert!(!manager.should_snapshot(0, now));
        assert!(!manager.should_snapshot(9, now));
        assert!(manager.should_snapshot(10, now));
        assert!(!manager.should_snapshot(9, now + Duration::from_secs(3600)));
    }

    #[test]
    fn age_threshold_needs_at_least_one_entry() {
        let mut manager = SnapshotManager::new(SnapshotPolicy {
            max_log_entries: 1000,
            max_age: Some(Duration::from_secs(60)),
        });
        let start = Instant::now();
        manager.store(snapshot_at(1), start).unwrap();

        assert!(!manager.should_snapshot(1, start + Duration::from_secs(59)));
        assert!(manager.should_snapshot(1, start + Duration::from_secs(60)));
        assert!(!manager.should_snapshot(0, start + Duration::from_secs(600)));
    }

    #[test]
    fn older_snapshot_never_replaces_newer() {
        let mut manager = SnapshotManager::new(SnapshotPolicy {
            max_log_entries: 1,
            max_age: None,
        });
        let now = Instant::now();

        manager.store(snapshot_at(5), now).unwrap();
        manager.store(snapshot_at(3), now).unwrap();
        assert_eq!(manager.latest().map(|s| s.last_included_index), Some(Index::new(5)));

        manager.store(snapshot_at(8), now).unwrap();
        assert_eq!(manager.latest().map(|s| s.last_included_index), Some(Index::new(8)));
    }

    #[test]
    fn latest_snapshot_is_reloaded_with_its_members() {
        use crate::replica::{ReplicaId, ReplicaInfoBlob};
        use std::net::Ipv4Addr;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot");
        let policy = SnapshotPolicy {
            max_log_entries: 1,
            max_age: None,
        };
        let snapshot = Snapshot {
            last_included_index: Index::new(12),
            last_included_term: Term::new(3),
            members: vec![ReplicaMetadata::new(
                ReplicaId::new("a"),
                Ipv4Addr::LOCALHOST,
                7000,
                ReplicaInfoBlob::new(9),
            )],
            data: Bytes::from_static(b"state@12"),
        };

        let mut manager = SnapshotManager::open(policy.clone(), path.clone()).unwrap();
        assert!(manager.latest().is_none());
        manager.store(snapshot.clone(), Instant::now()).unwrap();
        drop(manager);

        let reopened = SnapshotManager::open(policy, path.clone()).unwrap();
        assert_eq!(reopened.latest(), Some(&snapshot));

        fs::write(&path, b"\x01garbage").unwrap();
        let err = SnapshotManager::open(
            SnapshotPolicy {
                max_log_entries: 1,
                max_age: None,
            },
            path,
        )
        .err()
        .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
