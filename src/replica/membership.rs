use crate::commitlog::Index;
use crate::replica::local_state;
use crate::replica::peers::{self, ReplicaId, ReplicaMetadata};
use crate::replica::replica_api::{ChangeMembershipError, MembershipChange};
use crate::replica::snapshot::Snapshot;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;

const CONFIG_FILE_VERSION: u8 = 1;

/// ClusterTracker owns the cluster configuration: who votes, and the one membership change that
/// may be in flight.
///
/// The voting set only ever changes when a membership entry is *applied* (or a snapshot carrying a
/// newer configuration is installed). Between being appended and being applied, a change is
/// "pending": it blocks other changes, and an added node already receives replication so it can
/// catch up, but it doesn't count towards any majority yet.
pub(crate) struct ClusterTracker {
    my_replica_id: ReplicaId,
    members: BTreeMap<ReplicaId, ReplicaMetadata>,
    // Log index of the configuration in `members`. None for the initial member list.
    applied_index: Option<Index>,
    pending: Option<PendingChange>,
    config_file: Option<ConfigFile>,
}

/// The applied configuration on disk. After a restart it can be ahead of the log's applied index,
/// because applied entries past the snapshot are only replayed once a leader re-confirms commit.
/// Those replays are skipped by index.
///
/// ```text
/// | version u8 | applied index u64 | members |
/// ```
pub(crate) struct ConfigFile {
    path: PathBuf,
}

impl ConfigFile {
    pub(crate) fn new(path: PathBuf) -> Self {
        ConfigFile { path }
    }

    fn load(&self) -> Result<Option<(Index, Vec<ReplicaMetadata>)>, io::Error> {
        let mut bytes = match fs::read(&self.path) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        if bytes.remaining() < 1 + 8 || bytes.get_u8() != CONFIG_FILE_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Unrecognized membership file {:?}", self.path),
            ));
        }
        let index = Index::new(bytes.get_u64());
        let members = peers::decode_members(&mut bytes)?;

        Ok(Some((index, members)))
    }

    fn store(&self, index: Index, members: &[ReplicaMetadata]) -> Result<(), io::Error> {
        let mut buf = BytesMut::new();
        buf.put_u8(CONFIG_FILE_VERSION);
        buf.put_u64(index.as_u64());
        peers::encode_members(&mut buf, members);

        local_state::replace_file(&self.path, &buf)
    }
}

#[derive(Clone, Debug, PartialEq)]
struct PendingChange {
    index: Index,
    change: MembershipChange,
}

impl ClusterTracker {
    pub(crate) fn new(my_replica_id: ReplicaId, members: Vec<ReplicaMetadata>) -> Self {
        ClusterTracker {
            my_replica_id,
            members: by_id(members),
            applied_index: None,
            pending: None,
            config_file: None,
        }
    }

    /// Start from the newest configuration available: the membership file, then the snapshot,
    /// then `initial_members`.
    pub(crate) fn open(
        my_replica_id: ReplicaId,
        initial_members: Vec<ReplicaMetadata>,
        snapshot: Option<&Snapshot>,
        config_file: Option<ConfigFile>,
    ) -> Result<Self, io::Error> {
        let stored = match &config_file {
            Some(file) => file.load()?,
            None => None,
        };
        let from_snapshot = snapshot.map(|s| (s.last_included_index, s.members.clone()));

        let (applied_index, members) = match (stored, from_snapshot) {
            (Some(stored), Some(snap)) if snap.0 > stored.0 => (Some(snap.0), snap.1),
            (Some((index, members)), _) | (None, Some((index, members))) => (Some(index), members),
            (None, None) => (None, initial_members),
        };

        Ok(ClusterTracker {
            my_replica_id,
            members: by_id(members),
            applied_index,
            pending: None,
            config_file,
        })
    }

    pub(crate) fn my_replica_id(&self) -> &ReplicaId {
        &self.my_replica_id
    }

    pub(crate) fn contains_member(&self, replica_id: &ReplicaId) -> bool {
        self.members.contains_key(replica_id)
    }

    pub(crate) fn am_i_member(&self) -> bool {
        self.contains_member(&self.my_replica_id)
    }

    pub(crate) fn metadata(&self, replica_id: &ReplicaId) -> Option<&ReplicaMetadata> {
        self.members.get(replica_id).or_else(|| match &self.pending {
            Some(PendingChange {
                change: MembershipChange::Add(md),
                ..
            }) if md.replica_id() == replica_id => Some(md),
            _ => None,
        })
    }

    pub(crate) fn members(&self) -> Vec<ReplicaMetadata> {
        self.members.values().cloned().collect()
    }

    pub(crate) fn num_voting_replicas(&self) -> usize {
        self.members.len()
    }

    pub(crate) fn majority(&self) -> usize {
        (self.num_voting_replicas() / 2) + 1
    }

    /// Voting members other than me.
    pub(crate) fn voting_peer_ids(&self) -> Vec<ReplicaId> {
        self.members
            .keys()
            .filter(|id| **id != self.my_replica_id)
            .cloned()
            .collect()
    }

    /// Everyone the leader should be replicating to: voting peers, plus a node whose addition is
    /// pending so it can catch up before it counts.
    pub(crate) fn replication_targets(&self) -> Vec<ReplicaMetadata> {
        let mut targets: Vec<ReplicaMetadata> = self
            .members
            .values()
            .filter(|md| *md.replica_id() != self.my_replica_id)
            .cloned()
            .collect();

        if let Some(PendingChange {
            change: MembershipChange::Add(md),
            ..
        }) = &self.pending
        {
            if *md.replica_id() != self.my_replica_id && !self.members.contains_key(md.replica_id()) {
                targets.push(md.clone());
            }
        }

        targets
    }

    pub(crate) fn has_pending_change(&self) -> bool {
        self.pending.is_some()
    }

    /// Leader path: check a requested change against the current configuration.
    pub(crate) fn validate_change(&self, change: &MembershipChange) -> Result<(), ChangeMembershipError> {
        if let MembershipChange::Add(md) = change {
            if !md.replica_id().fits_descriptor() {
                return Err(ChangeMembershipError::ReplicaIdTooLong(md.replica_id().as_str().len()));
            }
        }
        if self.pending.is_some() {
            return Err(ChangeMembershipError::ConcurrentMembershipChange);
        }

        match change {
            MembershipChange::Add(md) if self.members.contains_key(md.replica_id()) => {
                Err(ChangeMembershipError::AlreadyMember(md.replica_id().clone()))
            }
            MembershipChange::Remove(id) if !self.members.contains_key(id) => {
                Err(ChangeMembershipError::NotMember(id.clone()))
            }
            _ => Ok(()),
        }
    }

    /// A membership entry was appended at `index` (by us as leader, or replicated to us). The most
    /// recent one wins.
    pub(crate) fn set_pending(&mut self, index: Index, change: MembershipChange) {
        if self.already_applied(index) {
            return;
        }
        self.pending = Some(PendingChange { index, change });
    }

    /// The log was truncated at `index`. A pending entry at or after it no longer exists.
    pub(crate) fn abandon_pending_from(&mut self, index: Index) -> bool {
        match &self.pending {
            Some(p) if p.index >= index => {
                self.pending = None;
                true
            }
            _ => false,
        }
    }

    /// A membership entry at `index` was applied. This is the only point where the voting set
    /// changes from the log. Returns false if the configuration already includes it.
    pub(crate) fn apply(&mut self, index: Index, change: MembershipChange) -> Result<bool, io::Error> {
        if matches!(&self.pending, Some(p) if p.index <= index) {
            self.pending = None;
        }
        if self.already_applied(index) {
            return Ok(false);
        }

        let mut members = self.members.clone();
        match change {
            MembershipChange::Add(md) => {
                members.insert(md.replica_id().clone(), md);
            }
            MembershipChange::Remove(id) => {
                members.remove(&id);
            }
        }
        self.replace(index, members)?;

        Ok(true)
    }

    /// Replace the whole configuration with the one carried by a snapshot.
    pub(crate) fn restore(&mut self, last_included_index: Index, members: Vec<ReplicaMetadata>) -> Result<(), io::Error> {
        if matches!(&self.pending, Some(p) if p.index <= last_included_index) {
            self.pending = None;
        }
        if self.already_applied(last_included_index) {
            return Ok(());
        }

        self.replace(last_included_index, by_id(members))
    }

    fn already_applied(&self, index: Index) -> bool {
        matches!(self.applied_index, Some(applied) if index <= applied)
    }

    // Disk first, so memory never runs ahead of what a restart would load.
    fn replace(&mut self, index: Index, members: BTreeMap<ReplicaId, ReplicaMetadata>) -> Result<(), io::Error> {
        if let Some(file) = &self.config_file {
            let list: Vec<ReplicaMetadata> = members.values().cloned().collect();
            file.store(index, &list)?;
        }
        self.members = members;
        self.applied_index = Some(index);

        Ok(())
    }
}

fn by_id(members: Vec<ReplicaMetadata>) -> BTreeMap<ReplicaId, ReplicaMetadata> {
    members
        .into_iter()
        .map(|md| (md.replica_id().clone(), md))
        .collect()
}
