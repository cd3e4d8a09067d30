use crate::commitlog::Index;
use crate::replica;
use crate::replica::{ReplicaInfoBlob, Role, Term};
use std::net::Ipv4Addr;

/// Identifies an entry this node appended: the term it was appended in and its log position.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RaftEntryId {
    pub(crate) term: Term,
    pub(crate) entry_index: Index,
}

impl RaftEntryId {
    pub fn term(&self) -> u64 {
        self.term.as_u64()
    }

    pub fn index(&self) -> u64 {
        self.entry_index.as_u64()
    }
}

/// RaftMemberInfo describes a cluster member: how to reach it, and the blob handed back to
/// callers that get redirected to it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RaftMemberInfo {
    pub replica_id: String,
    pub ip_addr: Ipv4Addr,
    pub raft_internal_rpc_port: u16,
    pub peer_redirect_info_blob: RaftMemberInfoBlob,
}

impl From<RaftMemberInfo> for replica::ReplicaMetadata {
    fn from(member_info: RaftMemberInfo) -> Self {
        Self::new(
            replica::ReplicaId::new(member_info.replica_id),
            member_info.ip_addr,
            member_info.raft_internal_rpc_port,
            replica::ReplicaInfoBlob::from(member_info.peer_redirect_info_blob),
        )
    }
}

impl From<&replica::ReplicaMetadata> for RaftMemberInfo {
    fn from(metadata: &replica::ReplicaMetadata) -> Self {
        RaftMemberInfo {
            replica_id: metadata.replica_id().as_str().to_string(),
            ip_addr: metadata.ip_addr(),
            raft_internal_rpc_port: metadata.port(),
            peer_redirect_info_blob: RaftMemberInfoBlob::from(metadata.info_blob()),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RaftLeaderInfo {
    pub replica_id: String,
    pub ip: Ipv4Addr,
    pub port: u16,
    pub info_blob: RaftMemberInfoBlob,
}

impl From<replica::LeaderRedirectInfo> for RaftLeaderInfo {
    fn from(internal_leader: replica::LeaderRedirectInfo) -> Self {
        Self {
            replica_id: internal_leader.replica_id.into_inner(),
            ip: internal_leader.ip_addr,
            port: internal_leader.port,
            info_blob: RaftMemberInfoBlob::from(internal_leader.replica_blob),
        }
    }
}

/// We allow application layer to provide an arbitrary blob of info about each member
/// that will be returned back to the application layer if we leader-redirect the
/// application to that member.
#[derive(Copy, Clone, Debug, Default, Eq, PartialOrd, PartialEq)]
pub struct RaftMemberInfoBlob(u128);

impl RaftMemberInfoBlob {
    pub fn new(blob: u128) -> Self {
        RaftMemberInfoBlob(blob)
    }
}

impl From<RaftMemberInfoBlob> for replica::ReplicaInfoBlob {
    fn from(external_info_blob: RaftMemberInfoBlob) -> Self {
        Self::new(external_info_blob.0)
    }
}

impl From<replica::ReplicaInfoBlob> for RaftMemberInfoBlob {
    fn from(internal_info_blob: ReplicaInfoBlob) -> Self {
        Self::new(internal_info_blob.into_inner())
    }
}

/// NodeStatus is a point in time view of a node, for operators and tests. Indexes are `None`
/// until something has been written, committed or applied.
#[derive(Clone, Debug)]
pub struct NodeStatus {
    pub role: Role,
    pub term: u64,
    pub leader: Option<RaftLeaderInfo>,
    pub commit_index: Option<u64>,
    pub last_applied_index: Option<u64>,
    pub last_log_index: Option<u64>,
    pub members: Vec<RaftMemberInfo>,
}

impl From<replica::ReplicaStatus> for NodeStatus {
    fn from(status: replica::ReplicaStatus) -> Self {
        NodeStatus {
            role: status.role.role,
            term: status.role.term.as_u64(),
            leader: status.role.leader.map(RaftLeaderInfo::from),
            commit_index: status.commit_index.map(|i| i.as_u64()),
            last_applied_index: status.last_applied_index.map(|i| i.as_u64()),
            last_log_index: status.last_log_index.map(|i| i.as_u64()),
            members: status.members.iter().map(RaftMemberInfo::from).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_info_conversions() {
        let member = RaftMemberInfo {
            replica_id: "node-2".to_string(),
            ip_addr: Ipv4Addr::new(10, 1, 2, 3),
            raft_internal_rpc_port: 7002,
            peer_redirect_info_blob: RaftMemberInfoBlob::new(42),
        };

        let metadata = replica::ReplicaMetadata::from(member.clone());
        assert_eq!(metadata.replica_id().as_str(), "node-2");
        assert_eq!(metadata.info_blob(), ReplicaInfoBlob::new(42));
        assert_eq!(RaftMemberInfo::from(&metadata), member);

        let leader = RaftLeaderInfo::from(replica::LeaderRedirectInfo::from(&metadata));
        assert_eq!(leader.port, 7002);
        assert_eq!(leader.info_blob, RaftMemberInfoBlob::new(42));
    }
}
