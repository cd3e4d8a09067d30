use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::convert::TryFrom;
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// Longest replica id a peer descriptor can carry: its length goes on the wire as a u16.
pub const MAX_REPLICA_ID_LEN: usize = u16::MAX as usize;

/// ReplicaId uniquely names a node within a cluster.
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ReplicaId(String);

impl ReplicaId {
    pub fn new(id: impl Into<String>) -> Self {
        ReplicaId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }

    /// Ids past `MAX_REPLICA_ID_LEN` bytes can't be put in a descriptor, so they must never get
    /// into the log.
    pub fn fits_descriptor(&self) -> bool {
        self.0.len() <= MAX_REPLICA_ID_LEN
    }
}

impl fmt::Debug for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// We allow the application layer to attach an arbitrary blob to each member, which is handed
/// back whenever we redirect a caller to that member.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct ReplicaInfoBlob(u128);

impl ReplicaInfoBlob {
    pub fn new(blob: u128) -> Self {
        ReplicaInfoBlob(blob)
    }

    pub fn into_inner(self) -> u128 {
        self.0
    }
}

/// ReplicaMetadata is the peer descriptor: everything needed to reach and identify a member. It
/// is what `AddNode` entries carry.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ReplicaMetadata {
    replica_id: ReplicaId,
    ip_addr: Ipv4Addr,
    port: u16,
    info_blob: ReplicaInfoBlob,
}

impl ReplicaMetadata {
    pub fn new(replica_id: ReplicaId, ip_addr: Ipv4Addr, port: u16, info_blob: ReplicaInfoBlob) -> Self {
        ReplicaMetadata {
            replica_id,
            ip_addr,
            port,
            info_blob,
        }
    }

    pub fn replica_id(&self) -> &ReplicaId {
        &self.replica_id
    }

    pub fn ip_addr(&self) -> Ipv4Addr {
        self.ip_addr
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn info_blob(&self) -> ReplicaInfoBlob {
        self.info_blob
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip_addr, self.port))
    }

    /// Wire format:
    ///
    /// ```text
    /// | id len (u16) | id (utf8) | ipv4 (4 bytes) | port (u16) | blob (u128) |
    /// ```
    ///
    /// All integers big-endian. The id must fit (see `ReplicaId::fits_descriptor`); membership
    /// changes are validated before they're encoded.
    pub fn encode(&self) -> Bytes {
        let id = self.replica_id.as_str().as_bytes();
        debug_assert!(id.len() <= MAX_REPLICA_ID_LEN, "replica id too long for a descriptor");
        let mut buf = BytesMut::with_capacity(2 + id.len() + 4 + 2 + 16);
        buf.put_u16(id.len() as u16);
        buf.put_slice(id);
        buf.put_slice(&self.ip_addr.octets());
        buf.put_u16(self.port);
        buf.put_u128(self.info_blob.into_inner());

        buf.freeze()
    }

    pub fn decode(mut bytes: Bytes) -> Result<Self, io::Error> {
        let invalid = |msg: &str| io::Error::new(io::ErrorKind::InvalidData, format!("peer descriptor: {}", msg));

        if bytes.remaining() < 2 {
            return Err(invalid("truncated id length"));
        }
        let id_len = bytes.get_u16() as usize;
        if bytes.remaining() != id_len + 4 + 2 + 16 {
            return Err(invalid("unexpected length"));
        }
        let id = String::from_utf8(bytes.split_to(id_len).to_vec()).map_err(|_| invalid("id not utf8"))?;
        let mut octets = [0u8; 4];
        bytes.copy_to_slice(&mut octets);
        let port = bytes.get_u16();
        let blob = bytes.get_u128();

        Ok(ReplicaMetadata::new(
            ReplicaId::new(id),
            Ipv4Addr::from(octets),
            port,
            ReplicaInfoBlob::new(blob),
        ))
    }
}

/// A member list, as kept in snapshot and configuration files:
/// `| count (u32) | (descriptor len (u32) | descriptor)* |`
pub(crate) fn encode_members(buf: &mut BytesMut, members: &[ReplicaMetadata]) {
    buf.put_u32(members.len() as u32);
    for member in members {
        let descriptor = member.encode();
        buf.put_u32(descriptor.len() as u32);
        buf.put_slice(&descriptor);
    }
}

pub(crate) fn decode_members(bytes: &mut Bytes) -> Result<Vec<ReplicaMetadata>, io::Error> {
    let truncated = || io::Error::new(io::ErrorKind::InvalidData, "member list: truncated");

    if bytes.remaining() < 4 {
        return Err(truncated());
    }
    let count = bytes.get_u32() as usize;
    let mut members = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        if bytes.remaining() < 4 {
            return Err(truncated());
        }
        let len = bytes.get_u32() as usize;
        if bytes.remaining() < len {
            return Err(truncated());
        }
        members.push(ReplicaMetadata::decode(bytes.split_to(len))?);
    }

    Ok(members)
}

impl TryFrom<Bytes> for ReplicaMetadata {
    type Error = io::Error;

    fn try_from(bytes: Bytes) -> Result<Self, Self::Error> {
        Self::decode(bytes)
    }
}
