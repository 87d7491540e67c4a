use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use bytes::{BufMut, BytesMut};
use rand::Rng as _;

/// A 160-bit DHT node identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; 20]);

impl NodeId {
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        rand::rng().fill(&mut id);
        Self(id)
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 20] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// XOR distance to `other`, comparable bytewise.
    pub fn distance(&self, other: &NodeId) -> [u8; 20] {
        let mut out = [0u8; 20];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", crate::meta::hex_encode(&self.0[..4]))
    }
}

/// Compact node info: id plus endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeInfo {
    pub id: NodeId,
    pub addr: SocketAddr,
}

/// Parses the 26-byte-per-node compact format (v4 only, per BEP-5
/// `nodes`).
pub fn parse_compact_nodes(data: &[u8]) -> Vec<NodeInfo> {
    data.chunks_exact(26)
        .filter_map(|chunk| {
            let id = NodeId::from_bytes(&chunk[..20])?;
            let ip = Ipv4Addr::new(chunk[20], chunk[21], chunk[22], chunk[23]);
            let port = u16::from_be_bytes([chunk[24], chunk[25]]);
            Some(NodeInfo {
                id,
                addr: SocketAddr::new(IpAddr::V4(ip), port),
            })
        })
        .collect()
}

/// Encodes v4 nodes into the 26-byte compact format; v6 entries are
/// skipped.
pub fn encode_compact_nodes(nodes: &[NodeInfo]) -> BytesMut {
    let mut out = BytesMut::with_capacity(nodes.len() * 26);
    for node in nodes {
        if let SocketAddr::V4(v4) = node.addr {
            out.put_slice(&node.id.0);
            out.put_slice(&v4.ip().octets());
            out.put_u16(v4.port());
        }
    }
    out
}

/// Parses a 6-byte compact peer entry (the `values` list payload).
pub fn parse_compact_peer(data: &[u8]) -> Option<SocketAddr> {
    if data.len() != 6 {
        return None;
    }
    let ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
    let port = u16::from_be_bytes([data[4], data[5]]);
    Some(SocketAddr::new(IpAddr::V4(ip), port))
}

/// Encodes a v4 peer to the 6-byte compact form.
pub fn encode_compact_peer(addr: SocketAddr) -> Option<[u8; 6]> {
    match addr {
        SocketAddr::V4(v4) => {
            let mut out = [0u8; 6];
            out[..4].copy_from_slice(&v4.ip().octets());
            out[4..].copy_from_slice(&v4.port().to_be_bytes());
            Some(out)
        }
        SocketAddr::V6(_) => None,
    }
}
