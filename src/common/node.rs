//! Struct and implementation of a peer entry in the routing table
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::common::{Id, ID_SIZE};
use crate::{Error, Result};

/// Size of a compact IPv4 address: 4 bytes of ip and 2 bytes of port.
pub const COMPACT_ADDRESS_SIZE: usize = 6;
/// Size of a compact IPv4 node: id followed by its compact address.
pub const COMPACT_NODE_SIZE: usize = ID_SIZE + COMPACT_ADDRESS_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Peer entry in the routing table
pub struct NodeInfo {
    pub id: Id,
    pub address: SocketAddr,
}

impl NodeInfo {
    /// Creates a new NodeInfo from an id and socket address.
    pub fn new(id: Id, address: SocketAddr) -> NodeInfo {
        NodeInfo { id, address }
    }

    /// Creates a node with a random Id and a random IPv4 address.
    pub fn random() -> NodeInfo {
        let octets: [u8; 4] = rand::random();
        let port: u16 = rand::random();

        NodeInfo {
            id: Id::random(),
            address: SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port),
        }
    }

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }
}

/// Encode an IPv4 socket address as 6 bytes. Returns `None` for IPv6.
pub fn address_to_bytes(address: &SocketAddr) -> Option<[u8; COMPACT_ADDRESS_SIZE]> {
    match address {
        SocketAddr::V4(v4) => {
            let mut bytes = [0; COMPACT_ADDRESS_SIZE];
            bytes[..4].copy_from_slice(&v4.ip().octets());
            bytes[4..].copy_from_slice(&v4.port().to_be_bytes());

            Some(bytes)
        }
        SocketAddr::V6(_) => None,
    }
}

pub fn bytes_to_address<T: AsRef<[u8]>>(bytes: T) -> Result<SocketAddr> {
    let bytes = bytes.as_ref();
    if bytes.len() != COMPACT_ADDRESS_SIZE {
        return Err(Error::MalformedPayload("Wrong number of bytes for address"));
    }

    let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
    let port = u16::from_be_bytes([bytes[4], bytes[5]]);

    Ok(SocketAddr::new(IpAddr::V4(ip), port))
}

/// Encode nodes in the compact `id || ip || port` format.
///
/// IPv6 nodes have no compact form and are skipped.
pub fn nodes_to_bytes(nodes: &[NodeInfo]) -> Vec<u8> {
    let mut vec = Vec::with_capacity(COMPACT_NODE_SIZE * nodes.len());

    for node in nodes {
        if let Some(address) = address_to_bytes(&node.address) {
            vec.extend_from_slice(node.id.as_bytes());
            vec.extend_from_slice(&address);
        }
    }

    vec
}

pub fn bytes_to_nodes<T: AsRef<[u8]>>(bytes: T) -> Result<Vec<NodeInfo>> {
    let bytes = bytes.as_ref();
    if bytes.len() % COMPACT_NODE_SIZE != 0 {
        return Err(Error::MalformedPayload("Wrong number of bytes for nodes"));
    }

    bytes
        .chunks_exact(COMPACT_NODE_SIZE)
        .map(|chunk| {
            let id = Id::from_bytes(&chunk[..ID_SIZE])?;
            let address = bytes_to_address(&chunk[ID_SIZE..])?;

            Ok(NodeInfo::new(id, address))
        })
        .collect()
}
