//! Mainline DHT node (Kademlia over bencoded UDP).
//!
//! Decentralized peer discovery: node ids and info hashes share a
//! 160-bit space, distance is XOR, and the `get_peers` lookup walks the
//! id space toward an info hash, collecting peers from the nodes that
//! hold them. The wire protocol (KRPC) is bencoded, so this module is a
//! consumer of the `bencode` codec; its opaque byte fields (`id`,
//! `token`, compact `nodes`/`values`) never pass through text types.
use rand::Rng;
use std::fmt;
use thiserror::Error;

pub mod krpc;
pub mod node;
pub mod routing;

pub use node::{spawn, DhtHandle};
pub use routing::RoutingTable;

/// Well-known bootstrap entry points, queried at startup until the
/// routing table has its own population.
pub const BOOTSTRAP_NODES: &[&str] = &[
    "router.bittorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "router.utorrent.com:6881",
];

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("Malformed KRPC message: {0}")]
    Malformed(String),

    #[error("DHT query timed out")]
    Timeout,

    #[error("DHT task is no longer running")]
    TaskStopped,
}

pub type DhtResult<T> = std::result::Result<T, DhtError>;

/// A 160-bit node identifier. Info hashes live in the same space, which
/// is what makes "nodes close to a torrent" meaningful.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; 20]);

/// XOR distance between two ids, ordered as a 160-bit big-endian
/// unsigned integer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Distance([u8; 20]);

impl NodeId {
    /// A random id, generated once per process and stable for its
    /// lifetime.
    pub fn random() -> Self {
        let mut bytes = [0u8; 20];
        rand::rng().fill(&mut bytes[..]);
        NodeId(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let array: [u8; 20] = bytes.try_into().ok()?;
        Some(NodeId(array))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut xor = [0u8; 20];
        for (i, byte) in xor.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(xor)
    }

    /// Routing-table bucket for `other`: the position of the first
    /// differing bit, counted MSB-first. None when the ids are equal.
    pub fn bucket_index(&self, other: &NodeId) -> Option<usize> {
        let Distance(xor) = self.distance(other);
        for (byte_index, byte) in xor.iter().enumerate() {
            if *byte != 0 {
                return Some(byte_index * 8 + byte.leading_zeros() as usize);
            }
        }
        None
    }
}

impl From<[u8; 20]> for NodeId {
    fn from(bytes: [u8; 20]) -> Self {
        NodeId(bytes)
    }
}

impl From<crate::torrent::InfoHash> for NodeId {
    fn from(hash: crate::torrent::InfoHash) -> Self {
        NodeId(*hash.as_bytes())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(self.0))
    }
}
