//! Kademlia routing table.
//!
//! 160 buckets, one per possible first-differing-bit position relative
//! to our own id, each holding up to K=8 nodes. The table is owned by
//! the DHT task alone; everything else sees it through snapshots.
use super::NodeId;
use std::net::SocketAddr;
use std::time::Instant;

/// Nodes per bucket.
pub const BUCKET_SIZE: usize = 8;

/// Consecutive failed pings after which a node is evicted.
const MAX_FAILED_PINGS: u8 = 3;

/// A remote DHT node as tracked by the routing table.
#[derive(Debug, Clone)]
pub struct DhtNode {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub last_seen: Instant,
    failed_pings: u8,
}

/// Outcome of offering a node to the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Insert {
    /// Stored in a bucket with room (or already present; refreshed).
    Stored,
    /// The bucket is full of responsive nodes. The caller should ping
    /// the returned least-recently-seen occupant; if it fails
    /// [`MAX_FAILED_PINGS`] times the candidate takes its place.
    BucketFull {
        least_recently_seen: (NodeId, SocketAddr),
    },
    /// The id equals our own id and is never stored.
    Own,
}

pub struct RoutingTable {
    own_id: NodeId,
    buckets: Vec<Vec<DhtNode>>,
}

impl RoutingTable {
    pub fn new(own_id: NodeId) -> Self {
        RoutingTable {
            own_id,
            buckets: (0..160).map(|_| Vec::new()).collect(),
        }
    }

    pub fn own_id(&self) -> NodeId {
        self.own_id
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offers a node observed in any RPC exchange to the table.
    pub fn record(&mut self, id: NodeId, addr: SocketAddr) -> Insert {
        let Some(index) = self.own_id.bucket_index(&id) else {
            return Insert::Own;
        };
        let bucket = &mut self.buckets[index];

        if let Some(existing) = bucket.iter_mut().find(|node| node.id == id) {
            existing.addr = addr;
            existing.last_seen = Instant::now();
            existing.failed_pings = 0;
            return Insert::Stored;
        }

        if bucket.len() < BUCKET_SIZE {
            bucket.push(DhtNode {
                id,
                addr,
                last_seen: Instant::now(),
                failed_pings: 0,
            });
            return Insert::Stored;
        }

        let oldest = bucket
            .iter()
            .min_by_key(|node| node.last_seen)
            .map(|node| (node.id, node.addr));
        match oldest {
            Some(least_recently_seen) => Insert::BucketFull {
                least_recently_seen,
            },
            None => Insert::Stored,
        }
    }

    /// Marks a node as alive, resetting its failure count.
    pub fn note_response(&mut self, id: &NodeId) {
        if let Some(node) = self.find_mut(id) {
            node.last_seen = Instant::now();
            node.failed_pings = 0;
        }
    }

    /// Records a ping/query failure. Returns true when the node was
    /// evicted for reaching the failure limit.
    pub fn note_failure(&mut self, id: &NodeId) -> bool {
        let Some(index) = self.own_id.bucket_index(id) else {
            return false;
        };
        let bucket = &mut self.buckets[index];
        let Some(position) = bucket.iter().position(|node| node.id == *id) else {
            return false;
        };
        bucket[position].failed_pings += 1;
        if bucket[position].failed_pings >= MAX_FAILED_PINGS {
            bucket.remove(position);
            return true;
        }
        false
    }

    /// The `count` nodes closest to `target` by XOR distance.
    pub fn closest(&self, target: &NodeId, count: usize) -> Vec<(NodeId, SocketAddr)> {
        let mut all: Vec<&DhtNode> = self.buckets.iter().flatten().collect();
        all.sort_by_key(|node| node.id.distance(target));
        all.into_iter()
            .take(count)
            .map(|node| (node.id, node.addr))
            .collect()
    }

    fn find_mut(&mut self, id: &NodeId) -> Option<&mut DhtNode> {
        let index = self.own_id.bucket_index(id)?;
        self.buckets[index].iter_mut().find(|node| node.id == *id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> SocketAddr {
        format!("10.0.0.{last}:6881").parse().unwrap()
    }

    /// Ids landing in the bucket for the first differing bit `bit`,
    /// distinguished by `salt`.
    fn id_in_bucket(bit: usize, salt: u8) -> NodeId {
        let mut bytes = [0u8; 20];
        bytes[bit / 8] = 0x80u8 >> (bit % 8);
        bytes[19] |= salt;
        NodeId::from(bytes)
    }

    fn table() -> RoutingTable {
        RoutingTable::new(NodeId::from([0u8; 20]))
    }

    #[test]
    fn stores_and_refreshes_nodes() {
        let mut table = table();
        let id = id_in_bucket(0, 1);
        assert_eq!(table.record(id, addr(1)), Insert::Stored);
        assert_eq!(table.record(id, addr(2)), Insert::Stored);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn own_id_is_never_stored() {
        let mut table = table();
        assert_eq!(table.record(table.own_id(), addr(1)), Insert::Own);
        assert!(table.is_empty());
    }

    #[test]
    fn full_bucket_nominates_least_recently_seen() {
        let mut table = table();
        // all these ids have their first differing bit in 0x10 of the
        // last byte, so they share one bucket
        for salt in 1..=8u8 {
            let mut bytes = [0u8; 20];
            bytes[19] = 16 | salt;
            assert_eq!(table.record(NodeId::from(bytes), addr(salt)), Insert::Stored);
        }
        let mut bytes = [0u8; 20];
        bytes[19] = 16 | 9;
        match table.record(NodeId::from(bytes), addr(9)) {
            Insert::BucketFull {
                least_recently_seen,
            } => {
                let mut first = [0u8; 20];
                first[19] = 16 | 1;
                assert_eq!(least_recently_seen.0, NodeId::from(first));
            }
            other => panic!("expected full bucket, got {other:?}"),
        }
        assert_eq!(table.len(), 8);
    }

    #[test]
    fn three_failures_evict() {
        let mut table = table();
        let id = id_in_bucket(10, 1);
        table.record(id, addr(1));
        assert!(!table.note_failure(&id));
        assert!(!table.note_failure(&id));
        assert!(table.note_failure(&id));
        assert!(table.is_empty());
    }

    #[test]
    fn a_response_resets_the_failure_count() {
        let mut table = table();
        let id = id_in_bucket(10, 1);
        table.record(id, addr(1));
        table.note_failure(&id);
        table.note_failure(&id);
        table.note_response(&id);
        assert!(!table.note_failure(&id));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn closest_sorts_by_xor_distance() {
        let mut table = table();
        let near = id_in_bucket(159, 0); // ...0001
        let mid = id_in_bucket(150, 0);
        let far = id_in_bucket(0, 0);
        table.record(far, addr(1));
        table.record(near, addr(2));
        table.record(mid, addr(3));

        let target = NodeId::from([0u8; 20]);
        let closest = table.closest(&target, 2);
        assert_eq!(closest.len(), 2);
        assert_eq!(closest[0].0, near);
        assert_eq!(closest[1].0, mid);
    }
}
