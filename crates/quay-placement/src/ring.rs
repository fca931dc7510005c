//! The placement-ring collaborator interface.
//!
//! The real ring lives outside Quay; the coordination layer only needs an
//! ordered primary node list and a bounded handoff sequence per partition.
//! [`StaticRing`] is a deterministic in-memory implementation used by tests
//! and single-process deployments.

use quay_types::Node;

/// Placement lookup consumed by the controllers.
pub trait Ring: Send + Sync {
    /// Number of primary nodes per partition.
    fn replica_count(&self) -> usize;

    /// The ordered primary node list for a partition (fixed size =
    /// replica count).
    fn primary_nodes(&self, partition: u64) -> Vec<Node>;

    /// Fallback nodes for a partition, in preference order. Conceptually
    /// unbounded; the caller truncates via its own candidate cap.
    fn handoff_nodes(&self, partition: u64) -> Box<dyn Iterator<Item = Node> + Send>;

    /// Map an object path to its partition.
    fn partition(&self, path: &str) -> u64 {
        let hash = blake3::hash(path.as_bytes());
        let bytes: [u8; 8] = hash.as_bytes()[..8].try_into().expect("8 bytes");
        u64::from_le_bytes(bytes)
    }
}

/// A fixed node table with rotation-based placement.
///
/// Partition `p` gets primaries `nodes[p % n], nodes[p+1 % n], ...` and the
/// remaining nodes, in ring order, as handoffs. Deterministic and cheap,
/// which is all the coordination tests need.
#[derive(Debug, Clone)]
pub struct StaticRing {
    nodes: Vec<Node>,
    replicas: usize,
}

impl StaticRing {
    /// Build a ring over the given node table.
    ///
    /// `replicas` is clamped to the table size.
    pub fn new(nodes: Vec<Node>, replicas: usize) -> Self {
        let replicas = replicas.min(nodes.len());
        Self { nodes, replicas }
    }

    /// All nodes in ring order starting at the partition's offset.
    fn rotated(&self, partition: u64) -> impl Iterator<Item = Node> + '_ {
        let n = self.nodes.len();
        let start = if n == 0 { 0 } else { (partition as usize) % n };
        (0..n).map(move |i| self.nodes[(start + i) % n].clone())
    }
}

impl Ring for StaticRing {
    fn replica_count(&self) -> usize {
        self.replicas
    }

    fn primary_nodes(&self, partition: u64) -> Vec<Node> {
        self.rotated(partition).take(self.replicas).collect()
    }

    fn handoff_nodes(&self, partition: u64) -> Box<dyn Iterator<Item = Node> + Send> {
        let rest: Vec<Node> = self.rotated(partition).skip(self.replicas).collect();
        Box::new(rest.into_iter())
    }
}
