//! Type-safe identifiers for control-plane primitives.
//!
//! These newtypes keep node ids, revisions and raft group ids from being
//! mixed up even though they share an integer representation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Identifier of a node (broker) in the cluster.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct NodeId(pub i32);

impl NodeId {
    /// Create a new node ID from a raw value.
    #[inline]
    pub const fn new(value: i32) -> Self {
        NodeId(value)
    }

    /// Get the raw i32 value.
    #[inline]
    pub const fn value(self) -> i32 {
        self.0
    }

    /// Check if this is a valid (non-negative) node ID.
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

impl From<i32> for NodeId {
    fn from(value: i32) -> Self {
        NodeId(value)
    }
}

impl From<NodeId> for i32 {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonically increasing counter disambiguating successive assignment
/// intents for the same partition.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Revision(pub u64);

impl Revision {
    /// Revision of a partition that has never been reassigned.
    pub const INITIAL: Self = Revision(0);

    #[inline]
    pub const fn new(value: u64) -> Self {
        Revision(value)
    }

    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The revision that supersedes this one.
    #[inline]
    pub const fn next(self) -> Self {
        Revision(self.0 + 1)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of the raft group replicating one partition.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct GroupId(pub i64);

impl GroupId {
    #[inline]
    pub const fn new(value: i64) -> Self {
        GroupId(value)
    }

    #[inline]
    pub const fn value(self) -> i64 {
        self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single replica placement: a node and the core on that node that hosts
/// the replica. This is the atomic unit the allocator places.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct BrokerShard {
    pub node_id: NodeId,
    pub core: u32,
}

impl BrokerShard {
    #[inline]
    pub const fn new(node_id: NodeId, core: u32) -> Self {
        Self { node_id, core }
    }
}

impl fmt::Display for BrokerShard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node_id, self.core)
    }
}

/// Fully qualified partition identifier: namespace, topic and partition index.
///
/// Uses `Arc<str>` for the string parts so keys clone cheaply; partition keys
/// are cloned on every planning pass and every reconciliation tick.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ntp {
    pub namespace: Arc<str>,
    pub topic: Arc<str>,
    pub partition: i32,
}

impl Ntp {
    pub fn new(namespace: &str, topic: &str, partition: i32) -> Self {
        Self {
            namespace: Arc::from(namespace),
            topic: Arc::from(topic),
            partition,
        }
    }

    /// Partition in the default `kafka` namespace.
    pub fn kafka(topic: &str, partition: i32) -> Self {
        Self::new(crate::constants::DEFAULT_NAMESPACE, topic, partition)
    }
}

impl fmt::Display for Ntp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.topic, self.partition)
    }
}

/// Smallest replica count that still forms a majority of a raft group with
/// `replication_factor` members.
#[inline]
pub const fn quorum_floor(replication_factor: usize) -> usize {
    replication_factor / 2 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_roundtrip() {
        let id = NodeId::new(7);
        assert_eq!(i32::from(id), 7);
        assert_eq!(NodeId::from(7), id);
        assert!(id.is_valid());
        assert!(!NodeId(-1).is_valid());
        assert_eq!(id.to_string(), "7");
    }

    #[test]
    fn test_revision_next() {
        assert_eq!(Revision::INITIAL.next(), Revision(1));
        assert!(Revision(3) > Revision(2));
    }

    #[test]
    fn test_broker_shard_ordering() {
        let a = BrokerShard::new(NodeId(1), 3);
        let b = BrokerShard::new(NodeId(2), 0);
        assert!(a < b);
        assert_eq!(a.to_string(), "1:3");
    }

    #[test]
    fn test_ntp_display() {
        let ntp = Ntp::kafka("orders", 4);
        assert_eq!(ntp.to_string(), "kafka/orders/4");
        assert_eq!(ntp, Ntp::new("kafka", "orders", 4));
    }

    #[test]
    fn test_quorum_floor() {
        assert_eq!(quorum_floor(1), 1);
        assert_eq!(quorum_floor(3), 2);
        assert_eq!(quorum_floor(4), 3);
        assert_eq!(quorum_floor(5), 3);
    }
}
