//! The cluster state store handed to every planning component.
//!
//! Components never read ambient globals; they take a `&ClusterState` (or
//! `&mut` for the few writers) so every pass can be driven deterministically
//! from a test.

use std::collections::BTreeMap;

use crate::cluster::broker_directory::BrokerDirectory;
use crate::cluster::partition_table::PartitionTable;
use crate::types::{BrokerShard, NodeId};

#[derive(Debug, Clone, Default)]
pub struct ClusterState {
    pub directory: BrokerDirectory,
    pub partitions: PartitionTable,
}

impl ClusterState {
    pub fn new() -> Self {
        Self {
            directory: BrokerDirectory::new(),
            partitions: PartitionTable::new(),
        }
    }

    /// Replica count per (node, core) across all partitions.
    pub fn replicas_per_shard(&self) -> BTreeMap<BrokerShard, usize> {
        let mut counts = BTreeMap::new();
        for partition in self.partitions.iter() {
            for shard in &partition.replicas {
                *counts.entry(*shard).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Replica count per node across all partitions.
    pub fn replicas_per_node(&self) -> BTreeMap<NodeId, usize> {
        let mut counts = BTreeMap::new();
        for partition in self.partitions.iter() {
            for shard in &partition.replicas {
                *counts.entry(shard.node_id).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Leader count per (node, core).
    pub fn leaders_per_shard(&self) -> BTreeMap<BrokerShard, usize> {
        let mut counts = BTreeMap::new();
        for partition in self.partitions.iter() {
            if let Some(shard) = partition.leader_shard() {
                *counts.entry(shard).or_insert(0) += 1;
            }
        }
        counts
    }
}
