//! Partition allocator: chooses (node, core) placements for replicas.
//!
//! Nodes are scored with a weighted combination of partition density and disk
//! usage:
//!
//! ```text
//! score = normalized_partitions_per_core * (1 - disk_weight) + disk_usage * disk_weight
//! ```
//!
//! Lower is better. Ties go to the lowest node id so that the same inputs always
//! produce the same placement.
//!
//! # Rack awareness
//!
//! With rack awareness on, replicas of one partition go to distinct racks. When
//! there are fewer racks than replicas the allocator still places the partition
//! and flags the placement (`rack_violation`); an unavailable partition is worse
//! than two replicas sharing a rack. Nodes without a rack count as a rack of
//! their own.
//!
//! The allocator never fails the caller's whole pass: every problem is an
//! [`AllocationError`] for one partition.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use crate::cluster::config::AllocatorConfig;
use crate::cluster::error::AllocationError;
use crate::cluster::metrics;
use crate::cluster::state::ClusterState;
use crate::types::{BrokerShard, NodeId, Ntp};

/// A chosen replica set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub replicas: Vec<BrokerShard>,
    /// Two replicas had to share a rack.
    pub rack_violation: bool,
}

/// A single replacement replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Replacement {
    pub shard: BrokerShard,
    pub rack_violation: bool,
}

#[derive(Debug, Clone)]
struct NodeLoad {
    rack: Option<String>,
    allocatable: bool,
    disk_usage: f64,
    /// Replicas per core, indexed by core id.
    core_counts: Vec<usize>,
}

impl NodeLoad {
    fn total_replicas(&self) -> usize {
        self.core_counts.iter().sum()
    }

    fn partitions_per_core(&self) -> f64 {
        self.total_replicas() as f64 / self.core_counts.len().max(1) as f64
    }

    /// Least-loaded core, lowest id on ties.
    fn best_core(&self) -> u32 {
        self.core_counts
            .iter()
            .enumerate()
            .min_by_key(|(core, count)| (**count, *core))
            .map(|(core, _)| core as u32)
            .unwrap_or(0)
    }
}

/// Per-node load snapshot the allocator works against.
///
/// Built once per planning pass. Every placement made through the allocator
/// is recorded here, so later decisions in the same pass see earlier ones.
#[derive(Debug, Clone, Default)]
pub struct AllocationState {
    nodes: BTreeMap<NodeId, NodeLoad>,
}

impl AllocationState {
    /// Snapshot the cluster. Nodes above `disk_hard_threshold` are not
    /// allocatable.
    pub fn from_cluster(state: &ClusterState, disk_hard_threshold: f64) -> Self {
        let mut nodes: BTreeMap<NodeId, NodeLoad> = state
            .directory
            .nodes()
            .map(|node| {
                let disk_usage = node.disk_usage_ratio();
                (
                    node.node_id,
                    NodeLoad {
                        rack: node.rack.clone(),
                        allocatable: node.is_allocatable() && disk_usage < disk_hard_threshold,
                        disk_usage,
                        core_counts: vec![0; node.cores.max(1) as usize],
                    },
                )
            })
            .collect();

        for (shard, count) in state.replicas_per_shard() {
            if let Some(load) = nodes.get_mut(&shard.node_id) {
                let core = (shard.core as usize).min(load.core_counts.len() - 1);
                load.core_counts[core] += count;
            }
        }

        Self { nodes }
    }

    /// Count a replica placed on `shard`.
    pub fn add_replica(&mut self, shard: BrokerShard) {
        if let Some(load) = self.nodes.get_mut(&shard.node_id) {
            let core = (shard.core as usize).min(load.core_counts.len() - 1);
            load.core_counts[core] += 1;
        }
    }

    /// Forget a replica that is leaving `shard`.
    pub fn remove_replica(&mut self, shard: BrokerShard) {
        if let Some(load) = self.nodes.get_mut(&shard.node_id) {
            let core = (shard.core as usize).min(load.core_counts.len() - 1);
            load.core_counts[core] = load.core_counts[core].saturating_sub(1);
        }
    }

    /// Place one replica on `node_id`'s least-loaded core and record it.
    pub fn place_on(&mut self, node_id: NodeId) -> Option<BrokerShard> {
        let core = self.nodes.get(&node_id)?.best_core();
        let shard = BrokerShard::new(node_id, core);
        self.add_replica(shard);
        Some(shard)
    }

    pub fn replica_count(&self, node_id: NodeId) -> usize {
        self.nodes
            .get(&node_id)
            .map(|n| n.total_replicas())
            .unwrap_or(0)
    }

    fn rack_of(&self, node_id: NodeId) -> Option<&str> {
        self.nodes.get(&node_id).and_then(|n| n.rack.as_deref())
    }

    /// Eligible nodes ordered by ascending score, then node id.
    fn ranked_candidates(
        &self,
        excluded: &BTreeSet<NodeId>,
        disk_weight: f64,
    ) -> Vec<(NodeId, f64)> {
        let eligible: Vec<(&NodeId, &NodeLoad)> = self
            .nodes
            .iter()
            .filter(|(id, load)| load.allocatable && !excluded.contains(id))
            .collect();

        let max_density = eligible
            .iter()
            .map(|(_, load)| load.partitions_per_core())
            .fold(0.0_f64, f64::max)
            .max(1.0);

        let mut ranked: Vec<(NodeId, f64)> = eligible
            .into_iter()
            .map(|(id, load)| {
                let density = load.partitions_per_core() / max_density;
                let score = density * (1.0 - disk_weight) + load.disk_usage * disk_weight;
                (*id, score)
            })
            .collect();

        ranked.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        ranked
    }
}

/// Selects replica placements.
#[derive(Debug, Clone, Default)]
pub struct PartitionAllocator {
    config: AllocatorConfig,
}

impl PartitionAllocator {
    pub fn new(config: AllocatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Place `replication_factor` replicas of `ntp`, avoiding `excluded_nodes`.
    ///
    /// The chosen shards are recorded in `state`.
    pub fn allocate(
        &self,
        state: &mut AllocationState,
        ntp: &Ntp,
        replication_factor: usize,
        excluded_nodes: &BTreeSet<NodeId>,
    ) -> Result<Placement, AllocationError> {
        if replication_factor == 0 {
            return Err(AllocationError::InvalidReplicationFactor {
                ntp: ntp.clone(),
                replication_factor,
            });
        }

        let ranked = state.ranked_candidates(excluded_nodes, self.config.disk_weight);
        if ranked.len() < replication_factor {
            return Err(AllocationError::InsufficientCapacity {
                ntp: ntp.clone(),
                requested: replication_factor,
                available: ranked.len(),
            });
        }

        let mut chosen: Vec<NodeId> = Vec::with_capacity(replication_factor);
        let mut used_racks: BTreeSet<String> = BTreeSet::new();
        let mut rack_violation = false;

        while chosen.len() < replication_factor {
            let remaining = ranked.iter().filter(|(id, _)| !chosen.contains(id));
            let pick = if self.config.rack_awareness {
                let mut remaining = remaining.peekable();
                let first = remaining.peek().map(|(id, _)| *id);
                match remaining
                    .find(|(id, _)| rack_is_new(state.rack_of(*id), &used_racks))
                    .map(|(id, _)| *id)
                {
                    Some(id) => Some(id),
                    None => {
                        rack_violation = true;
                        first
                    }
                }
            } else {
                remaining.map(|(id, _)| *id).next()
            };

            // ranked.len() >= replication_factor, so a candidate always remains
            let Some(node_id) = pick else { break };
            if let Some(rack) = state.rack_of(node_id) {
                used_racks.insert(rack.to_string());
            }
            chosen.push(node_id);
        }

        let replicas: Vec<BrokerShard> = chosen
            .into_iter()
            .map(|node_id| {
                let core = state.nodes.get(&node_id).map(|n| n.best_core()).unwrap_or(0);
                let shard = BrokerShard::new(node_id, core);
                state.add_replica(shard);
                shard
            })
            .collect();

        if rack_violation {
            metrics::record_rack_violation();
            warn!(ntp = %ntp, replication_factor, "Not enough racks, placing replicas in a shared rack");
        }
        debug!(ntp = %ntp, replicas = ?replicas, "Allocated partition");

        Ok(Placement {
            replicas,
            rack_violation,
        })
    }

    /// Find a replacement for the replica of `ntp` on `from_node`, keeping the
    /// rest of `current` fixed.
    ///
    /// The move is recorded in `state`: the new shard gains a replica and the
    /// old one loses it.
    pub fn reallocate_replica(
        &self,
        state: &mut AllocationState,
        ntp: &Ntp,
        current: &[BrokerShard],
        from_node: NodeId,
        excluded_nodes: &BTreeSet<NodeId>,
    ) -> Result<Replacement, AllocationError> {
        let Some(old) = current.iter().copied().find(|r| r.node_id == from_node) else {
            return Err(AllocationError::ReplicaNotFound {
                ntp: ntp.clone(),
                node_id: from_node,
            });
        };

        let mut excluded = excluded_nodes.clone();
        excluded.extend(current.iter().map(|r| r.node_id));

        let ranked = state.ranked_candidates(&excluded, self.config.disk_weight);
        let Some((first, _)) = ranked.first().copied() else {
            return Err(AllocationError::InsufficientCapacity {
                ntp: ntp.clone(),
                requested: 1,
                available: 0,
            });
        };

        let mut rack_violation = false;
        let node_id = if self.config.rack_awareness {
            let used_racks: BTreeSet<String> = current
                .iter()
                .filter(|r| r.node_id != from_node)
                .filter_map(|r| state.rack_of(r.node_id).map(str::to_string))
                .collect();
            match ranked
                .iter()
                .find(|(id, _)| rack_is_new(state.rack_of(*id), &used_racks))
            {
                Some((id, _)) => *id,
                None => {
                    rack_violation = true;
                    first
                }
            }
        } else {
            first
        };

        let core = state.nodes.get(&node_id).map(|n| n.best_core()).unwrap_or(0);
        let shard = BrokerShard::new(node_id, core);
        state.remove_replica(old);
        state.add_replica(shard);

        if rack_violation {
            metrics::record_rack_violation();
            warn!(ntp = %ntp, from = %from_node, to = %node_id, "Replacement replica shares a rack");
        }

        Ok(Replacement {
            shard,
            rack_violation,
        })
    }
}

fn rack_is_new(rack: Option<&str>, used: &BTreeSet<String>) -> bool {
    match rack {
        Some(rack) => !used.contains(rack),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::broker_directory::{DiskSample, MembershipState, NodeCommand};

    fn cluster(nodes: &[(i32, Option<&str>)]) -> ClusterState {
        let mut state = ClusterState::new();
        for (id, rack) in nodes {
            state.directory.apply(NodeCommand::Register {
                node_id: NodeId(*id),
                rack: rack.map(str::to_string),
                cores: 2,
                timestamp_ms: 0,
            });
        }
        state
    }

    fn allocator(rack_awareness: bool) -> PartitionAllocator {
        PartitionAllocator::new(AllocatorConfig {
            rack_awareness,
            disk_weight: 0.5,
        })
    }

    fn nodes_of(replicas: &[BrokerShard]) -> Vec<i32> {
        replicas.iter().map(|r| r.node_id.value()).collect()
    }

    #[test]
    fn test_allocate_empty_cluster_picks_lowest_ids() {
        let state = cluster(&[(3, None), (1, None), (2, None), (4, None)]);
        let mut alloc_state = AllocationState::from_cluster(&state, 0.95);
        let placement = allocator(false)
            .allocate(&mut alloc_state, &Ntp::kafka("t", 0), 3, &BTreeSet::new())
            .unwrap();
        assert_eq!(nodes_of(&placement.replicas), vec![1, 2, 3]);
        assert!(!placement.rack_violation);
    }

    #[test]
    fn test_allocate_spreads_load_within_pass() {
        let state = cluster(&[(1, None), (2, None), (3, None), (4, None)]);
        let mut alloc_state = AllocationState::from_cluster(&state, 0.95);
        let alloc = allocator(false);
        let first = alloc
            .allocate(&mut alloc_state, &Ntp::kafka("t", 0), 2, &BTreeSet::new())
            .unwrap();
        let second = alloc
            .allocate(&mut alloc_state, &Ntp::kafka("t", 1), 2, &BTreeSet::new())
            .unwrap();
        assert_eq!(nodes_of(&first.replicas), vec![1, 2]);
        assert_eq!(nodes_of(&second.replicas), vec![3, 4]);
    }

    #[test]
    fn test_allocate_uses_least_loaded_core() {
        let state = cluster(&[(1, None)]);
        let mut alloc_state = AllocationState::from_cluster(&state, 0.95);
        let alloc = allocator(false);
        let a = alloc
            .allocate(&mut alloc_state, &Ntp::kafka("t", 0), 1, &BTreeSet::new())
            .unwrap();
        let b = alloc
            .allocate(&mut alloc_state, &Ntp::kafka("t", 1), 1, &BTreeSet::new())
            .unwrap();
        assert_eq!(a.replicas[0].core, 0);
        assert_eq!(b.replicas[0].core, 1);
    }

    #[test]
    fn test_allocate_insufficient_capacity() {
        let state = cluster(&[(1, None), (2, None)]);
        let mut alloc_state = AllocationState::from_cluster(&state, 0.95);
        let err = allocator(false)
            .allocate(&mut alloc_state, &Ntp::kafka("t", 0), 3, &BTreeSet::new())
            .unwrap_err();
        assert_eq!(
            err,
            AllocationError::InsufficientCapacity {
                ntp: Ntp::kafka("t", 0),
                requested: 3,
                available: 2
            }
        );
    }

    #[test]
    fn test_allocate_zero_replication_factor() {
        let state = cluster(&[(1, None)]);
        let mut alloc_state = AllocationState::from_cluster(&state, 0.95);
        let err = allocator(false)
            .allocate(&mut alloc_state, &Ntp::kafka("t", 0), 0, &BTreeSet::new())
            .unwrap_err();
        assert!(matches!(err, AllocationError::InvalidReplicationFactor { .. }));
    }

    #[test]
    fn test_allocate_skips_excluded_and_ineligible() {
        let mut state = cluster(&[(1, None), (2, None), (3, None), (4, None)]);
        state.directory.apply(NodeCommand::SetMembership {
            node_id: NodeId(2),
            membership: MembershipState::Decommissioning,
        });
        state.directory.apply(NodeCommand::SetLiveness {
            node_id: NodeId(3),
            is_alive: false,
        });
        let mut alloc_state = AllocationState::from_cluster(&state, 0.95);
        let excluded: BTreeSet<NodeId> = [NodeId(1)].into_iter().collect();
        let placement = allocator(false)
            .allocate(&mut alloc_state, &Ntp::kafka("t", 0), 1, &excluded)
            .unwrap();
        assert_eq!(nodes_of(&placement.replicas), vec![4]);
    }

    #[test]
    fn test_allocate_prefers_emptier_disk() {
        let mut state = cluster(&[(1, None), (2, None)]);
        state.directory.apply(NodeCommand::Heartbeat {
            node_id: NodeId(1),
            disks: vec![DiskSample::new("/data", 10, 100)],
            timestamp_ms: 1,
        });
        state.directory.apply(NodeCommand::Heartbeat {
            node_id: NodeId(2),
            disks: vec![DiskSample::new("/data", 80, 100)],
            timestamp_ms: 1,
        });
        let mut alloc_state = AllocationState::from_cluster(&state, 0.95);
        let placement = allocator(false)
            .allocate(&mut alloc_state, &Ntp::kafka("t", 0), 1, &BTreeSet::new())
            .unwrap();
        assert_eq!(nodes_of(&placement.replicas), vec![2]);
    }

    #[test]
    fn test_allocate_excludes_full_disks() {
        let mut state = cluster(&[(1, None), (2, None)]);
        state.directory.apply(NodeCommand::Heartbeat {
            node_id: NodeId(1),
            disks: vec![DiskSample::new("/data", 1, 100)],
            timestamp_ms: 1,
        });
        let mut alloc_state = AllocationState::from_cluster(&state, 0.95);
        let err = allocator(false)
            .allocate(&mut alloc_state, &Ntp::kafka("t", 0), 2, &BTreeSet::new())
            .unwrap_err();
        assert!(matches!(
            err,
            AllocationError::InsufficientCapacity { available: 1, .. }
        ));
    }

    #[test]
    fn test_rack_awareness_spreads_racks() {
        let state = cluster(&[
            (1, Some("a")),
            (2, Some("a")),
            (3, Some("b")),
            (4, Some("c")),
        ]);
        let mut alloc_state = AllocationState::from_cluster(&state, 0.95);
        let placement = allocator(true)
            .allocate(&mut alloc_state, &Ntp::kafka("t", 0), 3, &BTreeSet::new())
            .unwrap();
        assert_eq!(nodes_of(&placement.replicas), vec![1, 3, 4]);
        assert!(!placement.rack_violation);
    }

    #[test]
    fn test_rack_awareness_flags_unavoidable_violation() {
        let state = cluster(&[(1, Some("a")), (2, Some("a")), (3, Some("b"))]);
        let mut alloc_state = AllocationState::from_cluster(&state, 0.95);
        let placement = allocator(true)
            .allocate(&mut alloc_state, &Ntp::kafka("t", 0), 3, &BTreeSet::new())
            .unwrap();
        assert_eq!(placement.replicas.len(), 3);
        assert!(placement.rack_violation);
    }

    #[test]
    fn test_reallocate_replica_keeps_others() {
        let state = cluster(&[(1, None), (2, None), (3, None), (4, None)]);
        let mut alloc_state = AllocationState::from_cluster(&state, 0.95);
        let current = vec![
            BrokerShard::new(NodeId(1), 0),
            BrokerShard::new(NodeId(2), 0),
            BrokerShard::new(NodeId(3), 0),
        ];
        let replacement = allocator(false)
            .reallocate_replica(
                &mut alloc_state,
                &Ntp::kafka("t", 0),
                &current,
                NodeId(3),
                &BTreeSet::new(),
            )
            .unwrap();
        assert_eq!(replacement.shard.node_id, NodeId(4));
    }

    #[test]
    fn test_reallocate_replica_errors() {
        let state = cluster(&[(1, None), (2, None), (3, None)]);
        let mut alloc_state = AllocationState::from_cluster(&state, 0.95);
        let current = vec![
            BrokerShard::new(NodeId(1), 0),
            BrokerShard::new(NodeId(2), 0),
            BrokerShard::new(NodeId(3), 0),
        ];
        let alloc = allocator(false);
        let ntp = Ntp::kafka("t", 0);

        let err = alloc
            .reallocate_replica(&mut alloc_state, &ntp, &current, NodeId(9), &BTreeSet::new())
            .unwrap_err();
        assert!(matches!(err, AllocationError::ReplicaNotFound { .. }));

        let err = alloc
            .reallocate_replica(&mut alloc_state, &ntp, &current, NodeId(3), &BTreeSet::new())
            .unwrap_err();
        assert!(matches!(
            err,
            AllocationError::InsufficientCapacity { available: 0, .. }
        ));
    }

    #[test]
    fn test_reallocate_respects_racks() {
        let state = cluster(&[
            (1, Some("a")),
            (2, Some("b")),
            (3, Some("c")),
            (4, Some("a")),
            (5, Some("c")),
        ]);
        let mut alloc_state = AllocationState::from_cluster(&state, 0.95);
        let current = vec![
            BrokerShard::new(NodeId(1), 0),
            BrokerShard::new(NodeId(2), 0),
            BrokerShard::new(NodeId(3), 0),
        ];
        let replacement = allocator(true)
            .reallocate_replica(
                &mut alloc_state,
                &Ntp::kafka("t", 0),
                &current,
                NodeId(3),
                &BTreeSet::new(),
            )
            .unwrap();
        assert_eq!(replacement.shard.node_id, NodeId(5));
        assert!(!replacement.rack_violation);
    }
}
