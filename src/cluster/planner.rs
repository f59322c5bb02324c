//! Balancer planner: computes the cluster-wide convergence plan.
//!
//! A pass runs in two phases, evacuation before balancing:
//!
//! 1. **Evacuation**: every replica on a node that has been unavailable longer
//!    than `node_availability_timeout`, is decommissioning or removed, or is above
//!    the hard disk threshold is reallocated through the allocator.
//! 2. **Disk balancing**: replicas on nodes between the soft and hard thresholds
//!    move greedily from the fullest node to the emptiest eligible one, but only
//!    when the move lowers the variance of disk usage by more than
//!    `min_variance_improvement`.
//!
//! The planner only proposes. Its output is a list of
//! [`ReplicaMoveIntent`]s for the reconciler plus the partitions it could not
//! place. Partitions that already have an active reconfiguration are skipped,
//! and the number of new intents never exceeds the free reconfiguration slots.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use tracing::{debug, info, warn};

use crate::cluster::allocator::{AllocationState, PartitionAllocator};
use crate::cluster::broker_directory::{MembershipState, NodeMetadata};
use crate::cluster::config::PlannerConfig;
use crate::cluster::error::AllocationError;
use crate::cluster::metrics;
use crate::cluster::state::ClusterState;
use crate::types::{BrokerShard, NodeId, Ntp};

/// Outcome of the last planning pass, as shown to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlannerStatus {
    /// Planner disabled by configuration.
    Off,
    /// Nothing to do.
    #[default]
    Ready,
    /// Moves are planned or running.
    InProgress,
    /// Some partitions could not be placed; manual action is needed.
    Stalled,
}

impl fmt::Display for PlannerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlannerStatus::Off => write!(f, "off"),
            PlannerStatus::Ready => write!(f, "ready"),
            PlannerStatus::InProgress => write!(f, "in_progress"),
            PlannerStatus::Stalled => write!(f, "stalled"),
        }
    }
}

/// Why a replica is being moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveReason {
    NodeUnavailable,
    NodeDecommissioning,
    DiskFull,
    DiskBalance,
}

impl fmt::Display for MoveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MoveReason::NodeUnavailable => write!(f, "node_unavailable"),
            MoveReason::NodeDecommissioning => write!(f, "node_decommissioning"),
            MoveReason::DiskFull => write!(f, "disk_full"),
            MoveReason::DiskBalance => write!(f, "disk_balance"),
        }
    }
}

/// A proposed replica set change for one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaMoveIntent {
    pub ntp: Ntp,
    pub previous: Vec<BrokerShard>,
    pub target: Vec<BrokerShard>,
    pub reason: MoveReason,
}

/// A replica the planner wanted to move but could not place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionAllocationFailure {
    pub ntp: Ntp,
    /// Node the replica should have left.
    pub node_id: NodeId,
    pub error: AllocationError,
}

/// Nodes that currently violate a placement rule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanViolations {
    pub unavailable_nodes: Vec<NodeId>,
    pub full_disk_nodes: Vec<NodeId>,
}

impl PlanViolations {
    pub fn is_empty(&self) -> bool {
        self.unavailable_nodes.is_empty() && self.full_disk_nodes.is_empty()
    }
}

/// Result of one planning pass.
#[derive(Debug, Clone, Default)]
pub struct PlanResult {
    pub intents: Vec<ReplicaMoveIntent>,
    pub failures: Vec<PartitionAllocationFailure>,
    /// Candidates left for a later pass because the concurrency cap was hit.
    pub deferred: usize,
    pub violations: PlanViolations,
    pub status: PlannerStatus,
}

impl PlanResult {
    /// Allocation failures for partitions with a replica on `node_id`.
    pub fn failures_for(&self, node_id: NodeId) -> Vec<Ntp> {
        self.failures
            .iter()
            .filter(|f| f.node_id == node_id)
            .map(|f| f.ntp.clone())
            .collect()
    }
}

/// Computes replica move intents from a cluster snapshot.
#[derive(Debug, Clone)]
pub struct BalancerPlanner {
    config: PlannerConfig,
    allocator: PartitionAllocator,
}

impl BalancerPlanner {
    pub fn new(config: PlannerConfig, allocator: PartitionAllocator) -> Self {
        Self { config, allocator }
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    pub fn allocator(&self) -> &PartitionAllocator {
        &self.allocator
    }

    /// Run one planning pass.
    ///
    /// `active` holds partitions with a reconfiguration in flight; they are
    /// neither moved nor counted against free slots twice.
    pub fn plan(&self, state: &ClusterState, active: &BTreeSet<Ntp>, now_ms: u64) -> PlanResult {
        if !self.config.enabled {
            return PlanResult {
                status: PlannerStatus::Off,
                ..Default::default()
            };
        }

        let mut result = PlanResult::default();
        let mut budget = self
            .config
            .max_concurrent_reconfigurations
            .saturating_sub(active.len());
        let mut alloc_state = AllocationState::from_cluster(state, self.config.disk_hard_threshold);
        let mut planned: BTreeSet<Ntp> = BTreeSet::new();

        let evacuating = self.nodes_to_evacuate(state, now_ms, &mut result.violations);
        let excluded: BTreeSet<NodeId> = evacuating.keys().copied().collect();

        for partition in state.partitions.iter() {
            let leaving: Vec<(NodeId, MoveReason)> = partition
                .replicas
                .iter()
                .filter_map(|r| evacuating.get(&r.node_id).map(|reason| (r.node_id, *reason)))
                .collect();
            if leaving.is_empty() || active.contains(&partition.ntp) {
                continue;
            }
            if budget == 0 {
                result.deferred += 1;
                continue;
            }

            let mut target = partition.replicas.clone();
            for (node_id, _) in &leaving {
                match self.allocator.reallocate_replica(
                    &mut alloc_state,
                    &partition.ntp,
                    &target,
                    *node_id,
                    &excluded,
                ) {
                    Ok(replacement) => {
                        for slot in target.iter_mut() {
                            if slot.node_id == *node_id {
                                *slot = replacement.shard;
                            }
                        }
                    }
                    Err(error) => {
                        warn!(ntp = %partition.ntp, node_id = %node_id, error = %error, "No placement for evacuated replica");
                        result.failures.push(PartitionAllocationFailure {
                            ntp: partition.ntp.clone(),
                            node_id: *node_id,
                            error,
                        });
                    }
                }
            }

            if target != partition.replicas {
                budget -= 1;
                planned.insert(partition.ntp.clone());
                result.intents.push(ReplicaMoveIntent {
                    ntp: partition.ntp.clone(),
                    previous: partition.replicas.clone(),
                    target,
                    reason: leaving[0].1,
                });
            }
        }

        self.plan_disk_balance(
            state,
            active,
            &planned,
            &excluded,
            &mut alloc_state,
            &mut budget,
            &mut result,
        );

        result.status = if !result.failures.is_empty() {
            PlannerStatus::Stalled
        } else if !result.intents.is_empty() || !active.is_empty() || result.deferred > 0 {
            PlannerStatus::InProgress
        } else {
            PlannerStatus::Ready
        };

        metrics::record_planner_pass(&result.status.to_string(), result.failures.len());
        if result.intents.is_empty() {
            debug!(
                status = %result.status,
                active = active.len(),
                deferred = result.deferred,
                "Planner pass produced no moves"
            );
        } else {
            info!(
                status = %result.status,
                intents = result.intents.len(),
                failures = result.failures.len(),
                deferred = result.deferred,
                "Planner pass complete"
            );
        }

        result
    }

    fn nodes_to_evacuate(
        &self,
        state: &ClusterState,
        now_ms: u64,
        violations: &mut PlanViolations,
    ) -> BTreeMap<NodeId, MoveReason> {
        let availability_timeout_ms = self.config.node_availability_timeout.as_millis() as u64;
        let mut evacuating = BTreeMap::new();

        for node in state.directory.nodes() {
            if matches!(
                node.membership,
                MembershipState::Decommissioning | MembershipState::Removed
            ) {
                evacuating.insert(node.node_id, MoveReason::NodeDecommissioning);
                continue;
            }
            if !node.is_alive
                && now_ms.saturating_sub(node.last_heartbeat_ms) >= availability_timeout_ms
            {
                violations.unavailable_nodes.push(node.node_id);
                evacuating.insert(node.node_id, MoveReason::NodeUnavailable);
                continue;
            }
            if node.is_alive && node.disk_usage_ratio() >= self.config.disk_hard_threshold {
                violations.full_disk_nodes.push(node.node_id);
                evacuating.insert(node.node_id, MoveReason::DiskFull);
            }
        }

        evacuating
    }

    #[allow(clippy::too_many_arguments)]
    fn plan_disk_balance(
        &self,
        state: &ClusterState,
        active: &BTreeSet<Ntp>,
        planned: &BTreeSet<Ntp>,
        excluded: &BTreeSet<NodeId>,
        alloc_state: &mut AllocationState,
        budget: &mut usize,
        result: &mut PlanResult,
    ) {
        let soft = self.config.disk_soft_threshold;
        let hard = self.config.disk_hard_threshold;

        // Projected (used, total) bytes for nodes that take part in balancing.
        let mut usage: BTreeMap<NodeId, (f64, f64)> = state
            .directory
            .nodes()
            .filter(|n| n.is_alive && n.total_bytes() > 0 && !excluded.contains(&n.node_id))
            .map(|n: &NodeMetadata| (n.node_id, (n.used_bytes() as f64, n.total_bytes() as f64)))
            .collect();

        let ratio = |usage: &BTreeMap<NodeId, (f64, f64)>, id: &NodeId| {
            usage.get(id).map(|(used, total)| used / total).unwrap_or(0.0)
        };

        let mut sources: Vec<NodeId> = usage
            .keys()
            .copied()
            .filter(|id| {
                let r = ratio(&usage, id);
                r >= soft && r < hard
            })
            .collect();
        sources.sort_by(|a, b| ratio(&usage, b).total_cmp(&ratio(&usage, a)).then(a.cmp(b)));

        let mut moved: BTreeSet<Ntp> = BTreeSet::new();

        for source in sources {
            // Largest partitions first: fewer moves for the same relief.
            let mut candidates: Vec<_> = state
                .partitions
                .iter()
                .filter(|p| p.hosts(source) && p.size_bytes > 0)
                .filter(|p| !active.contains(&p.ntp) && !planned.contains(&p.ntp))
                .collect();
            candidates.sort_by(|a, b| b.size_bytes.cmp(&a.size_bytes).then(a.ntp.cmp(&b.ntp)));

            for partition in candidates {
                if ratio(&usage, &source) < soft {
                    break;
                }
                if moved.contains(&partition.ntp) {
                    continue;
                }

                let Some(target_node) = state
                    .directory
                    .allocatable_nodes()
                    .map(|n| n.node_id)
                    .filter(|id| usage.contains_key(id) && !partition.hosts(*id))
                    .filter(|id| ratio(&usage, id) < soft)
                    .min_by(|a, b| ratio(&usage, a).total_cmp(&ratio(&usage, b)).then(a.cmp(b)))
                else {
                    break;
                };

                let size = partition.size_bytes as f64;
                let before = disk_usage_variance(&usage);
                let mut projected = usage.clone();
                if let Some(entry) = projected.get_mut(&source) {
                    entry.0 = (entry.0 - size).max(0.0);
                }
                if let Some(entry) = projected.get_mut(&target_node) {
                    entry.0 += size;
                }
                let after = disk_usage_variance(&projected);

                if before - after <= self.config.min_variance_improvement {
                    debug!(
                        ntp = %partition.ntp,
                        from = %source,
                        to = %target_node,
                        before,
                        after,
                        "Rejected balancing move"
                    );
                    continue;
                }

                if *budget == 0 {
                    result.deferred += 1;
                    return;
                }

                let Some(old) = partition.shard_on(source) else {
                    continue;
                };
                let Some(new_shard) = alloc_state.place_on(target_node) else {
                    continue;
                };
                alloc_state.remove_replica(old);

                let target: Vec<BrokerShard> = partition
                    .replicas
                    .iter()
                    .map(|r| if r.node_id == source { new_shard } else { *r })
                    .collect();

                usage = projected;
                *budget -= 1;
                moved.insert(partition.ntp.clone());
                result.intents.push(ReplicaMoveIntent {
                    ntp: partition.ntp.clone(),
                    previous: partition.replicas.clone(),
                    target,
                    reason: MoveReason::DiskBalance,
                });
            }
        }
    }
}

/// Population variance of per-node disk usage ratios.
pub fn disk_usage_variance(usage: &BTreeMap<NodeId, (f64, f64)>) -> f64 {
    if usage.is_empty() {
        return 0.0;
    }
    let ratios: Vec<f64> = usage.values().map(|(used, total)| used / total).collect();
    let mean = ratios.iter().sum::<f64>() / ratios.len() as f64;
    ratios.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / ratios.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::broker_directory::{DiskSample, NodeCommand};
    use crate::cluster::config::AllocatorConfig;
    use std::time::Duration;

    fn planner(max_concurrent: usize) -> BalancerPlanner {
        BalancerPlanner::new(
            PlannerConfig {
                max_concurrent_reconfigurations: max_concurrent,
                node_availability_timeout: Duration::from_secs(10),
                ..Default::default()
            },
            PartitionAllocator::new(AllocatorConfig {
                rack_awareness: false,
                disk_weight: 0.5,
            }),
        )
    }

    fn cluster(node_count: i32) -> ClusterState {
        let mut state = ClusterState::new();
        for id in 1..=node_count {
            state.directory.apply(NodeCommand::Register {
                node_id: NodeId(id),
                rack: None,
                cores: 1,
                timestamp_ms: 0,
            });
        }
        state
    }

    fn shards(ids: &[i32]) -> Vec<BrokerShard> {
        ids.iter().map(|id| BrokerShard::new(NodeId(*id), 0)).collect()
    }

    fn set_disk(state: &mut ClusterState, id: i32, used: u64, total: u64) {
        state.directory.apply(NodeCommand::Heartbeat {
            node_id: NodeId(id),
            disks: vec![DiskSample::new("/data", total - used, total)],
            timestamp_ms: 0,
        });
    }

    #[test]
    fn test_balanced_cluster_is_ready() {
        let mut state = cluster(3);
        state
            .partitions
            .create_topic("kafka", "t", 3, vec![shards(&[1, 2, 3])], 0)
            .unwrap();
        let result = planner(10).plan(&state, &BTreeSet::new(), 0);
        assert!(result.intents.is_empty());
        assert_eq!(result.status, PlannerStatus::Ready);
    }

    #[test]
    fn test_disabled_planner_is_off() {
        let mut config = PlannerConfig::default();
        config.enabled = false;
        let planner = BalancerPlanner::new(config, PartitionAllocator::default());
        let result = planner.plan(&cluster(1), &BTreeSet::new(), 0);
        assert_eq!(result.status, PlannerStatus::Off);
    }

    #[test]
    fn test_evacuates_decommissioning_node() {
        let mut state = cluster(4);
        state
            .partitions
            .create_topic("kafka", "t", 3, vec![shards(&[1, 2, 3])], 0)
            .unwrap();
        state.directory.apply(NodeCommand::SetMembership {
            node_id: NodeId(3),
            membership: MembershipState::Decommissioning,
        });

        let result = planner(10).plan(&state, &BTreeSet::new(), 0);
        assert_eq!(result.intents.len(), 1);
        let intent = &result.intents[0];
        assert_eq!(intent.target, shards(&[1, 2, 4]));
        assert_eq!(intent.reason, MoveReason::NodeDecommissioning);
        assert_eq!(result.status, PlannerStatus::InProgress);
    }

    #[test]
    fn test_records_failure_without_capacity() {
        let mut state = cluster(3);
        state
            .partitions
            .create_topic("kafka", "t", 3, vec![shards(&[1, 2, 3])], 0)
            .unwrap();
        state.directory.apply(NodeCommand::SetMembership {
            node_id: NodeId(3),
            membership: MembershipState::Decommissioning,
        });

        let result = planner(10).plan(&state, &BTreeSet::new(), 0);
        assert!(result.intents.is_empty());
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures_for(NodeId(3)), vec![Ntp::kafka("t", 0)]);
        assert_eq!(result.status, PlannerStatus::Stalled);
    }

    #[test]
    fn test_dead_node_waits_for_availability_timeout() {
        let mut state = cluster(4);
        state
            .partitions
            .create_topic("kafka", "t", 3, vec![shards(&[1, 2, 3])], 0)
            .unwrap();
        state.directory.apply(NodeCommand::SetLiveness {
            node_id: NodeId(3),
            is_alive: false,
        });

        let early = planner(10).plan(&state, &BTreeSet::new(), 5_000);
        assert!(early.intents.is_empty());

        let late = planner(10).plan(&state, &BTreeSet::new(), 10_000);
        assert_eq!(late.intents.len(), 1);
        assert_eq!(late.intents[0].reason, MoveReason::NodeUnavailable);
        assert_eq!(late.violations.unavailable_nodes, vec![NodeId(3)]);
    }

    #[test]
    fn test_skips_active_partitions() {
        let mut state = cluster(4);
        state
            .partitions
            .create_topic("kafka", "t", 3, vec![shards(&[1, 2, 3])], 0)
            .unwrap();
        state.directory.apply(NodeCommand::SetMembership {
            node_id: NodeId(3),
            membership: MembershipState::Decommissioning,
        });
        let active: BTreeSet<Ntp> = [Ntp::kafka("t", 0)].into_iter().collect();

        let result = planner(10).plan(&state, &active, 0);
        assert!(result.intents.is_empty());
        assert_eq!(result.status, PlannerStatus::InProgress);
    }

    #[test]
    fn test_concurrency_cap_defers_remaining() {
        let mut state = cluster(4);
        state
            .partitions
            .create_topic(
                "kafka",
                "t",
                3,
                vec![shards(&[1, 2, 3]), shards(&[2, 3, 1]), shards(&[3, 1, 2])],
                0,
            )
            .unwrap();
        state.directory.apply(NodeCommand::SetMembership {
            node_id: NodeId(3),
            membership: MembershipState::Decommissioning,
        });

        let result = planner(2).plan(&state, &BTreeSet::new(), 0);
        assert_eq!(result.intents.len(), 2);
        assert_eq!(result.deferred, 1);
    }

    #[test]
    fn test_full_disk_node_is_evacuated() {
        let mut state = cluster(4);
        state
            .partitions
            .create_topic("kafka", "t", 3, vec![shards(&[1, 2, 3])], 0)
            .unwrap();
        set_disk(&mut state, 3, 97, 100);

        let result = planner(10).plan(&state, &BTreeSet::new(), 0);
        assert_eq!(result.violations.full_disk_nodes, vec![NodeId(3)]);
        assert_eq!(result.intents[0].reason, MoveReason::DiskFull);
        assert_eq!(result.intents[0].target, shards(&[1, 2, 4]));
    }

    #[test]
    fn test_disk_balance_moves_only_when_variance_drops() {
        let mut state = cluster(3);
        state
            .partitions
            .create_topic("kafka", "big", 1, vec![shards(&[1])], 0)
            .unwrap();
        state
            .partitions
            .create_topic("kafka", "small", 1, vec![shards(&[2])], 0)
            .unwrap();
        state.partitions.get_mut(&Ntp::kafka("big", 0)).unwrap().size_bytes = 20;
        set_disk(&mut state, 1, 85, 100);
        set_disk(&mut state, 2, 40, 100);
        set_disk(&mut state, 3, 40, 100);

        let result = planner(10).plan(&state, &BTreeSet::new(), 0);
        assert_eq!(result.intents.len(), 1);
        let intent = &result.intents[0];
        assert_eq!(intent.ntp, Ntp::kafka("big", 0));
        assert_eq!(intent.reason, MoveReason::DiskBalance);
        assert_eq!(intent.target, shards(&[2]));
    }

    #[test]
    fn test_disk_balance_rejects_overshoot() {
        let mut state = cluster(2);
        state
            .partitions
            .create_topic("kafka", "huge", 1, vec![shards(&[1])], 0)
            .unwrap();
        state.partitions.get_mut(&Ntp::kafka("huge", 0)).unwrap().size_bytes = 80;
        set_disk(&mut state, 1, 85, 100);
        set_disk(&mut state, 2, 10, 100);

        // 85/10 -> 5/90 leaves the spread larger than before
        let result = planner(10).plan(&state, &BTreeSet::new(), 0);
        assert!(result.intents.is_empty());
    }

    #[test]
    fn test_variance() {
        let mut usage = BTreeMap::new();
        usage.insert(NodeId(1), (50.0, 100.0));
        usage.insert(NodeId(2), (50.0, 100.0));
        assert_eq!(disk_usage_variance(&usage), 0.0);
        usage.insert(NodeId(3), (80.0, 100.0));
        assert!(disk_usage_variance(&usage) > 0.0);
    }
}
