//! Leader balancing across cores.
//!
//! Leadership load is counted per (node, core). A pass computes the mean
//! leader count over every eligible core and repeatedly moves one leader from
//! the busiest core to the least busy follower core while the source is above
//! the mean and the gap between the two exceeds the tolerance. With two
//! single-core nodes holding 10 and 2 leaders and a tolerance of 1 the pass
//! stops at 6/6.
//!
//! A follower is only a valid target when its node can lead and its last
//! reported log position is within `max_follower_lag` of the leader. Unknown
//! positions count as lagging. Partitions moved recently sit out a cooldown.

use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;
use tracing::{debug, info};

use super::broker_directory::MembershipState;
use super::config::LeaderBalancerConfig;
use super::error::{ControllerError, ControllerResult};
use super::partition_table::PartitionMetadata;
use super::state::ClusterState;
use crate::types::{BrokerShard, NodeId, Ntp};

/// A proposed leadership move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeadershipTransfer {
    pub ntp: Ntp,
    pub from: BrokerShard,
    pub to: BrokerShard,
    /// Follower lag at planning time, in offsets.
    pub lag: i64,
}

/// Outcome of one balancing pass.
#[derive(Debug, Clone, Default)]
pub struct LeaderBalanceDecision {
    pub transfers: Vec<LeadershipTransfer>,
    /// Mean leader count per eligible core.
    pub mean: f64,
    /// Leader counts per eligible core before the pass.
    pub leaders_before: BTreeMap<BrokerShard, usize>,
    /// Leader counts per eligible core if every transfer succeeds.
    pub leaders_after: BTreeMap<BrokerShard, usize>,
}

impl LeaderBalanceDecision {
    pub fn is_balanced(&self) -> bool {
        self.transfers.is_empty()
    }
}

/// Computes leadership transfers that even out leaders per core.
pub struct LeaderBalancer {
    config: LeaderBalancerConfig,

    /// Cooldown tracking: ntp -> last transfer time.
    cooldowns: DashMap<Ntp, Instant>,

    total_transfers: u64,
}

impl LeaderBalancer {
    pub fn new(config: LeaderBalancerConfig) -> Self {
        info!(
            enabled = config.enabled,
            tolerance = config.tolerance,
            max_concurrent_transfers = config.max_concurrent_transfers,
            max_follower_lag = config.max_follower_lag,
            "Creating leader balancer"
        );

        Self {
            config,
            cooldowns: DashMap::new(),
            total_transfers: 0,
        }
    }

    pub fn config(&self) -> &LeaderBalancerConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Plan leadership transfers.
    ///
    /// `busy` partitions (active reconfigurations) are left alone and
    /// `in_flight` transfers count against the concurrency cap.
    pub fn plan(
        &self,
        state: &ClusterState,
        busy: &BTreeSet<Ntp>,
        in_flight: usize,
        now: Instant,
    ) -> LeaderBalanceDecision {
        let mut counts = eligible_leader_counts(state);
        if counts.len() < 2 {
            debug!("Skipping leader balance: fewer than 2 eligible cores");
            return LeaderBalanceDecision {
                leaders_after: counts.clone(),
                leaders_before: counts,
                ..Default::default()
            };
        }

        let total: usize = counts.values().sum();
        let mean = total as f64 / counts.len() as f64;
        let leaders_before = counts.clone();
        let budget = self.config.max_concurrent_transfers.saturating_sub(in_flight);

        let mut moved: BTreeSet<Ntp> = BTreeSet::new();
        let mut transfers = Vec::new();

        while transfers.len() < budget {
            let mut sources: Vec<(BrokerShard, usize)> = counts
                .iter()
                .filter(|(_, count)| **count as f64 > mean)
                .map(|(shard, count)| (*shard, *count))
                .collect();
            sources.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

            let next = sources.iter().find_map(|(source, source_count)| {
                self.best_move(state, *source, *source_count, &counts, busy, &moved, now)
            });
            let Some(transfer) = next else {
                break;
            };

            if let Some(count) = counts.get_mut(&transfer.from) {
                *count -= 1;
            }
            *counts.entry(transfer.to).or_insert(0) += 1;
            moved.insert(transfer.ntp.clone());
            transfers.push(transfer);
        }

        if transfers.is_empty() {
            debug!(mean, cores = counts.len(), "Leadership is balanced");
        } else {
            info!(
                mean,
                transfers = transfers.len(),
                "Leader rebalancing needed"
            );
        }

        LeaderBalanceDecision {
            transfers,
            mean,
            leaders_before,
            leaders_after: counts,
        }
    }

    /// Best transfer away from `source`, if any keeps the gap shrinking.
    #[allow(clippy::too_many_arguments)]
    fn best_move(
        &self,
        state: &ClusterState,
        source: BrokerShard,
        source_count: usize,
        counts: &BTreeMap<BrokerShard, usize>,
        busy: &BTreeSet<Ntp>,
        moved: &BTreeSet<Ntp>,
        now: Instant,
    ) -> Option<LeadershipTransfer> {
        let mut best: Option<(usize, i64, LeadershipTransfer)> = None;

        for partition in state.partitions.iter() {
            if partition.leader_shard() != Some(source)
                || busy.contains(&partition.ntp)
                || moved.contains(&partition.ntp)
            {
                continue;
            }
            if self.is_in_cooldown(&partition.ntp, now) {
                debug!(ntp = %partition.ntp, "Partition in leadership cooldown, skipping");
                continue;
            }

            for (shard, lag) in self.up_to_date_followers(state, partition) {
                let Some(target_count) = counts.get(&shard).copied() else {
                    continue;
                };
                if (source_count as f64 - target_count as f64) <= self.config.tolerance {
                    continue;
                }
                let better = match &best {
                    None => true,
                    Some((best_count, best_lag, _)) => {
                        (target_count, lag) < (*best_count, *best_lag)
                    }
                };
                if better {
                    best = Some((
                        target_count,
                        lag,
                        LeadershipTransfer {
                            ntp: partition.ntp.clone(),
                            from: source,
                            to: shard,
                            lag,
                        },
                    ));
                }
            }
        }

        best.map(|(_, _, transfer)| transfer)
    }

    /// Followers that may take leadership, with their lag.
    fn up_to_date_followers(
        &self,
        state: &ClusterState,
        partition: &PartitionMetadata,
    ) -> Vec<(BrokerShard, i64)> {
        partition
            .replicas
            .iter()
            .filter(|shard| Some(shard.node_id) != partition.leader)
            .filter(|shard| is_leadership_target(state, shard.node_id))
            .filter_map(|shard| {
                let lag = partition.follower_lag(shard.node_id)?;
                (lag <= self.config.max_follower_lag).then_some((*shard, lag))
            })
            .collect()
    }

    /// Resolve an operator's leadership transfer request.
    ///
    /// With an explicit target, scoring is skipped but the target must be an
    /// up-to-date replica on a node that can lead. Without one, the least
    /// loaded up-to-date follower is chosen.
    pub fn validate_manual(
        &self,
        state: &ClusterState,
        ntp: &Ntp,
        target: Option<NodeId>,
    ) -> ControllerResult<NodeId> {
        let partition = state.partitions.require(ntp)?;

        let Some(target) = target else {
            return self.pick_target(state, partition).ok_or_else(|| {
                ControllerError::InvalidLeadershipTarget {
                    ntp: ntp.clone(),
                    node_id: NodeId(-1),
                    reason: "no up-to-date replica can take leadership".to_string(),
                }
            });
        };

        let reject = |reason: &str| ControllerError::InvalidLeadershipTarget {
            ntp: ntp.clone(),
            node_id: target,
            reason: reason.to_string(),
        };

        if !partition.hosts(target) {
            return Err(reject("not a replica"));
        }
        if partition.leader == Some(target) {
            return Ok(target);
        }
        if !is_leadership_target(state, target) {
            return Err(reject("node cannot take leadership"));
        }
        match partition.follower_lag(target) {
            Some(lag) if lag <= self.config.max_follower_lag => Ok(target),
            Some(_) => Err(reject("replica lags the leader")),
            None => Err(reject("replica log position unknown")),
        }
    }

    /// Least loaded up-to-date follower of `partition`.
    pub fn pick_target(&self, state: &ClusterState, partition: &PartitionMetadata) -> Option<NodeId> {
        let leaders = state.leaders_per_shard();
        self.up_to_date_followers(state, partition)
            .into_iter()
            .min_by_key(|(shard, lag)| (leaders.get(shard).copied().unwrap_or(0), *lag, *shard))
            .map(|(shard, _)| shard.node_id)
    }

    /// Check if a partition is in cooldown period.
    pub fn is_in_cooldown(&self, ntp: &Ntp, now: Instant) -> bool {
        self.cooldowns
            .get(ntp)
            .is_some_and(|entry| now.saturating_duration_since(*entry.value()) < self.config.transfer_cooldown)
    }

    /// Record that leadership of a partition was moved (start cooldown).
    pub fn record_transfer(&mut self, ntp: &Ntp, now: Instant) {
        self.cooldowns.insert(ntp.clone(), now);
        self.total_transfers += 1;

        debug!(
            ntp = %ntp,
            cooldown_secs = self.config.transfer_cooldown.as_secs(),
            "Recorded leadership transfer, cooldown started"
        );
    }

    /// Clean up expired cooldown entries.
    pub fn cleanup_cooldowns(&self, now: Instant) {
        let cooldown = self.config.transfer_cooldown;
        let before = self.cooldowns.len();

        self.cooldowns
            .retain(|_, at| now.saturating_duration_since(*at) < cooldown);

        let removed = before - self.cooldowns.len();
        if removed > 0 {
            debug!(removed, "Cleaned up expired cooldown entries");
        }
    }

    pub fn active_cooldown_count(&self) -> usize {
        self.cooldowns.len()
    }

    pub fn total_transfers(&self) -> u64 {
        self.total_transfers
    }
}

/// Nodes that may receive leadership from the balancer.
fn is_leadership_target(state: &ClusterState, node_id: NodeId) -> bool {
    state
        .directory
        .get(node_id)
        .is_some_and(|n| n.can_lead() && n.membership == MembershipState::Active)
}

/// Leader count for every core of every eligible node, zero-filled.
fn eligible_leader_counts(state: &ClusterState) -> BTreeMap<BrokerShard, usize> {
    let leaders = state.leaders_per_shard();
    let mut counts = BTreeMap::new();
    for node in state.directory.nodes() {
        if !is_leadership_target(state, node.node_id) {
            continue;
        }
        for core in 0..node.cores {
            let shard = BrokerShard::new(node.node_id, core);
            counts.insert(shard, leaders.get(&shard).copied().unwrap_or(0));
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::broker_directory::{MaintenanceState, NodeCommand};
    use std::time::Duration;

    fn config() -> LeaderBalancerConfig {
        LeaderBalancerConfig {
            enabled: true,
            interval: Duration::from_secs(60),
            tolerance: 1.0,
            max_concurrent_transfers: 64,
            max_follower_lag: 100,
            transfer_cooldown: Duration::from_secs(300),
        }
    }

    fn register(state: &mut ClusterState, id: i32, cores: u32) {
        state.directory.apply(NodeCommand::Register {
            node_id: NodeId(id),
            rack: None,
            cores,
            timestamp_ms: 0,
        });
    }

    /// `a_leaders` partitions led by node 1, `b_leaders` by node 2, all
    /// replicated on both. Followers are caught up unless listed in `lagging`.
    fn two_node_cluster(a_leaders: i32, b_leaders: i32, lagging: &[i32]) -> ClusterState {
        let mut state = ClusterState::new();
        register(&mut state, 1, 1);
        register(&mut state, 2, 1);
        let a = BrokerShard::new(NodeId(1), 0);
        let b = BrokerShard::new(NodeId(2), 0);

        let mut placements = Vec::new();
        for _ in 0..a_leaders {
            placements.push(vec![a, b]);
        }
        for _ in 0..b_leaders {
            placements.push(vec![b, a]);
        }
        let ntps = state
            .partitions
            .create_topic("kafka", "t", 2, placements, 0)
            .unwrap();

        for ntp in &ntps {
            let p = state.partitions.get(ntp).unwrap().clone();
            let leader = p.leader.unwrap();
            let follower = p.replicas[1].node_id;
            state.partitions.record_progress(ntp, leader, 1000, None);
            let follower_pos = if lagging.contains(&ntp.partition) { 0 } else { 990 };
            state.partitions.record_progress(ntp, follower, follower_pos, None);
        }
        state
    }

    fn count(decision: &LeaderBalanceDecision, node: i32) -> usize {
        decision.leaders_after[&BrokerShard::new(NodeId(node), 0)]
    }

    #[test]
    fn test_converges_ten_to_two() {
        let state = two_node_cluster(10, 2, &[]);
        let balancer = LeaderBalancer::new(config());
        let decision = balancer.plan(&state, &BTreeSet::new(), 0, Instant::now());

        assert_eq!(decision.mean, 6.0);
        assert_eq!(decision.transfers.len(), 4);
        assert_eq!(count(&decision, 1), 6);
        assert_eq!(count(&decision, 2), 6);
        assert!(decision.transfers.iter().all(|t| t.to.node_id == NodeId(2)));
    }

    #[test]
    fn test_never_targets_lagging_follower() {
        // Partitions 0..=7 have a lagging follower, only 8 and 9 can move
        let state = two_node_cluster(10, 2, &[0, 1, 2, 3, 4, 5, 6, 7]);
        let balancer = LeaderBalancer::new(config());
        let decision = balancer.plan(&state, &BTreeSet::new(), 0, Instant::now());

        assert_eq!(decision.transfers.len(), 2);
        for transfer in &decision.transfers {
            assert!(transfer.lag <= 100);
            assert!(transfer.ntp.partition >= 8);
        }
    }

    #[test]
    fn test_balanced_cluster_is_left_alone() {
        let state = two_node_cluster(3, 2, &[]);
        let balancer = LeaderBalancer::new(config());
        let decision = balancer.plan(&state, &BTreeSet::new(), 0, Instant::now());
        assert!(decision.is_balanced());
    }

    #[test]
    fn test_transfer_cap_and_busy_partitions() {
        let state = two_node_cluster(10, 2, &[]);
        let mut cfg = config();
        cfg.max_concurrent_transfers = 3;
        let balancer = LeaderBalancer::new(cfg);

        let decision = balancer.plan(&state, &BTreeSet::new(), 2, Instant::now());
        assert_eq!(decision.transfers.len(), 1);

        let busy: BTreeSet<Ntp> = (0..10).map(|p| Ntp::kafka("t", p)).collect();
        let decision = balancer.plan(&state, &busy, 0, Instant::now());
        assert!(decision.transfers.is_empty());
    }

    #[test]
    fn test_cooldown_skips_recent_transfers() {
        let state = two_node_cluster(10, 2, &[]);
        let mut balancer = LeaderBalancer::new(config());
        let now = Instant::now();
        for p in 0..10 {
            balancer.record_transfer(&Ntp::kafka("t", p), now);
        }
        assert!(balancer.plan(&state, &BTreeSet::new(), 0, now).is_balanced());

        let later = now + Duration::from_secs(301);
        balancer.cleanup_cooldowns(later);
        assert_eq!(balancer.active_cooldown_count(), 0);
        assert_eq!(balancer.plan(&state, &BTreeSet::new(), 0, later).transfers.len(), 4);
    }

    #[test]
    fn test_maintenance_node_is_not_a_target() {
        let mut state = two_node_cluster(10, 2, &[]);
        state.directory.apply(NodeCommand::SetMaintenance {
            node_id: NodeId(2),
            maintenance: MaintenanceState::Active,
        });
        let balancer = LeaderBalancer::new(config());
        assert!(
            balancer
                .plan(&state, &BTreeSet::new(), 0, Instant::now())
                .is_balanced()
        );
    }

    #[test]
    fn test_validate_manual() {
        let mut state = two_node_cluster(1, 0, &[]);
        register(&mut state, 3, 1);
        let balancer = LeaderBalancer::new(config());
        let ntp = Ntp::kafka("t", 0);

        assert_eq!(
            balancer.validate_manual(&state, &ntp, Some(NodeId(2))).unwrap(),
            NodeId(2)
        );
        assert_eq!(balancer.validate_manual(&state, &ntp, None).unwrap(), NodeId(2));

        let err = balancer
            .validate_manual(&state, &ntp, Some(NodeId(3)))
            .unwrap_err();
        assert!(matches!(err, ControllerError::InvalidLeadershipTarget { .. }));

        state.partitions.record_progress(&ntp, NodeId(2), 0, None);
        let err = balancer
            .validate_manual(&state, &ntp, Some(NodeId(2)))
            .unwrap_err();
        assert!(err.to_string().contains("lags"));
        assert!(balancer.validate_manual(&state, &ntp, None).is_err());
    }
}
