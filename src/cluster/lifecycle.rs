//! Node lifecycle: decommission and maintenance.
//!
//! ```text
//! Active <-> Maintenance          (leadership drained, replicas stay)
//! Active -> Decommissioning -> Removed
//!               |
//!               +-> Active        (recommission)
//! ```
//!
//! Decommissioning only flips the membership flag; the planner sees the flag
//! and evacuates the node's replicas. Progress is refreshed after every
//! planner pass from the partition table and the pass's allocation failures.
//! The node becomes `Removed` once the partition table no longer lists it in
//! any replica set and no active move still names it. `Removed` is terminal.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{info, warn};

use super::broker_directory::{MaintenanceState, MembershipState, NodeCommand};
use super::error::{ControllerError, ControllerResult};
use super::leader_balancer::LeaderBalancer;
use super::metrics;
use super::planner::PlanResult;
use super::state::ClusterState;
use crate::types::{NodeId, Ntp};

/// Progress of a decommission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecommissionStatus {
    pub node_id: NodeId,
    /// Replicas still hosted by the node.
    pub replicas_left: usize,
    /// Partitions the last planner pass could not place elsewhere.
    pub allocation_failures: Vec<Ntp>,
    pub finished: bool,
    /// Removal was forced by an operator.
    pub forced: bool,
}

/// Progress of a maintenance leadership drain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaintenanceStatus {
    pub node_id: NodeId,
    pub active: bool,
    /// Partitions the node led when maintenance started.
    pub eligible: usize,
    /// Partitions still led by the node with a transfer under way.
    pub transferring: usize,
    /// Partitions still led by the node with no replica able to take over.
    pub failed: usize,
    /// The node leads nothing.
    pub finished: bool,
}

#[derive(Debug, Clone, Default)]
struct DecommissionRecord {
    allocation_failures: Vec<Ntp>,
    finished: bool,
    forced: bool,
}

#[derive(Debug, Clone, Default)]
struct MaintenanceRecord {
    eligible: usize,
    failed: BTreeSet<Ntp>,
}

/// Drives node decommission and maintenance state machines.
#[derive(Debug, Default)]
pub struct NodeLifecycle {
    decommissions: BTreeMap<NodeId, DecommissionRecord>,
    maintenance: BTreeMap<NodeId, MaintenanceRecord>,
}

impl NodeLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start evacuating a node. Idempotent.
    pub fn decommission(&mut self, state: &mut ClusterState, node_id: NodeId) -> ControllerResult<()> {
        let node = state
            .directory
            .get(node_id)
            .ok_or(ControllerError::NodeNotFound { node_id })?;

        match node.membership {
            MembershipState::Removed => return Err(ControllerError::NodeRemoved { node_id }),
            MembershipState::Decommissioning => return Ok(()),
            MembershipState::Active | MembershipState::Draining => {}
        }

        state.directory.apply(NodeCommand::SetMembership {
            node_id,
            membership: MembershipState::Decommissioning,
        });
        self.decommissions.insert(node_id, DecommissionRecord::default());

        info!(
            node_id = %node_id,
            replicas = state.partitions.partitions_on(node_id).len(),
            "Node decommissioning started"
        );
        self.update_gauges(state);
        Ok(())
    }

    /// Stop a decommission and return the node to service.
    ///
    /// Moves already under way are not touched here; the controller cancels
    /// the ones that involve this node.
    pub fn recommission(&mut self, state: &mut ClusterState, node_id: NodeId) -> ControllerResult<()> {
        let node = state
            .directory
            .get(node_id)
            .ok_or(ControllerError::NodeNotFound { node_id })?;

        if node.membership != MembershipState::Decommissioning {
            return Err(ControllerError::InvalidNodeTransition {
                node_id,
                from: node.membership.to_string(),
                to: MembershipState::Active.to_string(),
            });
        }

        state.directory.apply(NodeCommand::SetMembership {
            node_id,
            membership: MembershipState::Active,
        });
        self.decommissions.remove(&node_id);

        info!(node_id = %node_id, "Node recommissioned");
        self.update_gauges(state);
        Ok(())
    }

    /// Stop placing new replicas on a node without evacuating it. Idempotent.
    pub fn drain(&mut self, state: &mut ClusterState, node_id: NodeId) -> ControllerResult<()> {
        self.set_draining(state, node_id, true)
    }

    /// Make a draining node a placement target again. Idempotent.
    pub fn undrain(&mut self, state: &mut ClusterState, node_id: NodeId) -> ControllerResult<()> {
        self.set_draining(state, node_id, false)
    }

    fn set_draining(
        &mut self,
        state: &mut ClusterState,
        node_id: NodeId,
        draining: bool,
    ) -> ControllerResult<()> {
        let node = state
            .directory
            .get(node_id)
            .ok_or(ControllerError::NodeNotFound { node_id })?;
        let (from, to) = if draining {
            (MembershipState::Active, MembershipState::Draining)
        } else {
            (MembershipState::Draining, MembershipState::Active)
        };

        match node.membership {
            current if current == to => return Ok(()),
            MembershipState::Removed => return Err(ControllerError::NodeRemoved { node_id }),
            current if current != from => {
                return Err(ControllerError::InvalidNodeTransition {
                    node_id,
                    from: current.to_string(),
                    to: to.to_string(),
                });
            }
            _ => {}
        }

        state.directory.apply(NodeCommand::SetMembership {
            node_id,
            membership: to,
        });
        info!(node_id = %node_id, membership = %to, "Node membership changed");
        Ok(())
    }

    /// Remove a decommissioning node even though it still hosts replicas.
    ///
    /// Its remaining replicas are treated as lost and evacuated by the planner.
    pub fn force_remove(&mut self, state: &mut ClusterState, node_id: NodeId) -> ControllerResult<()> {
        let node = state
            .directory
            .get(node_id)
            .ok_or(ControllerError::NodeNotFound { node_id })?;

        match node.membership {
            MembershipState::Removed => return Ok(()),
            MembershipState::Decommissioning => {}
            other => {
                return Err(ControllerError::InvalidNodeTransition {
                    node_id,
                    from: other.to_string(),
                    to: MembershipState::Removed.to_string(),
                });
            }
        }

        let replicas_left = state.partitions.partitions_on(node_id).len();
        state.directory.apply(NodeCommand::SetMembership {
            node_id,
            membership: MembershipState::Removed,
        });
        let record = self.decommissions.entry(node_id).or_default();
        record.finished = true;
        record.forced = true;

        warn!(
            node_id = %node_id,
            replicas_left,
            "Node removal forced by operator"
        );
        self.update_gauges(state);
        Ok(())
    }

    /// Refresh decommission progress after a planner pass.
    ///
    /// `moving` holds the nodes named by active replica moves; such a node may
    /// still gain a replica and is not removed yet. Returns nodes that
    /// finished evacuation and are now `Removed`.
    pub fn update_decommissions(
        &mut self,
        state: &mut ClusterState,
        plan: Option<&PlanResult>,
        moving: &BTreeSet<NodeId>,
    ) -> Vec<NodeId> {
        let mut removed = Vec::new();

        for (node_id, record) in self.decommissions.iter_mut() {
            if record.finished {
                continue;
            }
            let decommissioning = state
                .directory
                .get(*node_id)
                .is_some_and(|n| n.membership == MembershipState::Decommissioning);
            if !decommissioning {
                continue;
            }

            if let Some(plan) = plan {
                record.allocation_failures = plan.failures_for(*node_id);
            }

            let hosted = state.partitions.partitions_on(*node_id);
            if hosted.is_empty() && !moving.contains(node_id) {
                state.directory.apply(NodeCommand::SetMembership {
                    node_id: *node_id,
                    membership: MembershipState::Removed,
                });
                record.finished = true;
                record.allocation_failures.clear();
                info!(node_id = %node_id, "Node decommissioned");
                removed.push(*node_id);
            } else if !record.allocation_failures.is_empty() {
                warn!(
                    node_id = %node_id,
                    replicas_left = hosted.len(),
                    allocation_failures = record.allocation_failures.len(),
                    "Decommission stalled, replicas cannot be placed elsewhere"
                );
            }
        }

        if !removed.is_empty() {
            self.update_gauges(state);
        }
        removed
    }

    /// Decommission progress, or `None` if the node was never decommissioned.
    pub fn decommission_status(&self, state: &ClusterState, node_id: NodeId) -> Option<DecommissionStatus> {
        let record = self.decommissions.get(&node_id)?;
        Some(DecommissionStatus {
            node_id,
            replicas_left: state.partitions.partitions_on(node_id).len(),
            allocation_failures: record.allocation_failures.clone(),
            finished: record.finished,
            forced: record.forced,
        })
    }

    pub fn decommissioning_nodes(&self) -> Vec<NodeId> {
        self.decommissions
            .iter()
            .filter(|(_, r)| !r.finished)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Put a node into maintenance. Idempotent.
    pub fn start_maintenance(&mut self, state: &mut ClusterState, node_id: NodeId) -> ControllerResult<()> {
        let node = state
            .directory
            .get(node_id)
            .ok_or(ControllerError::NodeNotFound { node_id })?;
        if node.is_removed() {
            return Err(ControllerError::NodeRemoved { node_id });
        }
        if node.maintenance == MaintenanceState::Active {
            return Ok(());
        }

        state.directory.apply(NodeCommand::SetMaintenance {
            node_id,
            maintenance: MaintenanceState::Active,
        });
        let eligible = state.partitions.led_by(node_id).len();
        self.maintenance.insert(
            node_id,
            MaintenanceRecord {
                eligible,
                failed: BTreeSet::new(),
            },
        );

        info!(node_id = %node_id, eligible, "Node entering maintenance");
        self.update_gauges(state);
        Ok(())
    }

    /// Take a node out of maintenance. Idempotent.
    pub fn stop_maintenance(&mut self, state: &mut ClusterState, node_id: NodeId) -> ControllerResult<()> {
        let node = state
            .directory
            .get(node_id)
            .ok_or(ControllerError::NodeNotFound { node_id })?;
        if node.maintenance == MaintenanceState::Inactive {
            return Ok(());
        }

        state.directory.apply(NodeCommand::SetMaintenance {
            node_id,
            maintenance: MaintenanceState::Inactive,
        });
        self.maintenance.remove(&node_id);

        info!(node_id = %node_id, "Node leaving maintenance");
        self.update_gauges(state);
        Ok(())
    }

    /// Leadership transfers needed to drain nodes in maintenance.
    ///
    /// Partitions in `busy` are skipped. Partitions with no eligible target
    /// are remembered as failed until a later pass finds one.
    pub fn drain_transfers(
        &mut self,
        state: &ClusterState,
        balancer: &LeaderBalancer,
        busy: &BTreeSet<Ntp>,
    ) -> Vec<(Ntp, NodeId)> {
        let mut transfers = Vec::new();

        for (node_id, record) in self.maintenance.iter_mut() {
            record.failed.clear();
            for ntp in state.partitions.led_by(*node_id) {
                if busy.contains(&ntp) {
                    continue;
                }
                let Some(partition) = state.partitions.get(&ntp) else {
                    continue;
                };
                match balancer.pick_target(state, partition) {
                    Some(target) => transfers.push((ntp, target)),
                    None => {
                        record.failed.insert(ntp);
                    }
                }
            }
            if !record.failed.is_empty() {
                warn!(
                    node_id = %node_id,
                    failed = record.failed.len(),
                    "Leadership drain found no eligible target for some partitions"
                );
            }
        }

        transfers
    }

    pub fn maintenance_status(
        &self,
        state: &ClusterState,
        node_id: NodeId,
        busy: &BTreeSet<Ntp>,
    ) -> ControllerResult<MaintenanceStatus> {
        let node = state
            .directory
            .get(node_id)
            .ok_or(ControllerError::NodeNotFound { node_id })?;

        let led = state.partitions.led_by(node_id);
        let record = self.maintenance.get(&node_id);
        let failed = record.map(|r| led.iter().filter(|ntp| r.failed.contains(ntp)).count()).unwrap_or(0);
        let transferring = led.iter().filter(|ntp| busy.contains(ntp)).count();

        Ok(MaintenanceStatus {
            node_id,
            active: node.maintenance == MaintenanceState::Active,
            eligible: record.map(|r| r.eligible).unwrap_or(0),
            transferring,
            failed,
            finished: led.is_empty(),
        })
    }

    pub fn maintenance_nodes(&self) -> Vec<NodeId> {
        self.maintenance.keys().copied().collect()
    }

    /// Reload lifecycle bookkeeping from the directory after a handover.
    pub fn restore(&mut self, state: &ClusterState, forced: &BTreeSet<NodeId>) {
        self.decommissions.clear();
        self.maintenance.clear();

        for node in state.directory.nodes() {
            match node.membership {
                MembershipState::Decommissioning => {
                    self.decommissions.insert(node.node_id, DecommissionRecord::default());
                }
                MembershipState::Removed => {
                    self.decommissions.insert(
                        node.node_id,
                        DecommissionRecord {
                            allocation_failures: Vec::new(),
                            finished: true,
                            forced: forced.contains(&node.node_id),
                        },
                    );
                }
                MembershipState::Active | MembershipState::Draining => {}
            }
            if node.maintenance == MaintenanceState::Active {
                self.maintenance.insert(
                    node.node_id,
                    MaintenanceRecord {
                        eligible: state.partitions.led_by(node.node_id).len(),
                        failed: BTreeSet::new(),
                    },
                );
            }
        }
        self.update_gauges(state);
    }

    fn update_gauges(&self, state: &ClusterState) {
        let decommissioning = state
            .directory
            .nodes()
            .filter(|n| n.membership == MembershipState::Decommissioning)
            .count();
        metrics::set_lifecycle_gauges(decommissioning, self.maintenance.len());
    }
}
