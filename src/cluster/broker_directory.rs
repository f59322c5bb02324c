//! Broker directory: node metadata consumed by every planning component.
//!
//! Handles node registration, heartbeats (liveness and disk samples) and the
//! membership/maintenance flags that lifecycle transitions flip. All mutations
//! go through [`NodeCommand`] so the directory can be replayed from a log.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::cluster::store::NodeRecord;
use crate::types::NodeId;

/// Membership of a node in the cluster.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MembershipState {
    Active,
    /// Node is shutting down; no new placements.
    Draining,
    /// Replicas are being evacuated before removal.
    Decommissioning,
    /// Terminal. The id is never placed on again.
    Removed,
}

impl fmt::Display for MembershipState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MembershipState::Active => write!(f, "active"),
            MembershipState::Draining => write!(f, "draining"),
            MembershipState::Decommissioning => write!(f, "decommissioning"),
            MembershipState::Removed => write!(f, "removed"),
        }
    }
}

/// Maintenance mode of a node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum MaintenanceState {
    #[default]
    Inactive,
    Active,
}

impl fmt::Display for MaintenanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaintenanceState::Inactive => write!(f, "inactive"),
            MaintenanceState::Active => write!(f, "maintenance"),
        }
    }
}

/// Free/total space of one data directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiskSample {
    pub path: String,
    pub free_bytes: u64,
    pub total_bytes: u64,
}

impl DiskSample {
    pub fn new(path: impl Into<String>, free_bytes: u64, total_bytes: u64) -> Self {
        Self {
            path: path.into(),
            free_bytes,
            total_bytes,
        }
    }
}

/// Everything the control plane knows about one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub node_id: NodeId,
    pub rack: Option<String>,
    pub cores: u32,
    pub disks: Vec<DiskSample>,
    pub is_alive: bool,
    pub membership: MembershipState,
    pub maintenance: MaintenanceState,
    pub registered_at_ms: u64,
    pub last_heartbeat_ms: u64,
}

impl NodeMetadata {
    /// Total capacity across all data directories.
    pub fn total_bytes(&self) -> u64 {
        self.disks.iter().map(|d| d.total_bytes).sum()
    }

    /// Used bytes across all data directories.
    pub fn used_bytes(&self) -> u64 {
        self.disks
            .iter()
            .map(|d| d.total_bytes.saturating_sub(d.free_bytes))
            .sum()
    }

    /// Fraction of disk space in use, 0.0 when no samples were reported.
    pub fn disk_usage_ratio(&self) -> f64 {
        let total = self.total_bytes();
        if total == 0 {
            return 0.0;
        }
        self.used_bytes() as f64 / total as f64
    }

    /// Whether new replicas may be placed on this node.
    pub fn is_allocatable(&self) -> bool {
        self.is_alive
            && self.membership == MembershipState::Active
            && self.maintenance == MaintenanceState::Inactive
    }

    /// Whether this node may receive partition leadership.
    pub fn can_lead(&self) -> bool {
        self.is_alive
            && self.maintenance == MaintenanceState::Inactive
            && matches!(
                self.membership,
                MembershipState::Active | MembershipState::Decommissioning
            )
    }

    pub fn is_removed(&self) -> bool {
        self.membership == MembershipState::Removed
    }
}

/// Commands for the broker directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeCommand {
    /// Register a node (or refresh the static properties of a known one).
    Register {
        node_id: NodeId,
        rack: Option<String>,
        cores: u32,
        timestamp_ms: u64,
    },

    /// Liveness + disk report from a node.
    Heartbeat {
        node_id: NodeId,
        disks: Vec<DiskSample>,
        timestamp_ms: u64,
    },

    /// Explicit liveness change (from the failure detector).
    SetLiveness { node_id: NodeId, is_alive: bool },

    /// Lifecycle-driven membership change.
    SetMembership {
        node_id: NodeId,
        membership: MembershipState,
    },

    /// Lifecycle-driven maintenance change.
    SetMaintenance {
        node_id: NodeId,
        maintenance: MaintenanceState,
    },
}

/// Responses from broker directory operations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeResponse {
    Registered { node_id: NodeId },
    HeartbeatAck,
    /// Liveness flipped; the planner should be triggered.
    LivenessChanged { node_id: NodeId, is_alive: bool },
    Updated { node_id: NodeId },
    NotFound { node_id: NodeId },
    /// The id belongs to a removed node and cannot rejoin.
    Rejected { node_id: NodeId },
}

/// Node table of the cluster.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BrokerDirectory {
    nodes: BTreeMap<NodeId, NodeMetadata>,
}

impl BrokerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a directory command and return the response.
    pub fn apply(&mut self, cmd: NodeCommand) -> NodeResponse {
        match cmd {
            NodeCommand::Register {
                node_id,
                rack,
                cores,
                timestamp_ms,
            } => {
                if let Some(node) = self.nodes.get_mut(&node_id) {
                    if node.is_removed() {
                        return NodeResponse::Rejected { node_id };
                    }
                    node.rack = rack;
                    node.cores = cores.max(1);
                    node.is_alive = true;
                    node.last_heartbeat_ms = timestamp_ms;
                    return NodeResponse::Registered { node_id };
                }

                self.nodes.insert(
                    node_id,
                    NodeMetadata {
                        node_id,
                        rack,
                        cores: cores.max(1),
                        disks: Vec::new(),
                        is_alive: true,
                        membership: MembershipState::Active,
                        maintenance: MaintenanceState::Inactive,
                        registered_at_ms: timestamp_ms,
                        last_heartbeat_ms: timestamp_ms,
                    },
                );
                NodeResponse::Registered { node_id }
            }

            NodeCommand::Heartbeat {
                node_id,
                disks,
                timestamp_ms,
            } => match self.nodes.get_mut(&node_id) {
                Some(node) if node.is_removed() => NodeResponse::Rejected { node_id },
                Some(node) => {
                    node.last_heartbeat_ms = node.last_heartbeat_ms.max(timestamp_ms);
                    if !disks.is_empty() {
                        node.disks = disks;
                    }
                    if !node.is_alive {
                        node.is_alive = true;
                        return NodeResponse::LivenessChanged {
                            node_id,
                            is_alive: true,
                        };
                    }
                    NodeResponse::HeartbeatAck
                }
                None => NodeResponse::NotFound { node_id },
            },

            NodeCommand::SetLiveness { node_id, is_alive } => match self.nodes.get_mut(&node_id) {
                Some(node) => {
                    if node.is_alive == is_alive {
                        return NodeResponse::Updated { node_id };
                    }
                    node.is_alive = is_alive;
                    NodeResponse::LivenessChanged { node_id, is_alive }
                }
                None => NodeResponse::NotFound { node_id },
            },

            NodeCommand::SetMembership {
                node_id,
                membership,
            } => match self.nodes.get_mut(&node_id) {
                Some(node) if node.is_removed() => NodeResponse::Rejected { node_id },
                Some(node) => {
                    node.membership = membership;
                    NodeResponse::Updated { node_id }
                }
                None => NodeResponse::NotFound { node_id },
            },

            NodeCommand::SetMaintenance {
                node_id,
                maintenance,
            } => match self.nodes.get_mut(&node_id) {
                Some(node) => {
                    node.maintenance = maintenance;
                    NodeResponse::Updated { node_id }
                }
                None => NodeResponse::NotFound { node_id },
            },
        }
    }

    /// Reinstate a node from its durable record after a controller handover.
    ///
    /// Unknown nodes come back alive with a fresh heartbeat so they get a full
    /// liveness timeout to report in before anything is evacuated.
    pub fn restore(&mut self, record: &NodeRecord, now_ms: u64) {
        let node = self
            .nodes
            .entry(record.node_id)
            .or_insert_with(|| NodeMetadata {
                node_id: record.node_id,
                rack: record.rack.clone(),
                cores: record.cores.max(1),
                disks: Vec::new(),
                is_alive: true,
                membership: MembershipState::Active,
                maintenance: MaintenanceState::Inactive,
                registered_at_ms: now_ms,
                last_heartbeat_ms: now_ms,
            });
        node.membership = record.membership;
        node.maintenance = record.maintenance;
    }

    /// Mark nodes dead whose last heartbeat is older than `timeout_ms`.
    ///
    /// Returns the nodes whose liveness flipped.
    pub fn expire_liveness(&mut self, now_ms: u64, timeout_ms: u64) -> Vec<NodeId> {
        let mut expired = Vec::new();
        for node in self.nodes.values_mut() {
            if node.is_alive
                && !node.is_removed()
                && now_ms.saturating_sub(node.last_heartbeat_ms) > timeout_ms
            {
                node.is_alive = false;
                expired.push(node.node_id);
            }
        }
        expired
    }

    pub fn get(&self, node_id: NodeId) -> Option<&NodeMetadata> {
        self.nodes.get(&node_id)
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.nodes.contains_key(&node_id)
    }

    pub fn is_alive(&self, node_id: NodeId) -> bool {
        self.nodes.get(&node_id).is_some_and(|n| n.is_alive)
    }

    /// All nodes, ordered by id.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeMetadata> {
        self.nodes.values()
    }

    /// Nodes that may receive new replicas, ordered by id.
    pub fn allocatable_nodes(&self) -> impl Iterator<Item = &NodeMetadata> {
        self.nodes.values().filter(|n| n.is_allocatable())
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
