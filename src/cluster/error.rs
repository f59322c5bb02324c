//! Error types for the cluster control plane.
//!
//! # Error Handling Patterns
//!
//! The control plane uses two patterns depending on who asked for the work:
//!
//! ## Fail-Fast (Propagate Errors)
//!
//! Used for explicit requests where the caller must learn about the problem:
//! - Admin replica-set changes and leadership transfers
//! - Cancel / force-abort of a reconfiguration
//! - Node lifecycle transitions (decommission, maintenance)
//! - Topic creation
//!
//! ## Record-and-Continue
//!
//! Used inside background passes where one bad partition must not stop the rest:
//! - Allocation failures during planning are recorded per partition and surfaced
//!   through the planner status and decommission progress
//! - Transient node errors are retried on a schedule; only exhausting the retry
//!   ceiling marks the operation failed
//! - Stale-revision reports are dropped silently; they are a consistency guard,
//!   not an error
//!
//! ## Guidelines
//!
//! - **Admin path**: always fail-fast with a typed error
//! - **Planner path**: record the failure and keep planning
//! - **Dispatch path**: classify with [`DispatchError::is_retriable`]

use thiserror::Error;

use crate::types::{NodeId, Ntp, Revision};

/// Result type for control-plane operations.
pub type ControllerResult<T> = Result<T, ControllerError>;

/// Errors returned by the partition allocator.
///
/// These never abort a planning pass; the caller records them against the
/// partition and moves on.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AllocationError {
    /// Not enough eligible nodes to place the requested replicas.
    #[error(
        "Insufficient capacity for {ntp}: requested {requested} replicas, {available} eligible nodes"
    )]
    InsufficientCapacity {
        ntp: Ntp,
        requested: usize,
        available: usize,
    },

    /// Replication factor of zero or a replica set larger than the cluster.
    #[error("Invalid replication factor {replication_factor} for {ntp}")]
    InvalidReplicationFactor { ntp: Ntp, replication_factor: usize },

    /// The replica to reallocate is not part of the partition's replica set.
    #[error("Node {node_id} does not host a replica of {ntp}")]
    ReplicaNotFound { ntp: Ntp, node_id: NodeId },
}

/// Errors returned by a node when the reconciler dispatches an operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// The node did not answer within the dispatch timeout.
    #[error("Dispatch to node {node_id} timed out")]
    Timeout { node_id: NodeId },

    /// The node is temporarily unable to accept work.
    #[error("Node {node_id} unavailable: {reason}")]
    Unavailable { node_id: NodeId, reason: String },

    /// The node refused the operation outright.
    #[error("Node {node_id} rejected operation: {reason}")]
    Rejected { node_id: NodeId, reason: String },
}

impl DispatchError {
    /// Transient errors are retried with backoff; a rejection is final.
    #[inline]
    pub fn is_retriable(&self) -> bool {
        match self {
            DispatchError::Timeout { .. } => true,
            DispatchError::Unavailable { .. } => true,
            DispatchError::Rejected { .. } => false,
        }
    }

    pub fn node_id(&self) -> NodeId {
        match self {
            DispatchError::Timeout { node_id }
            | DispatchError::Unavailable { node_id, .. }
            | DispatchError::Rejected { node_id, .. } => *node_id,
        }
    }
}

/// Errors that can occur in the control plane.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// This instance is not the elected controller.
    #[error("Not the controller leader")]
    NotLeader,

    /// Partition not found.
    #[error("Partition {ntp} not found")]
    PartitionNotFound { ntp: Ntp },

    #[error("Topic {namespace}/{topic} not found")]
    TopicNotFound { namespace: String, topic: String },

    /// Topic already exists.
    #[error("Topic {namespace}/{topic} already exists")]
    TopicAlreadyExists { namespace: String, topic: String },

    /// Node not registered in the broker directory.
    #[error("Node {node_id} not found")]
    NodeNotFound { node_id: NodeId },

    /// Node was removed from the cluster and can no longer be used.
    #[error("Node {node_id} was removed from the cluster")]
    NodeRemoved { node_id: NodeId },

    /// Requested replica set is malformed.
    #[error("Invalid replica set for {ntp}: {reason}")]
    InvalidReplicaSet { ntp: Ntp, reason: String },

    /// Cancel/abort requested but nothing is moving.
    #[error("No reconfiguration in progress for {ntp}")]
    NoReconfigurationInProgress { ntp: Ntp },

    /// The request conflicts with an active reconfiguration.
    #[error("Reconfiguration of {ntp} at revision {revision} in progress")]
    ReconfigurationInProgress { ntp: Ntp, revision: Revision },

    /// Node lifecycle transition not allowed from the current state.
    #[error("Node {node_id} cannot go from {from} to {to}")]
    InvalidNodeTransition {
        node_id: NodeId,
        from: String,
        to: String,
    },

    /// Leadership target is not an eligible, up-to-date replica.
    #[error("Cannot transfer leadership of {ntp} to node {node_id}: {reason}")]
    InvalidLeadershipTarget {
        ntp: Ntp,
        node_id: NodeId,
        reason: String,
    },

    /// No valid placement exists.
    #[error("Allocation failed: {0}")]
    Allocation(#[from] AllocationError),

    /// Durable assignment store failure.
    #[error("Assignment store error: {0}")]
    Store(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ControllerError {
    /// Status code the admin HTTP layer returns for this error.
    ///
    /// | ControllerError                 | Status |
    /// |---------------------------------|--------|
    /// | PartitionNotFound/NodeNotFound  | 404    |
    /// | InvalidReplicaSet/Config/...    | 400    |
    /// | ReconfigurationInProgress/...   | 409    |
    /// | NotLeader                       | 503    |
    /// | Store                           | 500    |
    pub fn http_status(&self) -> u16 {
        match self {
            ControllerError::PartitionNotFound { .. } => 404,
            ControllerError::TopicNotFound { .. } => 404,
            ControllerError::NodeNotFound { .. } => 404,

            ControllerError::InvalidReplicaSet { .. } => 400,
            ControllerError::InvalidLeadershipTarget { .. } => 400,
            ControllerError::Allocation(_) => 400,
            ControllerError::Config(_) => 400,

            ControllerError::TopicAlreadyExists { .. } => 409,
            ControllerError::NodeRemoved { .. } => 409,
            ControllerError::NoReconfigurationInProgress { .. } => 409,
            ControllerError::ReconfigurationInProgress { .. } => 409,
            ControllerError::InvalidNodeTransition { .. } => 409,

            // Clients should find the current controller and retry there
            ControllerError::NotLeader => 503,

            ControllerError::Store(_) => 500,
        }
    }

    /// Check if a client may retry the same request later.
    #[inline]
    pub fn is_retriable(&self) -> bool {
        matches!(self, ControllerError::NotLeader | ControllerError::Store(_))
    }

    #[inline]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ControllerError::PartitionNotFound { .. } | ControllerError::NodeNotFound { .. }
        )
    }
}
