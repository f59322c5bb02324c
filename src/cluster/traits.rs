//! Collaborator traits at the edge of the control plane.
//!
//! The controller never talks to nodes or disks directly. It goes through:
//!
//! - [`NodeDispatcher`]: delivers one reconciliation operation to a node
//! - [`AssignmentStore`]: durable per-partition assignment records and node
//!   lifecycle records, read back when a controller takes over
//!
//! # Available Implementations
//!
//! - [`InMemoryAssignmentStore`](super::store::InMemoryAssignmentStore): process-local store
//! - [`MockNodeDispatcher`](super::mock_dispatcher::MockNodeDispatcher): records
//!   dispatched operations and injects failures (tests and the
//!   `test-utilities` feature)
//!
//! # Example
//!
//! ```text
//! use shardctl::cluster::NodeDispatcher;
//! use async_trait::async_trait;
//!
//! struct RpcDispatcher { client: NodeClient }
//!
//! #[async_trait]
//! impl NodeDispatcher for RpcDispatcher {
//!     async fn dispatch(&self, request: OperationRequest) -> Result<DispatchAck, DispatchError> {
//!         self.client.send(request).await
//!     }
//! }
//! ```

use async_trait::async_trait;

use super::error::{ControllerResult, DispatchError};
use super::reconciler::{DispatchAck, OperationRequest};
use super::store::{AssignmentRecord, NodeRecord};
use crate::types::{NodeId, Ntp};

/// Sends reconciliation operations to nodes.
///
/// Implementations must be idempotent per `(ntp, shard, revision)`: the
/// controller re-sends an operation after a timeout even if the first attempt
/// reached the node.
#[async_trait]
pub trait NodeDispatcher: Send + Sync {
    /// Deliver one operation.
    ///
    /// Returning `Ok(DispatchAck::Accepted)` promises a later completion report
    /// for the same revision. The controller bounds the call with its dispatch
    /// timeout.
    async fn dispatch(&self, request: OperationRequest) -> Result<DispatchAck, DispatchError>;
}

/// Durable record of partition assignments and node lifecycle state.
#[async_trait]
pub trait AssignmentStore: Send + Sync {
    /// Write (or overwrite) assignment records.
    async fn save_assignments(&self, records: Vec<AssignmentRecord>) -> ControllerResult<()>;

    /// Remove assignment records of deleted partitions.
    async fn delete_assignments(&self, ntps: Vec<Ntp>) -> ControllerResult<()>;

    /// All assignment records.
    async fn load_assignments(&self) -> ControllerResult<Vec<AssignmentRecord>>;

    /// Write (or overwrite) a node's lifecycle record.
    async fn save_node(&self, record: NodeRecord) -> ControllerResult<()>;

    /// All node lifecycle records.
    async fn load_nodes(&self) -> ControllerResult<Vec<NodeRecord>>;

    /// Fetch one node record.
    async fn get_node(&self, node_id: NodeId) -> ControllerResult<Option<NodeRecord>> {
        Ok(self
            .load_nodes()
            .await?
            .into_iter()
            .find(|record| record.node_id == node_id))
    }
}
