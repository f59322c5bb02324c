//! In-memory node dispatcher for testing.
//!
//! Records every dispatched operation and answers according to a per-node
//! [`NodeBehavior`], so tests can simulate slow, failing or unreachable nodes.
//!
//! # Usage
//!
//! This module is available when the `test-utilities` feature is enabled,
//! or during unit tests:
//!
//! ```toml
//! [dev-dependencies]
//! shardctl = { path = ".", features = ["test-utilities"] }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::RwLock;

use super::error::DispatchError;
use super::reconciler::{DispatchAck, OperationKind, OperationRequest};
use super::traits::NodeDispatcher;
use crate::types::NodeId;

/// How a simulated node answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeBehavior {
    /// Finish every operation synchronously.
    Complete,
    /// Accept and never report; the test delivers reports itself.
    Accept,
    /// Fail with a transient error `remaining` more times, then complete.
    /// `None` fails forever.
    FailTransient { remaining: Option<u32> },
    /// Refuse with a permanent error.
    Reject { reason: String },
    /// Never answer; the controller's dispatch timeout fires.
    Hang,
}

#[derive(Debug)]
pub struct MockNodeDispatcher {
    behaviors: DashMap<NodeId, NodeBehavior>,
    dispatched: RwLock<Vec<OperationRequest>>,
    dispatch_count: AtomicU64,
}

impl Default for MockNodeDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl MockNodeDispatcher {
    pub fn new() -> Self {
        Self {
            behaviors: DashMap::new(),
            dispatched: RwLock::new(Vec::new()),
            dispatch_count: AtomicU64::new(0),
        }
    }

    /// Set how `node_id` answers from now on.
    pub fn set_behavior(&self, node_id: NodeId, behavior: NodeBehavior) {
        self.behaviors.insert(node_id, behavior);
    }

    pub fn behavior(&self, node_id: NodeId) -> NodeBehavior {
        self.behaviors
            .get(&node_id)
            .map(|b| b.value().clone())
            .unwrap_or(NodeBehavior::Complete)
    }

    /// Every request seen so far, in dispatch order.
    pub async fn dispatched(&self) -> Vec<OperationRequest> {
        self.dispatched.read().await.clone()
    }

    /// Requests sent to `node_id`.
    pub async fn dispatched_to(&self, node_id: NodeId) -> Vec<OperationRequest> {
        self.dispatched
            .read()
            .await
            .iter()
            .filter(|r| r.shard.node_id == node_id)
            .cloned()
            .collect()
    }

    /// Leadership transfers requested so far.
    pub async fn leadership_transfers(&self) -> Vec<OperationRequest> {
        self.dispatched
            .read()
            .await
            .iter()
            .filter(|r| matches!(r.kind, OperationKind::TransferLeadership { .. }))
            .cloned()
            .collect()
    }

    pub fn dispatch_count(&self) -> u64 {
        self.dispatch_count.load(Ordering::SeqCst)
    }

    pub async fn clear(&self) {
        self.dispatched.write().await.clear();
    }

    /// Consume one transient failure if the node is configured to fail.
    fn next_answer(&self, node_id: NodeId) -> NodeBehavior {
        let Some(mut entry) = self.behaviors.get_mut(&node_id) else {
            return NodeBehavior::Complete;
        };
        let answer = entry.value().clone();
        let next = match &answer {
            NodeBehavior::FailTransient {
                remaining: Some(remaining),
            } if *remaining <= 1 => Some(NodeBehavior::Complete),
            NodeBehavior::FailTransient {
                remaining: Some(remaining),
            } => Some(NodeBehavior::FailTransient {
                remaining: Some(remaining - 1),
            }),
            _ => None,
        };
        if let Some(next) = next {
            *entry = next;
        }
        answer
    }
}

#[async_trait]
impl NodeDispatcher for MockNodeDispatcher {
    async fn dispatch(&self, request: OperationRequest) -> Result<DispatchAck, DispatchError> {
        let node_id = request.shard.node_id;
        self.dispatch_count.fetch_add(1, Ordering::SeqCst);
        self.dispatched.write().await.push(request);

        match self.next_answer(node_id) {
            NodeBehavior::Complete => Ok(DispatchAck::Completed),
            NodeBehavior::Accept => Ok(DispatchAck::Accepted),
            NodeBehavior::FailTransient { remaining: Some(0) } => Ok(DispatchAck::Completed),
            NodeBehavior::FailTransient { .. } => Err(DispatchError::Unavailable {
                node_id,
                reason: "simulated transient failure".to_string(),
            }),
            NodeBehavior::Reject { reason } => Err(DispatchError::Rejected { node_id, reason }),
            NodeBehavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(DispatchError::Timeout { node_id })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BrokerShard, GroupId, Ntp, Revision};

    fn request(node: i32) -> OperationRequest {
        OperationRequest {
            ntp: Ntp::kafka("t", 0),
            group_id: GroupId(1),
            revision: Revision(1),
            shard: BrokerShard::new(NodeId(node), 0),
            kind: OperationKind::RemoveReplica,
            retry_number: 0,
        }
    }

    #[tokio::test]
    async fn test_records_and_completes_by_default() {
        let dispatcher = MockNodeDispatcher::new();
        let ack = dispatcher.dispatch(request(1)).await.unwrap();
        assert_eq!(ack, DispatchAck::Completed);
        assert_eq!(dispatcher.dispatched_to(NodeId(1)).await.len(), 1);
        assert_eq!(dispatcher.dispatch_count(), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_run_out() {
        let dispatcher = MockNodeDispatcher::new();
        dispatcher.set_behavior(NodeId(2), NodeBehavior::FailTransient { remaining: Some(2) });

        assert!(dispatcher.dispatch(request(2)).await.is_err());
        assert!(dispatcher.dispatch(request(2)).await.is_err());
        assert!(dispatcher.dispatch(request(2)).await.is_ok());
        assert_eq!(dispatcher.behavior(NodeId(2)), NodeBehavior::Complete);
    }

    #[tokio::test]
    async fn test_reject_is_permanent() {
        let dispatcher = MockNodeDispatcher::new();
        dispatcher.set_behavior(
            NodeId(3),
            NodeBehavior::Reject {
                reason: "no".into(),
            },
        );
        let err = dispatcher.dispatch(request(3)).await.unwrap_err();
        assert!(!err.is_retriable());
    }
}
