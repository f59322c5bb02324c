//! Integration tests for replica moves driven through the controller.
//!
//! Covers cooperative cancellation, operator force-abort, superseding
//! revisions, permanent failures and the quorum floor during a move.

use shardctl::cluster::{
    Controller, ControllerConfig, ControllerError, ControllerProfile, InMemoryAssignmentStore,
    IntentSource, MockNodeDispatcher, NodeBehavior, OperationKind, OperationReport,
    PartitionStatus, ProgressReport, ReconfigurationState, ReportOutcome,
};
use shardctl::types::{BrokerShard, NodeId, Ntp, quorum_floor};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;

fn test_config() -> ControllerConfig {
    let mut config = ControllerConfig::from_profile(ControllerProfile::Development);
    config.reconciler.retry.min_delay = Duration::from_millis(1);
    config.reconciler.retry.max_delay = Duration::from_millis(5);
    config.reconciler.retry.retry_ceiling = 2;
    config
}

struct TestCluster {
    controller: Arc<Controller>,
    dispatcher: Arc<MockNodeDispatcher>,
    store: Arc<InMemoryAssignmentStore>,
}

/// Nodes 1..=`nodes` with one partition placed on {1, 2, 3}.
async fn create_cluster(nodes: i32) -> (TestCluster, Ntp) {
    let dispatcher = Arc::new(MockNodeDispatcher::new());
    let store = Arc::new(InMemoryAssignmentStore::new());
    let controller = Arc::new(
        Controller::new(test_config(), dispatcher.clone(), store.clone(), Handle::current())
            .unwrap(),
    );
    controller.become_leader().await.unwrap();
    for id in 1..=3 {
        controller.register_node(NodeId(id), None, 1).await.unwrap();
    }
    let ntp = controller
        .create_topic("kafka", "orders", 1, 3)
        .await
        .unwrap()
        .remove(0);
    for id in 4..=nodes {
        controller.register_node(NodeId(id), None, 1).await.unwrap();
    }
    (
        TestCluster {
            controller,
            dispatcher,
            store,
        },
        ntp,
    )
}

fn shards(ids: &[i32]) -> Vec<BrokerShard> {
    ids.iter().map(|id| BrokerShard::new(NodeId(*id), 0)).collect()
}

async fn replica_ids(controller: &Controller, ntp: &Ntp) -> Vec<i32> {
    let mut ids: Vec<i32> = controller
        .get_partition(ntp)
        .await
        .unwrap()
        .replica_nodes()
        .into_iter()
        .map(|n| n.value())
        .collect();
    ids.sort();
    ids
}

/// Tick until nothing is in flight, stepping the clock past retry delays.
async fn converge(controller: &Controller) {
    for step in 0..50u64 {
        controller
            .tick_at(Instant::now() + Duration::from_secs(step))
            .await
            .unwrap();
        if controller.reconfigurations().await.unwrap().is_empty() {
            return;
        }
    }
    panic!("reconfigurations did not converge");
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancel_returns_to_previous_set() {
    let (cluster, ntp) = create_cluster(4).await;
    let controller = &cluster.controller;
    cluster.dispatcher.set_behavior(NodeId(4), NodeBehavior::Accept);

    let revision = controller
        .set_replicas(&ntp, shards(&[1, 2, 4]))
        .await
        .unwrap();
    controller.tick().await.unwrap();
    let add = cluster.dispatcher.dispatched_to(NodeId(4)).await;
    assert_eq!(add.len(), 1);
    assert!(matches!(add[0].kind, OperationKind::AddReplica { .. }));

    let cancelled_at = controller.cancel_reconfiguration(&ntp).await.unwrap();
    assert_eq!(cancelled_at, revision);
    let view = controller.reconfiguration(&ntp).await.unwrap().unwrap();
    assert_eq!(view.state, ReconfigurationState::Cancelling);

    // Cancelling twice is a no-op.
    assert_eq!(controller.cancel_reconfiguration(&ntp).await.unwrap(), revision);

    // The add on node 4 still lands; compensation removes it again.
    let outcome = controller
        .report_operation(OperationReport {
            ntp: ntp.clone(),
            shard: BrokerShard::new(NodeId(4), 0),
            revision,
            result: Ok(()),
        })
        .await
        .unwrap();
    assert_eq!(outcome, ReportOutcome::Applied);
    assert_eq!(replica_ids(controller, &ntp).await, vec![1, 2, 3, 4]);

    cluster.dispatcher.set_behavior(NodeId(4), NodeBehavior::Complete);
    converge(controller).await;

    assert_eq!(replica_ids(controller, &ntp).await, vec![1, 2, 3]);
    let view = controller.reconfiguration(&ntp).await.unwrap().unwrap();
    assert_eq!(view.state, ReconfigurationState::Cancelled);
    assert!(!view.operator_forced);

    let removes: Vec<_> = cluster
        .dispatcher
        .dispatched_to(NodeId(4))
        .await
        .into_iter()
        .filter(|r| r.kind == OperationKind::RemoveReplica)
        .collect();
    assert_eq!(removes.len(), 1);
    assert!(cluster.store.assignment(&ntp).unwrap().intent.is_none());
}

#[tokio::test]
async fn test_cancel_before_dispatch_finishes_immediately() {
    let (cluster, ntp) = create_cluster(4).await;
    let controller = &cluster.controller;

    controller.set_replicas(&ntp, shards(&[1, 2, 4])).await.unwrap();
    controller.cancel_reconfiguration(&ntp).await.unwrap();

    assert!(controller.reconfigurations().await.unwrap().is_empty());
    let view = controller.reconfiguration(&ntp).await.unwrap().unwrap();
    assert_eq!(view.state, ReconfigurationState::Cancelled);
    assert_eq!(cluster.dispatcher.dispatch_count(), 0);
    assert_eq!(replica_ids(controller, &ntp).await, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_cancel_without_reconfiguration() {
    let (cluster, ntp) = create_cluster(3).await;
    let err = cluster
        .controller
        .cancel_reconfiguration(&ntp)
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::NoReconfigurationInProgress { .. }));

    let err = cluster
        .controller
        .force_abort_reconfiguration(&ntp)
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::NoReconfigurationInProgress { .. }));
}

#[tokio::test]
async fn test_cancel_node_moves_and_cancel_all() {
    let (cluster, ntp) = create_cluster(5).await;
    let controller = &cluster.controller;
    let other = controller
        .create_topic("kafka", "events", 1, 1)
        .await
        .unwrap()
        .remove(0);
    let other_node = controller.get_partition(&other).await.unwrap().replica_nodes()[0];
    let joining = if other_node == NodeId(4) { 5 } else { 4 };
    let other_target = if other_node == NodeId(1) { 2 } else { 1 };

    controller.set_replicas(&ntp, shards(&[1, 2, joining])).await.unwrap();
    controller.set_replicas(&other, shards(&[other_target])).await.unwrap();

    let cancelled = controller.cancel_node_moves(NodeId(joining)).await.unwrap();
    assert_eq!(cancelled, vec![ntp.clone()]);
    assert_eq!(controller.reconfigurations().await.unwrap().len(), 1);

    let cancelled = controller.cancel_all_moves().await.unwrap();
    assert_eq!(cancelled, vec![other.clone()]);
    assert!(controller.reconfigurations().await.unwrap().is_empty());

    let err = controller.cancel_node_moves(NodeId(42)).await.unwrap_err();
    assert!(matches!(err, ControllerError::NodeNotFound { .. }));
}

// ============================================================================
// Force-abort
// ============================================================================

#[tokio::test]
async fn test_force_abort_keeps_confirmed_replicas() {
    let (cluster, ntp) = create_cluster(4).await;
    let controller = &cluster.controller;
    cluster.dispatcher.set_behavior(NodeId(3), NodeBehavior::Accept);

    controller.set_replicas(&ntp, shards(&[1, 2, 4])).await.unwrap();
    // Node 4 joins, then the removal of node 3 hangs on the node.
    controller.tick().await.unwrap();
    assert_eq!(replica_ids(controller, &ntp).await, vec![1, 2, 3, 4]);
    controller.tick().await.unwrap();

    let revision = controller.force_abort_reconfiguration(&ntp).await.unwrap();
    let view = controller.reconfiguration(&ntp).await.unwrap().unwrap();
    assert_eq!(view.state, ReconfigurationState::ForceAborted);
    assert!(view.operator_forced);
    assert_eq!(view.revision, revision);

    let partition = controller.get_partition(&ntp).await.unwrap();
    assert_eq!(partition.status, PartitionStatus::Normal);
    assert_eq!(replica_ids(controller, &ntp).await, vec![1, 2, 3, 4]);
    assert!(controller.reconfigurations().await.unwrap().is_empty());

    // The late removal report belongs to a finished revision.
    let outcome = controller
        .report_operation(OperationReport {
            ntp: ntp.clone(),
            shard: BrokerShard::new(NodeId(3), 0),
            revision,
            result: Ok(()),
        })
        .await
        .unwrap();
    assert_eq!(outcome, ReportOutcome::Duplicate);
    assert_eq!(replica_ids(controller, &ntp).await, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn test_permanent_failure_blocks_until_aborted() {
    let (cluster, ntp) = create_cluster(4).await;
    let controller = &cluster.controller;
    cluster.dispatcher.set_behavior(
        NodeId(4),
        NodeBehavior::Reject {
            reason: "disk missing".to_string(),
        },
    );

    controller.set_replicas(&ntp, shards(&[1, 2, 4])).await.unwrap();
    for step in 0..5u64 {
        controller
            .tick_at(Instant::now() + Duration::from_secs(step))
            .await
            .unwrap();
    }

    let view = controller.reconfiguration(&ntp).await.unwrap().unwrap();
    assert_eq!(view.state, ReconfigurationState::InProgress);
    assert_eq!(view.failed_operations.len(), 1);
    assert_eq!(view.failed_operations[0].shard.node_id, NodeId(4));
    // Node 3 is never removed while node 4 has not joined.
    assert_eq!(replica_ids(controller, &ntp).await, vec![1, 2, 3]);

    controller.force_abort_reconfiguration(&ntp).await.unwrap();
    assert_eq!(replica_ids(controller, &ntp).await, vec![1, 2, 3]);
}

// ============================================================================
// Revisions and reports
// ============================================================================

#[tokio::test]
async fn test_supersede_moves_to_new_target() {
    let (cluster, ntp) = create_cluster(5).await;
    let controller = &cluster.controller;
    cluster.dispatcher.set_behavior(NodeId(4), NodeBehavior::Accept);

    let first = controller.set_replicas(&ntp, shards(&[1, 2, 4])).await.unwrap();
    controller.tick().await.unwrap();
    let second = controller.set_replicas(&ntp, shards(&[1, 2, 5])).await.unwrap();
    assert!(second > first);

    // Repeating the same request keeps the revision.
    assert_eq!(
        controller.set_replicas(&ntp, shards(&[1, 2, 5])).await.unwrap(),
        second
    );

    cluster.dispatcher.set_behavior(NodeId(4), NodeBehavior::Complete);
    converge(controller).await;
    assert_eq!(replica_ids(controller, &ntp).await, vec![1, 2, 5]);

    let view = controller.reconfiguration(&ntp).await.unwrap().unwrap();
    assert_eq!(view.revision, second);
    assert_eq!(view.state, ReconfigurationState::Done);
    assert_eq!(view.source, IntentSource::Admin);
}

#[tokio::test]
async fn test_progress_reports_update_view() {
    let (cluster, ntp) = create_cluster(4).await;
    let controller = &cluster.controller;
    cluster.dispatcher.set_behavior(NodeId(4), NodeBehavior::Accept);

    let revision = controller.set_replicas(&ntp, shards(&[1, 2, 4])).await.unwrap();
    controller.tick().await.unwrap();

    let outcome = controller
        .report_progress(ProgressReport {
            ntp: ntp.clone(),
            node_id: NodeId(4),
            revision,
            bytes_moved: 300,
            bytes_left: 700,
        })
        .await
        .unwrap();
    assert_eq!(outcome, ReportOutcome::Applied);

    let view = controller.reconfiguration(&ntp).await.unwrap().unwrap();
    assert_eq!(view.bytes_moved(), 300);
    assert_eq!(view.bytes_left(), 700);

    let stale = controller
        .report_progress(ProgressReport {
            ntp: ntp.clone(),
            node_id: NodeId(4),
            revision: shardctl::types::Revision(revision.0 + 10),
            bytes_moved: 1000,
            bytes_left: 0,
        })
        .await
        .unwrap();
    assert_eq!(stale, ReportOutcome::Stale);
}

#[tokio::test]
async fn test_invalid_replica_sets_are_rejected() {
    let (cluster, ntp) = create_cluster(4).await;
    let controller = &cluster.controller;

    let err = controller.set_replicas(&ntp, Vec::new()).await.unwrap_err();
    assert!(matches!(err, ControllerError::InvalidReplicaSet { .. }));

    let doubled = vec![BrokerShard::new(NodeId(1), 0), BrokerShard::new(NodeId(1), 0)];
    let err = controller.set_replicas(&ntp, doubled).await.unwrap_err();
    assert!(matches!(err, ControllerError::InvalidReplicaSet { .. }));

    let err = controller
        .set_replicas(&ntp, shards(&[1, 2, 9]))
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::NodeNotFound { .. }));

    let err = controller
        .set_replicas(&ntp, vec![BrokerShard::new(NodeId(4), 7)])
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::InvalidReplicaSet { .. }));

    let missing = Ntp::kafka("missing", 0);
    let err = controller
        .set_replicas(&missing, shards(&[1]))
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::PartitionNotFound { .. }));
}

// ============================================================================
// Quorum floor
// ============================================================================

#[tokio::test]
async fn test_full_replacement_never_drops_below_quorum() {
    let (cluster, ntp) = create_cluster(6).await;
    let controller = &cluster.controller;
    let floor = quorum_floor(3);

    controller.set_replicas(&ntp, shards(&[4, 5, 6])).await.unwrap();
    for step in 0..50u64 {
        controller
            .tick_at(Instant::now() + Duration::from_secs(step))
            .await
            .unwrap();
        let replicas = replica_ids(controller, &ntp).await;
        assert!(
            replicas.len() >= floor,
            "replica set {:?} fell below the quorum floor",
            replicas
        );
        if controller.reconfigurations().await.unwrap().is_empty() {
            break;
        }
    }

    assert_eq!(replica_ids(controller, &ntp).await, vec![4, 5, 6]);
    let partition = controller.get_partition(&ntp).await.unwrap();
    assert!(partition.leader.is_some_and(|l| l.value() >= 4));
}
