//! The controller: one elected instance driving the whole control plane.
//!
//! All mutable control-plane state lives in a single `ControllerCore` behind
//! a `tokio::sync::Mutex`. Node dispatch happens outside the lock so a slow
//! node never blocks admin requests or reports from other nodes. Store writes
//! are snapshotted under the lock and written after it is released, one
//! snapshot at a time.
//!
//! ```text
//!   admin / node reports ──► Controller ──► ControllerCore (locked)
//!                                │              ├─ ClusterState
//!                                │              ├─ Reconciler
//!                                │              ├─ BalancerPlanner
//!                                │              ├─ LeaderBalancer
//!                                │              └─ NodeLifecycle
//!                                ▼
//!                  NodeDispatcher (unlocked, bounded fan-out)
//!                                │
//!                  AssignmentStore (durable intents)
//! ```
//!
//! Leadership of the controller itself is decided elsewhere. The embedding
//! process calls [`Controller::become_leader`] and [`Controller::step_down`];
//! every other operation fails with [`ControllerError::NotLeader`] while the
//! instance is a follower. On becoming leader the core is rebuilt from the
//! store and nothing held in memory from an earlier term is trusted.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use futures::stream::{self, StreamExt};
use tokio::runtime::Handle;
use tokio::sync::{Mutex, MutexGuard, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::allocator::{AllocationState, PartitionAllocator};
use super::broker_directory::{DiskSample, NodeCommand, NodeResponse};
use super::config::ControllerConfig;
use super::error::{ControllerError, ControllerResult, DispatchError};
use super::leader_balancer::{LeaderBalanceDecision, LeaderBalancer};
use super::lifecycle::{DecommissionStatus, MaintenanceStatus, NodeLifecycle};
use super::metrics;
use super::partition_table::PartitionStatus;
use super::planner::{BalancerPlanner, PlanResult, PlannerStatus};
use super::reconciler::{
    DispatchAck, IntentSource, OperationReport, OperationRequest, ProgressReport, Reconciler,
    ReconfigurationKind, ReconfigurationView, ReportOutcome,
};
use super::retry::with_store_policy;
use super::state::ClusterState;
use super::store::{AssignmentRecord, NodeRecord};
use super::traits::{AssignmentStore, NodeDispatcher};
use crate::types::{BrokerShard, GroupId, NodeId, Ntp, Revision};

/// Admin-facing snapshot of one partition.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionView {
    pub ntp: Ntp,
    pub group_id: GroupId,
    pub replication_factor: usize,
    pub replicas: Vec<BrokerShard>,
    pub leader: Option<NodeId>,
    pub status: PartitionStatus,
    pub revision: Revision,
    pub size_bytes: u64,
    /// Active reconfiguration, if any.
    pub reconfiguration: Option<ReconfigurationView>,
}

/// What one reconciliation tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub dispatched: usize,
    pub accepted: usize,
    pub completed: usize,
    pub failed: usize,
    /// Partition records written to the store.
    pub persisted: usize,
    /// Nodes whose decommission finished during the tick.
    pub removed_nodes: Vec<NodeId>,
}

/// Summary of controller state for debugging.
#[derive(Debug, Clone)]
pub struct ControllerStateSummary {
    pub node_id: NodeId,
    pub is_leader: bool,
    pub is_running: bool,
    pub nodes: usize,
    pub alive_nodes: usize,
    pub partitions: usize,
    pub active_reconfigurations: usize,
    pub decommissioning_nodes: Vec<NodeId>,
    pub maintenance_nodes: Vec<NodeId>,
    pub planner_status: PlannerStatus,
    pub active_cooldowns: usize,
}

/// Handles for background tasks.
pub struct BackgroundTaskHandles {
    pub reconcile: Option<JoinHandle<()>>,
    pub planner: Option<JoinHandle<()>>,
    pub leader_balancer: Option<JoinHandle<()>>,
    pub liveness: Option<JoinHandle<()>>,
}

impl BackgroundTaskHandles {
    /// Abort all background tasks.
    pub fn abort_all(&self) {
        for handle in [
            &self.reconcile,
            &self.planner,
            &self.leader_balancer,
            &self.liveness,
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

struct ControllerCore {
    state: ClusterState,
    reconciler: Reconciler,
    planner: BalancerPlanner,
    leader_balancer: LeaderBalancer,
    lifecycle: NodeLifecycle,
    last_plan: Option<PlanResult>,
    forced_removals: BTreeSet<NodeId>,
    /// Nodes whose record still has to reach the store.
    dirty_nodes: BTreeSet<NodeId>,
}

/// Store writes snapshotted under the core lock.
#[derive(Default)]
struct PendingWrites {
    partitions: Vec<Ntp>,
    records: Vec<AssignmentRecord>,
    deleted: Vec<Ntp>,
    node_ids: Vec<NodeId>,
    nodes: Vec<NodeRecord>,
}

impl PendingWrites {
    fn is_empty(&self) -> bool {
        self.partitions.is_empty() && self.node_ids.is_empty()
    }
}

impl ControllerCore {
    fn new(config: &ControllerConfig) -> Self {
        Self {
            state: ClusterState::new(),
            reconciler: Reconciler::new(&config.reconciler),
            planner: BalancerPlanner::new(
                config.planner.clone(),
                PartitionAllocator::new(config.allocator.clone()),
            ),
            leader_balancer: LeaderBalancer::new(config.leader_balancer.clone()),
            lifecycle: NodeLifecycle::new(),
            last_plan: None,
            forced_removals: BTreeSet::new(),
            dirty_nodes: BTreeSet::new(),
        }
    }

    /// Take every partition and node changed since the last snapshot, plus
    /// `nodes`, as store records.
    fn take_writes(&mut self, nodes: &[NodeId]) -> PendingWrites {
        self.dirty_nodes.extend(nodes.iter().copied());
        let mut pending = PendingWrites {
            partitions: self.reconciler.take_dirty(),
            node_ids: std::mem::take(&mut self.dirty_nodes).into_iter().collect(),
            ..Default::default()
        };
        for ntp in &pending.partitions {
            match self.reconciler.assignment_record(&self.state, ntp) {
                Some(record) => pending.records.push(record),
                None => pending.deleted.push(ntp.clone()),
            }
        }
        pending.nodes = pending
            .node_ids
            .iter()
            .filter_map(|id| {
                let node = self.state.directory.get(*id)?;
                Some(NodeRecord::from_metadata(node, self.forced_removals.contains(id)))
            })
            .collect();
        pending
    }

    /// Queue a snapshot that failed to write for the next one.
    fn restore_writes(&mut self, pending: &PendingWrites) {
        for ntp in &pending.partitions {
            self.reconciler.mark_dirty(ntp);
        }
        self.dirty_nodes.extend(pending.node_ids.iter().copied());
    }

    fn in_flight_transfers(&self) -> usize {
        self.reconciler
            .active_count()
            .saturating_sub(self.reconciler.active_moves().len())
    }

    /// Issue leadership transfers that drain nodes in maintenance.
    fn drain_maintenance(&mut self, now: Instant) -> usize {
        let busy = self.reconciler.active_ntps();
        let drains = self
            .lifecycle
            .drain_transfers(&self.state, &self.leader_balancer, &busy);

        let mut issued = 0;
        for (ntp, target) in drains {
            match self.reconciler.request_leadership_transfer(
                &mut self.state,
                &ntp,
                target,
                IntentSource::Lifecycle,
                now,
            ) {
                Ok(_) => issued += 1,
                Err(e) => warn!(ntp = %ntp, target = %target, error = %e, "Maintenance drain transfer rejected"),
            }
        }
        issued
    }
}

/// Current wall-clock time in milliseconds, used for node timestamps.
fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The control plane of one cluster.
pub struct Controller {
    config: ControllerConfig,
    core: Mutex<ControllerCore>,
    /// Held from snapshot to store write so writes land in snapshot order.
    write_order: Mutex<()>,
    dispatcher: Arc<dyn NodeDispatcher>,
    store: Arc<dyn AssignmentStore>,
    is_leader: AtomicBool,
    running: AtomicBool,
    planner_wakeup: Notify,
    runtime: Handle,
}

impl Controller {
    /// Create a controller. It starts as a follower.
    pub fn new(
        config: ControllerConfig,
        dispatcher: Arc<dyn NodeDispatcher>,
        store: Arc<dyn AssignmentStore>,
        runtime: Handle,
    ) -> ControllerResult<Self> {
        config
            .validate()
            .map_err(|errors| ControllerError::Config(errors.join("; ")))?;

        info!(
            node_id = %config.node_id,
            planner_enabled = config.planner.enabled,
            leader_balancer_enabled = config.leader_balancer.enabled,
            max_concurrent_reconfigurations = config.planner.max_concurrent_reconfigurations,
            tick_interval_ms = config.tick_interval.as_millis() as u64,
            "Creating controller"
        );

        Ok(Self {
            core: Mutex::new(ControllerCore::new(&config)),
            write_order: Mutex::new(()),
            config,
            dispatcher,
            store,
            is_leader: AtomicBool::new(false),
            running: AtomicBool::new(false),
            planner_wakeup: Notify::new(),
            runtime,
        })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    fn ensure_leader(&self) -> ControllerResult<()> {
        if self.is_leader() {
            Ok(())
        } else {
            Err(ControllerError::NotLeader)
        }
    }

    async fn lock_as_leader(&self) -> ControllerResult<MutexGuard<'_, ControllerCore>> {
        self.ensure_leader()?;
        let guard = self.core.lock().await;
        self.ensure_leader()?;
        Ok(guard)
    }

    /// Wake the planner loop ahead of its next interval.
    pub fn trigger_planner(&self) {
        self.planner_wakeup.notify_one();
    }

    // ========================================================================
    // Controller leadership
    // ========================================================================

    /// Take over the cluster, rebuilding state from the durable store.
    pub async fn become_leader(&self) -> ControllerResult<()> {
        let records = with_store_policy(
            || self.store.load_assignments(),
            |e: &ControllerError| e.is_retriable(),
        )
        .await?;
        let nodes = with_store_policy(
            || self.store.load_nodes(),
            |e: &ControllerError| e.is_retriable(),
        )
        .await?;

        let now = Instant::now();
        let now_ms = current_time_ms();
        let mut guard = self.core.lock().await;
        let mut core = ControllerCore::new(&self.config);

        for node in &nodes {
            core.state.directory.restore(node, now_ms);
            if node.forced_removal {
                core.forced_removals.insert(node.node_id);
            }
        }
        let partitions = records.len();
        core.reconciler.restore(&mut core.state, records, now);
        core.lifecycle.restore(&core.state, &core.forced_removals);
        let resumed = core.reconciler.active_count();
        *guard = core;

        self.is_leader.store(true, Ordering::SeqCst);
        metrics::set_controller_leader(true);
        info!(
            node_id = %self.config.node_id,
            nodes = nodes.len(),
            partitions,
            resumed_reconfigurations = resumed,
            "Controller became leader"
        );
        drop(guard);

        self.trigger_planner();
        Ok(())
    }

    /// Give up leadership. In-memory state is discarded on the next
    /// [`become_leader`](Self::become_leader).
    pub fn step_down(&self) {
        if self.is_leader.swap(false, Ordering::SeqCst) {
            metrics::set_controller_leader(false);
            info!(node_id = %self.config.node_id, "Controller stepped down");
        }
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Snapshot what changed, release the core lock and write the snapshot.
    ///
    /// `nodes` are written along with any node still waiting from an earlier
    /// failure. A failed snapshot is queued again for the next caller.
    /// Returns the number of partitions written.
    async fn commit(
        &self,
        mut guard: MutexGuard<'_, ControllerCore>,
        nodes: &[NodeId],
    ) -> ControllerResult<usize> {
        let pending = guard.take_writes(nodes);
        if pending.is_empty() {
            return Ok(0);
        }
        let order = self.write_order.lock().await;
        drop(guard);

        let result = self.write(&pending).await;
        drop(order);

        if let Err(e) = &result {
            error!(
                error = %e,
                partitions = pending.partitions.len(),
                nodes = pending.node_ids.len(),
                "Failed to persist controller state"
            );
            self.core.lock().await.restore_writes(&pending);
        }
        result.map(|()| pending.partitions.len())
    }

    async fn write(&self, pending: &PendingWrites) -> ControllerResult<()> {
        if !pending.records.is_empty() {
            with_store_policy(
                || self.store.save_assignments(pending.records.clone()),
                |e: &ControllerError| e.is_retriable(),
            )
            .await?;
        }
        if !pending.deleted.is_empty() {
            with_store_policy(
                || self.store.delete_assignments(pending.deleted.clone()),
                |e: &ControllerError| e.is_retriable(),
            )
            .await?;
        }
        for record in &pending.nodes {
            with_store_policy(
                || self.store.save_node(record.clone()),
                |e: &ControllerError| e.is_retriable(),
            )
            .await?;
        }
        Ok(())
    }

    // ========================================================================
    // Topics and partitions
    // ========================================================================

    /// Create a topic, placing every partition through the allocator.
    pub async fn create_topic(
        &self,
        namespace: &str,
        topic: &str,
        partitions: i32,
        replication_factor: usize,
    ) -> ControllerResult<Vec<Ntp>> {
        if partitions <= 0 {
            return Err(ControllerError::Config(format!(
                "partition count ({}) must be positive",
                partitions
            )));
        }

        let mut guard = self.lock_as_leader().await?;
        let core = &mut *guard;

        if core.state.partitions.topic_exists(namespace, topic) {
            return Err(ControllerError::TopicAlreadyExists {
                namespace: namespace.to_string(),
                topic: topic.to_string(),
            });
        }

        let mut alloc_state =
            AllocationState::from_cluster(&core.state, core.planner.config().disk_hard_threshold);
        let mut placements = Vec::with_capacity(partitions as usize);
        for partition in 0..partitions {
            let ntp = Ntp::new(namespace, topic, partition);
            let placement = core.planner.allocator().allocate(
                &mut alloc_state,
                &ntp,
                replication_factor,
                &BTreeSet::new(),
            )?;
            placements.push(placement.replicas);
        }

        let created = core.state.partitions.create_topic(
            namespace,
            topic,
            replication_factor,
            placements,
            current_time_ms(),
        )?;
        for ntp in &created {
            core.reconciler.mark_dirty(ntp);
        }
        info!(
            namespace,
            topic,
            partitions,
            replication_factor,
            "Topic created"
        );

        self.commit(guard, &[]).await?;
        Ok(created)
    }

    /// Delete a topic and drop any reconfiguration of its partitions.
    pub async fn delete_topic(&self, namespace: &str, topic: &str) -> ControllerResult<Vec<Ntp>> {
        let mut guard = self.lock_as_leader().await?;
        let core = &mut *guard;

        let removed = core.state.partitions.delete_topic(namespace, topic);
        if removed.is_empty() {
            return Err(ControllerError::TopicNotFound {
                namespace: namespace.to_string(),
                topic: topic.to_string(),
            });
        }
        for ntp in &removed {
            core.reconciler.drop_partition(ntp);
            core.reconciler.mark_dirty(ntp);
        }
        info!(namespace, topic, partitions = removed.len(), "Topic deleted");

        self.commit(guard, &[]).await?;
        Ok(removed)
    }

    pub async fn list_partitions(&self) -> ControllerResult<Vec<PartitionView>> {
        let guard = self.lock_as_leader().await?;
        Ok(guard
            .state
            .partitions
            .iter()
            .filter_map(|p| partition_view(&guard, &p.ntp))
            .collect())
    }

    pub async fn get_partition(&self, ntp: &Ntp) -> ControllerResult<PartitionView> {
        let guard = self.lock_as_leader().await?;
        partition_view(&guard, ntp).ok_or_else(|| ControllerError::PartitionNotFound { ntp: ntp.clone() })
    }

    // ========================================================================
    // Reconfigurations
    // ========================================================================

    /// Set the target replica set of a partition. Supersedes any move in flight.
    pub async fn set_replicas(
        &self,
        ntp: &Ntp,
        replicas: Vec<BrokerShard>,
    ) -> ControllerResult<Revision> {
        let mut guard = self.lock_as_leader().await?;
        let core = &mut *guard;
        let revision = core.reconciler.request_replica_move(
            &mut core.state,
            ntp,
            replicas,
            IntentSource::Admin,
            Instant::now(),
        )?;
        self.commit(guard, &[]).await?;
        Ok(revision)
    }

    /// Move leadership of a partition, to `target` or to the best follower.
    pub async fn transfer_leadership(
        &self,
        ntp: &Ntp,
        target: Option<NodeId>,
    ) -> ControllerResult<Revision> {
        let mut guard = self.lock_as_leader().await?;
        let core = &mut *guard;
        let target = core.leader_balancer.validate_manual(&core.state, ntp, target)?;
        let revision = core.reconciler.request_leadership_transfer(
            &mut core.state,
            ntp,
            target,
            IntentSource::Admin,
            Instant::now(),
        )?;
        self.commit(guard, &[]).await?;
        Ok(revision)
    }

    /// Cooperatively cancel a reconfiguration, returning to the previous set.
    pub async fn cancel_reconfiguration(&self, ntp: &Ntp) -> ControllerResult<Revision> {
        let mut guard = self.lock_as_leader().await?;
        let core = &mut *guard;
        let revision = core.reconciler.cancel(&mut core.state, ntp, Instant::now())?;
        self.commit(guard, &[]).await?;
        Ok(revision)
    }

    /// Stop a reconfiguration immediately, keeping the confirmed replicas.
    pub async fn force_abort_reconfiguration(&self, ntp: &Ntp) -> ControllerResult<Revision> {
        let mut guard = self.lock_as_leader().await?;
        let core = &mut *guard;
        let revision = core.reconciler.force_abort(&mut core.state, ntp, Instant::now())?;
        self.commit(guard, &[]).await?;
        Ok(revision)
    }

    /// Cancel every replica move that adds or removes a replica on `node_id`.
    pub async fn cancel_node_moves(&self, node_id: NodeId) -> ControllerResult<Vec<Ntp>> {
        let mut guard = self.lock_as_leader().await?;
        let core = &mut *guard;
        if !core.state.directory.contains(node_id) {
            return Err(ControllerError::NodeNotFound { node_id });
        }
        let cancelled = core
            .reconciler
            .cancel_touching(&mut core.state, node_id, Instant::now());
        info!(node_id = %node_id, cancelled = cancelled.len(), "Cancelled moves touching node");
        self.commit(guard, &[]).await?;
        Ok(cancelled)
    }

    pub async fn cancel_all_moves(&self) -> ControllerResult<Vec<Ntp>> {
        let mut guard = self.lock_as_leader().await?;
        let core = &mut *guard;
        let cancelled = core.reconciler.cancel_all(&mut core.state, Instant::now());
        info!(cancelled = cancelled.len(), "Cancelled all reconfigurations");
        self.commit(guard, &[]).await?;
        Ok(cancelled)
    }

    /// Reconfigurations in flight.
    pub async fn reconfigurations(&self) -> ControllerResult<Vec<ReconfigurationView>> {
        let guard = self.lock_as_leader().await?;
        Ok(guard.reconciler.in_progress())
    }

    /// The active reconfiguration of `ntp`, or its last finished one.
    pub async fn reconfiguration(&self, ntp: &Ntp) -> ControllerResult<Option<ReconfigurationView>> {
        let guard = self.lock_as_leader().await?;
        guard.state.partitions.require(ntp)?;
        Ok(guard.reconciler.view(ntp))
    }

    // ========================================================================
    // Node-facing surface
    // ========================================================================

    /// Register a node, or refresh a known one.
    pub async fn register_node(
        &self,
        node_id: NodeId,
        rack: Option<String>,
        cores: u32,
    ) -> ControllerResult<()> {
        let mut guard = self.lock_as_leader().await?;
        let core = &mut *guard;
        let response = core.state.directory.apply(NodeCommand::Register {
            node_id,
            rack: rack.clone(),
            cores,
            timestamp_ms: current_time_ms(),
        });
        if let NodeResponse::Rejected { node_id } = response {
            warn!(node_id = %node_id, "Removed node tried to register");
            return Err(ControllerError::NodeRemoved { node_id });
        }
        info!(node_id = %node_id, rack = ?rack, cores, "Node registered");

        self.commit(guard, &[node_id]).await?;
        self.trigger_planner();
        Ok(())
    }

    /// Liveness and disk report from a node.
    pub async fn heartbeat(&self, node_id: NodeId, disks: Vec<DiskSample>) -> ControllerResult<()> {
        let mut guard = self.lock_as_leader().await?;
        let response = guard.state.directory.apply(NodeCommand::Heartbeat {
            node_id,
            disks,
            timestamp_ms: current_time_ms(),
        });
        drop(guard);

        match response {
            NodeResponse::NotFound { node_id } => Err(ControllerError::NodeNotFound { node_id }),
            NodeResponse::Rejected { node_id } => Err(ControllerError::NodeRemoved { node_id }),
            NodeResponse::LivenessChanged { node_id, is_alive } => {
                info!(node_id = %node_id, is_alive, "Node liveness changed");
                self.trigger_planner();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Mark nodes dead that have not sent a heartbeat within the liveness
    /// timeout. Returns the nodes that just went down.
    pub async fn check_liveness_at(&self, now_ms: u64) -> ControllerResult<Vec<NodeId>> {
        let mut guard = self.lock_as_leader().await?;
        let timeout_ms = self.config.node_liveness_timeout.as_millis() as u64;
        let expired = guard.state.directory.expire_liveness(now_ms, timeout_ms);
        drop(guard);

        if !expired.is_empty() {
            warn!(nodes = ?expired, "Nodes missed heartbeats, marked dead");
            self.trigger_planner();
        }
        Ok(expired)
    }

    pub async fn check_liveness(&self) -> ControllerResult<Vec<NodeId>> {
        self.check_liveness_at(current_time_ms()).await
    }

    /// Completion report for a dispatched operation.
    pub async fn report_operation(&self, report: OperationReport) -> ControllerResult<ReportOutcome> {
        let mut guard = self.lock_as_leader().await?;
        let core = &mut *guard;
        let outcome = core
            .reconciler
            .on_report(&mut core.state, report, Instant::now());
        self.commit(guard, &[]).await?;
        Ok(outcome)
    }

    pub async fn report_progress(&self, report: ProgressReport) -> ControllerResult<ReportOutcome> {
        let mut guard = self.lock_as_leader().await?;
        Ok(guard.reconciler.on_progress(report))
    }

    /// Log end offset of a replica. Leaders also report the partition size.
    pub async fn report_log_position(
        &self,
        ntp: &Ntp,
        node_id: NodeId,
        log_end_offset: i64,
        size_bytes: Option<u64>,
    ) -> ControllerResult<()> {
        let mut guard = self.lock_as_leader().await?;
        guard.state.partitions.require(ntp)?;
        guard
            .state
            .partitions
            .record_progress(ntp, node_id, log_end_offset, size_bytes);
        Ok(())
    }

    /// Leader elected by the partition's own consensus group.
    pub async fn report_leader(&self, ntp: &Ntp, leader: NodeId) -> ControllerResult<()> {
        let mut guard = self.lock_as_leader().await?;
        let core = &mut *guard;
        let partition = core.state.partitions.require(ntp)?;
        if !partition.hosts(leader) {
            debug!(ntp = %ntp, leader = %leader, "Ignoring leader report from non-replica");
            return Ok(());
        }
        if partition.leader == Some(leader) {
            return Ok(());
        }
        core.state.partitions.set_leader(ntp, Some(leader));
        core.reconciler.mark_dirty(ntp);
        self.commit(guard, &[]).await?;
        Ok(())
    }

    // ========================================================================
    // Node lifecycle
    // ========================================================================

    pub async fn decommission(&self, node_id: NodeId) -> ControllerResult<()> {
        let mut guard = self.lock_as_leader().await?;
        let core = &mut *guard;
        core.lifecycle.decommission(&mut core.state, node_id)?;
        self.commit(guard, &[node_id]).await?;
        self.trigger_planner();
        Ok(())
    }

    /// Return a decommissioning node to service, cancelling moves that were
    /// evacuating it.
    pub async fn recommission(&self, node_id: NodeId) -> ControllerResult<()> {
        let mut guard = self.lock_as_leader().await?;
        let core = &mut *guard;
        core.lifecycle.recommission(&mut core.state, node_id)?;
        let cancelled = core
            .reconciler
            .cancel_touching(&mut core.state, node_id, Instant::now());
        if !cancelled.is_empty() {
            info!(node_id = %node_id, cancelled = cancelled.len(), "Cancelled evacuation moves");
        }
        self.commit(guard, &[node_id]).await?;
        Ok(())
    }

    /// Stop placing new replicas on a node. Its current replicas stay.
    pub async fn drain_node(&self, node_id: NodeId) -> ControllerResult<()> {
        let mut guard = self.lock_as_leader().await?;
        let core = &mut *guard;
        core.lifecycle.drain(&mut core.state, node_id)?;
        self.commit(guard, &[node_id]).await?;
        Ok(())
    }

    pub async fn undrain_node(&self, node_id: NodeId) -> ControllerResult<()> {
        let mut guard = self.lock_as_leader().await?;
        let core = &mut *guard;
        core.lifecycle.undrain(&mut core.state, node_id)?;
        self.commit(guard, &[node_id]).await?;
        self.trigger_planner();
        Ok(())
    }

    /// Mark a decommissioning node removed even though it still hosts replicas.
    pub async fn force_remove(&self, node_id: NodeId) -> ControllerResult<()> {
        let mut guard = self.lock_as_leader().await?;
        let core = &mut *guard;
        core.lifecycle.force_remove(&mut core.state, node_id)?;
        core.forced_removals.insert(node_id);
        self.commit(guard, &[node_id]).await?;
        self.trigger_planner();
        Ok(())
    }

    /// Decommission progress, `None` if the node was never decommissioned.
    pub async fn decommission_status(
        &self,
        node_id: NodeId,
    ) -> ControllerResult<Option<DecommissionStatus>> {
        let guard = self.lock_as_leader().await?;
        if !guard.state.directory.contains(node_id) {
            return Err(ControllerError::NodeNotFound { node_id });
        }
        Ok(guard.lifecycle.decommission_status(&guard.state, node_id))
    }

    /// Put a node in maintenance and start draining its leadership.
    pub async fn start_maintenance(&self, node_id: NodeId) -> ControllerResult<()> {
        let mut guard = self.lock_as_leader().await?;
        let core = &mut *guard;
        core.lifecycle.start_maintenance(&mut core.state, node_id)?;
        let issued = core.drain_maintenance(Instant::now());
        debug!(node_id = %node_id, transfers = issued, "Maintenance drain started");
        self.commit(guard, &[node_id]).await?;
        Ok(())
    }

    pub async fn stop_maintenance(&self, node_id: NodeId) -> ControllerResult<()> {
        let mut guard = self.lock_as_leader().await?;
        let core = &mut *guard;
        core.lifecycle.stop_maintenance(&mut core.state, node_id)?;
        self.commit(guard, &[node_id]).await?;
        Ok(())
    }

    pub async fn maintenance_status(&self, node_id: NodeId) -> ControllerResult<MaintenanceStatus> {
        let guard = self.lock_as_leader().await?;
        let busy = guard.reconciler.active_ntps();
        guard.lifecycle.maintenance_status(&guard.state, node_id, &busy)
    }

    // ========================================================================
    // Planning passes
    // ========================================================================

    /// Run a planner pass now and start the moves it proposes.
    pub async fn trigger_rebalance(&self) -> ControllerResult<PlanResult> {
        self.run_planner_at(current_time_ms()).await
    }

    /// Run a planner pass as of `now_ms`.
    pub async fn run_planner_at(&self, now_ms: u64) -> ControllerResult<PlanResult> {
        let now = Instant::now();
        let mut guard = self.lock_as_leader().await?;
        let core = &mut *guard;

        let active = core.reconciler.active_ntps();
        let plan = core.planner.plan(&core.state, &active, now_ms);

        let mut started = 0;
        for intent in &plan.intents {
            match core.reconciler.request_replica_move(
                &mut core.state,
                &intent.ntp,
                intent.target.clone(),
                IntentSource::Planner,
                now,
            ) {
                Ok(_) => started += 1,
                Err(e) => warn!(ntp = %intent.ntp, reason = %intent.reason, error = %e, "Planner intent rejected"),
            }
        }

        let moving = core.reconciler.nodes_in_moves();
        let removed = core
            .lifecycle
            .update_decommissions(&mut core.state, Some(&plan), &moving);

        if started > 0 || !plan.failures.is_empty() {
            info!(
                status = %plan.status,
                started,
                allocation_failures = plan.failures.len(),
                deferred = plan.deferred,
                "Planner pass finished"
            );
        } else {
            debug!(status = %plan.status, "Planner pass found nothing to do");
        }

        core.last_plan = Some(plan.clone());
        self.commit(guard, &removed).await?;
        Ok(plan)
    }

    /// Result of the last planner pass.
    pub async fn last_plan(&self) -> ControllerResult<Option<PlanResult>> {
        let guard = self.lock_as_leader().await?;
        Ok(guard.last_plan.clone())
    }

    pub async fn planner_status(&self) -> ControllerResult<PlannerStatus> {
        let guard = self.lock_as_leader().await?;
        Ok(guard
            .last_plan
            .as_ref()
            .map(|p| p.status)
            .unwrap_or_default())
    }

    /// Run a leader balancing pass, including maintenance drains.
    pub async fn run_leader_balancer(&self) -> ControllerResult<LeaderBalanceDecision> {
        let now = Instant::now();
        let mut guard = self.lock_as_leader().await?;
        let core = &mut *guard;

        core.leader_balancer.cleanup_cooldowns(now);
        core.drain_maintenance(now);

        let decision = if core.leader_balancer.is_enabled() {
            let busy = core.reconciler.active_ntps();
            let in_flight = core.in_flight_transfers();
            core.leader_balancer
                .plan(&core.state, &busy, in_flight, now)
        } else {
            LeaderBalanceDecision::default()
        };

        for transfer in &decision.transfers {
            match core.reconciler.request_leadership_transfer(
                &mut core.state,
                &transfer.ntp,
                transfer.to.node_id,
                IntentSource::LeaderBalancer,
                now,
            ) {
                Ok(_) => core.leader_balancer.record_transfer(&transfer.ntp, now),
                Err(e) => warn!(ntp = %transfer.ntp, error = %e, "Leadership transfer rejected"),
            }
        }

        self.commit(guard, &[]).await?;
        Ok(decision)
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    pub async fn tick(&self) -> ControllerResult<TickSummary> {
        self.tick_at(Instant::now()).await
    }

    /// Advance every reconfiguration as of `now`: dispatch due operations,
    /// apply their results and persist what changed.
    pub async fn tick_at(&self, now: Instant) -> ControllerResult<TickSummary> {
        let requests = {
            let mut guard = self.lock_as_leader().await?;
            let core = &mut *guard;
            core.reconciler.poll_due(&mut core.state, now)
        };

        let mut summary = TickSummary {
            dispatched: requests.len(),
            ..Default::default()
        };
        let results = self.dispatch_all(requests).await;

        let mut guard = self.lock_as_leader().await?;
        let core = &mut *guard;
        for (request, result) in results {
            match &result {
                Ok(DispatchAck::Accepted) => summary.accepted += 1,
                Ok(DispatchAck::Completed) => summary.completed += 1,
                Err(_) => summary.failed += 1,
            }
            core.reconciler
                .on_dispatch_result(&mut core.state, &request, result, now);
        }

        let moving = core.reconciler.nodes_in_moves();
        summary.removed_nodes = core
            .lifecycle
            .update_decommissions(&mut core.state, None, &moving);
        summary.persisted = self.commit(guard, &summary.removed_nodes).await?;
        Ok(summary)
    }

    /// Send requests to nodes with bounded concurrency. A request that does
    /// not finish within the dispatch timeout counts as a transient failure.
    async fn dispatch_all(
        &self,
        requests: Vec<OperationRequest>,
    ) -> Vec<(OperationRequest, Result<DispatchAck, DispatchError>)> {
        if requests.is_empty() {
            return Vec::new();
        }
        let timeout = self.config.reconciler.dispatch_timeout;

        stream::iter(requests)
            .map(|request| async move {
                let node_id = request.shard.node_id;
                let result =
                    match tokio::time::timeout(timeout, self.dispatcher.dispatch(request.clone()))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => {
                            warn!(ntp = %request.ntp, node_id = %node_id, kind = request.kind.name(), "Dispatch timed out");
                            Err(DispatchError::Timeout { node_id })
                        }
                    };
                (request, result)
            })
            .buffer_unordered(self.config.reconciler.max_concurrent_dispatches.max(1))
            .collect()
            .await
    }

    // ========================================================================
    // Background tasks
    // ========================================================================

    /// Start background tasks.
    pub fn start_background_tasks(self: &Arc<Self>) -> BackgroundTaskHandles {
        self.running.store(true, Ordering::SeqCst);

        let reconcile = {
            let controller = Arc::clone(self);
            Some(self.runtime.spawn(async move {
                controller.reconcile_loop().await;
            }))
        };

        let planner = if self.config.planner.enabled {
            let controller = Arc::clone(self);
            Some(self.runtime.spawn(async move {
                controller.planner_loop().await;
            }))
        } else {
            None
        };

        let leader_balancer = {
            let controller = Arc::clone(self);
            Some(self.runtime.spawn(async move {
                controller.leader_balancer_loop().await;
            }))
        };

        let liveness = {
            let controller = Arc::clone(self);
            Some(self.runtime.spawn(async move {
                controller.liveness_loop().await;
            }))
        };

        BackgroundTaskHandles {
            reconcile,
            planner,
            leader_balancer,
            liveness,
        }
    }

    /// Stop background tasks.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.planner_wakeup.notify_one();
    }

    /// Check if background tasks are running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn reconcile_loop(&self) {
        while self.running.load(Ordering::SeqCst) {
            tokio::time::sleep(self.config.tick_interval).await;
            if !self.is_leader() {
                continue;
            }
            if let Err(e) = self.tick().await {
                log_pass_error("reconcile", &e);
            }
        }
    }

    async fn planner_loop(&self) {
        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = tokio::time::sleep(self.config.planner.interval) => {}
                _ = self.planner_wakeup.notified() => {}
            }
            if !self.is_leader() || !self.running.load(Ordering::SeqCst) {
                continue;
            }
            if let Err(e) = self.trigger_rebalance().await {
                log_pass_error("planner", &e);
            }
        }
    }

    async fn leader_balancer_loop(&self) {
        while self.running.load(Ordering::SeqCst) {
            tokio::time::sleep(self.config.leader_balancer.interval).await;
            if !self.is_leader() {
                continue;
            }
            if let Err(e) = self.run_leader_balancer().await {
                log_pass_error("leader balancer", &e);
            }
        }
    }

    async fn liveness_loop(&self) {
        while self.running.load(Ordering::SeqCst) {
            tokio::time::sleep(self.config.tick_interval).await;
            if !self.is_leader() {
                continue;
            }
            if let Err(e) = self.check_liveness().await {
                log_pass_error("liveness", &e);
            }
        }
    }

    /// Get a summary of the controller state.
    pub async fn state_summary(&self) -> ControllerStateSummary {
        let core = self.core.lock().await;
        ControllerStateSummary {
            node_id: self.config.node_id,
            is_leader: self.is_leader(),
            is_running: self.is_running(),
            nodes: core.state.directory.len(),
            alive_nodes: core.state.directory.nodes().filter(|n| n.is_alive).count(),
            partitions: core.state.partitions.len(),
            active_reconfigurations: core.reconciler.active_count(),
            decommissioning_nodes: core.lifecycle.decommissioning_nodes(),
            maintenance_nodes: core.lifecycle.maintenance_nodes(),
            planner_status: core
                .last_plan
                .as_ref()
                .map(|p| p.status)
                .unwrap_or_default(),
            active_cooldowns: core.leader_balancer.active_cooldown_count(),
        }
    }
}

fn log_pass_error(pass: &str, e: &ControllerError) {
    match e {
        ControllerError::NotLeader => debug!(pass, "Skipping pass, no longer leader"),
        _ => warn!(pass, error = %e, "Background pass failed"),
    }
}

fn partition_view(core: &ControllerCore, ntp: &Ntp) -> Option<PartitionView> {
    let partition = core.state.partitions.get(ntp)?;
    let reconfiguration = core
        .reconciler
        .get(ntp)
        .and_then(|_| core.reconciler.view(ntp));
    Some(PartitionView {
        ntp: partition.ntp.clone(),
        group_id: partition.group_id,
        replication_factor: partition.replication_factor,
        replicas: partition.replicas.clone(),
        leader: partition.leader,
        status: partition.status,
        revision: partition.revision,
        size_bytes: partition.size_bytes,
        reconfiguration,
    })
}

impl PartitionView {
    pub fn replica_nodes(&self) -> Vec<NodeId> {
        self.replicas.iter().map(|r| r.node_id).collect()
    }

    pub fn is_moving(&self) -> bool {
        self.reconfiguration
            .as_ref()
            .is_some_and(|r| r.kind == ReconfigurationKind::ReplicaMove)
    }
}
