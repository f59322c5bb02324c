//! Reconciler: drives reconfigurations to convergence.
//!
//! Each partition has at most one active [`Reconfiguration`]. It moves through
//!
//! ```text
//! Stable -> InProgress -> Done
//!              |   \
//!              |    +---> ForceAborted  (force_abort)
//!              v
//!          Cancelling -> Cancelled       (cancel)
//! ```
//!
//! # Staging
//!
//! A replica move never lets the replica count drop below the quorum floor:
//!
//! 1. add every missing target replica and wait for confirmation
//! 2. if the leader sits on a replica that is leaving, transfer leadership to
//!    the first target replica
//! 3. remove the replicas that are not in the target set
//!
//! Operations inside a stage run in parallel. A cancelled move runs the same
//! stages towards the previous replica set.
//!
//! # Revisions
//!
//! Every new intent bumps the partition revision. Dispatch results and node
//! reports carry the revision they were issued under and are applied only when
//! it matches the active reconfiguration; anything else is dropped. Reports are
//! idempotent: a second success for an operation that is already gone changes
//! nothing.
//!
//! # Retries
//!
//! Nothing here sleeps. A failed operation gets a `next_attempt_at` from the
//! [`RetrySchedule`]; [`Reconciler::poll_due`] hands out operations whose time has
//! come. When the schedule runs out the operation is marked failed and left
//! visible in the reconfiguration view; other operations keep going.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cluster::config::ReconcilerConfig;
use crate::cluster::error::{ControllerError, ControllerResult, DispatchError};
use crate::cluster::metrics;
use crate::cluster::partition_table::PartitionStatus;
use crate::cluster::retry::{self, RetrySchedule};
use crate::cluster::state::ClusterState;
use crate::cluster::store::{AssignmentRecord, PersistedIntent};
use crate::types::{BrokerShard, GroupId, NodeId, Ntp, Revision, quorum_floor};

/// Work a node is asked to do for one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    /// Create the replica and join the group whose membership is `replicas`.
    AddReplica { replicas: Vec<BrokerShard> },
    /// Leave the group and delete the local replica.
    RemoveReplica,
    /// Hand leadership to `target`. Sent to the current leader.
    TransferLeadership { target: NodeId },
}

impl OperationKind {
    pub fn name(&self) -> &'static str {
        match self {
            OperationKind::AddReplica { .. } => "add_replica",
            OperationKind::RemoveReplica => "remove_replica",
            OperationKind::TransferLeadership { .. } => "transfer_leadership",
        }
    }
}

/// Dispatch state of one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationStatus {
    /// Waiting for `next_attempt_at`.
    Pending,
    /// Handed to the dispatcher, no answer yet.
    Dispatching,
    /// Node accepted the work; completion will be reported.
    Accepted { since: Instant },
    /// Retry ceiling exceeded or the node refused.
    Failed { reason: String },
}

/// A node-directed unit of work for one (node, core).
#[derive(Debug, Clone)]
pub struct Operation {
    pub shard: BrokerShard,
    pub kind: OperationKind,
    pub revision: Revision,
    pub retry_number: u32,
    pub status: OperationStatus,
    pub next_attempt_at: Instant,
}

impl Operation {
    fn new(shard: BrokerShard, kind: OperationKind, revision: Revision, now: Instant) -> Self {
        Self {
            shard,
            kind,
            revision,
            retry_number: 0,
            status: OperationStatus::Pending,
            next_attempt_at: now,
        }
    }

    fn is_in_flight(&self) -> bool {
        matches!(
            self.status,
            OperationStatus::Dispatching | OperationStatus::Accepted { .. }
        )
    }

    fn is_failed(&self) -> bool {
        matches!(self.status, OperationStatus::Failed { .. })
    }
}

/// What is being reconfigured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconfigurationKind {
    ReplicaMove,
    LeadershipTransfer { target: NodeId },
}

/// Who asked for the change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentSource {
    Planner,
    Admin,
    Lifecycle,
    LeaderBalancer,
}

impl fmt::Display for IntentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntentSource::Planner => write!(f, "planner"),
            IntentSource::Admin => write!(f, "admin"),
            IntentSource::Lifecycle => write!(f, "lifecycle"),
            IntentSource::LeaderBalancer => write!(f, "leader_balancer"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconfigurationState {
    InProgress,
    Cancelling,
    Done,
    Cancelled,
    ForceAborted,
}

impl ReconfigurationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReconfigurationState::Done
                | ReconfigurationState::Cancelled
                | ReconfigurationState::ForceAborted
        )
    }
}

impl fmt::Display for ReconfigurationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconfigurationState::InProgress => write!(f, "in_progress"),
            ReconfigurationState::Cancelling => write!(f, "cancelling"),
            ReconfigurationState::Done => write!(f, "done"),
            ReconfigurationState::Cancelled => write!(f, "cancelled"),
            ReconfigurationState::ForceAborted => write!(f, "force_aborted"),
        }
    }
}

/// Bytes a node has copied for a move and bytes still to go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeProgress {
    pub bytes_moved: u64,
    pub bytes_left: u64,
}

/// An in-flight transition of one partition.
#[derive(Debug, Clone)]
pub struct Reconfiguration {
    pub ntp: Ntp,
    pub group_id: GroupId,
    pub kind: ReconfigurationKind,
    pub source: IntentSource,
    pub revision: Revision,
    pub previous: Vec<BrokerShard>,
    pub target: Vec<BrokerShard>,
    /// Replicas confirmed by nodes.
    pub observed: Vec<BrokerShard>,
    pub state: ReconfigurationState,
    pub operations: BTreeMap<BrokerShard, Operation>,
    pub progress: BTreeMap<NodeId, NodeProgress>,
    pub partition_size: u64,
    pub operator_forced: bool,
    pub started_at: Instant,
}

impl Reconfiguration {
    /// Replica set this reconfiguration currently converges to.
    fn goal(&self) -> &[BrokerShard] {
        if self.state == ReconfigurationState::Cancelling {
            &self.previous
        } else {
            &self.target
        }
    }

    fn has_in_flight(&self) -> bool {
        self.operations.values().any(Operation::is_in_flight)
    }

    /// Drop operations that have not been handed to a node yet.
    fn drop_undispatched(&mut self) {
        self.operations.retain(|_, op| op.is_in_flight());
    }

    fn ensure_operation(&mut self, shard: BrokerShard, kind: OperationKind, now: Instant) {
        match self.operations.get(&shard) {
            Some(op) if op.kind == kind || op.is_in_flight() || op.is_failed() => {}
            _ => {
                self.operations
                    .insert(shard, Operation::new(shard, kind, self.revision, now));
            }
        }
    }

    /// Create the operations of the current stage.
    fn plan_operations(&mut self, leader: Option<BrokerShard>, now: Instant) {
        match self.kind {
            ReconfigurationKind::ReplicaMove => {
                let goal = self.goal().to_vec();

                let adds: Vec<BrokerShard> = goal
                    .iter()
                    .filter(|s| !self.observed.contains(s))
                    .copied()
                    .collect();
                if !adds.is_empty() {
                    for shard in adds {
                        self.ensure_operation(
                            shard,
                            OperationKind::AddReplica {
                                replicas: goal.clone(),
                            },
                            now,
                        );
                    }
                    return;
                }

                let removes: Vec<BrokerShard> = self
                    .observed
                    .iter()
                    .filter(|s| !goal.contains(s))
                    .copied()
                    .collect();
                if removes.is_empty() {
                    return;
                }

                // A goal replica on the leader's node keeps leadership there
                // when only the core changes.
                if let Some(leader_shard) = leader
                    && removes.contains(&leader_shard)
                    && !goal.iter().any(|s| s.node_id == leader_shard.node_id)
                    && let Some(new_leader) = goal.first()
                {
                    self.ensure_operation(
                        leader_shard,
                        OperationKind::TransferLeadership {
                            target: new_leader.node_id,
                        },
                        now,
                    );
                    return;
                }

                // goal is a subset of observed here, so removing every extra
                // replica still leaves goal.len() >= quorum floor members
                let floor = quorum_floor(goal.len()).max(goal.len());
                let removing = self
                    .operations
                    .values()
                    .filter(|op| op.kind == OperationKind::RemoveReplica && !op.is_failed())
                    .count();
                let mut remaining = self.observed.len().saturating_sub(removing);
                for shard in removes {
                    if self.operations.contains_key(&shard) {
                        continue;
                    }
                    if remaining <= floor {
                        break;
                    }
                    self.ensure_operation(shard, OperationKind::RemoveReplica, now);
                    remaining -= 1;
                }
            }
            ReconfigurationKind::LeadershipTransfer { target } => {
                if self.state == ReconfigurationState::Cancelling {
                    return;
                }
                let key = leader
                    .or_else(|| self.observed.iter().copied().find(|s| s.node_id == target));
                if let Some(key) = key
                    && leader.map(|l| l.node_id) != Some(target)
                {
                    self.ensure_operation(key, OperationKind::TransferLeadership { target }, now);
                }
            }
        }
    }

    fn is_converged(&self, leader: Option<NodeId>) -> bool {
        if self.has_in_flight() {
            return false;
        }
        match self.kind {
            ReconfigurationKind::ReplicaMove => {
                self.operations.is_empty() && same_members(&self.observed, self.goal())
            }
            ReconfigurationKind::LeadershipTransfer { target } => {
                self.state == ReconfigurationState::Cancelling || leader == Some(target)
            }
        }
    }

    fn view(&self) -> ReconfigurationView {
        ReconfigurationView {
            ntp: self.ntp.clone(),
            kind: self.kind,
            source: self.source,
            revision: self.revision,
            state: self.state,
            previous: self.previous.clone(),
            target: self.target.clone(),
            observed: self.observed.clone(),
            progress: self.progress.clone(),
            partition_size: self.partition_size,
            pending_operations: self
                .operations
                .values()
                .filter(|op| !op.is_failed())
                .map(OperationView::from)
                .collect(),
            failed_operations: self
                .operations
                .values()
                .filter(|op| op.is_failed())
                .map(OperationView::from)
                .collect(),
            operator_forced: self.operator_forced,
            elapsed: self.started_at.elapsed(),
        }
    }
}

/// Request for the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationRequest {
    pub ntp: Ntp,
    pub group_id: GroupId,
    pub revision: Revision,
    pub shard: BrokerShard,
    pub kind: OperationKind,
    pub retry_number: u32,
}

/// How a node answered a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchAck {
    /// Work started; an [`OperationReport`] follows.
    Accepted,
    /// Work finished synchronously.
    Completed,
}

/// Completion report from a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationReport {
    pub ntp: Ntp,
    pub shard: BrokerShard,
    pub revision: Revision,
    pub result: Result<(), String>,
}

/// Move progress report from a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressReport {
    pub ntp: Ntp,
    pub node_id: NodeId,
    pub revision: Revision,
    pub bytes_moved: u64,
    pub bytes_left: u64,
}

/// What happened to a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    Applied,
    /// Revision does not match the active reconfiguration.
    Stale,
    /// Already applied, or nothing was waiting for it.
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationView {
    pub shard: BrokerShard,
    pub kind: OperationKind,
    pub retry_number: u32,
    pub status: String,
}

impl From<&Operation> for OperationView {
    fn from(op: &Operation) -> Self {
        let status = match &op.status {
            OperationStatus::Pending => "pending".to_string(),
            OperationStatus::Dispatching => "dispatching".to_string(),
            OperationStatus::Accepted { .. } => "accepted".to_string(),
            OperationStatus::Failed { reason } => format!("failed: {}", reason),
        };
        Self {
            shard: op.shard,
            kind: op.kind.clone(),
            retry_number: op.retry_number,
            status,
        }
    }
}

/// Admin-facing snapshot of a reconfiguration.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconfigurationView {
    pub ntp: Ntp,
    pub kind: ReconfigurationKind,
    pub source: IntentSource,
    pub revision: Revision,
    pub state: ReconfigurationState,
    pub previous: Vec<BrokerShard>,
    pub target: Vec<BrokerShard>,
    pub observed: Vec<BrokerShard>,
    pub progress: BTreeMap<NodeId, NodeProgress>,
    pub partition_size: u64,
    pub pending_operations: Vec<OperationView>,
    pub failed_operations: Vec<OperationView>,
    pub operator_forced: bool,
    pub elapsed: Duration,
}

impl ReconfigurationView {
    pub fn bytes_moved(&self) -> u64 {
        self.progress.values().map(|p| p.bytes_moved).sum()
    }

    pub fn bytes_left(&self) -> u64 {
        self.progress.values().map(|p| p.bytes_left).sum()
    }
}

/// Per-partition reconfiguration state machines.
#[derive(Debug)]
pub struct Reconciler {
    schedule: RetrySchedule,
    operation_timeout: Duration,
    active: BTreeMap<Ntp, Reconfiguration>,
    /// Last terminal reconfiguration per partition.
    finished: BTreeMap<Ntp, Reconfiguration>,
    dirty: BTreeSet<Ntp>,
}

impl Reconciler {
    pub fn new(config: &ReconcilerConfig) -> Self {
        Self {
            schedule: RetrySchedule::new(&config.retry),
            operation_timeout: config.operation_timeout,
            active: BTreeMap::new(),
            finished: BTreeMap::new(),
            dirty: BTreeSet::new(),
        }
    }

    pub fn get(&self, ntp: &Ntp) -> Option<&Reconfiguration> {
        self.active.get(ntp)
    }

    pub fn is_active(&self, ntp: &Ntp) -> bool {
        self.active.contains_key(ntp)
    }

    pub fn active_ntps(&self) -> BTreeSet<Ntp> {
        self.active.keys().cloned().collect()
    }

    /// Partitions with an active replica move (leadership-only changes excluded).
    pub fn active_moves(&self) -> BTreeSet<Ntp> {
        self.active
            .values()
            .filter(|r| r.kind == ReconfigurationKind::ReplicaMove)
            .map(|r| r.ntp.clone())
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// View of the active reconfiguration, or the last finished one.
    pub fn view(&self, ntp: &Ntp) -> Option<ReconfigurationView> {
        self.active
            .get(ntp)
            .or_else(|| self.finished.get(ntp))
            .map(Reconfiguration::view)
    }

    pub fn in_progress(&self) -> Vec<ReconfigurationView> {
        self.active.values().map(Reconfiguration::view).collect()
    }

    /// Partitions whose active replica move adds or removes a replica on
    /// `node_id`.
    pub fn moves_touching(&self, node_id: NodeId) -> Vec<Ntp> {
        self.active
            .values()
            .filter(|r| r.kind == ReconfigurationKind::ReplicaMove)
            .filter(|r| {
                let before = r.previous.iter().any(|s| s.node_id == node_id);
                let after = r.target.iter().any(|s| s.node_id == node_id);
                before != after
            })
            .map(|r| r.ntp.clone())
            .collect()
    }

    /// Nodes named by an active replica move, on either side of it or
    /// confirmed in between.
    pub fn nodes_in_moves(&self) -> BTreeSet<NodeId> {
        self.active
            .values()
            .filter(|r| r.kind == ReconfigurationKind::ReplicaMove)
            .flat_map(|r| r.previous.iter().chain(&r.target).chain(&r.observed))
            .map(|s| s.node_id)
            .collect()
    }

    /// Partitions changed since the last call, for persistence.
    pub fn take_dirty(&mut self) -> Vec<Ntp> {
        std::mem::take(&mut self.dirty).into_iter().collect()
    }

    pub fn mark_dirty(&mut self, ntp: &Ntp) {
        self.dirty.insert(ntp.clone());
    }

    /// Set the target replica set of a partition.
    ///
    /// An active reconfiguration is superseded under a fresh revision. Returns
    /// the revision the partition converges under.
    pub fn request_replica_move(
        &mut self,
        state: &mut ClusterState,
        ntp: &Ntp,
        target: Vec<BrokerShard>,
        source: IntentSource,
        now: Instant,
    ) -> ControllerResult<Revision> {
        let partition = state.partitions.require(ntp)?;
        validate_replica_set(state, ntp, &target)?;

        let existing = self.active.get(ntp);
        if let Some(existing) = existing
            && existing.kind == ReconfigurationKind::ReplicaMove
            && existing.state == ReconfigurationState::InProgress
            && existing.target == target
        {
            return Ok(existing.revision);
        }
        if existing.is_none() && same_members(&partition.replicas, &target) {
            // Same members: only the preferred-leader order changes
            state.partitions.set_replicas(ntp, target);
            self.dirty.insert(ntp.clone());
            return Ok(partition_revision(state, ntp));
        }

        let base_revision = partition.revision;
        let group_id = partition.group_id;
        let partition_size = partition.size_bytes;
        let current = partition.replicas.clone();

        let (revision, previous, observed, started_at) = match self.active.remove(ntp) {
            Some(old) => {
                let previous = match old.kind {
                    ReconfigurationKind::ReplicaMove => old.previous.clone(),
                    ReconfigurationKind::LeadershipTransfer { .. } => current.clone(),
                };
                let observed = resolve_in_flight(&old, &target);
                info!(
                    ntp = %ntp,
                    old_revision = %old.revision,
                    source = %source,
                    "Superseding active reconfiguration"
                );
                (
                    old.revision.max(base_revision).next(),
                    previous,
                    observed,
                    old.started_at,
                )
            }
            None => (base_revision.next(), current.clone(), current, now),
        };

        let reconfiguration = Reconfiguration {
            ntp: ntp.clone(),
            group_id,
            kind: ReconfigurationKind::ReplicaMove,
            source,
            revision,
            previous,
            target,
            observed,
            state: ReconfigurationState::InProgress,
            operations: BTreeMap::new(),
            progress: BTreeMap::new(),
            partition_size,
            operator_forced: false,
            started_at,
        };

        info!(
            ntp = %ntp,
            revision = %revision,
            source = %source,
            previous = ?reconfiguration.previous,
            target = ?reconfiguration.target,
            "Reconfiguration started"
        );

        self.install(state, reconfiguration);
        Ok(revision)
    }

    /// Move leadership of `ntp` to `target`.
    ///
    /// Rejected while a replica move is running. Supersedes an active
    /// leadership transfer.
    pub fn request_leadership_transfer(
        &mut self,
        state: &mut ClusterState,
        ntp: &Ntp,
        target: NodeId,
        source: IntentSource,
        now: Instant,
    ) -> ControllerResult<Revision> {
        let partition = state.partitions.require(ntp)?;

        if let Some(active) = self.active.get(ntp)
            && active.kind == ReconfigurationKind::ReplicaMove
        {
            return Err(ControllerError::ReconfigurationInProgress {
                ntp: ntp.clone(),
                revision: active.revision,
            });
        }
        if !partition.hosts(target) {
            return Err(ControllerError::InvalidLeadershipTarget {
                ntp: ntp.clone(),
                node_id: target,
                reason: "not a replica".to_string(),
            });
        }
        if partition.leader == Some(target) && !self.active.contains_key(ntp) {
            return Ok(partition.revision);
        }

        let base_revision = match self.active.remove(ntp) {
            Some(old) => old.revision.max(partition.revision),
            None => partition.revision,
        };
        let revision = base_revision.next();
        let replicas = partition.replicas.clone();

        let reconfiguration = Reconfiguration {
            ntp: ntp.clone(),
            group_id: partition.group_id,
            kind: ReconfigurationKind::LeadershipTransfer { target },
            source,
            revision,
            previous: replicas.clone(),
            target: replicas.clone(),
            observed: replicas,
            state: ReconfigurationState::InProgress,
            operations: BTreeMap::new(),
            progress: BTreeMap::new(),
            partition_size: partition.size_bytes,
            operator_forced: false,
            started_at: now,
        };

        metrics::record_leadership_transfer(&source.to_string());
        debug!(ntp = %ntp, revision = %revision, target = %target, source = %source, "Leadership transfer requested");

        self.install(state, reconfiguration);
        Ok(revision)
    }

    fn install(&mut self, state: &mut ClusterState, reconfiguration: Reconfiguration) {
        let ntp = reconfiguration.ntp.clone();
        state
            .partitions
            .set_status(&ntp, PartitionStatus::Reconfiguring, reconfiguration.revision);
        self.active.insert(ntp.clone(), reconfiguration);
        self.dirty.insert(ntp);
        metrics::set_reconfigurations_in_progress(self.active.len());
    }

    /// Stop the move and return to the previous replica set.
    ///
    /// Operations already on a node are not interrupted; their reports are
    /// awaited before compensation starts. The revision stays the same.
    pub fn cancel(
        &mut self,
        state: &mut ClusterState,
        ntp: &Ntp,
        now: Instant,
    ) -> ControllerResult<Revision> {
        let reconfiguration = self.active.get_mut(ntp).ok_or_else(|| {
            ControllerError::NoReconfigurationInProgress { ntp: ntp.clone() }
        })?;

        let revision = reconfiguration.revision;
        if reconfiguration.state == ReconfigurationState::Cancelling {
            return Ok(revision);
        }
        reconfiguration.state = ReconfigurationState::Cancelling;
        reconfiguration.drop_undispatched();
        info!(ntp = %ntp, revision = %revision, "Reconfiguration cancelling");

        self.dirty.insert(ntp.clone());
        self.try_finish(state, ntp, now);
        Ok(revision)
    }

    /// Cancel every active replica move that touches `node_id`.
    pub fn cancel_touching(
        &mut self,
        state: &mut ClusterState,
        node_id: NodeId,
        now: Instant,
    ) -> Vec<Ntp> {
        let ntps = self.moves_touching(node_id);
        for ntp in &ntps {
            let _ = self.cancel(state, ntp, now);
        }
        ntps
    }

    /// Cancel every active reconfiguration.
    pub fn cancel_all(&mut self, state: &mut ClusterState, now: Instant) -> Vec<Ntp> {
        let ntps: Vec<Ntp> = self.active.keys().cloned().collect();
        for ntp in &ntps {
            let _ = self.cancel(state, ntp, now);
        }
        ntps
    }

    /// Terminate the reconfiguration right away, keeping whatever replicas are
    /// confirmed at this instant.
    ///
    /// May leave the partition below its replication factor. The result is
    /// flagged as operator-forced.
    pub fn force_abort(
        &mut self,
        state: &mut ClusterState,
        ntp: &Ntp,
        now: Instant,
    ) -> ControllerResult<Revision> {
        let mut reconfiguration = self.active.remove(ntp).ok_or_else(|| {
            ControllerError::NoReconfigurationInProgress { ntp: ntp.clone() }
        })?;

        reconfiguration.operations.clear();
        reconfiguration.operator_forced = true;
        reconfiguration.state = ReconfigurationState::ForceAborted;

        warn!(
            ntp = %ntp,
            revision = %reconfiguration.revision,
            replicas = ?reconfiguration.observed,
            target = ?reconfiguration.target,
            "Reconfiguration force-aborted by operator, replica set may be below target"
        );

        state
            .partitions
            .set_replicas(ntp, reconfiguration.observed.clone());
        self.finish(state, reconfiguration, now);
        Ok(partition_revision(state, ntp))
    }

    /// Forget a partition that no longer exists.
    pub fn drop_partition(&mut self, ntp: &Ntp) {
        self.active.remove(ntp);
        self.finished.remove(ntp);
        self.dirty.remove(ntp);
        metrics::set_reconfigurations_in_progress(self.active.len());
    }

    /// Advance every reconfiguration and return the operations due for
    /// dispatch. Returned operations are marked as dispatching.
    pub fn poll_due(&mut self, state: &mut ClusterState, now: Instant) -> Vec<OperationRequest> {
        let ntps: Vec<Ntp> = self.active.keys().cloned().collect();
        let mut due = Vec::new();

        for ntp in ntps {
            if self.try_finish(state, &ntp, now) {
                continue;
            }
            let leader = state.partitions.get(&ntp).and_then(|p| p.leader_shard());
            let Some(reconfiguration) = self.active.get_mut(&ntp) else {
                continue;
            };
            reconfiguration.plan_operations(leader, now);

            let revision = reconfiguration.revision;
            let group_id = reconfiguration.group_id;
            let mut timed_out = Vec::new();

            for op in reconfiguration.operations.values_mut() {
                match op.status {
                    OperationStatus::Pending if op.next_attempt_at <= now => {
                        op.status = OperationStatus::Dispatching;
                        due.push(OperationRequest {
                            ntp: ntp.clone(),
                            group_id,
                            revision,
                            shard: op.shard,
                            kind: op.kind.clone(),
                            retry_number: op.retry_number,
                        });
                    }
                    OperationStatus::Accepted { since }
                        if now.saturating_duration_since(since) >= self.operation_timeout =>
                    {
                        timed_out.push(op.shard);
                    }
                    _ => {}
                }
            }

            for shard in timed_out {
                self.retry_or_fail(&ntp, shard, "operation timed out".to_string(), true, now);
            }
        }

        due
    }

    /// Apply the dispatcher's answer for a request from [`poll_due`](Self::poll_due).
    pub fn on_dispatch_result(
        &mut self,
        state: &mut ClusterState,
        request: &OperationRequest,
        result: Result<DispatchAck, DispatchError>,
        now: Instant,
    ) {
        let Some(reconfiguration) = self.active.get_mut(&request.ntp) else {
            return;
        };
        if reconfiguration.revision != request.revision {
            metrics::record_stale_report();
            debug!(ntp = %request.ntp, revision = %request.revision, "Dropping dispatch result for stale revision");
            return;
        }
        let Some(op) = reconfiguration.operations.get_mut(&request.shard) else {
            return;
        };
        if op.status != OperationStatus::Dispatching || op.kind != request.kind {
            return;
        }

        match result {
            Ok(DispatchAck::Accepted) => {
                metrics::record_operation_dispatched(request.kind.name(), true);
                op.status = OperationStatus::Accepted { since: now };
            }
            Ok(DispatchAck::Completed) => {
                metrics::record_operation_dispatched(request.kind.name(), true);
                self.apply_success(state, &request.ntp, request.shard);
                self.try_finish(state, &request.ntp, now);
            }
            Err(e) => {
                metrics::record_operation_dispatched(request.kind.name(), false);
                let retriable = e.is_retriable();
                self.retry_or_fail(&request.ntp, request.shard, e.to_string(), retriable, now);
            }
        }
    }

    /// Apply a completion report from a node.
    pub fn on_report(
        &mut self,
        state: &mut ClusterState,
        report: OperationReport,
        now: Instant,
    ) -> ReportOutcome {
        let Some(reconfiguration) = self.active.get_mut(&report.ntp) else {
            return match self.finished.get(&report.ntp) {
                Some(done) if done.revision == report.revision => ReportOutcome::Duplicate,
                _ => {
                    metrics::record_stale_report();
                    ReportOutcome::Stale
                }
            };
        };
        if reconfiguration.revision != report.revision {
            metrics::record_stale_report();
            debug!(
                ntp = %report.ntp,
                report_revision = %report.revision,
                current_revision = %reconfiguration.revision,
                "Dropping stale operation report"
            );
            return ReportOutcome::Stale;
        }
        let Some(op) = reconfiguration.operations.get(&report.shard) else {
            return ReportOutcome::Duplicate;
        };

        match report.result {
            Ok(()) => {
                self.apply_success(state, &report.ntp, report.shard);
                self.try_finish(state, &report.ntp, now);
                ReportOutcome::Applied
            }
            Err(reason) => {
                if !op.is_in_flight() {
                    return ReportOutcome::Duplicate;
                }
                self.retry_or_fail(&report.ntp, report.shard, reason, true, now);
                ReportOutcome::Applied
            }
        }
    }

    /// Record per-node byte counters of a move.
    pub fn on_progress(&mut self, report: ProgressReport) -> ReportOutcome {
        let Some(reconfiguration) = self.active.get_mut(&report.ntp) else {
            return ReportOutcome::Stale;
        };
        if reconfiguration.revision != report.revision {
            metrics::record_stale_report();
            return ReportOutcome::Stale;
        }
        reconfiguration.progress.insert(
            report.node_id,
            NodeProgress {
                bytes_moved: report.bytes_moved,
                bytes_left: report.bytes_left,
            },
        );
        ReportOutcome::Applied
    }

    fn apply_success(&mut self, state: &mut ClusterState, ntp: &Ntp, shard: BrokerShard) {
        let Some(reconfiguration) = self.active.get_mut(ntp) else {
            return;
        };
        let Some(op) = reconfiguration.operations.remove(&shard) else {
            return;
        };

        match op.kind {
            OperationKind::AddReplica { .. } => {
                if !reconfiguration.observed.contains(&shard) {
                    reconfiguration.observed.push(shard);
                }
                state
                    .partitions
                    .set_replicas(ntp, reconfiguration.observed.clone());
            }
            OperationKind::RemoveReplica => {
                reconfiguration.observed.retain(|s| *s != shard);
                reconfiguration.progress.remove(&shard.node_id);
                state
                    .partitions
                    .set_replicas(ntp, reconfiguration.observed.clone());
            }
            OperationKind::TransferLeadership { target } => {
                state.partitions.set_leader(ntp, Some(target));
            }
        }

        debug!(ntp = %ntp, shard = %shard, kind = op.kind.name(), revision = %op.revision, "Operation completed");
        self.dirty.insert(ntp.clone());
    }

    fn retry_or_fail(
        &mut self,
        ntp: &Ntp,
        shard: BrokerShard,
        reason: String,
        retriable: bool,
        now: Instant,
    ) {
        let Some(op) = self
            .active
            .get_mut(ntp)
            .and_then(|r| r.operations.get_mut(&shard))
        else {
            return;
        };

        let kind = op.kind.name();
        if retriable {
            op.retry_number += 1;
            if let Some(delay) = self.schedule.delay_for(op.retry_number) {
                op.status = OperationStatus::Pending;
                op.next_attempt_at = now + delay;
                retry::record_retry_attempt(kind, op.retry_number);
                return;
            }
            retry::record_retry_exhausted(kind);
        }

        warn!(
            ntp = %ntp,
            shard = %shard,
            kind,
            retry_number = op.retry_number,
            reason = %reason,
            "Operation failed"
        );
        op.status = OperationStatus::Failed { reason };
        self.dirty.insert(ntp.clone());
    }

    /// Finish the reconfiguration of `ntp` if it has converged.
    fn try_finish(&mut self, state: &mut ClusterState, ntp: &Ntp, now: Instant) -> bool {
        let leader = state.partitions.get(ntp).and_then(|p| p.leader);
        let converged = self
            .active
            .get(ntp)
            .is_some_and(|r| r.is_converged(leader));
        if !converged {
            return false;
        }
        let Some(mut reconfiguration) = self.active.remove(ntp) else {
            return false;
        };

        reconfiguration.state = match reconfiguration.state {
            ReconfigurationState::Cancelling => ReconfigurationState::Cancelled,
            _ => ReconfigurationState::Done,
        };
        if reconfiguration.kind == ReconfigurationKind::ReplicaMove {
            let goal = reconfiguration.goal().to_vec();
            reconfiguration.observed = goal.clone();
            state.partitions.set_replicas(ntp, goal);
        }

        self.finish(state, reconfiguration, now);
        true
    }

    fn finish(&mut self, state: &mut ClusterState, reconfiguration: Reconfiguration, now: Instant) {
        let ntp = reconfiguration.ntp.clone();
        state
            .partitions
            .set_status(&ntp, PartitionStatus::Normal, reconfiguration.revision);

        let duration = now.saturating_duration_since(reconfiguration.started_at);
        metrics::record_reconfiguration_finished(
            &reconfiguration.state.to_string(),
            duration.as_secs_f64(),
        );
        if reconfiguration.kind == ReconfigurationKind::ReplicaMove {
            info!(
                ntp = %ntp,
                revision = %reconfiguration.revision,
                outcome = %reconfiguration.state,
                replicas = ?reconfiguration.observed,
                duration_ms = duration.as_millis() as u64,
                "Reconfiguration finished"
            );
        }

        self.finished.insert(ntp.clone(), reconfiguration);
        self.dirty.insert(ntp);
        metrics::set_reconfigurations_in_progress(self.active.len());
    }

    /// Durable record of one partition's assignment.
    pub fn assignment_record(&self, state: &ClusterState, ntp: &Ntp) -> Option<AssignmentRecord> {
        let partition = state.partitions.get(ntp)?;
        let intent = self.active.get(ntp).map(|r| PersistedIntent {
            kind: r.kind,
            source: r.source,
            previous: r.previous.clone(),
            target: r.target.clone(),
            cancelling: r.state == ReconfigurationState::Cancelling,
        });
        Some(AssignmentRecord {
            ntp: ntp.clone(),
            group_id: partition.group_id,
            replication_factor: partition.replication_factor,
            replicas: partition.replicas.clone(),
            leader: partition.leader,
            revision: partition.revision,
            intent,
        })
    }

    /// Rebuild state from durable records after gaining leadership.
    ///
    /// Every operation starts over as pending; nodes treat repeated adds and
    /// removes as no-ops.
    pub fn restore(
        &mut self,
        state: &mut ClusterState,
        records: Vec<AssignmentRecord>,
        now: Instant,
    ) {
        self.active.clear();
        self.dirty.clear();

        for record in records {
            state.partitions.upsert_from_record(&record);
            let Some(intent) = record.intent else {
                continue;
            };

            let size = state
                .partitions
                .get(&record.ntp)
                .map(|p| p.size_bytes)
                .unwrap_or(0);
            let reconfiguration = Reconfiguration {
                ntp: record.ntp.clone(),
                group_id: record.group_id,
                kind: intent.kind,
                source: intent.source,
                revision: record.revision,
                previous: intent.previous,
                target: intent.target,
                observed: record.replicas,
                state: if intent.cancelling {
                    ReconfigurationState::Cancelling
                } else {
                    ReconfigurationState::InProgress
                },
                operations: BTreeMap::new(),
                progress: BTreeMap::new(),
                partition_size: size,
                operator_forced: false,
                started_at: now,
            };
            info!(ntp = %record.ntp, revision = %record.revision, "Resuming reconfiguration");
            self.install(state, reconfiguration);
        }

        self.dirty.clear();
        metrics::set_reconfigurations_in_progress(self.active.len());
    }
}

/// Observed set a superseding revision starts from.
///
/// Operations still on a node when their revision is replaced will never be
/// reported. Their replicas are assumed present if the new goal does not want
/// them (so they get removed) and absent if it does (so they get added again).
fn resolve_in_flight(old: &Reconfiguration, goal: &[BrokerShard]) -> Vec<BrokerShard> {
    let mut observed = old.observed.clone();
    for op in old.operations.values().filter(|op| op.is_in_flight()) {
        let wanted = goal.contains(&op.shard);
        match op.kind {
            OperationKind::AddReplica { .. } | OperationKind::RemoveReplica => {
                let present = observed.contains(&op.shard);
                if wanted && present && op.kind == OperationKind::RemoveReplica {
                    observed.retain(|s| *s != op.shard);
                } else if !wanted && !present {
                    observed.push(op.shard);
                }
            }
            OperationKind::TransferLeadership { .. } => {}
        }
    }
    observed
}

fn validate_replica_set(
    state: &ClusterState,
    ntp: &Ntp,
    target: &[BrokerShard],
) -> ControllerResult<()> {
    if target.is_empty() {
        return Err(ControllerError::InvalidReplicaSet {
            ntp: ntp.clone(),
            reason: "replica set is empty".to_string(),
        });
    }
    let nodes: BTreeSet<NodeId> = target.iter().map(|s| s.node_id).collect();
    if nodes.len() != target.len() {
        return Err(ControllerError::InvalidReplicaSet {
            ntp: ntp.clone(),
            reason: "more than one replica on a node".to_string(),
        });
    }
    for shard in target {
        let node = state
            .directory
            .get(shard.node_id)
            .ok_or(ControllerError::NodeNotFound {
                node_id: shard.node_id,
            })?;
        if node.is_removed() {
            return Err(ControllerError::NodeRemoved {
                node_id: shard.node_id,
            });
        }
        if shard.core >= node.cores {
            return Err(ControllerError::InvalidReplicaSet {
                ntp: ntp.clone(),
                reason: format!("node {} has no core {}", shard.node_id, shard.core),
            });
        }
    }
    Ok(())
}

fn same_members(a: &[BrokerShard], b: &[BrokerShard]) -> bool {
    let a: BTreeSet<_> = a.iter().collect();
    let b: BTreeSet<_> = b.iter().collect();
    a == b
}

fn partition_revision(state: &ClusterState, ntp: &Ntp) -> Revision {
    state
        .partitions
        .get(ntp)
        .map(|p| p.revision)
        .unwrap_or_default()
}
