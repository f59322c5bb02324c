//! Control plane of a partitioned, replicated log cluster.
//!
//! Decides where every partition's replicas live, drives replica moves and
//! leadership transfers to convergence and runs node lifecycle (decommission,
//! maintenance).
//!
//! # Architecture
//!
//! ```text
//!        ┌──────────────────┐      ┌────────────────┐
//!        │ Broker Directory │      │ Partition Table│
//!        └────────┬─────────┘      └───────┬────────┘
//!                 └────────────┬───────────┘
//!                              ▼
//!                       ┌─────────────┐
//!                       │ClusterState │
//!                       └──────┬──────┘
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!   ┌─────────────┐    ┌───────────────┐    ┌──────────────┐
//!   │   Planner   │    │Leader Balancer│    │Node Lifecycle│
//!   │ (Allocator) │    └───────┬───────┘    └──────┬───────┘
//!   └──────┬──────┘            │                   │
//!          └───────── intents ─┼───────────────────┘
//!                              ▼
//!                       ┌─────────────┐       ┌────────────────┐
//!                       │ Reconciler  │──────►│ NodeDispatcher │
//!                       └──────┬──────┘       └────────────────┘
//!                              ▼
//!                      ┌────────────────┐
//!                      │AssignmentStore │
//!                      └────────────────┘
//! ```
//!
//! Planning components are synchronous and take the cluster state and the
//! current time as arguments. The async [`Controller`] owns them, talks to
//! nodes through a [`NodeDispatcher`] and persists intents through an
//! [`AssignmentStore`].
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use shardctl::cluster::{Controller, ControllerConfig, InMemoryAssignmentStore, NodeDispatcher};
//!
//! async fn run(dispatcher: Arc<dyn NodeDispatcher>) -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ControllerConfig::from_env()?;
//!     let store = Arc::new(InMemoryAssignmentStore::new());
//!     let controller = Arc::new(Controller::new(
//!         config,
//!         dispatcher,
//!         store,
//!         tokio::runtime::Handle::current(),
//!     )?);
//!
//!     controller.become_leader().await?;
//!     let handles = controller.start_background_tasks();
//!     // ... serve admin requests and node reports ...
//!     controller.stop();
//!     handles.abort_all();
//!     Ok(())
//! }
//! ```

pub mod allocator;
pub mod broker_directory;
mod config;
pub mod controller;
mod error;
pub mod leader_balancer;
pub mod lifecycle;
pub mod metrics;
pub mod partition_table;
pub mod planner;
pub mod reconciler;
pub mod retry;
pub mod state;
pub mod store;
mod traits;

#[cfg(any(test, feature = "test-utilities"))]
pub mod mock_dispatcher;

pub use allocator::{AllocationState, PartitionAllocator, Placement, Replacement};
pub use broker_directory::{
    BrokerDirectory, DiskSample, MaintenanceState, MembershipState, NodeCommand, NodeMetadata,
    NodeResponse,
};
pub use config::{
    AllocatorConfig, ControllerConfig, ControllerProfile, LeaderBalancerConfig, PlannerConfig,
    ReconcilerConfig, RetryConfig,
};
pub use controller::{
    BackgroundTaskHandles, Controller, ControllerStateSummary, PartitionView, TickSummary,
};
pub use error::{AllocationError, ControllerError, ControllerResult, DispatchError};
pub use leader_balancer::{LeaderBalanceDecision, LeaderBalancer, LeadershipTransfer};
pub use lifecycle::{DecommissionStatus, MaintenanceStatus, NodeLifecycle};
#[cfg(any(test, feature = "test-utilities"))]
pub use mock_dispatcher::{MockNodeDispatcher, NodeBehavior};
pub use partition_table::{PartitionMetadata, PartitionStatus, PartitionTable, TopicInfo};
pub use planner::{
    BalancerPlanner, MoveReason, PartitionAllocationFailure, PlanResult, PlanViolations,
    PlannerStatus, ReplicaMoveIntent,
};
pub use reconciler::{
    DispatchAck, IntentSource, OperationKind, OperationReport, OperationRequest, ProgressReport,
    Reconciler, Reconfiguration, ReconfigurationKind, ReconfigurationState, ReconfigurationView,
    ReportOutcome,
};
pub use state::ClusterState;
pub use store::{AssignmentRecord, InMemoryAssignmentStore, NodeRecord, PersistedIntent};
pub use traits::{AssignmentStore, NodeDispatcher};
