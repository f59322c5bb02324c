//! # shardctl
//! Control plane for a partitioned, replicated log cluster.
//!
//! `shardctl` decides where every partition's replicas live, moves replicas and
//! leadership until the cluster matches that decision, and runs node lifecycle
//! workflows such as decommission and maintenance. The data path (the
//! replication protocol, on-disk log format and network transport) lives
//! elsewhere; this crate talks to nodes through the
//! [`NodeDispatcher`](cluster::NodeDispatcher) trait and persists its intents
//! through the [`AssignmentStore`](cluster::AssignmentStore) trait.
//!
//! # Goals
//! - One elected controller drives the cluster; a successor resumes from the
//!   durable store
//! - Replica moves never drop a partition below its quorum floor
//! - Deterministic planning components that can be tested without a runtime
//!
//! ## Getting started
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use shardctl::prelude::*;
//!
//! async fn start(dispatcher: Arc<dyn NodeDispatcher>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     shardctl::telemetry::init_logging(shardctl::telemetry::LogFormat::from_env())?;
//!
//!     let controller = Arc::new(Controller::new(
//!         ControllerConfig::from_env()?,
//!         dispatcher,
//!         Arc::new(InMemoryAssignmentStore::new()),
//!         tokio::runtime::Handle::current(),
//!     )?);
//!     controller.become_leader().await?;
//!     controller.register_node(NodeId(1), Some("rack-a".into()), 4).await?;
//!     controller.create_topic("kafka", "orders", 6, 1).await?;
//!
//!     let handles = controller.start_background_tasks();
//!     // ...
//!     handles.abort_all();
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]

pub mod cluster;
pub mod constants;
pub mod telemetry;
pub mod types;

pub mod prelude {
    //! Commonly used types.
    pub use crate::cluster::{
        AssignmentStore, ClusterState, Controller, ControllerConfig,
        ControllerError, ControllerProfile, ControllerResult, DiskSample, DispatchAck,
        DispatchError, InMemoryAssignmentStore, NodeDispatcher, OperationKind, OperationReport,
        OperationRequest, PartitionView, ReconfigurationState, ReconfigurationView,
    };
    pub use crate::types::{BrokerShard, GroupId, NodeId, Ntp, Revision, quorum_floor};
}
