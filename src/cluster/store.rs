//! Durable assignment records and an in-memory store.
//!
//! An [`AssignmentRecord`] captures everything a new controller needs to
//! resume a partition: current replicas, leader, revision, and the intent of an
//! unfinished reconfiguration. [`NodeRecord`] keeps lifecycle decisions
//! (decommissioning, removal, maintenance) across controller handovers; node
//! liveness and disk samples are not persisted and refill from heartbeats.
//!
//! Records are stored as JSON so any byte-oriented key-value store can hold
//! them.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

use super::broker_directory::{MaintenanceState, MembershipState, NodeMetadata};
use super::error::{ControllerError, ControllerResult};
use super::reconciler::{IntentSource, ReconfigurationKind};
use super::traits::AssignmentStore;
use crate::types::{BrokerShard, GroupId, NodeId, Ntp, Revision};

/// Unfinished reconfiguration of a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedIntent {
    pub kind: ReconfigurationKind,
    pub source: IntentSource,
    pub previous: Vec<BrokerShard>,
    pub target: Vec<BrokerShard>,
    pub cancelling: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentRecord {
    pub ntp: Ntp,
    pub group_id: GroupId,
    pub replication_factor: usize,
    pub replicas: Vec<BrokerShard>,
    pub leader: Option<NodeId>,
    pub revision: Revision,
    pub intent: Option<PersistedIntent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: NodeId,
    pub rack: Option<String>,
    pub cores: u32,
    pub membership: MembershipState,
    pub maintenance: MaintenanceState,
    /// Removal was forced by an operator with replicas still assigned.
    pub forced_removal: bool,
}

impl AssignmentRecord {
    pub fn encode(&self) -> ControllerResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ControllerError::Store(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> ControllerResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| ControllerError::Store(format!("corrupt assignment record: {}", e)))
    }
}

impl NodeRecord {
    pub fn from_metadata(node: &NodeMetadata, forced_removal: bool) -> Self {
        Self {
            node_id: node.node_id,
            rack: node.rack.clone(),
            cores: node.cores,
            membership: node.membership,
            maintenance: node.maintenance,
            forced_removal,
        }
    }

    pub fn encode(&self) -> ControllerResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ControllerError::Store(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> ControllerResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| ControllerError::Store(format!("corrupt node record: {}", e)))
    }
}

/// [`AssignmentStore`] backed by concurrent maps of encoded records.
///
/// Survives controller handovers within one process, which is enough for
/// tests and single-process simulations. Writes can be made to fail to
/// exercise store error paths.
#[derive(Debug, Default)]
pub struct InMemoryAssignmentStore {
    assignments: DashMap<Ntp, Vec<u8>>,
    nodes: DashMap<NodeId, Vec<u8>>,
    fail_writes: AtomicBool,
}

impl InMemoryAssignmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn assignment(&self, ntp: &Ntp) -> Option<AssignmentRecord> {
        self.assignments
            .get(ntp)
            .and_then(|r| AssignmentRecord::decode(r.value()).ok())
    }

    pub fn assignment_count(&self) -> usize {
        self.assignments.len()
    }

    fn check_writable(&self) -> ControllerResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ControllerError::Store("store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl AssignmentStore for InMemoryAssignmentStore {
    async fn save_assignments(&self, records: Vec<AssignmentRecord>) -> ControllerResult<()> {
        self.check_writable()?;
        for record in records {
            let bytes = record.encode()?;
            self.assignments.insert(record.ntp, bytes);
        }
        Ok(())
    }

    async fn delete_assignments(&self, ntps: Vec<Ntp>) -> ControllerResult<()> {
        self.check_writable()?;
        for ntp in ntps {
            self.assignments.remove(&ntp);
        }
        Ok(())
    }

    async fn load_assignments(&self) -> ControllerResult<Vec<AssignmentRecord>> {
        let mut records = self
            .assignments
            .iter()
            .map(|r| AssignmentRecord::decode(r.value()))
            .collect::<ControllerResult<Vec<_>>>()?;
        records.sort_by(|a, b| a.ntp.cmp(&b.ntp));
        Ok(records)
    }

    async fn save_node(&self, record: NodeRecord) -> ControllerResult<()> {
        self.check_writable()?;
        self.nodes.insert(record.node_id, record.encode()?);
        Ok(())
    }

    async fn load_nodes(&self) -> ControllerResult<Vec<NodeRecord>> {
        let mut records = self
            .nodes
            .iter()
            .map(|r| NodeRecord::decode(r.value()))
            .collect::<ControllerResult<Vec<_>>>()?;
        records.sort_by_key(|r| r.node_id);
        Ok(records)
    }

    async fn get_node(&self, node_id: NodeId) -> ControllerResult<Option<NodeRecord>> {
        self.nodes
            .get(&node_id)
            .map(|r| NodeRecord::decode(r.value()))
            .transpose()
    }
}
