//! Partition table: topics, replica assignments and leaders.
//!
//! The table holds the *current* replica set of every partition. While a
//! partition is reconfiguring, the reconciler keeps the table in step with the
//! replicas nodes have confirmed, so planners always see what is really there.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cluster::error::{ControllerError, ControllerResult};
use crate::cluster::store::AssignmentRecord;
use crate::types::{BrokerShard, GroupId, NodeId, Ntp, Revision};

/// Whether a partition's replica set is changing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PartitionStatus {
    #[default]
    Normal,
    Reconfiguring,
}

/// A topic and the partitions it was created with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicInfo {
    pub namespace: Arc<str>,
    pub name: Arc<str>,
    pub partition_count: i32,
    pub replication_factor: usize,
    pub created_at_ms: u64,
}

/// State of one partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionMetadata {
    pub ntp: Ntp,
    pub group_id: GroupId,
    pub replication_factor: usize,
    /// Ordered replica set; the first entry is the preferred leader.
    pub replicas: Vec<BrokerShard>,
    pub leader: Option<NodeId>,
    pub status: PartitionStatus,
    /// Revision of the latest assignment intent for this partition.
    pub revision: Revision,
    /// Partition size as last reported by its leader.
    pub size_bytes: u64,
    /// Last reported log end offset per replica.
    pub log_positions: BTreeMap<NodeId, i64>,
}

impl PartitionMetadata {
    pub fn replica_nodes(&self) -> Vec<NodeId> {
        self.replicas.iter().map(|r| r.node_id).collect()
    }

    pub fn hosts(&self, node_id: NodeId) -> bool {
        self.replicas.iter().any(|r| r.node_id == node_id)
    }

    /// The replica entry on `node_id`, if any.
    pub fn shard_on(&self, node_id: NodeId) -> Option<BrokerShard> {
        self.replicas.iter().copied().find(|r| r.node_id == node_id)
    }

    /// Shard hosting the leader replica.
    pub fn leader_shard(&self) -> Option<BrokerShard> {
        self.leader.and_then(|leader| self.shard_on(leader))
    }

    /// How far `node_id` trails the leader, in offsets.
    ///
    /// `None` when either position is unknown; callers treat unknown as
    /// not up to date.
    pub fn follower_lag(&self, node_id: NodeId) -> Option<i64> {
        let leader = self.leader?;
        let leader_pos = *self.log_positions.get(&leader)?;
        let follower_pos = *self.log_positions.get(&node_id)?;
        Some((leader_pos - follower_pos).max(0))
    }
}

/// All partitions of the cluster, keyed by NTP.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PartitionTable {
    topics: BTreeMap<(Arc<str>, Arc<str>), TopicInfo>,
    partitions: BTreeMap<Ntp, PartitionMetadata>,
    next_group_id: i64,
}

impl PartitionTable {
    pub fn new() -> Self {
        Self {
            next_group_id: 1,
            ..Default::default()
        }
    }

    pub fn topic_exists(&self, namespace: &str, topic: &str) -> bool {
        self.topics
            .contains_key(&(Arc::from(namespace), Arc::from(topic)))
    }

    pub fn topics(&self) -> impl Iterator<Item = &TopicInfo> {
        self.topics.values()
    }

    /// Insert a topic with one placement per partition.
    ///
    /// The first replica of each placement becomes the initial leader.
    pub fn create_topic(
        &mut self,
        namespace: &str,
        topic: &str,
        replication_factor: usize,
        placements: Vec<Vec<BrokerShard>>,
        timestamp_ms: u64,
    ) -> ControllerResult<Vec<Ntp>> {
        if self.topic_exists(namespace, topic) {
            return Err(ControllerError::TopicAlreadyExists {
                namespace: namespace.to_string(),
                topic: topic.to_string(),
            });
        }

        let namespace: Arc<str> = Arc::from(namespace);
        let name: Arc<str> = Arc::from(topic);
        let mut created = Vec::with_capacity(placements.len());

        for (index, replicas) in placements.into_iter().enumerate() {
            let ntp = Ntp {
                namespace: namespace.clone(),
                topic: name.clone(),
                partition: index as i32,
            };
            let group_id = self.allocate_group_id();
            let leader = replicas.first().map(|r| r.node_id);
            self.partitions.insert(
                ntp.clone(),
                PartitionMetadata {
                    ntp: ntp.clone(),
                    group_id,
                    replication_factor,
                    replicas,
                    leader,
                    status: PartitionStatus::Normal,
                    revision: Revision::INITIAL,
                    size_bytes: 0,
                    log_positions: BTreeMap::new(),
                },
            );
            created.push(ntp);
        }

        self.topics.insert(
            (namespace.clone(), name.clone()),
            TopicInfo {
                namespace,
                name,
                partition_count: created.len() as i32,
                replication_factor,
                created_at_ms: timestamp_ms,
            },
        );
        Ok(created)
    }

    /// Remove a topic and return the partitions that were dropped.
    pub fn delete_topic(&mut self, namespace: &str, topic: &str) -> Vec<Ntp> {
        let key = (Arc::from(namespace), Arc::from(topic));
        if self.topics.remove(&key).is_none() {
            return Vec::new();
        }
        let removed: Vec<Ntp> = self
            .partitions
            .keys()
            .filter(|ntp| *ntp.namespace == *namespace && *ntp.topic == *topic)
            .cloned()
            .collect();
        for ntp in &removed {
            self.partitions.remove(ntp);
        }
        removed
    }

    /// Insert or replace a partition from its durable record.
    ///
    /// Recreates the topic entry if needed. Size and log positions start
    /// empty and refill from node reports.
    pub fn upsert_from_record(&mut self, record: &AssignmentRecord) {
        let ntp = record.ntp.clone();
        self.next_group_id = self.next_group_id.max(record.group_id.value() + 1);

        let key = (ntp.namespace.clone(), ntp.topic.clone());
        let topic = self.topics.entry(key).or_insert_with(|| TopicInfo {
            namespace: ntp.namespace.clone(),
            name: ntp.topic.clone(),
            partition_count: 0,
            replication_factor: record.replication_factor,
            created_at_ms: 0,
        });
        topic.partition_count = topic.partition_count.max(ntp.partition + 1);

        let status = if record.intent.is_some() {
            PartitionStatus::Reconfiguring
        } else {
            PartitionStatus::Normal
        };
        self.partitions.insert(
            ntp.clone(),
            PartitionMetadata {
                ntp,
                group_id: record.group_id,
                replication_factor: record.replication_factor,
                replicas: record.replicas.clone(),
                leader: record.leader,
                status,
                revision: record.revision,
                size_bytes: 0,
                log_positions: BTreeMap::new(),
            },
        );
    }

    fn allocate_group_id(&mut self) -> GroupId {
        let id = GroupId(self.next_group_id.max(1));
        self.next_group_id = id.value() + 1;
        id
    }

    pub fn get(&self, ntp: &Ntp) -> Option<&PartitionMetadata> {
        self.partitions.get(ntp)
    }

    pub fn get_mut(&mut self, ntp: &Ntp) -> Option<&mut PartitionMetadata> {
        self.partitions.get_mut(ntp)
    }

    /// Like [`get`](Self::get) but with a typed not-found error.
    pub fn require(&self, ntp: &Ntp) -> ControllerResult<&PartitionMetadata> {
        self.partitions
            .get(ntp)
            .ok_or_else(|| ControllerError::PartitionNotFound { ntp: ntp.clone() })
    }

    pub fn iter(&self) -> impl Iterator<Item = &PartitionMetadata> {
        self.partitions.values()
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    /// Partitions with a replica on `node_id`, in NTP order.
    pub fn partitions_on(&self, node_id: NodeId) -> Vec<Ntp> {
        self.partitions
            .values()
            .filter(|p| p.hosts(node_id))
            .map(|p| p.ntp.clone())
            .collect()
    }

    /// Partitions currently led by `node_id`, in NTP order.
    pub fn led_by(&self, node_id: NodeId) -> Vec<Ntp> {
        self.partitions
            .values()
            .filter(|p| p.leader == Some(node_id))
            .map(|p| p.ntp.clone())
            .collect()
    }

    /// Replace the observed replica set. Clears the leader if it left.
    pub fn set_replicas(&mut self, ntp: &Ntp, replicas: Vec<BrokerShard>) {
        if let Some(p) = self.partitions.get_mut(ntp) {
            p.replicas = replicas;
            if let Some(leader) = p.leader
                && !p.hosts(leader)
            {
                p.leader = None;
            }
            let nodes = p.replica_nodes();
            p.log_positions.retain(|node, _| nodes.contains(node));
        }
    }

    pub fn set_leader(&mut self, ntp: &Ntp, leader: Option<NodeId>) {
        if let Some(p) = self.partitions.get_mut(ntp) {
            p.leader = leader;
        }
    }

    pub fn set_status(&mut self, ntp: &Ntp, status: PartitionStatus, revision: Revision) {
        if let Some(p) = self.partitions.get_mut(ntp) {
            p.status = status;
            p.revision = p.revision.max(revision);
        }
    }

    /// Record a replica's log end offset (and the partition size when the
    /// report comes from the leader).
    pub fn record_progress(
        &mut self,
        ntp: &Ntp,
        node_id: NodeId,
        log_end_offset: i64,
        size_bytes: Option<u64>,
    ) {
        if let Some(p) = self.partitions.get_mut(ntp) {
            if !p.hosts(node_id) {
                return;
            }
            p.log_positions.insert(node_id, log_end_offset);
            if let Some(size) = size_bytes
                && p.leader == Some(node_id)
            {
                p.size_bytes = size;
            }
        }
    }
}
