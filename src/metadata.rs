//! Cluster metadata cache: which broker leads each partition.
//!
//! The cache is replaced wholesale on every refresh: partition leadership
//! moves in bulk during elections, and a full swap keeps the map consistent
//! with a single broker's view of the cluster. Individual entries are
//! invalidated in between refreshes when a produce response carries a
//! leadership error or a leader refuses connection; the next lookup misses
//! and forces a refresh.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::debug;

use crate::protocol::{BrokerIdentity, MetadataResponse};

/// One partition of one topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPartition {
    pub topic: String,
    pub partition_id: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition_id: i32) -> Self {
        Self {
            topic: topic.into(),
            partition_id,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    leaders: HashMap<TopicPartition, i32>,
    brokers: HashMap<i32, BrokerIdentity>,
    last_refresh: Option<Instant>,
}

/// Shared, internally locked cache. Lookups take the lock briefly; the
/// refresh RPC itself happens outside it.
#[derive(Debug, Default)]
pub struct MetadataCache {
    inner: Mutex<Inner>,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves the leader for a partition to its node id and identity.
    pub fn leader_identity(&self, topic: &str, partition_id: i32) -> Option<(i32, BrokerIdentity)> {
        let inner = self.inner.lock();
        let key = TopicPartition::new(topic, partition_id);
        let node_id = *inner.leaders.get(&key)?;
        let identity = inner.brokers.get(&node_id)?.clone();
        Some((node_id, identity))
    }

    /// When the cache last applied a metadata response.
    pub fn last_refresh(&self) -> Option<Instant> {
        self.inner.lock().last_refresh
    }

    /// Drops the leadership entry for one partition.
    pub fn invalidate(&self, topic: &str, partition_id: i32) {
        let mut inner = self.inner.lock();
        inner
            .leaders
            .remove(&TopicPartition::new(topic, partition_id));
    }

    /// Drops every leadership entry naming `node_id`, for when the broker
    /// itself refuses connection.
    pub fn invalidate_node(&self, node_id: i32) {
        let mut inner = self.inner.lock();
        inner.leaders.retain(|_, leader| *leader != node_id);
    }

    /// Applies a metadata response: swaps in the new partition map and
    /// reconciles the broker set. Returns the node ids whose connections
    /// are no longer valid (host/port changed, or gone from the cluster) so
    /// the client can close them.
    pub fn apply(&self, response: &MetadataResponse) -> Vec<i32> {
        let mut inner = self.inner.lock();
        let mut stale_nodes = Vec::new();

        let mut brokers = HashMap::with_capacity(response.brokers.len());
        for identity in &response.brokers {
            if let Some(known) = inner.brokers.get(&identity.node_id) {
                if known.host != identity.host || known.port != identity.port {
                    stale_nodes.push(identity.node_id);
                }
            }
            brokers.insert(identity.node_id, identity.clone());
        }
        for node_id in inner.brokers.keys() {
            if !brokers.contains_key(node_id) {
                stale_nodes.push(*node_id);
            }
        }
        inner.brokers = brokers;

        let mut leaders = HashMap::new();
        for topic in &response.topics {
            for partition in &topic.partitions {
                // A negative leader means an election is in progress; leave
                // the entry out so the next lookup forces a refresh.
                if partition.leader >= 0 {
                    leaders.insert(
                        TopicPartition::new(topic.name.clone(), partition.partition_id),
                        partition.leader,
                    );
                }
            }
        }
        inner.leaders = leaders;
        inner.last_refresh = Some(Instant::now());

        debug!("metadata cache updated:\n{}", dump(&inner));
        stale_nodes
    }
}

fn dump(inner: &Inner) -> String {
    let mut out = String::from("brokers:\n");
    let mut nodes: Vec<_> = inner.brokers.values().collect();
    nodes.sort_by_key(|b| b.node_id);
    for broker in nodes {
        let _ = writeln!(out, "  {}", broker);
    }
    out.push_str("partitions:\n");
    let mut entries: Vec<_> = inner.leaders.iter().collect();
    entries.sort_by(|a, b| a.0.topic.cmp(&b.0.topic).then(a.0.partition_id.cmp(&b.0.partition_id)));
    for (tp, leader) in entries {
        let _ = writeln!(out, "  {}[{}] -> node {}", tp.topic, tp.partition_id, leader);
    }
    out
}
