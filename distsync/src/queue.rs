//! The partitioned queue state machine, per §4.5: a consistent hash ring picks partitions,
//! delivery is at-least-once with a redelivery timer, and produced messages are durably
//! persisted by the leader.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::convert::TryInto;

use md5::Digest;
use md5::Md5;
use raft::NodeId;

use crate::command::CommandResponse;
use crate::command::Message;

/// A consistent hash ring over the cluster's nodes, used to pick a message's partition from an
/// optional partition key. Virtual nodes smooth the distribution across a small node count.
pub struct ConsistentHashRing {
    virtual_nodes: u32,
    ring: BTreeMap<u128, NodeId>,
}

impl ConsistentHashRing {
    pub fn new(nodes: &[NodeId], virtual_nodes: u32) -> Self {
        let mut ring = Self {
            virtual_nodes,
            ring: BTreeMap::new(),
        };
        for &node in nodes {
            ring.add_node(node);
        }
        ring
    }

    pub fn add_node(&mut self, node: NodeId) {
        for i in 0..self.virtual_nodes {
            let hash = md5_u128(&format!("{}:{}", node, i));
            self.ring.insert(hash, node);
        }
    }

    pub fn remove_node(&mut self, node: NodeId) {
        self.ring.retain(|_, &mut n| n != node);
    }

    /// The node owning `key`, i.e. the first ring entry at or after `key`'s hash, wrapping
    /// around to the smallest entry if none is found.
    pub fn get_node(&self, key: &str) -> Option<NodeId> {
        if self.ring.is_empty() {
            return None;
        }
        let hash = md5_u128(key);
        self.ring.range(hash..).next().or_else(|| self.ring.iter().next()).map(|(_, &n)| n)
    }
}

fn md5_u128(key: &str) -> u128 {
    let digest = Md5::digest(key.as_bytes());
    u128::from_be_bytes(digest[0..16].try_into().unwrap())
}

/// Map a partition key (or a round-robin counter, if none was given) onto `[0, partitions)`.
pub fn partition_for(key: Option<&str>, round_robin_counter: u64, partitions: u32) -> u32 {
    match key {
        Some(k) => (md5_u128(k) % partitions as u128) as u32,
        None => (round_robin_counter % partitions as u64) as u32,
    }
}

struct PendingAck {
    message: Message,
    delivered_ts: u64,
}

/// The deterministic, replicated queue state: one FIFO per partition, plus the table of
/// outstanding (unacknowledged) deliveries.
pub struct QueueManager {
    partitions: BTreeMap<u32, VecDeque<Message>>,
    pending_acks: BTreeMap<(String, String), PendingAck>,
    partition_count: u32,
    /// Which node the consistent hash ring currently assigns as the preferred owner of each
    /// partition. Every node replicates every partition's full state regardless (a single Raft
    /// log, per the Non-goals), so this is advisory only — used to pick which peer a consumer
    /// is pointed at first rather than to gate where data actually lives.
    partition_owners: BTreeMap<u32, NodeId>,
}

impl QueueManager {
    pub fn new(partition_count: u32, nodes: &[NodeId], virtual_nodes: u32) -> Self {
        let mut partitions = BTreeMap::new();
        for p in 0..partition_count {
            partitions.insert(p, VecDeque::new());
        }
        let ring = ConsistentHashRing::new(nodes, virtual_nodes);
        let partition_owners = (0..partition_count).filter_map(|p| ring.get_node(&p.to_string()).map(|n| (p, n))).collect();
        Self {
            partitions,
            pending_acks: BTreeMap::new(),
            partition_count,
            partition_owners,
        }
    }

    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    /// The node the consistent hash ring currently prefers for `partition`, if the ring is
    /// non-empty.
    pub fn partition_owner(&self, partition: u32) -> Option<NodeId> {
        self.partition_owners.get(&partition).copied()
    }

    #[tracing::instrument(level = "debug", skip(self, message))]
    pub fn apply_produce(&mut self, message: Message) -> CommandResponse {
        let message_id = message.message_id.clone();
        let partition = message.partition;
        self.partitions.entry(partition).or_default().push_back(message);
        CommandResponse::Produce { message_id, partition }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub fn apply_consume(&mut self, partition: u32, consumer_id: &str, now_ts: u64) -> CommandResponse {
        let message = match self.partitions.get_mut(&partition).and_then(|q| q.pop_front()) {
            Some(mut m) => {
                m.attempts += 1;
                m
            }
            None => return CommandResponse::Consume { message: None },
        };
        self.pending_acks.insert(
            (consumer_id.to_string(), message.message_id.clone()),
            PendingAck {
                message: message.clone(),
                delivered_ts: now_ts,
            },
        );
        CommandResponse::Consume { message: Some(message) }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub fn apply_ack(&mut self, consumer_id: &str, message_id: &str) -> CommandResponse {
        self.pending_acks.remove(&(consumer_id.to_string(), message_id.to_string()));
        CommandResponse::Ack
    }

    /// Reinsert `message_id` at the head of its partition, dropping its pending-ack entry,
    /// wherever it currently is outstanding.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn apply_requeue(&mut self, message_id: &str) -> CommandResponse {
        let key = self.pending_acks.keys().find(|(_, mid)| mid == message_id).cloned();
        if let Some(key) = key {
            if let Some(pending) = self.pending_acks.remove(&key) {
                let partition = pending.message.partition;
                self.partitions.entry(partition).or_default().push_front(pending.message);
            }
        }
        CommandResponse::Requeue
    }

    /// Entries whose visibility timeout has elapsed as of `now_ts`, for the redelivery loop to
    /// propose `requeue` commands for.
    pub fn expired_pending_acks(&self, now_ts: u64, visibility_timeout: u64) -> Vec<String> {
        self.pending_acks
            .values()
            .filter(|p| now_ts.saturating_sub(p.delivered_ts) >= visibility_timeout)
            .map(|p| p.message.message_id.clone())
            .collect()
    }

    pub fn partition_len(&self, partition: u32) -> usize {
        self.partitions.get(&partition).map(VecDeque::len).unwrap_or(0)
    }

    pub fn pending_ack_count(&self) -> usize {
        self.pending_acks.len()
    }

    /// Reinsert any durably-stored message not marked delivered, used on leader startup to
    /// recover from a prior crash (§4.5 Recovery).
    pub fn recover_message(&mut self, message: Message) {
        if !message.delivered {
            let partition = message.partition;
            self.partitions.entry(partition).or_default().push_back(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: &str, partition: u32) -> Message {
        Message {
            message_id: id.to_string(),
            partition,
            payload: b"x".to_vec(),
            produced_ts: 0,
            attempts: 0,
            delivered: false,
        }
    }

    #[test]
    fn ring_is_deterministic() {
        let ring = ConsistentHashRing::new(&[1, 2, 3], 150);
        let a = ring.get_node("some-key");
        let b = ring.get_node("some-key");
        assert_eq!(a, b);
        assert!(a.is_some());
    }

    #[test]
    fn produce_then_consume_then_ack() {
        let mut qm = QueueManager::new(4, &[1, 2, 3], 32);
        qm.apply_produce(msg("m1", 0));
        let resp = qm.apply_consume(0, "consumer-a", 1_000);
        let message = match resp {
            CommandResponse::Consume { message: Some(m) } => m,
            other => panic!("expected a message, got {:?}", other),
        };
        assert_eq!(message.attempts, 1);
        qm.apply_ack("consumer-a", &message.message_id);
        assert_eq!(qm.pending_ack_count(), 0);
    }

    #[test]
    fn unacked_message_expires_and_is_requeued() {
        let mut qm = QueueManager::new(4, &[1, 2, 3], 32);
        qm.apply_produce(msg("m1", 0));
        qm.apply_consume(0, "consumer-a", 1_000);
        assert!(qm.expired_pending_acks(1_000 + 30_000, 30_000).contains(&"m1".to_string()));
        qm.apply_requeue("m1");
        assert_eq!(qm.pending_ack_count(), 0);
        assert_eq!(qm.partition_len(0), 1);

        let resp = qm.apply_consume(0, "consumer-b", 31_000);
        match resp {
            CommandResponse::Consume { message: Some(m) } => assert_eq!(m.attempts, 2),
            other => panic!("expected redelivered message, got {:?}", other),
        }
    }
}
