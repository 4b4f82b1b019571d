//! Dispatches committed [`Command`] entries to whichever of the three state machines owns
//! them, and performs the durable-store side effects (§4.5 produce/ack, §4.6 write/write-back)
//! that accompany certain applies.

use std::sync::Arc;
use std::time::Duration;

use raft::NodeId;

use crate::cache::CacheManager;
use crate::command::Command;
use crate::command::CommandResponse;
use crate::lock::LockManager;
use crate::queue::QueueManager;
use crate::store::keys;
use crate::store::DurableStore;

pub struct DistSyncStateMachine {
    pub lock: LockManager,
    pub queue: QueueManager,
    pub cache: CacheManager,
    store: Arc<dyn DurableStore>,
    message_persistence: bool,
    message_ttl: Duration,
}

impl DistSyncStateMachine {
    pub fn new(
        node_id: NodeId,
        queue_partitions: u32,
        queue_nodes: &[NodeId],
        queue_virtual_nodes: u32,
        cache_size_mb: u64,
        store: Arc<dyn DurableStore>,
        message_persistence: bool,
        message_ttl: Duration,
    ) -> Self {
        Self {
            lock: LockManager::new(),
            queue: QueueManager::new(queue_partitions, queue_nodes, queue_virtual_nodes),
            cache: CacheManager::new(node_id, cache_size_mb),
            store,
            message_persistence,
            message_ttl,
        }
    }

    /// Apply one committed command, performing whatever durable-store I/O accompanies it.
    #[tracing::instrument(level = "debug", skip(self, command))]
    pub async fn apply(&mut self, command: &Command) -> anyhow::Result<CommandResponse> {
        let response = match command.clone() {
            Command::Acquire { resource, mode, client_id, ts } => self.lock.apply_acquire(&resource, mode, &client_id, ts),
            Command::Release { resource, client_id } => self.lock.apply_release(&resource, &client_id),
            Command::Abort { client_id } => self.lock.apply_abort(&client_id),

            Command::Produce { message } => {
                let response = self.queue.apply_produce(message.clone());
                if self.message_persistence {
                    let bytes = serde_json::to_vec(&message)?;
                    self.store.put(&keys::message(&message.message_id), bytes, Some(self.message_ttl)).await?;
                }
                response
            }
            Command::Consume { partition, consumer_id, now_ts } => self.queue.apply_consume(partition, &consumer_id, now_ts),
            Command::Ack { consumer_id, message_id } => {
                let response = self.queue.apply_ack(&consumer_id, &message_id);
                self.store.delete(&keys::message(&message_id)).await?;
                response
            }
            Command::Requeue { message_id } => self.queue.apply_requeue(&message_id),

            Command::CacheWrite { key, value, writer_node } => {
                let (response, writebacks) = self.cache.apply_write(&key, value.clone(), writer_node, now_unix_ms());
                self.store.put(&keys::cache(&key), value, None).await?;
                self.persist_writebacks(writebacks).await?;
                response
            }
            Command::CacheRegister { key, node, state } => self.cache.apply_register(&key, node, state),
            Command::CacheInvalidate { key, except } => {
                let (response, wb) = self.cache.apply_invalidate(&key, except);
                if let Some(wb) = wb {
                    self.store.put(&keys::cache(&wb.key), wb.value, None).await?;
                }
                response
            }
            Command::CacheWriteBack { key, value } => {
                let response = self.cache.apply_write_back(&key, &value);
                self.store.put(&keys::cache(&key), value, None).await?;
                response
            }
            Command::CacheDowngrade { key, node } => {
                let (response, wb) = self.cache.apply_downgrade(&key, node);
                if let Some(wb) = wb {
                    self.store.put(&keys::cache(&wb.key), wb.value, None).await?;
                }
                response
            }
        };
        Ok(response)
    }

    async fn persist_writebacks(&self, writebacks: Vec<crate::cache::WriteBack>) -> anyhow::Result<()> {
        for wb in writebacks {
            self.store.put(&keys::cache(&wb.key), wb.value, None).await?;
        }
        Ok(())
    }

    /// The durable store's current value for a cache key, independent of this replica's own
    /// local line. Used to answer a peer's read-miss query (§4.6).
    pub async fn cache_read_through(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        self.store.get(&keys::cache(key)).await
    }

    /// Recover any durably-stored, undelivered messages into their partition queues. Run once,
    /// by a freshly elected leader, per §4.5 Recovery.
    pub async fn recover_messages(&mut self) -> anyhow::Result<usize> {
        let keys = self.store.scan(keys::message_prefix()).await?;
        let mut recovered = 0;
        for key in keys {
            if let Some(bytes) = self.store.get(&key).await? {
                let message: crate::command::Message = serde_json::from_slice(&bytes)?;
                if !message.delivered {
                    self.queue.recover_message(message);
                    recovered += 1;
                }
            }
        }
        Ok(recovered)
    }
}

fn now_unix_ms() -> u64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}
