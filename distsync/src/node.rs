//! `DistSyncNode`: the client-facing surface of the platform, per §4.4–§4.6 and §6.
//!
//! One node bootstraps a `raft::Raft` handle over [`crate::transport::TcpNetwork`] and a
//! [`crate::raft_storage::Storage`], then exposes the lock, queue, and cache operations as
//! plain async methods. Every operation that is not inherently read-only proposes a
//! [`Command`] and waits for it to commit and apply, per the synchronous client contract in
//! §4.3; a caller that is not the leader gets back [`DistSyncError::NotLeader`] with a hint of
//! who to retry against, same as the wire protocol's `not_leader` response.

use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use raft::ClientWriteRequest;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tracing_futures::Instrument;

use crate::cache::CacheState;
use crate::command::Command;
use crate::command::CommandResponse;
use crate::command::LockMode;
use crate::command::Message;
use crate::config::Config;
use crate::error::DistSyncError;
use crate::error::DistSyncResult;
use crate::failure_detector::FailureDetector;
use crate::queue::partition_for;
use crate::raft_storage::Storage;
use crate::state_machine::DistSyncStateMachine;
use crate::store::DurableStore;
use crate::transport::TcpNetwork;
use crate::RaftNode;

/// Poll granularity for the `acquire`/`consume` busy-wait loops, per §4.5's "≤10 ms" bound.
const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Period of the redelivery scan over `pending_acks`, per §4.5.
const REDELIVERY_SCAN_INTERVAL: Duration = Duration::from_secs(5);

pub struct DistSyncNode<D: DurableStore> {
    config: Config,
    raft: Arc<RaftNode<D>>,
    storage: Arc<Storage<D>>,
    network: Arc<TcpNetwork>,
    failure_detector: Arc<std::sync::Mutex<FailureDetector>>,
    produce_seq: AtomicU64,
    /// Serializes recovery so a flapping leadership transition can't run it twice concurrently.
    recovery_lock: AsyncMutex<()>,
}

impl<D: DurableStore> DistSyncNode<D> {
    /// Bootstrap a node: build the Raft handle over the TCP transport, start accepting peer
    /// connections, and spawn the redelivery and leader-recovery background loops.
    pub async fn start(config: Config, store: Arc<D>) -> anyhow::Result<Arc<Self>> {
        let request_timeout = Duration::from_millis(config.request_timeout);
        let network = Arc::new(TcpNetwork::new(config.node_id, config.peer_addrs(), request_timeout));

        let queue_nodes: Vec<raft::NodeId> = config.members().into_iter().collect();
        let state_machine = DistSyncStateMachine::new(
            config.node_id,
            config.queue_partitions,
            &queue_nodes,
            config.queue_virtual_nodes,
            config.cache_size_mb,
            store.clone(),
            config.message_persistence,
            Duration::from_secs(config.message_ttl),
        );
        let storage = Arc::new(Storage::new(store, state_machine));

        let raft_config = Arc::new(config.raft_config()?);
        let raft = raft::Raft::new(config.node_id, raft_config, config.members(), network.clone(), storage.clone());
        let raft = Arc::new(raft);

        let failure_detector = Arc::new(std::sync::Mutex::new(FailureDetector::default()));

        let node_id = config.node_id;
        let bind_addr = SocketAddr::new(config.node_host.parse().unwrap_or_else(|_| "0.0.0.0".parse().unwrap()), config.node_port);
        tokio::spawn(
            crate::transport::serve(bind_addr, raft.clone(), storage.clone(), failure_detector.clone())
                .instrument(tracing::debug_span!("transport", id = node_id)),
        );

        let node = Arc::new(Self {
            config,
            raft,
            storage,
            network,
            failure_detector,
            produce_seq: AtomicU64::new(0),
            recovery_lock: AsyncMutex::new(()),
        });

        tokio::spawn(node.clone().redelivery_loop().instrument(tracing::debug_span!("redelivery", id = node_id)));
        tokio::spawn(node.clone().recovery_on_leadership_loop().instrument(tracing::debug_span!("recovery", id = node_id)));

        Ok(node)
    }

    pub fn node_id(&self) -> raft::NodeId {
        self.config.node_id
    }

    pub fn current_leader(&self) -> Option<raft::NodeId> {
        self.raft.current_leader()
    }

    pub fn metrics(&self) -> tokio::sync::watch::Receiver<raft::RaftMetrics> {
        self.raft.metrics()
    }

    pub fn failure_detector(&self) -> Arc<std::sync::Mutex<FailureDetector>> {
        self.failure_detector.clone()
    }

    /// Stop this node's Raft core, simulating the node becoming unreachable (S1). The peer
    /// transport listener keeps running, so in-flight and future RPCs to it still connect, but
    /// every one is answered with a shutdown error rather than a real vote or append response.
    /// From the rest of the cluster's perspective this is indistinguishable from the node being
    /// partitioned away.
    pub async fn shutdown(&self) -> DistSyncResult<()> {
        self.raft.shutdown().await?;
        Ok(())
    }

    /// Propose a command and wait for it to commit and apply, per the synchronous client
    /// contract in §4.3. Bounded by `request_timeout`: on expiry the caller sees
    /// [`DistSyncError::Timeout`], but the proposal itself is not retracted and may still commit
    /// later, per §5's cancellation note.
    async fn propose(&self, command: Command) -> DistSyncResult<CommandResponse> {
        let request_timeout = Duration::from_millis(self.config.request_timeout);
        match tokio::time::timeout(request_timeout, self.raft.client_write(ClientWriteRequest::new(command))).await {
            Ok(result) => Ok(result?.data),
            Err(_) => Err(DistSyncError::Timeout),
        }
    }

    // ---------------------------------------------------------------- lock manager (§4.4) ---

    /// Acquire `resource` in `mode` on behalf of `client_id`, blocking up to `timeout`.
    ///
    /// A `timeout` of zero is the non-blocking mode from §7: a resource held incompatibly
    /// returns [`DistSyncError::Conflict`] immediately rather than enqueuing a wait.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn acquire(&self, resource: &str, mode: LockMode, client_id: &str, timeout: Duration) -> DistSyncResult<()> {
        let ts = now_unix_ms();
        let resp = self
            .propose(Command::Acquire {
                resource: resource.to_string(),
                mode,
                client_id: client_id.to_string(),
                ts,
            })
            .await?;
        let (granted, deadlock_victim) = match resp {
            CommandResponse::Acquire { granted, deadlock_victim } => (granted, deadlock_victim),
            other => unreachable!("acquire must respond with Acquire, got {:?}", other),
        };

        if let Some(victim) = deadlock_victim {
            // Whichever acquire call happened to trigger detection resolves it, per the design
            // note in §4.4: submit the abort regardless of whether we are the victim.
            let _ = self.propose(Command::Abort { client_id: victim.clone() }).await;
            if victim == client_id {
                return Err(DistSyncError::AbortedDeadlock);
            }
        }

        if granted {
            return Ok(());
        }
        if timeout.is_zero() {
            let _ = self.propose(Command::Abort { client_id: client_id.to_string() }).await;
            return Err(DistSyncError::Conflict);
        }

        let deadline = Instant::now() + timeout;
        loop {
            if self.storage.with_state_machine(|sm| sm.lock.is_holder(resource, client_id)).await {
                return Ok(());
            }
            if !self.storage.with_state_machine(|sm| sm.lock.is_waiting(resource, client_id)).await {
                // No longer a waiter and never became a holder: must have been the deadlock
                // victim of a cycle detected by a different concurrent acquirer.
                return Err(DistSyncError::AbortedDeadlock);
            }
            if Instant::now() >= deadline {
                return Err(DistSyncError::Timeout);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn release(&self, resource: &str, client_id: &str) -> DistSyncResult<()> {
        self.propose(Command::Release {
            resource: resource.to_string(),
            client_id: client_id.to_string(),
        })
        .await?;
        Ok(())
    }

    // -------------------------------------------------------------------- queue (§4.5) ---

    /// The node the consistent hash ring currently prefers for `partition`. Advisory: every
    /// node replicates every partition via the single shared Raft log, so a consumer can still
    /// reach any partition through any node — this just names the node a client should try
    /// first to avoid an extra leader hop.
    pub async fn partition_owner(&self, partition: u32) -> Option<raft::NodeId> {
        self.storage.with_state_machine(|sm| sm.queue.partition_owner(partition)).await
    }

    /// Produce a message, assigning it to a partition by `partition_key` (consistent-hashed)
    /// or, absent a key, by round robin over a per-node counter.
    #[tracing::instrument(level = "debug", skip(self, payload))]
    pub async fn produce(&self, payload: Vec<u8>, partition_key: Option<&str>) -> DistSyncResult<String> {
        let seq = self.produce_seq.fetch_add(1, Ordering::Relaxed);
        let partition = partition_for(partition_key, seq, self.config.queue_partitions);
        let message_id = format!("{}:{}:{}", self.config.node_id, now_unix_nanos(), seq);
        let message = Message {
            message_id,
            partition,
            payload,
            produced_ts: now_unix_ms(),
            attempts: 0,
            delivered: false,
        };
        match self.propose(Command::Produce { message }).await? {
            CommandResponse::Produce { message_id, .. } => Ok(message_id),
            other => unreachable!("produce must respond with Produce, got {:?}", other),
        }
    }

    /// Consume the head of `partition` for `consumer_id`, blocking up to `timeout`.
    ///
    /// Per §4.5, the busy-poll only actually proposes a `consume` command once the partition is
    /// locally observed non-empty, so an idle partition does not spam the Raft log with no-op
    /// entries while callers wait.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn consume(&self, partition: u32, consumer_id: &str, timeout: Duration) -> DistSyncResult<Option<Message>> {
        let deadline = Instant::now() + timeout;
        loop {
            let has_message = self.storage.with_state_machine(|sm| sm.queue.partition_len(partition) > 0).await;
            if has_message {
                let now_ts = now_unix_ms();
                let resp = self
                    .propose(Command::Consume {
                        partition,
                        consumer_id: consumer_id.to_string(),
                        now_ts,
                    })
                    .await?;
                match resp {
                    CommandResponse::Consume { message: Some(m) } => return Ok(Some(m)),
                    CommandResponse::Consume { message: None } => {} // lost the race; keep polling
                    other => unreachable!("consume must respond with Consume, got {:?}", other),
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn ack(&self, consumer_id: &str, message_id: &str) -> DistSyncResult<()> {
        self.propose(Command::Ack {
            consumer_id: consumer_id.to_string(),
            message_id: message_id.to_string(),
        })
        .await?;
        Ok(())
    }

    /// Scan `pending_acks` every [`REDELIVERY_SCAN_INTERVAL`] and requeue anything past its
    /// visibility timeout, per §4.5. Harmless to run on every replica: only the leader's
    /// proposals ever succeed, the rest are silently dropped.
    async fn redelivery_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(REDELIVERY_SCAN_INTERVAL);
        let visibility_timeout_ms = self.config.visibility_timeout;
        loop {
            interval.tick().await;
            if !self.metrics().borrow().state.is_leader() {
                continue;
            }
            let now = now_unix_ms();
            let expired = self.storage.with_state_machine(|sm| sm.queue.expired_pending_acks(now, visibility_timeout_ms)).await;
            for message_id in expired {
                if let Err(err) = self.propose(Command::Requeue { message_id: message_id.clone() }).await {
                    tracing::debug!(message_id, error=%err, "requeue proposal did not land");
                }
            }
        }
    }

    /// Watch for this node becoming leader and, on each such transition, recover any
    /// durably-stored undelivered messages into their partition queues (§4.5 Recovery).
    async fn recovery_on_leadership_loop(self: Arc<Self>) {
        let mut rx = self.metrics();
        let mut was_leader = rx.borrow().state.is_leader();
        if was_leader {
            self.run_recovery().await;
        }
        loop {
            if rx.changed().await.is_err() {
                return;
            }
            let is_leader = rx.borrow().state.is_leader();
            if is_leader && !was_leader {
                self.run_recovery().await;
            }
            was_leader = is_leader;
        }
    }

    async fn run_recovery(&self) {
        let _guard = self.recovery_lock.lock().await;
        match self.storage.recover_messages().await {
            Ok(recovered) => {
                if recovered > 0 {
                    tracing::info!(recovered, "recovered undelivered messages on leader startup");
                }
            }
            Err(err) => tracing::error!(error=?err, "failed to recover messages from durable store"),
        }
    }

    // -------------------------------------------------------------------- cache (§4.6) ---

    /// Read `key`, per the §4.6 read-miss path: a local hit returns immediately; a miss queries
    /// whichever node is believed to be leader for the directory state and durable value, then
    /// installs the fetched line as Exclusive or Shared depending on whether any other sharer
    /// exists.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn cache_read(&self, key: &str) -> DistSyncResult<Vec<u8>> {
        let now = now_unix_ms();
        if let Some(value) = self.storage.with_state_machine(|sm| sm.cache.local_read(key, now)).await {
            return Ok(value);
        }

        let leader = self.raft.current_leader().ok_or(DistSyncError::Timeout)?;
        let (value, install_as_exclusive) = if leader == self.config.node_id {
            self.answer_cache_read_as_leader(key).await?
        } else {
            let reply = self.network.send_cache_read(leader, key).await.map_err(|err| DistSyncError::Io(err.to_string()))?;
            (reply.value, reply.install_as_exclusive)
        };
        let value = value.ok_or(DistSyncError::NotFound)?;

        let state = if install_as_exclusive { CacheState::Exclusive } else { CacheState::Shared };
        let writebacks = self.storage.with_state_machine(|sm| sm.cache.install(key, value.clone(), state, now)).await;
        self.persist_writebacks(writebacks).await?;
        // Best-effort: a failure here just means the directory is briefly stale, not that the
        // read itself failed.
        let _ = self
            .propose(Command::CacheRegister {
                key: key.to_string(),
                node: self.config.node_id,
                state,
            })
            .await;
        Ok(value)
    }

    /// Downgrade any existing Modified/Exclusive owner of `key` to Shared, per the §4.6 remote
    /// read rule, before a reader other than that owner is allowed to install its own copy.
    async fn downgrade_owner_for_remote_read(&self, key: &str, requester: raft::NodeId) -> DistSyncResult<()> {
        let owner = self.storage.with_state_machine(|sm| sm.cache.owner_to_downgrade(key, requester)).await;
        if let Some(owner) = owner {
            self.propose(Command::CacheDowngrade { key: key.to_string(), node: owner }).await?;
        }
        Ok(())
    }

    /// This node's own local MESI state for `key`, or `None` if it holds no copy. Exposed for
    /// operational introspection and coherence testing; not used on any hot path.
    pub async fn local_cache_state(&self, key: &str) -> Option<CacheState> {
        self.storage.with_state_machine(|sm| sm.cache.local_state(key)).await
    }

    async fn answer_cache_read_as_leader(&self, key: &str) -> DistSyncResult<(Option<Vec<u8>>, bool)> {
        self.downgrade_owner_for_remote_read(key, self.config.node_id).await?;
        let sharers = self.storage.with_state_machine(|sm| sm.cache.sharers_excluding(key, self.config.node_id)).await;
        let value = self.storage.cache_read_through(key).await?;
        Ok((value, sharers.is_empty()))
    }

    /// Write `key`, per the §4.6 write path: the leader proposes a single bundled
    /// write-and-invalidate command (see [`crate::cache::CacheManager::apply_write`]), which
    /// every replica applies deterministically. The writer installs the new value as Modified,
    /// every other replica drops its copy.
    #[tracing::instrument(level = "debug", skip(self, value))]
    pub async fn cache_write(&self, key: &str, value: Vec<u8>) -> DistSyncResult<()> {
        self.propose(Command::CacheWrite {
            key: key.to_string(),
            value,
            writer_node: self.config.node_id,
        })
        .await?;
        Ok(())
    }

    async fn persist_writebacks(&self, writebacks: Vec<crate::cache::WriteBack>) -> DistSyncResult<()> {
        for wb in writebacks {
            self.propose(Command::CacheWriteBack { key: wb.key, value: wb.value }).await?;
        }
        Ok(())
    }
}

fn now_unix_ms() -> u64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

fn now_unix_nanos() -> u128 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_nanos()).unwrap_or(0)
}
