//! The inter-node transport, per §4.1: a connection-oriented, request/response link to every
//! peer plus a single inbound dispatch point. `TcpNetwork` is the outbound half (and the
//! [`raft::RaftNetwork`] implementation the consensus engine drives); [`serve`] is the inbound
//! half, accepting connections and routing each decoded [`wire::RpcRequest`] to either the
//! local `Raft` handle or, for `client_request`, the leader-only cache read-through path.
//!
//! Framing is length-delimited (`tokio_util::codec::LengthDelimitedCodec`) with a JSON payload.
//! One socket per peer is dialed lazily and
//! held behind a mutex so a single connection's request/response round trips are strictly
//! ordered, per §5's note that "write-ordering on a single connection is preserved". The
//! transport itself never retries; per §4.1, retry policy belongs to Raft.

pub mod wire;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::SinkExt;
use futures::StreamExt;
use raft::AppendEntriesRequest;
use raft::AppendEntriesResponse;
use raft::NodeId;
use raft::RaftNetwork;
use raft::VoteRequest;
use raft::VoteResponse;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::codec::Framed;
use tokio_util::codec::LengthDelimitedCodec;

use crate::cache::CacheState;
use crate::command::Command;
use crate::failure_detector::FailureDetector;
use crate::raft_storage::Storage;
use crate::store::DurableStore;
use crate::transport::wire::RpcRequest;
use crate::transport::wire::RpcResponse;
use crate::RaftNode;

type PeerFrame = Framed<TcpStream, LengthDelimitedCodec>;

/// A single peer's connection, dialed on first use and re-dialed on any I/O error. Request and
/// response share the one socket, so the mutex also serializes concurrent callers.
struct PeerConn {
    addr: SocketAddr,
    conn: AsyncMutex<Option<PeerFrame>>,
}

/// The outbound half of the peer transport: one lazily-dialed connection per peer, round-
/// tripping RPCs with a bounded timeout (default 5 s, per §4.1).
pub struct TcpNetwork {
    node_id: NodeId,
    peers: BTreeMap<NodeId, PeerConn>,
    request_timeout: Duration,
}

impl TcpNetwork {
    pub fn new(node_id: NodeId, peer_addrs: BTreeMap<NodeId, SocketAddr>, request_timeout: Duration) -> Self {
        let peers = peer_addrs
            .into_iter()
            .filter(|&(id, _)| id != node_id)
            .map(|(id, addr)| {
                (
                    id,
                    PeerConn {
                        addr,
                        conn: AsyncMutex::new(None),
                    },
                )
            })
            .collect();
        Self {
            node_id,
            peers,
            request_timeout,
        }
    }

    async fn round_trip(&self, target: NodeId, req: RpcRequest) -> anyhow::Result<RpcResponse> {
        let peer = self.peers.get(&target).ok_or_else(|| anyhow::anyhow!("unknown peer {}", target))?;
        tokio::time::timeout(self.request_timeout, self.round_trip_inner(peer, req))
            .await
            .map_err(|_| anyhow::anyhow!("timed out waiting for peer {}", target))?
    }

    /// Send `req` and wait for the matching reply, redialing once if the cached connection
    /// turns out to be dead.
    async fn round_trip_inner(&self, peer: &PeerConn, req: RpcRequest) -> anyhow::Result<RpcResponse> {
        let encoded = Bytes::from(serde_json::to_vec(&req)?);
        let mut guard = peer.conn.lock().await;
        for attempt in 0..2 {
            if guard.is_none() {
                let stream = TcpStream::connect(peer.addr).await?;
                stream.set_nodelay(true).ok();
                *guard = Some(Framed::new(stream, LengthDelimitedCodec::new()));
            }
            let framed = guard.as_mut().expect("just populated");
            if framed.send(encoded.clone()).await.is_err() {
                *guard = None;
                if attempt == 0 {
                    continue;
                }
                anyhow::bail!("failed to send to peer {}", peer.addr);
            }
            match framed.next().await {
                Some(Ok(bytes)) => return Ok(serde_json::from_slice(&bytes)?),
                _ => {
                    *guard = None;
                    if attempt == 0 {
                        continue;
                    }
                    anyhow::bail!("connection to peer {} closed", peer.addr);
                }
            }
        }
        anyhow::bail!("failed to reach peer {}", peer.addr)
    }

    /// The leader-only cache read-through query described in §4.6's read-miss path. Not part of
    /// the `RaftNetwork` contract: it carries no Raft term and is answered directly rather than
    /// going through the replicated log.
    pub async fn send_cache_read(&self, target: NodeId, key: &str) -> anyhow::Result<CacheReadReply> {
        let req = RpcRequest::CacheRead {
            sender_id: self.node_id,
            key: key.to_string(),
        };
        match self.round_trip(target, req).await? {
            RpcResponse::CacheReadResponse { value, install_as_exclusive } => Ok(CacheReadReply { value, install_as_exclusive }),
            RpcResponse::Error(err) => anyhow::bail!(err),
            _ => anyhow::bail!("unexpected response type from peer {}", target),
        }
    }
}

#[async_trait]
impl RaftNetwork<Command> for TcpNetwork {
    async fn send_append_entries(&self, target: NodeId, rpc: AppendEntriesRequest<Command>) -> anyhow::Result<AppendEntriesResponse> {
        let req = RpcRequest::AppendEntries {
            term: rpc.term,
            sender_id: self.node_id,
            data: rpc,
        };
        match self.round_trip(target, req).await? {
            RpcResponse::AppendEntriesResponse(resp) => Ok(resp),
            RpcResponse::Error(err) => anyhow::bail!(err),
            _ => anyhow::bail!("unexpected response type from peer {}", target),
        }
    }

    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> anyhow::Result<VoteResponse> {
        let req = RpcRequest::RequestVote {
            term: rpc.term,
            sender_id: self.node_id,
            data: rpc,
        };
        match self.round_trip(target, req).await? {
            RpcResponse::VoteResponse(resp) => Ok(resp),
            RpcResponse::Error(err) => anyhow::bail!(err),
            _ => anyhow::bail!("unexpected response type from peer {}", target),
        }
    }
}

/// The reply to a cache read-through query, mirroring the directory check in §4.6: whether the
/// requester should install the fetched value as Exclusive (directory was empty or held only by
/// the requester) or Shared (some other node already holds a copy).
pub struct CacheReadReply {
    pub value: Option<Vec<u8>>,
    pub install_as_exclusive: bool,
}

/// Accept inbound peer connections on `bind_addr` until the process exits, dispatching every
/// decoded request to `raft` (for the three Raft RPC types) or answering a cache read-through
/// query directly out of `storage`.
#[tracing::instrument(level = "info", skip(raft, storage, failure_detector))]
pub async fn serve<D: DurableStore>(
    bind_addr: SocketAddr,
    raft: Arc<RaftNode<D>>,
    storage: Arc<Storage<D>>,
    failure_detector: Arc<std::sync::Mutex<FailureDetector>>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    tracing::info!(%bind_addr, "peer transport listening");
    loop {
        let (stream, peer_addr) = listener.accept().await?;
        stream.set_nodelay(true).ok();
        let raft = raft.clone();
        let storage = storage.clone();
        let failure_detector = failure_detector.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, raft, storage, failure_detector).await {
                tracing::debug!(%peer_addr, error=?err, "peer connection ended");
            }
        });
    }
}

async fn handle_connection<D: DurableStore>(
    stream: TcpStream,
    raft: Arc<RaftNode<D>>,
    storage: Arc<Storage<D>>,
    failure_detector: Arc<std::sync::Mutex<FailureDetector>>,
) -> anyhow::Result<()> {
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    while let Some(frame) = framed.next().await {
        let bytes = frame?;
        let request: RpcRequest = serde_json::from_slice(&bytes)?;
        // Any successfully decoded message from a peer is evidence it is alive, regardless of
        // RPC type; this is a deliberate reading of §4.2 since this crate has no separate,
        // dedicated heartbeat message.
        if let Ok(mut fd) = failure_detector.lock() {
            fd.heartbeat(request_sender(&request));
        }
        let response = dispatch(&raft, &storage, request).await;
        let encoded = serde_json::to_vec(&response)?;
        framed.send(Bytes::from(encoded)).await?;
    }
    Ok(())
}

fn request_sender(req: &RpcRequest) -> NodeId {
    match req {
        RpcRequest::RequestVote { sender_id, .. } => *sender_id,
        RpcRequest::AppendEntries { sender_id, .. } => *sender_id,
        RpcRequest::ClientRequest { sender_id, .. } => *sender_id,
        RpcRequest::CacheRead { sender_id, .. } => *sender_id,
    }
}

async fn dispatch<D: DurableStore>(raft: &RaftNode<D>, storage: &Storage<D>, request: RpcRequest) -> RpcResponse {
    match request {
        RpcRequest::RequestVote { data, .. } => match raft.vote(data).await {
            Ok(resp) => RpcResponse::VoteResponse(resp),
            Err(err) => RpcResponse::Error(err.to_string()),
        },
        RpcRequest::AppendEntries { data, .. } => match raft.append_entries(data).await {
            Ok(resp) => RpcResponse::AppendEntriesResponse(resp),
            Err(err) => RpcResponse::Error(err.to_string()),
        },
        RpcRequest::ClientRequest { command, .. } => match raft.client_write(raft::ClientWriteRequest::new(command)).await {
            Ok(resp) => RpcResponse::ClientResponse {
                success: true,
                index: Some(resp.log_id.index),
                error: None,
            },
            Err(err) => {
                let err: crate::error::DistSyncError = err.into();
                RpcResponse::ClientResponse {
                    success: false,
                    index: None,
                    error: Some(err.to_string()),
                }
            }
        },
        RpcRequest::CacheRead { sender_id, key } => {
            if !raft.metrics().borrow().state.is_leader() {
                return RpcResponse::Error("not_leader".into());
            }
            // Per §4.6, a remote read must downgrade an existing Modified/Exclusive owner to
            // Shared (writing back a dirty value first) before the requester installs its own
            // copy; otherwise both ends would believe they hold exclusive access.
            let owner = storage.with_state_machine(|sm| sm.cache.owner_to_downgrade(&key, sender_id)).await;
            if let Some(owner) = owner {
                let _ = raft
                    .client_write(raft::ClientWriteRequest::new(Command::CacheDowngrade { key: key.clone(), node: owner }))
                    .await;
            }
            let sharers = storage.with_state_machine(|sm| sm.cache.sharers_excluding(&key, sender_id)).await;
            let value = match storage.cache_read_through(&key).await {
                Ok(value) => value,
                Err(err) => return RpcResponse::Error(err.to_string()),
            };
            let install_as_exclusive = sharers.is_empty();
            if value.is_some() {
                let state = if install_as_exclusive { CacheState::Exclusive } else { CacheState::Shared };
                let _ = raft
                    .client_write(raft::ClientWriteRequest::new(Command::CacheRegister { key: key.clone(), node: sender_id, state }))
                    .await;
            }
            RpcResponse::CacheReadResponse { value, install_as_exclusive }
        }
    }
}
