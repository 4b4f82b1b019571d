use async_trait::async_trait;

use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::AppData;
use crate::NodeId;

/// The outbound half of the Raft RPC contract: given a target node id, deliver a request and
/// return its response.
///
/// A concrete implementation owns whatever dialing, serialization, and connection pooling the
/// underlying transport needs; this crate never retries a failed call itself; retrying (or
/// giving up and letting the election timeout fire) is left to the Raft core, which is the
/// only place with enough context to decide whether a retry is still useful.
#[async_trait]
pub trait RaftNetwork<D: AppData>: Send + Sync + 'static {
    /// Send an AppendEntries RPC to the target node.
    async fn send_append_entries(&self, target: NodeId, rpc: AppendEntriesRequest<D>) -> anyhow::Result<AppendEntriesResponse>;

    /// Send a RequestVote RPC to the target node.
    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> anyhow::Result<VoteResponse>;
}
