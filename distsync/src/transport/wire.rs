//! The peer wire protocol: every message carries `{msg_type, term, sender_id, data}`.
//! Framing is length-delimited; encoding is JSON.

use raft::AppendEntriesRequest;
use raft::AppendEntriesResponse;
use raft::NodeId;
use raft::VoteRequest;
use raft::VoteResponse;
use serde::Deserialize;
use serde::Serialize;

use crate::command::Command;

/// The message types exchanged between peers, per §6: every request carries `msg_type` (as the
/// enum tag), `term`, and `sender_id` at the envelope level; a `client_request` is the one
/// message type with no `term` of its own, since it is not part of the Raft RPC set and is
/// simply forwarded into the local node's client-facing API.
#[derive(Debug, Serialize, Deserialize)]
pub enum RpcRequest {
    RequestVote {
        term: u64,
        sender_id: NodeId,
        data: VoteRequest,
    },
    AppendEntries {
        term: u64,
        sender_id: NodeId,
        data: AppendEntriesRequest<Command>,
    },
    /// A client proposal forwarded by a non-leader peer (or submitted directly by a
    /// co-located client) for this node to execute as leader.
    ClientRequest {
        sender_id: NodeId,
        command: Command,
    },
    /// The §4.6 read-miss query: not a Raft proposal (only the `register` it triggers is
    /// committed), so it is answered directly out of the leader's directory and durable store
    /// rather than round-tripping through the log.
    CacheRead {
        sender_id: NodeId,
        key: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
pub enum RpcResponse {
    VoteResponse(VoteResponse),
    AppendEntriesResponse(AppendEntriesResponse),
    /// Mirrors `client_response` from §6: `success`, the committed log index when known, and
    /// an `error` string (e.g. `not_leader`, `timeout`) otherwise.
    ClientResponse {
        success: bool,
        index: Option<u64>,
        error: Option<String>,
    },
    CacheReadResponse {
        value: Option<Vec<u8>>,
        install_as_exclusive: bool,
    },
    Error(String),
}
