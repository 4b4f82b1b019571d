//! The single command/response vocabulary every state machine's Raft entries are drawn from.
//!
//! Per the design notes, apply is modeled as a typed command variant dispatched by tag rather
//! than through runtime-registered callbacks: [`Command`] is the `AppData` this crate's Raft
//! log replicates, and [`CommandResponse`] is the `AppDataResponse` each apply produces.

use serde::Deserialize;
use serde::Serialize;

use raft::NodeId;

use crate::cache::CacheState;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// A message as it sits in a queue partition or in the durable store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub partition: u32,
    pub payload: Vec<u8>,
    pub produced_ts: u64,
    pub attempts: u32,
    pub delivered: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Command {
    // --- Lock manager ---
    Acquire {
        resource: String,
        mode: LockMode,
        client_id: String,
        ts: u64,
    },
    Release {
        resource: String,
        client_id: String,
    },
    Abort {
        client_id: String,
    },

    // --- Queue ---
    Produce {
        message: Message,
    },
    Consume {
        partition: u32,
        consumer_id: String,
        now_ts: u64,
    },
    Ack {
        consumer_id: String,
        message_id: String,
    },
    Requeue {
        message_id: String,
    },

    // --- Cache ---
    CacheWrite {
        key: String,
        value: Vec<u8>,
        writer_node: NodeId,
    },
    CacheRegister {
        key: String,
        node: NodeId,
        state: CacheState,
    },
    CacheInvalidate {
        key: String,
        except: Option<NodeId>,
    },
    CacheWriteBack {
        key: String,
        value: Vec<u8>,
    },
    /// Downgrade `node`'s copy of `key` to Shared, per the §4.6 remote-read rule: a Modified
    /// owner is written back first, an Exclusive owner just loses its exclusivity.
    CacheDowngrade {
        key: String,
        node: NodeId,
    },
}

impl raft::AppData for Command {}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum CommandResponse {
    /// The response to a leader's blank, term-opening entry; never inspected by a caller.
    Blank,

    Acquire {
        granted: bool,
        deadlock_victim: Option<String>,
    },
    Release,
    Abort,

    Produce {
        message_id: String,
        partition: u32,
    },
    Consume {
        message: Option<Message>,
    },
    Ack,
    Requeue,

    CacheWrite,
    CacheRegister,
    CacheInvalidate,
    CacheWriteBack,
    CacheDowngrade,
}

impl raft::AppDataResponse for CommandResponse {}
