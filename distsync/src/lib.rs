//! A replicated lock manager, message queue, and MESI-coherent cache, all driven off one shared
//! Raft log (see the `raft` crate) and a peer transport with phi-accrual failure detection.
//!
//! [`DistSyncNode`] is the entry point: it bootstraps the consensus engine, starts the peer
//! transport, and exposes the three state machines' operations as plain async methods.

mod cache;
mod command;
mod config;
mod error;
mod failure_detector;
mod lock;
mod node;
mod queue;
mod raft_storage;
mod state_machine;
mod store;
pub mod transport;

pub use cache::CacheState;
pub use command::Command;
pub use command::CommandResponse;
pub use command::LockMode;
pub use command::Message;
pub use config::ClusterMember;
pub use config::Config;
pub use error::DistSyncError;
pub use error::DistSyncResult;
pub use failure_detector::FailureDetector;
pub use node::DistSyncNode;
pub use queue::partition_for;
pub use raft_storage::Storage;
pub use store::DurableStore;
pub use store::InMemoryStore;

/// The concrete [`raft::Raft`] instantiation this crate drives: [`Command`]/[`CommandResponse`]
/// entries, replicated over [`transport::TcpNetwork`] and persisted through [`Storage`].
pub type RaftNode<D> = raft::Raft<Command, CommandResponse, transport::TcpNetwork, Storage<D>>;
