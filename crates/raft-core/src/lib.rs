//! # raft-core
//!
//! why: hold the pure, io-free vocabulary of the raft consensus core
//! relations: used by raft-storage for persistence, raft-node for the protocol itself
//! what: ids and roles, log entries and the in-memory log, rpc messages, config, quorum math

pub mod config;
pub mod error;
pub mod log;
pub mod message;
pub mod node;
pub mod quorum;
pub mod state_machine;

pub use config::{NodeConfig, PeerAddress};
pub use error::{ConfigError, LogError, RpcError, StateMachineError};
pub use log::{LogEntry, MemoryLog};
pub use message::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
pub use node::{LogIndex, NodeId, NodeState, NodeStatus, Term, NIL_LOG_INDEX, NIL_LOG_TERM};
pub use state_machine::StateMachine;
