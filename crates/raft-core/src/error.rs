//! # error
//!
//! why: give every layer a typed failure instead of integer error codes
//! relations: LogError surfaces through raft-storage, RpcError through raft-node's peers
//! what: ConfigError, LogError, StateMachineError, RpcError

use crate::node::{LogIndex, NodeId};
use thiserror::Error;

/// Problems found while parsing or validating a node configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid config json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("can not read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("node id {id} not found in peer list of {peers} entries")]
    UnknownSelf { id: NodeId, peers: usize },

    #[error("invalid peer url {url:?}: {reason}")]
    InvalidPeerUrl { url: String, reason: &'static str },

    #[error("invalid setting {name}: {reason}")]
    InvalidSetting {
        name: &'static str,
        reason: &'static str,
    },
}

/// Violations of the in-memory log's contiguity invariant
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogError {
    #[error("non-contiguous append: expected index {expected}, got {got}")]
    NonContiguous { expected: LogIndex, got: LogIndex },

    #[error("erase of [{first}, {last}) would leave a hole in the log")]
    InteriorErase { first: LogIndex, last: LogIndex },
}

/// Failure reported by the application state machine
#[derive(Error, Debug)]
pub enum StateMachineError {
    #[error("state machine io failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Message(String),
}

impl StateMachineError {
    pub fn message(msg: impl Into<String>) -> Self {
        Self::Message(msg.into())
    }
}

/// Outcome of an outbound RPC that never produced a response
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("request canceled")]
    Canceled,

    #[error("request timed out")]
    Timeout,

    #[error("peer unreachable: {0}")]
    Unreachable(String),

    #[error("no raft node {0} registered on the remote service")]
    NodeNotFound(NodeId),
}
