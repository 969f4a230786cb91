//! # error
//!
//! why: one failure type for everything a caller of a raft node can see
//! relations: wraps raft-core and raft-storage errors; returned by NodeHandle, RaftService and the node task
//! what: RaftError

use raft_core::{ConfigError, LogIndex, NodeId, StateMachineError};
use raft_storage::StorageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("invalid node configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),

    #[error("state machine failure: {0}")]
    StateMachine(#[from] StateMachineError),

    /// Write landed on a non-leader; retry at the leader's address
    #[error("not the leader, redirect to node {leader_id} at {address}")]
    ServiceRedirect { leader_id: NodeId, address: String },

    #[error("cluster down: no leader is known")]
    ClusterDown,

    #[error("leadership lost before entry {index} was committed")]
    LeadershipLost { index: LogIndex },

    #[error("raft node {0} not found")]
    NodeNotFound(NodeId),

    #[error("raft node {0} is already registered")]
    NodeExists(NodeId),

    #[error("raft node stopped")]
    Stopped,
}
