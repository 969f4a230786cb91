//! # node
//!
//! why: name the identities and roles every other layer talks about
//! relations: used by log.rs, message.rs, config.rs and by raft-node's state machine
//! what: NodeId/Term/LogIndex aliases, NodeState role enum, NodeStatus snapshot

use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of a node in the configured peer list.
pub type NodeId = u64;

/// Logical election epoch.
pub type Term = u64;

/// Absolute, 1-based position in the replicated log.
pub type LogIndex = u64;

/// Index value meaning "no entry".
pub const NIL_LOG_INDEX: LogIndex = 0;

/// Term value meaning "no entry".
pub const NIL_LOG_TERM: Term = 0;

/// The roles a Raft node moves between
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    /// Transient role held between construction and startup
    Unknown,
    /// Active state - manages log replication, sends heartbeats
    Leader,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Passive state - listens for heartbeats, votes when asked
    Follower,
}

impl Default for NodeState {
    fn default() -> Self {
        Self::Unknown
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "Unknown",
            Self::Leader => "Leader",
            Self::Candidate => "Candidate",
            Self::Follower => "Follower",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of a node, as reported to operators and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub state: NodeState,
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub leader_id: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    /// First index still held in the log (everything below is in the snapshot)
    pub start_index: LogIndex,
    pub last_index: LogIndex,
}

impl NodeStatus {
    pub fn is_leader(&self) -> bool {
        self.state == NodeState::Leader
    }
}
