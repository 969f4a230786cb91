//! # message
//!
//! why: define all raft rpc message types for node communication
//! relations: built by raft-node's RaftNode, carried by the external transport, dispatched by RaftService
//! what: RequestVote, AppendEntries and InstallSnapshot request/response pairs

use crate::log::LogEntry;
use crate::node::{LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};

/// Request a vote during leader election
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
    /// Node the request is addressed to, used by the receiving service to pick the node
    pub peer_id: NodeId,
}

/// Response to a vote request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

/// Replicate log entries (also serves as heartbeat when entries is empty)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub leader_commit: LogIndex,
    pub entries: Vec<LogEntry>,
    pub peer_id: NodeId,
}

/// Response to AppendEntries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    /// On success the last index known to match the leader; on failure the
    /// follower's last index, which the leader uses as a backoff hint
    pub match_index: LogIndex,
}

/// One chunk of a snapshot streamed to a lagging follower
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    /// Byte offset of `data` within the snapshot file
    pub offset: u64,
    pub data: Vec<u8>,
    pub done: bool,
    pub peer_id: NodeId,
}

/// Response to InstallSnapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: Term,
}

impl AppendEntriesRequest {
    /// Index of the last entry carried, or `prev_log_index` for a heartbeat
    pub fn last_entry_index(&self) -> LogIndex {
        self.prev_log_index + self.entries.len() as u64
    }
}
