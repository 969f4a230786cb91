//! # event
//!
//! why: everything that touches a node arrives as a message on its single queue
//! relations: produced by NodeHandle and by peer.rs call tasks, consumed by node.rs
//! what: NodeEvent, Reply

use crate::error::RaftError;
use raft_core::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    LogIndex, NodeId, NodeStatus, RpcError, VoteRequest, VoteResponse,
};
use tokio::sync::oneshot;

/// Response to an outbound call, tagged by rpc kind
#[derive(Debug)]
pub enum Reply {
    Vote(VoteResponse),
    Append(AppendEntriesResponse),
    Snapshot(InstallSnapshotResponse),
}

#[derive(Debug)]
pub enum NodeEvent {
    RequestVote {
        request: VoteRequest,
        reply: oneshot::Sender<VoteResponse>,
    },
    AppendEntries {
        request: AppendEntriesRequest,
        reply: oneshot::Sender<AppendEntriesResponse>,
    },
    InstallSnapshot {
        request: InstallSnapshotRequest,
        reply: oneshot::Sender<InstallSnapshotResponse>,
    },
    /// Completion of an outbound call started by a peer
    Reply {
        peer: NodeId,
        call_id: u64,
        result: Result<Reply, RpcError>,
    },
    /// Client write; answered once the entry is applied
    Propose {
        data: Vec<u8>,
        reply: oneshot::Sender<Result<LogIndex, RaftError>>,
    },
    Status {
        reply: oneshot::Sender<NodeStatus>,
    },
    Stop,
}
