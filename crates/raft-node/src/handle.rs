//! # handle
//!
//! why: the only way other tasks talk to a running node
//! relations: wraps the sender side of a node's event queue; held by RaftService and by applications
//! what: NodeHandle (propose, status, stop, inbound rpc delivery)

use crate::error::RaftError;
use crate::event::NodeEvent;
use raft_core::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    LogIndex, NodeId, NodeStatus, RpcError, VoteRequest, VoteResponse,
};
use tokio::sync::{mpsc, oneshot};

/// Cheap, cloneable sender for one node's event queue
#[derive(Debug, Clone)]
pub struct NodeHandle {
    id: NodeId,
    tx: mpsc::UnboundedSender<NodeEvent>,
}

impl NodeHandle {
    pub fn new(id: NodeId, tx: mpsc::UnboundedSender<NodeEvent>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// True once the node task has exited
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Replicate `data` and wait until it is applied on this node.
    ///
    /// Returns the entry's log index. A follower answers with
    /// `ServiceRedirect` naming the leader it knows of, or `ClusterDown`.
    pub async fn propose(&self, data: Vec<u8>) -> Result<LogIndex, RaftError> {
        let (reply, rx) = oneshot::channel();
        self.send(NodeEvent::Propose { data, reply })?;
        rx.await.map_err(|_| RaftError::Stopped)?
    }

    pub async fn status(&self) -> Result<NodeStatus, RaftError> {
        let (reply, rx) = oneshot::channel();
        self.send(NodeEvent::Status { reply })?;
        rx.await.map_err(|_| RaftError::Stopped)
    }

    /// Ask the node to exit its loop; does not wait for it
    pub fn stop(&self) {
        let _ = self.tx.send(NodeEvent::Stop);
    }

    pub async fn request_vote(&self, request: VoteRequest) -> Result<VoteResponse, RpcError> {
        let (reply, rx) = oneshot::channel();
        self.deliver(NodeEvent::RequestVote { request, reply })?;
        rx.await.map_err(|_| RpcError::Canceled)
    }

    pub async fn append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, RpcError> {
        let (reply, rx) = oneshot::channel();
        self.deliver(NodeEvent::AppendEntries { request, reply })?;
        rx.await.map_err(|_| RpcError::Canceled)
    }

    pub async fn install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse, RpcError> {
        let (reply, rx) = oneshot::channel();
        self.deliver(NodeEvent::InstallSnapshot { request, reply })?;
        rx.await.map_err(|_| RpcError::Canceled)
    }

    fn send(&self, event: NodeEvent) -> Result<(), RaftError> {
        self.tx.send(event).map_err(|_| RaftError::Stopped)
    }

    fn deliver(&self, event: NodeEvent) -> Result<(), RpcError> {
        self.tx.send(event).map_err(|_| RpcError::Canceled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closed_queue_reports_stopped() {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = NodeHandle::new(4, tx);
        drop(rx);
        assert!(handle.is_closed());
        assert!(matches!(handle.propose(b"x".to_vec()).await, Err(RaftError::Stopped)));
        let vote = VoteRequest {
            term: 1,
            candidate_id: 0,
            last_log_index: 0,
            last_log_term: 0,
            peer_id: 4,
        };
        assert_eq!(handle.request_vote(vote).await, Err(RpcError::Canceled));
    }

    #[tokio::test]
    async fn dropped_reply_is_canceled() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = NodeHandle::new(1, tx);
        tokio::spawn(async move {
            // swallow the event, dropping its reply sender
            let _ = rx.recv().await;
        });
        let heartbeat = AppendEntriesRequest {
            term: 1,
            leader_id: 0,
            prev_log_index: 0,
            prev_log_term: 0,
            leader_commit: 0,
            entries: vec![],
            peer_id: 1,
        };
        assert_eq!(handle.append_entries(heartbeat).await, Err(RpcError::Canceled));
    }
}
