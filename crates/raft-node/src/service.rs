//! # service
//!
//! why: host several raft nodes in one process and route inbound rpcs to them
//! relations: spawns node.rs tasks, keeps their handles; the transport layer calls into it
//! what: RaftService (node registry, lifecycle, rpc dispatch by peer_id)

use crate::error::RaftError;
use crate::handle::NodeHandle;
use crate::node::RaftNode;
use crate::transport::RaftTransport;
use parking_lot::RwLock;
use raft_core::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    NodeConfig, NodeId, RpcError, StateMachine, VoteRequest, VoteResponse,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

struct NodeSlot {
    handle: NodeHandle,
    task: JoinHandle<Result<(), RaftError>>,
}

/// Registry of the raft nodes running in this process
#[derive(Default)]
pub struct RaftService {
    nodes: RwLock<HashMap<NodeId, NodeSlot>>,
}

impl RaftService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a node's storage and start its task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn create_node(
        &self,
        config: NodeConfig,
        state_machine: Box<dyn StateMachine>,
        transport: Arc<dyn RaftTransport>,
    ) -> Result<NodeHandle, RaftError> {
        let id = config.id;
        if self.nodes.read().contains_key(&id) {
            return Err(RaftError::NodeExists(id));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let node = RaftNode::new(config, state_machine, transport, tx.clone())?;
        let handle = NodeHandle::new(id, tx);

        let mut nodes = self.nodes.write();
        if nodes.contains_key(&id) {
            return Err(RaftError::NodeExists(id));
        }
        let task = tokio::spawn(node.run(rx));
        nodes.insert(
            id,
            NodeSlot {
                handle: handle.clone(),
                task,
            },
        );
        info!(node_id = id, "raft node created");
        Ok(handle)
    }

    pub fn node(&self, id: NodeId) -> Option<NodeHandle> {
        self.nodes.read().get(&id).map(|slot| slot.handle.clone())
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// True while the node is registered and its task has not exited
    pub fn is_running(&self, id: NodeId) -> bool {
        self.nodes
            .read()
            .get(&id)
            .is_some_and(|slot| !slot.task.is_finished())
    }

    /// Stop a node, wait for its task and return how it ended
    pub async fn remove_node(&self, id: NodeId) -> Result<(), RaftError> {
        let slot = self.nodes.write().remove(&id);
        let Some(slot) = slot else {
            return Err(RaftError::NodeNotFound(id));
        };
        slot.handle.stop();
        let result = match slot.task.await {
            Ok(result) => result,
            Err(err) => {
                warn!(node_id = id, error = %err, "raft node task did not finish cleanly");
                Err(RaftError::Stopped)
            }
        };
        info!(node_id = id, ok = result.is_ok(), "raft node removed");
        result
    }

    /// Stop every node; fatal node errors are logged and dropped
    pub async fn stop(&self) {
        for id in self.node_ids() {
            if let Err(err) = self.remove_node(id).await {
                warn!(node_id = id, error = %err, "raft node ended with error");
            }
        }
    }

    pub async fn request_vote(&self, request: VoteRequest) -> Result<VoteResponse, RpcError> {
        self.target(request.peer_id)?.request_vote(request).await
    }

    pub async fn append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, RpcError> {
        self.target(request.peer_id)?.append_entries(request).await
    }

    pub async fn install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse, RpcError> {
        self.target(request.peer_id)?.install_snapshot(request).await
    }

    fn target(&self, id: NodeId) -> Result<NodeHandle, RpcError> {
        self.node(id).ok_or(RpcError::NodeNotFound(id))
    }
}
