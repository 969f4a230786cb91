//! # peer
//!
//! why: turn outbound rpcs into tagged messages on the owning node's queue
//! relations: owned by node.rs, one per remote member; calls RaftTransport from spawned tasks
//! what: Peer (call spawning, in-flight tracking, close), CallContext

use crate::event::{NodeEvent, Reply};
use crate::transport::{PeerInfo, RaftTransport};
use raft_core::{
    AppendEntriesRequest, InstallSnapshotRequest, LogIndex, NodeId, RpcError, Term, VoteRequest,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

/// What the node needs to remember about a call to interpret its reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallContext {
    RequestVote {
        term: Term,
    },
    AppendEntries {
        term: Term,
        prev_log_index: LogIndex,
    },
    InstallSnapshot {
        term: Term,
        last_included_index: LogIndex,
        offset: u64,
        len: u64,
        done: bool,
    },
}

impl CallContext {
    /// Term the request was sent in
    pub fn term(&self) -> Term {
        match self {
            Self::RequestVote { term }
            | Self::AppendEntries { term, .. }
            | Self::InstallSnapshot { term, .. } => *term,
        }
    }
}

pub struct Peer {
    info: PeerInfo,
    transport: Arc<dyn RaftTransport>,
    events: mpsc::UnboundedSender<NodeEvent>,
    rpc_timeout: Duration,
    next_call_id: u64,
    inflight: HashMap<u64, (AbortHandle, CallContext)>,
}

impl Peer {
    pub fn new(
        info: PeerInfo,
        transport: Arc<dyn RaftTransport>,
        events: mpsc::UnboundedSender<NodeEvent>,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            info,
            transport,
            events,
            rpc_timeout,
            next_call_id: 1,
            inflight: HashMap::new(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.info.id
    }

    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }

    pub fn request_vote(&mut self, request: VoteRequest) -> u64 {
        let context = CallContext::RequestVote { term: request.term };
        self.spawn(context, move |transport, info| async move {
            transport.request_vote(&info, request).await.map(Reply::Vote)
        })
    }

    pub fn append_entries(&mut self, request: AppendEntriesRequest) -> u64 {
        let context = CallContext::AppendEntries {
            term: request.term,
            prev_log_index: request.prev_log_index,
        };
        self.spawn(context, move |transport, info| async move {
            transport.append_entries(&info, request).await.map(Reply::Append)
        })
    }

    pub fn install_snapshot(&mut self, request: InstallSnapshotRequest) -> u64 {
        let context = CallContext::InstallSnapshot {
            term: request.term,
            last_included_index: request.last_included_index,
            offset: request.offset,
            len: request.data.len() as u64,
            done: request.done,
        };
        self.spawn(context, move |transport, info| async move {
            transport
                .install_snapshot(&info, request)
                .await
                .map(Reply::Snapshot)
        })
    }

    /// Claim the context of a finished call; `None` if it was already closed
    pub fn complete(&mut self, call_id: u64) -> Option<CallContext> {
        self.inflight.remove(&call_id).map(|(_, context)| context)
    }

    /// Abort every outstanding call, post a `Canceled` reply for each and
    /// hand back their contexts
    pub fn close(&mut self) -> Vec<CallContext> {
        let peer = self.info.id;
        let mut canceled: Vec<(u64, CallContext)> = self
            .inflight
            .drain()
            .map(|(call_id, (task, context))| {
                task.abort();
                (call_id, context)
            })
            .collect();
        canceled.sort_by_key(|(call_id, _)| *call_id);
        for (call_id, _) in &canceled {
            let _ = self.events.send(NodeEvent::Reply {
                peer,
                call_id: *call_id,
                result: Err(RpcError::Canceled),
            });
        }
        canceled.into_iter().map(|(_, context)| context).collect()
    }

    fn spawn<F, Fut>(&mut self, context: CallContext, call: F) -> u64
    where
        F: FnOnce(Arc<dyn RaftTransport>, PeerInfo) -> Fut,
        Fut: Future<Output = Result<Reply, RpcError>> + Send + 'static,
    {
        let call_id = self.next_call_id;
        self.next_call_id += 1;

        let peer = self.info.id;
        let events = self.events.clone();
        let rpc_timeout = self.rpc_timeout;
        let call = call(Arc::clone(&self.transport), self.info.clone());
        let task = tokio::spawn(async move {
            let result = match tokio::time::timeout(rpc_timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(RpcError::Timeout),
            };
            // the node may already be gone
            let _ = events.send(NodeEvent::Reply {
                peer,
                call_id,
                result,
            });
        });
        self.inflight.insert(call_id, (task.abort_handle(), context));
        call_id
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.close();
    }
}
