//! # transport
//!
//! why: keep the wire protocol outside the consensus core
//! relations: implemented by the embedding rpc layer, called by peer.rs from spawned tasks
//! what: PeerInfo, the RaftTransport async trait

use async_trait::async_trait;
use raft_core::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    NodeId, PeerAddress, RpcError, VoteRequest, VoteResponse,
};

/// Where a remote node lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: NodeId,
    pub address: PeerAddress,
}

/// Outbound rpc channel to the other members of the cluster.
///
/// A call that never produces a response resolves to an `RpcError`; the
/// node retries on its next timer tick.
#[async_trait]
pub trait RaftTransport: Send + Sync {
    async fn request_vote(
        &self,
        peer: &PeerInfo,
        request: VoteRequest,
    ) -> Result<VoteResponse, RpcError>;

    async fn append_entries(
        &self,
        peer: &PeerInfo,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, RpcError>;

    async fn install_snapshot(
        &self,
        peer: &PeerInfo,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse, RpcError>;
}
