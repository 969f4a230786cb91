//! in-process cluster harness: a router standing in for the network,
//! a state machine that records what it sees, and polling helpers

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use raft_core::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    LogIndex, NodeConfig, NodeId, NodeState, NodeStatus, RpcError, StateMachine,
    StateMachineError, VoteRequest, VoteResponse,
};
use raft_node::{NodeHandle, PeerInfo, RaftError, RaftService, RaftTransport};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::sleep;

pub const POLL: Duration = Duration::from_millis(10);
pub const MAX_POLLS: usize = 3000;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// -- network --

/// Delivers rpcs between services living in the same process
#[derive(Default)]
pub struct Router {
    services: RwLock<HashMap<NodeId, Arc<RaftService>>>,
    isolated: RwLock<HashSet<NodeId>>,
    drops: Mutex<Option<(StdRng, f64)>>,
}

impl Router {
    pub fn register(&self, id: NodeId, service: Arc<RaftService>) {
        self.services.write().insert(id, service);
    }

    /// Cut every link to and from `id`
    pub fn isolate(&self, id: NodeId) {
        self.isolated.write().insert(id);
    }

    pub fn heal(&self, id: NodeId) {
        self.isolated.write().remove(&id);
    }

    pub fn is_isolated(&self, id: NodeId) -> bool {
        self.isolated.read().contains(&id)
    }

    /// Lose a seeded-random share of requests
    pub fn set_drop_rate(&self, seed: u64, rate: f64) {
        *self.drops.lock() = Some((StdRng::seed_from_u64(seed), rate));
    }

    pub fn clear_drops(&self) {
        *self.drops.lock() = None;
    }

    fn link_up(&self, from: NodeId, to: NodeId) -> bool {
        let isolated = self.isolated.read();
        !isolated.contains(&from) && !isolated.contains(&to)
    }

    fn dropped(&self) -> bool {
        match &mut *self.drops.lock() {
            Some((rng, rate)) => rng.gen_bool(*rate),
            None => false,
        }
    }

    fn route(&self, from: NodeId, to: NodeId) -> Result<Arc<RaftService>, RpcError> {
        if !self.link_up(from, to) || self.dropped() {
            return Err(RpcError::Unreachable(format!("node-{to}")));
        }
        self.services
            .read()
            .get(&to)
            .cloned()
            .ok_or(RpcError::NodeNotFound(to))
    }

    fn back(&self, from: NodeId, to: NodeId) -> Result<(), RpcError> {
        if self.link_up(from, to) {
            Ok(())
        } else {
            Err(RpcError::Unreachable(format!("node-{to}")))
        }
    }
}

pub struct LocalTransport {
    from: NodeId,
    router: Arc<Router>,
}

impl LocalTransport {
    pub fn new(from: NodeId, router: Arc<Router>) -> Self {
        Self { from, router }
    }
}

#[async_trait]
impl RaftTransport for LocalTransport {
    async fn request_vote(&self, peer: &PeerInfo, request: VoteRequest) -> Result<VoteResponse, RpcError> {
        let service = self.router.route(self.from, peer.id)?;
        let response = service.request_vote(request).await?;
        self.router.back(self.from, peer.id)?;
        Ok(response)
    }

    async fn append_entries(
        &self,
        peer: &PeerInfo,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, RpcError> {
        let service = self.router.route(self.from, peer.id)?;
        let response = service.append_entries(request).await?;
        self.router.back(self.from, peer.id)?;
        Ok(response)
    }

    async fn install_snapshot(
        &self,
        peer: &PeerInfo,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse, RpcError> {
        let service = self.router.route(self.from, peer.id)?;
        let response = service.install_snapshot(request).await?;
        self.router.back(self.from, peer.id)?;
        Ok(response)
    }
}

// -- state machine --

#[derive(Debug, Default)]
pub struct Recorded {
    pub applied: Vec<(LogIndex, Vec<u8>)>,
    pub states: Vec<NodeState>,
    pub snapshots_loaded: usize,
}

pub type Shared = Arc<Mutex<Recorded>>;

pub struct RecordingMachine {
    shared: Shared,
    fail_at: Option<LogIndex>,
}

impl RecordingMachine {
    pub fn new(shared: Shared) -> Self {
        Self {
            shared,
            fail_at: None,
        }
    }

    pub fn failing_at(shared: Shared, index: LogIndex) -> Self {
        Self {
            shared,
            fail_at: Some(index),
        }
    }
}

impl StateMachine for RecordingMachine {
    fn on_state_changed(&mut self, state: NodeState) {
        self.shared.lock().states.push(state);
    }

    fn save_snapshot(&mut self) -> Result<Vec<u8>, StateMachineError> {
        serde_json::to_vec(&self.shared.lock().applied)
            .map_err(|err| StateMachineError::message(err.to_string()))
    }

    fn load_snapshot(&mut self, data: &[u8]) -> Result<(), StateMachineError> {
        let applied: Vec<(LogIndex, Vec<u8>)> = serde_json::from_slice(data)
            .map_err(|err| StateMachineError::message(err.to_string()))?;
        let mut shared = self.shared.lock();
        shared.applied = applied;
        shared.snapshots_loaded += 1;
        Ok(())
    }

    fn apply_entry(&mut self, index: LogIndex, data: &[u8]) -> Result<(), StateMachineError> {
        if self.fail_at == Some(index) {
            return Err(StateMachineError::message(format!("refusing entry {index}")));
        }
        self.shared.lock().applied.push((index, data.to_vec()));
        Ok(())
    }
}

// -- cluster --

pub fn peer_urls(size: usize) -> Vec<String> {
    (0..size)
        .map(|i| format!("local://node-{i}:{}", 7000 + i))
        .collect()
}

pub struct Cluster {
    pub dir: TempDir,
    pub router: Arc<Router>,
    size: usize,
    tune: Box<dyn Fn(&mut NodeConfig)>,
    services: Vec<Arc<RaftService>>,
    machines: Vec<Shared>,
}

impl Cluster {
    pub fn new(size: usize) -> Self {
        Self::with_config(size, |_| {})
    }

    pub fn with_config(size: usize, tune: impl Fn(&mut NodeConfig) + 'static) -> Self {
        init_tracing();
        let router = Arc::new(Router::default());
        let services: Vec<_> = (0..size).map(|_| Arc::new(RaftService::new())).collect();
        for (id, service) in services.iter().enumerate() {
            router.register(id as NodeId, Arc::clone(service));
        }
        Self {
            dir: tempfile::tempdir().unwrap(),
            router,
            size,
            tune: Box::new(tune),
            services,
            machines: (0..size).map(|_| Shared::default()).collect(),
        }
    }

    /// Create and start every node
    pub fn launch(size: usize, tune: impl Fn(&mut NodeConfig) + 'static) -> Self {
        let mut cluster = Self::with_config(size, tune);
        for id in 0..size as NodeId {
            cluster.start(id);
        }
        cluster
    }

    pub fn data_dir(&self, id: NodeId) -> PathBuf {
        self.dir.path().join(format!("node-{id}"))
    }

    pub fn config(&self, id: NodeId) -> NodeConfig {
        let mut config = NodeConfig {
            id,
            data_dir: self.data_dir(id),
            peers: peer_urls(self.size),
            election_timeout_ms: 150,
            heartbeat_interval_ms: 50,
            ..Default::default()
        };
        (self.tune)(&mut config);
        config
    }

    /// Start `id` with a fresh state machine over whatever is on disk
    pub fn start(&mut self, id: NodeId) -> NodeHandle {
        let shared = Shared::default();
        self.machines[id as usize] = Arc::clone(&shared);
        let transport = Arc::new(LocalTransport::new(id, Arc::clone(&self.router)));
        self.services[id as usize]
            .create_node(self.config(id), Box::new(RecordingMachine::new(shared)), transport)
            .unwrap()
    }

    pub async fn stop(&self, id: NodeId) -> Result<(), RaftError> {
        self.services[id as usize].remove_node(id).await
    }

    pub async fn stop_all(&self) {
        for service in &self.services {
            service.stop().await;
        }
    }

    pub fn service(&self, id: NodeId) -> &Arc<RaftService> {
        &self.services[id as usize]
    }

    pub fn handle(&self, id: NodeId) -> Option<NodeHandle> {
        self.services[id as usize].node(id)
    }

    pub async fn status(&self, id: NodeId) -> Option<NodeStatus> {
        self.handle(id)?.status().await.ok()
    }

    pub async fn statuses(&self) -> Vec<NodeStatus> {
        let mut statuses = Vec::new();
        for id in 0..self.size as NodeId {
            if let Some(status) = self.status(id).await {
                statuses.push(status);
            }
        }
        statuses
    }

    /// Leader of the highest term among running, connected nodes
    pub async fn leader(&self) -> Option<NodeId> {
        let statuses: Vec<_> = self
            .statuses()
            .await
            .into_iter()
            .filter(|s| !self.router.is_isolated(s.id))
            .collect();
        let top = statuses.iter().map(|s| s.current_term).max()?;
        statuses
            .iter()
            .find(|s| s.is_leader() && s.current_term == top)
            .map(|s| s.id)
    }

    pub async fn wait_for_leader(&self) -> NodeId {
        for _ in 0..MAX_POLLS {
            if let Some(id) = self.leader().await {
                return id;
            }
            sleep(POLL).await;
        }
        panic!("no leader elected");
    }

    /// Propose through the current leader, retrying across leader changes
    pub async fn propose(&self, data: impl Into<Vec<u8>>) -> LogIndex {
        let data = data.into();
        for _ in 0..MAX_POLLS {
            let leader = self.wait_for_leader().await;
            if let Some(handle) = self.handle(leader) {
                if let Ok(index) = handle.propose(data.clone()).await {
                    return index;
                }
            }
            sleep(POLL).await;
        }
        panic!("proposal never committed");
    }

    pub fn machine(&self, id: NodeId) -> Shared {
        Arc::clone(&self.machines[id as usize])
    }

    pub fn applied(&self, id: NodeId) -> Vec<(LogIndex, Vec<u8>)> {
        self.machines[id as usize].lock().applied.clone()
    }

    pub fn last_applied(&self, id: NodeId) -> LogIndex {
        self.machines[id as usize]
            .lock()
            .applied
            .last()
            .map_or(0, |(index, _)| *index)
    }

    pub async fn wait_applied(&self, id: NodeId, index: LogIndex) {
        wait_until(&format!("node {id} to apply {index}"), || self.last_applied(id) >= index).await;
    }
}

pub async fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    for _ in 0..MAX_POLLS {
        if done() {
            return;
        }
        sleep(POLL).await;
    }
    panic!("timed out waiting for {what}");
}
