//! # node
//!
//! why: run the raft protocol for one member of the cluster
//! relations: owns a LogManager (raft-storage), one Peer per remote member and the application StateMachine
//! what: RaftNode event loop - elections, replication, commit and apply, snapshot compaction and streaming
//!
//! the node is owned by a single tokio task. inbound rpcs, client writes and
//! replies to outbound calls all arrive on one queue, so no state here is
//! ever shared or locked.

use crate::error::RaftError;
use crate::event::{NodeEvent, Reply};
use crate::peer::{CallContext, Peer};
use crate::transport::{PeerInfo, RaftTransport};
use rand::Rng;
use raft_core::quorum::{is_majority, median_low};
use raft_core::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    LogEntry, LogIndex, NodeConfig, NodeId, NodeState, NodeStatus, RpcError, StateMachine, Term,
    VoteRequest, VoteResponse, NIL_LOG_INDEX,
};
use raft_storage::LogManager;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

/// Leader-side view of one voter's log
#[derive(Debug, Clone)]
struct Progress {
    next_index: LogIndex,
    match_index: LogIndex,
    snapshot: Option<SnapshotTransfer>,
}

/// Position in a snapshot being streamed to a follower
#[derive(Debug, Clone)]
struct SnapshotTransfer {
    last_included_index: LogIndex,
    offset: u64,
    in_flight: bool,
}

type ProposalReply = oneshot::Sender<Result<LogIndex, RaftError>>;

pub struct RaftNode {
    id: NodeId,
    config: NodeConfig,
    voters: Vec<NodeId>,
    state: NodeState,
    leader_id: Option<NodeId>,
    commit_index: LogIndex,
    last_applied: LogIndex,
    log: LogManager,
    state_machine: Box<dyn StateMachine>,
    peers: BTreeMap<NodeId, Peer>,
    progress: BTreeMap<NodeId, Progress>,
    votes: BTreeSet<NodeId>,
    pending: BTreeMap<LogIndex, ProposalReply>,
    election_deadline: Option<Instant>,
    heartbeat_deadline: Option<Instant>,
}

impl RaftNode {
    /// Validate `config`, open the node's storage and wire up its peers.
    ///
    /// Replies to outbound calls are posted to `events`, which must feed the
    /// receiver later passed to `run`.
    pub fn new(
        config: NodeConfig,
        state_machine: Box<dyn StateMachine>,
        transport: Arc<dyn RaftTransport>,
        events: mpsc::UnboundedSender<NodeEvent>,
    ) -> Result<Self, RaftError> {
        let config = config.normalized();
        let addresses = config.validate()?;
        if config.debug_mode {
            info!(node_id = config.id, config = ?config, "raft node configuration");
        }
        let log = LogManager::open(&config.data_dir)?;

        let mut peers = BTreeMap::new();
        if !config.standalone {
            for (id, address) in addresses.into_iter().enumerate() {
                let id = id as NodeId;
                if id == config.id {
                    continue;
                }
                let info = PeerInfo { id, address };
                let peer = Peer::new(
                    info,
                    Arc::clone(&transport),
                    events.clone(),
                    config.election_timeout(),
                );
                peers.insert(id, peer);
            }
        }

        Ok(Self {
            id: config.id,
            voters: config.voters(),
            config,
            state: NodeState::Unknown,
            leader_id: None,
            commit_index: NIL_LOG_INDEX,
            last_applied: NIL_LOG_INDEX,
            log,
            state_machine,
            peers,
            progress: BTreeMap::new(),
            votes: BTreeSet::new(),
            pending: BTreeMap::new(),
            election_deadline: None,
            heartbeat_deadline: None,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.id,
            state: self.state,
            current_term: self.log.current_term(),
            voted_for: self.log.voted_for(),
            leader_id: self.leader_id,
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            start_index: self.log.start_index(),
            last_index: self.log.last_index(),
        }
    }

    /// Drive the node until `Stop`, a closed queue, or a fatal error.
    ///
    /// Storage and state-machine failures are fatal: peers are closed,
    /// pending writes fail with `Stopped`, and the error is returned.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<NodeEvent>) -> Result<(), RaftError> {
        let result = self.serve(&mut events).await;
        if let Err(err) = &result {
            error!(node_id = self.id, error = %err, "raft node stopped on fatal error");
        }
        self.shutdown();
        result
    }

    async fn serve(&mut self, events: &mut mpsc::UnboundedReceiver<NodeEvent>) -> Result<(), RaftError> {
        self.start()?;
        loop {
            let election = self.election_deadline;
            let heartbeat = self.heartbeat_deadline;
            tokio::select! {
                event = events.recv() => match event {
                    Some(NodeEvent::Stop) | None => {
                        info!(node_id = self.id, "raft node stopping");
                        return Ok(());
                    }
                    Some(event) => self.handle_event(event)?,
                },
                _ = sleep_until(election.unwrap_or_else(Instant::now)), if election.is_some() => {
                    self.on_election_timeout()?;
                }
                _ = sleep_until(heartbeat.unwrap_or_else(Instant::now)), if heartbeat.is_some() => {
                    self.on_heartbeat_timeout()?;
                }
            }
        }
    }

    fn start(&mut self) -> Result<(), RaftError> {
        self.recover()?;
        if self.config.is_single_voter() || (self.id == 0 && self.log.current_term() == 0) {
            // only node 0 can lead term 0, no election needed
            self.become_leader();
        } else {
            self.become_follower(self.log.current_term(), None)?;
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        self.election_deadline = None;
        self.heartbeat_deadline = None;
        for peer in self.peers.values_mut() {
            let canceled = peer.close();
            if !canceled.is_empty() {
                debug!(node_id = self.id, peer = peer.id(), calls = canceled.len(), "canceled in-flight calls");
            }
        }
        self.fail_pending(|_| RaftError::Stopped);
    }

    /// Rebuild the state machine from the snapshot, then re-apply the log up
    /// to the persisted commit index. A single voter commits its whole log.
    fn recover(&mut self) -> Result<(), RaftError> {
        let snapshot_index = self.log.snapshot().last_index();
        if snapshot_index != NIL_LOG_INDEX {
            self.state_machine.load_snapshot(self.log.snapshot().data())?;
            info!(node_id = self.id, index = snapshot_index, "state machine restored from snapshot");
        }
        self.commit_index = snapshot_index;
        self.last_applied = snapshot_index;
        let committed = if self.config.is_single_voter() {
            self.log.last_index()
        } else {
            self.log.commit_index().min(self.log.last_index())
        };
        if committed > snapshot_index {
            info!(node_id = self.id, from = snapshot_index, to = committed, "re-applying committed log");
            self.commit_to(committed)?;
        }
        Ok(())
    }

    fn handle_event(&mut self, event: NodeEvent) -> Result<(), RaftError> {
        match event {
            NodeEvent::RequestVote { request, reply } => {
                let response = self.handle_request_vote(request)?;
                let _ = reply.send(response);
            }
            NodeEvent::AppendEntries { request, reply } => {
                let response = self.handle_append_entries(request)?;
                let _ = reply.send(response);
            }
            NodeEvent::InstallSnapshot { request, reply } => {
                let response = self.handle_install_snapshot(request)?;
                let _ = reply.send(response);
            }
            NodeEvent::Reply {
                peer,
                call_id,
                result,
            } => self.handle_reply(peer, call_id, result)?,
            NodeEvent::Propose { data, reply } => self.propose(data, reply)?,
            NodeEvent::Status { reply } => {
                let _ = reply.send(self.status());
            }
            NodeEvent::Stop => {}
        }
        Ok(())
    }

    // -- role transitions --

    fn become_follower(&mut self, term: Term, leader_id: Option<NodeId>) -> Result<(), RaftError> {
        if term > self.log.current_term() {
            self.log.set_current_term(term)?;
            self.log.set_voted_for(None)?;
        }
        self.leader_id = leader_id;
        self.progress.clear();
        self.votes.clear();
        self.heartbeat_deadline = None;
        self.reset_election_timer();
        self.fail_pending(|index| RaftError::LeadershipLost { index });
        self.set_state(NodeState::Follower);
        Ok(())
    }

    fn become_candidate(&mut self) -> Result<(), RaftError> {
        if self.state == NodeState::Leader {
            return Ok(());
        }
        let term = self.log.incr_current_term()?;
        self.log.set_voted_for(Some(self.id))?;
        self.leader_id = None;
        self.votes.clear();
        self.votes.insert(self.id);
        self.reset_election_timer();
        self.set_state(NodeState::Candidate);
        info!(node_id = self.id, term, "starting election");

        if is_majority(self.votes.len(), self.voters.len()) {
            self.become_leader();
            return Ok(());
        }
        let last_log_index = self.log.last_index();
        let last_log_term = self.log.last_log_term();
        for peer in self.peers.values_mut() {
            peer.request_vote(VoteRequest {
                term,
                candidate_id: self.id,
                last_log_index,
                last_log_term,
                peer_id: peer.id(),
            });
        }
        Ok(())
    }

    fn become_leader(&mut self) {
        let next_index = self.log.next_index();
        self.progress = self
            .voters
            .iter()
            .map(|&id| {
                let progress = Progress {
                    next_index,
                    match_index: 0,
                    snapshot: None,
                };
                (id, progress)
            })
            .collect();
        if let Some(own) = self.progress.get_mut(&self.id) {
            own.match_index = self.log.last_index();
        }
        self.leader_id = Some(self.id);
        self.votes.clear();
        self.election_deadline = None;
        self.heartbeat_deadline = if self.peers.is_empty() {
            None
        } else {
            Some(Instant::now())
        };
        info!(node_id = self.id, term = self.log.current_term(), "became leader");
        self.set_state(NodeState::Leader);
    }

    fn set_state(&mut self, state: NodeState) {
        if self.state != state {
            debug!(node_id = self.id, from = %self.state, to = %state, "role changed");
            self.state = state;
            self.state_machine.on_state_changed(state);
        }
    }

    fn reset_election_timer(&mut self) {
        if self.config.is_single_voter() {
            self.election_deadline = None;
            return;
        }
        let base = self.config.election_timeout();
        let jitter = rand::thread_rng().gen_range(0..base.as_millis().max(1) as u64);
        self.election_deadline = Some(Instant::now() + base + Duration::from_millis(jitter));
    }

    fn on_election_timeout(&mut self) -> Result<(), RaftError> {
        self.election_deadline = None;
        if self.state != NodeState::Leader {
            debug!(node_id = self.id, term = self.log.current_term(), "election timeout");
            self.become_candidate()?;
        }
        Ok(())
    }

    fn on_heartbeat_timeout(&mut self) -> Result<(), RaftError> {
        if self.state != NodeState::Leader {
            self.heartbeat_deadline = None;
            return Ok(());
        }
        self.heartbeat_deadline = Some(Instant::now() + self.config.heartbeat_interval());
        self.broadcast_append()
    }

    // -- inbound rpcs --

    fn handle_request_vote(&mut self, request: VoteRequest) -> Result<VoteResponse, RaftError> {
        if self.config.standalone {
            return Ok(VoteResponse {
                term: request.term,
                vote_granted: true,
            });
        }
        if request.term < self.log.current_term() {
            return Ok(self.vote_response(false));
        }
        if request.term > self.log.current_term() {
            self.become_follower(request.term, None)?;
        }

        let last_index = self.log.last_index();
        let last_term = self.log.last_log_term();
        let up_to_date = if self.config.strict_vote_check {
            (request.last_log_term, request.last_log_index) >= (last_term, last_index)
        } else {
            request.last_log_index >= last_index
        };
        let free = match self.log.voted_for() {
            None => true,
            Some(candidate) => candidate == request.candidate_id,
        };
        let granted = up_to_date && free;
        if granted {
            self.log.set_voted_for(Some(request.candidate_id))?;
            self.reset_election_timer();
        }
        debug!(
            node_id = self.id,
            term = request.term,
            candidate = request.candidate_id,
            granted,
            "vote requested"
        );
        Ok(self.vote_response(granted))
    }

    fn vote_response(&self, vote_granted: bool) -> VoteResponse {
        VoteResponse {
            term: self.log.current_term(),
            vote_granted,
        }
    }

    fn handle_append_entries(&mut self, request: AppendEntriesRequest) -> Result<AppendEntriesResponse, RaftError> {
        if self.config.standalone {
            return Ok(AppendEntriesResponse {
                term: request.term,
                success: true,
                match_index: request.last_entry_index(),
            });
        }
        if request.term < self.log.current_term() {
            return Ok(self.append_response(false, self.log.last_index()));
        }
        self.follow(request.term, request.leader_id)?;

        let prev = request.prev_log_index;
        let prev_matches = prev <= self.log.snapshot().last_index()
            || self.log.term_at(prev) == Some(request.prev_log_term);
        if !prev_matches {
            debug!(
                node_id = self.id,
                prev_log_index = prev,
                prev_log_term = request.prev_log_term,
                last_index = self.log.last_index(),
                "append mismatch"
            );
            return Ok(self.append_response(false, self.log.last_index()));
        }

        let match_index = request.last_entry_index();
        let leader_commit = request.leader_commit;
        let mut fresh = Vec::new();
        let mut conflict = None;
        for entry in request.entries {
            if entry.index < self.log.start_index() {
                continue;
            }
            if fresh.is_empty() {
                match self.log.entry(entry.index) {
                    Some(existing) if existing.term == entry.term => continue,
                    Some(_) => conflict = Some(entry.index),
                    None => {}
                }
            }
            fresh.push(entry);
        }
        if let Some(first) = conflict {
            debug!(node_id = self.id, index = first, "erasing conflicting suffix");
            self.log.erase_entries(first, self.log.next_index())?;
        }
        if !fresh.is_empty() {
            self.log.append_entries(fresh)?;
        }

        let commit = leader_commit.min(match_index);
        if commit > self.commit_index {
            self.commit_to(commit)?;
        }
        Ok(self.append_response(true, match_index))
    }

    fn append_response(&self, success: bool, match_index: LogIndex) -> AppendEntriesResponse {
        AppendEntriesResponse {
            term: self.log.current_term(),
            success,
            match_index,
        }
    }

    /// Accept `leader_id` as leader of `term`
    fn follow(&mut self, term: Term, leader_id: NodeId) -> Result<(), RaftError> {
        if term > self.log.current_term() || self.state != NodeState::Follower {
            self.become_follower(term, Some(leader_id))
        } else {
            self.leader_id = Some(leader_id);
            self.reset_election_timer();
            Ok(())
        }
    }

    fn handle_install_snapshot(
        &mut self,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse, RaftError> {
        if !self.config.standalone && request.term >= self.log.current_term() {
            self.follow(request.term, request.leader_id)?;
            self.receive_snapshot_chunk(&request)?;
        }
        Ok(InstallSnapshotResponse {
            term: self.log.current_term(),
        })
    }

    fn receive_snapshot_chunk(&mut self, request: &InstallSnapshotRequest) -> Result<(), RaftError> {
        if request.last_included_index <= self.commit_index {
            debug!(
                node_id = self.id,
                index = request.last_included_index,
                commit_index = self.commit_index,
                "snapshot already covered by committed log"
            );
            return Ok(());
        }
        let installed = self.log.install_snapshot(
            request.last_included_index,
            request.last_included_term,
            request.offset,
            &request.data,
            request.done,
        );
        match installed {
            Ok(true) => {
                info!(
                    node_id = self.id,
                    index = request.last_included_index,
                    term = request.last_included_term,
                    "installed snapshot from leader"
                );
                self.recover()
            }
            Ok(false) => Ok(()),
            Err(err) if err.is_transfer_rejection() => {
                warn!(node_id = self.id, error = %err, "snapshot chunk rejected");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    // -- client writes --

    fn propose(&mut self, data: Vec<u8>, reply: ProposalReply) -> Result<(), RaftError> {
        if self.state != NodeState::Leader {
            let err = match self.leader_id {
                Some(leader_id) => RaftError::ServiceRedirect {
                    leader_id,
                    address: self
                        .config
                        .peers
                        .get(leader_id as usize)
                        .cloned()
                        .unwrap_or_default(),
                },
                None => RaftError::ClusterDown,
            };
            let _ = reply.send(Err(err));
            return Ok(());
        }
        let entry = LogEntry::new(self.log.current_term(), self.log.next_index(), data);
        self.pending.insert(entry.index, reply);
        self.append_entry(entry)
    }

    fn append_entry(&mut self, entry: LogEntry) -> Result<(), RaftError> {
        self.log.append_entries(vec![entry])?;
        self.broadcast_append()?;
        let last_index = self.log.last_index();
        self.on_append_success(self.id, last_index)
    }

    fn fail_pending(&mut self, make_error: impl Fn(LogIndex) -> RaftError) {
        for (index, reply) in std::mem::take(&mut self.pending) {
            let _ = reply.send(Err(make_error(index)));
        }
    }

    // -- replication --

    fn broadcast_append(&mut self) -> Result<(), RaftError> {
        let ids: Vec<NodeId> = self.peers.keys().copied().collect();
        for id in ids {
            self.send_append(id)?;
        }
        Ok(())
    }

    fn send_append(&mut self, peer_id: NodeId) -> Result<(), RaftError> {
        let Some(progress) = self.progress.get(&peer_id) else {
            return Ok(());
        };
        if let Some(transfer) = &progress.snapshot {
            if !transfer.in_flight {
                self.send_snapshot_chunk(peer_id);
            }
            return Ok(());
        }
        let next_index = progress.next_index;
        let prev_log_index = next_index.saturating_sub(1);
        let prev_log_term = match self.log.term_at(prev_log_index) {
            Some(term) if next_index >= self.log.start_index() => term,
            _ => {
                self.start_snapshot(peer_id);
                return Ok(());
            }
        };
        let last = next_index + self.config.max_append_entries as u64;
        let entries: Vec<LogEntry> = self.log.entries(next_index, last).cloned().collect();
        let request = AppendEntriesRequest {
            term: self.log.current_term(),
            leader_id: self.id,
            prev_log_index,
            prev_log_term,
            leader_commit: self.commit_index,
            entries,
            peer_id,
        };
        if let Some(peer) = self.peers.get_mut(&peer_id) {
            peer.append_entries(request);
        }
        Ok(())
    }

    fn start_snapshot(&mut self, peer_id: NodeId) {
        let last_included_index = self.log.snapshot().last_index();
        let Some(progress) = self.progress.get_mut(&peer_id) else {
            return;
        };
        if last_included_index == NIL_LOG_INDEX {
            progress.next_index = self.log.start_index();
            return;
        }
        info!(node_id = self.id, peer = peer_id, index = last_included_index, "streaming snapshot to follower");
        progress.snapshot = Some(SnapshotTransfer {
            last_included_index,
            offset: 0,
            in_flight: false,
        });
        self.send_snapshot_chunk(peer_id);
    }

    fn send_snapshot_chunk(&mut self, peer_id: NodeId) {
        let snapshot = self.log.snapshot();
        let (Some(progress), Some(peer)) = (self.progress.get_mut(&peer_id), self.peers.get_mut(&peer_id)) else {
            return;
        };
        let Some(transfer) = progress.snapshot.as_mut() else {
            return;
        };
        if transfer.last_included_index != snapshot.last_index() {
            // compacted again since the transfer began
            transfer.last_included_index = snapshot.last_index();
            transfer.offset = 0;
        }
        let bytes = snapshot.file_bytes();
        let start = (transfer.offset as usize).min(bytes.len());
        let end = (start + self.config.snapshot_frame_size).min(bytes.len());
        let request = InstallSnapshotRequest {
            term: self.log.current_term(),
            leader_id: self.id,
            last_included_index: snapshot.last_index(),
            last_included_term: snapshot.last_term(),
            offset: start as u64,
            data: bytes[start..end].to_vec(),
            done: end == bytes.len(),
            peer_id,
        };
        debug!(
            node_id = self.id,
            peer = peer_id,
            offset = request.offset,
            len = request.data.len(),
            done = request.done,
            "sending snapshot chunk"
        );
        transfer.in_flight = true;
        peer.install_snapshot(request);
    }

    // -- replies to outbound calls --

    fn handle_reply(
        &mut self,
        peer_id: NodeId,
        call_id: u64,
        result: Result<Reply, RpcError>,
    ) -> Result<(), RaftError> {
        let Some(context) = self.peers.get_mut(&peer_id).and_then(|peer| peer.complete(call_id)) else {
            return Ok(());
        };
        match (context, result) {
            (CallContext::RequestVote { term }, Ok(Reply::Vote(response))) => {
                self.on_vote_response(peer_id, term, response)
            }
            (CallContext::AppendEntries { term, prev_log_index }, Ok(Reply::Append(response))) => {
                self.on_append_response(peer_id, term, prev_log_index, response)
            }
            (
                CallContext::InstallSnapshot {
                    term,
                    last_included_index,
                    offset,
                    len,
                    done,
                },
                Ok(Reply::Snapshot(response)),
            ) => self.on_snapshot_response(peer_id, term, last_included_index, offset + len, done, response),
            (context, Err(err)) => {
                self.on_call_failed(peer_id, context, err);
                Ok(())
            }
            (context, Ok(reply)) => {
                warn!(node_id = self.id, peer = peer_id, ?context, ?reply, "reply does not match its call");
                Ok(())
            }
        }
    }

    /// Step down on a higher term; true when the reply is still relevant
    fn check_reply_term(&mut self, sent_term: Term, reply_term: Term, role: NodeState) -> Result<bool, RaftError> {
        if reply_term > self.log.current_term() {
            self.become_follower(reply_term, None)?;
            return Ok(false);
        }
        Ok(self.state == role && sent_term == self.log.current_term())
    }

    fn on_vote_response(&mut self, peer_id: NodeId, term: Term, response: VoteResponse) -> Result<(), RaftError> {
        if !self.check_reply_term(term, response.term, NodeState::Candidate)? {
            return Ok(());
        }
        if response.vote_granted {
            self.votes.insert(peer_id);
            debug!(node_id = self.id, voter = peer_id, votes = self.votes.len(), "received vote");
            if is_majority(self.votes.len(), self.voters.len()) {
                self.become_leader();
            }
        }
        Ok(())
    }

    fn on_append_response(
        &mut self,
        peer_id: NodeId,
        term: Term,
        prev_log_index: LogIndex,
        response: AppendEntriesResponse,
    ) -> Result<(), RaftError> {
        if !self.check_reply_term(term, response.term, NodeState::Leader)? {
            return Ok(());
        }
        if response.success {
            return self.on_append_success(peer_id, response.match_index);
        }
        let start_index = self.log.start_index();
        let Some(progress) = self.progress.get_mut(&peer_id) else {
            return Ok(());
        };
        if progress.next_index != prev_log_index + 1 || progress.snapshot.is_some() {
            // answer to an older request
            return Ok(());
        }
        if progress.next_index > start_index {
            progress.next_index = (progress.next_index - 1)
                .min(response.match_index + 1)
                .max(start_index);
            self.send_append(peer_id)
        } else {
            self.start_snapshot(peer_id);
            Ok(())
        }
    }

    fn on_append_success(&mut self, peer_id: NodeId, match_index: LogIndex) -> Result<(), RaftError> {
        let Some(progress) = self.progress.get_mut(&peer_id) else {
            return Ok(());
        };
        progress.match_index = progress.match_index.max(match_index);
        progress.next_index = progress.match_index + 1;
        let lagging = progress.next_index <= self.log.last_index();
        self.advance_commit()?;
        if peer_id != self.id && lagging && self.state == NodeState::Leader {
            self.send_append(peer_id)?;
        }
        Ok(())
    }

    /// Commit the highest index stored on a majority, once it is from this term
    fn advance_commit(&mut self) -> Result<(), RaftError> {
        let matched: Vec<LogIndex> = self
            .voters
            .iter()
            .map(|id| self.progress.get(id).map_or(0, |p| p.match_index))
            .collect();
        let candidate = median_low(&matched);
        if candidate > self.commit_index && self.log.term_at(candidate) == Some(self.log.current_term()) {
            self.commit_to(candidate)?;
        }
        Ok(())
    }

    fn on_snapshot_response(
        &mut self,
        peer_id: NodeId,
        term: Term,
        last_included_index: LogIndex,
        sent_up_to: u64,
        done: bool,
        response: InstallSnapshotResponse,
    ) -> Result<(), RaftError> {
        if !self.check_reply_term(term, response.term, NodeState::Leader)? {
            return Ok(());
        }
        let Some(progress) = self.progress.get_mut(&peer_id) else {
            return Ok(());
        };
        let Some(transfer) = progress.snapshot.as_mut() else {
            return Ok(());
        };
        if transfer.last_included_index != last_included_index {
            return Ok(());
        }
        transfer.in_flight = false;
        if done {
            progress.snapshot = None;
            progress.next_index = last_included_index + 1;
            info!(node_id = self.id, peer = peer_id, index = last_included_index, "snapshot transfer finished");
            self.send_append(peer_id)
        } else {
            transfer.offset = sent_up_to;
            self.send_snapshot_chunk(peer_id);
            Ok(())
        }
    }

    fn on_call_failed(&mut self, peer_id: NodeId, context: CallContext, err: RpcError) {
        if err == RpcError::Canceled {
            return;
        }
        warn!(node_id = self.id, peer = peer_id, term = context.term(), ?context, error = %err, "rpc failed");
        if let CallContext::InstallSnapshot { .. } = context {
            if let Some(transfer) = self
                .progress
                .get_mut(&peer_id)
                .and_then(|progress| progress.snapshot.as_mut())
            {
                transfer.offset = 0;
                transfer.in_flight = false;
            }
        }
    }

    // -- apply and compaction --

    /// Persist `index` as committed before applying up to it
    fn commit_to(&mut self, index: LogIndex) -> Result<(), RaftError> {
        self.log.set_commit_index(index)?;
        self.commit_index = index;
        self.apply_committed()
    }

    fn apply_committed(&mut self) -> Result<(), RaftError> {
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let Some(entry) = self.log.entry(index) else {
                warn!(node_id = self.id, index, "committed entry missing from log");
                break;
            };
            self.state_machine.apply_entry(index, &entry.data)?;
            self.last_applied = index;
            if let Some(reply) = self.pending.remove(&index) {
                let _ = reply.send(Ok(index));
            }
            self.maybe_compact()?;
        }
        Ok(())
    }

    fn maybe_compact(&mut self) -> Result<(), RaftError> {
        let start_index = self.log.start_index();
        if self.last_applied < start_index
            || self.last_applied - start_index + 1 < self.config.snapshot_count
        {
            return Ok(());
        }
        let Some(term) = self.log.term_at(self.last_applied) else {
            return Ok(());
        };
        let data = self.state_machine.save_snapshot()?;
        self.log.save_snapshot(self.last_applied, term, &data)?;
        info!(
            node_id = self.id,
            index = self.last_applied,
            term,
            bytes = data.len(),
            "created snapshot"
        );
        Ok(())
    }
}
