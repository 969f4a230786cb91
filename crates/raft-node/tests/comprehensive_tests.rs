//! # comprehensive node tests
//!
//! why: verify whole clusters elect, replicate, compact and recover the way raft promises
//! relations: tests raft-node over real raft-storage directories with an in-process router
//! what: replication, failover, snapshot catch-up, safety properties, voting rules, single-node modes

mod common;

use common::*;
use raft_core::{LogIndex, NodeConfig, NodeId, NodeState, Term, VoteRequest};
use raft_node::{RaftError, RaftService};
use raft_storage::LogManager;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

fn assert_prefixes(logs: &[Vec<(LogIndex, Vec<u8>)>]) {
    let longest = logs.iter().max_by_key(|log| log.len()).cloned().unwrap_or_default();
    for log in logs {
        assert_eq!(log[..], longest[..log.len()], "applied sequences diverge");
    }
}

// =============================================================================
// SECTION 1: REPLICATION
// =============================================================================

mod replication {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn single_write_reaches_every_node() {
        let cluster = Cluster::launch(3, |_| {});
        let leader = cluster.wait_for_leader().await;
        assert_eq!(leader, 0);

        let index = cluster.propose("x").await;
        assert_eq!(index, 1);
        for id in 0..3 {
            cluster.wait_applied(id, 1).await;
            assert_eq!(cluster.applied(id), vec![(1, b"x".to_vec())]);
        }
        cluster.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn follower_redirects_to_leader() {
        let cluster = Cluster::launch(3, |_| {});
        cluster.propose("x").await;
        cluster.wait_applied(1, 1).await;

        let follower = cluster.handle(1).unwrap();
        match follower.propose(b"y".to_vec()).await {
            Err(RaftError::ServiceRedirect { leader_id, address }) => {
                assert_eq!(leader_id, 0);
                assert_eq!(address, "local://node-0:7000");
            }
            other => panic!("expected redirect, got {other:?}"),
        }
        cluster.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn roles_reach_the_state_machine() {
        let cluster = Cluster::launch(3, |_| {});
        cluster.propose("x").await;
        cluster.wait_applied(2, 1).await;
        assert_eq!(cluster.machine(0).lock().states.first(), Some(&NodeState::Leader));
        assert_eq!(cluster.machine(2).lock().states.first(), Some(&NodeState::Follower));
        cluster.stop_all().await;
    }
}

// =============================================================================
// SECTION 2: FAILOVER
// =============================================================================

mod failover {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn new_leader_continues_the_log() {
        let cluster = Cluster::launch(3, |_| {});
        for i in 1..=5 {
            cluster.propose(format!("e{i}")).await;
        }
        for id in 0..3 {
            cluster.wait_applied(id, 5).await;
        }
        let old = cluster.wait_for_leader().await;
        cluster.router.isolate(old);
        cluster.stop(old).await.unwrap();

        let new = cluster.wait_for_leader().await;
        assert_ne!(new, old);
        let index = cluster.propose("six").await;
        assert_eq!(index, 6);
        for id in (0..3).filter(|&id| id != old) {
            cluster.wait_applied(id, 6).await;
            let applied = cluster.applied(id);
            assert_eq!(applied.len(), 6);
            assert_eq!(applied[5], (6, b"six".to_vec()));
        }
        cluster.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn restarted_member_catches_up_with_matching_logs() {
        let mut cluster = Cluster::launch(3, |_| {});
        for i in 1..=10 {
            cluster.propose(format!("a{i}")).await;
        }
        for id in 0..3 {
            cluster.wait_applied(id, 10).await;
        }
        let old = cluster.wait_for_leader().await;
        cluster.stop(old).await.unwrap();
        for i in 1..=5 {
            cluster.propose(format!("b{i}")).await;
        }

        cluster.start(old);
        cluster.wait_applied(old, 15).await;
        let logs: Vec<_> = (0..3).map(|id| cluster.applied(id)).collect();
        assert_prefixes(&logs);
        cluster.stop_all().await;

        // entries with the same index and term carry the same data
        let managers: Vec<_> = (0..3)
            .map(|id| LogManager::open(cluster.data_dir(id)).unwrap())
            .collect();
        for a in &managers {
            assert!(a.last_index() >= 15);
            for b in &managers {
                for index in a.start_index().max(b.start_index())..=a.last_index().min(b.last_index()) {
                    let (x, y) = (a.entry(index).unwrap(), b.entry(index).unwrap());
                    if x.term == y.term {
                        assert_eq!(x.data, y.data, "index {index}");
                    }
                }
            }
        }
        for index in 1..=15 {
            let first = managers[0].entry(index).unwrap();
            assert!(managers.iter().all(|m| m.entry(index) == Some(first)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn full_restart_reapplies_committed_log() {
        let mut cluster = Cluster::launch(3, |_| {});
        for i in 1..=3 {
            cluster.propose(format!("a{i}")).await;
        }
        for id in 0..3 {
            cluster.wait_applied(id, 3).await;
        }
        cluster.stop(0).await.unwrap();
        for i in 4..=5 {
            cluster.propose(format!("b{i}")).await;
        }
        for id in 1..3 {
            cluster.wait_applied(id, 5).await;
        }
        cluster.stop_all().await;

        // every state machine starts empty, and nothing new is written
        for id in 0..3 {
            cluster.start(id);
        }
        let leader = cluster.wait_for_leader().await;
        cluster.wait_applied(leader, 5).await;
        for id in 0..3 {
            cluster.wait_applied(id, 5).await;
        }
        let logs: Vec<_> = (0..3).map(|id| cluster.applied(id)).collect();
        assert_prefixes(&logs);
        let applied = cluster.applied(leader);
        assert_eq!(applied.len(), 5);
        assert_eq!(applied[4], (5, b"b5".to_vec()));
        cluster.stop_all().await;
    }
}

// =============================================================================
// SECTION 3: SNAPSHOT CATCH-UP
// =============================================================================

mod snapshot_catch_up {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn isolated_follower_installs_streamed_snapshot() {
        let cluster = Cluster::launch(3, |config: &mut NodeConfig| {
            config.snapshot_count = 50;
            config.snapshot_frame_size = 512;
        });
        cluster.wait_for_leader().await;
        cluster.router.isolate(2);
        for i in 1..=200 {
            cluster.propose(format!("e{i}")).await;
        }
        cluster.wait_applied(0, 200).await;
        cluster.wait_applied(1, 200).await;
        for id in 0..2 {
            let status = cluster.status(id).await.unwrap();
            assert_eq!(status.start_index, 201);
        }
        assert_eq!(cluster.last_applied(2), 0);

        cluster.router.heal(2);
        cluster.wait_applied(2, 200).await;
        assert!(cluster.machine(2).lock().snapshots_loaded >= 1);
        assert_eq!(cluster.applied(2), cluster.applied(0));

        let index = cluster.propose("after").await;
        assert_eq!(index, 201);
        cluster.wait_applied(2, 201).await;
        cluster.stop_all().await;
    }
}

// =============================================================================
// SECTION 4: SAFETY UNDER MESSAGE LOSS
// =============================================================================

mod safety {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn at_most_one_leader_per_term() {
        let cluster = Cluster::launch(3, |_| {});
        cluster.router.set_drop_rate(7, 0.3);
        let mut leaders: BTreeMap<Term, BTreeSet<NodeId>> = BTreeMap::new();
        for _ in 0..400 {
            for status in cluster.statuses().await {
                if status.is_leader() {
                    leaders.entry(status.current_term).or_default().insert(status.id);
                }
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(!leaders.is_empty());
        for (term, ids) in &leaders {
            assert_eq!(ids.len(), 1, "term {term} had leaders {ids:?}");
        }
        cluster.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn commit_only_moves_forward_and_applies_agree() {
        let cluster = Cluster::launch(3, |_| {});
        cluster.router.set_drop_rate(11, 0.1);
        let mut seen: BTreeMap<NodeId, (Term, LogIndex)> = BTreeMap::new();
        for i in 1..=20 {
            cluster.propose(format!("w{i}")).await;
            for status in cluster.statuses().await {
                let previous = seen.entry(status.id).or_insert((0, 0));
                assert!(status.commit_index >= previous.1, "node {} commit went back", status.id);
                assert!(status.current_term >= previous.0, "node {} term went back", status.id);
                *previous = (status.current_term, status.commit_index);
            }
        }
        cluster.router.clear_drops();
        let logs: Vec<_> = (0..3).map(|id| cluster.applied(id)).collect();
        assert_prefixes(&logs);
        cluster.stop_all().await;
    }
}

// =============================================================================
// SECTION 5: VOTING RULES
// =============================================================================

mod voting {
    use super::*;

    async fn vote_from_prepared_node(strict: bool) -> (bool, Term) {
        let mut cluster = Cluster::with_config(3, move |config: &mut NodeConfig| {
            config.election_timeout_ms = 10_000;
            config.strict_vote_check = strict;
        });
        {
            let mut log = LogManager::open(cluster.data_dir(1)).unwrap();
            let entries = (1..=5).map(|i| raft_core::LogEntry::new(3, i, vec![])).collect();
            log.append_entries(entries).unwrap();
            log.set_current_term(3).unwrap();
        }
        cluster.start(1);
        let response = cluster
            .service(1)
            .request_vote(VoteRequest {
                term: 4,
                candidate_id: 2,
                last_log_index: 5,
                last_log_term: 2,
                peer_id: 1,
            })
            .await
            .unwrap();
        let voted_for = cluster.status(1).await.unwrap().voted_for;
        assert_eq!(voted_for.is_some(), response.vote_granted);
        cluster.stop_all().await;
        (response.vote_granted, response.term)
    }

    #[tokio::test(start_paused = true)]
    async fn default_rule_compares_last_index_only() {
        assert_eq!(vote_from_prepared_node(false).await, (true, 4));
    }

    #[tokio::test(start_paused = true)]
    async fn strict_rule_prefers_newer_last_term() {
        assert_eq!(vote_from_prepared_node(true).await, (false, 4));
    }
}

// =============================================================================
// SECTION 6: SINGLE NODE MODES
// =============================================================================

mod single_node {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn standalone_node_leads_alone() {
        let mut cluster = Cluster::with_config(3, |config: &mut NodeConfig| config.standalone = true);
        cluster.start(1);
        let status = cluster.status(1).await.unwrap();
        assert!(status.is_leader());

        let handle = cluster.handle(1).unwrap();
        assert_eq!(handle.propose(b"a".to_vec()).await.unwrap(), 1);
        assert_eq!(cluster.applied(1), vec![(1, b"a".to_vec())]);

        let response = cluster
            .service(1)
            .request_vote(VoteRequest {
                term: 9,
                candidate_id: 0,
                last_log_index: 0,
                last_log_term: 0,
                peer_id: 1,
            })
            .await
            .unwrap();
        assert!(response.vote_granted);
        assert!(cluster.status(1).await.unwrap().is_leader());
        cluster.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn single_voter_restart_replays_snapshot_and_log() {
        let mut cluster = Cluster::with_config(1, |config: &mut NodeConfig| config.snapshot_count = 4);
        cluster.start(0);
        for i in 1..=10 {
            assert_eq!(cluster.propose(format!("s{i}")).await, i);
        }
        let before = cluster.applied(0);
        cluster.stop(0).await.unwrap();

        cluster.start(0);
        let status = cluster.status(0).await.unwrap();
        assert!(status.is_leader());
        assert_eq!(status.start_index, 9);
        assert_eq!(status.commit_index, 10);
        assert_eq!(cluster.applied(0), before);
        assert_eq!(cluster.machine(0).lock().snapshots_loaded, 1);
        cluster.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn state_machine_failure_stops_the_node() {
        common::init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig {
            id: 0,
            data_dir: dir.path().join("node-0"),
            peers: peer_urls(1),
            ..Default::default()
        };
        let router = Arc::new(Router::default());
        let service = Arc::new(RaftService::new());
        router.register(0, Arc::clone(&service));
        let transport = Arc::new(LocalTransport::new(0, Arc::clone(&router)));
        let handle = service
            .create_node(config, Box::new(RecordingMachine::failing_at(Shared::default(), 3)), transport)
            .unwrap();

        assert_eq!(handle.propose(b"1".to_vec()).await.unwrap(), 1);
        assert_eq!(handle.propose(b"2".to_vec()).await.unwrap(), 2);
        assert!(matches!(handle.propose(b"3".to_vec()).await, Err(RaftError::Stopped)));

        wait_until("node task to exit", || !service.is_running(0)).await;
        assert!(matches!(service.remove_node(0).await, Err(RaftError::StateMachine(_))));
    }
}
