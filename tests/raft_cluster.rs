//! Raft integration tests: election, replication, commit and snapshot catch-up

mod common;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{applied_contents, get, put, wait_until, TestCluster};
use quorumkv::raft::RaftRole;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_elects_exactly_one_leader() {
    let cluster = TestCluster::new(3);
    let mut seen = BTreeMap::new();

    let leader = cluster.wait_for_leader().await;
    for _ in 0..50 {
        cluster.check_election_safety(&mut seen);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let leader_id = leader.id().to_string();
    assert!(
        wait_until(Duration::from_secs(2), || cluster
            .running()
            .iter()
            .all(|n| n.get_leader().as_deref() == Some(leader_id.as_str())))
        .await,
        "followers never learned the leader"
    );
    for follower in cluster.followers_of(&leader) {
        assert_eq!(follower.get_role(), RaftRole::Follower);
        assert_eq!(follower.get_term(), leader.get_term());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_replicates_writes_to_every_node() {
    let cluster = TestCluster::new(3);
    let leader = cluster.wait_for_leader().await;
    let db = cluster.db(leader.id());

    for i in 0..10 {
        put(&db, &format!("key{:02}", i), &format!("value{}", i))
            .await
            .unwrap();
    }
    cluster.wait_applied_everywhere(leader.commit_index()).await;

    let expected = applied_contents(&leader);
    assert_eq!(expected.len(), 10);
    assert_eq!(expected["key07"], "value7");
    for node in cluster.running() {
        assert_eq!(applied_contents(&node), expected, "{} diverged", node.id());
    }

    // Log matching: equal (index, term) means equal entries
    let reference = leader.log_entries();
    for node in cluster.followers_of(&leader) {
        for entry in node.log_entries() {
            if let Some(theirs) = reference.iter().find(|e| e.index == entry.index) {
                if theirs.term == entry.term {
                    assert_eq!(theirs, &entry);
                }
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_commit_index_never_decreases() {
    let mut cluster = TestCluster::new(3);
    let leader = cluster.wait_for_leader().await;
    put(&cluster.db(leader.id()), "before", "1").await.unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let watched = cluster.running();
    let sampler = {
        let done = done.clone();
        tokio::spawn(async move {
            let mut last: Vec<u64> = vec![0; watched.len()];
            while !done.load(Ordering::Relaxed) {
                for (i, node) in watched.iter().enumerate() {
                    let commit = node.commit_index();
                    assert!(
                        commit >= last[i],
                        "{} commit index went from {} to {}",
                        node.id(),
                        last[i],
                        commit
                    );
                    last[i] = commit;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
    };

    // Force a leader change in the middle of the writes
    let old = leader.id().to_string();
    cluster.crash(&old);
    let survivors: Vec<String> = cluster.ids.iter().filter(|id| **id != old).cloned().collect();
    let refs: Vec<&str> = survivors.iter().map(String::as_str).collect();
    let leader = cluster
        .wait_for_leader_among(&refs, Duration::from_secs(5))
        .await;
    for i in 0..5 {
        put(&cluster.db(leader.id()), &format!("after{}", i), "x")
            .await
            .unwrap();
    }
    cluster.restart(&old);
    cluster.wait_applied_everywhere(leader.commit_index()).await;

    done.store(true, Ordering::Relaxed);
    sampler.await.unwrap();
    assert_eq!(
        get(&cluster.db(leader.id()), "before").await.unwrap().as_deref(),
        Some("1")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lagging_follower_catches_up_from_snapshot() {
    let mut config = common::fast_raft_config();
    config.snapshot_threshold = 4;
    let mut cluster = TestCluster::with_config(3, config);
    let leader = cluster.wait_for_leader().await;
    let lagging = cluster.followers_of(&leader)[0].id().to_string();
    cluster.crash(&lagging);

    let db = cluster.db(leader.id());
    for i in 0..20 {
        put(&db, &format!("k{:02}", i), &i.to_string()).await.unwrap();
    }
    assert!(leader.status().snapshot_index > 0, "leader never compacted");

    let follower = cluster.start_node(&lagging);
    cluster.wait_applied_everywhere(leader.commit_index()).await;

    assert_eq!(applied_contents(&follower), applied_contents(&leader));
    assert_eq!(applied_contents(&follower)["k19"], "19");
    assert!(follower.status().snapshot_index > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_node_cluster_commits_alone() {
    let cluster = TestCluster::new(1);
    let leader = cluster.wait_for_leader().await;
    let db = cluster.db(leader.id());

    put(&db, "solo", "yes").await.unwrap();
    assert_eq!(get(&db, "solo").await.unwrap().as_deref(), Some("yes"));
    assert!(leader.has_quorum_contact());
}
