//! In-process cluster harness shared by the integration tests

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use quorumkv::common::RaftConfig;
use quorumkv::kv::KVTransaction;
use quorumkv::raft::{MemoryNetwork, RaftNode, RaftRole};
use quorumkv::{RaftKVDatabase, Result};
use tempfile::TempDir;

/// Timeouts short enough for tests, long enough for a loaded CI box
pub fn fast_raft_config() -> RaftConfig {
    RaftConfig {
        election_timeout_min_ms: 100,
        election_timeout_max_ms: 200,
        heartbeat_interval_ms: 20,
        rpc_timeout_ms: 100,
        commit_timeout_ms: 3_000,
        ..RaftConfig::default()
    }
}

pub struct TestCluster {
    pub network: Arc<MemoryNetwork>,
    pub root: TempDir,
    pub ids: Vec<String>,
    pub config: RaftConfig,
    nodes: HashMap<String, Arc<RaftNode>>,
}

impl TestCluster {
    pub fn new(size: usize) -> Self {
        Self::with_config(size, fast_raft_config())
    }

    pub fn with_config(size: usize, config: RaftConfig) -> Self {
        let ids = (1..=size).map(|i| format!("n{}", i)).collect();
        let mut cluster = Self {
            network: MemoryNetwork::new(),
            root: TempDir::new().unwrap(),
            ids,
            config,
            nodes: HashMap::new(),
        };
        for id in cluster.ids.clone() {
            cluster.start_node(&id);
        }
        cluster
    }

    pub fn dir(&self, id: &str) -> PathBuf {
        self.root.path().join(id)
    }

    /// Open `id` from its directory, attach it to the network and start ticking
    pub fn start_node(&mut self, id: &str) -> Arc<RaftNode> {
        let node = RaftNode::open(
            id,
            self.ids.clone(),
            self.config.clone(),
            self.dir(id),
            self.network.transport(id),
        )
        .unwrap();
        self.network.register(&node);
        node.start();
        self.nodes.insert(id.to_string(), node.clone());
        node
    }

    pub fn node(&self, id: &str) -> Arc<RaftNode> {
        self.nodes[id].clone()
    }

    pub fn running(&self) -> Vec<Arc<RaftNode>> {
        let mut nodes: Vec<_> = self.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.id().cmp(b.id()));
        nodes
    }

    pub fn db(&self, id: &str) -> RaftKVDatabase {
        RaftKVDatabase::new(self.node(id))
    }

    /// Stop `id` abruptly; its directory is kept for a later restart
    pub fn crash(&mut self, id: &str) {
        if let Some(node) = self.nodes.remove(id) {
            self.network.unregister(id);
            node.shutdown();
        }
    }

    pub fn restart(&mut self, id: &str) -> Arc<RaftNode> {
        self.crash(id);
        self.start_node(id)
    }

    /// Leader whose no-op of its current term has been applied, so it can serve
    /// transactions at once. Only nodes in `among` are considered.
    pub async fn wait_for_leader_among(&self, among: &[&str], within: Duration) -> Arc<RaftNode> {
        let deadline = Instant::now() + within;
        loop {
            let ready: Vec<_> = among
                .iter()
                .filter_map(|id| self.nodes.get(*id))
                .filter(|node| {
                    let status = node.status();
                    let (_, applied_term, _) = node.read_state();
                    status.role == RaftRole::Leader && applied_term == status.term
                })
                .cloned()
                .collect();
            if ready.len() == 1 {
                return ready[0].clone();
            }
            assert!(Instant::now() < deadline, "no leader among {:?}", among);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn wait_for_leader(&self) -> Arc<RaftNode> {
        let ids: Vec<&str> = self.nodes.keys().map(String::as_str).collect();
        self.wait_for_leader_among(&ids, Duration::from_secs(5)).await
    }

    pub fn followers_of(&self, leader: &RaftNode) -> Vec<Arc<RaftNode>> {
        self.running()
            .into_iter()
            .filter(|n| n.id() != leader.id())
            .collect()
    }

    /// Record every (term, leader) currently visible and fail on two leaders in one term
    pub fn check_election_safety(&self, seen: &mut BTreeMap<u64, String>) {
        for node in self.nodes.values() {
            let status = node.status();
            if status.role != RaftRole::Leader {
                continue;
            }
            let leader = seen.entry(status.term).or_insert_with(|| status.node_id.clone());
            assert_eq!(
                *leader, status.node_id,
                "two leaders in term {}",
                status.term
            );
        }
    }

    /// Wait until every running node has applied at least `index`
    pub async fn wait_applied_everywhere(&self, index: u64) {
        for node in self.nodes.values() {
            node.wait_applied(index, Duration::from_secs(5))
                .await
                .unwrap_or_else(|e| panic!("{} did not apply {}: {}", node.id(), index, e));
        }
    }

    pub fn shutdown(&mut self) {
        let ids: Vec<String> = self.nodes.keys().cloned().collect();
        for id in ids {
            self.crash(&id);
        }
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Poll `condition` every 10ms until it holds or `within` elapses
pub async fn wait_until(within: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

pub async fn put(db: &RaftKVDatabase, key: &str, value: &str) -> Result<()> {
    let mut tx = db.begin();
    tx.put(key.as_bytes(), value.as_bytes())?;
    tx.commit().await
}

/// Linearizable read through `db`
pub async fn get(db: &RaftKVDatabase, key: &str) -> Result<Option<String>> {
    let mut tx = db.begin();
    let value = tx.get(key.as_bytes())?;
    tx.commit().await?;
    Ok(value.map(|v| String::from_utf8_lossy(&v).into_owned()))
}

/// What `node` has applied, as strings
pub fn applied_contents(node: &RaftNode) -> BTreeMap<String, String> {
    let (map, _, _) = node.read_state();
    map.iter()
        .map(|(k, v)| {
            (
                String::from_utf8_lossy(k).into_owned(),
                String::from_utf8_lossy(v).into_owned(),
            )
        })
        .collect()
}
