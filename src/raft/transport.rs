//! How Raft messages travel between nodes
//!
//! - [`HttpTransport`]: bincode bodies over HTTP, served by the node's axum router
//! - [`MemoryNetwork`]: in-process delivery with partition controls, for tests

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::common::{Error, PeerConfig, Result};

use super::messages::{
    AppendRequest, AppendResponse, CommitOutcome, CommitRequest, SnapshotRequest,
    SnapshotResponse, VoteRequest, VoteResponse,
};
use super::{NodeId, RaftNode};

pub const VOTE_PATH: &str = "/raft/vote";
pub const APPEND_PATH: &str = "/raft/append";
pub const SNAPSHOT_PATH: &str = "/raft/snapshot";
pub const COMMIT_PATH: &str = "/raft/commit";

#[async_trait]
pub trait RaftTransport: Send + Sync {
    async fn request_vote(&self, target: &str, req: VoteRequest) -> Result<VoteResponse>;

    async fn append_entries(&self, target: &str, req: AppendRequest) -> Result<AppendResponse>;

    async fn install_snapshot(
        &self,
        target: &str,
        req: SnapshotRequest,
    ) -> Result<SnapshotResponse>;

    async fn forward_commit(&self, target: &str, req: CommitRequest) -> Result<CommitOutcome>;
}

/// HTTP client side of the Raft RPCs
pub struct HttpTransport {
    client: reqwest::Client,
    peers: HashMap<NodeId, String>,
    rpc_timeout: Duration,
    commit_timeout: Duration,
}

impl HttpTransport {
    pub fn new(peers: &[PeerConfig], rpc_timeout: Duration, commit_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(30))
            .build()?;
        let peers = peers
            .iter()
            .map(|p| {
                let base = if p.addr.starts_with("http://") || p.addr.starts_with("https://") {
                    p.addr.trim_end_matches('/').to_string()
                } else {
                    format!("http://{}", p.addr)
                };
                (p.id.clone(), base)
            })
            .collect();
        Ok(Self {
            client,
            peers,
            rpc_timeout,
            commit_timeout,
        })
    }

    async fn post<Req, Resp>(&self, target: &str, path: &str, req: &Req, timeout: Duration) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let base = self
            .peers
            .get(target)
            .ok_or_else(|| Error::Transport(format!("unknown peer {}", target)))?;
        let url = format!("{}{}", base, path);
        let body = bincode::serialize(req)?;

        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .timeout(timeout)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Transport(format!("{} returned {}", url, status)));
        }
        let bytes = response.bytes().await?;
        Ok(bincode::deserialize(&bytes)?)
    }
}

#[async_trait]
impl RaftTransport for HttpTransport {
    async fn request_vote(&self, target: &str, req: VoteRequest) -> Result<VoteResponse> {
        self.post(target, VOTE_PATH, &req, self.rpc_timeout).await
    }

    async fn append_entries(&self, target: &str, req: AppendRequest) -> Result<AppendResponse> {
        self.post(target, APPEND_PATH, &req, self.rpc_timeout).await
    }

    async fn install_snapshot(
        &self,
        target: &str,
        req: SnapshotRequest,
    ) -> Result<SnapshotResponse> {
        // Snapshots can be large; give them the commit budget
        self.post(target, SNAPSHOT_PATH, &req, self.commit_timeout).await
    }

    async fn forward_commit(&self, target: &str, req: CommitRequest) -> Result<CommitOutcome> {
        self.post(target, COMMIT_PATH, &req, self.commit_timeout).await
    }
}

/// In-process network connecting `RaftNode`s directly, with link failure injection
#[derive(Default)]
pub struct MemoryNetwork {
    nodes: RwLock<HashMap<NodeId, Weak<RaftNode>>>,
    isolated: RwLock<HashSet<NodeId>>,
    /// Directed links that drop every message
    cut: RwLock<HashSet<(NodeId, NodeId)>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transport for messages sent by `from`
    pub fn transport(self: &Arc<Self>, from: impl Into<NodeId>) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            network: self.clone(),
            from: from.into(),
        })
    }

    pub fn register(&self, node: &Arc<RaftNode>) {
        self.nodes
            .write()
            .insert(node.id().to_string(), Arc::downgrade(node));
    }

    pub fn unregister(&self, id: &str) {
        self.nodes.write().remove(id);
    }

    /// Drop all traffic to and from `id`
    pub fn isolate(&self, id: &str) {
        self.isolated.write().insert(id.to_string());
    }

    pub fn heal(&self, id: &str) {
        self.isolated.write().remove(id);
    }

    /// Drop traffic between `a` and `b` in both directions
    pub fn cut_link(&self, a: &str, b: &str) {
        let mut cut = self.cut.write();
        cut.insert((a.to_string(), b.to_string()));
        cut.insert((b.to_string(), a.to_string()));
    }

    pub fn heal_all(&self) {
        self.isolated.write().clear();
        self.cut.write().clear();
    }

    fn reachable(&self, from: &str, to: &str) -> bool {
        let isolated = self.isolated.read();
        if isolated.contains(from) || isolated.contains(to) {
            return false;
        }
        !self.cut.read().contains(&(from.to_string(), to.to_string()))
    }

    fn deliver(&self, from: &str, to: &str) -> Result<Arc<RaftNode>> {
        if !self.reachable(from, to) {
            return Err(Error::Transport(format!("{} cannot reach {}", from, to)));
        }
        self.nodes
            .read()
            .get(to)
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::Transport(format!("{} is not running", to)))
    }

    fn check_reply(&self, from: &str, to: &str) -> Result<()> {
        if self.reachable(to, from) {
            Ok(())
        } else {
            Err(Error::Transport(format!("reply from {} to {} lost", to, from)))
        }
    }
}

pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    from: NodeId,
}

#[async_trait]
impl RaftTransport for MemoryTransport {
    async fn request_vote(&self, target: &str, req: VoteRequest) -> Result<VoteResponse> {
        let node = self.network.deliver(&self.from, target)?;
        tokio::task::yield_now().await;
        let resp = node.handle_request_vote(req)?;
        self.network.check_reply(&self.from, target)?;
        Ok(resp)
    }

    async fn append_entries(&self, target: &str, req: AppendRequest) -> Result<AppendResponse> {
        let node = self.network.deliver(&self.from, target)?;
        tokio::task::yield_now().await;
        let resp = node.handle_append_entries(req)?;
        self.network.check_reply(&self.from, target)?;
        Ok(resp)
    }

    async fn install_snapshot(
        &self,
        target: &str,
        req: SnapshotRequest,
    ) -> Result<SnapshotResponse> {
        let node = self.network.deliver(&self.from, target)?;
        tokio::task::yield_now().await;
        let resp = node.handle_install_snapshot(req)?;
        self.network.check_reply(&self.from, target)?;
        Ok(resp)
    }

    async fn forward_commit(&self, target: &str, req: CommitRequest) -> Result<CommitOutcome> {
        let node = self.network.deliver(&self.from, target)?;
        let outcome = node.handle_forward_commit(req).await;
        self.network.check_reply(&self.from, target)?;
        Ok(outcome)
    }
}
