//! Key/value transactions over the replicated state machine
//!
//! A transaction reads a snapshot of the locally applied state, tagged with the
//! `(term, index)` it reflects. On commit the leader checks the read set against every
//! log entry after that base, then replicates the write set as a single entry. Followers
//! forward the commit to the leader and wait until they have applied it themselves.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::common::{Error, Result, METRICS};
use crate::kv::{
    KVDatabase, KVPair, KVTransaction, KeyRange, KeyRanges, Mutations, TransactionView,
};

use super::messages::CommitRequest;
use super::RaftNode;

#[derive(Clone)]
pub struct RaftKVDatabase {
    node: Arc<RaftNode>,
}

impl RaftKVDatabase {
    pub fn new(node: Arc<RaftNode>) -> Self {
        Self { node }
    }

    pub fn node(&self) -> &Arc<RaftNode> {
        &self.node
    }

    pub fn begin(&self) -> RaftTransaction {
        let (base, base_term, base_index) = self.node.read_state();
        RaftTransaction {
            node: self.node.clone(),
            view: TransactionView::new(base),
            base_term,
            base_index,
            stale: false,
        }
    }

    /// Read-only transaction over whatever this node has applied, without contacting
    /// the cluster. Its reads may be arbitrarily out of date.
    pub fn create_stale_transaction(&self) -> RaftTransaction {
        let (base, base_term, base_index) = self.node.read_state();
        RaftTransaction {
            node: self.node.clone(),
            view: TransactionView::read_only(base),
            base_term,
            base_index,
            stale: true,
        }
    }

    /// Whether a commit started now could reach a majority
    pub async fn is_available(&self, probe_timeout: Duration) -> bool {
        if !self.node.has_quorum_contact() {
            return false;
        }
        if !self.node.is_leader() {
            return true;
        }
        matches!(
            tokio::time::timeout(probe_timeout, self.node.confirm_leadership()).await,
            Ok(Ok(()))
        )
    }
}

#[async_trait]
impl KVDatabase for RaftKVDatabase {
    async fn create_transaction(&self) -> Result<Box<dyn KVTransaction>> {
        Ok(Box::new(self.begin()))
    }
}

pub struct RaftTransaction {
    node: Arc<RaftNode>,
    view: TransactionView,
    base_term: u64,
    base_index: u64,
    stale: bool,
}

impl RaftTransaction {
    /// `(term, index)` of the state this transaction reads
    pub fn base(&self) -> (u64, u64) {
        (self.base_term, self.base_index)
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    async fn forward(&self, reads: KeyRanges, writes: Mutations) -> Result<()> {
        let leader = self.node.get_leader().ok_or(Error::NotLeader(None))?;
        let read_only = writes.is_empty();
        let request = CommitRequest {
            base_term: self.base_term,
            base_index: self.base_index,
            reads,
            mutations: if read_only {
                Vec::new()
            } else {
                writes.encode()
            },
        };

        tracing::debug!("Forwarding commit to leader {}", leader);
        let outcome = match self.node.transport().forward_commit(&leader, request).await {
            Ok(outcome) => outcome,
            // Nothing was written, so the caller may simply retry
            Err(e) if read_only => {
                tracing::debug!("Forwarding read-only commit to {} failed: {}", leader, e);
                return Err(Error::NotLeader(Some(leader)));
            }
            Err(e) => {
                return Err(Error::CommitIndeterminate(format!(
                    "lost contact with leader {} during commit: {}",
                    leader, e
                )))
            }
        };
        let (_, index) = outcome.into_result()?;
        if !read_only {
            self.node
                .wait_applied(index, self.node.config().commit_timeout())
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl KVTransaction for RaftTransaction {
    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.view.get(key)
    }

    fn get_at_least(&mut self, min: &[u8], max: Option<&[u8]>) -> Result<Option<KVPair>> {
        self.view.get_at_least(min, max)
    }

    fn get_at_most(&mut self, max: &[u8], min: Option<&[u8]>) -> Result<Option<KVPair>> {
        self.view.get_at_most(max, min)
    }

    fn get_range(&mut self, range: &KeyRange, reverse: bool) -> Result<Vec<KVPair>> {
        self.view.get_range(range, reverse)
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.view.put(key, value)
    }

    fn remove(&mut self, key: &[u8]) -> Result<()> {
        self.view.remove(key)
    }

    fn remove_range(&mut self, range: &KeyRange) -> Result<()> {
        self.view.remove_range(range)
    }

    async fn commit(&mut self) -> Result<()> {
        if self.view.is_closed() {
            return Err(Error::TransactionClosed);
        }
        let (reads, writes) = self.view.take();
        if self.stale {
            return Ok(());
        }

        if self.node.is_leader() {
            self.node
                .submit(self.base_term, self.base_index, &reads, writes)
                .await?;
        } else {
            self.forward(reads, writes).await?;
        }
        METRICS.transactions_committed.inc();
        Ok(())
    }

    fn rollback(&mut self) {
        self.view.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Config;
    use crate::raft::MemoryNetwork;
    use tempfile::tempdir;

    async fn single_node(dir: &std::path::Path) -> RaftKVDatabase {
        let mut raft = Config::new("solo", dir).raft;
        raft.election_timeout_min_ms = 30;
        raft.election_timeout_max_ms = 60;
        raft.heartbeat_interval_ms = 10;
        let network = MemoryNetwork::new();
        let node = RaftNode::open("solo", vec![], raft, dir, network.transport("solo")).unwrap();
        network.register(&node);
        node.start();
        for _ in 0..200 {
            if node.is_leader() && node.commit_index() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        RaftKVDatabase::new(node)
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempdir().unwrap();
        let db = single_node(dir.path()).await;

        let mut tx = db.begin();
        tx.put(b"a", b"1").unwrap();
        tx.commit().await.unwrap();

        let mut tx = db.create_transaction().await.unwrap();
        assert_eq!(tx.get(b"a").unwrap(), Some(b"1".to_vec()));
        tx.commit().await.unwrap();
        assert!(matches!(tx.commit().await, Err(Error::TransactionClosed)));
        db.node().shutdown();
    }

    #[tokio::test]
    async fn test_stale_transaction_is_read_only() {
        let dir = tempdir().unwrap();
        let db = single_node(dir.path()).await;

        let mut tx = db.begin();
        tx.put(b"k", b"v").unwrap();
        tx.commit().await.unwrap();

        let mut stale = db.create_stale_transaction();
        assert!(stale.is_stale());
        assert_eq!(stale.get(b"k").unwrap(), Some(b"v".to_vec()));
        assert!(matches!(stale.put(b"k", b"w"), Err(Error::ReadOnly)));
        stale.commit().await.unwrap();
        assert!(db.is_available(Duration::from_millis(100)).await);
        db.node().shutdown();
    }
}
