//! Standalone (non-replicated) database with optimistic transactions
//!
//! Commits are serialized under one lock. Each commit bumps a version and remembers which
//! key ranges it wrote; a transaction that began at version `v` conflicts if any commit
//! after `v` wrote something it read. Durable instances journal every commit to a
//! [`LogStore`] and fold the journal into a snapshot once it grows past a threshold.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::common::{Error, LogSyncPolicy, Result, METRICS};
use crate::raft::{LogEntry, LogStore};

use super::{
    decode_snapshot, encode_snapshot, KVDatabase, KVPair, KVTransaction, KeyRange, KeyRanges,
    MemoryKVStore, Mutations, TransactionView,
};

/// Journal entries carry a fixed term; only the index (version) matters
const JOURNAL_TERM: u64 = 1;

/// How many recent commits are remembered for conflict checks
const HISTORY_LIMIT: usize = 4096;

const DEFAULT_COMPACTION_THRESHOLD: usize = 1024;

#[derive(Debug)]
struct CommitState {
    version: u64,
    journal: Option<LogStore>,
    /// `(version, ranges written)` for the most recent commits
    history: VecDeque<(u64, KeyRanges)>,
    /// Oldest version for which a conflict check is still possible
    history_floor: u64,
}

#[derive(Debug)]
struct Inner {
    store: MemoryKVStore,
    state: Mutex<CommitState>,
    compaction_threshold: usize,
}

#[derive(Debug, Clone)]
pub struct SimpleKVDatabase {
    inner: Arc<Inner>,
}

impl SimpleKVDatabase {
    /// Volatile database, lost on drop
    pub fn in_memory() -> Self {
        Self::build(MemoryKVStore::new(), 0, None, DEFAULT_COMPACTION_THRESHOLD)
    }

    /// Open (or create) a durable database journaled under `dir`
    pub fn open(
        dir: impl AsRef<Path>,
        sync_policy: LogSyncPolicy,
        compaction_threshold: usize,
    ) -> Result<Self> {
        let journal = LogStore::open(dir.as_ref(), sync_policy)?;

        let mut map = match journal.load_snapshot()? {
            Some(snapshot) => decode_snapshot(&snapshot.data)?,
            None => Default::default(),
        };
        let mut version = journal.snapshot_index();
        for entry in journal.entries_from(journal.first_index(), usize::MAX) {
            if !entry.is_noop() {
                Mutations::decode(&entry.command)?.apply_to(&mut map);
            }
            version = entry.index;
        }

        tracing::info!(
            "Opened standalone store at {} (version {}, {} keys)",
            dir.as_ref().display(),
            version,
            map.len()
        );

        Ok(Self::build(
            MemoryKVStore::from_map(map),
            version,
            Some(journal),
            compaction_threshold.max(1),
        ))
    }

    fn build(
        store: MemoryKVStore,
        version: u64,
        journal: Option<LogStore>,
        compaction_threshold: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                state: Mutex::new(CommitState {
                    version,
                    journal,
                    history: VecDeque::new(),
                    history_floor: version,
                }),
                compaction_threshold,
            }),
        }
    }

    /// Start a transaction against the current committed state
    pub fn begin(&self) -> SimpleTransaction {
        // Version and snapshot must be taken together
        let state = self.inner.state.lock();
        let base = self.inner.store.snapshot();
        let version = state.version;
        drop(state);
        SimpleTransaction {
            inner: self.inner.clone(),
            view: TransactionView::new(base),
            base_version: version,
        }
    }

    /// Latest committed version
    pub fn version(&self) -> u64 {
        self.inner.state.lock().version
    }

    pub fn len(&self) -> usize {
        self.inner.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.store.is_empty()
    }

    /// Every committed pair, in key order
    pub fn dump(&self) -> Vec<KVPair> {
        use super::KVStore;
        self.inner.store.snapshot().get_range(&KeyRange::full(), false)
    }
}

impl Inner {
    fn commit(&self, base_version: u64, reads: &KeyRanges, writes: Mutations) -> Result<()> {
        let mut state = self.state.lock();

        if base_version < state.history_floor && !reads.is_empty() {
            return Err(Error::Conflict(format!(
                "transaction base version {} is too old to validate",
                base_version
            )));
        }
        for (version, written) in &state.history {
            if *version > base_version && written.intersects_any(reads) {
                METRICS.transaction_conflicts.inc();
                return Err(Error::Conflict(format!(
                    "read set overlaps commit at version {}",
                    version
                )));
            }
        }
        if writes.is_empty() {
            return Ok(());
        }

        let version = state.version + 1;
        if let Some(journal) = state.journal.as_mut() {
            journal.append(&[LogEntry::new(JOURNAL_TERM, version, writes.encode())])?;
        }
        self.store.apply(&writes);
        state.version = version;
        state.history.push_back((version, writes.write_ranges()));
        while state.history.len() > HISTORY_LIMIT {
            if let Some((dropped, _)) = state.history.pop_front() {
                state.history_floor = dropped;
            }
        }

        let threshold = self.compaction_threshold;
        if let Some(journal) = state.journal.as_mut() {
            if journal.len() >= threshold {
                // The commit is already durable in the journal, so a failed compaction only
                // leaves a longer journal behind
                let data = encode_snapshot(&self.store.snapshot());
                if let Err(e) = journal.install_snapshot(version, JOURNAL_TERM, &data) {
                    tracing::warn!("Failed to compact standalone journal at {}: {}", version, e);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl KVDatabase for SimpleKVDatabase {
    async fn create_transaction(&self) -> Result<Box<dyn KVTransaction>> {
        Ok(Box::new(self.begin()))
    }
}

pub struct SimpleTransaction {
    inner: Arc<Inner>,
    view: TransactionView,
    base_version: u64,
}

impl SimpleTransaction {
    pub fn base_version(&self) -> u64 {
        self.base_version
    }
}

#[async_trait]
impl KVTransaction for SimpleTransaction {
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
        self.inner.commit(self.base_version, &reads, writes)?;
        METRICS.transactions_committed.inc();
        Ok(())
    }

    fn rollback(&mut self) {
        self.view.close();
    }
}
