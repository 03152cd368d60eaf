//! Switches between the replicated store and a standalone local store
//!
//! Transactions hold a shared gate for their lifetime. A transition takes the gate
//! exclusively, merges the outgoing store into the incoming one and only then flips the
//! active store, so no transaction ever straddles a switch.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, OwnedRwLockReadGuard, RwLock};
use tokio::task::JoinHandle;

use crate::common::{atomic_write, Config, Error, FallbackConfig, Result, METRICS};
use crate::kv::{KVDatabase, KVPair, KVTransaction, KeyRange, SimpleKVDatabase};
use crate::raft::RaftKVDatabase;

use super::{MergeStrategy, MergeStrategyRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActiveStore {
    Replicated,
    Standalone,
}

impl fmt::Display for ActiveStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActiveStore::Replicated => write!(f, "replicated"),
            ActiveStore::Standalone => write!(f, "standalone"),
        }
    }
}

/// Persisted across restarts in `fallback.state`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackState {
    pub active: ActiveStore,
    /// Last time the replicated cluster was seen available
    pub last_active_time: Option<DateTime<Utc>>,
}

impl Default for FallbackState {
    fn default() -> Self {
        Self {
            active: ActiveStore::Replicated,
            last_active_time: None,
        }
    }
}

impl FallbackState {
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        atomic_write(path, &serde_json::to_vec_pretty(self)?)
    }
}

/// A completed switch, as reported by [`FallbackKVDatabase::check_availability`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: ActiveStore,
    pub to: ActiveStore,
    pub strategy: String,
}

#[derive(Debug, Default)]
struct Health {
    unavailable_since: Option<Instant>,
    available_since: Option<Instant>,
}

struct Inner {
    raft: RaftKVDatabase,
    standalone: SimpleKVDatabase,
    config: FallbackConfig,
    state_path: PathBuf,
    unavailable_strategy: Arc<dyn MergeStrategy>,
    rejoin_strategy: Arc<dyn MergeStrategy>,
    gate: Arc<RwLock<()>>,
    state: Mutex<FallbackState>,
    health: Mutex<Health>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct FallbackKVDatabase {
    inner: Arc<Inner>,
}

impl FallbackKVDatabase {
    pub fn open(
        raft: RaftKVDatabase,
        standalone: SimpleKVDatabase,
        config: FallbackConfig,
        state_path: impl Into<PathBuf>,
    ) -> Result<Self> {
        let registry = MergeStrategyRegistry::with_builtins();
        let lookup = |name: &str| {
            registry
                .get(name)
                .ok_or_else(|| Error::InvalidConfig(format!("unknown merge strategy '{}'", name)))
        };
        let unavailable_strategy = lookup(&config.unavailable_merge_strategy)?;
        let rejoin_strategy = lookup(&config.rejoin_merge_strategy)?;

        let state_path = state_path.into();
        let state = FallbackState::load(&state_path)?;
        METRICS
            .standalone_mode
            .set((state.active == ActiveStore::Standalone) as u64);
        tracing::info!("Fallback coordinator starting in {} mode", state.active);

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(Inner {
                raft,
                standalone,
                config,
                state_path,
                unavailable_strategy,
                rejoin_strategy,
                gate: Arc::new(RwLock::new(())),
                state: Mutex::new(state),
                health: Mutex::new(Health::default()),
                shutdown_tx,
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn from_config(
        config: &Config,
        raft: RaftKVDatabase,
        standalone: SimpleKVDatabase,
    ) -> Result<Self> {
        Self::open(
            raft,
            standalone,
            config.fallback.clone(),
            config.fallback_state_path(),
        )
    }

    pub fn active(&self) -> ActiveStore {
        self.inner.state.lock().active
    }

    pub fn state(&self) -> FallbackState {
        self.inner.state.lock().clone()
    }

    pub fn raft(&self) -> &RaftKVDatabase {
        &self.inner.raft
    }

    pub fn standalone(&self) -> &SimpleKVDatabase {
        &self.inner.standalone
    }

    /// Start the periodic health check (no-op when fallback is disabled)
    pub fn start(&self) {
        if !self.inner.config.enabled {
            tracing::info!("Fallback disabled; staying in {} mode", self.active());
            return;
        }
        let db = self.clone();
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let interval = db.inner.config.check_interval();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() {
                    break;
                }
                if let Err(e) = db.check_availability().await {
                    tracing::warn!("Fallback transition failed: {}", e);
                }
            }
        });
        self.inner.tasks.lock().push(handle);
    }

    pub fn shutdown(&self) {
        self.inner.shutdown_tx.send_replace(true);
        for handle in self.inner.tasks.lock().drain(..) {
            handle.abort();
        }
    }

    /// Probe the cluster once and switch stores if it has been down (or back up) long enough
    pub async fn check_availability(&self) -> Result<Option<Transition>> {
        let available = self
            .inner
            .raft
            .is_available(self.inner.config.probe_timeout())
            .await;
        let active = {
            let mut state = self.inner.state.lock();
            if available && state.active == ActiveStore::Replicated {
                state.last_active_time = Some(Utc::now());
            }
            state.active
        };

        let now = Instant::now();
        let due = {
            let mut health = self.inner.health.lock();
            match (active, available) {
                (ActiveStore::Replicated, true) => {
                    health.unavailable_since = None;
                    None
                }
                (ActiveStore::Standalone, false) => {
                    health.available_since = None;
                    None
                }
                (ActiveStore::Replicated, false) => {
                    let since = *health.unavailable_since.get_or_insert(now);
                    (now.duration_since(since) >= self.inner.config.min_unavailable())
                        .then_some(ActiveStore::Standalone)
                }
                (ActiveStore::Standalone, true) => {
                    let since = *health.available_since.get_or_insert(now);
                    (now.duration_since(since) >= self.inner.config.min_available())
                        .then_some(ActiveStore::Replicated)
                }
            }
        };

        match due {
            Some(target) => self.switch_to(target).await.map(Some),
            None => Ok(None),
        }
    }

    /// Merge into `target` and make it the active store.
    ///
    /// Waits for in-flight transactions and blocks new ones for the duration. On any
    /// failure the active store is left unchanged.
    pub async fn switch_to(&self, target: ActiveStore) -> Result<Transition> {
        let inner = &self.inner;
        let timeout = inner.config.merge_timeout();

        let _exclusive = tokio::time::timeout(timeout, inner.gate.clone().write_owned())
            .await
            .map_err(|_| {
                Error::Timeout(format!(
                    "in-flight transactions still open after {:?}",
                    timeout
                ))
            })?;

        let (from, last_active_time) = {
            let state = inner.state.lock();
            (state.active, state.last_active_time)
        };
        if from == target {
            return Ok(Transition {
                from,
                to: target,
                strategy: String::new(),
            });
        }

        let (strategy, mut src, mut dst): (_, Box<dyn KVTransaction>, Box<dyn KVTransaction>) =
            match target {
                ActiveStore::Standalone => (
                    inner.unavailable_strategy.clone(),
                    Box::new(inner.raft.create_stale_transaction()),
                    Box::new(inner.standalone.begin()),
                ),
                ActiveStore::Replicated => (
                    inner.rejoin_strategy.clone(),
                    Box::new(inner.standalone.begin()),
                    Box::new(inner.raft.begin()),
                ),
            };

        tracing::info!(
            "Switching from {} to {} using '{}' merge",
            from,
            target,
            strategy.name()
        );
        let merge = strategy.merge_and_commit(src.as_mut(), dst.as_mut(), last_active_time);
        match tokio::time::timeout(timeout, merge).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                METRICS.merges_failed.inc();
                tracing::warn!("Merge into {} failed, staying {}: {}", target, from, e);
                return Err(Error::MergeFailed(e.to_string()));
            }
            Err(_) => {
                METRICS.merges_failed.inc();
                tracing::warn!("Merge into {} timed out after {:?}", target, timeout);
                return Err(Error::MergeFailed(format!("timed out after {:?}", timeout)));
            }
        }

        let next = FallbackState {
            active: target,
            last_active_time,
        };
        next.save(&inner.state_path)?;
        *inner.state.lock() = next;
        *inner.health.lock() = Health::default();

        METRICS.fallback_transitions.inc();
        METRICS
            .standalone_mode
            .set((target == ActiveStore::Standalone) as u64);
        tracing::info!("Now serving from the {} store", target);

        Ok(Transition {
            from,
            to: target,
            strategy: strategy.name().to_string(),
        })
    }
}

#[async_trait]
impl KVDatabase for FallbackKVDatabase {
    async fn create_transaction(&self) -> Result<Box<dyn KVTransaction>> {
        let guard = self.inner.gate.clone().read_owned().await;
        let active = self.active();
        let inner: Box<dyn KVTransaction> = match active {
            ActiveStore::Replicated => Box::new(self.inner.raft.begin()),
            ActiveStore::Standalone => Box::new(self.inner.standalone.begin()),
        };
        Ok(Box::new(FallbackTransaction {
            inner,
            active,
            guard: Some(guard),
        }))
    }
}

/// A transaction on whichever store was active when it began
pub struct FallbackTransaction {
    inner: Box<dyn KVTransaction>,
    active: ActiveStore,
    guard: Option<OwnedRwLockReadGuard<()>>,
}

impl FallbackTransaction {
    pub fn store(&self) -> ActiveStore {
        self.active
    }
}

#[async_trait]
impl KVTransaction for FallbackTransaction {
    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn get_at_least(&mut self, min: &[u8], max: Option<&[u8]>) -> Result<Option<KVPair>> {
        self.inner.get_at_least(min, max)
    }

    fn get_at_most(&mut self, max: &[u8], min: Option<&[u8]>) -> Result<Option<KVPair>> {
        self.inner.get_at_most(max, min)
    }

    fn get_range(&mut self, range: &KeyRange, reverse: bool) -> Result<Vec<KVPair>> {
        self.inner.get_range(range, reverse)
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner.put(key, value)
    }

    fn remove(&mut self, key: &[u8]) -> Result<()> {
        self.inner.remove(key)
    }

    fn remove_range(&mut self, range: &KeyRange) -> Result<()> {
        self.inner.remove_range(range)
    }

    async fn commit(&mut self) -> Result<()> {
        let result = self.inner.commit().await;
        self.guard = None;
        result
    }

    fn rollback(&mut self) {
        self.inner.rollback();
        self.guard = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::{MemoryNetwork, RaftNode};
    use tempfile::tempdir;

    async fn solo_cluster(dir: &Path) -> RaftKVDatabase {
        let mut raft = Config::new("solo", dir).raft;
        raft.election_timeout_min_ms = 30;
        raft.election_timeout_max_ms = 60;
        raft.heartbeat_interval_ms = 10;
        let network = MemoryNetwork::new();
        let node = RaftNode::open("solo", vec![], raft, dir.join("raft"), network.transport("solo"))
            .unwrap();
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
    async fn test_state_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fallback.state");
        assert_eq!(FallbackState::load(&path).unwrap(), FallbackState::default());

        let state = FallbackState {
            active: ActiveStore::Standalone,
            last_active_time: Some(Utc::now()),
        };
        state.save(&path).unwrap();
        assert_eq!(FallbackState::load(&path).unwrap(), state);
    }

    #[tokio::test]
    async fn test_switch_round_trip_moves_data() {
        let dir = tempdir().unwrap();
        let raft = solo_cluster(dir.path()).await;
        let standalone = SimpleKVDatabase::in_memory();
        let db = FallbackKVDatabase::open(
            raft.clone(),
            standalone.clone(),
            FallbackConfig::default(),
            dir.path().join("fallback.state"),
        )
        .unwrap();

        let mut tx = db.create_transaction().await.unwrap();
        tx.put(b"before", b"1").unwrap();
        tx.commit().await.unwrap();

        let t = db.switch_to(ActiveStore::Standalone).await.unwrap();
        assert_eq!(t.strategy, "overwrite");
        assert_eq!(db.active(), ActiveStore::Standalone);
        assert_eq!(standalone.len(), 1);

        let mut tx = db.create_transaction().await.unwrap();
        tx.remove(b"before").unwrap();
        tx.put(b"during", b"2").unwrap();
        tx.commit().await.unwrap();

        db.switch_to(ActiveStore::Replicated).await.unwrap();
        let mut tx = raft.begin();
        assert_eq!(
            tx.get_range(&KeyRange::full(), false).unwrap(),
            vec![KVPair::new(b"during".to_vec(), b"2".to_vec())]
        );

        // the mode survives a restart of the coordinator
        let reopened = FallbackKVDatabase::open(
            raft.clone(),
            standalone,
            FallbackConfig::default(),
            dir.path().join("fallback.state"),
        )
        .unwrap();
        assert_eq!(reopened.active(), ActiveStore::Replicated);
        raft.node().shutdown();
    }

    #[tokio::test]
    async fn test_switch_waits_for_open_transactions() {
        let dir = tempdir().unwrap();
        let raft = solo_cluster(dir.path()).await;
        let config = FallbackConfig {
            merge_timeout_ms: 100,
            ..FallbackConfig::default()
        };
        let db = FallbackKVDatabase::open(
            raft.clone(),
            SimpleKVDatabase::in_memory(),
            config,
            dir.path().join("fallback.state"),
        )
        .unwrap();

        let mut open = db.create_transaction().await.unwrap();
        open.put(b"k", b"v").unwrap();
        let err = db.switch_to(ActiveStore::Standalone).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(db.active(), ActiveStore::Replicated);

        open.commit().await.unwrap();
        db.switch_to(ActiveStore::Standalone).await.unwrap();
        assert_eq!(db.active(), ActiveStore::Standalone);
        raft.node().shutdown();
    }
}
