//! Configuration for quorumkv nodes

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node ID (unique identifier within the cluster)
    #[serde(default)]
    pub node_id: String,

    /// Bind address for HTTP (Raft RPC and public API)
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// Directory holding the Raft log, snapshots and the standalone store
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Other cluster members
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    #[serde(default)]
    pub raft: RaftConfig,

    #[serde(default)]
    pub fallback: FallbackConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7000))
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./quorumkv-data")
}

fn default_log_level() -> String {
    "info".to_string()
}

/// A remote cluster member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: String,
    /// Base URL, e.g. `http://10.0.0.2:7000`
    pub addr: String,
}

/// Log durability policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogSyncPolicy {
    /// fsync after every append
    #[default]
    Always,
    /// flush to the OS on every append, no fsync
    Interval,
    /// leave buffering to the writer
    Never,
}

/// Consensus engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    #[serde(default = "default_election_timeout_min")]
    pub election_timeout_min_ms: u64,

    #[serde(default = "default_election_timeout_max")]
    pub election_timeout_max_ms: u64,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Per-RPC deadline
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_ms: u64,

    /// How long a commit waits for majority confirmation
    #[serde(default = "default_commit_timeout")]
    pub commit_timeout_ms: u64,

    #[serde(default = "default_max_entries_per_append")]
    pub max_entries_per_append: usize,

    /// Applied entries beyond the last snapshot before compacting
    #[serde(default = "default_snapshot_threshold")]
    pub snapshot_threshold: u64,

    #[serde(default)]
    pub sync_policy: LogSyncPolicy,
}

fn default_election_timeout_min() -> u64 {
    150
}
fn default_election_timeout_max() -> u64 {
    300
}
fn default_heartbeat_interval() -> u64 {
    50
}
fn default_rpc_timeout() -> u64 {
    200
}
fn default_commit_timeout() -> u64 {
    5_000
}
fn default_max_entries_per_append() -> usize {
    64
}
fn default_snapshot_threshold() -> u64 {
    1_024
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min_ms: default_election_timeout_min(),
            election_timeout_max_ms: default_election_timeout_max(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            rpc_timeout_ms: default_rpc_timeout(),
            commit_timeout_ms: default_commit_timeout(),
            max_entries_per_append: default_max_entries_per_append(),
            snapshot_threshold: default_snapshot_threshold(),
            sync_policy: LogSyncPolicy::default(),
        }
    }
}

impl RaftConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }

    pub fn election_timeout_max(&self) -> Duration {
        Duration::from_millis(self.election_timeout_max_ms)
    }

    /// Draw a randomized election timeout
    pub fn random_election_timeout(&self) -> Duration {
        use rand::Rng;
        let ms = rand::thread_rng()
            .gen_range(self.election_timeout_min_ms..=self.election_timeout_max_ms);
        Duration::from_millis(ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_min_ms == 0
            || self.election_timeout_min_ms > self.election_timeout_max_ms
        {
            return Err(Error::InvalidConfig(format!(
                "election timeout range {}..{} ms is empty",
                self.election_timeout_min_ms, self.election_timeout_max_ms
            )));
        }
        if self.heartbeat_interval_ms == 0
            || self.heartbeat_interval_ms >= self.election_timeout_min_ms
        {
            return Err(Error::InvalidConfig(
                "heartbeat interval must be shorter than the election timeout".into(),
            ));
        }
        if self.max_entries_per_append == 0 {
            return Err(Error::InvalidConfig(
                "max_entries_per_append must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Fallback coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How often the replicated store is probed
    #[serde(default = "default_check_interval")]
    pub check_interval_ms: u64,

    /// Deadline for a single probe
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Continuous unavailability required before switching to standalone
    #[serde(default = "default_min_unavailable")]
    pub min_unavailable_ms: u64,

    /// Continuous availability required before merging back
    #[serde(default = "default_min_available")]
    pub min_available_ms: u64,

    #[serde(default = "default_merge_timeout")]
    pub merge_timeout_ms: u64,

    /// Strategy run when switching to standalone
    #[serde(default = "default_merge_strategy")]
    pub unavailable_merge_strategy: String,

    /// Strategy run when rejoining the cluster
    #[serde(default = "default_merge_strategy")]
    pub rejoin_merge_strategy: String,
}

fn default_true() -> bool {
    true
}
fn default_check_interval() -> u64 {
    1_000
}
fn default_probe_timeout() -> u64 {
    1_000
}
fn default_min_unavailable() -> u64 {
    3_000
}
fn default_min_available() -> u64 {
    5_000
}
fn default_merge_timeout() -> u64 {
    30_000
}
fn default_merge_strategy() -> String {
    "overwrite".to_string()
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            check_interval_ms: default_check_interval(),
            probe_timeout_ms: default_probe_timeout(),
            min_unavailable_ms: default_min_unavailable(),
            min_available_ms: default_min_available(),
            merge_timeout_ms: default_merge_timeout(),
            unavailable_merge_strategy: default_merge_strategy(),
            rejoin_merge_strategy: default_merge_strategy(),
        }
    }
}

impl FallbackConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn min_unavailable(&self) -> Duration {
        Duration::from_millis(self.min_unavailable_ms)
    }

    pub fn min_available(&self) -> Duration {
        Duration::from_millis(self.min_available_ms)
    }

    pub fn merge_timeout(&self) -> Duration {
        Duration::from_millis(self.merge_timeout_ms)
    }
}

impl Config {
    /// Minimal single-node configuration
    pub fn new(node_id: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            node_id: node_id.into(),
            bind_addr: default_bind_addr(),
            data_dir: data_dir.into(),
            peers: Vec::new(),
            raft: RaftConfig::default(),
            fallback: FallbackConfig::default(),
            log_level: default_log_level(),
        }
    }

    /// Load configuration: optional TOML file, then `QUORUMKV__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = Self::load_unvalidated(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`Config::load`], for callers that apply further overrides before validating
    pub fn load_unvalidated(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                ::config::Environment::with_prefix("QUORUMKV")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(Error::InvalidConfig("node_id cannot be empty".into()));
        }
        self.raft.validate()?;

        let mut seen = HashSet::new();
        for peer in &self.peers {
            if peer.id == self.node_id {
                return Err(Error::InvalidConfig(format!(
                    "peer list contains this node ({})",
                    peer.id
                )));
            }
            if !seen.insert(peer.id.as_str()) {
                return Err(Error::InvalidConfig(format!("duplicate peer {}", peer.id)));
            }
        }

        let registry = crate::fallback::MergeStrategyRegistry::with_builtins();
        for name in [
            &self.fallback.unavailable_merge_strategy,
            &self.fallback.rejoin_merge_strategy,
        ] {
            if registry.get(name).is_none() {
                return Err(Error::InvalidConfig(format!(
                    "unknown merge strategy '{}'",
                    name
                )));
            }
        }
        Ok(())
    }

    /// IDs of the other cluster members
    pub fn peer_ids(&self) -> Vec<String> {
        self.peers.iter().map(|p| p.id.clone()).collect()
    }

    pub fn raft_dir(&self) -> PathBuf {
        self.data_dir.join("raft")
    }

    pub fn standalone_dir(&self) -> PathBuf {
        self.data_dir.join("standalone")
    }

    pub fn fallback_state_path(&self) -> PathBuf {
        self.data_dir.join("fallback.state")
    }
}
