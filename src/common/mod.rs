//! Common utilities and types shared across quorumkv

pub mod config;
pub mod error;
pub mod metrics;
pub mod utils;

pub use config::{Config, FallbackConfig, LogSyncPolicy, PeerConfig, RaftConfig};
pub use error::{Error, Result};
pub use metrics::METRICS;
pub use utils::{atomic_write, crc32, retry_with_backoff};
