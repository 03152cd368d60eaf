//! # quorumkv
//!
//! A replicated, linearizable key/value store:
//! - Raft consensus with a durable log, snapshots and check-quorum
//! - Optimistic transactions validated against the replicated log
//! - An order-preserving codec for keys and log payloads
//! - Automatic fallback to a standalone local store while the cluster is unavailable,
//!   with a pluggable merge when it comes back
//!
//! ## Architecture
//!
//! ```text
//!   client ──► FallbackKVDatabase ──┬──► RaftKVDatabase ──► RaftNode ◄──► peers
//!              (gate + merge)       │                        │
//!                                   │                        ├─ LogStore (log + snapshot)
//!                                   │                        └─ MemoryKVStore (applied state)
//!                                   └──► SimpleKVDatabase (standalone journal)
//! ```
//!
//! ## Usage
//!
//! ```bash
//! quorumkv-node serve --config node1.toml
//! curl -X PUT --data-binary 'hello' http://localhost:7000/kv/greeting
//! curl http://localhost:7000/kv/greeting
//! curl http://localhost:7000/status
//! ```

#![allow(clippy::result_large_err)]

pub mod codec;
pub mod common;
pub mod fallback;
pub mod kv;
pub mod raft;
pub mod server;

pub use common::{Config, Error, Result};
pub use fallback::FallbackKVDatabase;
pub use kv::{KVDatabase, KVTransaction};
pub use raft::{RaftKVDatabase, RaftNode};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
