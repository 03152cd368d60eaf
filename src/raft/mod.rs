//! Raft consensus: durable log, elections, replication and the replicated KV database

mod database;
mod hard_state;
mod log;
mod messages;
mod node;
mod transport;

pub use database::{RaftKVDatabase, RaftTransaction};
pub use hard_state::{HardState, HardStateStore};
pub use log::{LogEntry, LogStore, Snapshot};
pub use messages::{
    AppendRequest, AppendResponse, CommitOutcome, CommitRequest, SnapshotRequest,
    SnapshotResponse, VoteRequest, VoteResponse,
};
pub use node::{start_raft_tasks, NodeStatus, RaftNode, RaftRole};
pub use transport::{
    HttpTransport, MemoryNetwork, MemoryTransport, RaftTransport, APPEND_PATH, COMMIT_PATH,
    SNAPSHOT_PATH, VOTE_PATH,
};

/// Cluster member identifier, as written in the configuration
pub type NodeId = String;
