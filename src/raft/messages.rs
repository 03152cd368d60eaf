//! Raft RPC messages exchanged between nodes

use serde::{Deserialize, Serialize};

use crate::common::Error;
use crate::kv::KeyRanges;

use super::{LogEntry, NodeId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendRequest {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendResponse {
    pub term: u64,
    pub success: bool,
    /// On success, the last index known to match the leader's log
    pub match_index: u64,
    /// On failure, where the leader should retry from
    pub conflict_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub term: u64,
    pub leader_id: NodeId,
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotResponse {
    pub term: u64,
}

/// A follower's transaction, forwarded to the leader for validation and commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRequest {
    /// Term and index of the state the transaction read from
    pub base_term: u64,
    pub base_index: u64,
    pub reads: KeyRanges,
    /// Encoded `Mutations`; empty for a read-only transaction
    pub mutations: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitOutcome {
    /// Committed at `index`; for read-only commits, the index the reads were validated at
    Committed { term: u64, index: u64 },
    Conflict(String),
    NotLeader(Option<NodeId>),
    Indeterminate(String),
    Failed(String),
}

impl CommitOutcome {
    pub fn from_error(err: Error) -> Self {
        match err {
            Error::Conflict(msg) => CommitOutcome::Conflict(msg),
            Error::NotLeader(leader) => CommitOutcome::NotLeader(leader),
            Error::CommitIndeterminate(msg) => CommitOutcome::Indeterminate(msg),
            other => CommitOutcome::Failed(other.to_string()),
        }
    }

    pub fn into_result(self) -> crate::Result<(u64, u64)> {
        match self {
            CommitOutcome::Committed { term, index } => Ok((term, index)),
            CommitOutcome::Conflict(msg) => Err(Error::Conflict(msg)),
            CommitOutcome::NotLeader(leader) => Err(Error::NotLeader(leader)),
            CommitOutcome::Indeterminate(msg) => Err(Error::CommitIndeterminate(msg)),
            CommitOutcome::Failed(msg) => Err(Error::Internal(msg)),
        }
    }
}
