//! Error types for quorumkv

use crate::codec::CodecError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Storage Errors ===
    #[error("Corrupted data: {0}")]
    Corrupted(String),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Log error: {0}")]
    Log(String),

    // === Raft Errors ===
    #[error("Not leader: current leader is {}", .0.as_deref().unwrap_or("unknown"))]
    NotLeader(Option<String>),

    #[error("Commit outcome unknown: {0}")]
    CommitIndeterminate(String),

    // === Transaction Errors ===
    #[error("Transaction conflict: {0}")]
    Conflict(String),

    #[error("Transaction is no longer usable")]
    TransactionClosed,

    #[error("Transaction is read-only")]
    ReadOnly,

    // === Availability Errors ===
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Merge failed: {0}")]
    MergeFailed(String),

    // === Network Errors ===
    #[error("Transport error: {0}")]
    Transport(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),

    // === Generic ===
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Is this a retryable error?
    ///
    /// Retryable errors mean the whole transaction should be attempted again.
    /// `CommitIndeterminate` is deliberately excluded: the write may still land.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Conflict(_)
                | Error::NotLeader(_)
                | Error::Timeout(_)
                | Error::Unavailable(_)
                | Error::Transport(_)
        )
    }

    /// Does this error signal corrupted stored data?
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Codec(_) | Error::Corrupted(_))
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::InvalidConfig(_) | Error::ReadOnly => StatusCode::BAD_REQUEST,
            Error::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            Error::CommitIndeterminate(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::NotLeader(_) | Error::Unavailable(_) | Error::Transport(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else {
            Error::Transport(e.to_string())
        }
    }
}
