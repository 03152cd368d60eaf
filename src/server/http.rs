//! HTTP routes: Raft RPCs (bincode bodies), a key/value API, status and metrics

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::common::{retry_with_backoff, Error, Result, METRICS};
use crate::fallback::FallbackKVDatabase;
use crate::kv::{KVDatabase, KVTransaction};
use crate::raft::{
    AppendRequest, CommitRequest, RaftNode, SnapshotRequest, VoteRequest, APPEND_PATH,
    COMMIT_PATH, SNAPSHOT_PATH, VOTE_PATH,
};

use super::middleware::request_id_middleware;

/// Attempts per key/value request before the error is returned to the client
const KV_ATTEMPTS: usize = 5;
const KV_RETRY_DELAY: Duration = Duration::from_millis(50);

#[derive(Clone)]
pub struct NodeState {
    pub raft: Arc<RaftNode>,
    pub db: FallbackKVDatabase,
}

pub fn create_router(state: NodeState) -> Router {
    Router::new()
        // Raft RPCs
        .route(VOTE_PATH, post(raft_vote))
        .route(APPEND_PATH, post(raft_append))
        .route(SNAPSHOT_PATH, post(raft_snapshot))
        .route(COMMIT_PATH, post(raft_commit))
        // Key/value API
        .merge(
            Router::new()
                .route("/kv/:key", get(get_key).put(put_key).delete(delete_key))
                .route_layer(middleware::from_fn(request_id_middleware)),
        )
        // Observability
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error_response(err: Error) -> Response {
    if err.is_fatal() {
        tracing::error!("Request hit corrupted data: {}", err);
    }
    let body = match &err {
        Error::NotLeader(leader) => json!({ "error": err.to_string(), "leader": leader }),
        _ => json!({ "error": err.to_string() }),
    };
    (err.to_http_status(), axum::Json(body)).into_response()
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(body)?)
}

fn bincode_response<T: Serialize>(result: Result<T>) -> Response {
    match result.and_then(|value| Ok(bincode::serialize(&value)?)) {
        Ok(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/octet-stream")],
            bytes,
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

async fn raft_vote(State(state): State<NodeState>, body: Bytes) -> Response {
    bincode_response(decode::<VoteRequest>(&body).and_then(|req| state.raft.handle_request_vote(req)))
}

async fn raft_append(State(state): State<NodeState>, body: Bytes) -> Response {
    bincode_response(
        decode::<AppendRequest>(&body).and_then(|req| state.raft.handle_append_entries(req)),
    )
}

async fn raft_snapshot(State(state): State<NodeState>, body: Bytes) -> Response {
    bincode_response(
        decode::<SnapshotRequest>(&body).and_then(|req| state.raft.handle_install_snapshot(req)),
    )
}

async fn raft_commit(State(state): State<NodeState>, body: Bytes) -> Response {
    match decode::<CommitRequest>(&body) {
        Ok(req) => bincode_response(Ok(state.raft.handle_forward_commit(req).await)),
        Err(e) => error_response(e),
    }
}

async fn get_key(State(state): State<NodeState>, Path(key): Path<String>) -> Response {
    let result = retry_with_backoff(
        || {
            let db = state.db.clone();
            let key = key.clone();
            async move {
                let mut tx = db.create_transaction().await?;
                let value = tx.get(key.as_bytes())?;
                tx.commit().await?;
                Ok(value)
            }
        },
        KV_ATTEMPTS,
        KV_RETRY_DELAY,
    )
    .await;

    match result {
        Ok(Some(value)) => (StatusCode::OK, value).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, format!("{} not found", key)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn put_key(
    State(state): State<NodeState>,
    Path(key): Path<String>,
    body: Bytes,
) -> Response {
    let result = retry_with_backoff(
        || {
            let db = state.db.clone();
            let key = key.clone();
            let value = body.clone();
            async move {
                let mut tx = db.create_transaction().await?;
                tx.put(key.as_bytes(), &value)?;
                tx.commit().await
            }
        },
        KV_ATTEMPTS,
        KV_RETRY_DELAY,
    )
    .await;

    match result {
        Ok(()) => (StatusCode::OK, format!("PUT {} ({} bytes)", key, body.len())).into_response(),
        Err(e) => error_response(e),
    }
}

async fn delete_key(State(state): State<NodeState>, Path(key): Path<String>) -> Response {
    let result = retry_with_backoff(
        || {
            let db = state.db.clone();
            let key = key.clone();
            async move {
                let mut tx = db.create_transaction().await?;
                tx.remove(key.as_bytes())?;
                tx.commit().await
            }
        },
        KV_ATTEMPTS,
        KV_RETRY_DELAY,
    )
    .await;

    match result {
        Ok(()) => (StatusCode::OK, format!("DELETE {}", key)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn status(State(state): State<NodeState>) -> impl IntoResponse {
    let fallback = state.db.state();
    axum::Json(json!({
        "raft": state.raft.status(),
        "active_store": fallback.active,
        "last_active_time": fallback.last_active_time,
        "standalone_keys": state.db.standalone().len(),
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": METRICS.uptime_seconds(),
    }))
}

async fn metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        METRICS.to_prometheus(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_not_leader_names_the_leader() {
        let response = error_response(Error::NotLeader(Some("n2".into())));
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = json_body(response).await;
        assert_eq!(body["leader"], "n2");

        let body = json_body(error_response(Error::NotLeader(None))).await;
        assert!(body["leader"].is_null());
    }

    #[tokio::test]
    async fn test_other_errors_carry_only_a_message() {
        let response = error_response(Error::Conflict("busy".into()));
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = json_body(response).await;
        assert!(body.get("leader").is_none());
        assert!(body["error"].as_str().unwrap().contains("busy"));
    }
}
