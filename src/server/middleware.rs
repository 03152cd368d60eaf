//! Request ids and per-request logging for the key/value API

use std::time::Instant;

use axum::{
    body::Body,
    http::{HeaderValue, Request, Response},
    middleware::Next,
};
use tracing::Instrument;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

pub fn generate_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Reuse the caller's request id (or mint one), log the outcome and echo the id back
pub async fn request_id_middleware(request: Request<Body>, next: Next) -> Response<Body> {
    let start = Instant::now();
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(generate_request_id);
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let span = tracing::info_span!(
        "kv_request",
        request_id = %request_id,
        method = %method,
        path = %path,
    );
    let mut response = next.run(request).instrument(span).await;

    let status = response.status();
    let duration_ms = start.elapsed().as_millis();
    if status.is_server_error() {
        tracing::warn!(request_id = %request_id, status = status.as_u16(), duration_ms, "Request failed");
    } else {
        tracing::debug!(request_id = %request_id, status = status.as_u16(), duration_ms, "Request completed");
    }

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}
