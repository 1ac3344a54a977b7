//! Request logging middleware.
//!
//! Every request gets a correlation id (taken from `x-correlation-id` when
//! the caller supplies one, minted otherwise) that is echoed on the response
//! and recorded on the request span, so control-plane calls line up with the
//! job logs they trigger.

use crate::clock::CorrelationId;
use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{info, warn, Instrument};

pub const CORRELATION_HEADER: &str = "x-correlation-id";

pub async fn request_logging(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    // Health probes poll constantly; keep them out of the logs.
    if path == "/health" {
        return next.run(request).await;
    }

    let correlation_id = request
        .headers()
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| CorrelationId::from(s.to_string()))
        .unwrap_or_default();

    let span = tracing::info_span!(
        "http_request",
        method = %method,
        path = %path,
        client_ip = %addr.ip(),
        correlation_id = %correlation_id,
    );

    let start = Instant::now();
    let mut response = next.run(request).instrument(span.clone()).await;
    let latency_ms = start.elapsed().as_millis() as u64;
    let status = response.status().as_u16();

    if let Ok(value) = HeaderValue::from_str(correlation_id.as_str()) {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }

    let _guard = span.enter();
    if status >= 500 {
        warn!(status, latency_ms, "request failed");
    } else {
        info!(status, latency_ms, "request completed");
    }

    response
}
