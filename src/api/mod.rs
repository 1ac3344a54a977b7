//! Control-plane HTTP surface.
//!
//! Read endpoints (`/health`, `/jobs`, `/stats`) are open; mutating endpoints
//! (`/webhook/market`, `/resolve/{market}`, `/jobs/{id}/cancel`) sit behind
//! the per-IP rate limiter, and the webhook additionally requires an
//! HMAC-SHA256 signature over the raw body.

pub mod routes;

use crate::fetchers::registry::FetcherRegistry;
use crate::middleware::rate_limit::{rate_limit, RateLimiter};
use crate::middleware::request_logging;
use crate::scheduler::JobScheduler;
use axum::{
    middleware as axum_mw,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<JobScheduler>,
    pub registry: Arc<FetcherRegistry>,
    pub webhook_secret: String,
    pub started_at: Instant,
}

pub fn router(state: AppState, limiter: Arc<RateLimiter>) -> Router {
    let mutating = Router::new()
        .route("/webhook/market", post(routes::post_market_webhook))
        .route("/resolve/:market_id", post(routes::post_resolve_market))
        .route("/jobs/:job_id/cancel", post(routes::post_cancel_job))
        .route_layer(axum_mw::from_fn_with_state(limiter, rate_limit));

    Router::new()
        .route("/health", get(routes::get_health))
        .route("/jobs", get(routes::get_jobs))
        .route("/jobs/:job_id", get(routes::get_job))
        .route("/stats", get(routes::get_stats))
        .merge(mutating)
        .layer(CorsLayer::permissive())
        .layer(axum_mw::from_fn(request_logging))
        .with_state(state)
}
