//! Control-plane handlers.

use crate::api::AppState;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use tracing::{info, warn};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

/// Uniform error mapping: 4xx for caller mistakes, 5xx only for faults.
pub enum ApiError {
    BadRequest(String),
    Unauthorized,
    NotFound(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "invalid signature".to_string()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Internal(e) => {
                warn!(error = %e, "control plane internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e)
    }
}

pub async fn get_health(State(state): State<AppState>) -> Result<Response, ApiError> {
    let stats = state.scheduler.stats()?;
    Ok(Json(json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "queue": stats.queue,
        "jobs": {
            "scheduled": stats.scheduled,
            "executing": stats.executing,
            "completed": stats.completed,
            "failed": stats.failed,
            "cancelled": stats.cancelled,
        },
    }))
    .into_response())
}

pub async fn get_jobs(State(state): State<AppState>) -> Result<Response, ApiError> {
    let mut jobs = state.scheduler.list_jobs()?;
    jobs.sort_by_key(|j| j.resolve_time);
    Ok(Json(json!({ "jobs": jobs, "count": jobs.len() })).into_response())
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    let job = state
        .scheduler
        .get_job(&job_id)?
        .ok_or_else(|| ApiError::NotFound(format!("unknown job {job_id}")))?;
    Ok(Json(job).into_response())
}

pub async fn get_stats(State(state): State<AppState>) -> Result<Response, ApiError> {
    let scheduler = state.scheduler.stats()?;
    let fetchers: Vec<_> = state
        .registry
        .stats()
        .into_iter()
        .map(|(info, health)| json!({ "info": info, "health": health }))
        .collect();
    Ok(Json(json!({ "scheduler": scheduler, "fetchers": fetchers })).into_response())
}

/// Indexer webhook envelope. `entity` is the materialized table name; only
/// market rows are acted on.
#[derive(Debug, Deserialize)]
pub(crate) struct WebhookEnvelope {
    pub op: WebhookOp,
    pub entity: String,
    pub data: WebhookData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum WebhookOp {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WebhookData {
    #[serde(default)]
    pub new: Option<MarketRow>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MarketRow {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub resolve_time: i64,
    pub resolved: bool,
    #[serde(default)]
    pub cancelled: bool,
}

fn verify_signature(secret: &str, body: &[u8], headers: &HeaderMap) -> bool {
    let Some(provided) = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim_start_matches("sha256=").to_string())
    else {
        return false;
    };
    let Ok(provided) = hex::decode(provided) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&provided).is_ok()
}

pub async fn post_market_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    if !verify_signature(&state.webhook_secret, &body, &headers) {
        return Err(ApiError::Unauthorized);
    }

    let envelope: WebhookEnvelope = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("malformed payload: {e}")))?;

    if envelope.entity != "market" {
        return Ok(Json(json!({ "status": "ignored", "entity": envelope.entity })).into_response());
    }
    if envelope.op == WebhookOp::Delete {
        return Ok(Json(json!({ "status": "ignored", "op": "DELETE" })).into_response());
    }

    let row = envelope
        .data
        .new
        .ok_or_else(|| ApiError::BadRequest("missing data.new for INSERT/UPDATE".to_string()))?;

    if row.resolved || row.cancelled {
        return Ok(Json(json!({ "status": "ignored", "reason": "market already terminal" }))
            .into_response());
    }

    let title = row.title.unwrap_or_else(|| row.id.clone());
    let job_id = state
        .scheduler
        .schedule_market_resolution(&row.id, &title, row.resolve_time, None)?;

    info!(market = row.id.as_str(), job_id = job_id.as_str(), "webhook scheduled market");
    Ok(Json(json!({ "status": "ok", "jobId": job_id })).into_response())
}

pub async fn post_resolve_market(
    State(state): State<AppState>,
    Path(market_id): Path<String>,
) -> Result<Response, ApiError> {
    let job_id = state
        .scheduler
        .trigger_market_now(&market_id)?
        .ok_or_else(|| ApiError::NotFound(format!("no active job for market {market_id}")))?;
    Ok(Json(json!({ "status": "triggered", "jobId": job_id })).into_response())
}

pub async fn post_cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    if state.scheduler.get_job(&job_id)?.is_none() {
        return Err(ApiError::NotFound(format!("unknown job {job_id}")));
    }
    let cancelled = state.scheduler.cancel_job(&job_id)?;
    Ok(Json(json!({ "jobId": job_id, "cancelled": cancelled })).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{router, AppState};
    use crate::clock::{Clock, CorrelationId, SystemClock};
    use crate::error::ResolveError;
    use crate::fetchers::registry::{FetcherRegistry, RegistryConfig};
    use crate::middleware::rate_limit::{RateLimiter, RateLimiterConfig};
    use crate::persistence::FileJobStore;
    use crate::resolution::MarketResolver;
    use crate::scheduler::{JobScheduler, SchedulerConfig};
    use async_trait::async_trait;
    use axum::extract::connect_info::ConnectInfo;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Instant;
    use tokio::sync::broadcast;
    use tower::ServiceExt;

    struct NoopResolver;

    #[async_trait]
    impl MarketResolver for NoopResolver {
        async fn resolve_market(
            &self,
            _market_id: &str,
            _correlation_id: &CorrelationId,
        ) -> Result<(), ResolveError> {
            Ok(())
        }
    }

    const SECRET: &str = "test-secret";

    /// Hex HMAC-SHA256 over the raw body, as the indexer would sign it.
    fn sign_payload(secret: &str, body: &[u8]) -> String {
        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    fn test_app() -> (axum::Router, Arc<JobScheduler>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = Arc::new(FileJobStore::new(dir.path(), clock.clone()).unwrap());
        let (shutdown, _) = broadcast::channel(4);
        let scheduler = JobScheduler::new(
            store,
            Arc::new(NoopResolver),
            clock.clone(),
            SchedulerConfig::default(),
            shutdown,
        );
        let registry = Arc::new(FetcherRegistry::new(RegistryConfig::default(), clock));
        let state = AppState {
            scheduler: scheduler.clone(),
            registry,
            webhook_secret: SECRET.to_string(),
            started_at: Instant::now(),
        };
        let limiter = RateLimiter::new(RateLimiterConfig::default());
        (router(state, limiter), scheduler, dir)
    }

    fn request(method: &str, path: &str, body: Vec<u8>, signature: Option<String>) -> Request<axum::body::Body> {
        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header("content-type", "application/json")
            .extension(ConnectInfo(addr));
        if let Some(sig) = signature {
            builder = builder.header(SIGNATURE_HEADER, sig);
        }
        builder.body(axum::body::Body::from(body)).unwrap()
    }

    fn webhook_body(market: &str, resolve_in_secs: i64) -> Vec<u8> {
        let resolve_time = SystemClock.unix() + resolve_in_secs;
        serde_json::to_vec(&serde_json::json!({
            "op": "INSERT",
            "entity": "market",
            "data": { "new": {
                "id": market,
                "title": "Webhook market",
                "resolveTime": resolve_time,
                "resolved": false,
            }}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn health_reports_queue_and_job_counts() {
        let (app, _, _dir) = test_app();
        let response = app
            .oneshot(request("GET", "/health", Vec::new(), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["status"], "ok");
        assert!(parsed["queue"]["concurrency"].as_u64().unwrap() >= 1);
    }

    #[tokio::test]
    async fn webhook_rejects_missing_or_bad_signature() {
        let (app, scheduler, _dir) = test_app();
        let body = webhook_body("0xw1", 3600);

        let response = app
            .clone()
            .oneshot(request("POST", "/webhook/market", body.clone(), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(request(
                "POST",
                "/webhook/market",
                body,
                Some("deadbeef".to_string()),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(scheduler.list_jobs().unwrap().is_empty());
    }

    #[tokio::test]
    async fn webhook_schedules_market_and_deduplicates_replays() {
        let (app, scheduler, _dir) = test_app();
        let body = webhook_body("0xw2", 3600);
        let signature = sign_payload(SECRET, &body);

        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(request(
                    "POST",
                    "/webhook/market",
                    body.clone(),
                    Some(signature.clone()),
                ))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        // Replay-safe: still exactly one job for the market.
        let jobs = scheduler.list_jobs().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].market_id, "0xw2");
    }

    #[tokio::test]
    async fn webhook_rejects_malformed_payload() {
        let (app, _, _dir) = test_app();
        let body = b"{not json".to_vec();
        let signature = sign_payload(SECRET, &body);
        let response = app
            .oneshot(request("POST", "/webhook/market", body, Some(signature)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn webhook_ignores_resolved_markets() {
        let (app, scheduler, _dir) = test_app();
        let body = serde_json::to_vec(&serde_json::json!({
            "op": "UPDATE",
            "entity": "market",
            "data": { "new": {
                "id": "0xw3",
                "resolveTime": SystemClock.unix() + 60,
                "resolved": true,
            }}
        }))
        .unwrap();
        let signature = sign_payload(SECRET, &body);
        let response = app
            .oneshot(request("POST", "/webhook/market", body, Some(signature)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(scheduler.list_jobs().unwrap().is_empty());
    }

    #[tokio::test]
    async fn resolve_and_cancel_return_404_for_unknown_ids() {
        let (app, _, _dir) = test_app();
        let response = app
            .clone()
            .oneshot(request("POST", "/resolve/0xmissing", Vec::new(), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(request("POST", "/jobs/nope/cancel", Vec::new(), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn jobs_listing_exposes_scheduled_work() {
        let (app, scheduler, _dir) = test_app();
        let job_id = scheduler
            .schedule_market_resolution("0xw4", "listed", SystemClock.unix() + 3600, None)
            .unwrap();

        let response = app
            .clone()
            .oneshot(request("GET", "/jobs", Vec::new(), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["count"], 1);

        let response = app
            .oneshot(request("GET", &format!("/jobs/{job_id}"), Vec::new(), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn cancel_endpoint_cancels_scheduled_job() {
        let (app, scheduler, _dir) = test_app();
        let job_id = scheduler
            .schedule_market_resolution("0xw5", "to cancel", SystemClock.unix() + 3600, None)
            .unwrap();

        let response = app
            .oneshot(request(
                "POST",
                &format!("/jobs/{job_id}/cancel"),
                Vec::new(),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["cancelled"], true);
    }
}
