//! Metric sources.
//!
//! Each external data source implements [`MetricFetcher`]; the registry owns
//! priority ordering, fallback, health tracking and the global concurrency
//! bound. Fetchers are constructed once at startup from config and registered
//! by name.

pub mod binance;
pub mod coinbase;
pub mod hyperliquid;
pub mod registry;

use crate::models::{MetricValue, Subject, SubjectKind};
use async_trait::async_trait;
use num_bigint::BigInt;
use num_traits::Zero;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    /// The source does not know this metric/token.
    #[error("subject not supported")]
    NotSupported,

    /// Upstream is down, rate limited, or refused the request.
    #[error("source unavailable: {0}")]
    Unavailable(String),

    /// The per-request deadline elapsed.
    #[error("request timed out")]
    Timeout,

    /// Upstream answered with something we could not interpret.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Static description of a registered source, for the operator surface.
#[derive(Debug, Clone, Serialize)]
pub struct FetcherInfo {
    pub name: String,
    pub subjects: Vec<String>,
    pub endpoint: String,
}

/// Cumulative per-source health, maintained by the registry on every fetch
/// attempt and by the periodic health loop.
#[derive(Debug, Clone, Serialize)]
pub struct FetcherHealth {
    pub healthy: bool,
    /// Unix seconds of the last health-loop probe.
    pub last_check: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub total_fetches: u64,
    pub error_count: u64,
    pub avg_response_time_ms: f64,
    /// Unix seconds of the last fetch attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_fetch: Option<i64>,
}

impl FetcherHealth {
    pub fn new(now: i64) -> Self {
        Self {
            healthy: true,
            last_check: now,
            last_error: None,
            total_fetches: 0,
            error_count: 0,
            avg_response_time_ms: 0.0,
            last_fetch: None,
        }
    }
}

#[async_trait]
pub trait MetricFetcher: Send + Sync {
    fn name(&self) -> &str;

    fn supported_subjects(&self) -> &[SubjectKind];

    /// Static capability check: does this source know the metric/token.
    fn can_fetch(&self, subject: &Subject) -> bool;

    /// Fetch the metric as observed at `at_time` (unix seconds). Sources that
    /// only serve live data may reject timestamps outside a small skew.
    async fn fetch_metric(&self, subject: &Subject, at_time: i64)
        -> Result<MetricValue, FetchError>;

    /// Cheap liveness probe, used by the periodic health loop.
    async fn is_healthy(&self) -> bool;

    fn info(&self) -> FetcherInfo;
}

pub(crate) fn kind_name(kind: SubjectKind) -> &'static str {
    match kind {
        SubjectKind::HlMetric => "HL_METRIC",
        SubjectKind::TokenPrice => "TOKEN_PRICE",
        SubjectKind::Generic => "GENERIC",
    }
}

/// Parse a decimal string ("51234.05", "-0.2") into a fixed-point integer at
/// `decimals`. Excess fractional digits are an error rather than silently
/// truncated; a price source emitting more precision than the market's scale
/// needs an explicit decision, not a lossy default.
pub(crate) fn parse_decimal_str(raw: &str, decimals: u8) -> Result<BigInt, FetchError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(FetchError::InvalidResponse("empty numeric field".into()));
    }

    let (sign, digits) = match raw.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, raw),
    };

    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, f),
        None => (digits, ""),
    };

    if int_part.is_empty() && frac_part.is_empty() {
        return Err(FetchError::InvalidResponse(format!("unparseable number: {raw}")));
    }
    if !int_part.chars().all(|c| c.is_ascii_digit())
        || !frac_part.chars().all(|c| c.is_ascii_digit())
    {
        return Err(FetchError::InvalidResponse(format!("unparseable number: {raw}")));
    }

    let scale = decimals as usize;
    let frac = if frac_part.len() > scale {
        let (kept, excess) = frac_part.split_at(scale);
        if excess.chars().any(|c| c != '0') {
            return Err(FetchError::InvalidResponse(format!(
                "{raw} has more than {decimals} fractional digits"
            )));
        }
        kept.to_string()
    } else {
        format!("{frac_part:0<scale$}")
    };

    let combined = format!("{int_part}{frac}");
    let magnitude = if combined.is_empty() {
        BigInt::zero()
    } else {
        combined
            .parse::<BigInt>()
            .map_err(|_| FetchError::InvalidResponse(format!("unparseable number: {raw}")))?
    };

    Ok(magnitude * sign)
}
