//! Core domain types shared across the resolver: market parameters as read
//! from chain, the persisted job record, metric values, and runtime config.

use chrono::{DateTime, Utc};
use num_bigint::BigInt;
use serde::{Deserialize, Serialize};

/// What a market measures. Mirrors the on-chain subject encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subject {
    /// A named protocol metric (e.g. "BTC_PRICE", "OPEN_INTEREST").
    HlMetric { metric_id: String },
    /// Spot price of a token, quoted at `decimals`.
    TokenPrice { token: String, decimals: u8 },
    /// An opaque source-defined metric.
    Generic { source_id: String },
}

/// Coarse capability classes fetchers declare support for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectKind {
    HlMetric,
    TokenPrice,
    Generic,
}

impl Subject {
    pub fn kind(&self) -> SubjectKind {
        match self {
            Subject::HlMetric { .. } => SubjectKind::HlMetric,
            Subject::TokenPrice { .. } => SubjectKind::TokenPrice,
            Subject::Generic { .. } => SubjectKind::Generic,
        }
    }

    /// Stable identifier used in logs and in the resolution data hash.
    pub fn describe(&self) -> String {
        match self {
            Subject::HlMetric { metric_id } => format!("hl_metric:{metric_id}"),
            Subject::TokenPrice { token, decimals } => format!("token_price:{token}:{decimals}"),
            Subject::Generic { source_id } => format!("generic:{source_id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredicateOp {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
    Neq,
}

impl PredicateOp {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Gt),
            1 => Some(Self::Gte),
            2 => Some(Self::Lt),
            3 => Some(Self::Lte),
            4 => Some(Self::Eq),
            5 => Some(Self::Neq),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gt => "GT",
            Self::Gte => "GTE",
            Self::Lt => "LT",
            Self::Lte => "LTE",
            Self::Eq => "EQ",
            Self::Neq => "NEQ",
        }
    }
}

/// Boolean comparison applied to the metric at resolve time.
/// `threshold` is a fixed-point integer at `value_decimals`.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub op: PredicateOp,
    pub threshold: BigInt,
    pub value_decimals: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    SnapshotAt,
    TimeAverage,
    Extremum,
}

/// Which end of the range an EXTREMUM window selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExtremumKind {
    #[default]
    Max,
    Min,
}

/// Observation window, reduced to one scalar before predicate evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub kind: WindowKind,
    pub extremum: ExtremumKind,
    /// Unix seconds. Unused for SNAPSHOT_AT.
    pub t_start: i64,
    /// Unix seconds.
    pub t_end: i64,
}

/// Per-market oracle routing declared at creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleSpec {
    pub primary_source_id: String,
    pub fallback_source_id: String,
    pub rounding_decimals: u8,
}

/// Market parameters as read from the market contract. Read-only here; the
/// resolver never mutates a market other than through the oracle.
#[derive(Debug, Clone)]
pub struct Market {
    /// 20-byte address, 0x-prefixed lowercase hex.
    pub address: String,
    pub title: String,
    pub subject: Subject,
    pub predicate: Predicate,
    pub window: Window,
    pub oracle: OracleSpec,
    pub cutoff_time: i64,
    pub resolve_time: i64,
    pub resolved: bool,
    pub cancelled: bool,
    pub winning_outcome: Option<u8>,
}

/// YES = 1, NO = 0, matching the on-chain convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    No,
    Yes,
}

impl Outcome {
    pub fn as_u8(&self) -> u8 {
        match self {
            Outcome::No => 0,
            Outcome::Yes => 1,
        }
    }

    pub fn from_bool(yes: bool) -> Self {
        if yes {
            Outcome::Yes
        } else {
            Outcome::No
        }
    }
}

/// One observed metric sample. Immutable; lives only for a resolution attempt.
/// `value` is a fixed-point integer at `decimals`.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricValue {
    pub value: BigInt,
    pub decimals: u8,
    /// Unix seconds of the observation.
    pub observed_at: i64,
    pub source_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Scheduled,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    TimeBased,
    Immediate,
    Retry,
}

/// Persisted record of one scheduled or in-flight resolution attempt.
///
/// Invariants:
/// - at most one non-terminal job exists per market;
/// - terminal states never transition out;
/// - `updated_at` is non-decreasing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub market_id: String,
    pub title: String,
    /// Unix seconds; equals the market's resolve time at creation.
    pub resolve_time: i64,
    pub status: JobStatus,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Job {
    pub fn new(
        market_id: &str,
        title: &str,
        resolve_time: i64,
        job_type: JobType,
        max_retries: u32,
        now: DateTime<Utc>,
        correlation_id: Option<String>,
    ) -> Self {
        Self {
            // Market address + creation timestamp, so a re-created market gets
            // a distinct job row.
            id: format!("{}-{}", market_id, now.timestamp_millis()),
            market_id: market_id.to_string(),
            title: title.to_string(),
            resolve_time,
            status: JobStatus::Scheduled,
            job_type,
            retry_count: 0,
            max_retries,
            last_error: None,
            created_at: now,
            updated_at: now,
            correlation_id,
        }
    }

    /// Terminal jobs never transition again and are eligible for cleanup.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            JobStatus::Completed | JobStatus::Cancelled => true,
            JobStatus::Failed => self.retry_count >= self.max_retries,
            _ => false,
        }
    }
}

/// Runtime configuration, loaded once at startup from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub rpc_url: String,
    pub private_key: String,
    pub factory_address: String,
    pub oracle_address: String,
    pub webhook_port: u16,
    pub webhook_secret: String,
    pub job_concurrency: usize,
    pub retry_max_attempts: u32,
    pub retry_delay_base_ms: u64,
    pub gas_limit_multiplier: f64,
    pub backfill_depth: u64,
    /// Testing escape hatch; production reads the window from the oracle.
    pub dispute_window_override: Option<u64>,
    pub persistence_dir: String,
    pub sample_stride_secs: u64,
    pub chain_poll_interval_secs: u64,
    pub max_sources: usize,
    pub max_concurrent_fetches: usize,
    pub fetch_timeout_secs: u64,
    pub health_check_interval_secs: u64,
    pub hyperliquid_api_url: String,
    pub coinbase_api_url: String,
    pub binance_api_url: String,
    /// Lowercased token address -> ticker symbol, for TOKEN_PRICE subjects.
    pub token_symbols: std::collections::HashMap<String, String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let require = |key: &str| -> anyhow::Result<String> {
            std::env::var(key)
                .map_err(|_| anyhow::anyhow!("missing required configuration: {key}"))
        };

        let parse_or = |key: &str, default: &str| -> String {
            std::env::var(key).unwrap_or_else(|_| default.to_string())
        };

        let rpc_url = require("RPC_URL")?;
        let private_key = require("PRIVATE_KEY")?;
        let factory_address = require("FACTORY_ADDRESS")?;
        let oracle_address = require("ORACLE_ADDRESS")?;
        let webhook_secret = require("WEBHOOK_SECRET")?;

        let webhook_port = parse_or("WEBHOOK_PORT", "8090")
            .parse()
            .map_err(|_| anyhow::anyhow!("WEBHOOK_PORT must be a port number"))?;

        let gas_limit_multiplier: f64 = parse_or("GAS_LIMIT_MULTIPLIER", "1.2")
            .parse()
            .map_err(|_| anyhow::anyhow!("GAS_LIMIT_MULTIPLIER must be a number"))?;
        if gas_limit_multiplier < 1.0 {
            anyhow::bail!("GAS_LIMIT_MULTIPLIER must be >= 1.0");
        }

        let dispute_window_override = std::env::var("DISPUTE_WINDOW_SECONDS_OVERRIDE")
            .ok()
            .and_then(|v| v.parse::<u64>().ok());

        Ok(Self {
            rpc_url,
            private_key,
            factory_address,
            oracle_address,
            webhook_port,
            webhook_secret,
            job_concurrency: parse_or("JOB_CONCURRENCY", "5").parse().unwrap_or(5),
            retry_max_attempts: parse_or("RETRY_MAX_ATTEMPTS", "5").parse().unwrap_or(5),
            retry_delay_base_ms: parse_or("RETRY_DELAY_BASE_MS", "5000").parse().unwrap_or(5000),
            gas_limit_multiplier,
            backfill_depth: parse_or("BACKFILL_DEPTH", "10000").parse().unwrap_or(10_000),
            dispute_window_override,
            persistence_dir: parse_or("PERSISTENCE_DIR", "./data"),
            sample_stride_secs: parse_or("SAMPLE_STRIDE_SECS", "60").parse().unwrap_or(60),
            chain_poll_interval_secs: parse_or("CHAIN_POLL_INTERVAL_SECS", "15")
                .parse()
                .unwrap_or(15),
            max_sources: parse_or("MAX_SOURCES", "3").parse().unwrap_or(3),
            max_concurrent_fetches: parse_or("MAX_CONCURRENT_FETCHES", "5").parse().unwrap_or(5),
            fetch_timeout_secs: parse_or("FETCH_TIMEOUT_SECS", "30").parse().unwrap_or(30),
            health_check_interval_secs: parse_or("HEALTH_CHECK_INTERVAL_SECS", "60")
                .parse()
                .unwrap_or(60),
            hyperliquid_api_url: parse_or("HYPERLIQUID_API_URL", "https://api.hyperliquid.xyz"),
            coinbase_api_url: parse_or("COINBASE_API_URL", "https://api.coinbase.com"),
            binance_api_url: parse_or("BINANCE_API_URL", "https://api.binance.com"),
            // "0xabc…:BTC,0xdef…:ETH"
            token_symbols: parse_or("TOKEN_SYMBOLS", "")
                .split(',')
                .filter_map(|pair| {
                    let (addr, symbol) = pair.split_once(':')?;
                    let addr = addr.trim().to_lowercase();
                    let symbol = symbol.trim().to_uppercase();
                    (!addr.is_empty() && !symbol.is_empty()).then_some((addr, symbol))
                })
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_terminality() {
        let now = Utc::now();
        let mut job = Job::new("0xabc", "t", 0, JobType::Immediate, 3, now, None);
        assert!(!job.is_terminal());

        job.status = JobStatus::Failed;
        job.retry_count = 1;
        assert!(!job.is_terminal(), "failed with retries left is recoverable");

        job.retry_count = 3;
        assert!(job.is_terminal());

        job.status = JobStatus::Completed;
        assert!(job.is_terminal());
    }

    #[test]
    fn job_round_trips_with_unknown_fields_ignored() {
        let raw = r#"{
            "id": "0xabc-1700000000000",
            "marketId": "0xabc",
            "title": "BTC above 50k",
            "resolveTime": 1700000000,
            "status": "SCHEDULED",
            "type": "TIME_BASED",
            "retryCount": 0,
            "maxRetries": 5,
            "createdAt": "2023-11-14T22:13:20Z",
            "updatedAt": "2023-11-14T22:13:20Z",
            "someFutureField": {"nested": true}
        }"#;
        let job: Job = serde_json::from_str(raw).expect("unknown fields must be ignored");
        assert_eq!(job.market_id, "0xabc");
        assert_eq!(job.status, JobStatus::Scheduled);
        assert_eq!(job.job_type, JobType::TimeBased);
    }
}
