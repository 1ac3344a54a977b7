//! Binance klines fetcher. Serves both live and historical reads from the
//! 1-minute kline endpoint, which makes it the workhorse for time-averaged
//! windows over token prices.

use crate::fetchers::{kind_name, parse_decimal_str, FetchError, FetcherInfo, MetricFetcher};
use crate::models::{MetricValue, Subject, SubjectKind};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

pub const NAME: &str = "BINANCE";

const PRICE_DECIMALS: u8 = 8;

const SUPPORTED: &[SubjectKind] = &[SubjectKind::HlMetric, SubjectKind::TokenPrice];

pub struct BinanceFetcher {
    client: Client,
    api_base: String,
    token_symbols: HashMap<String, String>,
}

impl BinanceFetcher {
    pub fn new(api_base: String, token_symbols: HashMap<String, String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("oddsbot/0.1 (resolution runner)")
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            api_base,
            token_symbols,
        }
    }

    /// Binance pairs quote against USDT.
    fn pair_for(&self, subject: &Subject) -> Option<String> {
        let base = match subject {
            Subject::HlMetric { metric_id } => {
                metric_id.strip_suffix("_PRICE").map(str::to_string)
            }
            Subject::TokenPrice { token, .. } => {
                self.token_symbols.get(&token.to_lowercase()).cloned()
            }
            Subject::Generic { .. } => None,
        }?;
        Some(format!("{base}USDT"))
    }

    fn scale_for(subject: &Subject) -> u8 {
        match subject {
            Subject::TokenPrice { decimals, .. } => *decimals,
            _ => PRICE_DECIMALS,
        }
    }
}

#[async_trait]
impl MetricFetcher for BinanceFetcher {
    fn name(&self) -> &str {
        NAME
    }

    fn supported_subjects(&self) -> &[SubjectKind] {
        SUPPORTED
    }

    fn can_fetch(&self, subject: &Subject) -> bool {
        self.pair_for(subject).is_some()
    }

    async fn fetch_metric(
        &self,
        subject: &Subject,
        at_time: i64,
    ) -> Result<MetricValue, FetchError> {
        let pair = self.pair_for(subject).ok_or(FetchError::NotSupported)?;

        // The kline whose window contains `at_time`; its close is the price
        // observed at the requested second.
        let end_ms = at_time * 1000;
        let start_ms = (at_time - 120) * 1000;
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval=1m&startTime={}&endTime={}&limit=3",
            self.api_base, pair, start_ms, end_ms
        );

        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Unavailable(e.to_string())
            }
        })?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(FetchError::Unavailable("rate limited by upstream".into()));
        }
        if !response.status().is_success() {
            return Err(FetchError::Unavailable(format!(
                "klines returned {}",
                response.status()
            )));
        }

        // Klines come back as heterogeneous arrays; index 4 is the close.
        let rows: Vec<Vec<Value>> = response
            .json()
            .await
            .map_err(|e| FetchError::InvalidResponse(e.to_string()))?;

        let last = rows
            .last()
            .ok_or_else(|| FetchError::Unavailable(format!("no klines for {pair} at {at_time}")))?;
        let close = last
            .get(4)
            .and_then(Value::as_str)
            .ok_or_else(|| FetchError::InvalidResponse("kline row missing close".into()))?;

        Ok(MetricValue {
            value: parse_decimal_str(close, Self::scale_for(subject))?,
            decimals: Self::scale_for(subject),
            observed_at: at_time,
            source_id: NAME.to_string(),
        })
    }

    async fn is_healthy(&self) -> bool {
        let url = format!("{}/api/v3/ping", self.api_base);
        matches!(self.client.get(&url).send().await, Ok(r) if r.status().is_success())
    }

    fn info(&self) -> FetcherInfo {
        FetcherInfo {
            name: NAME.to_string(),
            subjects: SUPPORTED.iter().map(|k| kind_name(*k).to_string()).collect(),
            endpoint: self.api_base.clone(),
        }
    }
}
