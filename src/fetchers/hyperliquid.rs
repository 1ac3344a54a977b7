//! Hyperliquid info-API fetcher.
//!
//! Serves protocol metrics (`*_PRICE` metric ids) and mapped token prices.
//! Live reads go through `allMids`; historical reads through `candleSnapshot`
//! at 1-minute resolution, which is what time-averaged and extremum windows
//! sample against.

use crate::fetchers::{kind_name, parse_decimal_str, FetchError, FetcherInfo, MetricFetcher};
use crate::models::{MetricValue, Subject, SubjectKind};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::debug;

pub const NAME: &str = "HYPERLIQUID";

/// Fixed scale for protocol metrics served by this source.
const METRIC_DECIMALS: u8 = 8;

/// Reads at or after `now - LIVE_SKEW_SECS` use the live mid instead of a
/// candle lookup.
const LIVE_SKEW_SECS: i64 = 120;

/// Minimum spacing between info-API calls (the API is weight-limited).
const MIN_REQUEST_INTERVAL: Duration = Duration::from_millis(250);

const SUPPORTED: &[SubjectKind] = &[SubjectKind::HlMetric, SubjectKind::TokenPrice];

#[derive(Debug, Deserialize)]
struct Candle {
    /// Close price as a decimal string.
    #[serde(rename = "c")]
    close: String,
    /// Candle open time, unix millis.
    #[serde(rename = "t")]
    open_time: i64,
}

pub struct HyperliquidFetcher {
    client: Client,
    api_base: String,
    /// Lowercased token address -> coin symbol.
    token_symbols: HashMap<String, String>,
    last_request: Mutex<Instant>,
}

impl HyperliquidFetcher {
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
            last_request: Mutex::new(Instant::now() - MIN_REQUEST_INTERVAL),
        }
    }

    fn coin_for(&self, subject: &Subject) -> Option<String> {
        match subject {
            Subject::HlMetric { metric_id } => {
                metric_id.strip_suffix("_PRICE").map(str::to_string)
            }
            Subject::TokenPrice { token, .. } => {
                self.token_symbols.get(&token.to_lowercase()).cloned()
            }
            Subject::Generic { .. } => None,
        }
    }

    fn scale_for(subject: &Subject) -> u8 {
        match subject {
            Subject::TokenPrice { decimals, .. } => *decimals,
            _ => METRIC_DECIMALS,
        }
    }

    async fn throttle(&self) {
        let mut last = self.last_request.lock().await;
        let elapsed = last.elapsed();
        if elapsed < MIN_REQUEST_INTERVAL {
            sleep(MIN_REQUEST_INTERVAL - elapsed).await;
        }
        *last = Instant::now();
    }

    async fn post_info(&self, body: serde_json::Value) -> Result<reqwest::Response, FetchError> {
        self.throttle().await;
        let url = format!("{}/info", self.api_base);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FetchError::Timeout
                } else {
                    FetchError::Unavailable(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(FetchError::Unavailable(format!(
                "info API returned {}",
                response.status()
            )));
        }
        Ok(response)
    }

    async fn live_mid(&self, coin: &str) -> Result<String, FetchError> {
        let response = self.post_info(json!({"type": "allMids"})).await?;
        let mids: HashMap<String, String> = response
            .json()
            .await
            .map_err(|e| FetchError::InvalidResponse(e.to_string()))?;
        mids.get(coin)
            .cloned()
            .ok_or(FetchError::NotSupported)
    }

    async fn candle_close(&self, coin: &str, at_time: i64) -> Result<String, FetchError> {
        let end_ms = at_time * 1000;
        let start_ms = (at_time - 120) * 1000;
        let response = self
            .post_info(json!({
                "type": "candleSnapshot",
                "req": {
                    "coin": coin,
                    "interval": "1m",
                    "startTime": start_ms,
                    "endTime": end_ms,
                }
            }))
            .await?;

        let mut candles: Vec<Candle> = response
            .json()
            .await
            .map_err(|e| FetchError::InvalidResponse(e.to_string()))?;
        candles.sort_by_key(|c| c.open_time);

        let last = candles.pop().ok_or_else(|| {
            FetchError::Unavailable(format!("no candle data for {coin} at {at_time}"))
        })?;
        debug!(coin, candle_open = last.open_time, "using candle close for historical read");
        Ok(last.close)
    }
}

#[async_trait]
impl MetricFetcher for HyperliquidFetcher {
    fn name(&self) -> &str {
        NAME
    }

    fn supported_subjects(&self) -> &[SubjectKind] {
        SUPPORTED
    }

    fn can_fetch(&self, subject: &Subject) -> bool {
        self.coin_for(subject).is_some()
    }

    async fn fetch_metric(
        &self,
        subject: &Subject,
        at_time: i64,
    ) -> Result<MetricValue, FetchError> {
        let coin = self.coin_for(subject).ok_or(FetchError::NotSupported)?;
        let now = Utc::now().timestamp();

        let raw = if now - at_time <= LIVE_SKEW_SECS {
            self.live_mid(&coin).await?
        } else {
            self.candle_close(&coin, at_time).await?
        };

        Ok(MetricValue {
            value: parse_decimal_str(&raw, Self::scale_for(subject))?,
            decimals: Self::scale_for(subject),
            observed_at: at_time,
            source_id: NAME.to_string(),
        })
    }

    async fn is_healthy(&self) -> bool {
        self.post_info(json!({"type": "meta"})).await.is_ok()
    }

    fn info(&self) -> FetcherInfo {
        FetcherInfo {
            name: NAME.to_string(),
            subjects: SUPPORTED.iter().map(|k| kind_name(*k).to_string()).collect(),
            endpoint: self.api_base.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_metric_ids_and_token_addresses() {
        let mut symbols = HashMap::new();
        symbols.insert("0xdeadbeef".to_string(), "ETH".to_string());
        let fetcher = HyperliquidFetcher::new("https://example.invalid".to_string(), symbols);

        assert!(fetcher.can_fetch(&Subject::HlMetric { metric_id: "BTC_PRICE".into() }));
        assert!(!fetcher.can_fetch(&Subject::HlMetric { metric_id: "FUNDING_RATE".into() }));
        assert!(fetcher.can_fetch(&Subject::TokenPrice {
            token: "0xDEADBEEF".into(),
            decimals: 8
        }));
        assert!(!fetcher.can_fetch(&Subject::TokenPrice { token: "0x01".into(), decimals: 8 }));
        assert!(!fetcher.can_fetch(&Subject::Generic { source_id: "FOO".into() }));
    }
}
