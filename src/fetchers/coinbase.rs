//! Coinbase spot-price fetcher. Live reads only; the spot endpoint has no
//! historical depth, so reads far from now are declined and the registry
//! falls through to a source that can serve them.

use crate::fetchers::{kind_name, parse_decimal_str, FetchError, FetcherInfo, MetricFetcher};
use crate::models::{MetricValue, Subject, SubjectKind};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

pub const NAME: &str = "COINBASE";

const PRICE_DECIMALS: u8 = 8;

/// Maximum |now - at_time| the spot endpoint is allowed to answer for.
const MAX_SKEW_SECS: i64 = 300;

const SUPPORTED: &[SubjectKind] = &[SubjectKind::HlMetric, SubjectKind::TokenPrice];

#[derive(Debug, Deserialize)]
struct SpotResponse {
    data: SpotData,
}

#[derive(Debug, Deserialize)]
struct SpotData {
    amount: String,
}

pub struct CoinbaseFetcher {
    client: Client,
    api_base: String,
    token_symbols: HashMap<String, String>,
}

impl CoinbaseFetcher {
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

    fn symbol_for(&self, subject: &Subject) -> Option<String> {
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
            _ => PRICE_DECIMALS,
        }
    }
}

#[async_trait]
impl MetricFetcher for CoinbaseFetcher {
    fn name(&self) -> &str {
        NAME
    }

    fn supported_subjects(&self) -> &[SubjectKind] {
        SUPPORTED
    }

    fn can_fetch(&self, subject: &Subject) -> bool {
        self.symbol_for(subject).is_some()
    }

    async fn fetch_metric(
        &self,
        subject: &Subject,
        at_time: i64,
    ) -> Result<MetricValue, FetchError> {
        let symbol = self.symbol_for(subject).ok_or(FetchError::NotSupported)?;

        let now = Utc::now().timestamp();
        if (now - at_time).abs() > MAX_SKEW_SECS {
            return Err(FetchError::Unavailable(format!(
                "spot endpoint cannot serve reads {}s from now",
                (now - at_time).abs()
            )));
        }

        let url = format!("{}/v2/prices/{}-USD/spot", self.api_base, symbol);
        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Unavailable(e.to_string())
            }
        })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(FetchError::NotSupported);
        }
        if !response.status().is_success() {
            return Err(FetchError::Unavailable(format!(
                "spot API returned {}",
                response.status()
            )));
        }

        let body: SpotResponse = response
            .json()
            .await
            .map_err(|e| FetchError::InvalidResponse(e.to_string()))?;

        Ok(MetricValue {
            value: parse_decimal_str(&body.data.amount, Self::scale_for(subject))?,
            decimals: Self::scale_for(subject),
            observed_at: at_time,
            source_id: NAME.to_string(),
        })
    }

    async fn is_healthy(&self) -> bool {
        let url = format!("{}/v2/time", self.api_base);
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
