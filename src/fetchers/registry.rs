//! Source registry: priority ordering, fallback, health tracking, and the
//! global concurrent-fetch bound protecting upstream APIs.

use crate::clock::Clock;
use crate::fetchers::{FetchError, FetcherHealth, FetcherInfo, MetricFetcher};
use crate::models::{MetricValue, OracleSpec, Subject};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Rolling window used for the recent-error-rate tiebreak.
const RECENT_WINDOW: usize = 20;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("fetcher {0} is already registered")]
    AlreadyRegistered(String),

    #[error("no registered fetcher can serve this subject")]
    NoFetcher,

    #[error("all {attempts} candidate fetchers failed: {detail}")]
    AllFailed { attempts: usize, detail: String },
}

/// One successful registry fetch.
#[derive(Debug, Clone)]
pub struct RegistryFetch {
    pub value: MetricValue,
    pub fetcher_name: String,
    pub fetch_time_ms: u64,
    pub from_fallback: bool,
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub fetch_timeout: Duration,
    pub max_concurrent_fetches: usize,
    pub fallbacks_enabled: bool,
    pub health_check_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(30),
            max_concurrent_fetches: 5,
            fallbacks_enabled: true,
            health_check_interval: Duration::from_secs(60),
        }
    }
}

struct Entry {
    fetcher: Arc<dyn MetricFetcher>,
    health: FetcherHealth,
    /// Recent attempt outcomes, `true` = failure.
    recent: VecDeque<bool>,
}

impl Entry {
    fn recent_error_rate(&self) -> f64 {
        if self.recent.is_empty() {
            return 0.0;
        }
        let errors = self.recent.iter().filter(|&&e| e).count();
        errors as f64 / self.recent.len() as f64
    }

    fn record(&mut self, failed: bool) {
        self.recent.push_back(failed);
        if self.recent.len() > RECENT_WINDOW {
            self.recent.pop_front();
        }
    }
}

pub struct FetcherRegistry {
    entries: RwLock<Vec<Entry>>,
    gate: Arc<Semaphore>,
    config: RegistryConfig,
    clock: Arc<dyn Clock>,
}

impl FetcherRegistry {
    pub fn new(config: RegistryConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            gate: Arc::new(Semaphore::new(config.max_concurrent_fetches)),
            entries: RwLock::new(Vec::new()),
            config,
            clock,
        }
    }

    pub fn register(&self, fetcher: Arc<dyn MetricFetcher>) -> Result<(), RegistryError> {
        let mut entries = self.entries.write();
        if entries.iter().any(|e| e.fetcher.name() == fetcher.name()) {
            return Err(RegistryError::AlreadyRegistered(fetcher.name().to_string()));
        }
        info!(fetcher = fetcher.name(), "registered metric fetcher");
        entries.push(Entry {
            health: FetcherHealth::new(self.clock.unix()),
            recent: VecDeque::with_capacity(RECENT_WINDOW),
            fetcher,
        });
        Ok(())
    }

    /// Eligible fetcher names for a subject, in priority order: the market's
    /// declared primary, then its declared fallback, then the rest by recent
    /// error rate with registration order as the stable tiebreak. Unhealthy
    /// sources are excluded entirely.
    pub fn fetchers_for_subject(
        &self,
        subject: &Subject,
        routing: Option<&OracleSpec>,
    ) -> Vec<String> {
        let entries = self.entries.read();
        let mut eligible: Vec<(usize, &Entry)> = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| {
                e.health.healthy
                    && e.fetcher.supported_subjects().contains(&subject.kind())
                    && e.fetcher.can_fetch(subject)
            })
            .collect();

        eligible.sort_by(|(ai, a), (bi, b)| {
            let rank = |name: &str, idx: usize, err: f64| {
                let declared = routing.map_or(usize::MAX, |r| {
                    if name == r.primary_source_id {
                        0
                    } else if name == r.fallback_source_id {
                        1
                    } else {
                        usize::MAX
                    }
                });
                (declared, (err * 1e6) as u64, idx)
            };
            rank(a.fetcher.name(), *ai, a.recent_error_rate())
                .cmp(&rank(b.fetcher.name(), *bi, b.recent_error_rate()))
        });

        eligible
            .into_iter()
            .map(|(_, e)| e.fetcher.name().to_string())
            .collect()
    }

    fn fetcher_by_name(&self, name: &str) -> Option<Arc<dyn MetricFetcher>> {
        self.entries
            .read()
            .iter()
            .find(|e| e.fetcher.name() == name)
            .map(|e| Arc::clone(&e.fetcher))
    }

    /// Fetch through the first healthy candidate; on failure mark it
    /// unhealthy and walk the fallback chain.
    pub async fn fetch_metric(
        &self,
        subject: &Subject,
        at_time: i64,
        routing: Option<&OracleSpec>,
    ) -> Result<RegistryFetch, RegistryError> {
        let candidates = self.fetchers_for_subject(subject, routing);
        if candidates.is_empty() {
            return Err(RegistryError::NoFetcher);
        }

        let mut failures: Vec<String> = Vec::new();
        for (idx, name) in candidates.iter().enumerate() {
            let Some(fetcher) = self.fetcher_by_name(name) else {
                continue;
            };
            match self.attempt(&*fetcher, subject, at_time).await {
                Ok((value, elapsed_ms)) => {
                    let from_fallback = idx > 0;
                    if from_fallback {
                        info!(
                            fetcher = name.as_str(),
                            subject = %subject.describe(),
                            "fetched via fallback source"
                        );
                    }
                    return Ok(RegistryFetch {
                        value,
                        fetcher_name: name.clone(),
                        fetch_time_ms: elapsed_ms,
                        from_fallback,
                    });
                }
                Err(e) => {
                    warn!(fetcher = name.as_str(), error = %e, "fetch failed, marking unhealthy");
                    failures.push(format!("{name}: {e}"));
                    if !self.config.fallbacks_enabled {
                        break;
                    }
                }
            }
        }

        Err(RegistryError::AllFailed {
            attempts: failures.len(),
            detail: failures.join("; "),
        })
    }

    /// Fire up to `max_sources` candidates in parallel and keep every
    /// success. Used when the caller wants cross-source reconciliation.
    pub async fn fetch_metric_multi_source(
        &self,
        subject: &Subject,
        at_time: i64,
        max_sources: usize,
        routing: Option<&OracleSpec>,
    ) -> Result<Vec<RegistryFetch>, RegistryError> {
        let mut candidates = self.fetchers_for_subject(subject, routing);
        candidates.truncate(max_sources);
        if candidates.is_empty() {
            return Err(RegistryError::NoFetcher);
        }

        let attempts = candidates.len();
        let futures = candidates.into_iter().enumerate().map(|(idx, name)| async move {
            let fetcher = self.fetcher_by_name(&name)?;
            match self.attempt(&*fetcher, subject, at_time).await {
                Ok((value, elapsed_ms)) => Some(RegistryFetch {
                    value,
                    fetcher_name: name,
                    fetch_time_ms: elapsed_ms,
                    from_fallback: idx > 0,
                }),
                Err(e) => {
                    debug!(fetcher = name.as_str(), error = %e, "multi-source fetch leg failed");
                    None
                }
            }
        });

        let results: Vec<RegistryFetch> = futures_util::future::join_all(futures)
            .await
            .into_iter()
            .flatten()
            .collect();

        if results.is_empty() {
            return Err(RegistryError::AllFailed {
                attempts,
                detail: "every parallel source leg failed".to_string(),
            });
        }
        Ok(results)
    }

    /// One bounded, deadlined attempt against a single fetcher, with health
    /// bookkeeping on both sides.
    async fn attempt(
        &self,
        fetcher: &dyn MetricFetcher,
        subject: &Subject,
        at_time: i64,
    ) -> Result<(MetricValue, u64), FetchError> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| FetchError::Unavailable("registry shutting down".into()))?;

        let started = Instant::now();
        let outcome = tokio::time::timeout(
            self.config.fetch_timeout,
            fetcher.fetch_metric(subject, at_time),
        )
        .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(value)) => {
                self.note_attempt(fetcher.name(), elapsed_ms, None);
                Ok((value, elapsed_ms))
            }
            Ok(Err(e)) => {
                self.note_attempt(fetcher.name(), elapsed_ms, Some(e.to_string()));
                Err(e)
            }
            Err(_) => {
                self.note_attempt(fetcher.name(), elapsed_ms, Some("deadline elapsed".into()));
                Err(FetchError::Timeout)
            }
        }
    }

    fn note_attempt(&self, name: &str, elapsed_ms: u64, error: Option<String>) {
        let now = self.clock.unix();
        let mut entries = self.entries.write();
        if let Some(entry) = entries.iter_mut().find(|e| e.fetcher.name() == name) {
            let h = &mut entry.health;
            h.total_fetches += 1;
            h.last_fetch = Some(now);
            let n = h.total_fetches as f64;
            h.avg_response_time_ms += (elapsed_ms as f64 - h.avg_response_time_ms) / n;
            match error {
                Some(msg) => {
                    h.error_count += 1;
                    h.last_error = Some(msg);
                    // Stays unhealthy until the health loop re-verifies or an
                    // operator calls mark_healthy.
                    h.healthy = false;
                    entry.record(true);
                }
                None => entry.record(false),
            }
        }
    }

    pub fn mark_healthy(&self, name: &str) {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.iter_mut().find(|e| e.fetcher.name() == name) {
            entry.health.healthy = true;
            entry.health.last_error = None;
        }
    }

    pub fn mark_unhealthy(&self, name: &str, reason: &str) {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.iter_mut().find(|e| e.fetcher.name() == name) {
            entry.health.healthy = false;
            entry.health.last_error = Some(reason.to_string());
        }
    }

    /// Probe every source once and reconcile health. The periodic loop calls
    /// this; tests call it directly.
    pub async fn probe_all(&self) {
        let fetchers: Vec<Arc<dyn MetricFetcher>> = self
            .entries
            .read()
            .iter()
            .map(|e| Arc::clone(&e.fetcher))
            .collect();

        for fetcher in fetchers {
            let alive = fetcher.is_healthy().await;
            let now = self.clock.unix();
            let mut entries = self.entries.write();
            if let Some(entry) = entries.iter_mut().find(|e| e.fetcher.name() == fetcher.name()) {
                entry.health.last_check = now;
                if alive && !entry.health.healthy {
                    info!(fetcher = fetcher.name(), "source recovered");
                    entry.health.last_error = None;
                }
                if !alive && entry.health.healthy {
                    warn!(fetcher = fetcher.name(), "source failed liveness probe");
                    entry.health.last_error = Some("liveness probe failed".to_string());
                }
                entry.health.healthy = alive;
            }
        }
    }

    /// Background health loop; exits on shutdown.
    pub fn spawn_health_loop(
        self: &Arc<Self>,
        mut shutdown: tokio::sync::broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(registry.config.health_check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so startup ordering
            // does not race fetcher construction.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => registry.probe_all().await,
                    _ = shutdown.recv() => break,
                }
            }
            debug!("fetcher health loop stopped");
        })
    }

    pub fn stats(&self) -> Vec<(FetcherInfo, FetcherHealth)> {
        self.entries
            .read()
            .iter()
            .map(|e| (e.fetcher.info(), e.health.clone()))
            .collect()
    }
}
