//! End-to-end resolution of one market.
//!
//! ```text
//!                 ┌── fail: permanent ──► FAILED
//! LOAD ─► FETCH ─►│
//!                 └── fail: transient ──► (scheduler retries)
//! EVALUATE ─► COMMIT ─► WAIT_DISPUTE ─► FINALIZE ─► DONE
//! ```
//!
//! The service never swallows an unknown error: everything is mapped into the
//! transient/permanent taxonomy before it reaches the scheduler.

use crate::chain::{ChainError, OracleChain, PendingCommit};
use crate::clock::{monotonic_ms, Clock, CorrelationId};
use crate::error::ResolveError;
use crate::fetchers::registry::{FetcherRegistry, RegistryError, RegistryFetch};
use crate::models::{ExtremumKind, Market, MetricValue, Outcome, Window, WindowKind};
use crate::predicate::{self, cmp_decimal, div_round_half_even, pow10};
use async_trait::async_trait;
use num_bigint::BigInt;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Seam the scheduler drives. Production wires [`ResolutionService`]; tests
/// wire scripted resolvers.
#[async_trait]
pub trait MarketResolver: Send + Sync {
    async fn resolve_market(
        &self,
        market_id: &str,
        correlation_id: &CorrelationId,
    ) -> Result<(), ResolveError>;
}

#[derive(Debug, Clone)]
pub struct ResolutionConfig {
    pub sample_stride_secs: u64,
    pub max_sources: usize,
    /// Fraction of window samples that may be missing before the attempt is
    /// declared transient and retried.
    pub max_gap_ratio: f64,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            sample_stride_secs: 60,
            max_sources: 3,
            max_gap_ratio: 0.2,
        }
    }
}

pub struct ResolutionService {
    chain: Arc<dyn OracleChain>,
    registry: Arc<FetcherRegistry>,
    clock: Arc<dyn Clock>,
    config: ResolutionConfig,
    shutdown: broadcast::Sender<()>,
}

impl ResolutionService {
    pub fn new(
        chain: Arc<dyn OracleChain>,
        registry: Arc<FetcherRegistry>,
        clock: Arc<dyn Clock>,
        config: ResolutionConfig,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        Self {
            chain,
            registry,
            clock,
            config,
            shutdown,
        }
    }

    /// Sample timestamps for a window: `t_start`, every stride after it, and
    /// always `t_end` itself.
    fn window_ticks(&self, window: &Window) -> Vec<i64> {
        let stride = self.config.sample_stride_secs.max(1) as i64;
        let mut ticks = Vec::new();
        let mut t = window.t_start;
        while t < window.t_end {
            ticks.push(t);
            t += stride;
        }
        ticks.push(window.t_end);
        ticks
    }

    /// Gather raw samples for the market's window. TIME_AVERAGE samples one
    /// (fallback-capable) source per tick so every sample shares a scale;
    /// EXTREMUM fans out across sources per tick, since the true extremum may
    /// be visible on any of them.
    async fn collect_samples(&self, market: &Market) -> Result<Vec<RegistryFetch>, ResolveError> {
        let routing = Some(&market.oracle);
        match market.window.kind {
            WindowKind::SnapshotAt => {
                let fetched = self
                    .registry
                    .fetch_metric(&market.subject, market.window.t_end, routing)
                    .await
                    .map_err(map_registry)?;
                Ok(vec![fetched])
            }
            WindowKind::TimeAverage => {
                // Candidate existence is checked once up front; sources going
                // unhealthy mid-window count as sampling gaps, not as a
                // terminal no-fetcher condition.
                if self
                    .registry
                    .fetchers_for_subject(&market.subject, routing)
                    .is_empty()
                {
                    return Err(ResolveError::NoFetcher(market.subject.describe()));
                }
                let ticks = self.window_ticks(&market.window);
                let expected = ticks.len();
                let mut samples = Vec::with_capacity(expected);
                for tick in ticks {
                    match self
                        .registry
                        .fetch_metric(&market.subject, tick, routing)
                        .await
                    {
                        Ok(fetched) => samples.push(fetched),
                        Err(e) => warn!(tick, error = %e, "window sample missing"),
                    }
                }
                self.check_gap(expected, samples.len())?;
                Ok(samples)
            }
            WindowKind::Extremum => {
                if self
                    .registry
                    .fetchers_for_subject(&market.subject, routing)
                    .is_empty()
                {
                    return Err(ResolveError::NoFetcher(market.subject.describe()));
                }
                let ticks = self.window_ticks(&market.window);
                let expected = ticks.len();
                let mut covered = 0usize;
                let mut samples = Vec::new();
                for tick in ticks {
                    match self
                        .registry
                        .fetch_metric_multi_source(
                            &market.subject,
                            tick,
                            self.config.max_sources,
                            routing,
                        )
                        .await
                    {
                        Ok(mut legs) => {
                            covered += 1;
                            samples.append(&mut legs);
                        }
                        Err(e) => warn!(tick, error = %e, "window sample missing"),
                    }
                }
                self.check_gap(expected, covered)?;
                Ok(samples)
            }
        }
    }

    fn check_gap(&self, expected: usize, got: usize) -> Result<(), ResolveError> {
        let missing = expected.saturating_sub(got);
        if expected > 0 && (missing as f64 / expected as f64) > self.config.max_gap_ratio {
            return Err(ResolveError::Transient(format!(
                "window sampling gap too large: {missing}/{expected} samples missing"
            )));
        }
        Ok(())
    }

    /// Reduce raw samples to the single value the predicate sees.
    fn reduce(&self, market: &Market, samples: &[RegistryFetch]) -> Result<MetricValue, ResolveError> {
        let values: Vec<&MetricValue> = samples.iter().map(|s| &s.value).collect();
        match market.window.kind {
            WindowKind::SnapshotAt => values
                .first()
                .map(|v| (*v).clone())
                .ok_or_else(|| ResolveError::Transient("no snapshot sample".to_string())),
            WindowKind::TimeAverage => {
                average_half_even(&values, market.oracle.rounding_decimals)
                    .ok_or_else(|| ResolveError::Transient("no samples to average".to_string()))
            }
            WindowKind::Extremum => extremum(&values, market.window.extremum)
                .ok_or_else(|| ResolveError::Transient("no samples for extremum".to_string())),
        }
    }

    /// Commit, or reconcile with an existing pending commit. Returns the
    /// chain-recorded commit time.
    async fn commit_phase(
        &self,
        market_id: &str,
        outcome: Outcome,
        data_hash: [u8; 32],
        correlation_id: &CorrelationId,
    ) -> Result<i64, ResolveError> {
        // A retry after a successful commit must not double-commit.
        if let Some(existing) = self
            .chain
            .pending_resolution(market_id)
            .await
            .map_err(map_chain_read)?
        {
            return self.reconcile_pending(existing, outcome, correlation_id);
        }

        match self
            .chain
            .commit_resolution(market_id, outcome.as_u8(), data_hash)
            .await
        {
            Ok(tx) => {
                info!(correlation_id = %correlation_id, market = market_id, tx = tx.as_str(), outcome = outcome.as_u8(), "outcome committed");
                // Use the chain's recorded time when available; clock skew
                // between the runner and chain otherwise shortens the wait.
                let commit_time = match self.chain.pending_resolution(market_id).await {
                    Ok(Some(p)) => p.commit_time,
                    _ => self.clock.unix(),
                };
                Ok(commit_time)
            }
            Err(ChainError::Reverted(reason)) => {
                let lowered = reason.to_lowercase();
                if lowered.contains("already committed") {
                    let existing = self
                        .chain
                        .pending_resolution(market_id)
                        .await
                        .map_err(map_chain_read)?
                        .ok_or_else(|| {
                            ResolveError::Transient(
                                "oracle reported already-committed but no pending state".to_string(),
                            )
                        })?;
                    self.reconcile_pending(existing, outcome, correlation_id)
                } else if lowered.contains("already resolved") {
                    Err(ResolveError::AlreadyTerminal)
                } else {
                    Err(ResolveError::Permanent(format!("commit reverted: {reason}")))
                }
            }
            Err(ChainError::Transient(e)) => Err(ResolveError::Transient(e)),
        }
    }

    fn reconcile_pending(
        &self,
        existing: PendingCommit,
        ours: Outcome,
        correlation_id: &CorrelationId,
    ) -> Result<i64, ResolveError> {
        if existing.outcome == ours.as_u8() {
            info!(
                correlation_id = %correlation_id,
                committed_at = existing.commit_time,
                "matching outcome already committed, skipping to finalize"
            );
            Ok(existing.commit_time)
        } else {
            Err(ResolveError::ConflictingCommit {
                ours: ours.as_u8(),
                theirs: existing.outcome,
            })
        }
    }

    /// Sleep out the dispute window; interruptible by shutdown.
    async fn wait_dispute(&self, commit_time: i64) -> Result<(), ResolveError> {
        let window = self
            .chain
            .dispute_window_secs()
            .await
            .map_err(map_chain_read)?;
        let deadline = commit_time + window as i64;
        let remaining = deadline - self.clock.unix();
        if remaining <= 0 {
            return Ok(());
        }

        let mut shutdown = self.shutdown.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_secs(remaining as u64)) => Ok(()),
            _ = shutdown.recv() => Err(ResolveError::Transient(
                "shutdown during dispute-window wait".to_string(),
            )),
        }
    }

    async fn finalize_phase(
        &self,
        market_id: &str,
        correlation_id: &CorrelationId,
    ) -> Result<(), ResolveError> {
        match self.chain.finalize_resolution(market_id).await {
            Ok(tx) => {
                info!(correlation_id = %correlation_id, market = market_id, tx = tx.as_str(), "resolution finalized");
                Ok(())
            }
            Err(ChainError::Reverted(reason)) => {
                let lowered = reason.to_lowercase();
                // Finalize is idempotent from the job's point of view.
                if lowered.contains("already finalized") || lowered.contains("already resolved") {
                    info!(correlation_id = %correlation_id, market = market_id, "already finalized");
                    Ok(())
                } else {
                    Err(ResolveError::Permanent(format!("finalize reverted: {reason}")))
                }
            }
            Err(ChainError::Transient(e)) => Err(ResolveError::Transient(e)),
        }
    }
}

#[async_trait]
impl MarketResolver for ResolutionService {
    async fn resolve_market(
        &self,
        market_id: &str,
        correlation_id: &CorrelationId,
    ) -> Result<(), ResolveError> {
        let started = monotonic_ms();

        // LOAD
        let market = self
            .chain
            .market_params(market_id)
            .await
            .map_err(|e| match e {
                ChainError::Transient(msg) => ResolveError::Transient(msg),
                ChainError::Reverted(msg) => {
                    ResolveError::Permanent(format!("loading market params: {msg}"))
                }
            })?;
        if market.resolved || market.cancelled {
            return Err(ResolveError::AlreadyTerminal);
        }

        // FETCH
        let samples = self.collect_samples(&market).await?;
        let fetch_done = monotonic_ms();
        if let Some(fallback) = samples.iter().find(|s| s.from_fallback) {
            info!(
                correlation_id = %correlation_id,
                fetcher = fallback.fetcher_name.as_str(),
                "resolution used fallback source data"
            );
        }

        // EVALUATE
        let aggregated = self.reduce(&market, &samples)?;
        let outcome = predicate::evaluate(&aggregated, &market.predicate);
        info!(
            correlation_id = %correlation_id,
            market = market_id,
            op = market.predicate.op.as_str(),
            outcome = outcome.as_u8(),
            samples = samples.len(),
            fetch_ms = fetch_done - started,
            "predicate evaluated"
        );

        // COMMIT (pending-state aware)
        let data_hash = compute_data_hash(
            &market,
            outcome,
            &samples,
        );
        let commit_time = self
            .commit_phase(market_id, outcome, data_hash, correlation_id)
            .await?;

        // WAIT_DISPUTE, then FINALIZE
        self.wait_dispute(commit_time).await?;
        self.finalize_phase(market_id, correlation_id).await?;

        info!(
            correlation_id = %correlation_id,
            market = market_id,
            total_ms = monotonic_ms() - started,
            "market resolution complete"
        );
        Ok(())
    }
}

/// Arithmetic mean of samples, rounded half-to-even at `rounding_decimals`.
/// Samples are first rescaled to a common scale so the sum is exact.
fn average_half_even(values: &[&MetricValue], rounding_decimals: u8) -> Option<MetricValue> {
    let first = values.first()?;
    let common = values.iter().map(|v| v.decimals).max()?;

    let sum: BigInt = values
        .iter()
        .map(|v| &v.value * pow10(u32::from(common - v.decimals)))
        .sum();

    let count = BigInt::from(values.len());
    // mean = sum / (n * 10^common); quantize at rounding_decimals.
    let scaled = if rounding_decimals >= common {
        div_round_half_even(&(sum * pow10(u32::from(rounding_decimals - common))), &count)
    } else {
        div_round_half_even(&sum, &(count * pow10(u32::from(common - rounding_decimals))))
    };

    Some(MetricValue {
        value: scaled,
        decimals: rounding_decimals,
        observed_at: values.iter().map(|v| v.observed_at).max().unwrap_or(first.observed_at),
        source_id: "aggregate".to_string(),
    })
}

fn extremum(values: &[&MetricValue], kind: ExtremumKind) -> Option<MetricValue> {
    values
        .iter()
        .copied()
        .max_by(|a, b| {
            let ord = cmp_decimal(&a.value, a.decimals, &b.value, b.decimals);
            match kind {
                ExtremumKind::Max => ord,
                // Invert so max_by picks the minimum.
                ExtremumKind::Min => ord.reverse(),
            }
        })
        .cloned()
}

/// Deterministic hash binding the committed outcome to the data that produced
/// it: subject, outcome, every raw sample, the fetchers involved, and the
/// rounding scale.
pub fn compute_data_hash(market: &Market, outcome: Outcome, samples: &[RegistryFetch]) -> [u8; 32] {
    let mut ordered: Vec<&RegistryFetch> = samples.iter().collect();
    ordered.sort_by(|a, b| {
        (a.value.observed_at, a.fetcher_name.as_str())
            .cmp(&(b.value.observed_at, b.fetcher_name.as_str()))
    });

    let mut hasher = Sha256::new();
    hasher.update(market.subject.describe().as_bytes());
    hasher.update([outcome.as_u8()]);
    hasher.update([market.oracle.rounding_decimals]);
    for sample in ordered {
        hasher.update(sample.value.value.to_string().as_bytes());
        hasher.update([sample.value.decimals]);
        hasher.update(sample.value.observed_at.to_be_bytes());
        hasher.update(sample.fetcher_name.as_bytes());
    }
    hasher.finalize().into()
}

fn map_registry(e: RegistryError) -> ResolveError {
    match e {
        RegistryError::NoFetcher => ResolveError::NoFetcher("subject has no candidates".to_string()),
        RegistryError::AllFailed { attempts, detail } => ResolveError::Transient(format!(
            "all {attempts} fetch attempts failed: {detail}"
        )),
        RegistryError::AlreadyRegistered(name) => {
            ResolveError::Permanent(format!("registry misconfigured: duplicate {name}"))
        }
    }
}

/// Read-path chain failures: a revert on a read means a broken deployment,
/// not something a retry fixes.
fn map_chain_read(e: ChainError) -> ResolveError {
    match e {
        ChainError::Transient(msg) => ResolveError::Transient(msg),
        ChainError::Reverted(msg) => ResolveError::Permanent(msg),
    }
}
