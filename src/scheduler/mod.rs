//! Durable time-based execution of market resolutions.
//!
//! The scheduler owns the persisted job lifecycle: idempotent scheduling,
//! timers (including day-spanning delays that re-derive from the wall clock),
//! bounded-concurrency execution, retry with exponential backoff and jitter,
//! crash recovery, periodic cleanup, cancellation, and graceful shutdown.
//!
//! Persisted jobs never carry timer handles; handles live in the in-memory
//! map and are reconstructed from `resolve_time` + `status` during recovery.

pub mod queue;

#[cfg(test)]
mod scheduler_tests;

use crate::clock::{Clock, CorrelationId};
use crate::error::ResolveError;
use crate::models::{Job, JobStatus, JobType};
use crate::persistence::{JobPatch, JobStore, RETENTION_DAYS};
use crate::resolution::MarketResolver;
use anyhow::Result;
use parking_lot::Mutex;
use queue::{JobQueue, QueueStats};
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Timers longer than this re-derive their remaining delay from the wall
/// clock in hourly chunks, so day-spanning schedules survive clock
/// adjustments within the process.
const LONG_DELAY_SECS: i64 = 24 * 3600;

/// Chunk size for long-delay timers.
const TIMER_CHUNK_SECS: i64 = 3600;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub job_concurrency: usize,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    /// Immediate jobs wait this long before starting, coalescing bursts.
    pub debounce: Duration,
    pub cleanup_interval: Duration,
    pub shutdown_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            job_concurrency: 5,
            max_retries: 5,
            retry_base_delay: Duration::from_secs(5),
            debounce: Duration::from_secs(1),
            cleanup_interval: Duration::from_secs(3600),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// Nominal backoff: `base * 2^(n-1)`, capped at ten times the base.
pub fn nominal_backoff(retry_count: u32, base: Duration) -> Duration {
    let exp = retry_count.saturating_sub(1).min(32);
    let nominal = base.saturating_mul(1u32 << exp.min(31));
    nominal.min(base.saturating_mul(10))
}

/// Backoff with up to 10% random jitter added.
fn jittered_backoff(retry_count: u32, base: Duration) -> Duration {
    let nominal = nominal_backoff(retry_count, base);
    let jitter = rand::thread_rng().gen_range(0.0..0.10);
    nominal.mul_f64(1.0 + jitter)
}

struct RuntimeJob {
    market_id: String,
    timer: Option<JoinHandle<()>>,
}

/// Point-in-time job counts for the operator surface.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub scheduled: usize,
    pub executing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub queue: QueueStats,
}

pub struct JobScheduler {
    jobs: Mutex<HashMap<String, RuntimeJob>>,
    queue: JobQueue,
    store: Arc<dyn JobStore>,
    resolver: Arc<dyn MarketResolver>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    shutdown: broadcast::Sender<()>,
    shutting_down: AtomicBool,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl JobScheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        resolver: Arc<dyn MarketResolver>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
        shutdown: broadcast::Sender<()>,
    ) -> Arc<Self> {
        Arc::new(Self {
            jobs: Mutex::new(HashMap::new()),
            queue: JobQueue::new(config.job_concurrency),
            store,
            resolver,
            clock,
            config,
            shutdown,
            shutting_down: AtomicBool::new(false),
            cleanup_task: Mutex::new(None),
        })
    }

    /// Crash recovery: rebuild timers and re-enqueue interrupted work from
    /// the persisted state, then start the periodic cleanup loop.
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        let jobs = self.store.load_jobs()?;
        let now = self.clock.unix();
        let mut recovered = 0usize;

        for job in jobs {
            if job.is_terminal() {
                continue;
            }
            recovered += 1;
            match job.status {
                JobStatus::Failed => {
                    // Retries remaining, or is_terminal would have caught it.
                    let retry_count = job.retry_count + 1;
                    self.store.update_job(
                        &job.id,
                        JobPatch::status(JobStatus::Scheduled)
                            .with_type(JobType::Retry)
                            .with_retry_count(retry_count),
                    )?;
                    let delay = jittered_backoff(retry_count, self.config.retry_base_delay);
                    info!(job_id = job.id.as_str(), retry_count, "recovering failed job as retry");
                    self.arm_timer(&job.id, &job.market_id, delay);
                }
                JobStatus::Executing => {
                    // Crashed mid-run; restart it.
                    self.store
                        .update_job(&job.id, JobPatch::status(JobStatus::Scheduled))?;
                    info!(job_id = job.id.as_str(), "re-enqueueing job interrupted by crash");
                    self.arm_timer(&job.id, &job.market_id, self.config.debounce);
                }
                JobStatus::Scheduled => {
                    let delay_secs = job.resolve_time - now;
                    if delay_secs <= 0 {
                        self.arm_timer(&job.id, &job.market_id, self.config.debounce);
                    } else {
                        self.arm_timer(
                            &job.id,
                            &job.market_id,
                            Duration::from_secs(delay_secs as u64),
                        );
                    }
                }
                _ => {}
            }
        }

        if recovered > 0 {
            info!(recovered, "recovered persisted jobs");
        }

        self.store.cleanup(chrono::Duration::days(RETENTION_DAYS))?;
        self.spawn_cleanup_loop();
        Ok(())
    }

    /// Idempotent: one non-terminal job per market, first schedule wins.
    /// Returns the job id.
    pub fn schedule_market_resolution(
        self: &Arc<Self>,
        market_id: &str,
        title: &str,
        resolve_time: i64,
        correlation_id: Option<CorrelationId>,
    ) -> Result<String> {
        if let Some(existing) = self.store.active_job_for_market(market_id)? {
            debug!(
                market = market_id,
                job_id = existing.id.as_str(),
                "schedule request deduplicated onto existing job"
            );
            return Ok(existing.id);
        }

        let now = self.clock.now();
        let delay_secs = resolve_time - now.timestamp();
        let job_type = if delay_secs <= 0 {
            JobType::Immediate
        } else {
            JobType::TimeBased
        };

        let correlation_id = correlation_id.unwrap_or_default();
        let job = Job::new(
            market_id,
            title,
            resolve_time,
            job_type,
            self.config.max_retries,
            now,
            Some(correlation_id.to_string()),
        );
        self.store.save_job(&job)?;

        info!(
            correlation_id = %correlation_id,
            market = market_id,
            job_id = job.id.as_str(),
            resolve_time,
            delay_secs = delay_secs.max(0),
            kind = ?job_type,
            "market resolution scheduled"
        );

        let delay = if delay_secs <= 0 {
            self.config.debounce
        } else {
            Duration::from_secs(delay_secs as u64)
        };
        self.arm_timer(&job.id, market_id, delay);
        Ok(job.id)
    }

    /// Arm (or replace) the in-memory timer for a job.
    fn arm_timer(self: &Arc<Self>, job_id: &str, market_id: &str, delay: Duration) {
        if self.shutting_down.load(Ordering::SeqCst) {
            debug!(job_id, "not arming timer during shutdown");
            return;
        }

        let me = Arc::clone(self);
        let id = job_id.to_string();
        let target_unix = self.clock.unix() + delay.as_secs() as i64;

        // Holding the map lock across the spawn: run_job's first touch is
        // this same lock, so the handle is always registered before the
        // fired timer can observe (or clear) it.
        let mut jobs = self.jobs.lock();
        let handle = tokio::spawn(async move {
            me.sleep_until_unix(target_unix, delay).await;
            me.run_job(&id).await;
        });
        if let Some(old) = jobs.insert(
            job_id.to_string(),
            RuntimeJob {
                market_id: market_id.to_string(),
                timer: Some(handle),
            },
        ) {
            if let Some(timer) = old.timer {
                timer.abort();
            }
        }
    }

    /// Short delays use one monotonic sleep. Day-spanning delays sleep in
    /// chunks and re-derive the remaining time from the wall clock.
    async fn sleep_until_unix(&self, target_unix: i64, initial: Duration) {
        if (initial.as_secs() as i64) <= LONG_DELAY_SECS {
            tokio::time::sleep(initial).await;
            return;
        }
        loop {
            let remaining = target_unix - self.clock.unix();
            if remaining <= 0 {
                return;
            }
            tokio::time::sleep(Duration::from_secs(remaining.min(TIMER_CHUNK_SECS) as u64)).await;
        }
    }

    /// Timer fire: push the job through the queue.
    async fn run_job(self: &Arc<Self>, job_id: &str) {
        // This task stops being a timer the moment it fires. Forget the
        // handle so shutdown aborts only pending timers, never in-flight
        // executions.
        if let Some(runtime) = self.jobs.lock().get_mut(job_id) {
            runtime.timer = None;
        }

        let me = Arc::clone(self);
        let id = job_id.to_string();
        let outcome = self.queue.run(async move { me.execute_job(&id).await }).await;
        if outcome.is_none() {
            debug!(job_id, "queue closed before start; job stays persisted for recovery");
        }
    }

    async fn execute_job(self: &Arc<Self>, job_id: &str) {
        let job = match self.store.get_job(job_id) {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(job_id, "job vanished before execution");
                return;
            }
            Err(e) => {
                error!(job_id, error = %e, "failed to read job before execution");
                return;
            }
        };

        // Lost race against cancellation (or a duplicate fire).
        if job.status != JobStatus::Scheduled {
            debug!(job_id, status = ?job.status, "skipping execution, job no longer scheduled");
            return;
        }

        if let Err(e) = self
            .store
            .update_job(job_id, JobPatch::status(JobStatus::Executing))
        {
            error!(job_id, error = %e, "failed to mark job executing");
            return;
        }

        let correlation_id = job
            .correlation_id
            .clone()
            .map(CorrelationId::from)
            .unwrap_or_default();
        info!(correlation_id = %correlation_id, job_id, market = job.market_id.as_str(), "executing resolution job");

        let result = self
            .resolver
            .resolve_market(&job.market_id, &correlation_id)
            .await;

        // A shutdown-interrupted attempt stays EXECUTING; recovery restarts
        // it instead of burning a retry.
        if self.shutting_down.load(Ordering::SeqCst) {
            if matches!(&result, Err(e) if e.is_retryable()) {
                warn!(job_id, "attempt interrupted by shutdown; leaving job for recovery");
                self.jobs.lock().remove(job_id);
                return;
            }
        }

        match result {
            Ok(()) => self.complete_job(&job, &correlation_id, None),
            Err(ResolveError::AlreadyTerminal) => {
                self.complete_job(&job, &correlation_id, Some("market already terminal on-chain"))
            }
            Err(e) if e.is_retryable() && job.retry_count < job.max_retries => {
                self.schedule_retry(&job, &correlation_id, &e.to_string())
            }
            Err(e) => self.fail_job(&job, &correlation_id, &e.to_string()),
        }
    }

    fn complete_job(&self, job: &Job, correlation_id: &CorrelationId, note: Option<&str>) {
        let patch = JobPatch::status(JobStatus::Completed).clear_error();
        if let Err(e) = self.store.update_job(&job.id, patch) {
            error!(job_id = job.id.as_str(), error = %e, "failed to persist completion");
        }
        self.jobs.lock().remove(&job.id);
        info!(
            correlation_id = %correlation_id,
            job_id = job.id.as_str(),
            market = job.market_id.as_str(),
            note = note.unwrap_or("resolved"),
            "job completed"
        );
    }

    fn schedule_retry(self: &Arc<Self>, job: &Job, correlation_id: &CorrelationId, error: &str) {
        let retry_count = job.retry_count + 1;
        let patch = JobPatch::status(JobStatus::Scheduled)
            .with_type(JobType::Retry)
            .with_retry_count(retry_count)
            .with_error(error);
        if let Err(e) = self.store.update_job(&job.id, patch) {
            error!(job_id = job.id.as_str(), error = %e, "failed to persist retry state");
            return;
        }

        let delay = jittered_backoff(retry_count, self.config.retry_base_delay);
        warn!(
            correlation_id = %correlation_id,
            job_id = job.id.as_str(),
            retry_count,
            max_retries = job.max_retries,
            delay_ms = delay.as_millis() as u64,
            error,
            "attempt failed, retrying with backoff"
        );
        self.arm_timer(&job.id, &job.market_id, delay);
    }

    fn fail_job(&self, job: &Job, correlation_id: &CorrelationId, error: &str) {
        // Permanent failures exhaust the retry budget so recovery never
        // resurrects them.
        let patch = JobPatch::status(JobStatus::Failed)
            .with_retry_count(job.max_retries)
            .with_error(error);
        if let Err(e) = self.store.update_job(&job.id, patch) {
            error!(job_id = job.id.as_str(), error = %e, "failed to persist terminal failure");
        }
        self.jobs.lock().remove(&job.id);
        error!(
            correlation_id = %correlation_id,
            job_id = job.id.as_str(),
            market = job.market_id.as_str(),
            error,
            "job failed terminally"
        );
    }

    /// Stop a pending timer and mark the job cancelled. A no-op (returning
    /// false) once the job is executing or terminal.
    pub fn cancel_job(&self, job_id: &str) -> Result<bool> {
        let Some(job) = self.store.get_job(job_id)? else {
            return Ok(false);
        };
        if job.status != JobStatus::Scheduled {
            return Ok(false);
        }

        self.store
            .update_job(job_id, JobPatch::status(JobStatus::Cancelled))?;
        if let Some(runtime) = self.jobs.lock().remove(job_id) {
            if let Some(timer) = runtime.timer {
                timer.abort();
            }
        }
        info!(job_id, "job cancelled");
        Ok(true)
    }

    /// Manual trigger: behaves exactly as the job's timer firing now.
    /// Returns the job id, or None when the market has no active job.
    pub fn trigger_market_now(self: &Arc<Self>, market_id: &str) -> Result<Option<String>> {
        let Some(job) = self.store.active_job_for_market(market_id)? else {
            return Ok(None);
        };
        if job.status == JobStatus::Scheduled {
            info!(job_id = job.id.as_str(), market = market_id, "manual resolution trigger");
            self.arm_timer(&job.id, market_id, Duration::from_millis(0));
        }
        Ok(Some(job.id))
    }

    fn spawn_cleanup_loop(self: &Arc<Self>) {
        let me = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(me.config.cleanup_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // immediate first tick; initialize already cleaned
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = me.store.cleanup(chrono::Duration::days(RETENTION_DAYS)) {
                            warn!(error = %e, "periodic job cleanup failed");
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        });
        *self.cleanup_task.lock() = Some(handle);
    }

    /// Graceful shutdown: stop timers and the cleanup loop, refuse queued
    /// work, then wait up to the grace period for in-flight jobs. Jobs that
    /// outlive the grace stay EXECUTING in persistence and are recovered on
    /// next start.
    pub async fn destroy(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let _ = self.shutdown.send(());

        {
            let mut jobs = self.jobs.lock();
            for (_, runtime) in jobs.drain() {
                if let Some(timer) = runtime.timer {
                    timer.abort();
                }
            }
        }
        if let Some(handle) = self.cleanup_task.lock().take() {
            handle.abort();
        }

        self.queue.close();
        if self.queue.wait_idle(self.config.shutdown_grace).await {
            info!("scheduler drained cleanly");
        } else {
            warn!("shutdown grace elapsed; in-flight jobs left EXECUTING for recovery");
        }
    }

    pub fn stats(&self) -> Result<SchedulerStats> {
        let jobs = self.store.load_jobs()?;
        let count = |status: JobStatus| jobs.iter().filter(|j| j.status == status).count();
        Ok(SchedulerStats {
            scheduled: count(JobStatus::Scheduled),
            executing: count(JobStatus::Executing),
            completed: count(JobStatus::Completed),
            failed: count(JobStatus::Failed),
            cancelled: count(JobStatus::Cancelled),
            queue: self.queue.stats(),
        })
    }

    pub fn list_jobs(&self) -> Result<Vec<Job>> {
        self.store.load_jobs()
    }

    pub fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        self.store.get_job(job_id)
    }
}
