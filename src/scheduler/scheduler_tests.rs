//! Scheduler scenario tests: idempotent scheduling, retry/backoff behavior,
//! terminal failures, crash recovery, cancellation, and graceful shutdown.

use crate::clock::{Clock, CorrelationId, SystemClock};
use crate::error::ResolveError;
use crate::models::{Job, JobStatus, JobType};
use crate::persistence::{FileJobStore, JobStore};
use crate::resolution::MarketResolver;
use crate::scheduler::{JobScheduler, SchedulerConfig};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Scripted resolver: pops one result per call for a market; repeats Ok when
/// the script runs dry. Records call instants for timing assertions.
struct ScriptedResolver {
    scripts: Mutex<HashMap<String, VecDeque<Result<(), ResolveError>>>>,
    calls: Mutex<Vec<(String, Instant)>>,
    work_duration: Duration,
}

impl ScriptedResolver {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            work_duration: Duration::ZERO,
        })
    }

    fn slow(work_duration: Duration) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            work_duration,
        })
    }

    fn script(&self, market: &str, steps: Vec<Result<(), ResolveError>>) {
        self.scripts
            .lock()
            .insert(market.to_string(), steps.into_iter().collect());
    }

    fn call_count(&self, market: &str) -> usize {
        self.calls.lock().iter().filter(|(m, _)| m == market).count()
    }
}

#[async_trait]
impl MarketResolver for ScriptedResolver {
    async fn resolve_market(
        &self,
        market_id: &str,
        _correlation_id: &CorrelationId,
    ) -> Result<(), ResolveError> {
        self.calls.lock().push((market_id.to_string(), Instant::now()));
        if !self.work_duration.is_zero() {
            tokio::time::sleep(self.work_duration).await;
        }
        self.scripts
            .lock()
            .get_mut(market_id)
            .and_then(|s| s.pop_front())
            .unwrap_or(Ok(()))
    }
}

struct Harness {
    scheduler: Arc<JobScheduler>,
    store: Arc<FileJobStore>,
    resolver: Arc<ScriptedResolver>,
    _dir: tempfile::TempDir,
}

fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        job_concurrency: 3,
        max_retries: 3,
        retry_base_delay: Duration::from_millis(30),
        debounce: Duration::from_millis(20),
        cleanup_interval: Duration::from_secs(3600),
        shutdown_grace: Duration::from_secs(2),
    }
}

fn harness_with(config: SchedulerConfig, resolver: Arc<ScriptedResolver>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(FileJobStore::new(dir.path(), clock.clone()).unwrap());
    let (shutdown, _) = broadcast::channel(4);
    let scheduler = JobScheduler::new(
        store.clone(),
        resolver.clone(),
        clock,
        config,
        shutdown,
    );
    Harness {
        scheduler,
        store,
        resolver,
        _dir: dir,
    }
}

fn harness() -> Harness {
    harness_with(fast_config(), ScriptedResolver::new())
}

async fn wait_for_status(store: &FileJobStore, job_id: &str, status: JobStatus, budget: Duration) {
    let deadline = Instant::now() + budget;
    loop {
        let job = store.get_job(job_id).unwrap();
        if let Some(job) = &job {
            if job.status == status {
                return;
            }
        }
        if Instant::now() > deadline {
            panic!("job {job_id} never reached {status:?}; current: {job:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn past_resolve_time() -> i64 {
    SystemClock.unix() - 10
}

#[tokio::test]
async fn scheduling_is_idempotent_per_market() {
    let h = harness();
    let first = h
        .scheduler
        .schedule_market_resolution("0xm1", "m1", past_resolve_time() + 3600, None)
        .unwrap();
    let second = h
        .scheduler
        .schedule_market_resolution("0xm1", "m1", past_resolve_time() + 3600, None)
        .unwrap();

    assert_eq!(first, second, "first schedule wins");
    let jobs = h.store.load_jobs().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].job_type, JobType::TimeBased);
}

#[tokio::test]
async fn past_resolve_time_runs_immediately_and_completes() {
    let h = harness();
    let id = h
        .scheduler
        .schedule_market_resolution("0xm2", "m2", past_resolve_time(), None)
        .unwrap();

    wait_for_status(&h.store, &id, JobStatus::Completed, Duration::from_secs(3)).await;
    assert_eq!(h.resolver.call_count("0xm2"), 1);

    let job = h.store.get_job(&id).unwrap().unwrap();
    assert_eq!(job.job_type, JobType::Immediate);
    assert!(job.last_error.is_none());
}

#[tokio::test]
async fn transient_failures_retry_until_success() {
    let h = harness();
    h.resolver.script(
        "0xm3",
        vec![
            Err(ResolveError::Transient("rpc timeout".into())),
            Err(ResolveError::Transient("rpc timeout".into())),
            Ok(()),
        ],
    );

    let id = h
        .scheduler
        .schedule_market_resolution("0xm3", "m3", past_resolve_time(), None)
        .unwrap();
    wait_for_status(&h.store, &id, JobStatus::Completed, Duration::from_secs(5)).await;

    assert_eq!(h.resolver.call_count("0xm3"), 3);
    let job = h.store.get_job(&id).unwrap().unwrap();
    assert_eq!(job.retry_count, 2);
    assert_eq!(job.job_type, JobType::Retry);

    // Nominal spacing doubles (30ms then 60ms), jitter adds at most 10%.
    let calls = h.resolver.calls.lock();
    let times: Vec<Instant> = calls.iter().map(|(_, t)| *t).collect();
    let first_gap = times[1] - times[0];
    let second_gap = times[2] - times[1];
    assert!(first_gap >= Duration::from_millis(30));
    assert!(second_gap >= Duration::from_millis(60));
}

#[tokio::test]
async fn permanent_failure_is_terminal_with_error_surfaced() {
    let h = harness();
    h.resolver.script(
        "0xm4",
        vec![Err(ResolveError::Permanent("commit reverted: Cutoff not reached".into()))],
    );

    let id = h
        .scheduler
        .schedule_market_resolution("0xm4", "m4", past_resolve_time(), None)
        .unwrap();
    wait_for_status(&h.store, &id, JobStatus::Failed, Duration::from_secs(3)).await;

    // No further attempts after the terminal failure.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h.resolver.call_count("0xm4"), 1);

    let job = h.store.get_job(&id).unwrap().unwrap();
    assert!(job.is_terminal());
    assert!(job.last_error.unwrap().contains("Cutoff not reached"));
}

#[tokio::test]
async fn retry_budget_is_exhausted_then_failed() {
    let h = harness();
    h.resolver.script(
        "0xm5",
        vec![
            Err(ResolveError::Transient("down".into())),
            Err(ResolveError::Transient("down".into())),
            Err(ResolveError::Transient("down".into())),
            Err(ResolveError::Transient("still down".into())),
        ],
    );

    let id = h
        .scheduler
        .schedule_market_resolution("0xm5", "m5", past_resolve_time(), None)
        .unwrap();
    wait_for_status(&h.store, &id, JobStatus::Failed, Duration::from_secs(5)).await;

    // Initial attempt + max_retries retries.
    assert_eq!(h.resolver.call_count("0xm5"), 4);
    let job = h.store.get_job(&id).unwrap().unwrap();
    assert_eq!(job.retry_count, job.max_retries);
    assert!(job.last_error.unwrap().contains("still down"));
}

#[tokio::test]
async fn already_terminal_market_counts_as_success() {
    let h = harness();
    h.resolver.script("0xm6", vec![Err(ResolveError::AlreadyTerminal)]);

    let id = h
        .scheduler
        .schedule_market_resolution("0xm6", "m6", past_resolve_time(), None)
        .unwrap();
    wait_for_status(&h.store, &id, JobStatus::Completed, Duration::from_secs(3)).await;
}

#[tokio::test]
async fn recovery_restores_all_non_terminal_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let now = clock.now();

    // Seed the store as a crashed process would have left it.
    {
        let store = FileJobStore::new(dir.path(), clock.clone()).unwrap();
        let mut executing = Job::new("0xr1", "r1", now.timestamp() - 60, JobType::TimeBased, 3, now, None);
        executing.status = JobStatus::Executing;
        store.save_job(&executing).unwrap();

        let overdue = Job::new("0xr2", "r2", now.timestamp() - 120, JobType::TimeBased, 3, now, None);
        store.save_job(&overdue).unwrap();

        let mut failed = Job::new("0xr3", "r3", now.timestamp() - 60, JobType::TimeBased, 3, now, None);
        failed.status = JobStatus::Failed;
        failed.retry_count = 1;
        failed.last_error = Some("transient".into());
        store.save_job(&failed).unwrap();

        let future = Job::new("0xr4", "r4", now.timestamp() + 3600, JobType::TimeBased, 3, now, None);
        store.save_job(&future).unwrap();

        let mut done = Job::new("0xr5", "r5", now.timestamp() - 60, JobType::TimeBased, 3, now, None);
        done.status = JobStatus::Completed;
        store.save_job(&done).unwrap();
    }

    let store = Arc::new(FileJobStore::new(dir.path(), clock.clone()).unwrap());
    let resolver = ScriptedResolver::new();
    let (shutdown, _) = broadcast::channel(4);
    let scheduler = JobScheduler::new(
        store.clone(),
        resolver.clone(),
        clock,
        fast_config(),
        shutdown,
    );
    scheduler.initialize().await.unwrap();

    // Interrupted, overdue, and failed-with-retries jobs all run.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let done = ["0xr1", "0xr2", "0xr3"]
            .iter()
            .all(|m| resolver.call_count(m) == 1);
        if done {
            break;
        }
        assert!(Instant::now() < deadline, "recovered jobs never executed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // The future job stays armed, the completed one stays untouched.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(resolver.call_count("0xr4"), 0);
    assert_eq!(resolver.call_count("0xr5"), 0);

    let jobs: HashMap<String, Job> = store
        .load_jobs()
        .unwrap()
        .into_iter()
        .map(|j| (j.market_id.clone(), j))
        .collect();
    assert_eq!(jobs["0xr1"].status, JobStatus::Completed);
    assert_eq!(jobs["0xr2"].status, JobStatus::Completed);
    assert_eq!(jobs["0xr3"].status, JobStatus::Completed);
    assert_eq!(jobs["0xr4"].status, JobStatus::Scheduled);
}

#[tokio::test]
async fn cancel_stops_pending_timer() {
    let h = harness();
    let id = h
        .scheduler
        .schedule_market_resolution("0xm7", "m7", past_resolve_time() + 3600, None)
        .unwrap();

    assert!(h.scheduler.cancel_job(&id).unwrap());
    let job = h.store.get_job(&id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.resolver.call_count("0xm7"), 0);

    // Cancelling again is a no-op.
    assert!(!h.scheduler.cancel_job(&id).unwrap());
}

#[tokio::test]
async fn cancel_races_with_execution_as_noop() {
    let resolver = ScriptedResolver::slow(Duration::from_millis(300));
    let h = harness_with(fast_config(), resolver);

    let id = h
        .scheduler
        .schedule_market_resolution("0xm8", "m8", past_resolve_time(), None)
        .unwrap();
    wait_for_status(&h.store, &id, JobStatus::Executing, Duration::from_secs(3)).await;

    assert!(!h.scheduler.cancel_job(&id).unwrap(), "executing jobs cannot be cancelled");
    wait_for_status(&h.store, &id, JobStatus::Completed, Duration::from_secs(3)).await;
}

#[tokio::test]
async fn manual_trigger_fires_scheduled_job_now() {
    let h = harness();
    let id = h
        .scheduler
        .schedule_market_resolution("0xm9", "m9", past_resolve_time() + 3600, None)
        .unwrap();

    let triggered = h.scheduler.trigger_market_now("0xm9").unwrap();
    assert_eq!(triggered.as_deref(), Some(id.as_str()));
    wait_for_status(&h.store, &id, JobStatus::Completed, Duration::from_secs(3)).await;

    assert!(h.scheduler.trigger_market_now("0xunknown").unwrap().is_none());
}

#[tokio::test]
async fn destroy_waits_for_inflight_then_leaves_stragglers_executing() {
    // Fast job drains within the grace period.
    {
        let resolver = ScriptedResolver::slow(Duration::from_millis(150));
        let h = harness_with(fast_config(), resolver);
        let id = h
            .scheduler
            .schedule_market_resolution("0xs1", "s1", past_resolve_time(), None)
            .unwrap();
        wait_for_status(&h.store, &id, JobStatus::Executing, Duration::from_secs(3)).await;
        h.scheduler.destroy().await;
        let job = h.store.get_job(&id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }

    // Slow job outlives a tiny grace period and stays EXECUTING for recovery.
    {
        let mut config = fast_config();
        config.shutdown_grace = Duration::from_millis(100);
        let resolver = ScriptedResolver::slow(Duration::from_secs(30));
        let h = harness_with(config, resolver);
        let id = h
            .scheduler
            .schedule_market_resolution("0xs2", "s2", past_resolve_time(), None)
            .unwrap();
        wait_for_status(&h.store, &id, JobStatus::Executing, Duration::from_secs(3)).await;
        h.scheduler.destroy().await;
        let job = h.store.get_job(&id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Executing, "recovered on next start");
    }
}
