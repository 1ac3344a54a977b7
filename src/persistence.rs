//! Durable job storage.
//!
//! The store owns a single JSON file (`scheduled-jobs.json`) holding every job
//! record. Writes go to a temp file in the same directory and are renamed into
//! place, so a crash leaves either the old state or the new state, never a
//! torn file. Callers are serialized by the store's internal lock; no external
//! locking is required.
//!
//! The trait exists so a deployment can swap in an embedded KV store or a
//! relational table keyed by job id without touching the scheduler.

use crate::clock::Clock;
use crate::models::{Job, JobStatus, JobType};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

pub const JOBS_FILE: &str = "scheduled-jobs.json";

/// Default retention for terminal jobs before cleanup removes them.
pub const RETENTION_DAYS: i64 = 7;

/// Partial update applied by `update_job`. Unset fields are left untouched.
#[derive(Debug, Default, Clone)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub job_type: Option<JobType>,
    pub retry_count: Option<u32>,
    /// `Some(None)` clears the error, `Some(Some(_))` replaces it.
    pub last_error: Option<Option<String>>,
    pub correlation_id: Option<String>,
}

impl JobPatch {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_type(mut self, job_type: JobType) -> Self {
        self.job_type = Some(job_type);
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(Some(error.into()));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.last_error = Some(None);
        self
    }
}

pub trait JobStore: Send + Sync {
    /// Upsert by id.
    fn save_job(&self, job: &Job) -> Result<()>;

    /// Apply a partial update and advance `updated_at`. Fails when the job is
    /// unknown, or when the patch would move a terminal job to another status.
    fn update_job(&self, id: &str, patch: JobPatch) -> Result<Job>;

    /// Returns whether a record was removed.
    fn delete_job(&self, id: &str) -> Result<bool>;

    /// All persisted jobs, order unspecified.
    fn load_jobs(&self) -> Result<Vec<Job>>;

    /// Drop terminal jobs whose `updated_at` is older than the retention
    /// window. Returns the number removed.
    fn cleanup(&self, retention: chrono::Duration) -> Result<usize>;

    fn get_job(&self, id: &str) -> Result<Option<Job>> {
        Ok(self.load_jobs()?.into_iter().find(|j| j.id == id))
    }

    /// The non-terminal job for a market, if one exists. The scheduler keeps
    /// at most one.
    fn active_job_for_market(&self, market_id: &str) -> Result<Option<Job>> {
        Ok(self
            .load_jobs()?
            .into_iter()
            .find(|j| j.market_id == market_id && !j.is_terminal()))
    }
}

/// File-backed store. Adequate for the runner's write rate (order of market
/// events) and working set (hundreds to low thousands of open jobs).
pub struct FileJobStore {
    path: PathBuf,
    jobs: Mutex<HashMap<String, Job>>,
    clock: Arc<dyn Clock>,
}

impl FileJobStore {
    pub fn new(dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating persistence dir {}", dir.display()))?;
        let path = dir.join(JOBS_FILE);

        let jobs = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<Vec<Job>>(&bytes) {
                Ok(list) => {
                    info!(count = list.len(), path = %path.display(), "💾 loaded persisted jobs");
                    list.into_iter().map(|j| (j.id.clone(), j)).collect()
                }
                Err(e) => {
                    // Keep the unreadable file for the operator instead of
                    // overwriting the only copy.
                    let quarantine = path.with_extension("json.corrupt");
                    warn!(error = %e, quarantined = %quarantine.display(),
                        "job file unreadable, starting empty");
                    let _ = fs::rename(&path, &quarantine);
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e).context("reading job file"),
        };

        Ok(Self {
            path,
            jobs: Mutex::new(jobs),
            clock,
        })
    }

    /// Serialize the full map and atomically replace the file.
    fn persist(&self, jobs: &HashMap<String, Job>) -> Result<()> {
        let mut list: Vec<&Job> = jobs.values().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)
                .with_context(|| format!("creating {}", tmp.display()))?;
            let bytes = serde_json::to_vec_pretty(&list)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }
}

impl JobStore for FileJobStore {
    fn save_job(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.lock();
        jobs.insert(job.id.clone(), job.clone());
        self.persist(&jobs)
    }

    fn update_job(&self, id: &str, patch: JobPatch) -> Result<Job> {
        let mut jobs = self.jobs.lock();
        let job = jobs
            .get_mut(id)
            .with_context(|| format!("unknown job {id}"))?;

        if job.is_terminal() {
            if let Some(status) = patch.status {
                if status != job.status {
                    anyhow::bail!(
                        "job {id} is terminal ({:?}), refusing transition to {:?}",
                        job.status,
                        status
                    );
                }
            }
        }

        if let Some(status) = patch.status {
            job.status = status;
        }
        if let Some(job_type) = patch.job_type {
            job.job_type = job_type;
        }
        if let Some(retry_count) = patch.retry_count {
            job.retry_count = retry_count;
        }
        if let Some(last_error) = patch.last_error {
            job.last_error = last_error;
        }
        if let Some(correlation_id) = patch.correlation_id {
            job.correlation_id = Some(correlation_id);
        }

        // updated_at never goes backwards even if the wall clock does.
        let now = self.clock.now();
        job.updated_at = job.updated_at.max(now);

        let updated = job.clone();
        self.persist(&jobs)?;
        Ok(updated)
    }

    fn delete_job(&self, id: &str) -> Result<bool> {
        let mut jobs = self.jobs.lock();
        let removed = jobs.remove(id).is_some();
        if removed {
            self.persist(&jobs)?;
        }
        Ok(removed)
    }

    fn load_jobs(&self) -> Result<Vec<Job>> {
        Ok(self.jobs.lock().values().cloned().collect())
    }

    fn cleanup(&self, retention: chrono::Duration) -> Result<usize> {
        let cutoff = self.clock.now() - retention;
        let mut jobs = self.jobs.lock();
        let before = jobs.len();
        jobs.retain(|_, j| !(j.is_terminal() && j.updated_at < cutoff));
        let removed = before - jobs.len();
        if removed > 0 {
            self.persist(&jobs)?;
            info!(removed, "cleaned up terminal jobs past retention");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::JobType;

    fn store_at(dir: &std::path::Path, unix: i64) -> (FileJobStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at(unix));
        let store = FileJobStore::new(dir, clock.clone()).unwrap();
        (store, clock)
    }

    fn sample_job(clock: &ManualClock, market: &str) -> Job {
        Job::new(market, "test market", 1_700_000_100, JobType::TimeBased, 3, clock.now(), None)
    }

    #[test]
    fn saves_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let (store, clock) = store_at(dir.path(), 1_700_000_000);
        let job = sample_job(&clock, "0xaaa");
        store.save_job(&job).unwrap();

        let (reopened, _) = store_at(dir.path(), 1_700_000_500);
        let jobs = reopened.load_jobs().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, job.id);
        // No temp file left behind after a clean write.
        assert!(!dir.path().join("scheduled-jobs.json.tmp").exists());
    }

    #[test]
    fn update_advances_updated_at_and_applies_patch() {
        let dir = tempfile::tempdir().unwrap();
        let (store, clock) = store_at(dir.path(), 1_700_000_000);
        let job = sample_job(&clock, "0xbbb");
        store.save_job(&job).unwrap();

        clock.advance_secs(30);
        let updated = store
            .update_job(
                &job.id,
                JobPatch::status(JobStatus::Executing).with_error("boom"),
            )
            .unwrap();
        assert_eq!(updated.status, JobStatus::Executing);
        assert_eq!(updated.last_error.as_deref(), Some("boom"));
        assert!(updated.updated_at > job.updated_at);
    }

    #[test]
    fn terminal_jobs_refuse_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let (store, clock) = store_at(dir.path(), 1_700_000_000);
        let job = sample_job(&clock, "0xccc");
        store.save_job(&job).unwrap();
        store
            .update_job(&job.id, JobPatch::status(JobStatus::Completed))
            .unwrap();

        let err = store
            .update_job(&job.id, JobPatch::status(JobStatus::Scheduled))
            .unwrap_err();
        assert!(err.to_string().contains("terminal"));
    }

    #[test]
    fn cleanup_removes_only_old_terminal_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let (store, clock) = store_at(dir.path(), 1_700_000_000);

        let done = sample_job(&clock, "0xd01");
        store.save_job(&done).unwrap();
        store
            .update_job(&done.id, JobPatch::status(JobStatus::Completed))
            .unwrap();

        let open = sample_job(&clock, "0xd02");
        store.save_job(&open).unwrap();

        // Eight days later only the terminal job is past retention.
        clock.advance_secs(8 * 24 * 3600);
        let removed = store.cleanup(chrono::Duration::days(RETENTION_DAYS)).unwrap();
        assert_eq!(removed, 1);

        let remaining = store.load_jobs().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, open.id);
    }

    #[test]
    fn active_job_lookup_skips_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let (store, clock) = store_at(dir.path(), 1_700_000_000);

        let job = sample_job(&clock, "0xeee");
        store.save_job(&job).unwrap();
        assert!(store.active_job_for_market("0xeee").unwrap().is_some());

        store
            .update_job(&job.id, JobPatch::status(JobStatus::Cancelled))
            .unwrap();
        assert!(store.active_job_for_market("0xeee").unwrap().is_none());
    }
}
