//! Bounded work queue for resolution jobs.
//!
//! Two limits: a fixed concurrency (semaphore) and a per-second cap on job
//! starts at twice the concurrency, so a burst of timers firing together
//! cannot stampede the fetchers or the RPC endpoint.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use serde::Serialize;
use tokio::sync::Semaphore;

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub concurrency: usize,
    pub running: usize,
    pub pending: usize,
}

pub struct JobQueue {
    semaphore: Arc<Semaphore>,
    concurrency: usize,
    starts_per_sec: usize,
    recent_starts: Mutex<VecDeque<Instant>>,
    running: AtomicUsize,
    pending: AtomicUsize,
    closed: AtomicBool,
}

impl JobQueue {
    pub fn new(concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            starts_per_sec: concurrency * 2,
            recent_starts: Mutex::new(VecDeque::new()),
            running: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Run one unit of work under both limits. Returns `None` when the queue
    /// was closed before the work could start; the caller's persisted state
    /// is untouched and recovery picks the job up later.
    pub async fn run<T>(&self, work: impl Future<Output = T>) -> Option<T> {
        self.pending.fetch_add(1, Ordering::SeqCst);
        let permit = self.semaphore.acquire().await;
        self.pending.fetch_sub(1, Ordering::SeqCst);
        let _permit = match permit {
            Ok(p) => p,
            Err(_) => return None,
        };

        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        self.wait_start_slot().await;
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }

        self.running.fetch_add(1, Ordering::SeqCst);
        let out = work.await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        Some(out)
    }

    /// Sliding one-second window over job starts.
    async fn wait_start_slot(&self) {
        loop {
            let wait = {
                let mut recent = self.recent_starts.lock();
                let now = Instant::now();
                while recent
                    .front()
                    .is_some_and(|t| now.duration_since(*t) >= Duration::from_secs(1))
                {
                    recent.pop_front();
                }
                if recent.len() < self.starts_per_sec {
                    recent.push_back(now);
                    None
                } else {
                    recent
                        .front()
                        .map(|t| (*t + Duration::from_secs(1)).saturating_duration_since(now))
                }
            };

            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d.max(Duration::from_millis(10))).await,
            }
        }
    }

    /// Stop admitting new work. Queued-but-unstarted items resolve to `None`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.semaphore.close();
    }

    /// Wait until in-flight work drains, up to `grace`. Returns whether the
    /// queue went idle in time.
    pub async fn wait_idle(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            if self.running.load(Ordering::SeqCst) == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            concurrency: self.concurrency,
            running: self.running.load(Ordering::SeqCst),
            pending: self.pending.load(Ordering::SeqCst),
        }
    }
}
