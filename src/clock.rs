//! Time and correlation-id plumbing.
//!
//! Components take an `Arc<dyn Clock>` so tests can pin or advance time
//! without sleeping. Correlation ids thread through every log line and
//! persistence record touched by one market's resolution.

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::time::Instant;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Unix seconds.
    fn unix(&self) -> i64 {
        self.now().timestamp()
    }
}

/// Production clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Test clock with an explicitly advanced wall time.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn at(unix_secs: i64) -> Self {
        Self {
            now: Mutex::new(Utc.timestamp_opt(unix_secs, 0).single().expect("valid ts")),
        }
    }

    pub fn advance_secs(&self, secs: i64) {
        let mut now = self.now.lock();
        *now = *now + chrono::Duration::seconds(secs);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Monotonic milliseconds since process start, for latency measurement.
#[inline]
pub fn monotonic_ms() -> u64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_millis() as u64
}

/// Short opaque id threaded through all logs and operations for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new() -> Self {
        let full = uuid::Uuid::new_v4().simple().to_string();
        Self(full[..12].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for CorrelationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::at(1_700_000_000);
        assert_eq!(clock.unix(), 1_700_000_000);
        clock.advance_secs(90);
        assert_eq!(clock.unix(), 1_700_000_090);
    }

    #[test]
    fn correlation_ids_are_short_and_unique() {
        let a = CorrelationId::new();
        let b = CorrelationId::new();
        assert_eq!(a.as_str().len(), 12);
        assert_ne!(a, b);
    }
}
