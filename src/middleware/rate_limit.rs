//! Per-IP rate limiting for the mutating control-plane endpoints (webhook,
//! manual resolve, cancel). Sliding window with a small burst allowance;
//! read-only endpoints are left unthrottled.

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub max_requests: u32,
    pub window: Duration,
    /// Requests tolerated above the limit before hard rejection.
    pub burst: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_requests: 30,
            window: Duration::from_secs(60),
            burst: 10,
        }
    }
}

struct WindowEntry {
    count: u32,
    window_start: Instant,
}

pub struct RateLimiter {
    config: RateLimiterConfig,
    windows: Mutex<HashMap<IpAddr, WindowEntry>>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            windows: Mutex::new(HashMap::new()),
        })
    }

    /// Ok, or the duration after which the caller may retry.
    fn check(&self, ip: IpAddr) -> Result<(), Duration> {
        let mut windows = self.windows.lock();
        let now = Instant::now();
        let entry = windows.entry(ip).or_insert(WindowEntry {
            count: 0,
            window_start: now,
        });

        if now.duration_since(entry.window_start) >= self.config.window {
            entry.count = 0;
            entry.window_start = now;
        }
        entry.count += 1;

        if entry.count > self.config.max_requests + self.config.burst {
            let reset_at = entry.window_start + self.config.window;
            Err(reset_at.saturating_duration_since(now))
        } else {
            Ok(())
        }
    }

    /// Drop windows idle for two full periods. Called from a background loop.
    pub fn evict_idle(&self) {
        let window = self.config.window;
        let now = Instant::now();
        self.windows
            .lock()
            .retain(|_, e| now.duration_since(e.window_start) < window * 2);
    }

    /// Periodic eviction so one-off callers do not accumulate forever.
    pub fn spawn_eviction_loop(
        self: &Arc<Self>,
        mut shutdown: tokio::sync::broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(limiter.config.window);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => limiter.evict_idle(),
                    _ = shutdown.recv() => break,
                }
            }
        })
    }
}

pub async fn rate_limit(
    State(limiter): State<Arc<RateLimiter>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
    next: Next,
) -> Response {
    match limiter.check(addr.ip()) {
        Ok(()) => next.run(request).await,
        Err(retry_after) => {
            warn!(client_ip = %addr.ip(), path = request.uri().path(), "rate limit exceeded");
            let retry_secs = retry_after.as_secs().max(1).to_string();
            (
                StatusCode::TOO_MANY_REQUESTS,
                [("retry-after", retry_secs)],
                "rate limit exceeded\n",
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_within_limit_and_burst_then_rejects() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            max_requests: 2,
            window: Duration::from_secs(60),
            burst: 1,
        });
        let ip: IpAddr = "10.0.0.1".parse().unwrap();

        assert!(limiter.check(ip).is_ok());
        assert!(limiter.check(ip).is_ok());
        assert!(limiter.check(ip).is_ok(), "burst request allowed");
        assert!(limiter.check(ip).is_err());

        // A different caller has its own window.
        let other: IpAddr = "10.0.0.2".parse().unwrap();
        assert!(limiter.check(other).is_ok());
    }

    #[test]
    fn eviction_drops_idle_windows() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            max_requests: 1,
            window: Duration::from_millis(1),
            burst: 0,
        });
        let ip: IpAddr = "10.0.0.3".parse().unwrap();
        let _ = limiter.check(ip);

        std::thread::sleep(Duration::from_millis(5));
        limiter.evict_idle();
        assert!(limiter.windows.lock().is_empty());
    }
}
