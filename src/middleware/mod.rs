//! HTTP middleware: request logging with correlation ids, and per-IP rate
//! limiting on the mutating control-plane endpoints.

pub mod logging;
pub mod rate_limit;

pub use logging::request_logging;
pub use rate_limit::{RateLimiter, RateLimiterConfig};
