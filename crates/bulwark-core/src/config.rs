//! Centralized configuration for Bulwark.
//!
//! This module provides timing constants for async operations, HTTP request
//! defaults, and the default thresholds used by circuit breakers and retry
//! policies.

use std::time::Duration;

/// Async operation timing.
pub struct AsyncConfig;

impl AsyncConfig {
    /// Watchdog tick for wait loops; bounds cancellation latency.
    pub const POLL_INTERVAL: Duration = Duration::from_millis(10);
    /// Upper bound on `AsyncOperation::result()` waits.
    pub const RESULT_WAIT_TIMEOUT: Duration = Duration::from_secs(60);
    /// How often combinators publish fractional progress.
    pub const PROGRESS_TICK: Duration = Duration::from_millis(100);
    /// Cap on the backoff between `with_retry` attempts.
    pub const WITH_RETRY_MAX_BACKOFF: Duration = Duration::from_secs(10);
    pub const COMPLETION_THREAD_NAME: &'static str = "bulwark-completion";
}

/// HTTP request defaults.
pub struct HttpConfig;

impl HttpConfig {
    pub const DEFAULT_VERB: &'static str = "GET";
    pub const DEFAULT_CONTENT_TYPE: &'static str = "application/json";
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
    /// Watchdog ticks allowed per second of request timeout.
    pub const ITERATIONS_PER_SECOND: u64 = 100;
    /// Watchdog ticks allowed when the request has no timeout.
    pub const FALLBACK_MAX_ITERATIONS: u64 = 3000;
    pub const USER_AGENT: &'static str = concat!("bulwark/", env!("CARGO_PKG_VERSION"));
}

/// Default thresholds for circuit breakers and retry policies.
pub struct ResilienceConfig;

impl ResilienceConfig {
    pub const CIRCUIT_FAILURE_THRESHOLD: u32 = 5;
    pub const CIRCUIT_SUCCESS_THRESHOLD: u32 = 2;
    pub const CIRCUIT_OPEN_TIMEOUT: Duration = Duration::from_secs(30);
    pub const CIRCUIT_HALF_OPEN_MAX_REQUESTS: u32 = 1;

    pub const RETRY_MAX_ATTEMPTS: u32 = 3;
    pub const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
    pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(30);
    pub const RETRY_JITTER_MAX: Duration = Duration::from_secs(1);
}

/// Serde helper writing a `Duration` as fractional seconds.
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
