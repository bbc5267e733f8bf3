//! Retry policy with configurable backoff and jitter.
//!
//! Provides configurable retry behavior for network operations with:
//! - None, fixed, exponential or linear backoff, capped at a maximum delay
//! - Optional additive jitter to prevent thundering herd
//! - Retry predicates matching on `ErrorKind`
//! - Running statistics shared by every caller of the policy

use crate::cancel::CancellationToken;
use crate::config::{duration_secs, ResilienceConfig};
use crate::error::{OpError, OpResult};
use crate::lock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Decides whether a failure is retried. Receives the error and the 1-based
/// number of the retry about to happen.
pub type RetryPredicate = Arc<dyn Fn(&OpError, u32) -> bool + Send + Sync>;

/// How the delay grows between retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Retry immediately.
    None,
    /// Always wait `base_delay`.
    Fixed,
    /// Wait `base_delay * 2^(attempt-1)`.
    Exponential,
    /// Wait `base_delay * attempt`.
    Linear,
}

/// Configuration for retry behavior.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicyConfig {
    /// Retries allowed after the initial attempt.
    pub max_attempts: u32,
    #[serde(with = "duration_secs")]
    pub base_delay: Duration,
    /// Cap applied before jitter.
    #[serde(with = "duration_secs")]
    pub max_delay: Duration,
    pub strategy: RetryStrategy,
    pub jitter: bool,
    #[serde(with = "duration_secs")]
    pub jitter_max: Duration,
    pub enable_logging: bool,
    pub name: String,
    /// Without a predicate every failure except cancellation is retried.
    #[serde(skip)]
    pub should_retry: Option<RetryPredicate>,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_attempts: ResilienceConfig::RETRY_MAX_ATTEMPTS,
            base_delay: ResilienceConfig::RETRY_BASE_DELAY,
            max_delay: ResilienceConfig::RETRY_MAX_DELAY,
            strategy: RetryStrategy::Exponential,
            jitter: true,
            jitter_max: ResilienceConfig::RETRY_JITTER_MAX,
            enable_logging: true,
            name: "RetryPolicy".to_string(),
            should_retry: None,
        }
    }
}

impl std::fmt::Debug for RetryPolicyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicyConfig")
            .field("name", &self.name)
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("strategy", &self.strategy)
            .field("jitter", &self.jitter)
            .field("jitter_max", &self.jitter_max)
            .field("should_retry", &self.should_retry.is_some())
            .finish()
    }
}

impl RetryPolicyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the number of retries after the initial attempt.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_jitter_max(mut self, jitter_max: Duration) -> Self {
        self.jitter_max = jitter_max;
        self
    }

    pub fn with_logging(mut self, enabled: bool) -> Self {
        self.enable_logging = enabled;
        self
    }

    pub fn with_predicate(mut self, predicate: RetryPredicate) -> Self {
        self.should_retry = Some(predicate);
        self
    }
}

/// Running statistics of a retry policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetryStats {
    pub total_operations: u64,
    pub immediate_successes: u64,
    pub success_after_retry: u64,
    pub total_failures: u64,
    pub total_retry_attempts: u64,
}

impl RetryStats {
    /// Percentage of operations that eventually succeeded.
    pub fn success_rate(&self) -> f64 {
        if self.total_operations == 0 {
            return 0.0;
        }
        (self.immediate_successes + self.success_after_retry) as f64 / self.total_operations as f64
            * 100.0
    }

    pub fn summary(&self) -> String {
        format!(
            "Total: {} | Immediate Success: {} | Success After Retry: {} | Failures: {} | Retry Attempts: {} | Success Rate: {:.1}%",
            self.total_operations,
            self.immediate_successes,
            self.success_after_retry,
            self.total_failures,
            self.total_retry_attempts,
            self.success_rate()
        )
    }
}

/// Re-invokes failed operations according to its config.
///
/// One policy is usually shared by every request to an endpoint, so the
/// statistics aggregate across callers.
#[derive(Debug)]
pub struct RetryPolicy {
    config: RetryPolicyConfig,
    stats: Mutex<RetryStats>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryPolicyConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(config: RetryPolicyConfig) -> Self {
        Self {
            config,
            stats: Mutex::new(RetryStats::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &RetryPolicyConfig {
        &self.config
    }

    pub fn stats(&self) -> RetryStats {
        lock(&self.stats).clone()
    }

    pub fn reset_stats(&self) {
        *lock(&self.stats) = RetryStats::default();
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base = self.config.base_delay.as_secs_f64();
        let delay_secs = match self.config.strategy {
            RetryStrategy::None => 0.0,
            RetryStrategy::Fixed => base,
            RetryStrategy::Exponential => base * 2f64.powi(attempt.saturating_sub(1).min(62) as i32),
            RetryStrategy::Linear => base * f64::from(attempt),
        };
        let capped_secs = delay_secs.min(self.config.max_delay.as_secs_f64());

        let final_secs = if self.config.jitter && !self.config.jitter_max.is_zero() {
            let mut rng = rand::rng();
            capped_secs + rng.random_range(0.0..self.config.jitter_max.as_secs_f64())
        } else {
            capped_secs
        };

        Duration::try_from_secs_f64(final_secs).unwrap_or(self.config.max_delay)
    }

    /// Run `operation`, retrying failures per the policy.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> OpResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = OpResult<T>>,
    {
        self.run(operation, None).await
    }

    /// Like [`execute`](Self::execute), but a cancelled `token` also ends the
    /// backoff wait.
    pub async fn execute_with_cancellation<T, F, Fut>(
        &self,
        token: &CancellationToken,
        operation: F,
    ) -> OpResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = OpResult<T>>,
    {
        self.run(operation, Some(token)).await
    }

    async fn run<T, F, Fut>(&self, mut operation: F, token: Option<&CancellationToken>) -> OpResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = OpResult<T>>,
    {
        let max_attempts = self.config.max_attempts;
        let mut attempt = 0u32;

        loop {
            let error = match operation().await {
                Ok(value) => {
                    self.record_success(attempt);
                    if attempt > 0 && self.config.enable_logging {
                        debug!("{}: operation succeeded after {} retries", self.name(), attempt);
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            attempt += 1;

            if error.is_cancelled() {
                self.record_failure(attempt - 1);
                return Err(error);
            }

            if attempt > max_attempts {
                self.record_failure(attempt - 1);
                if self.config.enable_logging {
                    error!(
                        "{}: retry exhausted all {} attempts: {}",
                        self.name(),
                        attempt,
                        error
                    );
                }
                return Err(error
                    .with_context(format!("retry exhausted after {} attempts", attempt))
                    .with_metadata("attempts", attempt));
            }

            if let Some(predicate) = &self.config.should_retry {
                if !predicate(&error, attempt) {
                    self.record_failure(attempt - 1);
                    if self.config.enable_logging {
                        debug!("{}: error is not retryable: {}", self.name(), error);
                    }
                    return Err(error);
                }
            }

            let delay = self.calculate_delay(attempt);
            if self.config.enable_logging {
                warn!(
                    "{}: attempt {}/{} failed: {}. Retrying in {:?}",
                    self.name(),
                    attempt,
                    max_attempts,
                    error,
                    delay
                );
            }

            match token {
                Some(token) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = token.cancelled() => {
                            self.record_failure(attempt - 1);
                            return Err(OpError::cancelled("Retry cancelled"));
                        }
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
        }
    }

    fn record_success(&self, retries: u32) {
        let mut stats = lock(&self.stats);
        stats.total_operations += 1;
        if retries == 0 {
            stats.immediate_successes += 1;
        } else {
            stats.success_after_retry += 1;
            stats.total_retry_attempts += u64::from(retries);
        }
    }

    fn record_failure(&self, retries: u32) {
        let mut stats = lock(&self.stats);
        stats.total_operations += 1;
        stats.total_failures += 1;
        stats.total_retry_attempts += u64::from(retries);
    }
}

/// Built-in retry predicates.
pub mod predicates {
    use super::RetryPredicate;
    use crate::error::ErrorKind;
    use std::sync::Arc;

    /// Retry DNS, connection and transfer failures.
    pub fn only_network_errors() -> RetryPredicate {
        Arc::new(|error, _| error.kind == ErrorKind::Network)
    }

    /// Retry wall-clock and iteration-budget timeouts.
    pub fn only_timeout_errors() -> RetryPredicate {
        Arc::new(|error, _| error.kind == ErrorKind::Timeout)
    }

    /// Retry network failures, timeouts, 5xx, 408 and 429 responses.
    pub fn only_transient_errors() -> RetryPredicate {
        Arc::new(|error, _| error.is_transient())
    }

    pub fn never_retry() -> RetryPredicate {
        Arc::new(|_, _| false)
    }

    pub fn always_retry() -> RetryPredicate {
        Arc::new(|_, _| true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationTokenSource;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn fast_config() -> RetryPolicyConfig {
        RetryPolicyConfig::new()
            .with_base_delay(Duration::from_millis(5))
            .with_jitter(false)
    }

    #[test]
    fn test_delay_by_strategy() {
        let policy = |strategy| {
            RetryPolicy::new(
                RetryPolicyConfig::new()
                    .with_base_delay(Duration::from_secs(2))
                    .with_max_delay(Duration::from_secs(30))
                    .with_strategy(strategy)
                    .with_jitter(false),
            )
        };

        assert_eq!(policy(RetryStrategy::None).calculate_delay(3), Duration::ZERO);
        assert_eq!(policy(RetryStrategy::Fixed).calculate_delay(3), Duration::from_secs(2));
        assert_eq!(policy(RetryStrategy::Linear).calculate_delay(3), Duration::from_secs(6));

        let exponential = policy(RetryStrategy::Exponential);
        assert_eq!(exponential.calculate_delay(1), Duration::from_secs(2));
        assert_eq!(exponential.calculate_delay(2), Duration::from_secs(4));
        assert_eq!(exponential.calculate_delay(3), Duration::from_secs(8));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let policy = RetryPolicy::new(
            RetryPolicyConfig::new()
                .with_base_delay(Duration::from_secs(1))
                .with_max_delay(Duration::from_secs(10))
                .with_jitter(false),
        );

        // 1 * 2^4 = 16s, capped at 10s
        assert_eq!(policy.calculate_delay(5), Duration::from_secs(10));
    }

    #[test]
    fn test_delay_with_unbounded_max() {
        let policy = RetryPolicy::new(
            RetryPolicyConfig::new()
                .with_base_delay(Duration::from_secs(10))
                .with_max_delay(Duration::MAX)
                .with_strategy(RetryStrategy::Exponential)
                .with_jitter(false),
        );

        assert_eq!(policy.calculate_delay(3), Duration::from_secs(40));
        assert_eq!(policy.calculate_delay(64), Duration::MAX);
    }

    #[test]
    fn test_delay_with_jitter() {
        let policy = RetryPolicy::new(
            RetryPolicyConfig::new()
                .with_base_delay(Duration::from_secs(2))
                .with_jitter(true)
                .with_jitter_max(Duration::from_secs(1)),
        );

        for _ in 0..20 {
            let delay = policy.calculate_delay(1);
            assert!(
                delay >= Duration::from_secs(2) && delay <= Duration::from_secs(3),
                "Delay {:?} should be between 2s and 3s",
                delay
            );
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_first_try() {
        let policy = RetryPolicy::new(fast_config());
        let result = policy.execute(|| async { Ok::<_, OpError>(42) }).await;

        assert_eq!(result, Ok(42));
        let stats = policy.stats();
        assert_eq!(stats.immediate_successes, 1);
        assert_eq!(stats.total_operations, 1);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let policy = RetryPolicy::new(fast_config().with_max_attempts(3));
        let counter = Arc::new(AtomicU32::new(0));

        let result = policy
            .execute(|| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(OpError::network("temporary failure"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(42));
        let stats = policy.stats();
        assert_eq!(stats.success_after_retry, 1);
        assert_eq!(stats.total_retry_attempts, 2);
    }

    #[tokio::test]
    async fn test_retry_exhausted() {
        let policy = RetryPolicy::new(fast_config().with_max_attempts(2));
        let counter = Arc::new(AtomicU32::new(0));

        let result: OpResult<()> = policy
            .execute(|| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(OpError::http_status(503, "HTTP error 503")) }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(err.kind, ErrorKind::HttpStatus(503));
        assert_eq!(err.message, "HTTP error 503");
        assert_eq!(err.metadata.get("attempts").map(String::as_str), Some("3"));

        let stats = policy.stats();
        assert_eq!(stats.total_failures, 1);
        assert_eq!(stats.total_retry_attempts, 2);
    }

    #[tokio::test]
    async fn test_predicate_short_circuits() {
        let policy = RetryPolicy::new(
            RetryPolicyConfig::new()
                .with_max_attempts(5)
                .with_base_delay(Duration::from_secs(10))
                .with_predicate(predicates::never_retry()),
        );
        let counter = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let result: OpResult<()> = policy
            .execute(|| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(OpError::network("down")) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(policy.stats().total_failures, 1);
    }

    #[tokio::test]
    async fn test_cancelled_errors_are_not_retried() {
        let policy = RetryPolicy::new(fast_config().with_predicate(predicates::always_retry()));
        let counter = Arc::new(AtomicU32::new(0));

        let result: OpResult<()> = policy
            .execute(|| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(OpError::cancelled("HTTP request cancelled")) }
            })
            .await;

        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_ends_backoff() {
        let policy = RetryPolicy::new(
            RetryPolicyConfig::new()
                .with_base_delay(Duration::from_secs(30))
                .with_jitter(false),
        );
        let source = CancellationTokenSource::new();
        let token = source.token();

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            source.cancel();
        });

        let started = Instant::now();
        let result: OpResult<()> = policy
            .execute_with_cancellation(&token, || async { Err(OpError::timeout("slow")) })
            .await;
        canceller.await.unwrap();

        assert_eq!(result.unwrap_err().message, "Retry cancelled");
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_predicates_match_kinds() {
        let network = OpError::network("connection refused");
        let timeout = OpError::timeout("timed out");
        let server = OpError::http_status(502, "HTTP error 502");
        let client = OpError::http_status(404, "HTTP error 404");

        assert!(predicates::only_network_errors()(&network, 1));
        assert!(!predicates::only_network_errors()(&timeout, 1));
        assert!(predicates::only_timeout_errors()(&timeout, 1));

        let transient = predicates::only_transient_errors();
        assert!(transient(&network, 1));
        assert!(transient(&timeout, 1));
        assert!(transient(&server, 1));
        assert!(!transient(&client, 1));
    }

    #[test]
    fn test_stats_summary() {
        let stats = RetryStats {
            total_operations: 4,
            immediate_successes: 2,
            success_after_retry: 1,
            total_failures: 1,
            total_retry_attempts: 3,
        };
        assert_eq!(stats.success_rate(), 75.0);
        assert_eq!(
            stats.summary(),
            "Total: 4 | Immediate Success: 2 | Success After Retry: 1 | Failures: 1 | Retry Attempts: 3 | Success Rate: 75.0%"
        );
    }

    #[test]
    fn test_config_from_json() {
        let config: RetryPolicyConfig = serde_json::from_str(
            r#"{"max_attempts": 4, "base_delay": 0.5, "strategy": "linear", "jitter": false}"#,
        )
        .unwrap();

        assert_eq!(config.max_attempts, 4);
        assert_eq!(config.base_delay, Duration::from_millis(500));
        assert_eq!(config.strategy, RetryStrategy::Linear);
        assert_eq!(config.max_delay, ResilienceConfig::RETRY_MAX_DELAY);
        assert!(config.should_retry.is_none());
    }
}
