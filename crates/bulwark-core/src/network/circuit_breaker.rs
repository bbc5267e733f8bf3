//! Circuit breaker pattern for network resilience.
//!
//! Implements the circuit breaker pattern to prevent cascading failures:
//! - CLOSED: Normal operation, requests flow through
//! - OPEN: Failing, requests are rejected immediately
//! - HALF_OPEN: Testing recovery, a limited number of probes allowed
//!
//! The OPEN to HALF_OPEN transition is evaluated lazily, on the next
//! `execute` after the open timeout has elapsed.

use super::registry::{self, Entries};
use crate::config::{duration_secs, ResilienceConfig};
use crate::error::{OpError, OpResult};
use crate::lock;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Mutex, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    /// Normal operation - requests flow through.
    Closed,
    /// Failing - requests are rejected immediately.
    Open,
    /// Testing recovery - limited requests allowed.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Registry key and log prefix.
    pub name: String,
    /// Consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// Consecutive probe successes before closing from half-open.
    pub success_threshold: u32,
    /// Time to stay open before admitting probes.
    #[serde(with = "duration_secs")]
    pub open_timeout: Duration,
    /// Maximum number of concurrent probes in half-open state.
    pub half_open_max_requests: u32,
    pub enable_logging: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "CircuitBreaker".to_string(),
            failure_threshold: ResilienceConfig::CIRCUIT_FAILURE_THRESHOLD,
            success_threshold: ResilienceConfig::CIRCUIT_SUCCESS_THRESHOLD,
            open_timeout: ResilienceConfig::CIRCUIT_OPEN_TIMEOUT,
            half_open_max_requests: ResilienceConfig::CIRCUIT_HALF_OPEN_MAX_REQUESTS,
            enable_logging: true,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    pub fn with_half_open_max_requests(mut self, max: u32) -> Self {
        self.half_open_max_requests = max;
        self
    }

    pub fn with_logging(mut self, enabled: bool) -> Self {
        self.enable_logging = enabled;
        self
    }
}

/// Statistics about a circuit breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub total_successes: u64,
    pub total_failures: u64,
    /// Calls refused without invoking the operation.
    pub total_rejections: u64,
    pub circuit_open_count: u64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub opened_at: Option<DateTime<Utc>>,
}

impl CircuitBreakerStats {
    pub fn state_string(&self) -> String {
        self.state.to_string()
    }

    pub fn summary(&self) -> String {
        format!(
            "State: {} | Success: {} | Failures: {} | Consecutive Failures: {} | Circuit Opened: {} times",
            self.state,
            self.total_successes,
            self.total_failures,
            self.consecutive_failures,
            self.circuit_open_count
        )
    }
}

#[derive(Debug)]
struct BreakerCore {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    total_successes: u64,
    total_failures: u64,
    total_rejections: u64,
    circuit_open_count: u64,
    opened_at: Option<Instant>,
    opened_at_utc: Option<DateTime<Utc>>,
    half_open_in_flight: u32,
    /// Bumped on every transition so stale probe slots are not released twice.
    generation: u64,
}

impl Default for BreakerCore {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            total_successes: 0,
            total_failures: 0,
            total_rejections: 0,
            circuit_open_count: 0,
            opened_at: None,
            opened_at_utc: None,
            half_open_in_flight: 0,
            generation: 0,
        }
    }
}

/// Circuit breaker for protecting against cascading failures.
///
/// All counters and the state live behind one mutex; the wrapped operation
/// runs outside it.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    core: Mutex<BreakerCore>,
    registration: Mutex<Option<Weak<Entries>>>,
}

/// A half-open probe slot, released when the call settles or is dropped.
struct ProbeSlot<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    released: bool,
}

impl ProbeSlot<'_> {
    fn release(&mut self, core: &mut BreakerCore) {
        if self.released {
            return;
        }
        self.released = true;
        if core.generation == self.generation && core.half_open_in_flight > 0 {
            core.half_open_in_flight -= 1;
        }
    }
}

impl Drop for ProbeSlot<'_> {
    fn drop(&mut self) {
        if !self.released {
            let mut core = lock(&self.breaker.core);
            self.release(&mut core);
        }
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker with default configuration.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(CircuitBreakerConfig::named(name))
    }

    /// Create a new circuit breaker with custom configuration.
    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            core: Mutex::new(BreakerCore::default()),
            registration: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state. Does not evaluate the open timeout.
    pub fn state(&self) -> CircuitState {
        lock(&self.core).state
    }

    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn is_half_open(&self) -> bool {
        self.state() == CircuitState::HalfOpen
    }

    /// Run `operation` if the circuit admits it and record the outcome.
    ///
    /// A rejected call returns a `CircuitOpen` error without invoking
    /// `operation`.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> OpResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = OpResult<T>>,
    {
        let mut probe = self.admit()?;
        let result = operation().await;

        let mut core = lock(&self.core);
        if let Some(probe) = probe.as_mut() {
            probe.release(&mut core);
        }
        match &result {
            Ok(_) => self.on_success(&mut core),
            Err(_) => self.on_failure(&mut core),
        }
        result
    }

    /// Force the circuit open.
    pub fn open(&self) {
        let mut core = lock(&self.core);
        if core.state != CircuitState::Open {
            self.transition_to_open(&mut core);
        }
    }

    /// Force the circuit closed, keeping lifetime statistics.
    pub fn close(&self) {
        let mut core = lock(&self.core);
        self.transition_to_closed(&mut core);
    }

    /// Move an open circuit to half-open without waiting for the timeout.
    ///
    /// Returns `false` if the circuit was not open.
    pub fn force_half_open(&self) -> bool {
        let mut core = lock(&self.core);
        if core.state != CircuitState::Open {
            return false;
        }
        core.consecutive_failures = 0;
        self.transition_to_half_open(&mut core);
        true
    }

    /// Clear all statistics and return to closed.
    pub fn reset(&self) {
        let mut core = lock(&self.core);
        let generation = core.generation + 1;
        *core = BreakerCore {
            generation,
            ..Default::default()
        };
        if self.config.enable_logging {
            info!("Circuit breaker {} reset to CLOSED", self.config.name);
        }
    }

    /// Get statistics about this circuit breaker.
    pub fn stats(&self) -> CircuitBreakerStats {
        let core = lock(&self.core);
        CircuitBreakerStats {
            name: self.config.name.clone(),
            state: core.state,
            total_successes: core.total_successes,
            total_failures: core.total_failures,
            total_rejections: core.total_rejections,
            circuit_open_count: core.circuit_open_count,
            consecutive_failures: core.consecutive_failures,
            consecutive_successes: core.consecutive_successes,
            opened_at: core.opened_at_utc,
        }
    }

    pub(crate) fn attach_registry(&self, entries: Weak<Entries>) {
        *lock(&self.registration) = Some(entries);
    }

    fn admit(&self) -> OpResult<Option<ProbeSlot<'_>>> {
        let mut core = lock(&self.core);

        if core.state == CircuitState::Open {
            let elapsed = core.opened_at.map_or(Duration::MAX, |at| at.elapsed());
            if elapsed >= self.config.open_timeout {
                self.transition_to_half_open(&mut core);
            }
        }

        match core.state {
            CircuitState::Closed => Ok(None),
            CircuitState::Open => {
                core.total_rejections += 1;
                Err(OpError::circuit_open(format!(
                    "Circuit breaker '{}' is OPEN - request rejected",
                    self.config.name
                )))
            }
            CircuitState::HalfOpen => {
                if core.half_open_in_flight < self.config.half_open_max_requests {
                    core.half_open_in_flight += 1;
                    Ok(Some(ProbeSlot {
                        breaker: self,
                        generation: core.generation,
                        released: false,
                    }))
                } else {
                    core.total_rejections += 1;
                    Err(OpError::circuit_open(format!(
                        "Circuit breaker '{}' is HALF_OPEN - probe limit reached",
                        self.config.name
                    )))
                }
            }
        }
    }

    fn on_success(&self, core: &mut BreakerCore) {
        core.total_successes += 1;
        core.consecutive_failures = 0;

        if core.state == CircuitState::HalfOpen {
            core.consecutive_successes += 1;
            if core.consecutive_successes >= self.config.success_threshold {
                self.transition_to_closed(core);
            }
        }
    }

    fn on_failure(&self, core: &mut BreakerCore) {
        core.total_failures += 1;
        core.consecutive_failures += 1;
        core.consecutive_successes = 0;

        match core.state {
            CircuitState::Closed => {
                if core.consecutive_failures >= self.config.failure_threshold {
                    self.transition_to_open(core);
                }
            }
            CircuitState::HalfOpen => {
                // Recovery failed - reopen the circuit
                self.transition_to_open(core);
            }
            CircuitState::Open => {}
        }
    }

    // Internal state transitions

    fn transition_to_open(&self, core: &mut BreakerCore) {
        core.state = CircuitState::Open;
        core.opened_at = Some(Instant::now());
        core.opened_at_utc = Some(Utc::now());
        core.circuit_open_count += 1;
        core.half_open_in_flight = 0;
        core.generation += 1;
        if self.config.enable_logging {
            warn!(
                "Circuit breaker {} opened after {} consecutive failures",
                self.config.name, core.consecutive_failures
            );
        }
    }

    fn transition_to_half_open(&self, core: &mut BreakerCore) {
        core.state = CircuitState::HalfOpen;
        core.half_open_in_flight = 0;
        core.consecutive_successes = 0;
        core.generation += 1;
        if self.config.enable_logging {
            debug!("Circuit breaker {} entering HALF_OPEN", self.config.name);
        }
    }

    fn transition_to_closed(&self, core: &mut BreakerCore) {
        core.state = CircuitState::Closed;
        core.consecutive_failures = 0;
        core.consecutive_successes = 0;
        core.half_open_in_flight = 0;
        core.opened_at = None;
        core.opened_at_utc = None;
        core.generation += 1;
        if self.config.enable_logging {
            info!("Circuit breaker {} recovered to CLOSED", self.config.name);
        }
    }
}

impl Drop for CircuitBreaker {
    fn drop(&mut self) {
        let registration = self
            .registration
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(entries) = registration.and_then(|weak| weak.upgrade()) {
            registry::release(&entries, &self.config.name);
        }
    }
}
