//! End-to-end behavior of the resilience primitives.
//!
//! Uses a scripted in-memory transport so timing and failure sequences are
//! deterministic.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bulwark_core::network::{
    InFlightRequest, RawResponse, RequestState, TransferOutcome, TransferProgressFn,
    TransportRequest,
};
use bulwark_core::{
    predicates, AsyncOperation, CancellationTokenSource, CircuitBreaker, CircuitBreakerConfig,
    CircuitState, CompletionContext, ErrorKind, HttpAsyncOperation, HttpRequest, HttpResponse,
    HttpTransport, OpError, OpResult, RetryPolicy, RetryPolicyConfig, RetryStrategy,
};

// ============================================================================
// Test Helpers
// ============================================================================

#[derive(Clone, Copy)]
enum Reply {
    Status(u16),
    Hang,
}

/// Transport replaying a fixed list of replies, then answering 200.
#[derive(Default)]
struct ScriptedTransport {
    replies: Mutex<VecDeque<Reply>>,
    submitted: AtomicU32,
    cancels: Arc<AtomicU32>,
}

impl ScriptedTransport {
    fn new(replies: &[Reply]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().copied().collect()),
            ..Default::default()
        })
    }
}

struct CancelCounter(Arc<AtomicU32>);

impl InFlightRequest for CancelCounter {
    fn cancel(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

impl HttpTransport for ScriptedTransport {
    fn submit(
        &self,
        _request: TransportRequest,
        state: Arc<RequestState>,
        _on_progress: TransferProgressFn,
    ) -> Result<Box<dyn InFlightRequest>, String> {
        self.submitted.fetch_add(1, Ordering::SeqCst);
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Reply::Status(200));
        if let Reply::Status(status) = reply {
            state.complete(TransferOutcome::Completed(RawResponse {
                status,
                ..Default::default()
            }));
        }
        Ok(Box::new(CancelCounter(self.cancels.clone())))
    }
}

fn quiet_breaker(failure_threshold: u32, open_timeout: Duration) -> CircuitBreaker {
    CircuitBreaker::with_config(
        CircuitBreakerConfig::named("properties")
            .with_failure_threshold(failure_threshold)
            .with_success_threshold(2)
            .with_open_timeout(open_timeout)
            .with_logging(false),
    )
}

// ============================================================================
// Cancellation
// ============================================================================

#[test]
fn test_cancellation_is_idempotent() {
    let source = CancellationTokenSource::new();
    let fired = Arc::new(AtomicU32::new(0));
    let fired_clone = fired.clone();
    source.token().register_callback(move || {
        fired_clone.fetch_add(1, Ordering::SeqCst);
    });

    source.cancel();
    source.cancel();

    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn test_linked_tokens_follow_parent() {
    let source = CancellationTokenSource::new();
    let parent = source.token();
    let early = parent.create_linked_token();
    let grandchild = early.create_linked_token();
    let late = parent.create_linked_token();

    source.cancel();

    assert!(early.is_cancellation_requested());
    assert!(late.is_cancellation_requested());
    assert!(grandchild.is_cancellation_requested());
}

// ============================================================================
// AsyncOperation
// ============================================================================

#[tokio::test]
async fn test_callbacks_observe_single_completion() {
    let context = CompletionContext::new("properties-callbacks").unwrap();
    let op = AsyncOperation::builder(|_token, _progress| async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(5)
    })
    .completion_context(context.clone())
    .build();

    let seen: Arc<Mutex<Vec<OpResult<i32>>>> = Arc::new(Mutex::new(Vec::new()));
    let before = seen.clone();
    op.on_complete(move |result| before.lock().unwrap().push(result.clone()));

    op.start();
    assert_eq!(op.result().await, Ok(5));

    let after = seen.clone();
    op.on_complete(move |result| after.lock().unwrap().push(result.clone()));
    context.flushed().await;

    assert_eq!(*seen.lock().unwrap(), vec![Ok(5), Ok(5)]);
}

// ============================================================================
// Circuit Breaker
// ============================================================================

#[tokio::test]
async fn test_breaker_threshold_rejects_fourth_call() {
    let breaker = quiet_breaker(3, Duration::from_secs(30));
    for _ in 0..3 {
        let _ = breaker
            .execute(|| async { Err::<(), _>(OpError::network("down")) })
            .await;
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    let invoked = AtomicU32::new(0);
    let err = breaker
        .execute(|| async {
            invoked.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::CircuitOpen);
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_breaker_recovery_cycle() {
    let breaker = quiet_breaker(1, Duration::from_millis(50));
    let _ = breaker
        .execute(|| async { Err::<(), _>(OpError::timeout("slow")) })
        .await;
    assert!(breaker.is_open());

    tokio::time::sleep(Duration::from_millis(70)).await;
    // No spontaneous transition
    assert!(breaker.is_open());

    // A failed probe reopens immediately
    let _ = breaker
        .execute(|| async { Err::<(), _>(OpError::timeout("still slow")) })
        .await;
    assert!(breaker.is_open());

    tokio::time::sleep(Duration::from_millis(70)).await;
    breaker.execute(|| async { Ok(()) }).await.unwrap();
    assert!(breaker.is_half_open());
    breaker.execute(|| async { Ok(()) }).await.unwrap();
    assert!(breaker.is_closed());
}

// ============================================================================
// Retry Policy
// ============================================================================

#[tokio::test]
async fn test_retry_exhaustion_invokes_three_times() {
    let policy = RetryPolicy::new(
        RetryPolicyConfig::default()
            .with_max_attempts(2)
            .with_base_delay(Duration::from_millis(5))
            .with_jitter(false)
            .with_logging(false),
    );
    let calls = AtomicU32::new(0);

    let err = policy
        .execute(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(OpError::network("reset")) }
        })
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(err.message, "reset");
    assert_eq!(policy.stats().total_failures, 1);
}

#[tokio::test]
async fn test_retry_predicate_short_circuits() {
    let policy = RetryPolicy::new(
        RetryPolicyConfig::default()
            .with_max_attempts(5)
            .with_base_delay(Duration::from_secs(1))
            .with_logging(false)
            .with_predicate(predicates::only_transient_errors()),
    );
    let calls = AtomicU32::new(0);
    let started = Instant::now();

    let err = policy
        .execute(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(OpError::http_status(404, "HTTP error 404")) }
        })
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::HttpStatus(404));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[test]
fn test_exponential_backoff_is_clamped() {
    let policy = RetryPolicy::new(
        RetryPolicyConfig::default()
            .with_strategy(RetryStrategy::Exponential)
            .with_base_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(10))
            .with_jitter(false),
    );

    assert_eq!(policy.calculate_delay(1), Duration::from_secs(1));
    assert_eq!(policy.calculate_delay(4), Duration::from_secs(8));
    assert_eq!(policy.calculate_delay(5), Duration::from_secs(10));
}

// ============================================================================
// HTTP Pipeline
// ============================================================================

#[test]
fn test_success_status_boundary() {
    let response = |status_code| HttpResponse {
        status_code,
        ..Default::default()
    };

    assert!(response(200).is_success());
    assert!(response(299).is_success());
    assert!(!response(199).is_success());
    assert!(!response(300).is_success());
}

#[tokio::test]
async fn test_hung_transport_times_out_and_cancels() {
    let transport = ScriptedTransport::new(&[Reply::Hang]);
    let http = HttpAsyncOperation::new(transport.clone());

    let started = Instant::now();
    let op = http.create(
        HttpRequest::new("https://api.example.com/slow").with_timeout(Duration::from_secs(1)),
        None,
    );
    op.start();
    let err = op.result().await.unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(err.kind, ErrorKind::Timeout);
    assert_eq!(err.message, "HTTP request timed out after 1.0 seconds");
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_millis(1500));
    assert_eq!(transport.cancels.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_protection_end_to_end() {
    let transport = ScriptedTransport::new(&[Reply::Status(503), Reply::Status(500)]);
    let http = HttpAsyncOperation::new(transport.clone());
    let breaker = Arc::new(quiet_breaker(5, Duration::from_secs(30)));
    let retry = Arc::new(RetryPolicy::new(
        RetryPolicyConfig::default()
            .with_max_attempts(3)
            .with_base_delay(Duration::from_millis(5))
            .with_jitter(false)
            .with_logging(false),
    ));

    let op = http.create_with_protection(
        HttpRequest::new("https://api.example.com/usage"),
        breaker.clone(),
        retry.clone(),
        None,
    );
    op.start();
    let response = op.result().await.expect("protected call succeeds");

    assert_eq!(response.status_code, 200);
    assert_eq!(transport.submitted.load(Ordering::SeqCst), 3);
    let breaker_stats = breaker.stats();
    assert!(breaker_stats.consecutive_failures < 5);
    assert_eq!(breaker_stats.total_successes, 1);
    assert_eq!(retry.stats().success_after_retry, 1);
}
