//! Combinators composing `AsyncOperation`s.
//!
//! Every combinator returns a new, unstarted operation (except `from_value`
//! and `from_error`, which are already complete). Waiting is done with real
//! suspension; the only periodic wake-up is the progress tick.
//!
//! Failures are passed through with a context breadcrumb, never rewritten.

use super::{AsyncOperation, OperationBuilder};
use crate::cancel::CancellationToken;
use crate::config::AsyncConfig;
use crate::dispatch::CompletionContext;
use crate::error::{OpError, OpResult};
use crate::network::RetryPredicate;
use crate::progress::ProgressReporter;
use futures::future::{select_all, FutureExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Produces a fresh operation for `sequence`.
pub type OperationFactory<T> = Box<dyn FnOnce() -> AsyncOperation<T> + Send>;

type Inherited = (Option<Handle>, Option<CompletionContext>);

/// Runtime and completion context of `op`, for combinators wrapping it.
fn inherit<T: Clone + Send + Sync + 'static>(op: Option<&AsyncOperation<T>>) -> Inherited {
    op.map(|op| (op.runtime(), op.completion_context()))
        .unwrap_or_default()
}

fn combinator<T, F, Fut>(
    name: &str,
    token: Option<CancellationToken>,
    (runtime, context): Inherited,
    work: F,
) -> AsyncOperation<T>
where
    T: Clone + Send + Sync + 'static,
    F: FnOnce(CancellationToken, Arc<dyn ProgressReporter>) -> Fut + Send + 'static,
    Fut: Future<Output = OpResult<T>> + Send + 'static,
{
    let mut builder: OperationBuilder<T> = AsyncOperation::builder(work).name(name);
    if let Some(token) = token {
        builder = builder.cancellation(token);
    }
    AsyncOperation::from_parts(builder, runtime, context)
}

fn start_if_needed<T: Clone + Send + Sync + 'static>(op: &AsyncOperation<T>) {
    if op.state() == super::OperationState::NotStarted {
        op.start();
    }
}

fn ticker() -> tokio::time::Interval {
    let mut tick = interval(AsyncConfig::PROGRESS_TICK);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tick
}

fn fraction(elapsed: Duration, total: Duration) -> f64 {
    if total.is_zero() {
        1.0
    } else {
        elapsed.as_secs_f64() / total.as_secs_f64()
    }
}

/// Run every operation and collect the values in input order.
///
/// The first failure (in input order) cancels the operations not yet waited
/// on and is returned with a `failed_index` entry in its metadata.
pub fn when_all<T>(
    operations: Vec<AsyncOperation<T>>,
    token: Option<CancellationToken>,
) -> AsyncOperation<Vec<T>>
where
    T: Clone + Send + Sync + 'static,
{
    let inherited = inherit(operations.first());
    combinator("when_all", token, inherited, move |token, progress| async move {
        if operations.is_empty() {
            return Ok(Vec::new());
        }

        let total = operations.len();
        progress.report_stage("WhenAll");
        progress.report_progress(0.0, &format!("Waiting for {} operations...", total));
        operations.iter().for_each(start_if_needed);

        let mut values = Vec::with_capacity(total);
        for (index, op) in operations.iter().enumerate() {
            let result = tokio::select! {
                result = op.completed_result() => result,
                _ = token.cancelled() => {
                    operations.iter().for_each(|op| op.cancel());
                    return Err(OpError::cancelled("WhenAll cancelled"));
                }
            };

            match result {
                Ok(value) => values.push(value),
                Err(e) => {
                    operations[index + 1..].iter().for_each(|op| op.cancel());
                    return Err(e
                        .with_context(format!("Operation {} failed", index))
                        .with_metadata("failed_index", index));
                }
            }

            progress.report_progress(
                (index + 1) as f64 / total as f64,
                &format!("Completed {}/{} operations", index + 1, total),
            );
        }

        Ok(values)
    })
}

/// Race the operations; the first to finish wins and the rest are cancelled.
pub fn when_any<T>(
    operations: Vec<AsyncOperation<T>>,
    token: Option<CancellationToken>,
) -> AsyncOperation<T>
where
    T: Clone + Send + Sync + 'static,
{
    let inherited = inherit(operations.first());
    combinator("when_any", token, inherited, move |token, progress| async move {
        if operations.is_empty() {
            return Err(OpError::validation("No operations provided to WhenAny"));
        }

        progress.report_stage("WhenAny");
        progress.report_progress(0.0, &format!("Racing {} operations...", operations.len()));
        operations.iter().for_each(start_if_needed);

        let race = select_all(operations.iter().map(|op| op.completed_result().boxed()));
        let (result, winner) = tokio::select! {
            (result, winner, _) = race => (result, winner),
            _ = token.cancelled() => {
                operations.iter().for_each(|op| op.cancel());
                return Err(OpError::cancelled("WhenAny cancelled"));
            }
        };

        debug!("Operation {} won the race", winner);
        for (index, op) in operations.iter().enumerate() {
            if index != winner {
                op.cancel();
            }
        }

        progress.report_progress(1.0, "First operation completed");
        result
    })
}

/// Fail with a `Timeout` error and cancel `operation` if it outlives `timeout`.
pub fn with_timeout<T>(
    operation: AsyncOperation<T>,
    timeout: Duration,
    token: Option<CancellationToken>,
) -> AsyncOperation<T>
where
    T: Clone + Send + Sync + 'static,
{
    let inherited = inherit(Some(&operation));
    combinator("with_timeout", token, inherited, move |token, progress| async move {
        progress.report_stage("WithTimeout");
        start_if_needed(&operation);

        let started = Instant::now();
        let deadline = sleep(timeout);
        tokio::pin!(deadline);
        let mut tick = ticker();

        loop {
            tokio::select! {
                biased;
                result = operation.completed_result() => {
                    progress.report_progress(1.0, "Completed");
                    return result;
                }
                _ = token.cancelled() => {
                    operation.cancel();
                    return Err(OpError::cancelled("Operation cancelled"));
                }
                _ = &mut deadline => {
                    operation.cancel();
                    warn!("Operation {} timed out after {:?}", operation.name(), timeout);
                    return Err(OpError::timeout(format!(
                        "Operation timed out after {:.1} seconds",
                        timeout.as_secs_f64()
                    )));
                }
                _ = tick.tick() => {
                    let elapsed = started.elapsed();
                    progress.report_progress(
                        fraction(elapsed, timeout),
                        &format!("{:.1}s / {:.1}s", elapsed.as_secs_f64(), timeout.as_secs_f64()),
                    );
                }
            }
        }
    })
}

/// Run a fresh operation from `factory` until one succeeds or attempts run out.
///
/// Between attempts the wrapper sleeps `min(2^(attempt-1), 10)` seconds.
/// Without `should_retry` every failure except cancellation is retried.
pub fn with_retry<T, F>(
    factory: F,
    max_attempts: u32,
    should_retry: Option<RetryPredicate>,
    token: Option<CancellationToken>,
) -> AsyncOperation<T>
where
    T: Clone + Send + Sync + 'static,
    F: Fn() -> AsyncOperation<T> + Send + Sync + 'static,
{
    let max_attempts = max_attempts.max(1);
    combinator("with_retry", token, Inherited::default(), move |token, progress| async move {
        progress.report_stage("WithRetry");
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            if token.is_cancellation_requested() {
                return Err(OpError::cancelled("Retry cancelled"));
            }
            progress.report_progress(
                f64::from(attempt - 1) / f64::from(max_attempts),
                &format!("Attempt {}/{}", attempt, max_attempts),
            );

            let operation = factory();
            start_if_needed(&operation);
            let result = tokio::select! {
                result = operation.completed_result() => result,
                _ = token.cancelled() => {
                    operation.cancel();
                    return Err(OpError::cancelled("Retry cancelled"));
                }
            };

            let error = match result {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            let retry = !error.is_cancelled()
                && should_retry.as_ref().map_or(true, |p| p(&error, attempt));
            if !retry {
                return Err(error);
            }

            if attempt < max_attempts {
                let backoff = Duration::from_secs(1u64 << (attempt - 1).min(16))
                    .min(AsyncConfig::WITH_RETRY_MAX_BACKOFF);
                warn!(
                    "Attempt {}/{} failed: {}. Retrying in {:?}",
                    attempt, max_attempts, error, backoff
                );
                tokio::select! {
                    _ = sleep(backoff) => {}
                    _ = token.cancelled() => {
                        return Err(OpError::cancelled("Retry cancelled"));
                    }
                }
            }
            last_error = Some(error);
        }

        let error = last_error.unwrap_or_else(|| OpError::internal("No attempts made"));
        Err(error
            .with_context(format!("All {} retry attempts failed", max_attempts))
            .with_metadata("attempts", max_attempts))
    })
}

/// Run operations one at a time, stopping at the first failure.
///
/// A failure carries the 1-based `failed_step` in its metadata.
pub fn sequence<T>(
    factories: Vec<OperationFactory<T>>,
    token: Option<CancellationToken>,
) -> AsyncOperation<Vec<T>>
where
    T: Clone + Send + Sync + 'static,
{
    combinator("sequence", token, Inherited::default(), move |token, progress| async move {
        let total = factories.len();
        if total == 0 {
            return Ok(Vec::new());
        }
        progress.report_stage("Sequence");

        let mut values = Vec::with_capacity(total);
        for (index, factory) in factories.into_iter().enumerate() {
            let step = index + 1;
            if token.is_cancellation_requested() {
                return Err(OpError::cancelled("Sequence cancelled"));
            }

            let operation = factory();
            start_if_needed(&operation);
            let result = tokio::select! {
                result = operation.completed_result() => result,
                _ = token.cancelled() => {
                    operation.cancel();
                    return Err(OpError::cancelled("Sequence cancelled"));
                }
            };

            match result {
                Ok(value) => values.push(value),
                Err(e) => {
                    return Err(e
                        .with_context(format!("Step {} failed", step))
                        .with_metadata("failed_step", step));
                }
            }

            progress.report_progress(
                step as f64 / total as f64,
                &format!("Completed step {}/{}", step, total),
            );
        }

        Ok(values)
    })
}

/// An operation that has already succeeded with `value`.
pub fn from_value<T: Clone + Send + Sync + 'static>(value: T) -> AsyncOperation<T> {
    AsyncOperation::completed(Ok(value))
}

/// An operation that has already failed with `error`.
pub fn from_error<T: Clone + Send + Sync + 'static>(error: OpError) -> AsyncOperation<T> {
    AsyncOperation::completed(Err(error))
}

/// Succeed after `duration`, reporting fractional progress on the way.
pub fn delay(duration: Duration, token: Option<CancellationToken>) -> AsyncOperation<()> {
    combinator("delay", token, Inherited::default(), move |token, progress| async move {
        progress.report_stage("Delay");

        let started = Instant::now();
        let timer = sleep(duration);
        tokio::pin!(timer);
        let mut tick = ticker();

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    return Err(OpError::cancelled("Delay cancelled"));
                }
                _ = &mut timer => {
                    progress.report_progress(1.0, "Delay complete");
                    return Ok(());
                }
                _ = tick.tick() => {
                    progress.report_progress(fraction(started.elapsed(), duration), "Waiting");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::network::predicates;
    use crate::CancellationTokenSource;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn ready<T: Clone + Send + Sync + 'static>(value: T) -> AsyncOperation<T> {
        AsyncOperation::new(move |_token, _progress| async move { Ok(value) })
    }

    fn after<T: Clone + Send + Sync + 'static>(wait: Duration, value: T) -> AsyncOperation<T> {
        AsyncOperation::new(move |token, _progress| async move {
            tokio::select! {
                _ = sleep(wait) => Ok(value),
                _ = token.cancelled() => Err(OpError::cancelled("stopped")),
            }
        })
    }

    fn failing<T: Clone + Send + Sync + 'static>(error: OpError) -> AsyncOperation<T> {
        AsyncOperation::new(move |_token, _progress| async move { Err(error) })
    }

    fn pending() -> AsyncOperation<u32> {
        AsyncOperation::new(|token, _progress| async move {
            token.cancelled().await;
            Err(OpError::cancelled("stopped"))
        })
    }

    #[tokio::test]
    async fn test_when_all_collects_in_order() {
        let all = when_all(
            vec![after(Duration::from_millis(30), 1), ready(2), after(Duration::from_millis(5), 3)],
            None,
        );
        all.start();
        assert_eq!(all.result().await, Ok(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_when_all_empty_succeeds() {
        let all = when_all::<u32>(Vec::new(), None);
        all.start();
        assert_eq!(all.result().await, Ok(Vec::new()));
    }

    #[tokio::test]
    async fn test_when_all_failure_cancels_rest() {
        let rest = pending();
        let all = when_all(
            vec![ready(1), failing(OpError::network("down")), rest.clone()],
            None,
        );
        all.start();

        let err = all.result().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Network);
        assert_eq!(err.message, "down");
        assert_eq!(err.metadata.get("failed_index").map(String::as_str), Some("1"));
        assert!(rest.is_cancelled());
    }

    #[tokio::test]
    async fn test_when_all_cancel_cancels_members() {
        let source = CancellationTokenSource::new();
        let member = pending();
        let all = when_all(vec![member.clone()], Some(source.token()));
        all.start();

        tokio::time::sleep(Duration::from_millis(10)).await;
        source.cancel();

        let err = all.result().await.unwrap_err();
        assert_eq!(err.message, "WhenAll cancelled");
        assert!(member.is_cancelled());
    }

    #[tokio::test]
    async fn test_when_any_first_wins() {
        let slow = after(Duration::from_secs(5), 1);
        let any = when_any(vec![slow.clone(), after(Duration::from_millis(5), 2)], None);
        any.start();

        assert_eq!(any.result().await, Ok(2));
        assert!(slow.is_cancelled());
    }

    #[tokio::test]
    async fn test_when_any_empty_fails() {
        let any = when_any::<u32>(Vec::new(), None);
        any.start();
        let err = any.result().await.unwrap_err();
        assert_eq!(err.message, "No operations provided to WhenAny");
    }

    #[tokio::test]
    async fn test_with_timeout_passes_fast_result() {
        let op = with_timeout(after(Duration::from_millis(5), "ok"), Duration::from_secs(1), None);
        op.start();
        assert_eq!(op.result().await, Ok("ok"));
    }

    #[tokio::test]
    async fn test_with_timeout_cancels_slow_operation() {
        let inner = pending();
        let op = with_timeout(inner.clone(), Duration::from_millis(50), None);
        let started = Instant::now();
        op.start();

        let err = op.result().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(inner.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_uses_fresh_operations() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let op = with_retry(
            move || {
                let call = calls_clone.fetch_add(1, Ordering::SeqCst) + 1;
                AsyncOperation::new(move |_token, _progress| async move {
                    if call < 3 {
                        Err(OpError::network("flaky"))
                    } else {
                        Ok(call)
                    }
                })
            },
            3,
            None,
            None,
        );
        op.start();

        assert_eq!(op.result().await, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_exhaustion_is_annotated() {
        let op = with_retry(|| failing::<u32>(OpError::timeout("slow")), 2, None, None);
        op.start();

        let err = op.result().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert_eq!(err.full_message(), "All 2 retry attempts failed → slow");
        assert_eq!(err.metadata.get("attempts").map(String::as_str), Some("2"));
    }

    #[tokio::test]
    async fn test_with_retry_predicate_stops() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let op = with_retry(
            move || {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                failing::<u32>(OpError::http_status(404, "HTTP error 404"))
            },
            5,
            Some(predicates::only_transient_errors()),
            None,
        );
        op.start();

        let err = op.result().await.unwrap_err();
        assert_eq!(err.code, 404);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sequence_runs_in_order_and_stops() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let step = |n: u32, fail: bool, order: Arc<Mutex<Vec<u32>>>| -> OperationFactory<u32> {
            Box::new(move || {
                AsyncOperation::new(move |_token, _progress| async move {
                    order.lock().unwrap().push(n);
                    if fail {
                        Err(OpError::validation("bad step"))
                    } else {
                        Ok(n)
                    }
                })
            })
        };

        let ok = sequence(
            vec![step(1, false, order.clone()), step(2, false, order.clone())],
            None,
        );
        ok.start();
        assert_eq!(ok.result().await, Ok(vec![1, 2]));

        order.lock().unwrap().clear();
        let failed = sequence(
            vec![
                step(1, false, order.clone()),
                step(2, true, order.clone()),
                step(3, false, order.clone()),
            ],
            None,
        );
        failed.start();

        let err = failed.result().await.unwrap_err();
        assert_eq!(err.full_message(), "Step 2 failed → bad step");
        assert_eq!(err.metadata.get("failed_step").map(String::as_str), Some("2"));
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_from_value_and_error() {
        assert_eq!(from_value(5).result().await, Ok(5));
        let err = from_error::<u8>(OpError::validation("nope")).result().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_delay_waits() {
        let started = Instant::now();
        let op = delay(Duration::from_millis(30), None);
        op.start();
        op.result().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_delay_cancelled() {
        let source = CancellationTokenSource::new();
        let op = delay(Duration::from_secs(10), Some(source.token()));
        op.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        source.cancel();

        let err = op.result().await.unwrap_err();
        assert_eq!(err.message, "Delay cancelled");
    }
}
