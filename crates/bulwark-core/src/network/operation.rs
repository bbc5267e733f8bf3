//! HTTP requests as async operations, optionally protected by a circuit
//! breaker and/or a retry policy.
//!
//! When both are used the breaker wraps the retry loop, so it only sees the
//! final outcome of a retried call:
//!
//! ```text
//! CircuitBreaker::execute
//!   └─ RetryPolicy::execute_with_cancellation
//!        └─ single HTTP attempt
//! ```

use super::circuit_breaker::CircuitBreaker;
use super::http::{HttpRequest, HttpResponse};
use super::retry::RetryPolicy;
use super::transport::{
    HttpTransport, InFlightRequest, ReqwestTransport, RequestState, TransferOutcome,
    TransferProgressFn, TransportRequest,
};
use crate::cancel::CancellationToken;
use crate::config::{AsyncConfig, HttpConfig};
use crate::dispatch::CompletionContext;
use crate::error::{OpError, OpResult, Result};
use crate::operation::AsyncOperation;
use crate::progress::ProgressReporter;
use crate::shutdown::ShutdownSignal;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::debug;

/// Factory for HTTP `AsyncOperation`s sharing one transport.
#[derive(Clone)]
pub struct HttpAsyncOperation {
    transport: Arc<dyn HttpTransport>,
    shutdown: ShutdownSignal,
    runtime: Option<Handle>,
    context: Option<CompletionContext>,
}

impl std::fmt::Debug for HttpAsyncOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpAsyncOperation")
            .field("shutdown_requested", &self.shutdown.is_requested())
            .finish_non_exhaustive()
    }
}

impl HttpAsyncOperation {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            transport,
            shutdown: ShutdownSignal::new(),
            runtime: None,
            context: None,
        }
    }

    /// Use the default reqwest transport.
    pub fn with_reqwest() -> Result<Self> {
        Ok(Self::new(Arc::new(ReqwestTransport::new()?)))
    }

    /// Abandon in-flight requests when `shutdown` is requested.
    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn with_completion_context(mut self, context: CompletionContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    /// Unprotected request.
    pub fn create(
        &self,
        request: HttpRequest,
        token: Option<CancellationToken>,
    ) -> AsyncOperation<HttpResponse> {
        self.build(request, None, None, token)
    }

    pub fn create_with_circuit_breaker(
        &self,
        request: HttpRequest,
        breaker: Arc<CircuitBreaker>,
        token: Option<CancellationToken>,
    ) -> AsyncOperation<HttpResponse> {
        self.build(request, Some(breaker), None, token)
    }

    pub fn create_with_retry(
        &self,
        request: HttpRequest,
        retry: Arc<RetryPolicy>,
        token: Option<CancellationToken>,
    ) -> AsyncOperation<HttpResponse> {
        self.build(request, None, Some(retry), token)
    }

    /// Breaker around retry around the request.
    pub fn create_with_protection(
        &self,
        request: HttpRequest,
        breaker: Arc<CircuitBreaker>,
        retry: Arc<RetryPolicy>,
        token: Option<CancellationToken>,
    ) -> AsyncOperation<HttpResponse> {
        self.build(request, Some(breaker), Some(retry), token)
    }

    /// Run the unprotected pipeline in the caller's task.
    pub async fn execute(
        &self,
        request: &HttpRequest,
        token: &CancellationToken,
        progress: Arc<dyn ProgressReporter>,
    ) -> OpResult<HttpResponse> {
        self.execute_with_protection(request, token, progress, None, None)
            .await
    }

    /// Run the pipeline in the caller's task with optional protection.
    ///
    /// Validation failures return before the breaker or retry policy is
    /// consulted, so they never show up in their statistics.
    pub async fn execute_with_protection(
        &self,
        request: &HttpRequest,
        token: &CancellationToken,
        progress: Arc<dyn ProgressReporter>,
        breaker: Option<&CircuitBreaker>,
        retry: Option<&RetryPolicy>,
    ) -> OpResult<HttpResponse> {
        progress.report_stage("HttpRequest");
        request.validate()?;

        let attempt = || self.perform(request, token, &progress);
        match (breaker, retry) {
            (Some(breaker), Some(retry)) => {
                breaker
                    .execute(|| retry.execute_with_cancellation(token, attempt))
                    .await
            }
            (Some(breaker), None) => breaker.execute(attempt).await,
            (None, Some(retry)) => retry.execute_with_cancellation(token, attempt).await,
            (None, None) => attempt().await,
        }
    }

    fn build(
        &self,
        request: HttpRequest,
        breaker: Option<Arc<CircuitBreaker>>,
        retry: Option<Arc<RetryPolicy>>,
        token: Option<CancellationToken>,
    ) -> AsyncOperation<HttpResponse> {
        let this = self.clone();
        let name = format!("{} {}", request.verb, request.url);

        let mut builder = AsyncOperation::builder(move |token, progress| async move {
            this.execute_with_protection(
                &request,
                &token,
                progress,
                breaker.as_deref(),
                retry.as_deref(),
            )
            .await
        })
        .name(name);
        if let Some(token) = token {
            builder = builder.cancellation(token);
        }
        AsyncOperation::from_parts(builder, self.runtime.clone(), self.context.clone())
    }

    /// One HTTP attempt: submit, wait, classify.
    async fn perform(
        &self,
        request: &HttpRequest,
        token: &CancellationToken,
        progress: &Arc<dyn ProgressReporter>,
    ) -> OpResult<HttpResponse> {
        progress.report_progress(0.0, &format!("Connecting to {}...", request.url));

        let state = Arc::new(RequestState::new());
        let reporter = progress.clone();
        let on_progress: TransferProgressFn = Arc::new(move |transferred, total| {
            let total = total.map_or(0, |t| t as i64);
            reporter.report_transfer_progress(transferred as i64, total);
        });

        let request_handle = self
            .transport
            .submit(TransportRequest::from(request), state.clone(), on_progress)
            .map_err(|reason| {
                OpError::submission("Failed to send HTTP request").with_metadata("reason", reason)
            })?;
        let mut in_flight = InFlightGuard::new(request_handle, state.clone());

        let started = Instant::now();
        let timeout = request.timeout;
        let max_iterations = if timeout.is_zero() {
            HttpConfig::FALLBACK_MAX_ITERATIONS
        } else {
            // Round up and leave one spare tick so the wall-clock check fires first.
            (timeout.as_secs_f64() * HttpConfig::ITERATIONS_PER_SECOND as f64).ceil() as u64 + 1
        };
        let mut watchdog = interval(AsyncConfig::POLL_INTERVAL);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        watchdog.tick().await;
        let mut iterations: u64 = 0;

        loop {
            tokio::select! {
                biased;
                _ = state.wait() => break,
                _ = self.shutdown.requested() => {
                    in_flight.cancel();
                    return Err(OpError::cancelled("HTTP request cancelled due to engine shutdown"));
                }
                _ = token.cancelled() => {
                    in_flight.cancel();
                    return Err(OpError::cancelled("HTTP request cancelled"));
                }
                _ = watchdog.tick() => {
                    if !timeout.is_zero() && started.elapsed() >= timeout {
                        in_flight.cancel();
                        return Err(timed_out(request));
                    }
                    iterations += 1;
                    if iterations >= max_iterations {
                        in_flight.cancel();
                        return Err(OpError::timeout("HTTP request exceeded maximum wait iterations"));
                    }
                }
            }
        }

        progress.report_progress(1.0, "Request completed");

        match state.take_outcome() {
            Some(TransferOutcome::Completed(raw)) => {
                let response = HttpResponse::from_raw(raw);
                debug!(
                    "{} {} -> {}",
                    request.verb, request.url, response.status_code
                );
                if !response.is_success() {
                    let status = response.status_code;
                    return Err(OpError::http_status(status, format!("HTTP error {}", status)));
                }
                Ok(response)
            }
            Some(TransferOutcome::TimedOut) => Err(timed_out(request)),
            Some(TransferOutcome::Failed(reason)) => {
                Err(OpError::network("HTTP request failed - no response").with_metadata("reason", reason))
            }
            None => Err(OpError::network("HTTP request failed - no response")),
        }
    }
}

/// Cancels the submitted request if the wait ends without an outcome,
/// including when the waiting future itself is dropped.
struct InFlightGuard {
    request: Box<dyn InFlightRequest>,
    state: Arc<RequestState>,
    cancelled: bool,
}

impl InFlightGuard {
    fn new(request: Box<dyn InFlightRequest>, state: Arc<RequestState>) -> Self {
        Self {
            request,
            state,
            cancelled: false,
        }
    }

    fn cancel(&mut self) {
        if !self.cancelled {
            self.cancelled = true;
            self.request.cancel();
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if !self.state.is_complete() {
            self.cancel();
        }
    }
}

fn timed_out(request: &HttpRequest) -> OpError {
    OpError::timeout(format!(
        "HTTP request timed out after {:.1} seconds",
        request.timeout.as_secs_f64()
    ))
}
