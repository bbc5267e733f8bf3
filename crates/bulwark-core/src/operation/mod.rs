//! Cancelable, observable one-shot async operations.
//!
//! This module provides:
//! - `AsyncOperation<T>`: a unit of work run on a tokio runtime that produces
//!   an `OpResult<T>` exactly once
//! - `OperationBuilder<T>`: configures the token, progress reporter, runtime and
//!   completion context of an operation
//! - Combinators (`when_all`, `when_any`, `with_timeout`, ...) in
//!   [`combinators`]
//!
//! Operations without a value use `AsyncOperation<()>`.
//!
//! Completion callbacks always run on the operation's `CompletionContext`,
//! including callbacks registered after the operation finished.

pub mod combinators;

use crate::cancel::{CancellationToken, CancellationTokenSource};
use crate::config::AsyncConfig;
use crate::dispatch::{spawn_background, CompletionContext};
use crate::error::{OpError, OpResult};
use crate::lock;
use crate::progress::{NullProgressReporter, ProgressReporter};
use futures::future::{BoxFuture, FutureExt};
use std::any::Any;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Lifecycle of an operation. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    NotStarted,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl OperationState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationState::Succeeded | OperationState::Failed | OperationState::Cancelled
        )
    }
}

impl std::fmt::Display for OperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationState::NotStarted => write!(f, "NOT_STARTED"),
            OperationState::Running => write!(f, "RUNNING"),
            OperationState::Succeeded => write!(f, "SUCCEEDED"),
            OperationState::Failed => write!(f, "FAILED"),
            OperationState::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

type Work<T> =
    Box<dyn FnOnce(CancellationToken, Arc<dyn ProgressReporter>) -> BoxFuture<'static, OpResult<T>> + Send>;
type CompletionCallback<T> = Box<dyn FnOnce(&OpResult<T>) + Send>;

struct Core<T> {
    state: OperationState,
    result: Option<OpResult<T>>,
    callbacks: Vec<CompletionCallback<T>>,
}

struct Inner<T: Clone + Send + Sync + 'static> {
    id: Uuid,
    name: String,
    work: Mutex<Option<Work<T>>>,
    token: CancellationToken,
    source: Option<CancellationTokenSource>,
    progress: Mutex<Arc<dyn ProgressReporter>>,
    runtime: Option<Handle>,
    context: Option<CompletionContext>,
    core: Mutex<Core<T>>,
    done_cv: Condvar,
    done_tx: watch::Sender<bool>,
}

impl<T: Clone + Send + Sync + 'static> Inner<T> {
    /// Store `result` and deliver it, unless another path completed first.
    fn complete(&self, result: OpResult<T>) -> bool {
        let state = match &result {
            Ok(_) => OperationState::Succeeded,
            Err(e) if e.is_cancelled() || self.token.is_cancellation_requested() => {
                OperationState::Cancelled
            }
            Err(_) => OperationState::Failed,
        };

        let callbacks = {
            let mut core = lock(&self.core);
            if core.state.is_terminal() {
                return false;
            }
            core.state = state;
            core.result = Some(result.clone());
            std::mem::take(&mut core.callbacks)
        };

        match &result {
            Ok(_) => debug!("Operation {} ({}) {}", self.name, self.id, state),
            Err(e) => debug!("Operation {} ({}) {}: {}", self.name, self.id, state, e),
        }

        self.done_cv.notify_all();
        self.done_tx.send_replace(true);
        deliver(self.context.as_ref(), callbacks, result);
        true
    }
}

impl<T: Clone + Send + Sync + 'static> Drop for Inner<T> {
    fn drop(&mut self) {
        let core = self.core.get_mut().unwrap_or_else(PoisonError::into_inner);
        if core.state.is_terminal() {
            return;
        }

        if core.state == OperationState::Running {
            debug!("Operation {} ({}) dropped while running; cancelling", self.name, self.id);
        }
        if let Some(source) = &self.source {
            source.cancel();
        }

        core.state = OperationState::Cancelled;
        let callbacks = std::mem::take(&mut core.callbacks);
        deliver(
            self.context.as_ref(),
            callbacks,
            Err(OpError::cancelled("Operation cancelled")),
        );
    }
}

fn deliver<T: Send + Sync + 'static>(
    context: Option<&CompletionContext>,
    callbacks: Vec<CompletionCallback<T>>,
    result: OpResult<T>,
) {
    if callbacks.is_empty() {
        return;
    }

    let context = match context {
        Some(context) => context.clone(),
        None => match CompletionContext::global() {
            Ok(context) => context,
            Err(e) => {
                error!("No completion context available ({}); running callbacks inline", e);
                for callback in callbacks {
                    callback(&result);
                }
                return;
            }
        },
    };

    let result = Arc::new(result);
    for callback in callbacks {
        let result = result.clone();
        context.post(move || callback(result.as_ref()));
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> OpError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned());
    match message {
        Some(message) => OpError::internal(format!("Operation panicked: {}", message)),
        None => OpError::internal("Operation panicked"),
    }
}

async fn run_work<T>(
    work: Work<T>,
    token: CancellationToken,
    progress: Arc<dyn ProgressReporter>,
) -> OpResult<T> {
    if token.is_cancellation_requested() {
        return Err(OpError::cancelled("Operation cancelled before execution"));
    }

    let future = match catch_unwind(AssertUnwindSafe(|| work(token, progress))) {
        Ok(future) => future,
        Err(payload) => return Err(panic_message(payload)),
    };

    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(panic_message(payload)),
    }
}

/// Configures an `AsyncOperation` before it is built.
pub struct OperationBuilder<T: Clone + Send + Sync + 'static> {
    work: Option<Work<T>>,
    token: Option<CancellationToken>,
    progress: Option<Arc<dyn ProgressReporter>>,
    runtime: Option<Handle>,
    context: Option<CompletionContext>,
    name: String,
}

impl<T: Clone + Send + Sync + 'static> OperationBuilder<T> {
    /// Use an external token. The operation cannot cancel it, only observe it.
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    pub fn progress(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.progress = Some(reporter);
        self
    }

    /// Run the work on `runtime` instead of the runtime current at `start()`.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Deliver callbacks on `context` instead of the global context.
    pub fn completion_context(mut self, context: CompletionContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn build(self) -> AsyncOperation<T> {
        let (token, source) = match self.token {
            Some(token) => (token, None),
            None => {
                let source = CancellationTokenSource::new();
                (source.token(), Some(source))
            }
        };
        let (done_tx, _) = watch::channel(false);

        AsyncOperation {
            inner: Arc::new(Inner {
                id: Uuid::new_v4(),
                name: self.name,
                work: Mutex::new(self.work),
                token,
                source,
                progress: Mutex::new(self.progress.unwrap_or_else(NullProgressReporter::shared)),
                runtime: self.runtime,
                context: self.context,
                core: Mutex::new(Core {
                    state: OperationState::NotStarted,
                    result: None,
                    callbacks: Vec::new(),
                }),
                done_cv: Condvar::new(),
                done_tx,
            }),
        }
    }
}

/// A one-shot, cancelable unit of work producing `OpResult<T>`.
///
/// Handles are cheap to clone. Dropping the last handle of a running
/// operation cancels it and delivers a cancelled result to its callbacks.
///
/// # Example
///
/// ```rust,ignore
/// use bulwark_core::AsyncOperation;
///
/// let op = AsyncOperation::new(|token, progress| async move {
///     progress.report_progress(0.5, "halfway");
///     token.check()?;
///     Ok(42)
/// });
/// op.on_complete(|result| println!("finished: {:?}", result));
/// op.start();
/// assert_eq!(op.result().await, Ok(42));
/// ```
pub struct AsyncOperation<T: Clone + Send + Sync + 'static> {
    inner: Arc<Inner<T>>,
}

impl<T: Clone + Send + Sync + 'static> Clone for AsyncOperation<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> std::fmt::Debug for AsyncOperation<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncOperation")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> AsyncOperation<T> {
    /// Start configuring an operation around `work`.
    pub fn builder<F, Fut>(work: F) -> OperationBuilder<T>
    where
        F: FnOnce(CancellationToken, Arc<dyn ProgressReporter>) -> Fut + Send + 'static,
        Fut: Future<Output = OpResult<T>> + Send + 'static,
    {
        OperationBuilder {
            work: Some(Box::new(move |token, progress| work(token, progress).boxed())),
            token: None,
            progress: None,
            runtime: None,
            context: None,
            name: "operation".to_string(),
        }
    }

    /// Create an operation that owns its cancellation token.
    pub fn new<F, Fut>(work: F) -> Self
    where
        F: FnOnce(CancellationToken, Arc<dyn ProgressReporter>) -> Fut + Send + 'static,
        Fut: Future<Output = OpResult<T>> + Send + 'static,
    {
        Self::builder(work).build()
    }

    /// Create an operation observing an externally owned token.
    pub fn with_cancellation<F, Fut>(work: F, token: CancellationToken) -> Self
    where
        F: FnOnce(CancellationToken, Arc<dyn ProgressReporter>) -> Fut + Send + 'static,
        Fut: Future<Output = OpResult<T>> + Send + 'static,
    {
        Self::builder(work).cancellation(token).build()
    }

    /// An operation that is already complete with `result`.
    pub fn completed(result: OpResult<T>) -> Self {
        let op = OperationBuilder {
            work: None,
            token: None,
            progress: None,
            runtime: None,
            context: None,
            name: "completed".to_string(),
        }
        .build();
        {
            let mut core = lock(&op.inner.core);
            core.state = OperationState::Running;
        }
        op.inner.complete(result);
        op
    }

    pub(crate) fn from_parts(
        builder: OperationBuilder<T>,
        runtime: Option<Handle>,
        context: Option<CompletionContext>,
    ) -> Self {
        let builder = OperationBuilder {
            runtime: builder.runtime.or(runtime),
            context: builder.context.or(context),
            ..builder
        };
        builder.build()
    }

    /// Schedule the work on the background runtime.
    ///
    /// Starting twice is a no-op. If no runtime is available the operation
    /// fails immediately.
    pub fn start(&self) {
        let inner = &self.inner;
        let work = {
            let mut core = lock(&inner.core);
            if core.state != OperationState::NotStarted {
                warn!(
                    "Operation {} ({}) already started (state {})",
                    inner.name, inner.id, core.state
                );
                return;
            }
            core.state = OperationState::Running;
            lock(&inner.work).take()
        };

        let Some(work) = work else {
            inner.complete(Err(OpError::internal("No work function provided")));
            return;
        };

        debug!("Operation {} ({}) started", inner.name, inner.id);
        let weak = Arc::downgrade(inner);
        let token = inner.token.clone();
        let progress = lock(&inner.progress).clone();
        let task = async move {
            let result = run_work(work, token, progress).await;
            if let Some(inner) = weak.upgrade() {
                inner.complete(result);
            }
        };

        if let Err(e) = spawn_background(inner.runtime.as_ref(), task) {
            inner.complete(Err(OpError::internal(format!(
                "Failed to schedule operation: {}",
                e
            ))));
        }
    }

    /// Request cancellation and complete as cancelled if still pending.
    ///
    /// An external token is left untouched; the work keeps running until it
    /// observes that token on its own.
    pub fn cancel(&self) {
        let inner = &self.inner;
        match &inner.source {
            Some(source) => source.cancel(),
            None => warn!(
                "Cannot cancel operation {} ({}) - external token without source",
                inner.name, inner.id
            ),
        }
        inner.complete(Err(OpError::cancelled("Operation cancelled")));
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> OperationState {
        lock(&self.inner.core).state
    }

    pub fn is_running(&self) -> bool {
        self.state() == OperationState::Running
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == OperationState::Cancelled
    }

    pub fn is_complete(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    /// Replace the progress reporter. Takes effect only before `start()`.
    pub fn set_progress_reporter(&self, reporter: Arc<dyn ProgressReporter>) {
        *lock(&self.inner.progress) = reporter;
    }

    /// Stored result, if the operation has finished.
    pub fn try_result(&self) -> Option<OpResult<T>> {
        lock(&self.inner.core).result.clone()
    }

    /// Register a callback invoked exactly once with the final result.
    ///
    /// If the operation already finished, the callback is queued on the
    /// completion context right away.
    pub fn on_complete(&self, callback: impl FnOnce(&OpResult<T>) + Send + 'static) {
        let mut core = lock(&self.inner.core);
        match core.result.clone() {
            Some(result) if core.state.is_terminal() => {
                drop(core);
                deliver(self.inner.context.as_ref(), vec![Box::new(callback)], result);
            }
            _ => core.callbacks.push(Box::new(callback)),
        }
    }

    /// Wait for the result, giving up after `AsyncConfig::RESULT_WAIT_TIMEOUT`.
    ///
    /// The bound is a safety valve against waiting on an operation nobody
    /// started, not a deadline for the work itself. Use [`with_timeout`] for
    /// that.
    ///
    /// [`with_timeout`]: combinators::with_timeout
    pub async fn result(&self) -> OpResult<T> {
        self.result_within(AsyncConfig::RESULT_WAIT_TIMEOUT).await
    }

    pub async fn result_within(&self, limit: Duration) -> OpResult<T> {
        match tokio::time::timeout(limit, self.completed_result()).await {
            Ok(result) => result,
            Err(_) => Err(OpError::timeout("Operation timed out")),
        }
    }

    /// Block the calling thread until the result is available.
    ///
    /// Bounded by `AsyncConfig::RESULT_WAIT_TIMEOUT`. Must not be called from
    /// a thread driving the operation's runtime.
    pub fn blocking_result(&self) -> OpResult<T> {
        let core = lock(&self.inner.core);
        let (core, _) = self
            .inner
            .done_cv
            .wait_timeout_while(core, AsyncConfig::RESULT_WAIT_TIMEOUT, |core| {
                !core.state.is_terminal()
            })
            .unwrap_or_else(PoisonError::into_inner);
        core.result
            .clone()
            .unwrap_or_else(|| Err(OpError::timeout("Operation timed out")))
    }

    /// Wait for the result with no bound.
    pub(crate) async fn completed_result(&self) -> OpResult<T> {
        let mut done = self.inner.done_tx.subscribe();
        let _ = done.wait_for(|finished| *finished).await;
        self.try_result()
            .unwrap_or_else(|| Err(OpError::internal("Operation finished without a result")))
    }

    /// Chain a continuation run with this operation's value.
    ///
    /// The returned operation is already running. A failure of this operation
    /// propagates unchanged and the continuation never runs.
    pub fn then<U, F, Fut>(&self, continuation: F) -> AsyncOperation<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = OpResult<U>> + Send + 'static,
    {
        let previous = self.clone();
        let next = AsyncOperation::<U>::builder(move |token, _progress| async move {
            let value = tokio::select! {
                result = previous.completed_result() => result?,
                _ = token.cancelled() => {
                    return Err(OpError::cancelled("Operation cancelled"));
                }
            };
            continuation(value).await
        })
        .name(format!("{}.then", self.inner.name));
        let next = AsyncOperation::from_parts(
            next,
            self.inner.runtime.clone(),
            self.inner.context.clone(),
        );
        next.start();
        next
    }

    pub(crate) fn runtime(&self) -> Option<Handle> {
        self.inner.runtime.clone()
    }

    pub(crate) fn completion_context(&self) -> Option<CompletionContext> {
        self.inner.context.clone()
    }
}
