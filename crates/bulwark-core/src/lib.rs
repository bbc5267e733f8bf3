//! Bulwark Core - cancelable async operations and HTTP resilience.
//!
//! This crate provides the building blocks for calling unreliable HTTP
//! APIs from a long-running host process:
//! - Cancellation tokens and progress reporting
//! - `AsyncOperation<T>`, a one-shot background task with completion
//!   callbacks, plus combinators (`when_all`, `with_timeout`, `sequence`, ...)
//! - Circuit breakers and retry policies
//! - `HttpAsyncOperation`, which runs an HTTP request behind both
//!
//! # Example
//!
//! ```rust,ignore
//! use bulwark_core::{
//!     CircuitBreakerConfig, CircuitBreakerRegistry, HttpAsyncOperation, HttpRequest,
//!     RetryPolicy, RetryPolicyConfig,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> bulwark_core::Result<()> {
//!     let http = HttpAsyncOperation::with_reqwest()?;
//!     let registry = CircuitBreakerRegistry::new();
//!     let breaker = registry.get_or_create(CircuitBreakerConfig::named("api.example.com"));
//!     let retry = Arc::new(RetryPolicy::new(RetryPolicyConfig::default()));
//!
//!     let op = http.create_with_protection(
//!         HttpRequest::new("https://api.example.com/v1/usage"),
//!         breaker,
//!         retry,
//!         None,
//!     );
//!     op.on_complete(|result| println!("usage: {:?}", result.as_ref().map(|r| r.status_code)));
//!     op.start();
//!     op.result().await.ok();
//!
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod network;
pub mod operation;
pub mod progress;
pub mod shutdown;

// Re-export commonly used types
pub use cancel::{CallbackHandle, CancellationToken, CancellationTokenSource};
pub use config::{AsyncConfig, HttpConfig, ResilienceConfig};
pub use dispatch::CompletionContext;
pub use error::{BulwarkError, ErrorKind, OpError, OpResult, OpResultExt, Result};
pub use network::{
    extract_domain, predicates, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry,
    CircuitBreakerStats, CircuitState, HttpAsyncOperation, HttpRequest, HttpResponse,
    HttpTransport, ReqwestTransport, RetryPolicy, RetryPolicyConfig, RetryPredicate, RetryStats,
    RetryStrategy,
};
pub use operation::combinators::{
    delay, from_error, from_value, sequence, when_all, when_any, with_retry, with_timeout,
    OperationFactory,
};
pub use operation::{AsyncOperation, OperationBuilder, OperationState};
pub use progress::{AsyncProgress, NullProgressReporter, ObserverId, ProgressReporter, ProgressSnapshot};
pub use shutdown::ShutdownSignal;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock `mutex`, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
