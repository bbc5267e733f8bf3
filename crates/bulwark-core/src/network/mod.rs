//! Network resilience and HTTP operations.
//!
//! This module provides:
//! - Circuit breaker pattern for network resilience, plus a name-keyed registry
//! - Retry policies with fixed, linear or exponential backoff and jitter
//! - HTTP request/response descriptors and a pluggable transport
//! - `HttpAsyncOperation`, which composes all of the above

mod circuit_breaker;
mod http;
mod operation;
mod registry;
mod retry;
mod transport;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use http::{extract_domain, HttpRequest, HttpResponse};
pub use operation::HttpAsyncOperation;
pub use registry::CircuitBreakerRegistry;
pub use retry::{predicates, RetryPolicy, RetryPolicyConfig, RetryPredicate, RetryStats, RetryStrategy};
pub use transport::{
    HttpTransport, InFlightRequest, RawResponse, ReqwestTransport, RequestState, TransferOutcome,
    TransferProgressFn, TransportRequest,
};
