//! Error types for Bulwark.
//!
//! This module provides:
//! - `BulwarkError`: setup and infrastructure failures (client construction,
//!   dispatcher threads, signal handlers)
//! - `OpError`: the failure payload every async operation, retry policy and
//!   circuit breaker produces, tagged with a structured `ErrorKind`
//! - `OpResultExt`: context stacking and side-effect hooks for `OpResult`

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tracing::warn;

/// Infrastructure error type for the Bulwark library.
#[derive(Debug, Error)]
pub enum BulwarkError {
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("HTTP client error: {message}")]
    HttpClient {
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    #[error("Failed to install signal handler: {0}")]
    SignalHandler(String),

    #[error("No async runtime available: {0}")]
    NoRuntime(String),
}

/// Result type alias for infrastructure operations.
pub type Result<T> = std::result::Result<T, BulwarkError>;

impl From<std::io::Error> for BulwarkError {
    fn from(err: std::io::Error) -> Self {
        BulwarkError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for BulwarkError {
    fn from(err: reqwest::Error) -> Self {
        BulwarkError::HttpClient {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl BulwarkError {
    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            BulwarkError::HttpClient {
                source: Some(err), ..
            } => err.is_timeout() || err.is_connect(),
            _ => false,
        }
    }
}

impl From<ctrlc::Error> for BulwarkError {
    fn from(err: ctrlc::Error) -> Self {
        BulwarkError::SignalHandler(err.to_string())
    }
}

/// Classification of an operation failure, fixed where the failure is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Request was malformed before any I/O happened.
    Validation,
    /// Transport rejected the request synchronously.
    Submission,
    /// No response received (DNS, connection, transfer failure).
    Network,
    /// Wall-clock deadline or iteration budget exceeded.
    Timeout,
    /// Token fired or shutdown was requested.
    Cancelled,
    /// Response received with a status outside 2xx.
    HttpStatus(u16),
    /// Rejected by an open circuit breaker without attempting I/O.
    CircuitOpen,
    /// Panic or invariant violation inside a work closure.
    Internal,
    Unknown,
}

impl ErrorKind {
    /// Whether a failure of this kind is worth retrying.
    ///
    /// Network and timeout failures are transient, as are 5xx responses,
    /// 408 Request Timeout and 429 Too Many Requests.
    pub fn is_transient(&self) -> bool {
        match self {
            ErrorKind::Network | ErrorKind::Timeout => true,
            ErrorKind::HttpStatus(status) => {
                (500..600).contains(status) || *status == 429 || *status == 408
            }
            _ => false,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Validation => write!(f, "validation"),
            ErrorKind::Submission => write!(f, "submission"),
            ErrorKind::Network => write!(f, "network"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::Cancelled => write!(f, "cancelled"),
            ErrorKind::HttpStatus(status) => write!(f, "http {}", status),
            ErrorKind::CircuitOpen => write!(f, "circuit open"),
            ErrorKind::Internal => write!(f, "internal"),
            ErrorKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// Failure payload of an async operation.
///
/// `context` holds breadcrumbs in the order they were added; the root
/// `message`, `kind` and `code` never change once the error is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpError {
    pub kind: ErrorKind,
    pub message: String,
    pub code: i32,
    pub context: Vec<String>,
    pub metadata: BTreeMap<String, String>,
}

/// Result of an async operation.
pub type OpResult<T> = std::result::Result<T, OpError>;

impl OpError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: 0,
            context: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn submission(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Submission, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    /// HTTP status failure; the status is also stored as the numeric code.
    pub fn http_status(status: u16, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::HttpStatus(status), message).with_code(i32::from(status))
    }

    pub fn circuit_open(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CircuitOpen, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Add a diagnostic breadcrumb without touching the root cause.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context.push(context.into());
        self
    }

    pub fn with_code(mut self, code: i32) -> Self {
        self.code = code;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata.insert(key.into(), value.to_string());
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }

    /// Render the context chain outermost-first, ending in the root message.
    ///
    /// ```
    /// use bulwark_core::OpError;
    ///
    /// let err = OpError::network("connection refused")
    ///     .with_context("fetching usage")
    ///     .with_context("refreshing account");
    /// assert_eq!(
    ///     err.full_message(),
    ///     "refreshing account → fetching usage → connection refused"
    /// );
    /// ```
    pub fn full_message(&self) -> String {
        if self.context.is_empty() {
            return self.message.clone();
        }
        let mut parts: Vec<&str> = self.context.iter().rev().map(String::as_str).collect();
        parts.push(&self.message);
        parts.join(" → ")
    }
}

impl fmt::Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full_message())?;
        if self.code != 0 {
            write!(f, " (code {})", self.code)?;
        }
        Ok(())
    }
}

impl std::error::Error for OpError {}

/// Extension methods for `OpResult`.
pub trait OpResultExt<T>: Sized {
    /// Run `f` on the success value, passing the result through.
    fn tap(self, f: impl FnOnce(&T)) -> Self;

    /// Run `f` on the failure, passing the result through.
    fn tap_error(self, f: impl FnOnce(&OpError)) -> Self;

    fn with_context(self, context: impl Into<String>) -> Self;

    fn with_code(self, code: i32) -> Self;

    fn with_metadata(self, key: impl Into<String>, value: impl ToString) -> Self;

    /// Log the failure (if any) at warn level under `label`.
    fn log_on_failure(self, label: &str) -> Self {
        self.tap_error(|e| warn!("{} failed: {}", label, e))
    }
}

impl<T> OpResultExt<T> for OpResult<T> {
    fn tap(self, f: impl FnOnce(&T)) -> Self {
        if let Ok(value) = &self {
            f(value);
        }
        self
    }

    fn tap_error(self, f: impl FnOnce(&OpError)) -> Self {
        if let Err(err) = &self {
            f(err);
        }
        self
    }

    fn with_context(self, context: impl Into<String>) -> Self {
        self.map_err(|e| e.with_context(context))
    }

    fn with_code(self, code: i32) -> Self {
        self.map_err(|e| e.with_code(code))
    }

    fn with_metadata(self, key: impl Into<String>, value: impl ToString) -> Self {
        self.map_err(|e| e.with_metadata(key, value))
    }
}
