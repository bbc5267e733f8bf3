//! Transport seam between `HttpAsyncOperation` and the actual HTTP client.
//!
//! A transport accepts a request synchronously and reports the outcome
//! later by writing into a shared `RequestState`. The default
//! implementation drives reqwest on the tokio runtime.

use super::http::HttpRequest;
use crate::config::HttpConfig;
use crate::error::Result;
use crate::lock;
use futures::StreamExt;
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::{Client, Method};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tracing::debug;

/// Request as handed to a transport.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportRequest {
    pub verb: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub timeout: Option<Duration>,
}

impl From<&HttpRequest> for TransportRequest {
    fn from(request: &HttpRequest) -> Self {
        Self {
            verb: request.verb.clone(),
            url: request.url.clone(),
            headers: request.effective_headers(),
            body: (!request.body.is_empty()).then(|| request.body.clone()),
            timeout: (!request.timeout.is_zero()).then_some(request.timeout),
        }
    }
}

/// Status, body and raw "Key: Value" header lines of a completed transfer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
    pub header_lines: Vec<String>,
}

/// How a transfer ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferOutcome {
    /// A response arrived, whatever its status.
    Completed(RawResponse),
    /// The transport's own deadline expired before a response arrived.
    TimedOut,
    /// No response: connection, DNS or body read failure.
    Failed(String),
}

/// Completion cell shared by the waiting operation and the transport.
///
/// Only the first outcome is kept.
#[derive(Debug, Default)]
pub struct RequestState {
    completed: AtomicBool,
    outcome: Mutex<Option<TransferOutcome>>,
    notify: Notify,
}

impl RequestState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome. Returns `false` if one was already recorded.
    pub fn complete(&self, outcome: TransferOutcome) -> bool {
        {
            let mut slot = lock(&self.outcome);
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
        }
        self.completed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        true
    }

    pub fn is_complete(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn take_outcome(&self) -> Option<TransferOutcome> {
        lock(&self.outcome).take()
    }

    /// Wait until an outcome has been recorded.
    pub async fn wait(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.is_complete() {
            return;
        }
        notified.await;
    }
}

/// Called with `(bytes_transferred, content_length)` as data moves.
pub type TransferProgressFn = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// Handle on a submitted request.
pub trait InFlightRequest: Send + Sync {
    /// Abort the transfer. The state may never be completed afterwards.
    fn cancel(&self);
}

/// An HTTP client able to run `TransportRequest`s in the background.
pub trait HttpTransport: Send + Sync {
    /// Start `request`. The outcome is written to `state`.
    ///
    /// An `Err` means the request was never sent.
    fn submit(
        &self,
        request: TransportRequest,
        state: Arc<RequestState>,
        on_progress: TransferProgressFn,
    ) -> std::result::Result<Box<dyn InFlightRequest>, String>;
}

/// reqwest-backed transport. Transfers run on the current tokio runtime.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(HttpConfig::USER_AGENT)
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

struct ReqwestInFlight {
    task: AbortHandle,
    state: Arc<RequestState>,
}

impl InFlightRequest for ReqwestInFlight {
    fn cancel(&self) {
        self.task.abort();
        self.state
            .complete(TransferOutcome::Failed("Request cancelled".to_string()));
    }
}

impl HttpTransport for ReqwestTransport {
    fn submit(
        &self,
        request: TransportRequest,
        state: Arc<RequestState>,
        on_progress: TransferProgressFn,
    ) -> std::result::Result<Box<dyn InFlightRequest>, String> {
        let handle = Handle::try_current().map_err(|e| e.to_string())?;
        let method = Method::from_bytes(request.verb.as_bytes())
            .map_err(|_| format!("Invalid HTTP verb '{}'", request.verb))?;

        let mut builder = self.client.request(method, &request.url);
        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        let built = builder.build().map_err(|e| e.to_string())?;

        let client = self.client.clone();
        let task_state = state.clone();
        let task = handle.spawn(async move {
            let outcome = match transfer(&client, built, &on_progress).await {
                Ok(raw) => TransferOutcome::Completed(raw),
                Err(e) if e.is_timeout() => TransferOutcome::TimedOut,
                Err(e) => {
                    debug!("HTTP transfer failed: {}", e);
                    TransferOutcome::Failed(e.to_string())
                }
            };
            task_state.complete(outcome);
        });

        Ok(Box::new(ReqwestInFlight {
            task: task.abort_handle(),
            state,
        }))
    }
}

/// Render a header as a `Name: value` line. Non-UTF-8 bytes are replaced,
/// not dropped.
fn header_line(name: &HeaderName, value: &HeaderValue) -> String {
    format!("{}: {}", name, String::from_utf8_lossy(value.as_bytes()))
}

async fn transfer(
    client: &Client,
    request: reqwest::Request,
    on_progress: &TransferProgressFn,
) -> std::result::Result<RawResponse, reqwest::Error> {
    let response = client.execute(request).await?;
    let status = response.status().as_u16();
    let header_lines = response
        .headers()
        .iter()
        .map(|(name, value)| header_line(name, value))
        .collect();
    let total = response.content_length();

    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        body.extend_from_slice(&chunk?);
        on_progress(body.len() as u64, total);
    }

    Ok(RawResponse {
        status,
        body: String::from_utf8_lossy(&body).into_owned(),
        header_lines,
    })
}
