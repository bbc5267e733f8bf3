//! Execution substrate for async operations.
//!
//! Work runs on a tokio runtime. User-visible callbacks (completion handlers,
//! progress observers) are posted to a `CompletionContext`: a dedicated thread
//! draining a FIFO queue, so callbacks never run concurrently with each other
//! and never re-enter the thread that triggered them.

use crate::config::AsyncConfig;
use crate::error::{BulwarkError, Result};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

type Job = Box<dyn FnOnce() + Send>;

#[derive(Debug)]
struct ContextInner {
    name: String,
    sender: mpsc::Sender<Job>,
    thread_id: ThreadId,
}

/// A serial callback queue backed by one named OS thread.
///
/// The thread exits once every clone of the context has been dropped and the
/// queue is drained.
#[derive(Debug, Clone)]
pub struct CompletionContext {
    inner: Arc<ContextInner>,
}

static GLOBAL: OnceLock<CompletionContext> = OnceLock::new();

impl CompletionContext {
    /// Spawn a new completion thread.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let (sender, receiver) = mpsc::channel::<Job>();

        let thread_name = name.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                for job in receiver {
                    if catch_unwind(AssertUnwindSafe(job)).is_err() {
                        error!("Callback panicked on completion context {}", thread_name);
                    }
                }
                debug!("Completion context {} stopped", thread_name);
            })?;

        Ok(Self {
            inner: Arc::new(ContextInner {
                name,
                sender,
                thread_id: handle.thread().id(),
            }),
        })
    }

    /// The process-wide default context, created on first use.
    pub fn global() -> Result<Self> {
        if let Some(context) = GLOBAL.get() {
            return Ok(context.clone());
        }
        let context = Self::new(AsyncConfig::COMPLETION_THREAD_NAME)?;
        Ok(GLOBAL.get_or_init(|| context).clone())
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Queue `job` behind everything already posted.
    pub fn post(&self, job: impl FnOnce() + Send + 'static) {
        if self.inner.sender.send(Box::new(job)).is_err() {
            warn!("Completion context {} is gone; dropping callback", self.inner.name);
        }
    }

    /// Whether the calling thread is this context's thread.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.inner.thread_id
    }

    /// Resolve once every job posted before this call has run.
    pub async fn flushed(&self) {
        let (tx, rx) = oneshot::channel();
        self.post(move || {
            let _ = tx.send(());
        });
        let _ = rx.await;
    }
}

/// Spawn background work on `runtime`, or on the ambient runtime if none is given.
pub(crate) fn spawn_background<F>(runtime: Option<&Handle>, future: F) -> Result<JoinHandle<()>>
where
    F: Future<Output = ()> + Send + 'static,
{
    let handle = match runtime {
        Some(handle) => handle.clone(),
        None => Handle::try_current().map_err(|e| BulwarkError::NoRuntime(e.to_string()))?,
    };
    Ok(handle.spawn(future))
}
