//! Process shutdown signal consulted by wait loops.
//!
//! Once requested, in-flight HTTP waits and combinator loops abandon their
//! work promptly instead of holding the process open during teardown.

use crate::error::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::info;

#[derive(Debug, Default)]
struct SignalInner {
    requested: AtomicBool,
    notify: Notify,
}

/// Clonable "the process is exiting" flag.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<SignalInner>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flag shutdown and wake every waiter. Repeated calls are no-ops.
    pub fn request(&self) {
        if !self.inner.requested.swap(true, Ordering::SeqCst) {
            info!("Shutdown requested");
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Wait until shutdown is requested.
    pub async fn requested(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.is_requested() {
            return;
        }
        notified.await;
    }

    /// Trip this signal on SIGINT / CTRL-C.
    ///
    /// Only one handler can be installed per process.
    pub fn install_ctrlc_handler(&self) -> Result<()> {
        let signal = self.clone();
        ctrlc::set_handler(move || signal.request())?;
        Ok(())
    }
}
