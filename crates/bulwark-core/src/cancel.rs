//! Cooperative cancellation for async operations.
//!
//! This module provides:
//! - `CancellationTokenSource`: the only handle that can request cancellation
//! - `CancellationToken`: a cheap, clonable view that work polls or awaits
//! - Linked tokens that are cancelled whenever their parent is
//!
//! A parent holds its linked children weakly; a child outlives its parent only
//! while someone else holds it.

use crate::error::{OpError, OpResult};
use crate::lock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Notify;
use tracing::{debug, warn};

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct CallbackTable {
    next_id: u64,
    entries: Vec<(u64, Callback)>,
}

#[derive(Default)]
struct TokenInner {
    requested: AtomicBool,
    callbacks: Mutex<CallbackTable>,
    linked: Mutex<Vec<Weak<TokenInner>>>,
    notify: Notify,
}

impl TokenInner {
    fn request_cancellation(&self) {
        if self
            .requested
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let callbacks = std::mem::take(&mut lock(&self.callbacks).entries);
        self.notify.notify_waiters();

        for (id, callback) in callbacks {
            if catch_unwind(AssertUnwindSafe(callback)).is_err() {
                warn!("Cancellation callback {} panicked", id);
            }
        }

        let linked = std::mem::take(&mut *lock(&self.linked));
        for child in linked.iter().filter_map(Weak::upgrade) {
            child.request_cancellation();
        }
    }
}

/// A cancellation token observed by in-flight work.
///
/// # Example
///
/// ```
/// use bulwark_core::cancel::CancellationTokenSource;
///
/// let source = CancellationTokenSource::new();
/// let token = source.token();
/// let child = token.create_linked_token();
///
/// source.cancel();
/// assert!(token.is_cancellation_requested());
/// assert!(child.is_cancellation_requested());
/// ```
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

impl CancellationToken {
    fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner::default()),
        }
    }

    /// Check if cancellation has been requested. Lock-free.
    pub fn is_cancellation_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Register a callback to run once when cancellation is requested.
    ///
    /// If cancellation was already requested, the callback runs immediately on
    /// the calling thread and the returned handle is empty.
    pub fn register_callback(&self, callback: impl FnOnce() + Send + 'static) -> CallbackHandle {
        let mut table = lock(&self.inner.callbacks);
        if self.is_cancellation_requested() {
            drop(table);
            callback();
            return CallbackHandle::empty();
        }

        table.next_id += 1;
        let id = table.next_id;
        table.entries.push((id, Box::new(callback)));
        CallbackHandle {
            id,
            owner: Arc::downgrade(&self.inner),
        }
    }

    /// Remove a previously registered callback.
    ///
    /// Returns `false` if the handle is empty, belongs to another token, or the
    /// callback already ran.
    pub fn unregister_callback(&self, handle: &CallbackHandle) -> bool {
        let owned = handle
            .owner
            .upgrade()
            .is_some_and(|owner| Arc::ptr_eq(&owner, &self.inner));
        if !owned {
            return false;
        }

        let mut table = lock(&self.inner.callbacks);
        let before = table.entries.len();
        table.entries.retain(|(id, _)| *id != handle.id);
        table.entries.len() != before
    }

    /// Create a child token cancelled whenever this token is.
    pub fn create_linked_token(&self) -> CancellationToken {
        let child = CancellationToken::new();

        let mut linked = lock(&self.inner.linked);
        if self.is_cancellation_requested() {
            drop(linked);
            child.inner.request_cancellation();
        } else {
            linked.retain(|weak| weak.strong_count() > 0);
            linked.push(Arc::downgrade(&child.inner));
        }

        child
    }

    /// Wait until cancellation is requested.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.is_cancellation_requested() {
            return;
        }
        notified.await;
    }

    /// Return a `Cancelled` error if cancellation has been requested.
    pub fn check(&self) -> OpResult<()> {
        if self.is_cancellation_requested() {
            Err(OpError::cancelled("Operation cancelled"))
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("requested", &self.is_cancellation_requested())
            .finish()
    }
}

/// Handle to a registered cancellation callback.
#[derive(Debug, Clone)]
pub struct CallbackHandle {
    id: u64,
    owner: Weak<TokenInner>,
}

impl CallbackHandle {
    fn empty() -> Self {
        Self {
            id: 0,
            owner: Weak::new(),
        }
    }

    /// True when the callback was never stored (the token was already cancelled).
    pub fn is_empty(&self) -> bool {
        self.id == 0
    }
}

/// Owner of a cancellation token.
///
/// Dropping the source cancels its token.
#[derive(Debug)]
pub struct CancellationTokenSource {
    token: CancellationToken,
}

impl CancellationTokenSource {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Create a source whose token is also cancelled when `parent` is.
    pub fn linked_to(parent: &CancellationToken) -> Self {
        Self {
            token: parent.create_linked_token(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Request cancellation. Repeated calls are no-ops.
    pub fn cancel(&self) {
        if !self.token.is_cancellation_requested() {
            debug!("Cancellation requested");
        }
        self.token.inner.request_cancellation();
    }

    pub fn is_cancellation_requested(&self) -> bool {
        self.token.is_cancellation_requested()
    }
}

impl Default for CancellationTokenSource {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CancellationTokenSource {
    fn drop(&mut self) {
        self.token.inner.request_cancellation();
    }
}
