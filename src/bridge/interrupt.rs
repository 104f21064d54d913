//! Request cancellation.
//!
//! Every kernel request carries a unique id. While a handler is inside a
//! potentially blocking filesystem call it keeps its request registered
//! here; if the kernel reports the originating call was cancelled, the
//! matching token is cancelled. Filesystem implementations observe the
//! token through [`RequestCtx::interrupted`](crate::fs::RequestCtx) or by
//! sleeping on [`CancelToken::wait_timeout`] instead of a plain sleep.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::fs::RequestCtx;

/// A cancellation flag shared between the dispatcher and the blocking
/// call it guards. Cloning is cheap; all clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

#[derive(Debug, Default)]
struct TokenInner {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        let _guard = self.inner.lock.lock();
        self.inner.cond.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Sleep for at most `timeout`, waking early on cancellation.
    /// Returns the cancellation state on wakeup.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        let mut guard = self.inner.lock.lock();
        if !self.is_cancelled() {
            self.inner.cond.wait_for(&mut guard, timeout);
        }
        self.is_cancelled()
    }
}

/// Registry of in-flight requests that can currently be interrupted.
pub(crate) struct InterruptCoordinator {
    enabled: bool,
    pending: Mutex<HashMap<u64, CancelToken>>,
}

impl InterruptCoordinator {
    pub fn new(enabled: bool) -> Self {
        InterruptCoordinator {
            enabled,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Register the request for the duration of a blocking section.
    /// Deregistration happens when the returned guard drops. With the
    /// feature disabled this is a no-op guard.
    pub fn register(&self, ctx: &RequestCtx) -> InterruptGuard<'_> {
        if !self.enabled {
            return InterruptGuard {
                coordinator: self,
                unique: None,
            };
        }
        self.pending.lock().insert(ctx.unique, ctx.token().clone());
        InterruptGuard {
            coordinator: self,
            unique: Some(ctx.unique),
        }
    }

    /// Cancel the request with the given id, if it is still registered.
    /// Returns whether a registration was found.
    pub fn interrupt(&self, unique: u64) -> bool {
        let token = self.pending.lock().get(&unique).cloned();
        match token {
            Some(token) => {
                tracing::debug!("interrupt(unique={})", unique);
                token.cancel();
                true
            }
            None => false,
        }
    }
}

pub(crate) struct InterruptGuard<'a> {
    coordinator: &'a InterruptCoordinator,
    unique: Option<u64>,
}

impl Drop for InterruptGuard<'_> {
    fn drop(&mut self) {
        if let Some(unique) = self.unique {
            self.coordinator.pending.lock().remove(&unique);
        }
    }
}
