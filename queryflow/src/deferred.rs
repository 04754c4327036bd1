//! Manually-settled deferred values.
//!
//! A [`DeferredValue`] bridges an external completion signal (a freed
//! concurrency slot, a filled cache entry, an expired staleness window) into
//! any number of independently-awaiting consumers. One code path settles it
//! exactly once with [`DeferredValue::success`] or [`DeferredValue::fail`];
//! every consumer that requested a [`DeferredValue::result`] while it was
//! pending observes that single settlement.

use parking_lot::Mutex;
use std::fmt;
use tokio::sync::oneshot;

/// The lifecycle status of a deferred value.
///
/// Transitions are one-way: `Pending → Resolved` or `Pending → Rejected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredStatus {
    /// Not yet settled.
    Pending,
    /// Settled successfully.
    Resolved,
    /// Settled with a rejection.
    Rejected,
}

/// What a settled deferred delivers to each waiter.
///
/// `None` on either side means "settled without a payload and no default was
/// configured".
pub type Settled<T, E> = Result<Option<T>, Option<E>>;

struct Inner<T, E> {
    status: DeferredStatus,
    value: Option<T>,
    error: Option<E>,
    waiters: Vec<oneshot::Sender<Settled<T, E>>>,
}

/// A future that is settled by hand rather than by a computation.
///
/// Optionally carries a default value and a default rejection reason, adopted
/// when the deferred is settled without an explicit payload. Settling a
/// non-pending deferred is a no-op, so multiple independent "who unblocks me"
/// signals may race without double-firing.
pub struct DeferredValue<T, E> {
    inner: Mutex<Inner<T, E>>,
}

impl<T: Clone, E: Clone> DeferredValue<T, E> {
    /// Creates a pending deferred with no defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                status: DeferredStatus::Pending,
                value: None,
                error: None,
                waiters: Vec::new(),
            }),
        }
    }

    /// Sets the default value adopted by a payload-less [`Self::success`].
    #[must_use]
    pub fn with_default(mut self, value: T) -> Self {
        self.inner.get_mut().value = Some(value);
        self
    }

    /// Sets the default reason adopted by a payload-less [`Self::fail`].
    #[must_use]
    pub fn with_default_error(mut self, error: E) -> Self {
        self.inner.get_mut().error = Some(error);
        self
    }

    /// Returns the current status.
    pub fn status(&self) -> DeferredStatus {
        self.inner.lock().status
    }

    /// Returns true while the deferred has not been settled.
    pub fn is_pending(&self) -> bool {
        self.status() == DeferredStatus::Pending
    }

    /// Returns an awaitable for the settled outcome.
    ///
    /// May be called any number of times: while pending, each call registers
    /// an independent waiter, and all outstanding waiters are notified in
    /// registration order when the deferred settles. Once settled, the
    /// outcome is returned immediately.
    pub async fn result(&self) -> Settled<T, E> {
        let rx = {
            let mut inner = self.inner.lock();
            match inner.status {
                DeferredStatus::Resolved => return Ok(inner.value.clone()),
                DeferredStatus::Rejected => return Err(inner.error.clone()),
                DeferredStatus::Pending => {
                    let (tx, rx) = oneshot::channel();
                    inner.waiters.push(tx);
                    rx
                }
            }
        };
        // A dropped sender can only mean the deferred itself was torn down;
        // surface that as an empty rejection.
        rx.await.unwrap_or(Err(None))
    }

    /// Resolves the deferred, adopting `value` when given and the configured
    /// default otherwise. No-op if already settled.
    pub fn success(&self, value: Option<T>) {
        let (payload, waiters) = {
            let mut inner = self.inner.lock();
            if inner.status != DeferredStatus::Pending {
                return;
            }
            if value.is_some() {
                inner.value = value;
            }
            inner.status = DeferredStatus::Resolved;
            (inner.value.clone(), std::mem::take(&mut inner.waiters))
        };
        for waiter in waiters {
            let _ = waiter.send(Ok(payload.clone()));
        }
    }

    /// Rejects the deferred, adopting `reason` when given and the configured
    /// default otherwise. No-op if already settled.
    pub fn fail(&self, reason: Option<E>) {
        let (payload, waiters) = {
            let mut inner = self.inner.lock();
            if inner.status != DeferredStatus::Pending {
                return;
            }
            if reason.is_some() {
                inner.error = reason;
            }
            inner.status = DeferredStatus::Rejected;
            (inner.error.clone(), std::mem::take(&mut inner.waiters))
        };
        for waiter in waiters {
            let _ = waiter.send(Err(payload.clone()));
        }
    }
}

impl<T: Clone, E: Clone> Default for DeferredValue<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> fmt::Debug for DeferredValue<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredValue")
            .field("status", &self.inner.lock().status)
            .finish_non_exhaustive()
    }
}
