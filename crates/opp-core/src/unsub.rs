//! Cancellation handles returned by every registration

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct Inner {
    cancelled: AtomicBool,
    cancel: Box<dyn Fn() + Send + Sync>,
}

/// Idempotent handle that undoes a registration
///
/// Clones share the same registration. Calling [`Unsub::cancel`] more than
/// once, from any clone or from inside the registered callback itself, runs
/// the undo action exactly once. Dropping the handle does NOT cancel.
#[derive(Clone)]
pub struct Unsub {
    inner: Arc<Inner>,
}

impl Unsub {
    pub fn new<F>(cancel: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                cancel: Box::new(cancel),
            }),
        }
    }

    /// A handle with nothing to undo
    pub fn noop() -> Self {
        Self::new(|| {})
    }

    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::AcqRel) {
            (self.inner.cancel)();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Unsub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unsub")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
