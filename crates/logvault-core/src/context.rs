//! Cancellation and the per-daemon context handed to modules.
//!
//! The context bundles what every module needs at provision time: the cancel
//! token observed by long-running loops, the shared metric vectors, the
//! registry for resolving nested modules, and an inventory of everything
//! loaded through it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::Notify;

use crate::metric::ArchiveMetrics;
use crate::module::{ModuleId, Registry};

#[derive(Debug, Default)]
struct TokenInner {
    cancelled: AtomicBool,
    notify: Notify,
    children: Mutex<Vec<Weak<TokenInner>>>,
}

impl TokenInner {
    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.notify.notify_waiters();
        let children = std::mem::take(&mut *self.children.lock().unwrap());
        for child in children {
            if let Some(child) = child.upgrade() {
                child.cancel();
            }
        }
    }
}

/// A clonable cancellation token with parent-to-child propagation.
///
/// Cancelling a parent cancels every token derived from it via
/// [`child`](CancelToken::child); cancelling a child leaves the parent
/// untouched. Cancellation is the universal stop signal observed by every
/// long-running loop.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a token that is cancelled when `self` is cancelled.
    pub fn child(&self) -> Self {
        let child = Self::new();
        if self.inner.cancelled.load(Ordering::SeqCst) {
            child.cancel();
        } else {
            self.inner
                .children
                .lock()
                .unwrap()
                .push(Arc::downgrade(&child.inner));
        }
        child
    }

    /// Idempotent.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            // re-check so a cancel between the flag read and registration
            // cannot be missed
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// The lifetime context of a loaded daemon configuration.
#[derive(Clone)]
pub struct Context {
    cancel: CancelToken,
    registry: Arc<Registry>,
    metrics: Arc<ArchiveMetrics>,
    loaded: Arc<Mutex<Vec<ModuleId>>>,
}

impl Context {
    pub fn new(registry: Arc<Registry>, metrics: Arc<ArchiveMetrics>) -> Self {
        Self {
            cancel: CancelToken::new(),
            registry,
            metrics,
            loaded: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A context sharing this one's registry and metrics, with a derived
    /// cancel token and a fresh inventory.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child(),
            registry: self.registry.clone(),
            metrics: self.metrics.clone(),
            loaded: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<ArchiveMetrics> {
        &self.metrics
    }

    pub(crate) fn record_loaded(&self, id: ModuleId) {
        self.loaded.lock().unwrap().push(id);
    }

    /// Ids of every module loaded through this context, in load order.
    pub fn loaded_modules(&self) -> Vec<ModuleId> {
        self.loaded.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn cancel_is_idempotent_and_observable() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn parent_cancel_propagates_to_children() {
        let parent = CancelToken::new();
        let child = parent.child();
        let grandchild = child.child();

        parent.cancel();
        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
    }

    #[test]
    fn child_cancel_leaves_parent_running() {
        let parent = CancelToken::new();
        let child = parent.child();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn child_of_cancelled_parent_starts_cancelled() {
        let parent = CancelToken::new();
        parent.cancel();
        assert!(parent.child().is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_future_resolves_on_cancel() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("cancelled() should resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn cancelled_future_resolves_immediately_when_already_cancelled() {
        let token = CancelToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .expect("already-cancelled token must not block");
    }
}
