//! Hierarchical cancellation.
//!
//! A `Context` is cancelled explicitly or when any of its ancestors is
//! cancelled. Subscriptions hand each delivered message a child of the
//! subscription context so that stopping the subscription reaches every
//! in-flight message.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::watch;

struct Inner {
    cancel: watch::Sender<bool>,
    parent: Option<Context>,
}

/// Cloneable cancellation handle.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl Context {
    /// Root context, never cancelled unless `cancel` is called on it.
    pub fn background() -> Self {
        Self::with_parent(None)
    }

    /// Child context, cancelled together with `self`.
    pub fn child(&self) -> Self {
        Self::with_parent(Some(self.clone()))
    }

    fn with_parent(parent: Option<Context>) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner { cancel, parent }),
        }
    }

    /// Cancel this context and all of its descendants.
    pub fn cancel(&self) {
        self.inner.cancel.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        if *self.inner.cancel.borrow() {
            return true;
        }
        match &self.inner.parent {
            Some(parent) => parent.is_cancelled(),
            None => false,
        }
    }

    /// Resolves once this context or an ancestor is cancelled.
    pub fn cancelled(&self) -> BoxFuture<'static, ()> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            let mut rx = inner.cancel.subscribe();
            let own = async move {
                // The sender lives in `inner`, so this only returns on cancel.
                let _ = rx.wait_for(|cancelled| *cancelled).await;
            };
            match &inner.parent {
                Some(parent) => {
                    tokio::select! {
                        _ = own => {}
                        _ = parent.cancelled() => {}
                    }
                }
                None => own.await,
            }
        })
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
