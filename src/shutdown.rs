//! Graceful-shutdown signaling for WebSocket handlers.
//!
//! Handlers register on accept and watch for the shutdown flag; the server
//! flips it before stopping axum so every handler gets a chance to flush a
//! close frame instead of having the TCP connection yanked away.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

#[derive(Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    tx: watch::Sender<bool>,
    active: AtomicUsize,
}

/// RAII guard for one registered connection; dropping it deregisters.
pub struct ConnectionGuard {
    inner: Arc<Inner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.active.fetch_sub(1, Ordering::Release);
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                tx,
                active: AtomicUsize::new(0),
            }),
        }
    }

    /// Register a connection. The returned receiver flips to `true` when
    /// shutdown is signaled.
    pub fn register(&self) -> (ConnectionGuard, watch::Receiver<bool>) {
        self.inner.active.fetch_add(1, Ordering::AcqRel);
        (
            ConnectionGuard {
                inner: Arc::clone(&self.inner),
            },
            self.inner.tx.subscribe(),
        )
    }

    /// Signal shutdown to every registered connection.
    pub fn shutdown(&self) {
        let _ = self.inner.tx.send(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.inner.tx.borrow()
    }

    pub fn active_connections(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
