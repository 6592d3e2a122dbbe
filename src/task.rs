//! Cooperative cancellation for background workers.
//!
//! Workers check [`CancelToken::is_cancelled`] at loop boundaries. Cancelling
//! never interrupts in-flight I/O, it only stops further writes and
//! notifications.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared cancel flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// A spawned worker together with its cancel flag.
///
/// Dropping the handle cancels the worker.
#[derive(Debug)]
pub struct WorkerHandle {
    token: CancelToken,
    join: tokio::task::JoinHandle<()>,
}

impl WorkerHandle {
    /// Spawn `make(token)` on the runtime.
    pub fn spawn<F, Fut>(make: F) -> Self
    where
        F: FnOnce(CancelToken) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let token = CancelToken::new();
        let join = tokio::spawn(make(token.clone()));
        Self { token, join }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
