//! Background task tracking.
//!
//! The delegate pump and relay deliveries run as tokio tasks owned by the
//! session. Disposal signals them and aborts whatever is still running.

use std::future::Future;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Owns the engine's spawned tasks.
#[derive(Debug)]
pub struct TaskRegistry {
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);
        Self {
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn a task that stops early when the registry shuts down
    pub fn spawn_cancellable<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_rx.wait_for(|stop| *stop) => {}
                _ = fut => {}
            }
        });
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Whether `shutdown` has been called
    pub fn is_shut_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Tasks spawned and not yet finished
    pub fn active_count(&self) -> usize {
        self.handles.lock().iter().filter(|h| !h.is_finished()).count()
    }

    /// Signal every task and abort the ones still running
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
    }

    /// Like [`shutdown`](Self::shutdown), but returns only after every task's
    /// future has been dropped.
    pub async fn shutdown_and_join(&self) {
        self.shutdown_tx.send_replace(true);
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in &handles {
            handle.abort();
        }
        for handle in handles {
            if let Err(err) = handle.await {
                if err.is_panic() {
                    tracing::warn!(error = %err, "Background task panicked");
                }
            }
        }
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}
