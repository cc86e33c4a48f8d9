//! Tracking for detached tasks that must be joined or cancelled as a group.

use std::future::Future;
use std::sync::Mutex;

use tokio::task::JoinHandle;

/// A set of spawned tasks. Finished handles are pruned on every spawn.
#[derive(Debug, Default)]
pub struct TaskSet {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn handles(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn a task and track it.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        let mut handles = self.handles();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Number of tasks still running.
    pub fn active(&self) -> usize {
        self.handles().iter().filter(|h| !h.is_finished()).count()
    }

    /// Wait for every task, including ones spawned while waiting.
    pub async fn join_all(&self) {
        loop {
            let batch: Vec<JoinHandle<()>> = self.handles().drain(..).collect();
            if batch.is_empty() {
                return;
            }
            for handle in batch {
                match handle.await {
                    Err(e) if e.is_panic() => tracing::error!(error = ?e, "Task panicked"),
                    _ => {}
                }
            }
        }
    }

    /// Cancel every task and wait for the cancellations to land.
    pub async fn abort_all(&self) -> usize {
        let batch: Vec<JoinHandle<()>> = self.handles().drain(..).collect();
        let count = batch.iter().filter(|h| !h.is_finished()).count();
        for handle in &batch {
            handle.abort();
        }
        for handle in batch {
            let _ = handle.await;
        }
        count
    }

    /// Cancel every task without waiting. Usable from `Drop`.
    pub fn abort_now(&self) -> usize {
        let batch: Vec<JoinHandle<()>> = self.handles().drain(..).collect();
        batch.iter().filter(|h| !h.is_finished()).map(|h| h.abort()).count()
    }

    /// Forget all handles without waiting.
    pub fn clear(&self) {
        self.handles().clear();
    }
}
