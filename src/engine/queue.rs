//! Unbounded FIFO of pending call descriptors.
//!
//! `dequeue_nowait` never waits: an empty queue is reported as `QueueEmpty`
//! and the caller decides, based on the listening flag, whether that means
//! "done" or "poll again later".

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::Notify;

use crate::engine::descriptor::CallDescriptor;

/// No descriptor is ready right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Queue is empty")]
pub struct QueueEmpty;

#[derive(Debug, Default)]
pub struct RequestQueue {
    items: Mutex<VecDeque<CallDescriptor>>,
    queued_total: AtomicU64,
    listening: AtomicBool,
    drained: Notify,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn items(&self) -> std::sync::MutexGuard<'_, VecDeque<CallDescriptor>> {
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a descriptor. Never blocks.
    pub fn enqueue(&self, descriptor: CallDescriptor) {
        self.items().push_back(descriptor);
        self.queued_total.fetch_add(1, Ordering::SeqCst);
    }

    /// Take the oldest descriptor, or fail immediately if none is ready.
    pub fn dequeue_nowait(&self) -> Result<CallDescriptor, QueueEmpty> {
        let (descriptor, now_empty) = {
            let mut items = self.items();
            let descriptor = items.pop_front().ok_or(QueueEmpty)?;
            (descriptor, items.is_empty())
        };
        if now_empty {
            self.drained.notify_waiters();
        }
        Ok(descriptor)
    }

    /// Resolve once every enqueued descriptor has been taken.
    pub async fn join(&self) {
        loop {
            let notified = self.drained.notified();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Discard anything still queued and zero the counters. Returns the
    /// number of descriptors dropped.
    pub fn close(&self) -> usize {
        let dropped = {
            let mut items = self.items();
            let n = items.len();
            items.clear();
            n
        };
        self.queued_total.store(0, Ordering::SeqCst);
        self.listening.store(false, Ordering::SeqCst);
        self.drained.notify_waiters();
        dropped
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    /// Descriptors enqueued since the last `close`.
    pub fn queued_total(&self) -> u64 {
        self.queued_total.load(Ordering::SeqCst)
    }

    pub fn set_listening(&self, listening: bool) {
        self.listening.store(listening, Ordering::SeqCst);
    }

    /// In listening mode an empty queue means "retry later", not "done".
    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Params, StubInvocable};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn descriptor(pid: i64) -> CallDescriptor {
        let mut metadata = Params::new();
        metadata.insert("pid".to_string(), json!(pid));
        CallDescriptor::new(
            "chat.completions.create",
            Arc::new(StubInvocable::new(1)),
            Params::new(),
            metadata,
        )
    }

    #[test]
    fn test_fifo_order() {
        let queue = RequestQueue::new();
        for pid in 1..=3 {
            queue.enqueue(descriptor(pid));
        }

        let pids: Vec<i64> = std::iter::from_fn(|| queue.dequeue_nowait().ok())
            .filter_map(|d| d.metadata["pid"].as_i64())
            .collect();
        assert_eq!(pids, vec![1, 2, 3]);
    }

    #[test]
    fn test_empty_dequeue() {
        let queue = RequestQueue::new();
        assert_eq!(queue.dequeue_nowait().err(), Some(QueueEmpty));
    }

    #[test]
    fn test_queued_total_counts_every_enqueue() {
        let queue = RequestQueue::new();
        queue.enqueue(descriptor(1));
        queue.enqueue(descriptor(2));
        queue.dequeue_nowait().unwrap();

        assert_eq!(queue.queued_total(), 2);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_close_discards_and_resets() {
        let queue = RequestQueue::new();
        queue.set_listening(true);
        queue.enqueue(descriptor(1));
        queue.enqueue(descriptor(2));

        assert_eq!(queue.close(), 2);
        assert!(queue.is_empty());
        assert_eq!(queue.queued_total(), 0);
        assert!(!queue.is_listening());
    }

    #[tokio::test]
    async fn test_join_on_empty_queue_returns() {
        let queue = RequestQueue::new();
        queue.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_waits_for_last_take() {
        let queue = Arc::new(RequestQueue::new());
        queue.enqueue(descriptor(1));
        queue.enqueue(descriptor(2));

        let consumer = queue.clone();
        tokio::spawn(async move {
            for _ in 0..2 {
                tokio::time::sleep(Duration::from_secs(1)).await;
                consumer.dequeue_nowait().unwrap();
            }
        });

        let start = tokio::time::Instant::now();
        queue.join().await;
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }
}
