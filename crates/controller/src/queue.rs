//! Deduplicating keyed work queue.
//!
//! Supplies the scheduling contract the reconciler relies on: repeated
//! events for one key coalesce into a single pending entry, and a key is
//! never handed to two workers at once. An event arriving while its key is
//! in flight marks the key dirty and re-delivers it after the current
//! reconcile finishes. Retryable failures requeue with per-key exponential
//! backoff.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

/// Initial requeue delay after a retryable failure.
const INITIAL_REQUEUE_DELAY_MS: u64 = 50;

/// Maximum requeue delay.
const MAX_REQUEUE_DELAY_MS: u64 = 5_000;

#[derive(Default)]
struct QueueState {
    pending: VecDeque<String>,
    queued: HashSet<String>,
    processing: HashSet<String>,
    dirty: HashSet<String>,
    failures: HashMap<String, u32>,
    shutdown: bool,
}

/// Deduplicating work queue with at-most-one in-flight reconcile per key.
#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue an event for `key`. Coalesces with any pending entry; if the
    /// key is currently being reconciled, it is re-delivered afterwards.
    pub async fn add(&self, key: &str) {
        let mut state = self.state.lock().await;
        if state.shutdown {
            return;
        }
        if state.processing.contains(key) {
            state.dirty.insert(key.to_string());
            return;
        }
        if state.queued.insert(key.to_string()) {
            state.pending.push_back(key.to_string());
            self.notify.notify_one();
        }
    }

    /// Wait for the next key, marking it in flight. Returns `None` once the
    /// queue shuts down.
    pub async fn next(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().await;
                if state.shutdown {
                    return None;
                }
                if let Some(key) = state.pending.pop_front() {
                    state.queued.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Report a finished reconcile. `retry` requeues the key with
    /// exponential backoff; success clears its failure history and
    /// re-delivers the key immediately if events coalesced while it was in
    /// flight.
    pub async fn done(self: &Arc<Self>, key: &str, retry: bool) {
        let delay = {
            let mut state = self.state.lock().await;
            state.processing.remove(key);
            let was_dirty = state.dirty.remove(key);

            if retry {
                let failures = state.failures.entry(key.to_string()).or_insert(0);
                *failures += 1;
                let delay = backoff_for(*failures);
                debug!(
                    target: "controller.queue",
                    key,
                    failures = *failures,
                    delay_ms = delay.as_millis() as u64,
                    "Requeueing key with backoff"
                );
                Some(delay)
            } else {
                state.failures.remove(key);
                if was_dirty && state.queued.insert(key.to_string()) {
                    state.pending.push_back(key.to_string());
                    self.notify.notify_one();
                }
                None
            }
        };

        if let Some(delay) = delay {
            let queue = Arc::clone(self);
            let key = key.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                queue.add(&key).await;
            });
        }
    }

    /// Stop delivery; pending entries are discarded and `next` returns
    /// `None` to every worker.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        state.shutdown = true;
        self.notify.notify_waiters();
    }

    /// Number of pending (not in-flight) keys.
    pub async fn len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// Whether no keys are pending.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn backoff_for(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    let delay = INITIAL_REQUEUE_DELAY_MS.saturating_mul(1 << exponent);
    Duration::from_millis(delay.min(MAX_REQUEUE_DELAY_MS))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_events_for_same_key_coalesce() {
        let queue = Arc::new(WorkQueue::new());
        queue.add("demo/foo").await;
        queue.add("demo/foo").await;
        queue.add("demo/foo").await;

        assert_eq!(queue.len().await, 1);
        assert_eq!(queue.next().await.as_deref(), Some("demo/foo"));
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_in_flight_key_is_not_redelivered_until_done() {
        let queue = Arc::new(WorkQueue::new());
        queue.add("demo/foo").await;

        let key = queue.next().await.unwrap();
        assert_eq!(key, "demo/foo");

        // Event arrives mid-reconcile: queue stays empty for other workers.
        queue.add("demo/foo").await;
        assert!(queue.is_empty().await);

        // After completion the coalesced event is re-delivered.
        queue.done(&key, false).await;
        assert_eq!(queue.len().await, 1);
        assert_eq!(queue.next().await.as_deref(), Some("demo/foo"));
    }

    #[tokio::test]
    async fn test_retry_requeues_with_backoff() {
        let queue = Arc::new(WorkQueue::new());
        queue.add("demo/foo").await;

        let key = queue.next().await.unwrap();
        queue.done(&key, true).await;

        // Not immediately pending; re-added after the backoff delay.
        assert!(queue.is_empty().await);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_success_resets_failure_history() {
        let queue = Arc::new(WorkQueue::new());
        queue.add("demo/foo").await;
        let key = queue.next().await.unwrap();
        queue.done(&key, true).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let key = queue.next().await.unwrap();
        queue.done(&key, false).await;

        assert_eq!(queue.state.lock().await.failures.len(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_unblocks_workers() {
        let queue = Arc::new(WorkQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.shutdown().await;

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_backoff_growth_is_capped() {
        assert_eq!(backoff_for(1), Duration::from_millis(50));
        assert_eq!(backoff_for(2), Duration::from_millis(100));
        assert_eq!(backoff_for(3), Duration::from_millis(200));
        assert_eq!(backoff_for(30), Duration::from_millis(5_000));
    }
}
