//! Keyed work queue backing the coordinator.
//!
//! Watch events and requeue hints collapse into node keys. The queue deduplicates keys that are
//! already waiting, and defers keys that are being processed so one node is never reconciled by
//! two workers at once while distinct nodes proceed in parallel. Failed keys come back with
//! capped exponential backoff; a success resets their attempt count.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{sleep, Duration};
use tracing::{event, Level};

pub struct WorkQueue {
    tx: UnboundedSender<String>,
    rx: tokio::sync::Mutex<UnboundedReceiver<String>>,
    state: Mutex<QueueState>,
    base_backoff: Duration,
    max_backoff: Duration,
}

#[derive(Default)]
struct QueueState {
    /// Keys waiting in the channel.
    queued: HashSet<String>,
    /// Keys currently held by a worker.
    active: HashSet<String>,
    /// Keys that arrived while active; re-enqueued when the worker finishes.
    deferred: HashSet<String>,
    /// Consecutive failures per key.
    attempts: HashMap<String, u32>,
}

impl WorkQueue {
    pub fn new(base_backoff: Duration, max_backoff: Duration) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(WorkQueue {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            state: Mutex::new(QueueState::default()),
            base_backoff,
            max_backoff,
        })
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().expect("work queue state lock poisoned")
    }

    /// Adds a key unless it is already waiting.
    pub fn enqueue(&self, key: &str) {
        let mut state = self.state();
        if !state.queued.insert(key.to_string()) {
            return;
        }
        if self.tx.send(key.to_string()).is_err() {
            state.queued.remove(key);
            event!(Level::WARN, key, "Work queue receiver dropped; discarding key.");
        }
    }

    /// Adds a key after a delay.
    pub fn enqueue_after(self: &Arc<Self>, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.enqueue(key);
            return;
        }
        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            sleep(delay).await;
            queue.enqueue(&key);
        });
    }

    /// Hands out the next key that is not already being processed. Returns `None` once the
    /// queue is closed.
    pub async fn next(&self) -> Option<String> {
        loop {
            let key = { self.rx.lock().await.recv().await }?;
            let mut state = self.state();
            state.queued.remove(&key);
            if state.active.contains(&key) {
                state.deferred.insert(key);
                continue;
            }
            state.active.insert(key.clone());
            return Some(key);
        }
    }

    /// Completes a key, optionally requeueing it after `requeue`. A key that received events
    /// while it was active is re-enqueued immediately instead.
    pub fn finish(self: &Arc<Self>, key: &str, requeue: Option<Duration>) {
        let was_deferred = {
            let mut state = self.state();
            state.active.remove(key);
            state.attempts.remove(key);
            state.deferred.remove(key)
        };
        if was_deferred {
            self.enqueue(key);
        } else if let Some(delay) = requeue {
            self.enqueue_after(key, delay);
        }
    }

    /// Completes a failed key and requeues it with backoff.
    pub fn finish_with_error(self: &Arc<Self>, key: &str) {
        let delay = {
            let mut state = self.state();
            state.active.remove(key);
            state.deferred.remove(key);
            let attempts = state.attempts.entry(key.to_string()).or_insert(0);
            *attempts += 1;
            backoff_delay(self.base_backoff, self.max_backoff, *attempts)
        };
        event!(Level::DEBUG, key, delay_ms = delay.as_millis() as u64, "Backing off failed key.");
        self.enqueue_after(key, delay);
    }
}

fn backoff_delay(base: Duration, max: Duration, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(16);
    base.saturating_mul(2u32.saturating_pow(exponent)).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    const TICK: Duration = Duration::from_millis(50);

    fn queue() -> Arc<WorkQueue> {
        WorkQueue::new(Duration::from_millis(10), Duration::from_millis(80))
    }

    #[test]
    fn test_backoff_delay() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(60);
        let cases = vec![
            (1, Duration::from_secs(1)),
            (2, Duration::from_secs(2)),
            (3, Duration::from_secs(4)),
            (7, Duration::from_secs(60)),
            (1000, Duration::from_secs(60)),
        ];
        for (attempts, expected) in cases {
            assert_eq!(backoff_delay(base, max, attempts), expected);
        }
    }

    #[tokio::test]
    async fn waiting_keys_are_deduplicated() {
        let queue = queue();
        queue.enqueue("node1");
        queue.enqueue("node1");
        queue.enqueue("node2");

        assert_eq!(queue.next().await, Some("node1".to_string()));
        assert_eq!(queue.next().await, Some("node2".to_string()));
        assert!(timeout(TICK, queue.next()).await.is_err());
    }

    #[tokio::test]
    async fn active_keys_are_deferred_until_finished() {
        let queue = queue();
        queue.enqueue("node1");
        assert_eq!(queue.next().await, Some("node1".to_string()));

        // Arrives while a worker holds node1: must not be handed out yet.
        queue.enqueue("node1");
        assert!(timeout(TICK, queue.next()).await.is_err());

        queue.finish("node1", None);
        assert_eq!(queue.next().await, Some("node1".to_string()));
    }

    #[tokio::test]
    async fn finished_keys_can_requeue_after_a_delay() {
        let queue = queue();
        queue.enqueue("node1");
        assert_eq!(queue.next().await, Some("node1".to_string()));

        queue.finish("node1", Some(Duration::from_millis(10)));
        let key = timeout(Duration::from_secs(1), queue.next())
            .await
            .expect("requeued key never arrived");
        assert_eq!(key, Some("node1".to_string()));
    }

    #[tokio::test]
    async fn failed_keys_come_back_with_backoff() {
        let queue = queue();
        queue.enqueue("node1");
        assert_eq!(queue.next().await, Some("node1".to_string()));

        queue.finish_with_error("node1");
        let key = timeout(Duration::from_secs(1), queue.next())
            .await
            .expect("failed key never came back");
        assert_eq!(key, Some("node1".to_string()));
    }
}
