//! Rate-limiting delay work queue.
//!
//! A key is owned by at most one worker at a time. Adding a key that is
//! already queued coalesces; adding a key that is being processed marks it
//! dirty and it is queued again once [`WorkQueue::done`] is called.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::trace;

/// Exponential backoff: `base_ms * 2^attempt`, capped at `max_ms`.
#[must_use]
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let backoff = base_ms.saturating_mul(2u64.saturating_pow(attempt));
    Duration::from_millis(backoff.min(max_ms))
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
    shutting_down: bool,
}

/// Work queue shared by the workers of one pool.
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    base_backoff_ms: u64,
    max_backoff_ms: u64,
}

impl WorkQueue {
    pub fn new(base_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            base_backoff_ms,
            max_backoff_ms,
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a key for immediate processing.
    pub fn add(&self, key: &str) {
        let mut state = self.state();
        if state.shutting_down || state.dirty.contains(key) {
            return;
        }
        state.dirty.insert(key.to_string());
        if !state.processing.contains(key) {
            state.queue.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Queue a key once `delay` has passed.
    pub fn add_after(self: &Arc<Self>, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        if self.is_shutting_down() {
            return;
        }
        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Queue a key after a backoff that grows with every consecutive failure.
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) {
        let attempt = {
            let mut state = self.state();
            let failures = state.failures.entry(key.to_string()).or_insert(0);
            let attempt = *failures;
            *failures = failures.saturating_add(1);
            attempt
        };
        let delay = calculate_backoff(attempt, self.base_backoff_ms, self.max_backoff_ms);
        trace!(key, attempt, delay_ms = delay.as_millis(), "Rate limited requeue");
        self.add_after(key, delay);
    }

    /// Reset the failure history of a key.
    pub fn forget(&self, key: &str) {
        self.state().failures.remove(key);
    }

    /// Consecutive failures recorded for a key.
    #[must_use]
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.state().failures.get(key).copied().unwrap_or(0)
    }

    /// Wait for the next key. Returns `None` once shut down and drained.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Release ownership of a key taken with [`WorkQueue::get`].
    pub fn done(&self, key: &str) {
        let mut state = self.state();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stop accepting keys and wake all waiting workers.
    pub fn shutdown(&self) {
        self.state().shutting_down = true;
        self.notify.notify_waiters();
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }

    /// Number of keys waiting to be processed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
