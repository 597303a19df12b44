//! Worker pool serving one work queue.

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use drover_core::ObjectId;

use crate::action::{Action, ActionRegistry, Matcher};
use crate::queue::WorkQueue;
use crate::status::{Requeue, Status, requeue_for};

/// Prefix of command keys.
pub const COMMAND_PREFIX: &str = "cmd:";

/// Prefix of object keys.
pub const OBJECT_PREFIX: &str = "obj:";

/// Internal heartbeat command.
pub const TICK_COMMAND: &str = "tick";

/// Pool tuning.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub workers: usize,
    /// Reschedule completed keys after this period.
    pub resync_period: Option<Duration>,
    pub tick_interval: Duration,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            resync_period: None,
            tick_interval: Duration::from_secs(30),
            base_backoff_ms: 100,
            max_backoff_ms: 30_000,
        }
    }
}

impl PoolConfig {
    #[must_use]
    pub const fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    #[must_use]
    pub const fn with_resync_period(mut self, period: Duration) -> Self {
        self.resync_period = Some(period);
        self
    }

    #[must_use]
    pub const fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_backoff(mut self, base_ms: u64, max_ms: u64) -> Self {
        self.base_backoff_ms = base_ms;
        self.max_backoff_ms = max_ms;
        self
    }
}

struct PoolInner {
    name: String,
    config: PoolConfig,
    queue: Arc<WorkQueue>,
    actions: RwLock<ActionRegistry>,
    heartbeat: Mutex<Option<DateTime<Utc>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// A named group of workers consuming one rate-limiting delay queue.
///
/// Cloning is cheap and yields a handle to the same pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    pub fn new(name: impl Into<String>, config: PoolConfig) -> Self {
        let queue = Arc::new(WorkQueue::new(config.base_backoff_ms, config.max_backoff_ms));
        Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                config,
                queue,
                actions: RwLock::new(ActionRegistry::default()),
                heartbeat: Mutex::new(None),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Register an action for the keys selected by `matcher`.
    pub fn add_action(&self, matcher: Matcher, action: Arc<dyn Action>) {
        debug!(pool = %self.inner.name, matcher = ?matcher, "Adding action");
        self.inner
            .actions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .add(matcher, action);
    }

    /// Spawn the workers and the heartbeat tick. Requires a tokio runtime.
    pub fn start(&self) {
        let mut workers = self
            .inner
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !workers.is_empty() {
            return;
        }
        let count = self.inner.config.workers.max(1);
        info!(pool = %self.inner.name, workers = count, "Starting pool");
        workers.extend((0..count).map(|index| {
            let pool = self.clone();
            tokio::spawn(async move { pool.run_worker(index).await })
        }));
        drop(workers);
        self.enqueue_command(TICK_COMMAND);
    }

    /// Close the queue. Workers finish the queued keys and exit.
    pub fn shutdown(&self) {
        info!(pool = %self.inner.name, "Shutting down pool");
        self.inner.queue.shutdown();
    }

    /// Wait for all workers to exit.
    pub async fn wait(&self) {
        let handles: Vec<JoinHandle<()>> = self
            .inner
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for result in join_all(handles).await {
            if let Err(e) = result {
                error!(pool = %self.inner.name, error = %e, "Worker terminated abnormally");
            }
        }
        info!(pool = %self.inner.name, "Pool stopped");
    }

    pub fn enqueue_command(&self, command: &str) {
        self.enqueue_raw(&command_key(command));
    }

    pub fn enqueue_command_rate_limited(&self, command: &str) {
        self.enqueue_raw_rate_limited(&command_key(command));
    }

    pub fn enqueue_command_after(&self, command: &str, delay: Duration) {
        self.enqueue_raw_after(&command_key(command), delay);
    }

    /// Queue the `obj:` key of an object.
    pub fn enqueue_key(&self, id: &ObjectId) {
        self.enqueue_raw(&object_key(id));
    }

    pub fn enqueue_raw(&self, key: &str) {
        self.inner.queue.add(key);
    }

    pub fn enqueue_raw_after(&self, key: &str, delay: Duration) {
        self.inner.queue.add_after(key, delay);
    }

    pub fn enqueue_raw_rate_limited(&self, key: &str) {
        self.inner.queue.add_rate_limited(key);
    }

    /// Time of the last heartbeat tick.
    #[must_use]
    pub fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        *self
            .inner
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a heartbeat was seen within `max_age`.
    #[must_use]
    pub fn is_healthy(&self, max_age: Duration) -> bool {
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return self.last_heartbeat().is_some();
        };
        self.last_heartbeat()
            .is_some_and(|beat| Utc::now().signed_duration_since(beat) <= max_age)
    }

    /// Number of keys waiting in the queue.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.inner.queue.len()
    }

    async fn run_worker(self, index: usize) {
        debug!(pool = %self.inner.name, worker = index, "Worker started");
        while let Some(key) = self.inner.queue.get().await {
            let status = self.dispatch(&key).await;
            self.apply(&key, status);
            self.inner.queue.done(&key);
        }
        debug!(pool = %self.inner.name, worker = index, "Worker exiting");
    }

    async fn dispatch(&self, key: &str) -> Status {
        if key.strip_prefix(COMMAND_PREFIX) == Some(TICK_COMMAND) {
            return self.tick();
        }
        let action = self
            .inner
            .actions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .lookup(key);
        let Some(action) = action else {
            warn!(pool = %self.inner.name, key, "No action registered for key");
            return Status::done();
        };
        match key.strip_prefix(COMMAND_PREFIX) {
            Some(command) => action.command(self, command).await,
            None => action.reconcile(self, key).await,
        }
    }

    fn tick(&self) -> Status {
        let now = Utc::now();
        *self
            .inner
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(now);
        debug!(pool = %self.inner.name, heartbeat = %now, "Heartbeat");
        Status::done_after(self.inner.config.tick_interval)
    }

    fn apply(&self, key: &str, status: Status) {
        let requeue = requeue_for(&status, self.inner.config.resync_period);
        if requeue.forgets_failures() {
            self.inner.queue.forget(key);
        }
        match (&status.error, status.completed) {
            (Some(e), true) => debug!(pool = %self.inner.name, key, error = %e, "Retrying later"),
            (Some(e), false) => error!(pool = %self.inner.name, key, error = %e, "Key failed"),
            (None, _) => {}
        }
        match requeue {
            Requeue::Drop => {}
            Requeue::After(delay) => self.inner.queue.add_after(key, delay),
            Requeue::RateLimited => self.inner.queue.add_rate_limited(key),
            Requeue::Immediate => self.inner.queue.add(key),
        }
    }
}

/// The `cmd:` key of a command.
#[must_use]
pub fn command_key(command: &str) -> String {
    format!("{COMMAND_PREFIX}{command}")
}

/// The `obj:` key of an object.
#[must_use]
pub fn object_key(id: &ObjectId) -> String {
    format!("{OBJECT_PREFIX}{id}")
}
