//! Configuration of the processing engine.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use drover_core::{Error, Result};
use drover_pool::PoolConfig;

/// Finalizer the engine puts on every object it tracks.
pub const DEFAULT_FINALIZER: &str = "drover.io/processing";

/// Configuration for the processing engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of pool workers.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Reschedule completed keys after this many seconds (0 disables resync).
    #[serde(default)]
    pub resync_period_secs: u64,

    /// Heartbeat interval.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Initial retry delay for temporary errors.
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    /// Upper bound of the retry delay.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Name of the finalizer on internal and external objects.
    #[serde(default = "default_finalizer")]
    pub finalizer: String,

    /// Buffered events per watch subscriber.
    #[serde(default = "default_watch_capacity")]
    pub watch_capacity: usize,

    /// Store technical namespaces below this prefix (empty = identity mapping).
    #[serde(default)]
    pub namespace_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            resync_period_secs: 0,
            tick_interval_ms: default_tick_interval_ms(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            finalizer: default_finalizer(),
            watch_capacity: default_watch_capacity(),
            namespace_prefix: String::new(),
        }
    }
}

impl EngineConfig {
    /// Set the worker count.
    #[must_use]
    pub const fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the retry backoff bounds.
    #[must_use]
    pub const fn backoff(mut self, base_ms: u64, max_ms: u64) -> Self {
        self.base_backoff_ms = base_ms;
        self.max_backoff_ms = max_ms;
        self
    }

    /// Set the heartbeat interval.
    #[must_use]
    pub const fn tick_interval_ms(mut self, interval_ms: u64) -> Self {
        self.tick_interval_ms = interval_ms;
        self
    }

    /// Load configuration from `DROVER_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_env_with(|name| std::env::var(name).ok())
    }

    /// Load configuration from variables resolved by `lookup`.
    ///
    /// Unparseable numbers keep their defaults.
    pub fn from_env_with<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let number = |name: &str| lookup(name).and_then(|v| v.trim().parse::<u64>().ok());

        if let Some(workers) = number("DROVER_WORKERS").and_then(|v| usize::try_from(v).ok()) {
            config.workers = workers;
        }
        if let Some(secs) = number("DROVER_RESYNC_PERIOD_SECS") {
            config.resync_period_secs = secs;
        }
        if let Some(ms) = number("DROVER_TICK_INTERVAL_MS") {
            config.tick_interval_ms = ms;
        }
        if let Some(ms) = number("DROVER_BASE_BACKOFF_MS") {
            config.base_backoff_ms = ms;
        }
        if let Some(ms) = number("DROVER_MAX_BACKOFF_MS") {
            config.max_backoff_ms = ms;
        }
        if let Some(finalizer) = lookup("DROVER_FINALIZER").filter(|v| !v.is_empty()) {
            config.finalizer = finalizer;
        }
        if let Some(capacity) = number("DROVER_WATCH_CAPACITY").and_then(|v| usize::try_from(v).ok())
        {
            config.watch_capacity = capacity;
        }
        if let Some(prefix) = lookup("DROVER_NAMESPACE_PREFIX") {
            config.namespace_prefix = prefix;
        }

        config
    }

    /// Load configuration from a file.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be read and a configuration
    /// error if it cannot be parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;

        if path.extension().is_some_and(|e| e == "json") {
            serde_json::from_str(&content)
                .map_err(|e| Error::config(format!("Failed to parse config: {e}")))
        } else {
            toml::from_str(&content)
                .map_err(|e| Error::config(format!("Failed to parse config: {e}")))
        }
    }

    /// Reject settings the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the offending setting.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::config("workers must be at least 1"));
        }
        if self.finalizer.is_empty() {
            return Err(Error::config("finalizer must not be empty"));
        }
        if self.watch_capacity == 0 {
            return Err(Error::config("watch_capacity must be at least 1"));
        }
        if self.base_backoff_ms > self.max_backoff_ms {
            return Err(Error::config("base_backoff_ms exceeds max_backoff_ms"));
        }
        Ok(())
    }

    /// Settings of the worker pool.
    #[must_use]
    pub fn to_pool_config(&self) -> PoolConfig {
        let config = PoolConfig::default()
            .with_workers(self.workers)
            .with_tick_interval(Duration::from_millis(self.tick_interval_ms))
            .with_backoff(self.base_backoff_ms, self.max_backoff_ms);
        if self.resync_period_secs > 0 {
            config.with_resync_period(Duration::from_secs(self.resync_period_secs))
        } else {
            config
        }
    }
}

const fn default_workers() -> usize {
    4
}

const fn default_tick_interval_ms() -> u64 {
    30_000
}

const fn default_base_backoff_ms() -> u64 {
    100
}

const fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_finalizer() -> String {
    DEFAULT_FINALIZER.to_string()
}

const fn default_watch_capacity() -> usize {
    1024
}
