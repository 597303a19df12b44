//! Action results and the requeue policy derived from them.

use std::time::Duration;

use drover_core::{Error, Result};

/// Outcome of handling one key.
#[derive(Debug, Default)]
pub struct Status {
    /// The key was handled. An error with `completed` asks for a rate-limited retry.
    pub completed: bool,
    pub error: Option<Error>,
    /// Reschedule the key after this delay.
    pub interval: Option<Duration>,
}

impl Status {
    /// Handled, nothing left to do.
    #[must_use]
    pub const fn done() -> Self {
        Self {
            completed: true,
            error: None,
            interval: None,
        }
    }

    /// Handled, look again after `interval`.
    #[must_use]
    pub const fn done_after(interval: Duration) -> Self {
        Self {
            completed: true,
            error: None,
            interval: Some(interval),
        }
    }

    /// Valid but not ready yet. Retried with backoff.
    #[must_use]
    pub const fn retry_later(error: Error) -> Self {
        Self {
            completed: true,
            error: Some(error),
            interval: None,
        }
    }

    /// Transient hiccup. Requeued immediately.
    #[must_use]
    pub const fn repeat() -> Self {
        Self {
            completed: false,
            error: None,
            interval: None,
        }
    }

    /// Fatal for this key.
    #[must_use]
    pub const fn failed(error: Error) -> Self {
        Self {
            completed: false,
            error: Some(error),
            interval: None,
        }
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Classify an operation result: non-temporary errors are fatal, all
    /// other errors are retried with backoff.
    #[must_use]
    pub fn from_result(result: Result<()>) -> Self {
        match result {
            Ok(()) => Self::done(),
            Err(e) if e.is_non_temporary() => Self::failed(e),
            Err(e) => Self::retry_later(e),
        }
    }
}

impl From<Result<()>> for Status {
    fn from(result: Result<()>) -> Self {
        Self::from_result(result)
    }
}

/// What the pool does with a key after its action returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    Drop,
    After(Duration),
    RateLimited,
    Immediate,
}

impl Requeue {
    /// Whether the failure history of the key should be reset.
    #[must_use]
    pub const fn forgets_failures(self) -> bool {
        !matches!(self, Self::RateLimited)
    }
}

/// Requeue policy for a status, given the pool's resync period.
#[must_use]
pub fn requeue_for(status: &Status, resync: Option<Duration>) -> Requeue {
    match (status.completed, status.error.is_some()) {
        (true, false) => status
            .interval
            .or(resync)
            .map_or(Requeue::Drop, Requeue::After),
        (true, true) => Requeue::RateLimited,
        (false, false) => Requeue::Immediate,
        (false, true) => status.interval.map_or(Requeue::Drop, Requeue::After),
    }
}
