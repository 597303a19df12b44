//! Actions and the key matchers they are registered under.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use drover_core::{Error, Result};

use crate::pool::Pool;
use crate::status::Status;

/// Handler for the keys of a pool.
#[async_trait]
pub trait Action: Send + Sync {
    /// Handle a `cmd:<command>` key. `command` has the prefix stripped.
    async fn command(&self, pool: &Pool, command: &str) -> Status {
        let _ = (pool, command);
        Status::done()
    }

    /// Handle any other key.
    async fn reconcile(&self, pool: &Pool, key: &str) -> Status;
}

/// Selects the keys an action is responsible for.
#[derive(Clone)]
pub enum Matcher {
    Exact(String),
    Pattern(glob::Pattern),
}

impl Matcher {
    pub fn exact(key: impl Into<String>) -> Self {
        Self::Exact(key.into())
    }

    /// A glob pattern over the raw key. `*` also matches `/`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for malformed patterns.
    pub fn pattern(pattern: &str) -> Result<Self> {
        glob::Pattern::new(pattern)
            .map(Self::Pattern)
            .map_err(|e| Error::config(format!("invalid key pattern '{pattern}': {e}")))
    }

    #[must_use]
    pub fn matches(&self, key: &str) -> bool {
        match self {
            Self::Exact(exact) => exact == key,
            Self::Pattern(pattern) => pattern.matches(key),
        }
    }
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(key) => write!(f, "Exact({key})"),
            Self::Pattern(pattern) => write!(f, "Pattern({})", pattern.as_str()),
        }
    }
}

/// Registered actions. Exact keys win, then patterns in registration order.
#[derive(Default)]
pub struct ActionRegistry {
    exact: HashMap<String, Arc<dyn Action>>,
    patterns: Vec<(glob::Pattern, Arc<dyn Action>)>,
}

impl ActionRegistry {
    pub fn add(&mut self, matcher: Matcher, action: Arc<dyn Action>) {
        match matcher {
            Matcher::Exact(key) => {
                self.exact.insert(key, action);
            }
            Matcher::Pattern(pattern) => self.patterns.push((pattern, action)),
        }
    }

    #[must_use]
    pub fn lookup(&self, key: &str) -> Option<Arc<dyn Action>> {
        self.exact
            .get(key)
            .or_else(|| {
                self.patterns
                    .iter()
                    .find(|(pattern, _)| pattern.matches(key))
                    .map(|(_, action)| action)
            })
            .cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.exact.len().saturating_add(self.patterns.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.patterns.is_empty()
    }
}
