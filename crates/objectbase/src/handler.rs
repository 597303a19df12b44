//! Change notification registry.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::RwLock;
use tracing::trace;

use drover_core::ObjectId;

/// Receives the id of every created, updated or deleted object it is registered for.
pub trait EventHandler: Send + Sync {
    fn handle_event(&self, id: &ObjectId);
}

impl<F> EventHandler for F
where
    F: Fn(&ObjectId) + Send + Sync,
{
    fn handle_event(&self, id: &ObjectId) {
        self(id);
    }
}

/// Handle returned by a registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandlerId(u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler_{}", self.0)
    }
}

/// Which objects a handler is interested in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    /// Object type. Empty matches every type.
    pub kind: String,
    /// Include nested namespaces below `namespace`.
    pub closure: bool,
    pub namespace: String,
}

impl Filter {
    pub fn new(kind: impl Into<String>, closure: bool, namespace: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            closure,
            namespace: namespace.into(),
        }
    }

    /// Every object of every type.
    #[must_use]
    pub fn all() -> Self {
        Self::new("", true, "")
    }

    #[must_use]
    pub fn matches(&self, id: &ObjectId) -> bool {
        (self.kind.is_empty() || self.kind == id.kind())
            && namespace_matches(&self.namespace, self.closure, id.namespace())
    }
}

/// Namespace selection used by listings and handler filters.
///
/// Without closure only `namespace` itself matches. With closure, every
/// namespace below it (separated by `/`) matches too, and the empty namespace
/// selects all.
#[must_use]
pub fn namespace_matches(filter: &str, closure: bool, namespace: &str) -> bool {
    if namespace == filter {
        return true;
    }
    if !closure {
        return false;
    }
    filter.is_empty()
        || namespace
            .strip_prefix(filter)
            .is_some_and(|rest| rest.starts_with('/'))
}

struct Registration {
    handler: Arc<dyn EventHandler>,
    filter: Filter,
}

/// Registered handlers, notified in registration order.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<BTreeMap<HandlerId, Registration>>,
    next_id: AtomicU64,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, handler: Arc<dyn EventHandler>, filter: Filter) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .await
            .insert(id, Registration { handler, filter });
        id
    }

    /// Returns whether the handler was registered.
    pub async fn unregister(&self, id: HandlerId) -> bool {
        self.handlers.write().await.remove(&id).is_some()
    }

    /// Deliver an event to every matching handler.
    pub async fn notify(&self, id: &ObjectId) {
        let matching: Vec<Arc<dyn EventHandler>> = self
            .handlers
            .read()
            .await
            .values()
            .filter(|r| r.filter.matches(id))
            .map(|r| Arc::clone(&r.handler))
            .collect();
        trace!(object = %id, handlers = matching.len(), "Notifying handlers");
        for handler in matching {
            handler.handle_event(id);
        }
    }

    pub async fn len(&self) -> usize {
        self.handlers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.handlers.read().await.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn test_namespace_closure_matching() {
        assert!(namespace_matches("a", false, "a"));
        assert!(!namespace_matches("a", false, "a/b"));
        assert!(namespace_matches("a", true, "a/b"));
        assert!(!namespace_matches("a", true, "ab"));
        assert!(namespace_matches("", true, "anything"));
        assert!(!namespace_matches("", false, "anything"));
    }

    #[tokio::test]
    async fn test_notify_respects_filter_and_unregister() {
        let registry = HandlerRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = registry
            .register(
                Arc::new(move |id: &ObjectId| sink.lock().unwrap().push(id.clone())),
                Filter::new("Value", false, "ns"),
            )
            .await;

        registry.notify(&ObjectId::new("Value", "ns", "a")).await;
        registry.notify(&ObjectId::new("Value", "other", "b")).await;
        registry.notify(&ObjectId::new("Operator", "ns", "c")).await;
        assert_eq!(seen.lock().unwrap().len(), 1);

        assert!(registry.unregister(id).await);
        registry.notify(&ObjectId::new("Value", "ns", "a")).await;
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(registry.is_empty().await);
    }
}
