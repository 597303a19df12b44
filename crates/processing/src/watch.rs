//! In-process feed of element and namespace state changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use drover_core::{ElementId, RunId};

use crate::objects::PhaseState;
use crate::status::ProcessingStatus;

/// The node an event is about. Namespaces have no type and no phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchNode {
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

impl WatchNode {
    #[must_use]
    pub fn element(id: &ElementId) -> Self {
        Self {
            kind: id.kind().to_string(),
            namespace: id.namespace().to_string(),
            name: id.name().to_string(),
            phase: Some(id.phase().to_string()),
        }
    }

    #[must_use]
    pub fn namespace(namespace: &str) -> Self {
        Self {
            kind: String::new(),
            namespace: namespace.to_string(),
            name: String::new(),
            phase: None,
        }
    }

    /// Whether the node is the given element.
    #[must_use]
    pub fn is_element(&self, id: &ElementId) -> bool {
        self.kind == id.kind()
            && self.namespace == id.namespace()
            && self.name == id.name()
            && self.phase.as_deref() == Some(id.phase().as_str())
    }
}

/// One state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub node: WatchNode,
    pub lock: RunId,
    #[serde(default)]
    pub status: ProcessingStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<ElementId>,
    pub timestamp: DateTime<Utc>,
}

impl WatchEvent {
    #[must_use]
    pub fn element(id: &ElementId, state: &PhaseState) -> Self {
        Self {
            node: WatchNode::element(id),
            lock: state.lock.clone(),
            status: state.status,
            message: state.message.clone(),
            links: state.effective_links().to_vec(),
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn namespace(namespace: &str, run_lock: &RunId) -> Self {
        Self {
            node: WatchNode::namespace(namespace),
            lock: run_lock.clone(),
            status: ProcessingStatus::Initial,
            message: String::new(),
            links: Vec::new(),
            timestamp: Utc::now(),
        }
    }
}

/// Broadcast channel of watch events. Without subscribers events are dropped.
#[derive(Debug, Clone)]
pub struct WatchFeed {
    sender: broadcast::Sender<WatchEvent>,
}

impl WatchFeed {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: WatchEvent) {
        trace!(node = ?event.node, status = %event.status, lock = %event.lock, "Watch event");
        let _ = self.sender.send(event);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.sender.subscribe()
    }

    #[must_use]
    pub fn subscribers(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_element_event_json() {
        let id = ElementId::of("OperatorState", "ns", "c", "calculate");
        let state = PhaseState {
            lock: RunId::from_string("run"),
            status: ProcessingStatus::Processing,
            ..PhaseState::default()
        };
        let json = serde_json::to_value(WatchEvent::element(&id, &state)).unwrap();

        assert_eq!(json["node"]["type"], "OperatorState");
        assert_eq!(json["node"]["phase"], "calculate");
        assert_eq!(json["lock"], "run");
        assert_eq!(json["status"], "Processing");
        assert!(json.get("links").is_none());
    }

    #[test]
    fn test_namespace_event_has_no_phase() {
        let event = WatchEvent::namespace("ns", &RunId::none());
        assert!(event.node.phase.is_none());
        assert!(!event.node.is_element(&ElementId::of("A", "ns", "a", "p")));
    }

    #[tokio::test]
    async fn test_subscribers_receive_published_events() {
        let feed = WatchFeed::new(8);
        let mut rx = feed.subscribe();
        feed.publish(WatchEvent::namespace("ns", &RunId::from_string("run")));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.node.namespace, "ns");
        assert_eq!(event.lock.as_str(), "run");
        assert_eq!(feed.subscribers(), 1);
    }

    #[test]
    fn test_publish_without_subscribers_is_dropped() {
        let feed = WatchFeed::new(1);
        feed.publish(WatchEvent::namespace("ns", &RunId::none()));
        assert_eq!(feed.subscribers(), 0);
    }
}
