//! Roles objects play for the engine and the state it keeps on them.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use drover_core::{ElementId, ObjectId, Phase, Result, RunId};
use drover_objectbase::{AsObject, Object};

use crate::status::ProcessingStatus;

/// State of an element as of its last commit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CurrentState {
    pub links: Vec<ElementId>,
    pub formal_version: String,
    pub input_version: String,
    pub object_version: String,
    pub observed_version: String,
    pub effective_version: String,
    pub output: Value,
    pub output_version: String,
}

/// State an element is driven to by the run in flight.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetState {
    pub links: Vec<ElementId>,
    pub spec: Value,
    pub object_version: String,
    pub observed_version: String,
    pub deleting: bool,
}

/// Engine managed state of one phase of an internal object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseState {
    pub lock: RunId,
    pub status: ProcessingStatus,
    pub message: String,
    pub current: CurrentState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<TargetState>,
    /// Missing links that blocked the last run.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub blocked_on: Vec<ElementId>,
    /// Observed version the last run was prepared from, committed or not.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_observed_version: String,
}

impl PhaseState {
    #[must_use]
    pub fn is_locked(&self) -> bool {
        !self.lock.is_none()
    }

    /// Links of the target state while a run is in flight, else the current ones.
    #[must_use]
    pub fn effective_links(&self) -> &[ElementId] {
        self.target
            .as_ref()
            .map_or(self.current.links.as_slice(), |target| target.links.as_slice())
    }

    /// The external state this element last reacted to.
    #[must_use]
    pub fn observed_baseline(&self) -> &str {
        if self.last_observed_version.is_empty() {
            &self.current.observed_version
        } else {
            &self.last_observed_version
        }
    }
}

/// Engine managed state of all phases of an internal object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalState {
    #[serde(default)]
    pub phases: BTreeMap<Phase, PhaseState>,
}

impl InternalState {
    #[must_use]
    pub fn phase(&self, phase: &Phase) -> Option<&PhaseState> {
        self.phases.get(phase)
    }

    /// The state of `phase`, created on first access.
    pub fn phase_mut(&mut self, phase: &Phase) -> &mut PhaseState {
        self.phases.entry(phase.clone()).or_default()
    }

    /// Whether every listed phase reports deletion.
    #[must_use]
    pub fn all_deleted<'a>(&self, mut phases: impl Iterator<Item = &'a Phase>) -> bool {
        phases.all(|phase| {
            self.phase(phase)
                .is_some_and(|state| state.status == ProcessingStatus::Deleted)
        })
    }
}

/// Snapshot written to the current state when a phase completes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitInfo {
    pub formal_version: String,
    pub input_version: String,
    pub object_version: String,
    pub output: Value,
}

/// States of the external objects bound to one internal object, by external type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExternalStates {
    pub object: ObjectId,
    pub states: BTreeMap<String, Value>,
}

impl ExternalStates {
    #[must_use]
    pub fn get(&self, kind: &str) -> Option<&Value> {
        self.states.get(kind)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// What a phase wants to reach: its links and its spec.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetSpec {
    pub links: Vec<ElementId>,
    pub spec: Value,
}

impl TargetSpec {
    pub fn new(spec: Value) -> Self {
        Self {
            links: Vec::new(),
            spec,
        }
    }

    #[must_use]
    pub fn with_links(mut self, links: impl IntoIterator<Item = ElementId>) -> Self {
        self.links.extend(links);
        self
    }
}

/// Result of offering external state to a phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acceptance {
    Accepted(TargetSpec),
    Invalid(String),
}

/// Input to one processing step of an element.
#[derive(Debug, Clone)]
pub struct ProcessRequest {
    pub element: ElementId,
    pub run: RunId,
    pub spec: Value,
    /// Outputs of the linked elements.
    pub inputs: BTreeMap<ElementId, Value>,
    pub deleting: bool,
}

/// Outcome of one processing step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessResult {
    Completed(Value),
    Failed(String),
    Invalid(String),
    /// Not finished yet; process again after the delay.
    Waiting(Duration),
    Deleted,
}

/// Engine managed status of an external object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalStatus {
    pub status: ProcessingStatus,
    pub message: String,
    pub run_id: RunId,
    pub observed_version: String,
    pub formal_version: String,
    pub effective_version: String,
}

/// A resource managed by users. Its state triggers an internal type.
pub trait ExternalObject: Object + AsObject {
    /// The desired state as seen by the engine.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the state cannot be rendered.
    fn external_state(&self) -> Result<Value>;

    fn external_status(&self) -> &ExternalStatus;

    fn external_status_mut(&mut self) -> &mut ExternalStatus;
}

/// Multi-phase state holder processed by the engine.
#[async_trait]
pub trait InternalObject: Object + AsObject {
    fn internal_state(&self) -> &InternalState;

    fn internal_state_mut(&mut self) -> &mut InternalState;

    /// Derive the target of `phase` from the bound external states.
    fn accept_external_state(&self, phase: &Phase, externals: &ExternalStates) -> Acceptance;

    /// Run one processing step of an element.
    async fn process(&self, request: ProcessRequest) -> ProcessResult;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_effective_links_prefer_target() {
        let a = ElementId::of("ValueState", "ns", "a", "propagate");
        let b = ElementId::of("ValueState", "ns", "b", "propagate");
        let mut state = PhaseState {
            current: CurrentState {
                links: vec![a.clone()],
                ..CurrentState::default()
            },
            ..PhaseState::default()
        };
        assert_eq!(state.effective_links(), [a]);
        state.target = Some(TargetState {
            links: vec![b.clone()],
            ..TargetState::default()
        });
        assert_eq!(state.effective_links(), [b]);
    }

    #[test]
    fn test_observed_baseline_prefers_last_prepared_run() {
        let mut state = PhaseState {
            current: CurrentState {
                observed_version: "committed".to_string(),
                ..CurrentState::default()
            },
            ..PhaseState::default()
        };
        assert_eq!(state.observed_baseline(), "committed");
        state.last_observed_version = "attempted".to_string();
        assert_eq!(state.observed_baseline(), "attempted");
    }

    #[test]
    fn test_phase_state_tolerates_missing_fields() {
        let state: PhaseState = serde_json::from_value(json!({"lock": "run"})).unwrap();
        assert!(state.is_locked());
        assert_eq!(state.status, ProcessingStatus::Initial);
        assert!(state.target.is_none());
        assert!(state.blocked_on.is_empty());
    }

    #[test]
    fn test_all_deleted() {
        let mut state = InternalState::default();
        let gather = Phase::new("gather");
        let calculate = Phase::new("calculate");
        state.phase_mut(&gather).status = ProcessingStatus::Deleted;
        assert!(!state.all_deleted([&gather, &calculate].into_iter()));
        state.phase_mut(&calculate).status = ProcessingStatus::Deleted;
        assert!(state.all_deleted([&gather, &calculate].into_iter()));
    }
}
