//! Classification of element links into missing, waiting and ready.

use std::collections::BTreeMap;

use itertools::Itertools;
use serde_json::Value;

use drover_core::ElementId;

use crate::model::ElementView;
use crate::status::ProcessingStatus;
use crate::version::{formal_version, input_version};

/// Committed output of a ready link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyInput {
    pub output: Value,
    pub output_version: String,
    pub formal_version: String,
}

/// State of one link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    /// No such element, deleted, or never committed. Blocks until the topology changes.
    Missing,
    /// Locked by a run. Retried shortly.
    Waiting,
    Ready(ReadyInput),
}

impl LinkState {
    #[must_use]
    pub fn of(view: Option<&ElementView>) -> Self {
        let Some(view) = view else {
            return Self::Missing;
        };
        if view.status == ProcessingStatus::Deleted {
            return Self::Missing;
        }
        if !view.lock.is_none() {
            return Self::Waiting;
        }
        if view.output_version.is_empty() {
            return Self::Missing;
        }
        Self::Ready(ReadyInput {
            output: view.output.clone(),
            output_version: view.output_version.clone(),
            formal_version: view.formal_version.clone(),
        })
    }
}

/// Classified links of an element.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Readiness {
    pub missing: Vec<ElementId>,
    pub waiting: Vec<ElementId>,
    pub ready: BTreeMap<ElementId, ReadyInput>,
}

impl Readiness {
    /// Classify `links` with views resolved by `lookup`.
    pub fn classify<'a, I, F>(links: I, lookup: F) -> Self
    where
        I: IntoIterator<Item = &'a ElementId>,
        F: Fn(&ElementId) -> Option<ElementView>,
    {
        let mut readiness = Self::default();
        for link in links.into_iter().unique() {
            match LinkState::of(lookup(link).as_ref()) {
                LinkState::Missing => readiness.missing.push(link.clone()),
                LinkState::Waiting => readiness.waiting.push(link.clone()),
                LinkState::Ready(input) => {
                    readiness.ready.insert(link.clone(), input);
                }
            }
        }
        readiness
    }

    /// All links are usable as inputs.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.missing.is_empty() && self.waiting.is_empty()
    }

    #[must_use]
    pub fn input_version(&self) -> String {
        input_version(
            self.ready
                .iter()
                .map(|(id, input)| (id, input.output_version.as_str())),
        )
    }

    #[must_use]
    pub fn formal_version(&self, object_version: &str) -> String {
        formal_version(
            object_version,
            self.ready
                .iter()
                .map(|(id, input)| (id, input.formal_version.as_str())),
        )
    }

    /// Outputs of the ready links.
    #[must_use]
    pub fn inputs(&self) -> BTreeMap<ElementId, Value> {
        self.ready
            .iter()
            .map(|(id, input)| (id.clone(), input.output.clone()))
            .collect()
    }

    /// Human readable list of links that are not ready.
    #[must_use]
    pub fn describe(links: &[ElementId]) -> String {
        links.iter().join(", ")
    }
}
