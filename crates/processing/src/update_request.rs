//! Update requests let external actors hold and release namespace locks.

use std::fmt;

use serde::{Deserialize, Serialize};

use drover_core::{ElementId, RunId};
use drover_objectbase::{Object, ObjectMeta};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestAction {
    /// Take the namespace lock.
    #[default]
    Acquire,
    /// Take the namespace lock and lock the listed elements with their dependents.
    Lock,
    /// Give the run back so the locked elements are processed.
    Release,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    #[default]
    #[serde(rename = "")]
    Initial,
    Acquired,
    Locked,
    Pending,
    Released,
    Invalid,
}

impl RequestStatus {
    /// The request owns a run that is not yet released.
    #[must_use]
    pub const fn holds_run(self) -> bool {
        matches!(self, Self::Acquired | Self::Locked)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Initial => "",
            Self::Acquired => "Acquired",
            Self::Locked => "Locked",
            Self::Pending => "Pending",
            Self::Released => "Released",
            Self::Invalid => "Invalid",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRequestSpec {
    pub action: RequestAction,
    #[serde(default)]
    pub elements: Vec<ElementId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateRequestStatus {
    pub status: RequestStatus,
    pub run_id: RunId,
    pub message: String,
}

/// Persisted request to acquire, lock or release a namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub meta: ObjectMeta,
    pub spec: UpdateRequestSpec,
    #[serde(default)]
    pub status: UpdateRequestStatus,
}

impl UpdateRequest {
    /// The run owned by this request, if it still holds one.
    #[must_use]
    pub fn held_run(&self) -> Option<&RunId> {
        (self.status.status.holds_run() && !self.status.run_id.is_none())
            .then_some(&self.status.run_id)
    }

    /// The run recorded for this request, held or not.
    ///
    /// A run is recorded before the namespace is locked for it, so a
    /// namespace lock taken for the request can always be found again.
    #[must_use]
    pub fn reserved_run(&self) -> Option<&RunId> {
        (!self.status.run_id.is_none()).then_some(&self.status.run_id)
    }
}

impl Object for UpdateRequest {
    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }
}
