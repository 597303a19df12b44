//! Element processing states and the external trigger decision.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Persisted processing state of an element.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessingStatus {
    #[default]
    #[serde(rename = "")]
    Initial,
    Pending,
    Preparing,
    Processing,
    Waiting,
    Completed,
    Failed,
    Invalid,
    Blocked,
    Deleting,
    Deleted,
}

impl ProcessingStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "",
            Self::Pending => "Pending",
            Self::Preparing => "Preparing",
            Self::Processing => "Processing",
            Self::Waiting => "Waiting",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Invalid => "Invalid",
            Self::Blocked => "Blocked",
            Self::Deleting => "Deleting",
            Self::Deleted => "Deleted",
        }
    }

    /// Idle enough to accept a new external trigger.
    #[must_use]
    pub const fn is_ext_triggerable(self) -> bool {
        matches!(
            self,
            Self::Initial
                | Self::Pending
                | Self::Invalid
                | Self::Preparing
                | Self::Blocked
                | Self::Completed
                | Self::Failed
        )
    }

    /// Owns an active run and may invoke processing.
    #[must_use]
    pub const fn is_processable(self) -> bool {
        matches!(self, Self::Processing | Self::Deleting | Self::Waiting)
    }

    /// A run ended in this state.
    #[must_use]
    pub const fn is_final(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Invalid | Self::Blocked | Self::Deleted
        )
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reaction to a change of an external object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerDecision {
    /// Nothing to do.
    Ignore,
    /// Lock the dependent subgraph under a new run.
    StartRun,
    /// Re-enqueue the element within its current run. With `reset` the
    /// status goes back to `Preparing` so the new state is accepted.
    RetriggerInPlace { reset: bool },
    /// The element is busy with its run; retry later.
    Defer,
}

/// Decide how an external change affects the element it triggers.
#[must_use]
pub const fn retrigger_decision(
    locked: bool,
    status: ProcessingStatus,
    foreign_controlled: bool,
    changed: bool,
) -> TriggerDecision {
    if !locked {
        return if changed {
            TriggerDecision::StartRun
        } else {
            TriggerDecision::Ignore
        };
    }
    if status.is_ext_triggerable() {
        return TriggerDecision::RetriggerInPlace { reset: false };
    }
    if status.is_processable() && foreign_controlled && changed {
        return TriggerDecision::RetriggerInPlace { reset: true };
    }
    TriggerDecision::Defer
}
