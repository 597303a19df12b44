//! Declarative description a metamodel is compiled from.

use serde::{Deserialize, Serialize};

use drover_core::{Phase, TypeId};

/// Specification of a metamodel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaModelSpec {
    pub namespace_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_request_type: Option<String>,
    #[serde(default)]
    pub internal_types: Vec<InternalTypeSpec>,
    #[serde(default)]
    pub external_types: Vec<ExternalTypeSpec>,
}

impl MetaModelSpec {
    pub fn new(namespace_type: impl Into<String>) -> Self {
        Self {
            namespace_type: namespace_type.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_update_request_type(mut self, kind: impl Into<String>) -> Self {
        self.update_request_type = Some(kind.into());
        self
    }

    #[must_use]
    pub fn with_internal(mut self, internal: InternalTypeSpec) -> Self {
        self.internal_types.push(internal);
        self
    }

    #[must_use]
    pub fn with_external(mut self, external: ExternalTypeSpec) -> Self {
        self.external_types.push(external);
        self
    }
}

/// An internal type and its phases in processing order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalTypeSpec {
    pub name: String,
    pub phases: Vec<PhaseSpec>,
}

impl InternalTypeSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phases: Vec::new(),
        }
    }

    /// Append a phase depending on the given element types.
    #[must_use]
    pub fn phase<I>(mut self, name: impl Into<Phase>, dependencies: I) -> Self
    where
        I: IntoIterator<Item = TypeId>,
    {
        self.phases.push(PhaseSpec {
            name: name.into(),
            dependencies: dependencies.into_iter().collect(),
        });
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub name: Phase,
    #[serde(default)]
    pub dependencies: Vec<TypeId>,
}

/// An external type and the element type it triggers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalTypeSpec {
    pub name: String,
    pub trigger: TypeId,
    /// The status of such objects reflects the progress of another
    /// controller, so changes are accepted even while a run is active.
    #[serde(default)]
    pub foreign_controlled: bool,
}

impl ExternalTypeSpec {
    pub fn new(name: impl Into<String>, trigger: TypeId) -> Self {
        Self {
            name: name.into(),
            trigger,
            foreign_controlled: false,
        }
    }

    #[must_use]
    pub fn foreign_controlled(mut self) -> Self {
        self.foreign_controlled = true;
        self
    }
}
