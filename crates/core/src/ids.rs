//! Identifiers for objects, elements, element types and runs.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;
use uuid::Uuid;

use crate::error::Error;

/// Prefix of run ids created on behalf of update request objects.
const REQUEST_RUN_PREFIX: &str = "obj:";

/// Identifies a persisted object by type, namespace and name.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId {
    #[serde(rename = "type")]
    kind: String,
    namespace: String,
    name: String,
}

impl ObjectId {
    /// Create a new object id.
    pub fn new(kind: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// The object type.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The namespace the object lives in.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The object name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The same namespace and name with another type.
    #[must_use]
    pub fn with_kind(&self, kind: impl Into<String>) -> Self {
        Self::new(kind, self.namespace.clone(), self.name.clone())
    }

    /// The element id of the given phase of this object.
    #[must_use]
    pub fn element(&self, phase: impl Into<Phase>) -> ElementId {
        ElementId::new(self.clone(), phase)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

impl FromStr for ObjectId {
    type Err = Error;

    /// Parses `type/namespace/name`. Namespaces may be nested (`a/b`) or empty.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, rest) = s
            .split_once('/')
            .ok_or_else(|| Error::invalid_id(s, "expected type/namespace/name"))?;
        let (namespace, name) = rest
            .rsplit_once('/')
            .ok_or_else(|| Error::invalid_id(s, "expected type/namespace/name"))?;
        if kind.is_empty() || name.is_empty() {
            return Err(Error::invalid_id(s, "type and name must not be empty"));
        }
        Ok(Self::new(kind, namespace, name))
    }
}

/// Name of a processing phase of an internal type.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Phase(String);

impl Phase {
    /// Create a phase name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The phase name as string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Phase {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Phase {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&Phase> for Phase {
    fn from(value: &Phase) -> Self {
        value.clone()
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies one phase of one internal object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ElementId {
    #[serde(flatten)]
    object: ObjectId,
    phase: Phase,
}

impl ElementId {
    /// Create an element id.
    pub fn new(object: ObjectId, phase: impl Into<Phase>) -> Self {
        Self {
            object,
            phase: phase.into(),
        }
    }

    /// Shorthand for building an element id from its parts.
    pub fn of(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
        phase: impl Into<Phase>,
    ) -> Self {
        Self::new(ObjectId::new(kind, namespace, name), phase)
    }

    /// The internal object this element belongs to.
    #[must_use]
    pub const fn object(&self) -> &ObjectId {
        &self.object
    }

    /// The internal object type.
    #[must_use]
    pub fn kind(&self) -> &str {
        self.object.kind()
    }

    /// The namespace of the element.
    #[must_use]
    pub fn namespace(&self) -> &str {
        self.object.namespace()
    }

    /// The object name of the element.
    #[must_use]
    pub fn name(&self) -> &str {
        self.object.name()
    }

    /// The phase of the element.
    #[must_use]
    pub const fn phase(&self) -> &Phase {
        &self.phase
    }

    /// The element type of this element.
    #[must_use]
    pub fn type_id(&self) -> TypeId {
        TypeId::new(self.kind(), self.phase.clone())
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.object, self.phase)
    }
}

impl FromStr for ElementId {
    type Err = Error;

    /// Parses `type/namespace/name:phase`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (object, phase) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::invalid_id(s, "expected type/namespace/name:phase"))?;
        if phase.is_empty() {
            return Err(Error::invalid_id(s, "phase must not be empty"));
        }
        Ok(Self::new(object.parse()?, phase))
    }
}

/// Identifies an element type: an internal type and one of its phases.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TypeId {
    #[serde(rename = "type")]
    kind: String,
    phase: Phase,
}

impl TypeId {
    /// Create an element type id.
    pub fn new(kind: impl Into<String>, phase: impl Into<Phase>) -> Self {
        Self {
            kind: kind.into(),
            phase: phase.into(),
        }
    }

    /// The internal type.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The phase.
    #[must_use]
    pub const fn phase(&self) -> &Phase {
        &self.phase
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.phase)
    }
}

impl FromStr for TypeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((kind, phase)) if !kind.is_empty() && !phase.is_empty() => {
                Ok(Self::new(kind, phase))
            }
            _ => Err(Error::invalid_id(s, "expected type:phase")),
        }
    }
}

/// Token identifying a reconciliation run. The empty token means unlocked.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// The unlocked token.
    #[must_use]
    pub const fn none() -> Self {
        Self(String::new())
    }

    /// A fresh run id for a system initiated run.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    /// A fresh run id for a run requested by the update request `name`.
    #[must_use]
    pub fn for_update_request(name: &str) -> Self {
        Self(format!("{REQUEST_RUN_PREFIX}{name}:{}", Uuid::new_v4()))
    }

    /// Wrap an existing token.
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Whether this token means unlocked.
    #[must_use]
    pub fn is_none(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether the run was initiated by an update request object.
    #[must_use]
    pub fn is_update_request(&self) -> bool {
        self.request_name().is_some()
    }

    /// The name of the update request that owns this run, if any.
    #[must_use]
    pub fn request_name(&self) -> Option<&str> {
        let rest = self.0.strip_prefix(REQUEST_RUN_PREFIX)?;
        rest.rsplit_once(':').map(|(name, _)| name)
    }

    /// The token as string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
