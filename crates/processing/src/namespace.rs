//! Persisted namespace object carrying the namespace run lock.

use serde::{Deserialize, Serialize};

use drover_core::{ObjectId, RunId};
use drover_objectbase::{Object, ObjectMeta};

/// Persisted counterpart of a namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    pub meta: ObjectMeta,
    /// The run currently owning the namespace. Empty when unlocked.
    #[serde(default)]
    pub run_lock: RunId,
}

impl Object for Namespace {
    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }
}

/// Id of the object describing `namespace`.
///
/// `a/b` is stored as object `b` in namespace `a`, top level namespaces in
/// the root namespace.
#[must_use]
pub fn namespace_object_id(kind: &str, namespace: &str) -> ObjectId {
    match namespace.rsplit_once('/') {
        Some((parent, name)) => ObjectId::new(kind, parent, name),
        None => ObjectId::new(kind, "", namespace),
    }
}
