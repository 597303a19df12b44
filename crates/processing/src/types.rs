//! Registry binding type names to object factories and engine roles.

use std::collections::BTreeMap;
use std::fmt;

use drover_core::{Error, ObjectId, Result};
use drover_metamodel::MetaModel;
use drover_objectbase::{Object, Scheme};

use crate::namespace::Namespace;
use crate::objects::{ExternalObject, InternalObject};
use crate::update_request::UpdateRequest;

type InternalCast = fn(Box<dyn Object>) -> Option<Box<dyn InternalObject>>;
type ExternalCast = fn(Box<dyn Object>) -> Option<Box<dyn ExternalObject>>;

fn cast_internal<T: InternalObject>(object: Box<dyn Object>) -> Option<Box<dyn InternalObject>> {
    let object: Box<T> = object.into_any().downcast::<T>().ok()?;
    Some(object as Box<dyn InternalObject>)
}

fn cast_external<T: ExternalObject>(object: Box<dyn Object>) -> Option<Box<dyn ExternalObject>> {
    let object: Box<T> = object.into_any().downcast::<T>().ok()?;
    Some(object as Box<dyn ExternalObject>)
}

/// Object types known to the engine and the role each one plays.
#[derive(Clone, Default)]
pub struct EngineTypes {
    scheme: Scheme,
    namespace: Option<String>,
    update_request: Option<String>,
    internal: BTreeMap<String, InternalCast>,
    external: BTreeMap<String, ExternalCast>,
}

impl EngineTypes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the engine's namespace object under `kind`.
    #[must_use]
    pub fn with_namespace(mut self, kind: impl Into<String>) -> Self {
        let kind = kind.into();
        self.scheme.register::<Namespace>(kind.clone());
        self.namespace = Some(kind);
        self
    }

    /// Register the engine's update request object under `kind`.
    #[must_use]
    pub fn with_update_request(mut self, kind: impl Into<String>) -> Self {
        let kind = kind.into();
        self.scheme.register::<UpdateRequest>(kind.clone());
        self.update_request = Some(kind);
        self
    }

    #[must_use]
    pub fn with_internal<T: InternalObject + Default>(mut self, kind: impl Into<String>) -> Self {
        let kind = kind.into();
        self.scheme.register::<T>(kind.clone());
        self.internal.insert(kind, cast_internal::<T>);
        self
    }

    #[must_use]
    pub fn with_external<T: ExternalObject + Default>(mut self, kind: impl Into<String>) -> Self {
        let kind = kind.into();
        self.scheme.register::<T>(kind.clone());
        self.external.insert(kind, cast_external::<T>);
        self
    }

    /// The object scheme stores of this engine must be created with.
    #[must_use]
    pub const fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    #[must_use]
    pub fn namespace_type(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    #[must_use]
    pub fn update_request_type(&self) -> Option<&str> {
        self.update_request.as_deref()
    }

    /// Check that every type of `model` has the role the model assigns to it.
    ///
    /// # Errors
    ///
    /// Returns `InvalidMetaModel` naming the first type without its role.
    pub fn check(&self, model: &MetaModel) -> Result<()> {
        if self.namespace_type() != Some(model.namespace_type()) {
            return Err(Error::invalid_metamodel(format!(
                "namespace type '{}' is not registered as namespace",
                model.namespace_type()
            )));
        }
        if let Some(kind) = model.update_request_type() {
            if self.update_request_type() != Some(kind) {
                return Err(Error::invalid_metamodel(format!(
                    "update request type '{kind}' is not registered as update request"
                )));
            }
        }
        if let Some(kind) = model.internal_types().find(|k| !self.internal.contains_key(*k)) {
            return Err(Error::invalid_metamodel(format!(
                "internal type '{kind}' has no internal object role"
            )));
        }
        if let Some(kind) = model.external_types().find(|k| !self.external.contains_key(*k)) {
            return Err(Error::invalid_metamodel(format!(
                "external type '{kind}' has no external object role"
            )));
        }
        Ok(())
    }

    /// Create an empty internal object.
    ///
    /// # Errors
    ///
    /// Returns `UnknownType` for types without internal role.
    pub fn create_internal(&self, id: &ObjectId) -> Result<Box<dyn InternalObject>> {
        self.to_internal(self.scheme.create(id)?)
    }

    /// View an object as internal object.
    ///
    /// # Errors
    ///
    /// Returns `UnknownType` for types without internal role and
    /// `InvalidObject` for unexpected concrete types.
    pub fn to_internal(&self, object: Box<dyn Object>) -> Result<Box<dyn InternalObject>> {
        let id = object.id().clone();
        let cast = self
            .internal
            .get(id.kind())
            .ok_or_else(|| Error::unknown_type(id.kind()))?;
        cast(object).ok_or_else(|| Error::invalid_object(format!("{id} is no internal object")))
    }

    /// View an object as external object.
    ///
    /// # Errors
    ///
    /// Returns `UnknownType` for types without external role and
    /// `InvalidObject` for unexpected concrete types.
    pub fn to_external(&self, object: Box<dyn Object>) -> Result<Box<dyn ExternalObject>> {
        let id = object.id().clone();
        let cast = self
            .external
            .get(id.kind())
            .ok_or_else(|| Error::unknown_type(id.kind()))?;
        cast(object).ok_or_else(|| Error::invalid_object(format!("{id} is no external object")))
    }
}

impl fmt::Debug for EngineTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineTypes")
            .field("namespace", &self.namespace)
            .field("update_request", &self.update_request)
            .field("internal", &self.internal.keys().collect::<Vec<_>>())
            .field("external", &self.external.keys().collect::<Vec<_>>())
            .finish()
    }
}
