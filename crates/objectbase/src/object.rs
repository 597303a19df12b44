//! Object trait, object metadata and the type factory scheme.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use drover_core::{Error, ObjectId, Result};

/// Store managed metadata carried by every object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub id: ObjectId,
    /// Zero for objects never written. Incremented by every successful write.
    #[serde(default)]
    pub generation: u64,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub finalizers: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deletion_requested: bool,
}

impl ObjectMeta {
    /// Metadata for a not yet persisted object.
    pub const fn new(id: ObjectId) -> Self {
        Self {
            id,
            generation: 0,
            finalizers: BTreeSet::new(),
            deletion_requested: false,
        }
    }

    /// Add a finalizer. Returns whether it was missing.
    pub fn add_finalizer(&mut self, name: &str) -> bool {
        self.finalizers.insert(name.to_string())
    }

    /// Remove a finalizer. Returns whether it was present.
    pub fn remove_finalizer(&mut self, name: &str) -> bool {
        self.finalizers.remove(name)
    }

    #[must_use]
    pub fn has_finalizer(&self, name: &str) -> bool {
        self.finalizers.contains(name)
    }
}

/// Type erased helpers implemented for every cloneable object.
pub trait DynObject {
    /// Clone into a fresh box.
    fn clone_object(&self) -> Box<dyn Object>;

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync>;

    /// Overwrite `self` with `other` if both have the same concrete type.
    fn assign(&mut self, other: &dyn Object) -> bool;
}

impl<T: Object + Clone> DynObject for T {
    fn clone_object(&self) -> Box<dyn Object> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
        self
    }

    fn assign(&mut self, other: &dyn Object) -> bool {
        match other.as_any().downcast_ref::<T>() {
            Some(other) => {
                *self = other.clone();
                true
            }
            None => false,
        }
    }
}

/// A persisted object.
pub trait Object: DynObject + Any + Send + Sync + fmt::Debug {
    fn meta(&self) -> &ObjectMeta;

    fn meta_mut(&mut self) -> &mut ObjectMeta;

    fn id(&self) -> &ObjectId {
        &self.meta().id
    }

    fn generation(&self) -> u64 {
        self.meta().generation
    }
}

impl Clone for Box<dyn Object> {
    fn clone(&self) -> Self {
        self.clone_object()
    }
}

/// Access to the object view of a value, also for trait objects of subtraits.
pub trait AsObject {
    fn as_object(&self) -> &dyn Object;

    fn as_object_mut(&mut self) -> &mut dyn Object;
}

impl<T: Object> AsObject for T {
    fn as_object(&self) -> &dyn Object {
        self
    }

    fn as_object_mut(&mut self) -> &mut dyn Object {
        self
    }
}

impl AsObject for dyn Object {
    fn as_object(&self) -> &dyn Object {
        self
    }

    fn as_object_mut(&mut self) -> &mut dyn Object {
        self
    }
}

/// Downcast a boxed object to its concrete type.
///
/// # Errors
///
/// Returns `InvalidObject` if the object is of another type.
pub fn downcast<T: Object>(object: Box<dyn Object>) -> Result<Box<T>> {
    let id = object.id().clone();
    object
        .into_any()
        .downcast::<T>()
        .map_err(|_| Error::invalid_object(format!("{id} has unexpected concrete type")))
}

type Factory = fn() -> Box<dyn Object>;

fn create_default<T: Object + Default>() -> Box<dyn Object> {
    Box::new(T::default())
}

/// Registry of object factories keyed by type name.
#[derive(Clone, Default)]
pub struct Scheme {
    factories: BTreeMap<String, Factory>,
}

impl Scheme {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the factory for `kind`. A second registration replaces the first.
    pub fn register<T: Object + Default>(&mut self, kind: impl Into<String>) -> &mut Self {
        self.factories.insert(kind.into(), create_default::<T>);
        self
    }

    /// Builder flavour of [`Scheme::register`].
    #[must_use]
    pub fn with<T: Object + Default>(mut self, kind: impl Into<String>) -> Self {
        self.register::<T>(kind);
        self
    }

    #[must_use]
    pub fn knows(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Registered type names in sorted order.
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Create an empty, unpersisted object carrying the given id.
    ///
    /// # Errors
    ///
    /// Returns `UnknownType` if no factory is registered for the id's type.
    pub fn create(&self, id: &ObjectId) -> Result<Box<dyn Object>> {
        let factory = self
            .factories
            .get(id.kind())
            .ok_or_else(|| Error::unknown_type(id.kind()))?;
        let mut object = factory();
        *object.meta_mut() = ObjectMeta::new(id.clone());
        Ok(object)
    }

    /// Create an object and downcast it to its concrete type.
    ///
    /// # Errors
    ///
    /// Returns `UnknownType` for unregistered types and `InvalidObject` when
    /// the factory produces another concrete type.
    pub fn create_typed<T: Object>(&self, id: &ObjectId) -> Result<Box<T>> {
        downcast(self.create(id)?)
    }
}

impl fmt::Debug for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheme")
            .field("kinds", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}
