//! Objectbase trait and implementations.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use drover_core::{Error, ObjectId, Result};

use crate::handler::{EventHandler, Filter, HandlerId, HandlerRegistry};
use crate::object::{Object, Scheme, downcast};

/// Typed object store with optimistic concurrency and change notification.
#[async_trait]
pub trait Objectbase: Send + Sync {
    /// The type scheme objects of this store are created from.
    fn scheme(&self) -> &Scheme;

    /// Read a copy of the stored object.
    async fn get_object(&self, id: &ObjectId) -> Result<Box<dyn Object>>;

    /// Write an object.
    ///
    /// The object's generation must match the stored one (zero for new
    /// objects). On success the generation of `object` is advanced to the
    /// stored value. A stale generation fails with `Modified` and stores
    /// nothing.
    async fn set_object(&self, object: &mut dyn Object) -> Result<()>;

    /// Ids of all objects of `kind` in `namespace` (and below it with `closure`), sorted.
    async fn list_objects(&self, kind: &str, closure: bool, namespace: &str)
    -> Result<Vec<ObjectId>>;

    /// Delete an object.
    ///
    /// Objects without finalizers are removed and `true` is returned. Objects
    /// with finalizers are only marked for deletion; they disappear with the
    /// write that removes the last finalizer.
    async fn delete_object(&self, id: &ObjectId) -> Result<bool>;

    /// Register a change handler.
    ///
    /// With `replay` the handler first receives the ids of all existing
    /// matching objects. Live events are delivered from the moment of
    /// registration, so no change can be missed.
    async fn register_handler(
        &self,
        handler: Arc<dyn EventHandler>,
        replay: bool,
        filter: Filter,
    ) -> Result<HandlerId>;

    async fn unregister_handler(&self, id: HandlerId) -> Result<()>;
}

/// Read an object and downcast it to its concrete type.
///
/// # Errors
///
/// Fails with the store's error or `InvalidObject` for another concrete type.
pub async fn get_typed<T: Object>(store: &dyn Objectbase, id: &ObjectId) -> Result<Box<T>> {
    downcast(store.get_object(id).await?)
}

#[async_trait]
impl<S: Objectbase + ?Sized> Objectbase for Arc<S> {
    fn scheme(&self) -> &Scheme {
        (**self).scheme()
    }

    async fn get_object(&self, id: &ObjectId) -> Result<Box<dyn Object>> {
        (**self).get_object(id).await
    }

    async fn set_object(&self, object: &mut dyn Object) -> Result<()> {
        (**self).set_object(object).await
    }

    async fn list_objects(
        &self,
        kind: &str,
        closure: bool,
        namespace: &str,
    ) -> Result<Vec<ObjectId>> {
        (**self).list_objects(kind, closure, namespace).await
    }

    async fn delete_object(&self, id: &ObjectId) -> Result<bool> {
        (**self).delete_object(id).await
    }

    async fn register_handler(
        &self,
        handler: Arc<dyn EventHandler>,
        replay: bool,
        filter: Filter,
    ) -> Result<HandlerId> {
        (**self).register_handler(handler, replay, filter).await
    }

    async fn unregister_handler(&self, id: HandlerId) -> Result<()> {
        (**self).unregister_handler(id).await
    }
}

/// In-memory objectbase used by tests and the demo binary.
pub struct InMemoryObjectbase {
    scheme: Scheme,
    objects: RwLock<BTreeMap<ObjectId, Box<dyn Object>>>,
    handlers: HandlerRegistry,
}

impl InMemoryObjectbase {
    /// Create an empty store for the given scheme.
    pub fn new(scheme: Scheme) -> Self {
        Self {
            scheme,
            objects: RwLock::new(BTreeMap::new()),
            handlers: HandlerRegistry::new(),
        }
    }

    /// Create a new in-memory store wrapped in an Arc.
    pub fn new_arc(scheme: Scheme) -> Arc<Self> {
        Arc::new(Self::new(scheme))
    }

    /// Number of stored objects.
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    fn check_kind(&self, kind: &str) -> Result<()> {
        if self.scheme.knows(kind) {
            Ok(())
        } else {
            Err(Error::unknown_type(kind))
        }
    }
}

#[async_trait]
impl Objectbase for InMemoryObjectbase {
    fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    async fn get_object(&self, id: &ObjectId) -> Result<Box<dyn Object>> {
        self.objects
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(id))
    }

    async fn set_object(&self, object: &mut dyn Object) -> Result<()> {
        let id = object.id().clone();
        self.check_kind(id.kind())?;

        let removed = {
            let mut objects = self.objects.write().await;
            match objects.get(&id) {
                Some(stored) if stored.generation() != object.generation() => {
                    return Err(Error::modified(&id));
                }
                Some(stored) if stored.meta().deletion_requested => {
                    object.meta_mut().deletion_requested = true;
                }
                None if object.generation() != 0 => return Err(Error::not_found(&id)),
                _ => {}
            }

            let meta = object.meta_mut();
            meta.generation = meta.generation.saturating_add(1);
            let removed = meta.deletion_requested && meta.finalizers.is_empty();
            if removed {
                objects.remove(&id);
            } else {
                objects.insert(id.clone(), object.clone_object());
            }
            removed
        };

        debug!(
            object = %id,
            generation = object.generation(),
            removed,
            "Object written"
        );
        self.handlers.notify(&id).await;
        Ok(())
    }

    async fn list_objects(
        &self,
        kind: &str,
        closure: bool,
        namespace: &str,
    ) -> Result<Vec<ObjectId>> {
        self.check_kind(kind)?;
        let filter = Filter::new(kind, closure, namespace);
        Ok(self
            .objects
            .read()
            .await
            .keys()
            .filter(|id| filter.matches(id))
            .cloned()
            .collect())
    }

    async fn delete_object(&self, id: &ObjectId) -> Result<bool> {
        let removed = {
            let mut objects = self.objects.write().await;
            let stored = objects.get_mut(id).ok_or_else(|| Error::not_found(id))?;
            if stored.meta().finalizers.is_empty() {
                objects.remove(id);
                true
            } else if stored.meta().deletion_requested {
                return Ok(false);
            } else {
                let meta = stored.meta_mut();
                meta.deletion_requested = true;
                meta.generation = meta.generation.saturating_add(1);
                false
            }
        };

        debug!(object = %id, removed, "Object deletion requested");
        self.handlers.notify(id).await;
        Ok(removed)
    }

    async fn register_handler(
        &self,
        handler: Arc<dyn EventHandler>,
        replay: bool,
        filter: Filter,
    ) -> Result<HandlerId> {
        let id = self
            .handlers
            .register(Arc::clone(&handler), filter.clone())
            .await;
        if replay {
            let existing: Vec<ObjectId> = self
                .objects
                .read()
                .await
                .keys()
                .filter(|id| filter.matches(id))
                .cloned()
                .collect();
            trace!(handler = %id, objects = existing.len(), "Replaying existing objects");
            for object in &existing {
                handler.handle_event(object);
            }
        }
        Ok(id)
    }

    async fn unregister_handler(&self, id: HandlerId) -> Result<()> {
        if self.handlers.unregister(id).await {
            Ok(())
        } else {
            Err(Error::not_found(id))
        }
    }
}

/// A wrapper that adds tracing to an objectbase.
pub struct TracingObjectbase<S: Objectbase> {
    inner: S,
}

impl<S: Objectbase> TracingObjectbase<S> {
    /// Create a new tracing objectbase.
    pub const fn new(inner: S) -> Self {
        Self { inner }
    }

    pub const fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: Objectbase> Objectbase for TracingObjectbase<S> {
    fn scheme(&self) -> &Scheme {
        self.inner.scheme()
    }

    async fn get_object(&self, id: &ObjectId) -> Result<Box<dyn Object>> {
        trace!(object = %id, "Reading object");
        self.inner.get_object(id).await
    }

    async fn set_object(&self, object: &mut dyn Object) -> Result<()> {
        debug!(
            object = %object.id(),
            generation = object.generation(),
            "Writing object"
        );
        let result = self.inner.set_object(object).await;
        if let Err(ref e) = result {
            debug!(object = %object.id(), error = %e, "Write rejected");
        }
        result
    }

    async fn list_objects(
        &self,
        kind: &str,
        closure: bool,
        namespace: &str,
    ) -> Result<Vec<ObjectId>> {
        debug!(kind, closure, namespace, "Listing objects");
        self.inner.list_objects(kind, closure, namespace).await
    }

    async fn delete_object(&self, id: &ObjectId) -> Result<bool> {
        debug!(object = %id, "Deleting object");
        self.inner.delete_object(id).await
    }

    async fn register_handler(
        &self,
        handler: Arc<dyn EventHandler>,
        replay: bool,
        filter: Filter,
    ) -> Result<HandlerId> {
        debug!(kind = %filter.kind, namespace = %filter.namespace, replay, "Registering handler");
        self.inner.register_handler(handler, replay, filter).await
    }

    async fn unregister_handler(&self, id: HandlerId) -> Result<()> {
        debug!(handler = %id, "Unregistering handler");
        self.inner.unregister_handler(id).await
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::object::ObjectMeta;

    #[derive(Debug, Clone, Default)]
    struct Item {
        meta: ObjectMeta,
        value: i64,
    }

    impl Object for Item {
        fn meta(&self) -> &ObjectMeta {
            &self.meta
        }

        fn meta_mut(&mut self) -> &mut ObjectMeta {
            &mut self.meta
        }
    }

    fn store() -> InMemoryObjectbase {
        InMemoryObjectbase::new(Scheme::new().with::<Item>("Item"))
    }

    fn item(name: &str, value: i64) -> Item {
        Item {
            meta: ObjectMeta::new(ObjectId::new("Item", "ns", name)),
            value,
        }
    }

    #[tokio::test]
    async fn test_generation_increments_on_every_write() {
        let store = store();
        let mut a = item("a", 1);
        store.set_object(&mut a).await.unwrap();
        assert_eq!(a.generation(), 1);
        a.value = 2;
        store.set_object(&mut a).await.unwrap();
        assert_eq!(a.generation(), 2);

        let stored = get_typed::<Item>(&store, a.id()).await.unwrap();
        assert_eq!(stored.value, 2);
        assert_eq!(stored.generation(), 2);
    }

    #[tokio::test]
    async fn test_stale_write_is_rejected() {
        let store = store();
        let mut a = item("a", 1);
        store.set_object(&mut a).await.unwrap();
        let mut stale = a.clone();
        a.value = 2;
        store.set_object(&mut a).await.unwrap();

        stale.value = 99;
        let result = store.set_object(&mut stale).await;
        assert!(result.is_err_and(|e| e.is_modified()));
        let stored = get_typed::<Item>(&store, a.id()).await.unwrap();
        assert_eq!(stored.value, 2);
    }

    #[tokio::test]
    async fn test_unknown_type_is_rejected() {
        let store = store();
        let mut other = Item {
            meta: ObjectMeta::new(ObjectId::new("Other", "ns", "a")),
            value: 0,
        };
        assert!(store.set_object(&mut other).await.is_err());
        assert!(store.list_objects("Other", false, "ns").await.is_err());
    }

    #[tokio::test]
    async fn test_list_with_namespace_closure() {
        let store = store();
        for (ns, name) in [("ns", "a"), ("ns/sub", "b"), ("other", "c")] {
            let mut o = Item {
                meta: ObjectMeta::new(ObjectId::new("Item", ns, name)),
                value: 0,
            };
            store.set_object(&mut o).await.unwrap();
        }
        assert_eq!(store.list_objects("Item", false, "ns").await.unwrap().len(), 1);
        assert_eq!(store.list_objects("Item", true, "ns").await.unwrap().len(), 2);
        assert_eq!(store.list_objects("Item", true, "").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_delete_waits_for_finalizers() {
        let store = store();
        let mut a = item("a", 1);
        a.meta.add_finalizer("engine");
        store.set_object(&mut a).await.unwrap();

        assert!(!store.delete_object(a.id()).await.unwrap());
        let mut marked = get_typed::<Item>(&store, a.id()).await.unwrap();
        assert!(marked.meta.deletion_requested);

        marked.meta.remove_finalizer("engine");
        store.set_object(marked.as_mut()).await.unwrap();
        assert!(store.get_object(a.id()).await.is_err_and(|e| e.is_not_found()));
    }

    #[tokio::test]
    async fn test_delete_without_finalizers_removes() {
        let store = store();
        let mut a = item("a", 1);
        store.set_object(&mut a).await.unwrap();
        assert!(store.delete_object(a.id()).await.unwrap());
        assert!(store.is_empty().await);
        assert!(store.delete_object(a.id()).await.is_err());
    }

    #[tokio::test]
    async fn test_register_handler_replays_existing_objects() {
        let store = store();
        let mut a = item("a", 1);
        store.set_object(&mut a).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler = store
            .register_handler(
                Arc::new(move |id: &ObjectId| sink.lock().unwrap().push(id.clone())),
                true,
                Filter::new("Item", false, "ns"),
            )
            .await
            .unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);

        let mut b = item("b", 2);
        store.set_object(&mut b).await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), 2);

        store.unregister_handler(handler).await.unwrap();
        b.value = 3;
        store.set_object(&mut b).await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_tracing_wrapper_delegates() {
        let store = TracingObjectbase::new(store());
        let mut a = item("a", 1);
        store.set_object(&mut a).await.unwrap();
        assert_eq!(store.inner().len().await, 1);
        assert!(store.get_object(a.id()).await.is_ok());
    }
}
