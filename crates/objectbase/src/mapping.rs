//! Functional views over a technical objectbase.
//!
//! An [`IdMapping`] translates between the ids a component works with and the
//! ids actually stored. [`MappedObjectbase`] applies a mapping to every call,
//! so several engines can share one store without seeing each other.

use std::sync::Arc;

use async_trait::async_trait;

use drover_core::{ObjectId, Result};

use crate::handler::{EventHandler, Filter, HandlerId};
use crate::object::{Object, Scheme};
use crate::store::Objectbase;

/// Pure translation between functional and technical namespaces.
pub trait IdMapping: Send + Sync {
    fn namespace_to_technical(&self, namespace: &str) -> String;

    /// `None` if the technical namespace is not visible in the functional view.
    fn namespace_to_functional(&self, namespace: &str) -> Option<String>;

    fn to_technical(&self, id: &ObjectId) -> ObjectId {
        ObjectId::new(
            id.kind(),
            self.namespace_to_technical(id.namespace()),
            id.name(),
        )
    }

    fn to_functional(&self, id: &ObjectId) -> Option<ObjectId> {
        self.namespace_to_functional(id.namespace())
            .map(|namespace| ObjectId::new(id.kind(), namespace, id.name()))
    }
}

/// Ids are stored as they are.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityMapping;

impl IdMapping for IdentityMapping {
    fn namespace_to_technical(&self, namespace: &str) -> String {
        namespace.to_string()
    }

    fn namespace_to_functional(&self, namespace: &str) -> Option<String> {
        Some(namespace.to_string())
    }
}

/// Functional namespaces live below a fixed technical namespace.
#[derive(Debug, Clone)]
pub struct NamespacePrefixMapping {
    prefix: String,
}

impl NamespacePrefixMapping {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl IdMapping for NamespacePrefixMapping {
    fn namespace_to_technical(&self, namespace: &str) -> String {
        if namespace.is_empty() {
            self.prefix.clone()
        } else {
            format!("{}/{namespace}", self.prefix)
        }
    }

    fn namespace_to_functional(&self, namespace: &str) -> Option<String> {
        if namespace == self.prefix {
            return Some(String::new());
        }
        namespace
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .map(str::to_string)
    }
}

struct MappingHandler {
    inner: Arc<dyn EventHandler>,
    mapping: Arc<dyn IdMapping>,
}

impl EventHandler for MappingHandler {
    fn handle_event(&self, id: &ObjectId) {
        if let Some(functional) = self.mapping.to_functional(id) {
            self.inner.handle_event(&functional);
        }
    }
}

/// Objectbase adapter presenting the functional id space of a mapping.
pub struct MappedObjectbase<S: Objectbase> {
    inner: S,
    mapping: Arc<dyn IdMapping>,
}

impl<S: Objectbase> MappedObjectbase<S> {
    pub fn new(inner: S, mapping: Arc<dyn IdMapping>) -> Self {
        Self { inner, mapping }
    }

    pub const fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: Objectbase> Objectbase for MappedObjectbase<S> {
    fn scheme(&self) -> &Scheme {
        self.inner.scheme()
    }

    async fn get_object(&self, id: &ObjectId) -> Result<Box<dyn Object>> {
        let mut object = self.inner.get_object(&self.mapping.to_technical(id)).await?;
        object.meta_mut().id = id.clone();
        Ok(object)
    }

    async fn set_object(&self, object: &mut dyn Object) -> Result<()> {
        let functional = object.id().clone();
        object.meta_mut().id = self.mapping.to_technical(&functional);
        let result = self.inner.set_object(object).await;
        object.meta_mut().id = functional;
        result
    }

    async fn list_objects(
        &self,
        kind: &str,
        closure: bool,
        namespace: &str,
    ) -> Result<Vec<ObjectId>> {
        let technical = self.mapping.namespace_to_technical(namespace);
        Ok(self
            .inner
            .list_objects(kind, closure, &technical)
            .await?
            .iter()
            .filter_map(|id| self.mapping.to_functional(id))
            .collect())
    }

    async fn delete_object(&self, id: &ObjectId) -> Result<bool> {
        self.inner
            .delete_object(&self.mapping.to_technical(id))
            .await
    }

    async fn register_handler(
        &self,
        handler: Arc<dyn EventHandler>,
        replay: bool,
        filter: Filter,
    ) -> Result<HandlerId> {
        let technical = Filter::new(
            filter.kind,
            filter.closure,
            self.mapping.namespace_to_technical(&filter.namespace),
        );
        let handler = Arc::new(MappingHandler {
            inner: handler,
            mapping: Arc::clone(&self.mapping),
        });
        self.inner.register_handler(handler, replay, technical).await
    }

    async fn unregister_handler(&self, id: HandlerId) -> Result<()> {
        self.inner.unregister_handler(id).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::object::ObjectMeta;
    use crate::store::InMemoryObjectbase;

    #[derive(Debug, Clone, Default)]
    struct Item {
        meta: ObjectMeta,
    }

    impl Object for Item {
        fn meta(&self) -> &ObjectMeta {
            &self.meta
        }

        fn meta_mut(&mut self) -> &mut ObjectMeta {
            &mut self.meta
        }
    }

    #[test]
    fn test_prefix_mapping_round_trip() {
        let mapping = NamespacePrefixMapping::new("tenant");
        let id = ObjectId::new("Item", "ns", "a");
        let technical = mapping.to_technical(&id);
        assert_eq!(technical.namespace(), "tenant/ns");
        assert_eq!(mapping.to_functional(&technical), Some(id));
        assert_eq!(mapping.namespace_to_functional("tenant"), Some(String::new()));
        assert_eq!(mapping.namespace_to_functional("tenantx/ns"), None);
        assert_eq!(mapping.namespace_to_functional("other"), None);
    }

    #[tokio::test]
    async fn test_mapped_store_hides_technical_namespaces() {
        let base = Arc::new(InMemoryObjectbase::new(Scheme::new().with::<Item>("Item")));
        let mapped = MappedObjectbase::new(
            Arc::clone(&base),
            Arc::new(NamespacePrefixMapping::new("tenant")),
        );

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        mapped
            .register_handler(
                Arc::new(move |id: &ObjectId| sink.lock().unwrap().push(id.clone())),
                false,
                Filter::new("Item", true, ""),
            )
            .await
            .unwrap();

        let id = ObjectId::new("Item", "ns", "a");
        let mut item = Item {
            meta: ObjectMeta::new(id.clone()),
        };
        mapped.set_object(&mut item).await.unwrap();
        assert_eq!(item.id(), &id);

        let technical = ObjectId::new("Item", "tenant/ns", "a");
        assert!(base.get_object(&technical).await.is_ok());
        assert_eq!(mapped.get_object(&id).await.unwrap().id(), &id);
        assert_eq!(mapped.list_objects("Item", true, "").await.unwrap(), vec![id.clone()]);
        assert_eq!(seen.lock().unwrap().as_slice(), &[id]);
    }

    #[tokio::test]
    async fn test_identity_mapping_passes_through() {
        let mapped = MappedObjectbase::new(
            InMemoryObjectbase::new(Scheme::new().with::<Item>("Item")),
            Arc::new(IdentityMapping),
        );
        let mut item = Item {
            meta: ObjectMeta::new(ObjectId::new("Item", "ns", "a")),
        };
        mapped.set_object(&mut item).await.unwrap();
        assert_eq!(mapped.inner().len().await, 1);
    }
}
