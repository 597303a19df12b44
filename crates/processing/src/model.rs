//! In-memory mirror of the persisted internal objects.
//!
//! The store stays authoritative. The model indexes namespaces and elements,
//! caches the per-element views needed for lock walks and readiness checks,
//! and keeps the children index (dependency -> dependents) current as views
//! change.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use drover_core::{ElementId, Error, ObjectId, Result, RunId};
use drover_metamodel::MetaModel;
use drover_objectbase::{Objectbase, downcast, modify};

use crate::namespace::{Namespace, namespace_object_id};
use crate::objects::{ExternalObject, ExternalStates, InternalObject, PhaseState};
use crate::readiness::Readiness;
use crate::status::ProcessingStatus;
use crate::types::EngineTypes;
use crate::update_request::UpdateRequest;

/// Cached view of an element used for locking and readiness decisions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElementView {
    pub lock: RunId,
    pub status: ProcessingStatus,
    /// Current links, target links and blocking links.
    pub dependencies: BTreeSet<ElementId>,
    pub output: Value,
    pub output_version: String,
    pub formal_version: String,
}

impl ElementView {
    #[must_use]
    pub fn of(state: &PhaseState) -> Self {
        let mut dependencies: BTreeSet<ElementId> = state.current.links.iter().cloned().collect();
        if let Some(target) = &state.target {
            dependencies.extend(target.links.iter().cloned());
        }
        dependencies.extend(state.blocked_on.iter().cloned());
        Self {
            lock: state.lock.clone(),
            status: state.status,
            dependencies,
            output: state.current.output.clone(),
            output_version: state.current.output_version.clone(),
            formal_version: state.current.formal_version.clone(),
        }
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        !self.lock.is_none()
    }
}

/// Ephemeral data of the run currently using an element.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessingState {
    pub run: RunId,
    pub inputs: BTreeMap<ElementId, Value>,
}

/// Unit of reconciliation: one phase of one internal object.
#[derive(Debug)]
pub struct Element {
    id: ElementId,
    busy: AsyncMutex<()>,
    processing: Mutex<ProcessingState>,
}

impl Element {
    fn new(id: ElementId) -> Self {
        Self {
            id,
            busy: AsyncMutex::new(()),
            processing: Mutex::new(ProcessingState::default()),
        }
    }

    #[must_use]
    pub const fn id(&self) -> &ElementId {
        &self.id
    }

    /// Claim the element for one reconcile call.
    ///
    /// # Errors
    ///
    /// Returns `Busy` if another worker holds it.
    pub fn try_claim(&self) -> Result<tokio::sync::MutexGuard<'_, ()>> {
        self.busy.try_lock().map_err(|_| Error::busy(&self.id))
    }

    #[must_use]
    pub fn processing(&self) -> ProcessingState {
        self.processing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_processing(&self, run: RunId, inputs: BTreeMap<ElementId, Value>) {
        *self.processing.lock().unwrap_or_else(PoisonError::into_inner) =
            ProcessingState { run, inputs };
    }

    pub(crate) fn clear_processing(&self) {
        *self.processing.lock().unwrap_or_else(PoisonError::into_inner) =
            ProcessingState::default();
    }
}

#[derive(Debug, Default)]
struct NamespaceState {
    run_lock: RunId,
    elements: BTreeMap<ElementId, Arc<Element>>,
    views: BTreeMap<ElementId, ElementView>,
    children: BTreeMap<ElementId, BTreeSet<ElementId>>,
    generations: BTreeMap<ObjectId, u64>,
    pending: BTreeMap<RunId, BTreeSet<ElementId>>,
    held: BTreeSet<RunId>,
}

impl NamespaceState {
    fn set_view(&mut self, id: &ElementId, view: ElementView) {
        let previous = self.views.insert(id.clone(), view);
        let stale = previous.map(|v| v.dependencies).unwrap_or_default();
        let fresh = self.views.get(id).map(|v| v.dependencies.clone()).unwrap_or_default();
        for dependency in stale.difference(&fresh) {
            if let Some(dependents) = self.children.get_mut(dependency) {
                dependents.remove(id);
                if dependents.is_empty() {
                    self.children.remove(dependency);
                }
            }
        }
        for dependency in fresh.difference(&stale) {
            self.children
                .entry(dependency.clone())
                .or_default()
                .insert(id.clone());
        }
    }

    fn remove_view(&mut self, id: &ElementId) {
        if let Some(view) = self.views.remove(id) {
            for dependency in &view.dependencies {
                if let Some(dependents) = self.children.get_mut(dependency) {
                    dependents.remove(id);
                    if dependents.is_empty() {
                        self.children.remove(dependency);
                    }
                }
            }
        }
    }
}

/// In-memory counterpart of a namespace.
#[derive(Debug)]
pub struct NamespaceInfo {
    name: String,
    object_id: ObjectId,
    lock: AsyncMutex<()>,
    state: Mutex<NamespaceState>,
}

impl NamespaceInfo {
    fn new(name: &str, object_id: ObjectId, run_lock: RunId) -> Self {
        Self {
            name: name.to_string(),
            object_id,
            lock: AsyncMutex::new(()),
            state: Mutex::new(NamespaceState {
                run_lock,
                ..NamespaceState::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, NamespaceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Id of the persisted namespace object.
    #[must_use]
    pub const fn object_id(&self) -> &ObjectId {
        &self.object_id
    }

    /// Try to take the namespace mutex without waiting.
    pub(crate) fn try_lock(&self) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        self.lock.try_lock().ok()
    }

    pub(crate) async fn lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.lock.lock().await
    }

    /// The run owning the namespace as last written by this process.
    #[must_use]
    pub fn run_lock(&self) -> RunId {
        self.state().run_lock.clone()
    }

    pub(crate) fn set_run_lock(&self, run: RunId) {
        self.state().run_lock = run;
    }

    #[must_use]
    pub fn element(&self, id: &ElementId) -> Option<Arc<Element>> {
        self.state().elements.get(id).cloned()
    }

    /// Ids of all indexed elements, sorted.
    #[must_use]
    pub fn elements(&self) -> Vec<ElementId> {
        self.state().elements.keys().cloned().collect()
    }

    #[must_use]
    pub fn view(&self, id: &ElementId) -> Option<ElementView> {
        self.state().views.get(id).cloned()
    }

    /// Elements whose links reference `id`.
    #[must_use]
    pub fn children(&self, id: &ElementId) -> Vec<ElementId> {
        self.state()
            .children
            .get(id)
            .map(|children| children.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Elements locked for `run` that have not finished yet.
    #[must_use]
    pub fn pending(&self, run: &RunId) -> Vec<ElementId> {
        self.state()
            .pending
            .get(run)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn add_pending(&self, run: &RunId, ids: impl IntoIterator<Item = ElementId>) {
        self.state()
            .pending
            .entry(run.clone())
            .or_default()
            .extend(ids);
    }

    /// Remove a finished element from its run. Returns the number of
    /// elements still pending for the run.
    pub(crate) fn remove_pending(&self, run: &RunId, id: &ElementId) -> usize {
        let mut state = self.state();
        let Some(ids) = state.pending.get_mut(run) else {
            return 0;
        };
        ids.remove(id);
        let remaining = ids.len();
        if remaining == 0 {
            state.pending.remove(run);
        }
        remaining
    }

    pub(crate) fn drop_pending(&self, run: &RunId) {
        self.state().pending.remove(run);
    }

    /// Keep the elements of an update request run from being processed.
    pub(crate) fn hold(&self, run: &RunId) {
        self.state().held.insert(run.clone());
    }

    /// Returns whether the run was held.
    pub(crate) fn unhold(&self, run: &RunId) -> bool {
        self.state().held.remove(run)
    }

    #[must_use]
    pub fn is_held(&self, run: &RunId) -> bool {
        self.state().held.contains(run)
    }

    /// Everything a run started at `roots` has to lock: the roots, their
    /// children and the dependent phases of the same objects, transitively.
    #[must_use]
    pub fn closure(&self, roots: &[ElementId], metamodel: &MetaModel) -> Vec<ElementId> {
        let state = self.state();
        let mut seen = BTreeSet::new();
        let mut todo: VecDeque<ElementId> = roots.iter().cloned().collect();
        while let Some(id) = todo.pop_front() {
            if !state.elements.contains_key(&id) || !seen.insert(id.clone()) {
                continue;
            }
            if let Some(children) = state.children.get(&id) {
                todo.extend(children.iter().cloned());
            }
            todo.extend(
                metamodel
                    .dependent_type_phases(&id.type_id())
                    .into_iter()
                    .map(|phase| id.object().element(phase)),
            );
        }
        seen.into_iter().collect()
    }

    /// Index the phases of an internal object. Stale snapshots are ignored.
    pub(crate) fn index(&self, object: &dyn InternalObject, metamodel: &MetaModel) {
        let id = object.id();
        let generation = object.generation();
        let mut state = self.state();
        if state.generations.get(id).is_some_and(|known| *known > generation) {
            return;
        }
        state.generations.insert(id.clone(), generation);
        for phase in metamodel.phases(id.kind()).unwrap_or_default() {
            let element_id = id.element(phase.clone());
            let view = object
                .internal_state()
                .phase(phase)
                .map(ElementView::of)
                .unwrap_or_default();
            state
                .elements
                .entry(element_id.clone())
                .or_insert_with(|| Arc::new(Element::new(element_id.clone())));
            state.set_view(&element_id, view);
        }
    }

    /// Drop all elements of an internal object.
    pub(crate) fn remove_object(&self, id: &ObjectId) {
        let mut state = self.state();
        let ids: Vec<ElementId> = state
            .elements
            .keys()
            .filter(|element| element.object() == id)
            .cloned()
            .collect();
        for element in &ids {
            state.elements.remove(element);
            state.remove_view(element);
            for pending in state.pending.values_mut() {
                pending.remove(element);
            }
        }
        state.generations.remove(id);
    }
}

/// Result of rehydrating the model from the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadResult {
    /// Locked elements that must be processed again.
    pub elements: Vec<ElementId>,
    /// Locked namespaces that need lock maintenance.
    pub namespaces: Vec<String>,
}

/// The in-memory processing model of one metamodel over one store.
pub struct ProcessingModel {
    store: Arc<dyn Objectbase>,
    metamodel: Arc<MetaModel>,
    types: EngineTypes,
    finalizer: String,
    namespaces: RwLock<BTreeMap<String, Arc<NamespaceInfo>>>,
    creating: AsyncMutex<()>,
}

impl ProcessingModel {
    pub fn new(
        store: Arc<dyn Objectbase>,
        metamodel: Arc<MetaModel>,
        types: EngineTypes,
        finalizer: impl Into<String>,
    ) -> Self {
        Self {
            store,
            metamodel,
            types,
            finalizer: finalizer.into(),
            namespaces: RwLock::new(BTreeMap::new()),
            creating: AsyncMutex::new(()),
        }
    }

    #[must_use]
    pub fn store(&self) -> &dyn Objectbase {
        self.store.as_ref()
    }

    #[must_use]
    pub fn metamodel(&self) -> &MetaModel {
        &self.metamodel
    }

    #[must_use]
    pub const fn types(&self) -> &EngineTypes {
        &self.types
    }

    #[must_use]
    pub fn finalizer(&self) -> &str {
        &self.finalizer
    }

    #[must_use]
    pub fn namespace(&self, name: &str) -> Option<Arc<NamespaceInfo>> {
        self.namespaces
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Names of the known namespaces, sorted.
    #[must_use]
    pub fn namespaces(&self) -> Vec<String> {
        self.namespaces
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn element(&self, id: &ElementId) -> Option<Arc<Element>> {
        self.namespace(id.namespace())?.element(id)
    }

    #[must_use]
    pub fn view(&self, id: &ElementId) -> Option<ElementView> {
        self.namespace(id.namespace())?.view(id)
    }

    /// Classify links against the live views of all namespaces.
    #[must_use]
    pub fn classify(&self, links: &[ElementId]) -> Readiness {
        Readiness::classify(links, |link| self.view(link))
    }

    /// Fetch the namespace or, with `create`, create it.
    ///
    /// Returns `None` if it neither exists nor may be created.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub async fn assure_namespace(
        &self,
        name: &str,
        create: bool,
    ) -> Result<Option<Arc<NamespaceInfo>>> {
        if let Some(namespace) = self.namespace(name) {
            return Ok(Some(namespace));
        }
        let _creating = self.creating.lock().await;
        if let Some(namespace) = self.namespace(name) {
            return Ok(Some(namespace));
        }

        let id = namespace_object_id(self.metamodel.namespace_type(), name);
        let object = match self.store.get_object(&id).await {
            Ok(object) => downcast::<Namespace>(object)?,
            Err(e) if e.is_not_found() && create => {
                let mut object = downcast::<Namespace>(self.store.scheme().create(&id)?)?;
                self.store.set_object(&mut *object).await?;
                info!(namespace = name, "Created namespace");
                object
            }
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };

        let namespace = Arc::new(NamespaceInfo::new(name, id, object.run_lock.clone()));
        self.namespaces
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), Arc::clone(&namespace));
        Ok(Some(namespace))
    }

    /// Read an internal object.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` or the store's error.
    pub async fn get_internal(&self, id: &ObjectId) -> Result<Box<dyn InternalObject>> {
        self.types.to_internal(self.store.get_object(id).await?)
    }

    /// Read an external object, `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns store errors other than `NotFound`.
    pub async fn get_external(&self, id: &ObjectId) -> Result<Option<Box<dyn ExternalObject>>> {
        match self.store.get_object(id).await {
            Ok(object) => self.types.to_external(object).map(Some),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// States of the live external objects bound to an internal object.
    /// Objects marked for deletion count as absent.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub async fn external_states(&self, object: &ObjectId) -> Result<ExternalStates> {
        let mut states = ExternalStates {
            object: object.clone(),
            states: BTreeMap::new(),
        };
        let kinds: Vec<String> = self
            .metamodel
            .external_types_for(object.kind())
            .into_iter()
            .map(|external| external.name().to_string())
            .collect();
        for kind in kinds {
            let id = object.with_kind(kind.clone());
            let Some(external) = self.get_external(&id).await? else {
                continue;
            };
            if external.meta().deletion_requested {
                continue;
            }
            states.states.insert(kind, external.external_state()?);
        }
        Ok(states)
    }

    /// Make sure the internal object triggered by an external object exists
    /// and return the element of its trigger phase.
    ///
    /// Returns `None` for objects of types that trigger nothing.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub async fn assure_element_object_for(
        &self,
        external: &ObjectId,
    ) -> Result<Option<Arc<Element>>> {
        let Some(trigger) = self.metamodel.trigger_for(external.kind()).cloned() else {
            return Ok(None);
        };
        let Some(namespace) = self.assure_namespace(external.namespace(), true).await? else {
            return Ok(None);
        };
        let id = external.with_kind(trigger.kind());
        let element_id = id.element(trigger.phase().clone());
        if let Some(element) = namespace.element(&element_id) {
            return Ok(Some(element));
        }

        let object = match self.get_internal(&id).await {
            Ok(object) => object,
            Err(e) if e.is_not_found() => self.create_internal(&id).await?,
            Err(e) => return Err(e),
        };
        namespace.index(object.as_ref(), &self.metamodel);
        Ok(namespace.element(&element_id))
    }

    async fn create_internal(&self, id: &ObjectId) -> Result<Box<dyn InternalObject>> {
        let mut object = self.types.create_internal(id)?;
        for phase in self.metamodel.phases(id.kind()).unwrap_or_default() {
            object.internal_state_mut().phase_mut(phase);
        }
        object.meta_mut().add_finalizer(&self.finalizer);
        match self.store.set_object(object.as_object_mut()).await {
            Ok(()) => {
                info!(object = %id, "Created internal object");
                Ok(object)
            }
            // created concurrently for another external type
            Err(e) if e.is_modified() => self.get_internal(id).await,
            Err(e) => Err(e),
        }
    }

    /// Update the views of an internal object after a write.
    pub fn refresh(&self, object: &dyn InternalObject) {
        if let Some(namespace) = self.namespace(object.id().namespace()) {
            namespace.index(object, &self.metamodel);
        }
    }

    /// Remove an internal object from the index.
    pub fn forget(&self, id: &ObjectId) {
        if let Some(namespace) = self.namespace(id.namespace()) {
            namespace.remove_object(id);
            debug!(object = %id, "Removed internal object from index");
        }
    }

    /// Rebuild namespaces, elements, children index, pending runs and held
    /// update request runs from the store.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub async fn load(&self) -> Result<LoadResult> {
        let mut result = LoadResult::default();

        let namespace_type = self.metamodel.namespace_type().to_string();
        for id in self.store.list_objects(&namespace_type, true, "").await? {
            let name = if id.namespace().is_empty() {
                id.name().to_string()
            } else {
                format!("{}/{}", id.namespace(), id.name())
            };
            self.assure_namespace(&name, false).await?;
        }

        let internal_types: Vec<String> =
            self.metamodel.internal_types().map(str::to_string).collect();
        for kind in internal_types {
            for id in self.store.list_objects(&kind, true, "").await? {
                let object = match self.get_internal(&id).await {
                    Ok(object) => object,
                    Err(e) if e.is_not_found() => continue,
                    Err(e) => return Err(e),
                };
                let Some(namespace) = self.assure_namespace(id.namespace(), true).await? else {
                    continue;
                };
                namespace.index(object.as_ref(), &self.metamodel);
                let run_lock = namespace.run_lock();
                for (phase, state) in &object.internal_state().phases {
                    if !state.is_locked() {
                        continue;
                    }
                    let element = id.element(phase.clone());
                    if state.lock == run_lock {
                        namespace.add_pending(&state.lock, [element.clone()]);
                    }
                    result.elements.push(element);
                }
            }
        }

        if let Some(kind) = self.metamodel.update_request_type().map(str::to_string) {
            for id in self.store.list_objects(&kind, true, "").await? {
                let request = match self.store.get_object(&id).await {
                    Ok(object) => downcast::<UpdateRequest>(object)?,
                    Err(e) if e.is_not_found() => continue,
                    Err(e) => return Err(e),
                };
                if let Some(run) = request.held_run() {
                    if let Some(namespace) = self.namespace(id.namespace()) {
                        if namespace.run_lock() == *run {
                            namespace.hold(run);
                        }
                    }
                }
            }
        }

        for name in self.namespaces() {
            if self
                .namespace(&name)
                .is_some_and(|namespace| !namespace.run_lock().is_none())
            {
                result.namespaces.push(name);
            }
        }
        info!(
            namespaces = self.namespaces().len(),
            locked_elements = result.elements.len(),
            "Loaded processing model"
        );
        Ok(result)
    }

    /// Swap the persisted run lock of a namespace from `expected` to `next`.
    ///
    /// Returns whether the namespace now carries `next`.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub(crate) async fn swap_run_lock(
        &self,
        namespace: &NamespaceInfo,
        expected: &RunId,
        next: &RunId,
    ) -> Result<bool> {
        let mut object = match self.store.get_object(namespace.object_id()).await {
            Ok(object) => downcast::<Namespace>(object)?,
            Err(e) if e.is_not_found() && next.is_none() => {
                namespace.set_run_lock(RunId::none());
                return Ok(true);
            }
            Err(e) => return Err(e),
        };
        let swapped = modify(self.store.as_ref(), &mut *object, |ns: &mut Namespace| {
            if ns.run_lock == *next {
                return (false, true);
            }
            if ns.run_lock != *expected {
                return (false, false);
            }
            ns.run_lock = next.clone();
            (true, true)
        })
        .await?;
        namespace.set_run_lock(object.run_lock.clone());
        Ok(swapped)
    }
}
