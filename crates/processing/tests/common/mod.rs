//! Fixture shared by the processing behaviour suites.
//!
//! - `Source` objects publish a number (`SourceState:publish`)
//! - `Total` objects sum the outputs of the sources they name (`TotalState:sum`)
//! - `Probe` objects are foreign controlled and wait until `ready` is set
//!   (`ProbeState:observe`)

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, dead_code)]

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use drover_core::{ElementId, Error, ObjectId, Phase, Result, TypeId};
use drover_metamodel::{ExternalTypeSpec, InternalTypeSpec, MetaModel, MetaModelSpec};
use drover_objectbase::{
    DynObject, EventHandler, Filter, HandlerId, InMemoryObjectbase, Object, ObjectMeta, Objectbase,
    Scheme, get_typed, modify,
};
use drover_processing::{
    Acceptance, EngineConfig, EngineTypes, ExternalObject, ExternalStates, ExternalStatus,
    InternalObject, InternalState, PhaseState, ProcessRequest, ProcessResult, ProcessingStatus,
    Processor, TargetSpec, UpdateRequest,
};

pub const NAMESPACE: &str = "Namespace";
pub const UPDATE_REQUEST: &str = "UpdateRequest";
pub const SOURCE: &str = "Source";
pub const SOURCE_STATE: &str = "SourceState";
pub const PUBLISH: &str = "publish";
pub const TOTAL: &str = "Total";
pub const TOTAL_STATE: &str = "TotalState";
pub const SUM: &str = "sum";
pub const PROBE: &str = "Probe";
pub const PROBE_STATE: &str = "ProbeState";
pub const OBSERVE: &str = "observe";

pub const TIMEOUT: Duration = Duration::from_secs(10);

static CALLS: LazyLock<Mutex<BTreeMap<ElementId, usize>>> =
    LazyLock::new(|| Mutex::new(BTreeMap::new()));

fn record_call(id: &ElementId) {
    *CALLS.lock().unwrap().entry(id.clone()).or_default() += 1;
}

/// How often processing was invoked for an element.
pub fn calls(id: &ElementId) -> usize {
    CALLS.lock().unwrap().get(id).copied().unwrap_or_default()
}

macro_rules! object {
    ($name:ty) => {
        impl Object for $name {
            fn meta(&self) -> &ObjectMeta {
                &self.meta
            }

            fn meta_mut(&mut self) -> &mut ObjectMeta {
                &mut self.meta
            }
        }
    };
}

/// An external object whose whole spec is its external state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct External<S> {
    pub meta: ObjectMeta,
    pub spec: S,
    pub status: ExternalStatus,
}

impl<S> Object for External<S>
where
    S: Debug + Clone + Send + Sync + 'static,
{
    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }
}

impl<S> ExternalObject for External<S>
where
    S: Serialize + Debug + Clone + Send + Sync + 'static,
{
    fn external_state(&self) -> Result<Value> {
        serde_json::to_value(&self.spec)
            .map_err(|e| drover_core::Error::serialization(e.to_string()))
    }

    fn external_status(&self) -> &ExternalStatus {
        &self.status
    }

    fn external_status_mut(&mut self) -> &mut ExternalStatus {
        &mut self.status
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub value: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TotalSpec {
    pub sources: Vec<String>,
    #[serde(default)]
    pub fail: bool,
    #[serde(default)]
    pub invalid: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeSpec {
    pub ready: bool,
}

pub type Source = External<SourceSpec>;
pub type Total = External<TotalSpec>;
pub type Probe = External<ProbeSpec>;

fn spec_of<S: DeserializeOwned>(externals: &ExternalStates, kind: &str) -> Option<S> {
    externals
        .get(kind)
        .and_then(|state| serde_json::from_value(state.clone()).ok())
}

#[derive(Debug, Clone, Default)]
pub struct SourceState {
    pub meta: ObjectMeta,
    pub state: InternalState,
}

object!(SourceState);

#[async_trait]
impl InternalObject for SourceState {
    fn internal_state(&self) -> &InternalState {
        &self.state
    }

    fn internal_state_mut(&mut self) -> &mut InternalState {
        &mut self.state
    }

    fn accept_external_state(&self, _phase: &Phase, externals: &ExternalStates) -> Acceptance {
        match externals.get(SOURCE) {
            Some(state) => Acceptance::Accepted(TargetSpec::new(state.clone())),
            None => Acceptance::Invalid("no source".to_string()),
        }
    }

    async fn process(&self, request: ProcessRequest) -> ProcessResult {
        record_call(&request.element);
        if request.deleting {
            return ProcessResult::Deleted;
        }
        match serde_json::from_value::<SourceSpec>(request.spec) {
            Ok(spec) => ProcessResult::Completed(json!(spec.value)),
            Err(e) => ProcessResult::Invalid(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TotalState {
    pub meta: ObjectMeta,
    pub state: InternalState,
}

object!(TotalState);

#[async_trait]
impl InternalObject for TotalState {
    fn internal_state(&self) -> &InternalState {
        &self.state
    }

    fn internal_state_mut(&mut self) -> &mut InternalState {
        &mut self.state
    }

    fn accept_external_state(&self, _phase: &Phase, externals: &ExternalStates) -> Acceptance {
        let Some(spec) = spec_of::<TotalSpec>(externals, TOTAL) else {
            return Acceptance::Invalid("no total".to_string());
        };
        if spec.invalid {
            return Acceptance::Invalid("rejected by spec".to_string());
        }
        let namespace = externals.object.namespace();
        let links = spec
            .sources
            .iter()
            .map(|name| ElementId::of(SOURCE_STATE, namespace, name, PUBLISH));
        Acceptance::Accepted(TargetSpec::new(json!(spec)).with_links(links))
    }

    async fn process(&self, request: ProcessRequest) -> ProcessResult {
        record_call(&request.element);
        if request.deleting {
            return ProcessResult::Deleted;
        }
        let spec: TotalSpec = serde_json::from_value(request.spec).unwrap_or_default();
        if spec.fail {
            return ProcessResult::Failed("asked to fail".to_string());
        }
        let sum: i64 = request.inputs.values().filter_map(Value::as_i64).sum();
        ProcessResult::Completed(json!(sum))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProbeState {
    pub meta: ObjectMeta,
    pub state: InternalState,
}

object!(ProbeState);

#[async_trait]
impl InternalObject for ProbeState {
    fn internal_state(&self) -> &InternalState {
        &self.state
    }

    fn internal_state_mut(&mut self) -> &mut InternalState {
        &mut self.state
    }

    fn accept_external_state(&self, _phase: &Phase, externals: &ExternalStates) -> Acceptance {
        match externals.get(PROBE) {
            Some(state) => Acceptance::Accepted(TargetSpec::new(state.clone())),
            None => Acceptance::Invalid("no probe".to_string()),
        }
    }

    async fn process(&self, request: ProcessRequest) -> ProcessResult {
        record_call(&request.element);
        if request.deleting {
            return ProcessResult::Deleted;
        }
        let spec: ProbeSpec = serde_json::from_value(request.spec).unwrap_or_default();
        if spec.ready {
            ProcessResult::Completed(json!("ready"))
        } else {
            ProcessResult::Waiting(Duration::from_millis(20))
        }
    }
}

pub fn engine_types() -> EngineTypes {
    EngineTypes::new()
        .with_namespace(NAMESPACE)
        .with_update_request(UPDATE_REQUEST)
        .with_internal::<SourceState>(SOURCE_STATE)
        .with_internal::<TotalState>(TOTAL_STATE)
        .with_internal::<ProbeState>(PROBE_STATE)
        .with_external::<Source>(SOURCE)
        .with_external::<Total>(TOTAL)
        .with_external::<Probe>(PROBE)
}

pub fn new_store() -> Arc<InMemoryObjectbase> {
    InMemoryObjectbase::new_arc(engine_types().scheme().clone())
}

pub fn metamodel_spec() -> MetaModelSpec {
    MetaModelSpec::new(NAMESPACE)
        .with_update_request_type(UPDATE_REQUEST)
        .with_internal(InternalTypeSpec::new(SOURCE_STATE).phase(PUBLISH, []))
        .with_internal(
            InternalTypeSpec::new(TOTAL_STATE).phase(SUM, [TypeId::new(SOURCE_STATE, PUBLISH)]),
        )
        .with_internal(InternalTypeSpec::new(PROBE_STATE).phase(OBSERVE, []))
        .with_external(ExternalTypeSpec::new(SOURCE, TypeId::new(SOURCE_STATE, PUBLISH)))
        .with_external(ExternalTypeSpec::new(TOTAL, TypeId::new(TOTAL_STATE, SUM)))
        .with_external(
            ExternalTypeSpec::new(PROBE, TypeId::new(PROBE_STATE, OBSERVE)).foreign_controlled(),
        )
}

pub fn source(ns: &str, name: &str) -> ElementId {
    ElementId::of(SOURCE_STATE, ns, name, PUBLISH)
}

pub fn total(ns: &str, name: &str) -> ElementId {
    ElementId::of(TOTAL_STATE, ns, name, SUM)
}

pub fn probe(ns: &str, name: &str) -> ElementId {
    ElementId::of(PROBE_STATE, ns, name, OBSERVE)
}

pub fn settled(state: &PhaseState) -> bool {
    !state.is_locked() && state.status.is_final()
}

type WriteMatcher = Box<dyn Fn(&dyn Object) -> bool + Send + Sync>;

/// Store the processor works on. Writes matching an armed fault fail once
/// with a temporary error and store nothing.
pub struct FaultyObjectbase {
    inner: Arc<InMemoryObjectbase>,
    faults: Mutex<Vec<WriteMatcher>>,
    failed: Mutex<Vec<ObjectId>>,
}

impl FaultyObjectbase {
    pub fn new(inner: Arc<InMemoryObjectbase>) -> Self {
        Self {
            inner,
            faults: Mutex::new(Vec::new()),
            failed: Mutex::new(Vec::new()),
        }
    }

    /// Fail the next write of a `T` accepted by `matches`.
    pub fn fail_next_write<T, F>(&self, matches: F)
    where
        T: Object,
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.faults.lock().unwrap().push(Box::new(move |object: &dyn Object| {
            object.as_any().downcast_ref::<T>().is_some_and(&matches)
        }));
    }

    /// Ids of the writes that were failed so far.
    pub fn failed_writes(&self) -> Vec<ObjectId> {
        self.failed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Objectbase for FaultyObjectbase {
    fn scheme(&self) -> &Scheme {
        self.inner.scheme()
    }

    async fn get_object(&self, id: &ObjectId) -> Result<Box<dyn Object>> {
        self.inner.get_object(id).await
    }

    async fn set_object(&self, object: &mut dyn Object) -> Result<()> {
        let hit = {
            let mut faults = self.faults.lock().unwrap();
            let position = faults.iter().position(|matches| matches(&*object));
            position.map(|position| faults.remove(position))
        };
        if hit.is_some() {
            self.failed.lock().unwrap().push(object.id().clone());
            return Err(Error::temporary(format!("injected write failure for {}", object.id())));
        }
        self.inner.set_object(object).await
    }

    async fn list_objects(
        &self,
        kind: &str,
        closure: bool,
        namespace: &str,
    ) -> Result<Vec<ObjectId>> {
        self.inner.list_objects(kind, closure, namespace).await
    }

    async fn delete_object(&self, id: &ObjectId) -> Result<bool> {
        self.inner.delete_object(id).await
    }

    async fn register_handler(
        &self,
        handler: Arc<dyn EventHandler>,
        replay: bool,
        filter: Filter,
    ) -> Result<HandlerId> {
        self.inner.register_handler(handler, replay, filter).await
    }

    async fn unregister_handler(&self, id: HandlerId) -> Result<()> {
        self.inner.unregister_handler(id).await
    }
}

pub struct Harness {
    /// The backing store; writes made here bypass armed faults.
    pub store: Arc<InMemoryObjectbase>,
    pub faults: Arc<FaultyObjectbase>,
    pub processor: Processor,
}

impl Harness {
    pub async fn start() -> Self {
        Self::start_on(new_store()).await
    }

    /// Start a processor over a store that may already hold objects.
    pub async fn start_on(store: Arc<InMemoryObjectbase>) -> Self {
        let types = engine_types();
        let metamodel =
            Arc::new(MetaModel::new("behaviour", &metamodel_spec(), types.scheme()).unwrap());
        let config = EngineConfig::default()
            .workers(4)
            .backoff(5, 50)
            .tick_interval_ms(50);
        let faults = Arc::new(FaultyObjectbase::new(Arc::clone(&store)));
        let processor = Processor::new(
            Arc::clone(&faults) as Arc<dyn Objectbase>,
            metamodel,
            types,
            config,
        )
        .unwrap();
        processor.start().await.unwrap();
        Self {
            store,
            faults,
            processor,
        }
    }

    /// Poll until the run lock of namespace `ns` is released.
    pub async fn wait_namespace_released(&self, ns: &str) {
        let namespace = self.processor.model().namespace(ns).unwrap();
        let deadline = tokio::time::Instant::now() + TIMEOUT;
        while !namespace.run_lock().is_none() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "namespace {ns} still locked by {}",
                namespace.run_lock()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Create or change an object through `edit`.
    pub async fn put<T, F>(&self, id: ObjectId, mut edit: F)
    where
        T: Object + Clone + Default,
        F: FnMut(&mut T) + Send,
    {
        match get_typed::<T>(self.store.as_ref(), &id).await {
            Ok(mut object) => {
                modify(self.store.as_ref(), object.as_mut(), |o: &mut T| {
                    edit(o);
                    (true, ())
                })
                .await
                .unwrap();
            }
            Err(e) if e.is_not_found() => {
                let mut object = T::default();
                *object.meta_mut() = ObjectMeta::new(id);
                edit(&mut object);
                self.store.set_object(&mut object).await.unwrap();
            }
            Err(e) => panic!("reading {id} failed: {e}"),
        }
    }

    pub async fn put_source(&self, ns: &str, name: &str, value: i64) {
        self.put::<Source, _>(ObjectId::new(SOURCE, ns, name), |s| {
            s.spec = SourceSpec { value };
        })
        .await;
    }

    pub async fn put_total(&self, ns: &str, name: &str, spec: TotalSpec) {
        self.put::<Total, _>(ObjectId::new(TOTAL, ns, name), |t| {
            t.spec = spec.clone();
        })
        .await;
    }

    pub async fn put_request(&self, ns: &str, name: &str, mut edit: impl FnMut(&mut UpdateRequest) + Send) {
        self.put::<UpdateRequest, _>(ObjectId::new(UPDATE_REQUEST, ns, name), |r| edit(r))
            .await;
    }

    pub async fn wait(&self, id: &ElementId, predicate: impl Fn(&PhaseState) -> bool) -> PhaseState {
        self.processor
            .wait_for_element(id, predicate, TIMEOUT)
            .await
            .unwrap_or_else(|e| panic!("waiting for {id}: {e}"))
    }

    pub async fn wait_settled(&self, id: &ElementId) -> PhaseState {
        self.wait(id, settled).await
    }

    pub async fn wait_output(&self, id: &ElementId, output: Value) -> PhaseState {
        self.wait(id, |s| settled(s) && s.current.output == output).await
    }

    pub async fn wait_status(&self, id: &ElementId, status: ProcessingStatus) -> PhaseState {
        self.wait(id, |s| s.status == status).await
    }

    /// Poll until `id` is gone from the store.
    pub async fn wait_removed(&self, id: &ObjectId) {
        let deadline = tokio::time::Instant::now() + TIMEOUT;
        loop {
            match self.store.get_object(id).await {
                Err(e) if e.is_not_found() => return,
                _ if tokio::time::Instant::now() > deadline => panic!("{id} still stored"),
                _ => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
    }

    pub async fn external_status<T>(&self, id: &ObjectId) -> ExternalStatus
    where
        T: ExternalObject + Clone,
    {
        get_typed::<T>(self.store.as_ref(), id)
            .await
            .unwrap()
            .external_status()
            .clone()
    }

    /// Poll the engine managed status of an external object until it matches.
    pub async fn wait_external_status<T>(
        &self,
        id: &ObjectId,
        predicate: impl Fn(&ExternalStatus) -> bool,
    ) -> ExternalStatus
    where
        T: ExternalObject + Clone,
    {
        let deadline = tokio::time::Instant::now() + TIMEOUT;
        loop {
            let status = self.external_status::<T>(id).await;
            if predicate(&status) {
                return status;
            }
            assert!(tokio::time::Instant::now() < deadline, "{id} status stuck at {status:?}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn request(&self, ns: &str, name: &str) -> UpdateRequest {
        *get_typed::<UpdateRequest>(self.store.as_ref(), &ObjectId::new(UPDATE_REQUEST, ns, name))
            .await
            .unwrap()
    }

    pub async fn stop(self) {
        self.processor.shutdown().await;
    }
}
