//! The processing engine: wires the model, the reconcilers and the pool to
//! one objectbase.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info};

use drover_core::{ElementId, Error, ObjectId, Result, ResultExt};
use drover_metamodel::MetaModel;
use drover_objectbase::{EventHandler, Filter, HandlerId, Objectbase};
use drover_pool::{COMMAND_PREFIX, Matcher, OBJECT_PREFIX, Pool};

use crate::config::EngineConfig;
use crate::context::Context;
use crate::keys::{ELEMENT_PREFIX, NAMESPACE_COMMAND, element_key, namespace_command};
use crate::model::ProcessingModel;
use crate::objects::PhaseState;
use crate::reconcile::{
    ElementReconciler, ExternalReconciler, NamespaceReconciler, RequestReconciler,
};
use crate::types::EngineTypes;
use crate::watch::{WatchEvent, WatchFeed};

/// Reconciles the internal objects of one metamodel against the external
/// objects of one store.
pub struct Processor {
    ctx: Arc<Context>,
    pool: Pool,
    config: EngineConfig,
    handlers: Mutex<Vec<HandlerId>>,
}

impl Processor {
    /// Create an engine. Nothing runs before [`Processor::start`].
    ///
    /// # Errors
    ///
    /// Returns `Config` for invalid settings and `InvalidMetaModel` if the
    /// registered types do not cover the metamodel.
    pub fn new(
        store: Arc<dyn Objectbase>,
        metamodel: Arc<MetaModel>,
        types: EngineTypes,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        types.check(&metamodel)?;
        let pool = Pool::new(metamodel.name().to_string(), config.to_pool_config());
        let ctx = Arc::new(Context {
            model: ProcessingModel::new(store, metamodel, types, config.finalizer.clone()),
            watch: WatchFeed::new(config.watch_capacity),
        });
        Ok(Self {
            ctx,
            pool,
            config,
            handlers: Mutex::new(Vec::new()),
        })
    }

    /// Rehydrate the model, start the workers and subscribe to the store.
    ///
    /// # Errors
    ///
    /// Returns store errors from loading or handler registration.
    pub async fn start(&self) -> Result<()> {
        self.register_actions()?;

        let loaded = self.ctx.model.load().await?;
        self.pool.start();
        for id in &loaded.elements {
            self.pool.enqueue_raw(&element_key(id));
        }
        for namespace in &loaded.namespaces {
            self.pool.enqueue_command(&namespace_command(namespace));
        }

        let metamodel = self.ctx.model.metamodel();
        let mut kinds: Vec<String> = metamodel.external_types().map(str::to_string).collect();
        kinds.extend(metamodel.update_request_type().map(str::to_string));
        let mut handlers = self.handlers.lock().await;
        for kind in kinds {
            let pool = self.pool.clone();
            let handler: Arc<dyn EventHandler> = Arc::new(move |id: &ObjectId| pool.enqueue_key(id));
            let id = self
                .ctx
                .store()
                .register_handler(handler, true, Filter::new(kind.clone(), true, ""))
                .await?;
            debug!(kind = %kind, handler = %id, "Watching object type");
            handlers.push(id);
        }
        info!(
            metamodel = metamodel.name(),
            workers = self.config.workers,
            resumed = loaded.elements.len(),
            "Processor started"
        );
        Ok(())
    }

    fn register_actions(&self) -> Result<()> {
        let metamodel = self.ctx.model.metamodel();
        self.pool.add_action(
            Matcher::pattern(&format!("{ELEMENT_PREFIX}*"))?,
            Arc::new(ElementReconciler::new(Arc::clone(&self.ctx))),
        );
        self.pool.add_action(
            Matcher::pattern(&format!("{COMMAND_PREFIX}{NAMESPACE_COMMAND}:*"))?,
            Arc::new(NamespaceReconciler::new(Arc::clone(&self.ctx))),
        );
        for kind in metamodel.external_types() {
            self.pool.add_action(
                Matcher::pattern(&format!("{OBJECT_PREFIX}{kind}/*"))?,
                Arc::new(ExternalReconciler::new(Arc::clone(&self.ctx))),
            );
        }
        if let Some(kind) = metamodel.update_request_type() {
            self.pool.add_action(
                Matcher::pattern(&format!("{OBJECT_PREFIX}{kind}/*"))?,
                Arc::new(RequestReconciler::new(Arc::clone(&self.ctx))),
            );
        }
        Ok(())
    }

    /// Stop watching the store and drain the workers.
    pub async fn shutdown(&self) {
        let handlers: Vec<HandlerId> = self.handlers.lock().await.drain(..).collect();
        for id in handlers {
            self.ctx.store().unregister_handler(id).await.into_option_logged();
        }
        self.pool.shutdown();
        self.pool.wait().await;
        info!(metamodel = self.ctx.model.metamodel().name(), "Processor stopped");
    }

    /// Subscribe to element and namespace state changes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.ctx.watch.subscribe()
    }

    #[must_use]
    pub fn model(&self) -> &ProcessingModel {
        &self.ctx.model
    }

    #[must_use]
    pub fn metamodel(&self) -> &MetaModel {
        self.ctx.model.metamodel()
    }

    #[must_use]
    pub const fn pool(&self) -> &Pool {
        &self.pool
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The persisted state of an element. Unknown elements report the
    /// default state.
    ///
    /// # Errors
    ///
    /// Returns store errors other than `NotFound`.
    pub async fn element_state(&self, id: &ElementId) -> Result<PhaseState> {
        match self.ctx.model.get_internal(id.object()).await {
            Ok(object) => Ok(object
                .internal_state()
                .phase(id.phase())
                .cloned()
                .unwrap_or_default()),
            Err(e) if e.is_not_found() => Ok(PhaseState::default()),
            Err(e) => Err(e),
        }
    }

    /// Wait until the state of an element satisfies `predicate`.
    ///
    /// # Errors
    ///
    /// Returns `Temporary` on timeout and `ShuttingDown` if the watch feed
    /// closes.
    pub async fn wait_for_element<P>(
        &self,
        id: &ElementId,
        predicate: P,
        timeout: Duration,
    ) -> Result<PhaseState>
    where
        P: Fn(&PhaseState) -> bool,
    {
        let events = self.subscribe();
        tokio::time::timeout(timeout, self.watch_until(id, &predicate, events))
            .await
            .map_err(|_| Error::temporary(format!("timed out waiting for {id}")))?
    }

    async fn watch_until<P>(
        &self,
        id: &ElementId,
        predicate: &P,
        mut events: broadcast::Receiver<WatchEvent>,
    ) -> Result<PhaseState>
    where
        P: Fn(&PhaseState) -> bool,
    {
        loop {
            let state = self.element_state(id).await?;
            if predicate(&state) {
                return Ok(state);
            }
            loop {
                match events.recv().await {
                    Ok(event) if event.node.is_element(id) => break,
                    Ok(_) => {}
                    // missed events, read the state again
                    Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => return Err(Error::ShuttingDown),
                }
            }
        }
    }
}
