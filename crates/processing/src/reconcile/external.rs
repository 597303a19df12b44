//! Reaction to changes of external objects.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use drover_core::{Error, ObjectId, Result, RunId};
use drover_pool::{Action, Pool, Status};

use crate::context::Context;
use crate::keys::{Key, element_key};
use crate::status::{ProcessingStatus, TriggerDecision, retrigger_decision};
use crate::version::observed_version;

pub(crate) struct ExternalReconciler {
    ctx: Arc<Context>,
}

impl ExternalReconciler {
    pub(crate) const fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Action for ExternalReconciler {
    async fn reconcile(&self, pool: &Pool, key: &str) -> Status {
        let id = match Key::parse(key) {
            Ok(Key::Object(id)) => id,
            Ok(_) => return Status::failed(Error::invalid_key(key, "expected object key")),
            Err(e) => return Status::failed(e),
        };
        super::into_status(self.run(pool, &id).await)
    }
}

impl ExternalReconciler {
    async fn run(&self, pool: &Pool, id: &ObjectId) -> Result<Status> {
        let model = &self.ctx.model;
        let metamodel = model.metamodel();
        let Some(trigger) = metamodel.trigger_for(id.kind()).cloned() else {
            debug!(object = %id, "Object of a type triggering nothing");
            return Ok(Status::done());
        };
        let foreign = metamodel
            .external_type(id.kind())
            .is_some_and(|external| external.is_foreign_controlled());

        let external = match model.store().get_object(id).await {
            Ok(object) => Some(object),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        let deleting = external
            .as_ref()
            .is_none_or(|object| object.meta().deletion_requested);
        if let Some(mut object) = external {
            if !deleting {
                self.ctx.ensure_finalizer(&mut object).await?;
            }
        }

        let element_id = id.with_kind(trigger.kind()).element(trigger.phase().clone());
        let element = if deleting {
            model.element(&element_id)
        } else {
            model.assure_element_object_for(id).await?
        };
        let Some(element) = element else {
            if deleting {
                // nothing was ever built from it
                self.ctx.remove_finalizer(id).await?;
            }
            return Ok(Status::done());
        };
        let _claim = element.try_claim()?;

        let internal_id = element_id.object().clone();
        let object = match model.get_internal(&internal_id).await {
            Ok(object) => object,
            Err(e) if e.is_not_found() => {
                model.forget(&internal_id);
                if deleting {
                    self.ctx.remove_finalizer(id).await?;
                }
                return Ok(Status::done());
            }
            Err(e) => return Err(e),
        };
        model.refresh(object.as_ref());
        let state = object
            .internal_state()
            .phase(element_id.phase())
            .cloned()
            .unwrap_or_default();

        let externals = model.external_states(&internal_id).await?;
        let observed = observed_version(&externals.states);
        let changed = state.observed_baseline() != observed
            || (externals.is_empty() && state.status != ProcessingStatus::Deleted);

        match retrigger_decision(state.is_locked(), state.status, foreign, changed) {
            TriggerDecision::Ignore => {
                debug!(object = %id, "External state unchanged");
                if deleting {
                    self.ctx.remove_finalizer(id).await?;
                }
                Ok(Status::done())
            }
            TriggerDecision::StartRun => {
                let Some(namespace) = model.namespace(element_id.namespace()) else {
                    return Ok(Status::retry_later(Error::temporary(format!(
                        "namespace of {id} not loaded"
                    ))));
                };
                // a deletion takes down every phase of the object
                let roots: Vec<_> = if externals.is_empty() {
                    metamodel
                        .phases(internal_id.kind())
                        .unwrap_or_default()
                        .iter()
                        .map(|phase| internal_id.element(phase.clone()))
                        .collect()
                } else {
                    vec![element_id.clone()]
                };
                let run = RunId::generate();
                match self.ctx.lock_graph(pool, &namespace, &roots, &run).await? {
                    Ok(locked) => {
                        info!(object = %id, run = %run, elements = locked.len(), "Started run");
                        for locked in &locked {
                            pool.enqueue_raw(&element_key(locked));
                        }
                        Ok(Status::done())
                    }
                    Err(refusal) => {
                        debug!(object = %id, refusal = ?refusal, "Run deferred");
                        Ok(Status::retry_later(refusal.into_error(namespace.name())))
                    }
                }
            }
            TriggerDecision::RetriggerInPlace { reset } => {
                if reset {
                    let mut object = object;
                    let run = state.lock.clone();
                    self.ctx
                        .update_phase(&mut object, &element_id, &run, |s| {
                            s.status = ProcessingStatus::Preparing;
                            s.target = None;
                        })
                        .await?;
                    info!(object = %id, run = %run, "Foreign change restarts processing");
                }
                pool.enqueue_raw(&element_key(&element_id));
                Ok(Status::done())
            }
            TriggerDecision::Defer => Ok(Status::retry_later(Error::locked(
                &element_id,
                &state.lock,
            ))),
        }
    }
}
