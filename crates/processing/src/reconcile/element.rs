//! The per-element state machine of a run.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use drover_core::{ElementId, Error, Result, RunId};
use drover_pool::{Action, Pool, Status};

use crate::context::Context;
use crate::keys::{Key, element_key, namespace_command};
use crate::model::{Element, NamespaceInfo};
use crate::objects::{
    Acceptance, CommitInfo, CurrentState, InternalObject, PhaseState, ProcessRequest,
    ProcessResult, TargetState,
};
use crate::readiness::Readiness;
use crate::status::ProcessingStatus;
use crate::version::{effective_version, object_version, observed_version, output_version};

/// How a step of the state machine left the element.
enum Outcome {
    /// The run is over for this element.
    Finished,
    /// Links are still owned by a run.
    Waiting(Error),
    /// Processing asked to be called again later.
    After(Duration),
}

pub(crate) struct ElementReconciler {
    ctx: Arc<Context>,
}

impl ElementReconciler {
    pub(crate) const fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Action for ElementReconciler {
    async fn reconcile(&self, pool: &Pool, key: &str) -> Status {
        let id = match Key::parse(key) {
            Ok(Key::Element(id)) => id,
            Ok(_) => return Status::failed(Error::invalid_key(key, "expected element key")),
            Err(e) => return Status::failed(e),
        };
        super::into_status(self.run(pool, &id).await)
    }
}

impl ElementReconciler {
    async fn run(&self, pool: &Pool, id: &ElementId) -> Result<Status> {
        let Some(namespace) = self.ctx.model.namespace(id.namespace()) else {
            debug!(element = %id, "Element of unknown namespace");
            return Ok(Status::done());
        };
        let Some(element) = namespace.element(id) else {
            debug!(element = %id, "Element not indexed");
            return Ok(Status::done());
        };
        let _claim = element.try_claim()?;

        let mut object = match self.ctx.model.get_internal(id.object()).await {
            Ok(object) => object,
            Err(e) if e.is_not_found() => {
                self.ctx.model.forget(id.object());
                namespace.remove_pending(&namespace.run_lock(), id);
                self.ctx.settle_namespace(pool, &namespace);
                return Ok(Status::done());
            }
            Err(e) => return Err(e),
        };
        self.ctx.model.refresh(object.as_ref());
        let state = object
            .internal_state()
            .phase(id.phase())
            .cloned()
            .unwrap_or_default();
        if !state.is_locked() {
            self.ctx.settle_namespace(pool, &namespace);
            return Ok(Status::done());
        }
        let run = state.lock.clone();

        if namespace.run_lock() != run {
            self.clear_orphan(pool, &mut object, id, &state).await?;
            return Ok(Status::done());
        }
        if namespace.is_held(&run) {
            debug!(element = %id, run = %run, "Run held by update request");
            return Ok(Status::done());
        }

        match self.step(&mut object, &element, id, &run, state).await {
            Ok(Outcome::Finished) => {
                self.finish(pool, &namespace, &element, id, &run).await?;
                Ok(Status::done())
            }
            Ok(Outcome::Waiting(reason)) => Ok(Status::retry_later(reason)),
            Ok(Outcome::After(delay)) => Ok(Status::done_after(delay)),
            Err(e) => {
                element.clear_processing();
                Err(e)
            }
        }
    }

    /// Advance the element as far as possible within one call.
    async fn step(
        &self,
        object: &mut Box<dyn InternalObject>,
        element: &Element,
        id: &ElementId,
        run: &RunId,
        mut state: PhaseState,
    ) -> Result<Outcome> {
        if !state.status.is_processable() {
            match self.prepare(object, id, run, &state).await? {
                Some(prepared) => state = prepared,
                None => return Ok(Outcome::Finished),
            }
        }
        let Some(target) = state.target.clone() else {
            // processable without a target: accept the external state again
            self.ctx
                .update_phase(object, id, run, |s| s.status = ProcessingStatus::Preparing)
                .await?;
            return Ok(Outcome::Waiting(Error::temporary(format!(
                "{id} has no target state"
            ))));
        };

        let mut readiness = Readiness::default();
        if !target.deleting {
            readiness = self.ctx.model.classify(&target.links);
            if !readiness.missing.is_empty() {
                let message = format!(
                    "missing dependencies: {}",
                    Readiness::describe(&readiness.missing)
                );
                self.rollback(object, id, run, ProcessingStatus::Blocked, message, readiness.missing)
                    .await?;
                return Ok(Outcome::Finished);
            }
            if !readiness.waiting.is_empty() {
                return Ok(Outcome::Waiting(Error::temporary(format!(
                    "{id} waits for {}",
                    Readiness::describe(&readiness.waiting)
                ))));
            }
            let input_version = readiness.input_version();
            if state.current.object_version == target.object_version
                && state.current.input_version == input_version
                && !state.current.output_version.is_empty()
            {
                debug!(element = %id, "Object and inputs unchanged, skipping processing");
                let commit = CommitInfo {
                    formal_version: readiness.formal_version(&target.object_version),
                    input_version,
                    object_version: target.object_version.clone(),
                    output: state.current.output.clone(),
                };
                self.commit(object, id, run, &target, commit).await?;
                return Ok(Outcome::Finished);
            }
        }

        let status = if target.deleting {
            ProcessingStatus::Deleting
        } else {
            ProcessingStatus::Processing
        };
        if state.status != status {
            self.ctx
                .update_phase(object, id, run, |s| {
                    s.status = status;
                    s.message.clear();
                })
                .await?;
        }
        let inputs = readiness.inputs();
        element.set_processing(run.clone(), inputs.clone());
        let request = ProcessRequest {
            element: id.clone(),
            run: run.clone(),
            spec: target.spec.clone(),
            inputs,
            deleting: target.deleting,
        };
        let result = object.process(request).await;
        debug!(element = %id, run = %run, result = ?result, "Processed element");

        match result {
            ProcessResult::Completed(_) | ProcessResult::Deleted if target.deleting => {
                self.delete_phase(object, id, run).await?;
            }
            ProcessResult::Completed(output) => {
                let commit = CommitInfo {
                    formal_version: readiness.formal_version(&target.object_version),
                    input_version: readiness.input_version(),
                    object_version: target.object_version.clone(),
                    output,
                };
                self.commit(object, id, run, &target, commit).await?;
            }
            ProcessResult::Deleted => self.delete_phase(object, id, run).await?,
            ProcessResult::Failed(message) => {
                self.rollback(object, id, run, ProcessingStatus::Failed, message, Vec::new())
                    .await?;
            }
            ProcessResult::Invalid(message) => {
                self.rollback(object, id, run, ProcessingStatus::Invalid, message, Vec::new())
                    .await?;
            }
            ProcessResult::Waiting(delay) => {
                self.ctx
                    .update_phase(object, id, run, |s| {
                        s.status = ProcessingStatus::Waiting;
                        s.message = format!("waiting {}ms", delay.as_millis());
                    })
                    .await?;
                return Ok(Outcome::After(delay));
            }
        }
        Ok(Outcome::Finished)
    }

    /// Move the external state into the target state.
    ///
    /// Returns `None` if the run ended during preparation.
    async fn prepare(
        &self,
        object: &mut Box<dyn InternalObject>,
        id: &ElementId,
        run: &RunId,
        state: &PhaseState,
    ) -> Result<Option<PhaseState>> {
        let externals = self.ctx.model.external_states(id.object()).await?;
        let observed = observed_version(&externals.states);

        if externals.is_empty() {
            let target = TargetState {
                observed_version: observed,
                deleting: true,
                ..TargetState::default()
            };
            let prepared = self
                .ctx
                .update_phase(object, id, run, |s| {
                    s.last_observed_version.clone_from(&target.observed_version);
                    s.target = Some(target.clone());
                    s.status = ProcessingStatus::Deleting;
                    s.message.clear();
                })
                .await?;
            return Ok(Some(prepared));
        }

        if state.status == ProcessingStatus::Pending
            && !state.current.output_version.is_empty()
            && state.current.observed_version == observed
        {
            let readiness = self.ctx.model.classify(&state.current.links);
            if readiness.is_ready() && readiness.input_version() == state.current.input_version {
                debug!(element = %id, "Current state still satisfied");
                self.ctx
                    .update_phase(object, id, run, |s| {
                        s.lock = RunId::none();
                        s.target = None;
                        s.status = ProcessingStatus::Completed;
                        s.message.clear();
                        s.blocked_on.clear();
                        s.last_observed_version.clone_from(&observed);
                    })
                    .await?;
                return Ok(None);
            }
        }

        let spec = match object.accept_external_state(id.phase(), &externals) {
            Acceptance::Accepted(spec) => spec,
            Acceptance::Invalid(message) => {
                self.reject(object, id, run, &observed, message).await?;
                return Ok(None);
            }
        };
        let element_type = id.type_id();
        let declared = self
            .ctx
            .model
            .metamodel()
            .element_type(&element_type)
            .map(|t| t.dependencies().to_vec())
            .unwrap_or_default();
        if let Some(link) = spec
            .links
            .iter()
            .find(|link| !declared.contains(&link.type_id()))
        {
            let message = format!("link {link} is no declared dependency of {element_type}");
            self.reject(object, id, run, &observed, message).await?;
            return Ok(None);
        }

        let target = TargetState {
            links: spec.links,
            object_version: object_version(&spec.spec),
            spec: spec.spec,
            observed_version: observed,
            deleting: false,
        };
        let prepared = self
            .ctx
            .update_phase(object, id, run, |s| {
                s.last_observed_version.clone_from(&target.observed_version);
                s.target = Some(target.clone());
                s.status = ProcessingStatus::Preparing;
                s.message.clear();
            })
            .await?;
        Ok(Some(prepared))
    }

    /// Write the commit snapshot and release the element.
    async fn commit(
        &self,
        object: &mut Box<dyn InternalObject>,
        id: &ElementId,
        run: &RunId,
        target: &TargetState,
        commit: CommitInfo,
    ) -> Result<()> {
        let current = CurrentState {
            links: target.links.clone(),
            effective_version: effective_version(&commit.input_version, &commit.object_version),
            output_version: output_version(&commit.output),
            formal_version: commit.formal_version,
            input_version: commit.input_version,
            object_version: commit.object_version,
            observed_version: target.observed_version.clone(),
            output: commit.output,
        };
        self.ctx
            .update_phase(object, id, run, |s| {
                s.last_observed_version.clone_from(&current.observed_version);
                s.current = current.clone();
                s.target = None;
                s.lock = RunId::none();
                s.status = ProcessingStatus::Completed;
                s.message.clear();
                s.blocked_on.clear();
            })
            .await?;
        info!(element = %id, run = %run, "Element completed");
        Ok(())
    }

    /// Release the element without touching its current state.
    async fn rollback(
        &self,
        object: &mut Box<dyn InternalObject>,
        id: &ElementId,
        run: &RunId,
        status: ProcessingStatus,
        message: String,
        blocked_on: Vec<ElementId>,
    ) -> Result<()> {
        self.ctx
            .update_phase(object, id, run, |s| {
                s.lock = RunId::none();
                s.target = None;
                s.status = status;
                s.message.clone_from(&message);
                s.blocked_on.clone_from(&blocked_on);
            })
            .await?;
        info!(element = %id, run = %run, status = %status, message = %message, "Element rolled back");
        Ok(())
    }

    /// End the run because the external state cannot be accepted.
    async fn reject(
        &self,
        object: &mut Box<dyn InternalObject>,
        id: &ElementId,
        run: &RunId,
        observed: &str,
        message: String,
    ) -> Result<()> {
        self.ctx
            .update_phase(object, id, run, |s| {
                s.lock = RunId::none();
                s.target = None;
                s.status = ProcessingStatus::Invalid;
                s.message.clone_from(&message);
                s.blocked_on.clear();
                observed.clone_into(&mut s.last_observed_version);
            })
            .await?;
        info!(element = %id, run = %run, message = %message, "External state rejected");
        Ok(())
    }

    /// Mark a phase deleted and remove the object once all phases are.
    async fn delete_phase(
        &self,
        object: &mut Box<dyn InternalObject>,
        id: &ElementId,
        run: &RunId,
    ) -> Result<()> {
        self.ctx
            .update_phase(object, id, run, |s| {
                s.lock = RunId::none();
                s.target = None;
                s.current = CurrentState::default();
                s.status = ProcessingStatus::Deleted;
                s.message.clear();
                s.blocked_on.clear();
            })
            .await?;
        info!(element = %id, run = %run, "Element deleted");

        let phases = self
            .ctx
            .model
            .metamodel()
            .phases(id.kind())
            .unwrap_or_default();
        if !object.internal_state().all_deleted(phases.iter()) {
            return Ok(());
        }
        let object_id = id.object().clone();
        self.ctx.remove_finalizer(&object_id).await?;
        match self.ctx.store().delete_object(&object_id).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        self.ctx.model.forget(&object_id);
        info!(object = %object_id, "Internal object deleted");
        Ok(())
    }

    /// Hand the run on: drop the element from its run, start its locked
    /// dependents and release the namespace once the run drained.
    async fn finish(
        &self,
        pool: &Pool,
        namespace: &NamespaceInfo,
        element: &Element,
        id: &ElementId,
        run: &RunId,
    ) -> Result<()> {
        element.clear_processing();
        namespace.remove_pending(run, id);

        let metamodel = self.ctx.model.metamodel();
        let mut dependents = namespace.children(id);
        dependents.extend(
            metamodel
                .dependent_type_phases(&id.type_id())
                .into_iter()
                .map(|phase| id.object().element(phase)),
        );
        for dependent in dependents {
            if namespace
                .view(&dependent)
                .is_some_and(|view| view.lock == *run)
            {
                pool.enqueue_raw(&element_key(&dependent));
            }
        }

        if let Err(e) = self.ctx.release_if_drained(namespace, run).await {
            // the element is unlocked now, lock maintenance retries the release
            warn!(namespace = namespace.name(), run = %run, error = %e, "Namespace release failed");
            pool.enqueue_command_rate_limited(&namespace_command(namespace.name()));
        }
        Ok(())
    }

    /// Clear a lock whose run no longer owns the namespace.
    async fn clear_orphan(
        &self,
        pool: &Pool,
        object: &mut Box<dyn InternalObject>,
        id: &ElementId,
        state: &PhaseState,
    ) -> Result<()> {
        let run = state.lock.clone();
        warn!(element = %id, run = %run, "Clearing orphaned lock");
        let status = if state.status == ProcessingStatus::Deleted {
            ProcessingStatus::Deleted
        } else if state.current.output_version.is_empty() {
            ProcessingStatus::Initial
        } else {
            ProcessingStatus::Completed
        };
        let message = format!("run {run} was aborted");
        self.ctx
            .update_phase(object, id, &run, |s| {
                s.lock = RunId::none();
                s.target = None;
                s.status = status;
                s.message.clone_from(&message);
                // the aborted run never committed what it observed
                s.last_observed_version = s.current.observed_version.clone();
            })
            .await?;
        if let Some(namespace) = self.ctx.model.namespace(id.namespace()) {
            namespace.remove_pending(&run, id);
        }
        // let the triggering objects start a new run
        for kind in self.ctx.model.metamodel().triggered_by(&id.type_id()) {
            pool.enqueue_key(&id.object().with_kind(kind.clone()));
        }
        Ok(())
    }
}

