//! State shared by the reconcilers and the helpers writing element state.

use tracing::{debug, warn};

use drover_core::{ElementId, Error, ObjectId, Result, RunId};
use drover_objectbase::{Object, Objectbase, modify};

use crate::model::ProcessingModel;
use crate::objects::{ExternalStatus, InternalObject, PhaseState};
use crate::status::ProcessingStatus;
use crate::version::observed_version;
use crate::watch::{WatchEvent, WatchFeed};

pub(crate) struct Context {
    pub(crate) model: ProcessingModel,
    pub(crate) watch: WatchFeed,
}

impl Context {
    pub(crate) fn store(&self) -> &dyn Objectbase {
        self.model.store()
    }

    /// Change the state of one phase owned by `run` and publish the result.
    ///
    /// Fails with `Locked` if the phase is no longer owned by `run`.
    pub(crate) async fn update_phase<F>(
        &self,
        object: &mut Box<dyn InternalObject>,
        id: &ElementId,
        run: &RunId,
        mut change: F,
    ) -> Result<PhaseState>
    where
        F: FnMut(&mut PhaseState) + Send,
    {
        let phase = id.phase().clone();
        let owned = modify(self.store(), &mut **object, |o| {
            let state = o.internal_state_mut().phase_mut(&phase);
            if state.lock != *run {
                return (false, false);
            }
            change(state);
            (true, true)
        })
        .await?;
        let state = object
            .internal_state()
            .phase(&phase)
            .cloned()
            .unwrap_or_default();
        if !owned {
            return Err(Error::locked(id, &state.lock));
        }
        self.model.refresh(object.as_ref());
        self.phase_changed(id, &state).await;
        Ok(state)
    }

    /// Publish a phase change and mirror it to the triggering external objects.
    pub(crate) async fn phase_changed(&self, id: &ElementId, state: &PhaseState) {
        self.watch.publish(WatchEvent::element(id, state));
        if let Err(e) = self.update_external_status(id, state).await {
            warn!(element = %id, error = %e, "Failed to update external status");
        }
    }

    /// Write the state of a trigger phase into the status of the external
    /// objects triggering it. External objects marked for deletion are
    /// released once a committed state no longer observes them.
    async fn update_external_status(&self, id: &ElementId, state: &PhaseState) -> Result<()> {
        let kinds = self
            .model
            .metamodel()
            .triggered_by(&id.type_id())
            .to_vec();
        let mut observed = None;
        for kind in kinds {
            let external_id = id.object().with_kind(kind);
            let Some(mut external) = self.model.get_external(&external_id).await? else {
                continue;
            };
            if external.meta().deletion_requested {
                let released = if state.status == ProcessingStatus::Deleted {
                    true
                } else if state.is_locked() {
                    false
                } else {
                    if observed.is_none() {
                        let states = self.model.external_states(id.object()).await?;
                        observed = Some(observed_version(&states.states));
                    }
                    observed.as_deref() == Some(state.current.observed_version.as_str())
                };
                if released {
                    self.remove_finalizer(&external_id).await?;
                }
                continue;
            }
            let status = ExternalStatus {
                status: state.status,
                message: state.message.clone(),
                run_id: state.lock.clone(),
                observed_version: state.current.observed_version.clone(),
                formal_version: state.current.formal_version.clone(),
                effective_version: state.current.effective_version.clone(),
            };
            modify(self.store(), &mut *external, |e| {
                if *e.external_status() == status {
                    return (false, ());
                }
                *e.external_status_mut() = status.clone();
                (true, ())
            })
            .await?;
        }
        Ok(())
    }

    /// Remove the engine finalizer from any object.
    pub(crate) async fn remove_finalizer(&self, id: &ObjectId) -> Result<()> {
        let mut object = match self.store().get_object(id).await {
            Ok(object) => object,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        let finalizer = self.model.finalizer().to_string();
        let removed = modify(self.store(), &mut *object, |o| {
            let removed = o.meta_mut().remove_finalizer(&finalizer);
            (removed, removed)
        })
        .await?;
        if removed {
            debug!(object = %id, "Removed finalizer");
        }
        Ok(())
    }

    /// Add the engine finalizer to an object that is not being deleted.
    pub(crate) async fn ensure_finalizer(&self, object: &mut Box<dyn Object>) -> Result<()> {
        let finalizer = self.model.finalizer().to_string();
        modify(self.store(), &mut **object, |o| {
            let meta = o.meta_mut();
            if meta.deletion_requested || meta.has_finalizer(&finalizer) {
                return (false, ());
            }
            meta.add_finalizer(&finalizer);
            (true, ())
        })
        .await
    }
}
