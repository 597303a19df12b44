//! Namespace and graph locking.
//!
//! A run first takes the namespace run lock, then locks every element
//! reachable from its roots, or nothing at all.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use drover_core::{ElementId, Error, ObjectId, Phase, Result, RunId};
use drover_objectbase::modify;
use drover_pool::Pool;

use crate::context::Context;
use crate::keys::{element_key, namespace_command};
use crate::model::NamespaceInfo;
use crate::status::ProcessingStatus;
use crate::watch::WatchEvent;

/// Why a graph could not be locked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockRefusal {
    /// Another worker is walking the namespace.
    NamespaceBusy,
    /// The namespace is owned by another run.
    NamespaceLocked(RunId),
    /// An element of the subgraph is owned by another run.
    ElementLocked(ElementId, RunId),
}

impl LockRefusal {
    pub(crate) fn into_error(self, namespace: &str) -> Error {
        match self {
            Self::NamespaceBusy => Error::busy(format!("namespace {namespace}")),
            Self::NamespaceLocked(run) => Error::locked(format!("namespace {namespace}"), run),
            Self::ElementLocked(id, run) => Error::locked(id, run),
        }
    }
}

impl Context {
    /// Take the namespace run lock for `run`.
    ///
    /// Succeeds if the namespace is unlocked or already owned by `run`.
    pub(crate) async fn acquire_namespace(
        &self,
        namespace: &NamespaceInfo,
        run: &RunId,
    ) -> Result<std::result::Result<bool, LockRefusal>> {
        let current = namespace.run_lock();
        if current == *run {
            return Ok(Ok(false));
        }
        if !current.is_none() {
            return Ok(Err(LockRefusal::NamespaceLocked(current)));
        }
        if !self
            .model
            .swap_run_lock(namespace, &RunId::none(), run)
            .await?
        {
            return Ok(Err(LockRefusal::NamespaceLocked(namespace.run_lock())));
        }
        info!(namespace = namespace.name(), run = %run, "Namespace locked");
        self.watch
            .publish(WatchEvent::namespace(namespace.name(), run));
        Ok(Ok(true))
    }

    /// Give the namespace run lock of `run` back.
    pub(crate) async fn release_namespace(
        &self,
        namespace: &NamespaceInfo,
        run: &RunId,
    ) -> Result<()> {
        if namespace.run_lock() != *run {
            return Ok(());
        }
        if self
            .model
            .swap_run_lock(namespace, run, &RunId::none())
            .await?
        {
            namespace.drop_pending(run);
            info!(namespace = namespace.name(), run = %run, "Namespace released");
            self.watch
                .publish(WatchEvent::namespace(namespace.name(), &RunId::none()));
        }
        Ok(())
    }

    /// Release the namespace if `run` has no pending elements and is not held.
    pub(crate) async fn release_if_drained(
        &self,
        namespace: &NamespaceInfo,
        run: &RunId,
    ) -> Result<()> {
        if namespace.is_held(run) || !namespace.pending(run).is_empty() {
            return Ok(());
        }
        let _guard = namespace.lock().await;
        if !namespace.is_held(run) && namespace.pending(run).is_empty() {
            self.release_namespace(namespace, run).await?;
        }
        Ok(())
    }

    /// Queue lock maintenance if the namespace is owned by a run that has
    /// nothing left to do.
    pub(crate) fn settle_namespace(&self, pool: &Pool, namespace: &NamespaceInfo) {
        let run = namespace.run_lock();
        if run.is_none() || namespace.is_held(&run) || !namespace.pending(&run).is_empty() {
            return;
        }
        debug!(namespace = namespace.name(), run = %run, "Run drained, queueing release");
        pool.enqueue_command(&namespace_command(namespace.name()));
    }

    /// Lock the subgraph reachable from `roots` for `run`.
    ///
    /// Returns the locked elements, or the reason nothing was locked. If a
    /// write fails part-way, the namespace lock of a fresh run is released
    /// and the elements locked so far are enqueued so their orphaned locks
    /// are cleared.
    pub(crate) async fn lock_graph(
        &self,
        pool: &Pool,
        namespace: &NamespaceInfo,
        roots: &[ElementId],
        run: &RunId,
    ) -> Result<std::result::Result<Vec<ElementId>, LockRefusal>> {
        let Some(_guard) = namespace.try_lock() else {
            return Ok(Err(LockRefusal::NamespaceBusy));
        };
        let fresh = match self.acquire_namespace(namespace, run).await? {
            Ok(fresh) => fresh,
            Err(refusal) => return Ok(Err(refusal)),
        };

        let subgraph = namespace.closure(roots, self.model.metamodel());
        let conflict = subgraph.iter().find_map(|id| {
            namespace
                .view(id)
                .filter(|view| view.is_locked() && view.lock != *run)
                .map(|view| (id.clone(), view.lock))
        });
        if let Some((id, lock)) = conflict {
            debug!(element = %id, lock = %lock, run = %run, "Subgraph already locked");
            if fresh {
                self.release_or_defer(pool, namespace, run).await;
            }
            return Ok(Err(LockRefusal::ElementLocked(id, lock)));
        }

        let mut by_object: BTreeMap<ObjectId, Vec<Phase>> = BTreeMap::new();
        for id in &subgraph {
            by_object
                .entry(id.object().clone())
                .or_default()
                .push(id.phase().clone());
        }

        let mut locked = Vec::with_capacity(subgraph.len());
        for (object, phases) in by_object {
            match self.lock_object(&object, &phases, run).await {
                Ok(ids) => {
                    namespace.add_pending(run, ids.iter().cloned());
                    locked.extend(ids);
                }
                Err(e) => {
                    warn!(object = %object, run = %run, error = %e, "Graph lock failed part-way");
                    if fresh {
                        namespace.drop_pending(run);
                        self.release_or_defer(pool, namespace, run).await;
                    }
                    for id in &locked {
                        pool.enqueue_raw(&element_key(id));
                    }
                    return Err(e);
                }
            }
        }
        if locked.is_empty() && fresh && !namespace.is_held(run) {
            // nothing to run, so nothing would ever release the namespace
            self.release_or_defer(pool, namespace, run).await;
        }
        info!(
            namespace = namespace.name(),
            run = %run,
            elements = locked.len(),
            "Subgraph locked"
        );
        Ok(Ok(locked))
    }

    /// Release the namespace of a run that locked nothing. A failed release
    /// is left to lock maintenance.
    async fn release_or_defer(&self, pool: &Pool, namespace: &NamespaceInfo, run: &RunId) {
        if let Err(e) = self.release_namespace(namespace, run).await {
            warn!(namespace = namespace.name(), run = %run, error = %e, "Failed to release namespace");
            pool.enqueue_command_rate_limited(&namespace_command(namespace.name()));
        }
    }

    /// Lock the given phases of one internal object in a single write.
    async fn lock_object(
        &self,
        id: &ObjectId,
        phases: &[Phase],
        run: &RunId,
    ) -> Result<Vec<ElementId>> {
        let mut object = self.model.get_internal(id).await?;
        let conflict = modify(self.store(), &mut *object, |o| {
            let state = o.internal_state_mut();
            let conflict = phases.iter().find_map(|phase| {
                state
                    .phase(phase)
                    .filter(|s| s.is_locked() && s.lock != *run)
                    .map(|s| (phase.clone(), s.lock.clone()))
            });
            if conflict.is_some() {
                return (false, conflict);
            }
            for phase in phases {
                let phase = state.phase_mut(phase);
                phase.lock = run.clone();
                phase.status = ProcessingStatus::Pending;
                phase.message.clear();
            }
            (true, None)
        })
        .await?;
        if let Some((phase, lock)) = conflict {
            return Err(Error::locked(id.element(phase), lock));
        }

        self.model.refresh(object.as_ref());
        let mut locked = Vec::with_capacity(phases.len());
        for phase in phases {
            let element = id.element(phase.clone());
            let state = object
                .internal_state()
                .phase(phase)
                .cloned()
                .unwrap_or_default();
            self.phase_changed(&element, &state).await;
            locked.push(element);
        }
        Ok(locked)
    }
}
