//! Update requests: externally held namespace runs.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use drover_core::{Error, ObjectId, Result, RunId};
use drover_objectbase::{downcast, modify};
use drover_pool::{Action, Pool, Status};

use crate::context::Context;
use crate::keys::{Key, element_key};
use crate::locking::LockRefusal;
use crate::model::NamespaceInfo;
use crate::update_request::{RequestAction, RequestStatus, UpdateRequest, UpdateRequestStatus};

pub(crate) struct RequestReconciler {
    ctx: Arc<Context>,
}

impl RequestReconciler {
    pub(crate) const fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Action for RequestReconciler {
    async fn reconcile(&self, pool: &Pool, key: &str) -> Status {
        let id = match Key::parse(key) {
            Ok(Key::Object(id)) => id,
            Ok(_) => return Status::failed(Error::invalid_key(key, "expected object key")),
            Err(e) => return Status::failed(e),
        };
        super::into_status(self.run(pool, &id).await)
    }
}

impl RequestReconciler {
    async fn run(&self, pool: &Pool, id: &ObjectId) -> Result<Status> {
        let mut object = match self.ctx.store().get_object(id).await {
            Ok(object) => object,
            Err(e) if e.is_not_found() => return Ok(Status::done()),
            Err(e) => return Err(e),
        };
        if object.meta().deletion_requested {
            let request = downcast::<UpdateRequest>(object)?;
            if let Some(run) = request.reserved_run() {
                if let Some(namespace) = self.ctx.model.namespace(id.namespace()) {
                    self.release(pool, &namespace, run).await?;
                }
            }
            self.ctx.remove_finalizer(id).await?;
            return Ok(Status::done());
        }
        self.ctx.ensure_finalizer(&mut object).await?;
        let mut request = downcast::<UpdateRequest>(object)?;

        let Some(namespace) = self.ctx.model.assure_namespace(id.namespace(), true).await? else {
            return Ok(Status::retry_later(Error::temporary(format!(
                "namespace {} unavailable",
                id.namespace()
            ))));
        };

        let action = request.spec.action;
        let current = request.status.status;
        let satisfied = matches!(
            (action, current),
            (RequestAction::Acquire, RequestStatus::Acquired)
                | (RequestAction::Lock, RequestStatus::Locked)
                | (RequestAction::Release, RequestStatus::Released)
        );
        if satisfied {
            debug!(request = %id, status = %current, "Update request already served");
            return Ok(Status::done());
        }

        if action != RequestAction::Release && request.reserved_run().is_none() {
            self.reserve_run(&mut request).await?;
        }

        let (status, retry) = match action {
            RequestAction::Acquire => self.acquire(&namespace, &request).await?,
            RequestAction::Lock => self.lock(pool, &namespace, &request).await?,
            RequestAction::Release => {
                if let Some(run) = request.reserved_run() {
                    self.release(pool, &namespace, run).await?;
                }
                let status = UpdateRequestStatus {
                    status: RequestStatus::Released,
                    run_id: RunId::none(),
                    message: String::new(),
                };
                (status, None)
            }
        };

        info!(request = %id, action = ?action, status = %status.status, "Update request served");
        modify(self.ctx.store(), &mut *request, |r: &mut UpdateRequest| {
            if r.status == status {
                return (false, ());
            }
            r.status = status.clone();
            (true, ())
        })
        .await?;
        Ok(match retry {
            Some(reason) => Status::retry_later(reason),
            None => Status::done(),
        })
    }

    /// Record a fresh run on the request before any namespace lock is
    /// taken for it.
    async fn reserve_run(&self, request: &mut UpdateRequest) -> Result<()> {
        let run = RunId::for_update_request(request.meta.id.name());
        modify(self.ctx.store(), request, |r: &mut UpdateRequest| {
            if r.reserved_run().is_some() {
                return (false, ());
            }
            r.status.run_id = run.clone();
            (true, ())
        })
        .await?;
        debug!(request = %request.meta.id, run = %request.status.run_id, "Run reserved");
        Ok(())
    }

    /// The run recorded for the request.
    fn run_for(request: &UpdateRequest) -> Result<RunId> {
        request.reserved_run().cloned().ok_or_else(|| {
            Error::temporary(format!("no run reserved for {}", request.meta.id))
        })
    }

    async fn acquire(
        &self,
        namespace: &NamespaceInfo,
        request: &UpdateRequest,
    ) -> Result<(UpdateRequestStatus, Option<Error>)> {
        let run = Self::run_for(request)?;
        let acquired = match namespace.try_lock() {
            Some(_guard) => {
                // held before the lock is visible, so lock maintenance never releases it
                namespace.hold(&run);
                let acquired = self.ctx.acquire_namespace(namespace, &run).await;
                if !matches!(acquired, Ok(Ok(_))) && request.held_run() != Some(&run) {
                    namespace.unhold(&run);
                }
                acquired?
            }
            None => Err(LockRefusal::NamespaceBusy),
        };
        Ok(match acquired {
            Ok(_) => (
                UpdateRequestStatus {
                    status: RequestStatus::Acquired,
                    run_id: run,
                    message: String::new(),
                },
                None,
            ),
            Err(refusal) => {
                let reason = refusal.into_error(namespace.name());
                (Self::deferred(request, &reason), Some(reason))
            }
        })
    }

    async fn lock(
        &self,
        pool: &Pool,
        namespace: &NamespaceInfo,
        request: &UpdateRequest,
    ) -> Result<(UpdateRequestStatus, Option<Error>)> {
        let unknown: Vec<String> = request
            .spec
            .elements
            .iter()
            .filter(|element| self.ctx.model.element(element).is_none())
            .map(ToString::to_string)
            .collect();
        if !unknown.is_empty() {
            let status = UpdateRequestStatus {
                status: RequestStatus::Invalid,
                run_id: request.status.run_id.clone(),
                message: format!("unknown elements: {}", unknown.join(", ")),
            };
            return Ok((status, None));
        }

        let run = Self::run_for(request)?;
        namespace.hold(&run);
        match self
            .ctx
            .lock_graph(pool, namespace, &request.spec.elements, &run)
            .await
        {
            Ok(Ok(locked)) => {
                debug!(request = %request.meta.id, run = %run, elements = locked.len(), "Elements locked");
                let status = UpdateRequestStatus {
                    status: RequestStatus::Locked,
                    run_id: run,
                    message: String::new(),
                };
                Ok((status, None))
            }
            Ok(Err(refusal)) => {
                if request.held_run() != Some(&run) {
                    namespace.unhold(&run);
                }
                let reason = refusal.into_error(namespace.name());
                Ok((Self::deferred(request, &reason), Some(reason)))
            }
            Err(e) => {
                if request.held_run() != Some(&run) {
                    namespace.unhold(&run);
                }
                Err(e)
            }
        }
    }

    /// Give a held run back: its locked elements get processed and the
    /// namespace is released once they finished.
    async fn release(&self, pool: &Pool, namespace: &NamespaceInfo, run: &RunId) -> Result<()> {
        namespace.unhold(run);
        let pending = namespace.pending(run);
        info!(namespace = namespace.name(), run = %run, pending = pending.len(), "Releasing update request run");
        for element in &pending {
            pool.enqueue_raw(&element_key(element));
        }
        self.ctx.release_if_drained(namespace, run).await
    }

    /// Status of a request that has to wait. The reserved run is kept.
    fn deferred(request: &UpdateRequest, reason: &Error) -> UpdateRequestStatus {
        let status = if request.held_run().is_some() {
            request.status.status
        } else {
            RequestStatus::Pending
        };
        UpdateRequestStatus {
            status,
            run_id: request.status.run_id.clone(),
            message: reason.to_string(),
        }
    }
}
