//! Lock maintenance of a namespace.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use drover_core::{Error, Result};
use drover_pool::{Action, COMMAND_PREFIX, Pool, Status};

use crate::context::Context;
use crate::keys::{Key, element_key};

/// Handles `namespace:<name>` commands: releases the run lock of a
/// drained run and re-enqueues the elements of a run still in flight.
pub(crate) struct NamespaceReconciler {
    ctx: Arc<Context>,
}

impl NamespaceReconciler {
    pub(crate) const fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Action for NamespaceReconciler {
    async fn command(&self, pool: &Pool, command: &str) -> Status {
        let key = format!("{COMMAND_PREFIX}{command}");
        let name = match Key::parse(&key) {
            Ok(Key::Namespace(name)) => name,
            Ok(_) => return Status::failed(Error::invalid_key(command, "expected namespace command")),
            Err(e) => return Status::failed(e),
        };
        super::into_status(self.run(pool, &name).await)
    }

    async fn reconcile(&self, _pool: &Pool, key: &str) -> Status {
        Status::failed(Error::invalid_key(key, "namespace reconciler takes commands only"))
    }
}

impl NamespaceReconciler {
    async fn run(&self, pool: &Pool, name: &str) -> Result<Status> {
        let Some(namespace) = self.ctx.model.namespace(name) else {
            return Ok(Status::done());
        };
        let run = namespace.run_lock();
        if run.is_none() || namespace.is_held(&run) {
            return Ok(Status::done());
        }
        let pending = namespace.pending(&run);
        if pending.is_empty() {
            debug!(namespace = name, run = %run, "Releasing drained run");
            self.ctx.release_if_drained(&namespace, &run).await?;
            return Ok(Status::done());
        }
        debug!(namespace = name, run = %run, pending = pending.len(), "Resuming run");
        for id in &pending {
            pool.enqueue_raw(&element_key(id));
        }
        Ok(Status::done())
    }
}
