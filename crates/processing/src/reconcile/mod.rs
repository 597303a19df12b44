//! Pool actions driving the processing engine.
//!
//! - [`ExternalReconciler`]: external object changes, starting runs
//! - [`ElementReconciler`]: the per-element state machine of a run
//! - [`NamespaceReconciler`]: lock maintenance of a namespace
//! - [`RequestReconciler`]: update requests

mod element;
mod external;
mod namespace;
mod request;

pub(crate) use element::ElementReconciler;
pub(crate) use external::ExternalReconciler;
pub(crate) use namespace::NamespaceReconciler;
pub(crate) use request::RequestReconciler;

use drover_core::Result;
use drover_pool::Status;

/// Map the outcome of a reconcile call onto the pool's requeue policy.
fn into_status(result: Result<Status>) -> Status {
    match result {
        Ok(status) => status,
        Err(e) if e.is_non_temporary() => Status::failed(e),
        Err(e) => Status::retry_later(e),
    }
}
