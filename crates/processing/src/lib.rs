#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

//! # drover-processing
//!
//! The processing engine. Internal objects are split into elements, one per
//! phase. A change of an external object starts a run: the namespace and the
//! dependent subgraph of the triggered element are locked all-or-nothing,
//! then every element is prepared from the external state, waits for its
//! links, is processed and commits or rolls back. Versions make repeated
//! runs over unchanged inputs free.
//!
//! - [`Processor`]: the engine bound to one store and one metamodel
//! - [`InternalObject`] / [`ExternalObject`]: the roles user types play
//! - [`EngineTypes`]: registry of those roles
//! - [`WatchEvent`]: state changes streamed to subscribers

pub mod config;
mod context;
pub mod keys;
mod locking;
pub mod model;
pub mod namespace;
pub mod objects;
pub mod processor;
pub mod readiness;
mod reconcile;
pub mod status;
pub mod types;
pub mod update_request;
pub mod version;
pub mod watch;

pub use config::{DEFAULT_FINALIZER, EngineConfig};
pub use keys::Key;
pub use locking::LockRefusal;
pub use model::{Element, ElementView, LoadResult, NamespaceInfo, ProcessingModel};
pub use namespace::Namespace;
pub use objects::{
    Acceptance, CurrentState, ExternalObject, ExternalStates, ExternalStatus, InternalObject,
    InternalState, PhaseState, ProcessRequest, ProcessResult, TargetSpec, TargetState,
};
pub use processor::Processor;
pub use readiness::{LinkState, Readiness};
pub use status::{ProcessingStatus, TriggerDecision, retrigger_decision};
pub use types::EngineTypes;
pub use update_request::{
    RequestAction, RequestStatus, UpdateRequest, UpdateRequestSpec, UpdateRequestStatus,
};
pub use watch::{WatchEvent, WatchFeed, WatchNode};
