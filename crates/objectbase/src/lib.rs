#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

//! # drover-objectbase
//!
//! Typed object store consumed by the processing engine.
//!
//! Objects carry a generation for optimistic concurrency, finalizers that
//! delay physical deletion, and change notification with replay of the
//! existing objects on registration.

pub mod handler;
pub mod mapping;
pub mod modify;
pub mod object;
pub mod store;

pub use handler::{EventHandler, Filter, HandlerId, HandlerRegistry, namespace_matches};
pub use mapping::{IdMapping, IdentityMapping, MappedObjectbase, NamespacePrefixMapping};
pub use modify::{MAX_MODIFY_ATTEMPTS, modify};
pub use object::{AsObject, DynObject, Object, ObjectMeta, Scheme, downcast};
pub use store::{InMemoryObjectbase, Objectbase, TracingObjectbase, get_typed};
