#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

//! # drover-metamodel
//!
//! Describes what the engine reconciles: the namespace type, internal types
//! with their ordered phases, the element type dependency graph and the
//! external types triggering it. A [`MetaModel`] is validated once and is
//! immutable afterwards.

pub mod model;
pub mod spec;

pub use model::{ElementType, ExternalType, InternalType, MetaModel};
pub use spec::{ExternalTypeSpec, InternalTypeSpec, MetaModelSpec, PhaseSpec};
