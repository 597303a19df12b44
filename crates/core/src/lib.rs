//! Core types shared by every drover crate.
//!
//! - [`ids`]: object, element, type and run identifiers
//! - [`error`]: the error taxonomy used across the engine
//! - [`result`]: the crate-wide `Result` alias and logging combinators

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod error;
pub mod ids;
pub mod result;

pub use error::Error;
pub use ids::{ElementId, ObjectId, Phase, RunId, TypeId};
pub use result::{Result, ResultExt};
