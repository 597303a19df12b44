//! Result type definition and extension traits.
//!
//! Provides combinators for best-effort operations whose failure is logged
//! instead of propagated.

use crate::error::Error;

/// The standard Result type for drover operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Extension trait for best-effort Results.
pub trait ResultExt<T> {
    /// Convert a Result to an Option, logging the error if present.
    fn into_option_logged(self) -> Option<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn into_option_logged(self) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(error = %e, "operation failed");
                None
            }
        }
    }
}
