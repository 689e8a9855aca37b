//! Core error types for unitdata-core.

use thiserror::Error;

/// Errors produced by the value views.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    /// A named field was requested that the view does not contain.
    #[error("missing key: '{key}'")]
    MissingKey { key: String },
}
