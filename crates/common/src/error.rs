//! Error types for the gallery harness data model

use thiserror::Error;

/// Result type alias using the common Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while building or validating harness records
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid example: {0}")]
    InvalidExample(String),

    #[error("Invalid diff score: {0} (expected 0, -1 or a positive percentage)")]
    InvalidDiffScore(f64),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },
}
