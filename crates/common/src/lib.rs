//! Gallery Harness Common Library
//!
//! Shared records for the visual regression pipeline: the example under
//! test, the outcome of running it, the headless snapshot diagnostics and
//! the image diff score.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::*;

/// Harness version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
