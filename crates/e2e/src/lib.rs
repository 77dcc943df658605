//! Gallery visual regression harness
//!
//! Runs every gallery example as a child process with a hard deadline,
//! captures the rendered page with a headless browser, compares the
//! screenshot against a reference image and aggregates a verdict per
//! example.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Gallery Harness (Rust)                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Manifest (YAML) -> [Example]                               │
//! ├─────────────────────────────────────────────────────────────┤
//! │  SuiteRunner (per example, `jobs` at a time)                │
//! │    ├── ProcessRunner::run(example, deadline) -> RunOutcome  │
//! │    ├── SnapshotCapturer::capture(request) -> SnapshotResult │
//! │    ├── ReferenceStore::fetch(example) -> Option<bytes>      │
//! │    ├── ImageDiffer::diff(generated, reference) -> DiffScore │
//! │    └── StageTracker + Diagnostics -> Verdict                │
//! ├─────────────────────────────────────────────────────────────┤
//! │  SuiteResult -> <artifacts>/results.json                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod manifest;
pub mod playwright;
pub mod process;
pub mod reference;
pub mod runner;
pub mod verdict;
pub mod visual;

pub use config::{DiffMode, HarnessConfig};
pub use error::{E2eError, E2eResult};
pub use manifest::Manifest;
pub use runner::{SuiteResult, SuiteRunner};
pub use verdict::{Outcome, Stage, Verdict};
