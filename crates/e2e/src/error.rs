//! Error types for the harness pipeline
//!
//! These cover infrastructure problems only. A failing example is a
//! verdict, not an error.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum E2eError {
    #[error("Failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("Capture tool error: {0}")]
    Capture(String),

    #[error("Malformed capture report: {0}")]
    CaptureReport(String),

    #[error("Reference store error: {0}")]
    Reference(String),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Common(#[from] gallery_common::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type E2eResult<T> = Result<T, E2eError>;
