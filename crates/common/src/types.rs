//! Core types for the gallery harness

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// How an example is executed and where its rendered page lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExampleKind {
    /// Standalone script that writes an HTML file next to itself
    #[default]
    File,
    /// Page served by a running application server
    Server,
    /// Notebook rendered by a notebook server
    Notebook,
}

impl std::fmt::Display for ExampleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExampleKind::File => write!(f, "file"),
            ExampleKind::Server => write!(f, "server"),
            ExampleKind::Notebook => write!(f, "notebook"),
        }
    }
}

/// Per-example switches set by discovery; never changed afterwards
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExampleFlags {
    #[serde(default)]
    pub is_skip: bool,
    #[serde(default)]
    pub is_slow: bool,
    #[serde(default)]
    pub no_js: bool,
    #[serde(default)]
    pub no_diff: bool,
}

/// Root directory and reference version used to derive artifact paths
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactLayout {
    pub root: PathBuf,
    pub version: String,
}

impl ArtifactLayout {
    pub fn new(root: impl Into<PathBuf>, version: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            version: version.into(),
        }
    }

    /// Derive the artifact paths for an example's relative path.
    ///
    /// Distinct relative paths always map to distinct artifact paths, so
    /// concurrent example runs never write to the same file.
    pub fn derive(&self, relpath: &Path) -> ArtifactPaths {
        let image = relpath.with_extension("png");
        let key_parts: Vec<String> = image
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();

        ArtifactPaths {
            generated: self.root.join("generated").join(&image),
            reference: self.root.join("reference").join(&self.version).join(&image),
            diff: self.root.join("diff").join(&image),
            reference_key: format!("{}/{}", self.version, key_parts.join("/")),
        }
    }
}

impl Default for ArtifactLayout {
    fn default() -> Self {
        Self::new("test-results", "master")
    }
}

/// Files produced or consumed for one example
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactPaths {
    /// Screenshot captured during this run
    pub generated: PathBuf,

    /// Local copy of the fetched reference image
    pub reference: PathBuf,

    /// Diff visualisation written by the scorer
    pub diff: PathBuf,

    /// Key of the reference image in the remote store
    pub reference_key: String,
}

/// One unit of the visual regression suite
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Example {
    /// Absolute path of the script or notebook
    pub path: PathBuf,

    /// Path relative to the examples directory; the identity of the example
    pub relpath: PathBuf,

    pub kind: ExampleKind,

    pub flags: ExampleFlags,

    pub artifacts: ArtifactPaths,
}

impl Example {
    /// Build an example rooted at `examples_dir`.
    ///
    /// `relpath` must be relative and must not climb out of the examples
    /// directory. `.` components are dropped, so `./a.py` and `a.py` are the
    /// same example.
    pub fn new(
        examples_dir: &Path,
        relpath: impl Into<PathBuf>,
        kind: ExampleKind,
        flags: ExampleFlags,
        layout: &ArtifactLayout,
    ) -> Result<Self> {
        let raw = relpath.into();

        let mut relpath = PathBuf::new();
        for component in raw.components() {
            match component {
                Component::Normal(part) => relpath.push(part),
                Component::CurDir => {}
                _ => {
                    return Err(Error::InvalidExample(format!(
                        "example path must be relative to the examples directory: {}",
                        raw.display()
                    )))
                }
            }
        }

        if relpath.as_os_str().is_empty() {
            return Err(Error::InvalidExample("empty example path".to_string()));
        }

        Ok(Self {
            path: examples_dir.join(&relpath),
            artifacts: layout.derive(&relpath),
            relpath,
            kind,
            flags,
        })
    }

    /// File stem, e.g. `bar` for `plotting/file/bar.py`
    pub fn name(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Relative path with forward slashes, used in messages and reports
    pub fn display_name(&self) -> String {
        self.relpath
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// HTML page a file example writes next to itself
    pub fn html_path(&self) -> PathBuf {
        self.path.with_extension("html")
    }

    /// Working directory for the example process
    pub fn workdir(&self) -> PathBuf {
        self.path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// Exit status of an example process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "code", rename_all = "snake_case")]
pub enum RunStatus {
    /// Process exited on its own with this code
    Exited(i32),
    /// Deadline expired and the process was killed
    Timeout,
}

impl RunStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, RunStatus::Exited(0))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RunStatus::Timeout)
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            RunStatus::Exited(code) => Some(*code),
            RunStatus::Timeout => None,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Exited(code) => write!(f, "exit code {}", code),
            RunStatus::Timeout => write!(f, "timeout"),
        }
    }
}

/// Result of executing an example process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub status: RunStatus,

    /// Wall-clock time from spawn to exit (or kill)
    pub duration: Duration,

    /// Everything the process wrote to stdout, including after a timeout
    pub stdout: String,

    /// Everything the process wrote to stderr, including after a timeout
    pub stderr: String,
}

/// Console message reported by the headless browser
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleMessage {
    #[serde(alias = "msg")]
    pub text: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub line: Option<u32>,
}

/// One frame of a browser error's stack trace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub line: Option<u32>,
}

/// Uncaught error raised by page scripts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleError {
    #[serde(alias = "msg")]
    pub text: String,
    #[serde(default)]
    pub trace: Vec<StackFrame>,
}

/// Resource the page tried to load, with the HTTP-like status it got
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceResult {
    pub url: String,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default, alias = "statusText")]
    pub status_text: String,
}

impl ResourceResult {
    pub fn status_label(&self) -> String {
        self.status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    }
}

/// Result of a headless capture.
///
/// `success` and `timeout` are independent: a capture may time out and
/// still report success, or fail without timing out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotResult {
    pub success: bool,
    #[serde(default)]
    pub timeout: bool,
    #[serde(default)]
    pub messages: Vec<ConsoleMessage>,
    #[serde(default)]
    pub errors: Vec<ConsoleError>,
    #[serde(default)]
    pub resources: Vec<ResourceResult>,
}

impl SnapshotResult {
    /// Capture failure in the pass/fail sense; console errors do not count
    pub fn is_failure(&self) -> bool {
        !self.success || self.timeout
    }

    /// Result used when the capture tool itself ran out of time
    pub fn timed_out() -> Self {
        Self {
            success: false,
            timeout: true,
            ..Default::default()
        }
    }
}

/// Outcome of comparing a generated image with its reference.
///
/// Serialized as the raw score: `0` for identical images, `-1` for
/// incompatible dimensions, otherwise the percentage of differing pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(into = "f64", try_from = "f64")]
pub enum DiffScore {
    Match,
    DimensionMismatch,
    Differs(f64),
}

impl DiffScore {
    /// Interpret a raw score from a diff utility
    pub fn from_raw(raw: f64) -> Result<Self> {
        if raw == 0.0 {
            Ok(DiffScore::Match)
        } else if raw == -1.0 {
            Ok(DiffScore::DimensionMismatch)
        } else if raw.is_finite() && raw > 0.0 {
            Ok(DiffScore::Differs(raw))
        } else {
            Err(Error::InvalidDiffScore(raw))
        }
    }

    pub fn raw(&self) -> f64 {
        match self {
            DiffScore::Match => 0.0,
            DiffScore::DimensionMismatch => -1.0,
            DiffScore::Differs(percent) => *percent,
        }
    }

    pub fn is_match(&self) -> bool {
        matches!(self, DiffScore::Match)
    }

    /// Human-readable reason, e.g. `2.50% of pixels`
    pub fn describe(&self) -> String {
        match self {
            DiffScore::Match => "images match".to_string(),
            DiffScore::DimensionMismatch => "dimensions don't match".to_string(),
            DiffScore::Differs(percent) => format!("{:.2}% of pixels", percent),
        }
    }
}

impl From<DiffScore> for f64 {
    fn from(score: DiffScore) -> Self {
        score.raw()
    }
}

impl TryFrom<f64> for DiffScore {
    type Error = Error;

    fn try_from(raw: f64) -> Result<Self> {
        DiffScore::from_raw(raw)
    }
}
