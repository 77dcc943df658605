//! Harness configuration
//!
//! One `HarnessConfig` is built at startup (TOML file, then command-line
//! overrides) and handed by reference to every pipeline stage.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use gallery_common::{ArtifactLayout, Example};

use crate::error::{E2eError, E2eResult};
use crate::playwright::Browser;

/// Top-level harness configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Root of the example gallery
    pub examples_dir: PathBuf,

    /// YAML manifest listing the examples to run
    pub manifest: PathBuf,

    /// Where screenshots, references, diffs and results are written
    pub artifacts_dir: PathBuf,

    /// Number of examples run concurrently
    pub jobs: usize,

    /// Emit every browser message and resource line at info level
    pub verbose: bool,

    pub timeouts: TimeoutConfig,
    pub launch: LaunchConfig,
    pub capture: CaptureConfig,
    pub reference: ReferenceConfig,
    pub diff: DiffConfig,
    pub server: ServerConfig,
    pub notebook: NotebookConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            examples_dir: PathBuf::from("examples"),
            manifest: PathBuf::from("examples/examples.yaml"),
            artifacts_dir: PathBuf::from("test-results"),
            jobs: 1,
            verbose: false,
            timeouts: TimeoutConfig::default(),
            launch: LaunchConfig::default(),
            capture: CaptureConfig::default(),
            reference: ReferenceConfig::default(),
            diff: DiffConfig::default(),
            server: ServerConfig::default(),
            notebook: NotebookConfig::default(),
        }
    }
}

impl HarnessConfig {
    /// Load configuration from a TOML file, falling back to defaults when
    /// the file does not exist
    pub fn load(path: &Path) -> E2eResult<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Reject settings no run could succeed with
    pub fn validate(&self) -> E2eResult<()> {
        if self.jobs == 0 {
            return Err(E2eError::Config("jobs must be at least 1".to_string()));
        }
        if self.launch.interpreter.is_empty() {
            return Err(E2eError::Config("launch.interpreter is empty".to_string()));
        }
        if self.launch.notebook_command.is_empty() {
            return Err(E2eError::Config("launch.notebook_command is empty".to_string()));
        }
        if self.capture.tool.is_empty() {
            return Err(E2eError::Config("capture.tool is empty".to_string()));
        }
        if self.capture.poll_interval_ms == 0 {
            return Err(E2eError::Config("capture.poll_interval_ms must be positive".to_string()));
        }
        Ok(())
    }

    pub fn artifact_layout(&self) -> ArtifactLayout {
        ArtifactLayout::new(&self.artifacts_dir, &self.reference.version)
    }

    pub fn results_path(&self) -> PathBuf {
        self.artifacts_dir.join("results.json")
    }
}

/// Deadlines for example processes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub default_secs: u64,
    pub slow_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default_secs: 20,
            slow_secs: 60,
        }
    }
}

impl TimeoutConfig {
    pub fn for_example(&self, example: &Example) -> Duration {
        if example.flags.is_slow {
            Duration::from_secs(self.slow_secs)
        } else {
            Duration::from_secs(self.default_secs)
        }
    }
}

/// How example processes are started
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Interpreter command line for scripts
    pub interpreter: Vec<String>,

    /// Wrap scripts in a bootstrap that seeds the random generators
    pub seeded_bootstrap: bool,

    /// Command that executes a notebook in place; the notebook path is appended
    pub notebook_command: Vec<String>,

    /// Environment overrides applied to every example process
    pub env: BTreeMap<String, String>,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        let env = [
            ("BOKEH_RESOURCES", "relative"),
            ("BOKEH_MINIFIED", "false"),
            ("BOKEH_BROWSER", "none"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            interpreter: vec!["python".to_string()],
            seeded_bootstrap: true,
            notebook_command: ["jupyter", "nbconvert", "--to", "notebook", "--execute", "--inplace"]
                .into_iter()
                .map(String::from)
                .collect(),
            env,
        }
    }
}

/// Headless capture parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Command that runs the generated capture script; the script path is appended
    pub tool: Vec<String>,

    /// `NODE_PATH` for the capture tool, so the script can resolve `playwright`
    pub node_path: Option<PathBuf>,

    pub browser: Browser,

    /// Render budget inside the browser
    pub wait_ms: u64,

    /// Interval between readiness checks
    pub poll_interval_ms: u64,

    /// JPEG quality; ignored for PNG output
    pub quality: u8,

    pub width: u32,
    pub height: u32,

    /// Viewport height for notebooks, which lay out taller pages
    pub notebook_height: u32,

    /// JavaScript expression polled until truthy
    pub ready_expression: String,

    /// Extra time the capture tool process gets beyond `wait_ms`
    pub grace_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            tool: vec!["node".to_string()],
            node_path: None,
            browser: Browser::default(),
            wait_ms: 30_000,
            poll_interval_ms: 1_000,
            quality: 100,
            width: 1_000,
            height: 1_000,
            notebook_height: 2_000,
            ready_expression: "document.readyState === 'complete'".to_string(),
            grace_ms: 10_000,
        }
    }
}

/// Where reference images come from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceConfig {
    /// HTTP(S) base URL or local directory; `None` means no references
    pub source: Option<String>,

    /// Version prefix of reference keys
    pub version: String,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            source: None,
            version: "master".to_string(),
        }
    }
}

/// How image differences affect the verdict
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DiffMode {
    /// A mismatch fails the example
    #[default]
    Enforce,
    /// A mismatch is reported as a warning
    Advisory,
    /// Never fetch references or diff
    Off,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffConfig {
    pub mode: DiffMode,

    /// Per-channel tolerance before two pixels count as different
    pub tolerance: u8,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            mode: DiffMode::default(),
            tolerance: 5,
        }
    }
}

/// Application server hosting served-page examples
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:5006".to_string(),
        }
    }
}

/// Notebook server hosting notebook examples
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotebookConfig {
    pub port: u16,
}

impl Default for NotebookConfig {
    fn default() -> Self {
        Self { port: 6007 }
    }
}
