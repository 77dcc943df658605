//! YAML manifest of gallery examples
//!
//! ```yaml
//! examples:
//!   - path: plotting/file
//!   - path: models/file/custom.py
//!     no_js: true
//!   - path: howto/notebooks
//!     kind: notebook
//!     slow: true
//! ```
//!
//! Directory entries are walked for scripts and notebooks; every file found
//! inherits the entry's flags.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use gallery_common::{ArtifactLayout, Example, ExampleFlags, ExampleKind};

use crate::error::{E2eError, E2eResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub examples: Vec<ManifestEntry>,
}

/// A file or directory of examples, relative to the examples directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: PathBuf,

    /// Inferred from the file extension when absent
    #[serde(default)]
    pub kind: Option<ExampleKind>,

    #[serde(default)]
    pub skip: bool,

    #[serde(default)]
    pub slow: bool,

    #[serde(default)]
    pub no_js: bool,

    #[serde(default)]
    pub no_diff: bool,
}

impl ManifestEntry {
    fn flags(&self) -> ExampleFlags {
        ExampleFlags {
            is_skip: self.skip,
            is_slow: self.slow,
            no_js: self.no_js,
            no_diff: self.no_diff,
        }
    }
}

impl Manifest {
    pub fn from_yaml(yaml: &str) -> E2eResult<Self> {
        serde_yaml::from_str(yaml).map_err(E2eError::from)
    }

    pub fn from_file(path: &Path) -> E2eResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| E2eError::Manifest(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_yaml(&content)
    }

    /// Expand entries into examples rooted at `examples_dir`, in manifest
    /// order. A path listed twice keeps its first entry.
    pub fn resolve(&self, examples_dir: &Path, layout: &ArtifactLayout) -> E2eResult<Vec<Example>> {
        let root = std::path::absolute(examples_dir)?;
        let mut seen = HashSet::new();
        let mut examples = Vec::new();

        for entry in &self.examples {
            let target = root.join(&entry.path);

            let relpaths = if target.is_dir() {
                walk_examples(&root, &target)
            } else if target.is_file() {
                vec![entry.path.clone()]
            } else {
                return Err(E2eError::Manifest(format!(
                    "example path does not exist: {}",
                    target.display()
                )));
            };

            for relpath in relpaths {
                let kind = match entry.kind {
                    Some(kind) => kind,
                    None => infer_kind(&relpath).ok_or_else(|| {
                        E2eError::Manifest(format!("cannot infer example kind of {}", relpath.display()))
                    })?,
                };

                // Identity is the normalised relative path, not the manifest spelling
                let example = Example::new(&root, relpath, kind, entry.flags(), layout)?;
                if !seen.insert(example.relpath.clone()) {
                    warn!(
                        "{} is listed more than once; keeping the first entry",
                        example.display_name()
                    );
                    continue;
                }
                examples.push(example);
            }
        }

        debug!("Resolved {} example(s) from manifest", examples.len());
        Ok(examples)
    }
}

/// Keep only examples whose relative path contains `pattern`
pub fn filter_examples(examples: Vec<Example>, pattern: &str) -> Vec<Example> {
    examples
        .into_iter()
        .filter(|e| e.display_name().contains(pattern))
        .collect()
}

fn infer_kind(path: &Path) -> Option<ExampleKind> {
    match path.extension()?.to_str()? {
        "py" => Some(ExampleKind::File),
        "ipynb" => Some(ExampleKind::Notebook),
        _ => None,
    }
}

/// Scripts and notebooks under `dir`, sorted, relative to `root`.
/// Names starting with `_` are helpers, not examples.
fn walk_examples(root: &Path, dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('_'))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && infer_kind(e.path()).is_some())
        .filter_map(|e| e.path().strip_prefix(root).ok().map(Path::to_path_buf))
        .collect()
}
