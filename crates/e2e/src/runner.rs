//! Suite runner: drives each example through run, capture, reference
//! fetch and diff, and aggregates the verdicts

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use gallery_common::{DiffScore, Example, ExampleKind, RunOutcome, RunStatus, SnapshotResult};

use crate::config::{DiffMode, HarnessConfig};
use crate::diagnostics::{Channel, Diagnostics};
use crate::error::E2eResult;
use crate::playwright::{screenshot_exists, BrowserCapturer, CaptureRequest, SnapshotCapturer};
use crate::process::ProcessRunner;
use crate::reference::{persist_reference, store_from_config, ReferenceStore};
use crate::verdict::{Outcome, Stage, StageTracker, Verdict};
use crate::visual::{ImageDiffer, PixelDiffer};

/// Result of running a whole suite
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteResult {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub verdicts: Vec<Verdict>,
}

impl SuiteResult {
    pub fn from_verdicts(verdicts: Vec<Verdict>, started_at: DateTime<Utc>, duration: Duration) -> Self {
        let count = |outcome: Outcome| verdicts.iter().filter(|v| v.outcome == outcome).count();

        Self {
            total: verdicts.len(),
            passed: count(Outcome::Passed),
            failed: count(Outcome::Failed),
            skipped: count(Outcome::Skipped),
            duration_ms: duration.as_millis() as u64,
            started_at,
            verdicts,
        }
    }

    pub fn success(&self) -> bool {
        self.failed == 0
    }
}

/// Drives examples through the pipeline
pub struct SuiteRunner {
    config: HarnessConfig,
    processes: ProcessRunner,
    capturer: Arc<dyn SnapshotCapturer>,
    references: Option<Arc<dyn ReferenceStore>>,
    differ: Arc<dyn ImageDiffer>,
}

impl SuiteRunner {
    /// Runner with the Playwright capturer, the configured reference store
    /// and the pixel differ
    pub fn new(config: HarnessConfig) -> E2eResult<Self> {
        config.validate()?;

        let capturer: Arc<dyn SnapshotCapturer> = Arc::new(BrowserCapturer::new(&config.capture));
        let references: Option<Arc<dyn ReferenceStore>> = store_from_config(&config.reference)?.map(Arc::from);
        let differ: Arc<dyn ImageDiffer> = Arc::new(PixelDiffer::new(config.diff.tolerance));

        Ok(Self::with_components(config, capturer, references, differ))
    }

    /// Runner with explicit collaborators
    pub fn with_components(
        config: HarnessConfig,
        capturer: Arc<dyn SnapshotCapturer>,
        references: Option<Arc<dyn ReferenceStore>>,
        differ: Arc<dyn ImageDiffer>,
    ) -> Self {
        let processes = ProcessRunner::new(config.launch.clone(), config.timeouts.clone());
        Self {
            config,
            processes,
            capturer,
            references,
            differ,
        }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Run every example, at most `jobs` at a time. Verdicts come back in
    /// input order and one example's failure never stops the others.
    pub async fn run_all(&self, examples: &[Example]) -> SuiteResult {
        let started_at = Utc::now();
        let start = Instant::now();
        let jobs = self.config.jobs.max(1);

        info!("Running {} example(s) with {} job(s)...", examples.len(), jobs);

        let verdicts: Vec<Verdict> = stream::iter(examples)
            .map(|example| self.run_example(example))
            .buffered(jobs)
            .collect()
            .await;

        let result = SuiteResult::from_verdicts(verdicts, started_at, start.elapsed());

        info!(
            "Results: {} passed, {} failed, {} skipped ({} ms)",
            result.passed, result.failed, result.skipped, result.duration_ms
        );

        result
    }

    /// Run one example to its verdict. Never fails: infrastructure errors
    /// become a failed verdict for this example.
    pub async fn run_example(&self, example: &Example) -> Verdict {
        let start = Instant::now();
        let name = example.display_name();
        info!("Running {} ({})", name, example.kind);

        let mut run = ExampleRun::new(example, self.config.verbose);
        if let Err(e) = self.drive(&mut run).await {
            run.fail(format!("{}: {}", name, e));
        }
        if let Err(e) = run.tracker.advance(Stage::Done) {
            warn!("{}: {}", name, e);
        }

        let verdict = run.into_verdict(start.elapsed());
        match verdict.outcome {
            Outcome::Passed => info!("✓ {} ({} ms)", verdict.example, verdict.duration_ms),
            Outcome::Failed => error!(
                "✗ {} - {}",
                verdict.example,
                verdict.reason.as_deref().unwrap_or("unknown error")
            ),
            Outcome::Skipped => info!(
                "- {} ({})",
                verdict.example,
                verdict.reason.as_deref().unwrap_or("skipped")
            ),
        }
        verdict
    }

    async fn drive(&self, run: &mut ExampleRun<'_>) -> E2eResult<()> {
        let example = run.example;
        let name = example.display_name();

        if example.flags.is_skip {
            run.skip(format!("skipping {}", name));
            return Ok(());
        }
        if example.kind == ExampleKind::Server {
            run.skip(format!("skipping {}: served-page examples are not supported", name));
            return Ok(());
        }

        // Run the example process
        run.tracker.advance(Stage::Running)?;
        let timeout = self.processes.timeout_for(example);
        let outcome = self.processes.run(example, timeout).await?;
        run.diagnostics.info(
            Channel::Pipeline,
            format!("Example run in {:.3}s", outcome.duration.as_secs_f64()),
        );
        run.diagnostics.record_process_output(&outcome);
        let status = outcome.status;
        run.run = Some(outcome);

        match status {
            RunStatus::Timeout => {
                run.tracker.advance(Stage::TimedOut)?;
                run.fail(format!("{} timed out", name));
                return Ok(());
            }
            RunStatus::Exited(0) => run.tracker.advance(Stage::ExitedOk)?,
            RunStatus::Exited(code) => {
                run.tracker.advance(Stage::ExitFailed)?;
                run.fail(format!("{} failed to run (exit code {})", name, code));
                return Ok(());
            }
        }

        if example.flags.no_js {
            run.warn(format!("skipping bokehjs for {}", name));
            return Ok(());
        }

        // Capture the rendered page
        run.tracker.advance(Stage::Capturing)?;
        let request = self.capture_request(example);
        let started = Instant::now();
        let snapshot = self.capturer.capture(&request).await?;
        run.diagnostics.info(
            Channel::Pipeline,
            format!("Example rendered in {:.3}s", started.elapsed().as_secs_f64()),
        );
        if snapshot.timeout {
            run.diagnostics.warn(
                Channel::Pipeline,
                format!("TIMEOUT: bokehjs did not finish in {} ms", request.wait_ms),
            );
        }
        run.diagnostics.record_snapshot(&snapshot);

        let (timed_out, failed, error_count) = (snapshot.timeout, snapshot.is_failure(), snapshot.errors.len());
        run.snapshot = Some(snapshot);

        if timed_out {
            run.tracker.advance(Stage::CaptureTimedOut)?;
            run.fail(format!("{}: capture timed out after {} ms", name, request.wait_ms));
            return Ok(());
        }
        if failed {
            run.tracker.advance(Stage::CaptureFailed)?;
            run.fail("Example failed to load".to_string());
            return Ok(());
        }
        run.tracker.advance(Stage::Captured)?;

        if error_count > 0 {
            run.warn(format!("{} reported {} browser error(s)", name, error_count));
        }

        if example.flags.no_diff || self.config.diff.mode == DiffMode::Off {
            run.warn(format!("skipping image diff for {}", name));
            return Ok(());
        }

        // Fetch the reference image
        run.tracker.advance(Stage::FetchingReference)?;
        run.diagnostics.info(
            Channel::Pipeline,
            format!("generated image: {}", example.artifacts.generated.display()),
        );

        let Some(store) = &self.references else {
            run.tracker.advance(Stage::NoReference)?;
            run.warn(format!("no reference source configured for {}", name));
            return Ok(());
        };

        let Some(bytes) = store.fetch(example).await? else {
            run.tracker.advance(Stage::NoReference)?;
            run.warn(format!("reference image {} doesn't exist", store.reference_url(example)));
            return Ok(());
        };

        persist_reference(&example.artifacts.reference, &bytes).await?;
        run.diagnostics.info(
            Channel::Pipeline,
            format!("saved reference: {}", example.artifacts.reference.display()),
        );
        run.tracker.advance(Stage::ReferenceFetched)?;

        if !screenshot_exists(&example.artifacts.generated) {
            run.fail(format!(
                "{}: generated image {} is missing",
                name,
                example.artifacts.generated.display()
            ));
            return Ok(());
        }

        // Diff generated against reference
        run.tracker.advance(Stage::Diffing)?;
        let differ = Arc::clone(&self.differ);
        let paths = example.artifacts.clone();
        let score = tokio::task::spawn_blocking(move || differ.diff(&paths.diff, &paths.generated, &paths.reference))
            .await??;
        run.diff = Some(score);

        if score.is_match() {
            run.tracker.advance(Stage::Matched)?;
            run.diagnostics.ok(Channel::Pipeline, "generated and reference images match");
        } else {
            run.tracker.advance(Stage::Mismatched)?;
            let message = format!("generated and reference images differ: {}", score.describe());
            match self.config.diff.mode {
                DiffMode::Enforce => run.fail(message),
                DiffMode::Advisory | DiffMode::Off => run.warn(message),
            }
        }

        Ok(())
    }

    /// Capture parameters for an example, by kind
    pub fn capture_request(&self, example: &Example) -> CaptureRequest {
        let capture = &self.config.capture;

        let (url, height) = match example.kind {
            ExampleKind::File => (file_url(&example.html_path()), capture.height),
            ExampleKind::Server => (server_url(&self.config.server.url, example), capture.height),
            ExampleKind::Notebook => (
                notebook_url(self.config.notebook.port, &example.path),
                capture.notebook_height,
            ),
        };

        CaptureRequest {
            url,
            output_path: example.artifacts.generated.clone(),
            quality: capture.quality,
            wait_ms: capture.wait_ms,
            poll_interval_ms: capture.poll_interval_ms,
            width: capture.width,
            height,
        }
    }

    /// Write suite results as JSON under the artifacts directory
    pub fn write_results(&self, results: &SuiteResult) -> E2eResult<PathBuf> {
        std::fs::create_dir_all(&self.config.artifacts_dir)?;

        let path = self.config.results_path();
        let json = serde_json::to_string_pretty(results)?;
        std::fs::write(&path, json)?;

        info!("Results written to: {}", path.display());
        Ok(path)
    }
}

/// Mutable state of one example while it moves through the pipeline
struct ExampleRun<'a> {
    example: &'a Example,
    tracker: StageTracker,
    diagnostics: Diagnostics,
    warnings: Vec<String>,
    failure: Option<String>,
    skipped: Option<String>,
    run: Option<RunOutcome>,
    snapshot: Option<SnapshotResult>,
    diff: Option<DiffScore>,
}

impl<'a> ExampleRun<'a> {
    fn new(example: &'a Example, verbose: bool) -> Self {
        Self {
            example,
            tracker: StageTracker::new(),
            diagnostics: Diagnostics::new(verbose),
            warnings: Vec::new(),
            failure: None,
            skipped: None,
            run: None,
            snapshot: None,
            diff: None,
        }
    }

    fn warn(&mut self, message: String) {
        self.diagnostics.warn(Channel::Pipeline, message.clone());
        self.warnings.push(message);
    }

    fn fail(&mut self, message: String) {
        self.diagnostics.fail(Channel::Pipeline, message.clone());
        // The first failure decides; later ones are only diagnostics
        if self.failure.is_none() {
            self.failure = Some(message);
        }
    }

    fn skip(&mut self, message: String) {
        self.diagnostics.warn(Channel::Pipeline, message.clone());
        self.skipped = Some(message);
    }

    fn into_verdict(self, duration: Duration) -> Verdict {
        let (outcome, reason) = match (self.failure, self.skipped) {
            (Some(failure), _) => (Outcome::Failed, Some(failure)),
            (None, Some(skip)) => (Outcome::Skipped, Some(skip)),
            (None, None) => (Outcome::Passed, None),
        };

        Verdict {
            example: self.example.display_name(),
            kind: self.example.kind,
            outcome,
            stage: self.tracker.deciding_stage(),
            trail: self.tracker.trail().to_vec(),
            reason,
            warnings: self.warnings,
            run: self.run,
            snapshot: self.snapshot,
            diff: self.diff,
            diagnostics: self.diagnostics.into_lines(),
            duration_ms: duration.as_millis() as u64,
        }
    }
}

pub fn file_url(path: &Path) -> String {
    format!("file://{}", path.display())
}

/// Notebook server URL: the path from the last `examples` directory down
pub fn notebook_url(port: u16, path: &Path) -> String {
    let parts: Vec<String> = path
        .components()
        .filter_map(|c| match c {
            std::path::Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();

    let start = parts
        .iter()
        .rposition(|p| p == "examples")
        .unwrap_or_else(|| parts.len().saturating_sub(1));

    format!("http://localhost:{}/notebooks/{}", port, parts[start..].join("/"))
}

/// Served-page URL. Sessions on the server are random, so this URL does
/// not reliably reach the example's document.
pub fn server_url(base: &str, example: &Example) -> String {
    format!("{}/?bokeh-session-id={}", base.trim_end_matches('/'), example.name())
}
