//! Full pipeline runs against real child processes with in-memory capture,
//! reference and diff collaborators.
//!
//! Run with: cargo test --package gallery-e2e --test pipeline

#![cfg(unix)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;

use gallery_common::{
    ConsoleError, DiffScore, Example, ExampleFlags, ExampleKind, RunStatus, SnapshotResult,
};
use gallery_e2e::diagnostics::{Channel, Level};
use gallery_e2e::playwright::{CaptureRequest, SnapshotCapturer};
use gallery_e2e::reference::ReferenceStore;
use gallery_e2e::visual::ImageDiffer;
use gallery_e2e::{DiffMode, E2eResult, HarnessConfig, Outcome, Stage, SuiteResult, SuiteRunner, Verdict};

struct FakeCapturer {
    result: SnapshotResult,
    write_screenshot: bool,
    calls: AtomicUsize,
    requests: Mutex<Vec<CaptureRequest>>,
}

impl FakeCapturer {
    fn returning(result: SnapshotResult) -> Arc<Self> {
        Arc::new(Self {
            result,
            write_screenshot: true,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn ok() -> Arc<Self> {
        Self::returning(SnapshotResult {
            success: true,
            ..Default::default()
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotCapturer for FakeCapturer {
    async fn capture(&self, request: &CaptureRequest) -> E2eResult<SnapshotResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());
        if self.write_screenshot {
            if let Some(parent) = request.output_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&request.output_path, b"generated")?;
        }
        Ok(self.result.clone())
    }
}

struct FakeStore {
    image: Option<Vec<u8>>,
}

#[async_trait]
impl ReferenceStore for FakeStore {
    fn reference_url(&self, example: &Example) -> String {
        format!("https://refs.test/{}", example.artifacts.reference_key)
    }

    async fn fetch(&self, _example: &Example) -> E2eResult<Option<Vec<u8>>> {
        Ok(self.image.clone())
    }
}

struct FakeDiffer {
    raw: f64,
}

impl ImageDiffer for FakeDiffer {
    fn diff(&self, _diff_path: &Path, _generated: &Path, _reference: &Path) -> E2eResult<DiffScore> {
        Ok(DiffScore::from_raw(self.raw)?)
    }
}

struct Gallery {
    dir: TempDir,
    config: HarnessConfig,
}

impl Gallery {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = HarnessConfig::default();
        config.examples_dir = dir.path().join("examples");
        config.artifacts_dir = dir.path().join("out");
        config.launch.interpreter = vec!["sh".to_string()];
        config.launch.notebook_command = vec!["sh".to_string()];
        config.launch.seeded_bootstrap = false;
        config.launch.env.clear();
        config.timeouts.default_secs = 5;
        config.timeouts.slow_secs = 10;
        std::fs::create_dir_all(&config.examples_dir).unwrap();
        Self { dir, config }
    }

    fn example(&self, relpath: &str, body: &str, flags: ExampleFlags) -> Example {
        self.example_of_kind(relpath, body, ExampleKind::File, flags)
    }

    fn example_of_kind(&self, relpath: &str, body: &str, kind: ExampleKind, flags: ExampleFlags) -> Example {
        let path = self.config.examples_dir.join(relpath);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, body).unwrap();
        Example::new(
            &self.config.examples_dir,
            relpath,
            kind,
            flags,
            &self.config.artifact_layout(),
        )
        .unwrap()
    }

    fn runner(&self, capturer: Arc<FakeCapturer>, reference: Option<&[u8]>, raw: f64) -> SuiteRunner {
        SuiteRunner::with_components(
            self.config.clone(),
            capturer,
            Some(Arc::new(FakeStore {
                image: reference.map(<[u8]>::to_vec),
            })),
            Arc::new(FakeDiffer { raw }),
        )
    }
}

fn has_warning(verdict: &Verdict, needle: &str) -> bool {
    verdict.warnings.iter().any(|w| w.contains(needle))
}

fn count_lines(verdict: &Verdict, channel: Channel, level: Level) -> usize {
    verdict
        .diagnostics
        .iter()
        .filter(|l| l.channel == channel && l.level == level)
        .count()
}

#[tokio::test]
async fn test_no_js_example_passes_without_capture() {
    let gallery = Gallery::new();
    let example = gallery.example(
        "models/custom.py",
        "echo drawing\n",
        ExampleFlags {
            no_js: true,
            ..Default::default()
        },
    );
    let capturer = FakeCapturer::ok();
    let runner = gallery.runner(capturer.clone(), Some(b"ref"), 0.0);

    let verdict = runner.run_example(&example).await;

    assert_eq!(verdict.outcome, Outcome::Passed);
    assert_eq!(verdict.stage, Stage::ExitedOk);
    assert!(has_warning(&verdict, "skipping bokehjs for models/custom.py"));
    assert_eq!(capturer.calls(), 0);
    assert_eq!(verdict.trail.last(), Some(&Stage::Done));
}

#[tokio::test]
async fn test_timeout_kills_process_and_keeps_partial_output() {
    let mut gallery = Gallery::new();
    gallery.config.timeouts.default_secs = 1;
    let pid_file = gallery.dir.path().join("pid");
    let example = gallery.example(
        "slow.py",
        &format!("echo $$ > {}\necho started\nsleep 30\n", pid_file.display()),
        ExampleFlags::default(),
    );
    let capturer = FakeCapturer::ok();
    let runner = gallery.runner(capturer.clone(), Some(b"ref"), 0.0);

    let start = Instant::now();
    let verdict = runner.run_example(&example).await;

    assert!(start.elapsed() < Duration::from_secs(10), "run was not bounded by its deadline");
    assert_eq!(verdict.outcome, Outcome::Failed);
    assert_eq!(verdict.stage, Stage::TimedOut);
    assert_eq!(verdict.reason.as_deref(), Some("slow.py timed out"));

    let run = verdict.run.as_ref().unwrap();
    assert_eq!(run.status, RunStatus::Timeout);
    assert!(run.stdout.contains("started"));
    assert_eq!(capturer.calls(), 0);

    let pid: i32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
    let alive = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok();
    assert!(!alive, "timed-out process {} is still running", pid);
}

#[tokio::test]
async fn test_non_zero_exit_fails_before_capture() {
    let gallery = Gallery::new();
    let example = gallery.example("broken.py", "echo oops >&2\nexit 3\n", ExampleFlags::default());
    let capturer = FakeCapturer::ok();
    let runner = gallery.runner(capturer.clone(), Some(b"ref"), 0.0);

    let verdict = runner.run_example(&example).await;

    assert_eq!(verdict.outcome, Outcome::Failed);
    assert_eq!(verdict.stage, Stage::ExitFailed);
    assert_eq!(verdict.reason.as_deref(), Some("broken.py failed to run (exit code 3)"));
    assert_eq!(count_lines(&verdict, Channel::Process, Level::Warn), 1);
    assert_eq!(capturer.calls(), 0);
}

#[tokio::test]
async fn test_missing_reference_passes_with_warning() {
    let gallery = Gallery::new();
    let example = gallery.example("plotting/bar.py", "true\n", ExampleFlags::default());
    let runner = gallery.runner(FakeCapturer::ok(), None, 0.0);

    let verdict = runner.run_example(&example).await;

    assert_eq!(verdict.outcome, Outcome::Passed);
    assert_eq!(verdict.stage, Stage::NoReference);
    assert!(has_warning(
        &verdict,
        "reference image https://refs.test/master/plotting/bar.png doesn't exist"
    ));
    assert!(verdict.diff.is_none());
}

#[tokio::test]
async fn test_unconfigured_reference_source_passes_with_warning() {
    let gallery = Gallery::new();
    let example = gallery.example("plotting/bar.py", "true\n", ExampleFlags::default());
    let runner = SuiteRunner::with_components(
        gallery.config.clone(),
        FakeCapturer::ok(),
        None,
        Arc::new(FakeDiffer { raw: 0.0 }),
    );

    let verdict = runner.run_example(&example).await;

    assert_eq!(verdict.outcome, Outcome::Passed);
    assert_eq!(verdict.stage, Stage::NoReference);
    assert!(has_warning(&verdict, "no reference source configured for plotting/bar.py"));
    assert!(!has_warning(&verdict, "doesn't exist"));
}

#[tokio::test]
async fn test_dimension_mismatch_fails() {
    let gallery = Gallery::new();
    let example = gallery.example("plotting/bar.py", "true\n", ExampleFlags::default());
    let runner = gallery.runner(FakeCapturer::ok(), Some(b"reference-bytes"), -1.0);

    let verdict = runner.run_example(&example).await;

    assert_eq!(verdict.outcome, Outcome::Failed);
    assert_eq!(verdict.stage, Stage::Mismatched);
    assert_eq!(
        verdict.reason.as_deref(),
        Some("generated and reference images differ: dimensions don't match")
    );
    assert_eq!(verdict.diff, Some(DiffScore::DimensionMismatch));

    // The fetched reference is kept next to the generated image
    assert_eq!(std::fs::read(&example.artifacts.reference).unwrap(), b"reference-bytes");
}

#[tokio::test]
async fn test_pixel_difference_fails_with_percentage() {
    let gallery = Gallery::new();
    let example = gallery.example("plotting/line.py", "true\n", ExampleFlags::default());
    let runner = gallery.runner(FakeCapturer::ok(), Some(b"ref"), 2.5);

    let verdict = runner.run_example(&example).await;

    assert_eq!(verdict.outcome, Outcome::Failed);
    assert_eq!(
        verdict.reason.as_deref(),
        Some("generated and reference images differ: 2.50% of pixels")
    );
}

#[tokio::test]
async fn test_advisory_mode_only_warns_on_difference() {
    let mut gallery = Gallery::new();
    gallery.config.diff.mode = DiffMode::Advisory;
    let example = gallery.example("plotting/line.py", "true\n", ExampleFlags::default());
    let runner = gallery.runner(FakeCapturer::ok(), Some(b"ref"), 2.5);

    let verdict = runner.run_example(&example).await;

    assert_eq!(verdict.outcome, Outcome::Passed);
    assert_eq!(verdict.stage, Stage::Mismatched);
    assert!(has_warning(&verdict, "2.50% of pixels"));
}

#[tokio::test]
async fn test_console_errors_are_diagnostics_only() {
    let gallery = Gallery::new();
    let example = gallery.example("plotting/scatter.py", "true\n", ExampleFlags::default());
    let errors = (1..=3)
        .map(|i| ConsoleError {
            text: format!("TypeError #{}", i),
            trace: vec![],
        })
        .collect();
    let capturer = FakeCapturer::returning(SnapshotResult {
        success: true,
        errors,
        ..Default::default()
    });
    let runner = gallery.runner(capturer, Some(b"ref"), 0.0);

    let verdict = runner.run_example(&example).await;

    assert_eq!(verdict.outcome, Outcome::Passed);
    assert_eq!(verdict.stage, Stage::Matched);
    assert_eq!(count_lines(&verdict, Channel::Console, Level::Fail), 3);
    assert!(verdict
        .diagnostics
        .iter()
        .any(|l| l.level == Level::Ok && l.text == "generated and reference images match"));
}

#[tokio::test]
async fn test_capture_timeout_fails_even_when_successful() {
    let gallery = Gallery::new();
    let example = gallery.example("plotting/heavy.py", "true\n", ExampleFlags::default());
    let capturer = FakeCapturer::returning(SnapshotResult {
        success: true,
        timeout: true,
        ..Default::default()
    });
    let runner = gallery.runner(capturer, Some(b"ref"), 0.0);

    let verdict = runner.run_example(&example).await;

    assert_eq!(verdict.outcome, Outcome::Failed);
    assert_eq!(verdict.stage, Stage::CaptureTimedOut);
    assert_eq!(
        verdict.reason.as_deref(),
        Some("plotting/heavy.py: capture timed out after 30000 ms")
    );
    assert!(verdict
        .diagnostics
        .iter()
        .any(|l| l.text == "TIMEOUT: bokehjs did not finish in 30000 ms"));
}

#[tokio::test]
async fn test_capture_failure_fails() {
    let gallery = Gallery::new();
    let example = gallery.example("plotting/blank.py", "true\n", ExampleFlags::default());
    let runner = gallery.runner(FakeCapturer::returning(SnapshotResult::default()), Some(b"ref"), 0.0);

    let verdict = runner.run_example(&example).await;

    assert_eq!(verdict.outcome, Outcome::Failed);
    assert_eq!(verdict.stage, Stage::CaptureFailed);
    assert_eq!(verdict.reason.as_deref(), Some("Example failed to load"));
}

#[tokio::test]
async fn test_missing_screenshot_fails_before_diff() {
    let gallery = Gallery::new();
    let example = gallery.example("plotting/bar.py", "true\n", ExampleFlags::default());
    let capturer = Arc::new(FakeCapturer {
        result: SnapshotResult {
            success: true,
            ..Default::default()
        },
        write_screenshot: false,
        calls: AtomicUsize::new(0),
        requests: Mutex::new(Vec::new()),
    });
    let runner = gallery.runner(capturer, Some(b"ref"), 0.0);

    let verdict = runner.run_example(&example).await;

    assert_eq!(verdict.outcome, Outcome::Failed);
    assert_eq!(verdict.stage, Stage::ReferenceFetched);
    assert!(verdict.reason.unwrap().contains("is missing"));
}

#[tokio::test]
async fn test_skip_flags_and_served_pages() {
    let gallery = Gallery::new();
    let marker = gallery.dir.path().join("ran");
    let skipped = gallery.example(
        "skipped.py",
        &format!("touch {}\n", marker.display()),
        ExampleFlags {
            is_skip: true,
            ..Default::default()
        },
    );
    let served = gallery.example_of_kind("app/sliders.py", "true\n", ExampleKind::Server, ExampleFlags::default());
    let capturer = FakeCapturer::ok();
    let runner = gallery.runner(capturer.clone(), Some(b"ref"), 0.0);

    let verdict = runner.run_example(&skipped).await;
    assert_eq!(verdict.outcome, Outcome::Skipped);
    assert_eq!(verdict.reason.as_deref(), Some("skipping skipped.py"));
    assert_eq!(verdict.trail, vec![Stage::Pending, Stage::Done]);
    assert!(!marker.exists());

    let verdict = runner.run_example(&served).await;
    assert_eq!(verdict.outcome, Outcome::Skipped);
    assert!(verdict.reason.unwrap().contains("served-page examples are not supported"));
    assert_eq!(capturer.calls(), 0);
}

#[tokio::test]
async fn test_diff_disabled_per_example_and_globally() {
    let mut gallery = Gallery::new();
    let no_diff = gallery.example(
        "a.py",
        "true\n",
        ExampleFlags {
            no_diff: true,
            ..Default::default()
        },
    );
    let runner = gallery.runner(FakeCapturer::ok(), Some(b"ref"), 2.5);
    let verdict = runner.run_example(&no_diff).await;
    assert_eq!(verdict.outcome, Outcome::Passed);
    assert_eq!(verdict.stage, Stage::Captured);
    assert!(has_warning(&verdict, "skipping image diff for a.py"));

    gallery.config.diff.mode = DiffMode::Off;
    let plain = gallery.example("b.py", "true\n", ExampleFlags::default());
    let runner = gallery.runner(FakeCapturer::ok(), Some(b"ref"), 2.5);
    let verdict = runner.run_example(&plain).await;
    assert_eq!(verdict.outcome, Outcome::Passed);
    assert!(verdict.diff.is_none());
}

#[tokio::test]
async fn test_process_output_becomes_diagnostics() {
    let gallery = Gallery::new();
    let example = gallery.example(
        "a.py",
        "echo 'Wrote a.html'\necho drawing\necho careful >&2\n",
        ExampleFlags {
            no_js: true,
            ..Default::default()
        },
    );
    let runner = gallery.runner(FakeCapturer::ok(), None, 0.0);

    let verdict = runner.run_example(&example).await;

    let process: Vec<&str> = verdict
        .diagnostics
        .iter()
        .filter(|l| l.channel == Channel::Process)
        .map(|l| l.text.as_str())
        .collect();
    assert!(process.contains(&"drawing"));
    assert!(process.contains(&"careful"));
    assert!(!process.iter().any(|t| t.starts_with("Wrote ")));
    assert!(verdict.diagnostics.iter().any(|l| l.text.starts_with("Example run in ")));
}

#[tokio::test]
async fn test_notebook_capture_uses_notebook_server() {
    let gallery = Gallery::new();
    let example = gallery.example_of_kind(
        "howto/intro.ipynb",
        "true\n",
        ExampleKind::Notebook,
        ExampleFlags::default(),
    );
    let capturer = FakeCapturer::ok();
    let runner = gallery.runner(capturer.clone(), None, 0.0);

    let verdict = runner.run_example(&example).await;

    assert_eq!(verdict.outcome, Outcome::Passed);
    let requests = capturer.requests.lock();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].height, 2_000);
    assert_eq!(
        requests[0].url,
        "http://localhost:6007/notebooks/examples/howto/intro.ipynb"
    );
}

#[tokio::test]
async fn test_suite_keeps_order_and_writes_results() {
    let mut gallery = Gallery::new();
    gallery.config.jobs = 3;
    let examples = vec![
        gallery.example("a.py", "sleep 1\n", ExampleFlags::default()),
        gallery.example("b.py", "exit 1\n", ExampleFlags::default()),
        gallery.example("c.py", "true\n", ExampleFlags::default()),
        gallery.example(
            "d.py",
            "true\n",
            ExampleFlags {
                is_skip: true,
                ..Default::default()
            },
        ),
        gallery.example("e.py", "true\n", ExampleFlags::default()),
    ];
    let runner = gallery.runner(FakeCapturer::ok(), Some(b"ref"), 0.0);

    let result = runner.run_all(&examples).await;

    let names: Vec<&str> = result.verdicts.iter().map(|v| v.example.as_str()).collect();
    assert_eq!(names, ["a.py", "b.py", "c.py", "d.py", "e.py"]);
    assert_eq!((result.total, result.passed, result.failed, result.skipped), (5, 3, 1, 1));
    assert!(!result.success());

    let path = runner.write_results(&result).unwrap();
    assert_eq!(path, gallery.config.artifacts_dir.join("results.json"));
    let written: SuiteResult = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(written.failed, 1);
    assert_eq!(written.verdicts[1].reason.as_deref(), Some("b.py failed to run (exit code 1)"));
}
