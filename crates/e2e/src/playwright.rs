//! Headless snapshot capture through Playwright
//!
//! `BrowserCapturer` generates a small node script per capture, runs it
//! under the process deadline machinery and reads back one JSON report
//! line from its stdout. The report is parsed straight into the typed
//! `SnapshotResult` records, so malformed reports are rejected here and
//! never reach the verdict logic.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use gallery_common::SnapshotResult;

use crate::config::CaptureConfig;
use crate::error::{E2eError, E2eResult};
use crate::process::{run_with_deadline, CommandSpec};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Browser {
    #[default]
    Chromium,
    Firefox,
    Webkit,
}

impl Browser {
    fn as_str(&self) -> &'static str {
        match self {
            Browser::Chromium => "chromium",
            Browser::Firefox => "firefox",
            Browser::Webkit => "webkit",
        }
    }
}

/// Parameters of a single capture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    pub url: String,
    pub output_path: PathBuf,
    /// JPEG quality, only used when `output_path` is a JPEG
    pub quality: u8,
    /// Render budget; readiness is polled until this runs out
    pub wait_ms: u64,
    pub poll_interval_ms: u64,
    pub width: u32,
    pub height: u32,
}

impl CaptureRequest {
    fn is_jpeg(&self) -> bool {
        self.output_path
            .extension()
            .map(|e| e.eq_ignore_ascii_case("jpg") || e.eq_ignore_ascii_case("jpeg"))
            .unwrap_or(false)
    }
}

/// Produces a screenshot plus browser diagnostics for a URL
#[async_trait]
pub trait SnapshotCapturer: Send + Sync {
    async fn capture(&self, request: &CaptureRequest) -> E2eResult<SnapshotResult>;
}

/// Playwright-backed capturer
#[derive(Debug, Clone)]
pub struct BrowserCapturer {
    tool: Vec<String>,
    node_path: Option<PathBuf>,
    browser: Browser,
    ready_expression: String,
    grace: Duration,
}

impl BrowserCapturer {
    pub fn new(config: &CaptureConfig) -> Self {
        Self {
            tool: config.tool.clone(),
            node_path: config.node_path.clone(),
            browser: config.browser,
            ready_expression: config.ready_expression.clone(),
            grace: Duration::from_millis(config.grace_ms),
        }
    }

    /// Build the node script for one capture
    pub fn build_script(&self, request: &CaptureRequest) -> String {
        let screenshot_options = if request.is_jpeg() {
            format!(
                "{{ path: {}, type: 'jpeg', quality: {} }}",
                js_string(&request.output_path.to_string_lossy()),
                request.quality.min(100)
            )
        } else {
            format!("{{ path: {} }}", js_string(&request.output_path.to_string_lossy()))
        };

        format!(
            r#"
const {{ {browser} }} = require('playwright');

function parseStack(stack) {{
  return String(stack || '').split('\n').slice(1).map((frame) => {{
    const m = frame.match(/\(?([^()\s]+):(\d+):\d+\)?\s*$/);
    return m ? {{ file: m[1], line: Number(m[2]) }} : {{ file: null, line: null }};
  }});
}}

(async () => {{
  const report = {{ success: false, timeout: false, messages: [], errors: [], resources: [] }};
  let browser;
  try {{
    browser = await {browser}.launch({{ headless: true }});
    const context = await browser.newContext({{ viewport: {{ width: {width}, height: {height} }} }});
    const page = await context.newPage();

    page.on('console', (msg) => {{
      const loc = msg.location() || {{}};
      report.messages.push({{
        text: msg.text(),
        source: loc.url || null,
        line: loc.url ? loc.lineNumber : null,
      }});
    }});
    page.on('pageerror', (err) => {{
      report.errors.push({{ text: String(err.message || err), trace: parseStack(err.stack) }});
    }});
    page.on('requestfailed', (req) => {{
      const failure = req.failure();
      report.resources.push({{ url: req.url(), status: null, status_text: failure ? failure.errorText : 'failed' }});
    }});
    page.on('response', (res) => {{
      if (res.status() >= 400) {{
        report.resources.push({{ url: res.url(), status: res.status(), status_text: res.statusText() }});
      }}
    }});

    const deadline = Date.now() + {wait_ms};
    await page.goto({url}, {{ timeout: {wait_ms} }});

    let ready = false;
    while (!ready && Date.now() < deadline) {{
      ready = await page.evaluate(() => Boolean({ready})).catch(() => false);
      if (!ready) {{
        await page.waitForTimeout({poll_ms});
      }}
    }}
    report.timeout = !ready;

    await page.screenshot({screenshot});
    report.success = true;
  }} catch (error) {{
    if (error && error.name === 'TimeoutError') {{
      report.timeout = true;
    }}
    report.errors.push({{ text: String((error && error.message) || error), trace: parseStack(error && error.stack) }});
  }} finally {{
    if (browser) {{
      await browser.close().catch(() => {{}});
    }}
    console.log(JSON.stringify(report));
  }}
}})();
"#,
            browser = self.browser.as_str(),
            width = request.width,
            height = request.height,
            wait_ms = request.wait_ms,
            poll_ms = request.poll_interval_ms,
            url = js_string(&request.url),
            ready = self.ready_expression,
            screenshot = screenshot_options,
        )
    }

    /// Extract the report from the tool's stdout. The report is the last
    /// line that parses as a JSON object; anything else is ignored.
    pub fn parse_report(stdout: &str) -> E2eResult<SnapshotResult> {
        let line = stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| l.starts_with('{'))
            .ok_or_else(|| E2eError::CaptureReport("no JSON report on stdout".to_string()))?;

        serde_json::from_str(line).map_err(|e| E2eError::CaptureReport(e.to_string()))
    }
}

#[async_trait]
impl SnapshotCapturer for BrowserCapturer {
    async fn capture(&self, request: &CaptureRequest) -> E2eResult<SnapshotResult> {
        if let Some(parent) = request.output_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let temp_dir = tempfile::tempdir()?;
        let script_path = temp_dir.path().join("capture.js");
        tokio::fs::write(&script_path, self.build_script(request)).await?;

        let mut spec = CommandSpec::from_argv(&self.tool)?
            .arg(script_path.to_string_lossy())
            .current_dir(temp_dir.path());
        if let Some(node_path) = &self.node_path {
            spec = spec.env("NODE_PATH", node_path.to_string_lossy());
        }

        debug!(url = %request.url, "Capturing snapshot");
        let deadline = Duration::from_millis(request.wait_ms) + self.grace;
        let outcome = run_with_deadline(&spec, deadline).await?;

        if outcome.status.is_timeout() {
            warn!(url = %request.url, "Capture tool exceeded {:?}", deadline);
            return Ok(SnapshotResult::timed_out());
        }

        match Self::parse_report(&outcome.stdout) {
            Ok(result) => Ok(result),
            Err(_) if !outcome.status.is_success() => Err(E2eError::Capture(format!(
                "{} exited with {}: {}",
                spec.program,
                outcome.status,
                outcome.stderr.trim()
            ))),
            Err(e) => Err(e),
        }
    }
}

fn js_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

/// Whether the capture output file looks like a usable image
pub fn screenshot_exists(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}
