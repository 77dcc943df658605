//! Per-channel diagnostic lines collected while an example runs
//!
//! Lines are kept on the verdict and also emitted through `tracing` as they
//! are recorded, labelled `PY` for the example process and `JS` for the
//! browser. None of them decide pass/fail.

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use gallery_common::{RunOutcome, SnapshotResult};

/// Source of a diagnostic line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Example process stdout/stderr
    Process,
    /// Browser console messages and uncaught errors
    Console,
    /// Browser resource loads
    Resource,
    /// The harness itself
    Pipeline,
}

impl Channel {
    pub fn label(&self) -> &'static str {
        match self {
            Channel::Process => "PY",
            Channel::Console | Channel::Resource => "JS",
            Channel::Pipeline => "--",
        }
    }

    fn is_browser(&self) -> bool {
        matches!(self, Channel::Console | Channel::Resource)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Info,
    Ok,
    Warn,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticLine {
    pub channel: Channel,
    pub level: Level,
    pub text: String,
}

/// Ordered diagnostics for one example
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Diagnostics {
    lines: Vec<DiagnosticLine>,

    #[serde(skip)]
    verbose: bool,
}

impl Diagnostics {
    pub fn new(verbose: bool) -> Self {
        Self {
            lines: Vec::new(),
            verbose,
        }
    }

    pub fn push(&mut self, channel: Channel, level: Level, text: impl Into<String>) {
        let line = DiagnosticLine {
            channel,
            level,
            text: text.into(),
        };
        self.emit(&line);
        self.lines.push(line);
    }

    pub fn info(&mut self, channel: Channel, text: impl Into<String>) {
        self.push(channel, Level::Info, text);
    }

    pub fn ok(&mut self, channel: Channel, text: impl Into<String>) {
        self.push(channel, Level::Ok, text);
    }

    pub fn warn(&mut self, channel: Channel, text: impl Into<String>) {
        self.push(channel, Level::Warn, text);
    }

    pub fn fail(&mut self, channel: Channel, text: impl Into<String>) {
        self.push(channel, Level::Fail, text);
    }

    /// Record process output: stdout lines as info (minus the `Wrote ...`
    /// noise every example prints), stderr lines as warnings
    pub fn record_process_output(&mut self, outcome: &RunOutcome) {
        for line in outcome.stdout.lines() {
            if line.is_empty() || line.starts_with("Wrote ") {
                continue;
            }
            self.info(Channel::Process, line);
        }

        for line in outcome.stderr.lines() {
            if line.is_empty() {
                continue;
            }
            self.warn(Channel::Process, line);
        }
    }

    /// Record every message, resource result and error the browser reported
    pub fn record_snapshot(&mut self, snapshot: &SnapshotResult) {
        for message in &snapshot.messages {
            let text = match (&message.source, message.line) {
                (Some(source), Some(line)) => format!("{}:{}: {}", source, line, message.text),
                _ => message.text.clone(),
            };
            self.info(Channel::Console, text);
        }

        for resource in &snapshot.resources {
            if resource.url.ends_with(".png") {
                self.ok(
                    Channel::Resource,
                    format!("{}: {} ({})", resource.url, resource.status_label(), resource.status_text),
                );
            } else {
                self.fail(
                    Channel::Resource,
                    format!(
                        "Resource error:: {}: {} ({})",
                        resource.url,
                        resource.status_label(),
                        resource.status_text
                    ),
                );
            }
        }

        for err in &snapshot.errors {
            self.fail(Channel::Console, err.text.clone());
            for frame in &err.trace {
                if let (Some(file), Some(line)) = (&frame.file, frame.line) {
                    self.fail(Channel::Console, format!("  {}: {}", file, line));
                }
            }
        }
    }

    pub fn lines(&self) -> &[DiagnosticLine] {
        &self.lines
    }

    pub fn count(&self, channel: Channel, level: Level) -> usize {
        self.lines
            .iter()
            .filter(|l| l.channel == channel && l.level == level)
            .count()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines.iter().any(|l| l.text.contains(needle))
    }

    pub fn into_lines(self) -> Vec<DiagnosticLine> {
        self.lines
    }

    fn emit(&self, line: &DiagnosticLine) {
        let label = line.channel.label();
        match line.level {
            Level::Fail => error!(label, "{}", line.text),
            Level::Warn => warn!(label, "{}", line.text),
            _ if line.channel.is_browser() && !self.verbose => debug!(label, "{}", line.text),
            Level::Ok => info!(label, "✓ {}", line.text),
            Level::Info => info!(label, "{}", line.text),
        }
    }
}
