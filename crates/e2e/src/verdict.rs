//! Per-example pipeline states and the final verdict

use serde::{Deserialize, Serialize};

use gallery_common::{DiffScore, ExampleKind, RunOutcome, SnapshotResult};

use crate::diagnostics::DiagnosticLine;

/// Pipeline state of one example
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Pending,
    Running,
    TimedOut,
    ExitFailed,
    ExitedOk,
    Capturing,
    CaptureTimedOut,
    CaptureFailed,
    Captured,
    FetchingReference,
    NoReference,
    ReferenceFetched,
    Diffing,
    Matched,
    Mismatched,
    Done,
}

impl Stage {
    /// Whether the pipeline may move from `self` to `next`.
    ///
    /// Every stage may jump straight to `Done`; that is how skips and
    /// infrastructure errors end a run. Nothing leaves `Done`.
    pub fn can_transition_to(self, next: Stage) -> bool {
        use Stage::*;

        if self == Done {
            return false;
        }
        if next == Done {
            return true;
        }

        matches!(
            (self, next),
            (Pending, Running)
                | (Running, TimedOut)
                | (Running, ExitFailed)
                | (Running, ExitedOk)
                | (ExitedOk, Capturing)
                | (Capturing, CaptureTimedOut)
                | (Capturing, CaptureFailed)
                | (Capturing, Captured)
                | (Captured, FetchingReference)
                | (FetchingReference, NoReference)
                | (FetchingReference, ReferenceFetched)
                | (ReferenceFetched, Diffing)
                | (Diffing, Matched)
                | (Diffing, Mismatched)
        )
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Pending => "pending",
            Stage::Running => "running",
            Stage::TimedOut => "timed_out",
            Stage::ExitFailed => "exit_failed",
            Stage::ExitedOk => "exited_ok",
            Stage::Capturing => "capturing",
            Stage::CaptureTimedOut => "capture_timed_out",
            Stage::CaptureFailed => "capture_failed",
            Stage::Captured => "captured",
            Stage::FetchingReference => "fetching_reference",
            Stage::NoReference => "no_reference",
            Stage::ReferenceFetched => "reference_fetched",
            Stage::Diffing => "diffing",
            Stage::Matched => "matched",
            Stage::Mismatched => "mismatched",
            Stage::Done => "done",
        };
        write!(f, "{}", name)
    }
}

/// Validated walk through the stages, remembering every stage visited
#[derive(Debug, Clone)]
pub struct StageTracker {
    trail: Vec<Stage>,
}

impl StageTracker {
    pub fn new() -> Self {
        Self {
            trail: vec![Stage::Pending],
        }
    }

    pub fn current(&self) -> Stage {
        self.trail.last().copied().unwrap_or(Stage::Pending)
    }

    pub fn advance(&mut self, next: Stage) -> gallery_common::Result<()> {
        let current = self.current();
        if !current.can_transition_to(next) {
            return Err(gallery_common::Error::InvalidStateTransition {
                from: current.to_string(),
                to: next.to_string(),
            });
        }
        self.trail.push(next);
        Ok(())
    }

    /// Last stage before `Done`, i.e. the one that decided the outcome
    pub fn deciding_stage(&self) -> Stage {
        self.trail
            .iter()
            .rev()
            .find(|s| **s != Stage::Done)
            .copied()
            .unwrap_or(Stage::Pending)
    }

    pub fn trail(&self) -> &[Stage] {
        &self.trail
    }
}

impl Default for StageTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Passed,
    Failed,
    Skipped,
}

/// Final decision for one example with everything gathered on the way
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub example: String,
    pub kind: ExampleKind,
    pub outcome: Outcome,

    /// Stage that decided the outcome
    pub stage: Stage,

    /// Every stage visited, ending in `Done`
    pub trail: Vec<Stage>,

    /// Failure or skip reason
    pub reason: Option<String>,

    pub warnings: Vec<String>,
    pub run: Option<RunOutcome>,
    pub snapshot: Option<SnapshotResult>,
    pub diff: Option<DiffScore>,
    pub diagnostics: Vec<DiagnosticLine>,
    pub duration_ms: u64,
}

impl Verdict {
    pub fn passed(&self) -> bool {
        self.outcome == Outcome::Passed
    }

    pub fn failed(&self) -> bool {
        self.outcome == Outcome::Failed
    }
}
