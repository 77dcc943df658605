//! Example process execution with a hard deadline
//!
//! Every child runs in its own process group with piped stdout/stderr.
//! Waiting on the child races against the deadline; when the deadline
//! wins, the whole group is killed and reaped, and whatever output was
//! produced so far is still returned.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use gallery_common::{Example, ExampleKind, RunOutcome, RunStatus};

use crate::config::{LaunchConfig, TimeoutConfig};
use crate::error::{E2eError, E2eResult};

/// How long output readers may keep going after the child is gone
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// A fully resolved command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
        }
    }

    /// Build from an argv list such as `["python", "-u"]`
    pub fn from_argv(argv: &[String]) -> E2eResult<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| E2eError::Config("empty command line".to_string()))?;
        Ok(Self::new(program.clone()).args(args.iter().cloned()))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, vars: &BTreeMap<String, String>) -> Self {
        self.env.extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.contains('\n') {
                write!(f, " <script>")?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Python bootstrap that seeds the random generators before running the
/// example with `__file__` pointing at it
pub fn bootstrap_code(path: &Path) -> String {
    // A JSON string literal is also a valid Python string literal.
    let literal = serde_json::Value::String(path.to_string_lossy().into_owned()).to_string();
    format!(
        r#"__file__ = filename = {literal}

import random
random.seed(1)

import numpy as np
np.random.seed(1)

import warnings
warnings.filterwarnings("ignore", ".*", UserWarning, "matplotlib.font_manager")

with open(filename, 'rb') as example:
    exec(compile(example.read(), filename, 'exec'))
"#
    )
}

/// Command line for an example, run from the example's directory
pub fn launch_command(example: &Example, launch: &LaunchConfig) -> E2eResult<CommandSpec> {
    let path = example.path.to_string_lossy().into_owned();

    let spec = match example.kind {
        ExampleKind::File | ExampleKind::Server => {
            let spec = CommandSpec::from_argv(&launch.interpreter)?;
            if launch.seeded_bootstrap {
                spec.arg("-c").arg(bootstrap_code(&example.path))
            } else {
                spec.arg(path)
            }
        }
        ExampleKind::Notebook => CommandSpec::from_argv(&launch.notebook_command)?.arg(path),
    };

    Ok(spec.current_dir(example.workdir()).envs(&launch.env))
}

/// Runs example processes, one child per call, never retrying
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    launch: LaunchConfig,
    timeouts: TimeoutConfig,
}

impl ProcessRunner {
    pub fn new(launch: LaunchConfig, timeouts: TimeoutConfig) -> Self {
        Self { launch, timeouts }
    }

    pub fn timeout_for(&self, example: &Example) -> Duration {
        self.timeouts.for_example(example)
    }

    /// Run an example until it exits or `timeout` expires
    pub async fn run(&self, example: &Example, timeout: Duration) -> E2eResult<RunOutcome> {
        let spec = launch_command(example, &self.launch)?;
        debug!(example = %example.display_name(), command = %spec, "Launching example");
        run_with_deadline(&spec, timeout).await
    }
}

/// Execute `spec`, killing it (and its process group) if it outlives
/// `deadline`. Output is captured in full on every path.
pub async fn run_with_deadline(spec: &CommandSpec, deadline: Duration) -> E2eResult<RunOutcome> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }

    #[cfg(unix)]
    {
        cmd.process_group(0);
    }

    let start = Instant::now();
    let mut child = cmd.spawn().map_err(|e| E2eError::Spawn {
        program: spec.program.clone(),
        reason: e.to_string(),
    })?;

    let mut group = GroupGuard::new(&child);
    let stdout = child.stdout.take().map(OutputPipe::spawn);
    let stderr = child.stderr.take().map(OutputPipe::spawn);

    let status = match tokio::time::timeout(deadline, child.wait()).await {
        Ok(status) => RunStatus::Exited(exit_code(status?)),
        Err(_) => {
            warn!(
                program = %spec.program,
                deadline_secs = deadline.as_secs_f64(),
                "Deadline expired, killing process"
            );
            kill_process_group(&mut child).await;
            RunStatus::Timeout
        }
    };
    group.disarm();
    let duration = start.elapsed();

    let stdout = match stdout {
        Some(pipe) => pipe.finish().await,
        None => String::new(),
    };
    let stderr = match stderr {
        Some(pipe) => pipe.finish().await,
        None => String::new(),
    };

    Ok(RunOutcome {
        status,
        duration,
        stdout,
        stderr,
    })
}

/// Background reader that accumulates a pipe into a shared buffer, so the
/// bytes read so far survive even if the reader has to be abandoned
struct OutputPipe {
    buffer: Arc<Mutex<Vec<u8>>>,
    task: JoinHandle<()>,
}

impl OutputPipe {
    fn spawn<R>(mut reader: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buffer);

        let task = tokio::spawn(async move {
            let mut chunk = [0u8; 8192];
            loop {
                match reader.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => sink.lock().extend_from_slice(&chunk[..n]),
                    Err(e) => {
                        debug!("Output pipe read failed: {}", e);
                        break;
                    }
                }
            }
        });

        Self { buffer, task }
    }

    async fn finish(mut self) -> String {
        if tokio::time::timeout(DRAIN_GRACE, &mut self.task).await.is_err() {
            // A descendant outside the process group still holds the pipe.
            warn!("Output pipe still open after process exit, keeping partial output");
            self.task.abort();
        }
        let bytes = std::mem::take(&mut *self.buffer.lock());
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Kills the child's process group if dropped while armed. `kill_on_drop`
/// only reaches the direct child; this also covers its descendants when the
/// run is cancelled mid-wait.
struct GroupGuard {
    pgid: Option<u32>,
}

impl GroupGuard {
    fn new(child: &Child) -> Self {
        Self { pgid: child.id() }
    }

    /// The child has been waited on; its group id may be reused from here
    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        let Some(pgid) = self.pgid.take() else {
            return;
        };

        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            debug!(pgid, "Run cancelled, killing process group");
            if let Err(e) = killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
                debug!(pgid, "killpg failed: {}", e);
            }
        }
        #[cfg(not(unix))]
        let _ = pgid;
    }
}

async fn kill_process_group(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                debug!(pid, "killpg failed: {}", e);
            }
        }
    }

    // Kills the direct child if the group signal missed it, and reaps it.
    if let Err(e) = child.kill().await {
        warn!("Failed to kill child process: {}", e);
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    -1
}
