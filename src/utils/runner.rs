// src/utils/runner.rs: supervised execution of one external command

use std::borrow::Cow;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout};
use tokio_stream::wrappers::SplitStream;
use tokio_stream::StreamExt;

use crate::config::defs::{
    PipelineError, DEFAULT_TIMEOUT_SECS, HEARTBEAT_AFTER_SECS, HEARTBEAT_EVERY_SECS, MAX_CAPTURE_BYTES,
};
use crate::utils::file::is_non_empty_file;
use crate::utils::runlog::RunLog;

/// How long captured pipes may keep draining after the child is gone.
const CAPTURE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    Timeout,
    ExecutionError,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Success => write!(f, "success"),
            RunStatus::Timeout => write!(f, "timeout"),
            RunStatus::ExecutionError => write!(f, "execution error"),
        }
    }
}

/// Finalized record of one invocation.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub command: String,
    pub title: String,
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed_seconds: f64,
}

impl RunResult {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Success
    }

    /// True if stdout or stderr contains `needle`.
    pub fn mentions(&self, needle: &str) -> bool {
        self.stdout.contains(needle) || self.stderr.contains(needle)
    }

    fn failure_reason(&self) -> String {
        let mut reason = match (self.status, self.exit_code) {
            (RunStatus::Timeout, _) => "timed out".to_string(),
            (_, Some(code)) => format!("exit code {}", code),
            (_, None) => "terminated abnormally".to_string(),
        };
        if let Some(line) = self.stderr.lines().rev().find(|l| !l.trim().is_empty()) {
            reason.push_str(": ");
            reason.push_str(line.trim());
        }
        reason
    }
}


/// Declaration of one external command: argument vector, environment and file contracts.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    pub title: Option<String>,
    pub allow_failure: bool,
    pub required_inputs: Vec<PathBuf>,
    pub expected_outputs: Vec<PathBuf>,
    pub silent: bool,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new<P, I, A>(program: P, args: I) -> Self
    where
        P: Into<String>,
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        CommandSpec {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn tolerate_failure(mut self) -> Self {
        self.allow_failure = true;
        self
    }

    pub fn requires(mut self, path: impl Into<PathBuf>) -> Self {
        self.required_inputs.push(path.into());
        self
    }

    pub fn produces(mut self, path: impl Into<PathBuf>) -> Self {
        self.expected_outputs.push(path.into());
        self
    }

    pub fn quiet(mut self) -> Self {
        self.silent = true;
        self
    }

    pub fn with_timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    pub fn display_title(&self) -> String {
        self.title.clone().unwrap_or_else(|| self.program.clone())
    }

    /// Command line for logs. Arguments are never passed through a shell.
    pub fn render(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(shell_quote)
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// True when every expected output already exists (files non-empty).
    /// Used as the sole signal for skipping a stage on re-runs.
    pub fn outputs_present(&self) -> bool {
        !self.expected_outputs.is_empty()
            && self
                .expected_outputs
                .iter()
                .all(|p| p.is_dir() || is_non_empty_file(p))
    }
}

fn shell_quote(arg: &str) -> Cow<'_, str> {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if plain {
        Cow::Borrowed(arg)
    } else {
        Cow::Owned(format!("'{}'", arg.replace('\'', "'\\''")))
    }
}


struct Launch {
    status: RunStatus,
    exit_code: Option<i32>,
    stdout: String,
    stderr: String,
}

/// Runs commands one at a time per call, with a wall-clock ceiling and an optional shared run log.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    run_log: Option<Arc<RunLog>>,
    timeout: Duration,
    heartbeat_after: Duration,
    heartbeat_every: Duration,
}

impl Default for CommandRunner {
    fn default() -> Self {
        CommandRunner::new(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }
}

impl CommandRunner {
    pub fn new(timeout: Duration) -> Self {
        CommandRunner {
            run_log: None,
            timeout,
            heartbeat_after: Duration::from_secs(HEARTBEAT_AFTER_SECS),
            heartbeat_every: Duration::from_secs(HEARTBEAT_EVERY_SECS),
        }
    }

    pub fn with_run_log(mut self, run_log: Arc<RunLog>) -> Self {
        self.run_log = Some(run_log);
        self
    }

    pub fn with_heartbeat(mut self, after: Duration, every: Duration) -> Self {
        self.heartbeat_after = after;
        self.heartbeat_every = every.max(Duration::from_millis(1));
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn run_log(&self) -> Option<&Arc<RunLog>> {
        self.run_log.as_ref()
    }

    /// Executes one command.
    ///
    /// # Arguments
    ///
    /// * `spec` - Command, file contracts and failure policy.
    ///
    /// # Returns
    /// The finalized RunResult. Timeout and execution failures are errors unless the
    /// spec tolerates failure; missing inputs are always errors and nothing is launched.
    pub async fn execute(&self, spec: &CommandSpec) -> Result<RunResult, PipelineError> {
        let title = spec.display_title();

        for input in &spec.required_inputs {
            if !is_non_empty_file(input) {
                return Err(PipelineError::MissingInput {
                    title,
                    path: input.clone(),
                });
            }
        }

        let command = spec.render();
        if let Some(run_log) = &self.run_log {
            run_log.command_started(&title, &command).await?;
        }
        if spec.silent {
            debug!("[{}] {}", title, command);
        } else {
            info!("[{}] {}", title, command);
        }

        let limit = spec.timeout.unwrap_or(self.timeout);
        let start = Instant::now();
        let launch = self.launch(spec, &title, limit, start).await;

        let result = RunResult {
            command,
            title,
            status: launch.status,
            exit_code: launch.exit_code,
            stdout: launch.stdout,
            stderr: launch.stderr,
            elapsed_seconds: start.elapsed().as_secs_f64(),
        };

        if let Some(run_log) = &self.run_log {
            run_log.command_finished(&result).await?;
        }
        trace!("[{}] stdout:\n{}", result.title, result.stdout);
        trace!("[{}] stderr:\n{}", result.title, result.stderr);

        match result.status {
            RunStatus::Success => {
                for output in &spec.expected_outputs {
                    if !output.exists() {
                        return Err(PipelineError::MissingOutput {
                            title: result.title,
                            path: output.clone(),
                        });
                    }
                }
                if !spec.silent {
                    info!("[{}] finished in {:.1}s", result.title, result.elapsed_seconds);
                }
                Ok(result)
            }
            _ if spec.allow_failure => {
                warn!("[{}] tolerated failure: {}", result.title, result.failure_reason());
                Ok(result)
            }
            RunStatus::Timeout => Err(PipelineError::Timeout {
                title: result.title,
                command: result.command,
                seconds: result.elapsed_seconds,
            }),
            RunStatus::ExecutionError => {
                let reason = result.failure_reason();
                Err(PipelineError::Execution {
                    title: result.title,
                    command: result.command,
                    reason,
                })
            }
        }
    }

    async fn launch(&self, spec: &CommandSpec, title: &str, limit: Duration, start: Instant) -> Launch {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return Launch {
                    status: RunStatus::ExecutionError,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: format!("Failed to spawn {}: {}", spec.program, e),
                };
            }
        };

        let stdout_task = tokio::spawn(capture_output(child.stdout.take()));
        let stderr_task = tokio::spawn(capture_output(child.stderr.take()));

        let deadline = sleep(limit);
        tokio::pin!(deadline);
        let mut heartbeat = interval_at(tokio::time::Instant::now() + self.heartbeat_after, self.heartbeat_every);

        let waited = loop {
            tokio::select! {
                status = child.wait() => break Some(status),
                _ = &mut deadline => break None,
                _ = heartbeat.tick() => {
                    if !spec.silent {
                        info!("[{}] still running ({:.0}s elapsed)", title, start.elapsed().as_secs_f64());
                    }
                }
            }
        };

        let mut note = None;
        let (status, exit_code) = match waited {
            Some(Ok(exit)) if exit.success() => (RunStatus::Success, exit.code()),
            Some(Ok(exit)) => (RunStatus::ExecutionError, exit.code()),
            Some(Err(e)) => {
                note = Some(format!("Failed to wait on {}: {}", spec.program, e));
                (RunStatus::ExecutionError, None)
            }
            None => {
                if let Err(e) = child.kill().await {
                    warn!("[{}] could not kill timed out process: {}", title, e);
                }
                (RunStatus::Timeout, None)
            }
        };

        let stdout = join_capture(stdout_task).await;
        let mut stderr = join_capture(stderr_task).await;
        if let Some(note) = note {
            stderr.push_str(&note);
        }

        Launch {
            status,
            exit_code,
            stdout,
            stderr,
        }
    }
}

/// Drains a child pipe line by line, keeping at most MAX_CAPTURE_BYTES.
async fn capture_output<R: AsyncRead + Unpin>(reader: Option<R>) -> String {
    let Some(reader) = reader else {
        return String::new();
    };
    let mut segments = SplitStream::new(BufReader::new(reader).split(b'\n'));
    let mut captured = String::new();
    let mut truncated = false;
    while let Some(segment) = segments.next().await {
        let Ok(bytes) = segment else { break };
        if truncated {
            continue;
        }
        if captured.len() + bytes.len() + 1 > MAX_CAPTURE_BYTES {
            truncated = true;
            continue;
        }
        captured.push_str(&String::from_utf8_lossy(&bytes));
        captured.push('\n');
    }
    if truncated {
        captured.push_str("[output truncated]\n");
    }
    captured
}

// A grandchild may still hold the pipe open after a kill.
async fn join_capture(mut task: JoinHandle<String>) -> String {
    match timeout(CAPTURE_GRACE, &mut task).await {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            warn!("Output capture task failed: {}", e);
            String::new()
        }
        Err(_) => {
            task.abort();
            String::new()
        }
    }
}
