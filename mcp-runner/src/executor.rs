//! Runs a single command to completion (or to its deadline) and captures what it printed.
//!
//! An execution moves through `NotStarted → Running → {Completed, TimedOut, FailedToStart}`.
//! Only `FailedToStart` is an error as far as callers are concerned; a command that exits with a
//! non-zero status, or that has to be killed at its deadline, still produces an
//! [`ExecutionResult`].
//!
//! On Unix each command runs in a process group of its own.  At the deadline the whole group is
//! sent `SIGINT`, and whatever is still running `kill_timeout` later gets `SIGKILL`.
use crate::config::ExecutionConfig;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::*;

/// `exit_code` reported for a command that ran past its timeout.  Unix exit codes are never
/// negative, so there it can't be confused with a real one.  Windows exit codes can be, so check
/// `timed_out` rather than comparing against this.
pub const TIMEOUT_EXIT_CODE: i32 = -1;

/// `exit_code` reported when the OS gave neither an exit code nor a terminating signal.
pub const UNKNOWN_EXIT_CODE: i32 = i32::MIN;

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// A fully validated request to run a command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub command: String,
    pub args: Vec<String>,
    pub timeout: Duration,
    pub workdir: Option<PathBuf>,

    /// Added to the environment the server inherited
    pub env: BTreeMap<String, String>,
}

/// Outcome of a command that was started.  Created fresh for every execution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration_ms: u64,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

/// Reasons a command could not be run at all.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("command not found: {command}")]
    CommandNotFound {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start command '{command}'")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed waiting for command '{command}' to finish")]
    WaitFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Runs commands according to the execution limits in the config.
#[derive(Clone, Debug)]
pub struct Executor {
    max_output_bytes: usize,
    drain_timeout: Duration,
    kill_timeout: Duration,
}

impl Executor {
    pub fn new(config: &ExecutionConfig) -> Self {
        Self {
            max_output_bytes: config.max_output_bytes,
            drain_timeout: config.drain_timeout,
            kill_timeout: config.kill_timeout,
        }
    }

    /// Run `request` with stdin closed, capturing stdout and stderr separately.
    #[instrument(skip(self, request), fields(command = %request.command, timeout = ?request.timeout))]
    pub async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult, ExecError> {
        let mut command = Command::new(&request.command);
        command
            .args(&request.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .envs(&request.env)
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        if let Some(workdir) = &request.workdir {
            command.current_dir(workdir);
        }

        let started = Instant::now();
        let mut child = command.spawn().map_err(|source| {
            warn!(error = %source, "Command failed to start");
            if source.kind() == std::io::ErrorKind::NotFound {
                ExecError::CommandNotFound {
                    command: request.command.clone(),
                    source,
                }
            } else {
                ExecError::SpawnFailed {
                    command: request.command.clone(),
                    source,
                }
            }
        })?;
        debug!(pid = ?child.id(), "Command running");

        let stdout = OutputCapture::start(child.stdout.take(), self.max_output_bytes);
        let stderr = OutputCapture::start(child.stderr.take(), self.max_output_bytes);

        let waited = tokio::time::timeout(request.timeout, child.wait()).await;
        let outcome = match waited {
            Ok(Ok(status)) => Outcome::Completed(status),
            Ok(Err(source)) => {
                // Make sure nothing is left running before bailing out
                if let Some(pid) = child.id() {
                    process_group::kill(pid);
                }
                let _ = child.kill().await;
                return Err(ExecError::WaitFailed {
                    command: request.command.clone(),
                    source,
                });
            }
            Err(_elapsed) => {
                self.terminate(&mut child).await;
                Outcome::TimedOut
            }
        };

        let ((stdout, stdout_truncated), (stderr, stderr_truncated)) = tokio::join!(
            stdout.finish(self.drain_timeout),
            stderr.finish(self.drain_timeout)
        );

        let result = ExecutionResult {
            exit_code: outcome.exit_code(),
            stdout,
            stderr,
            timed_out: matches!(outcome, Outcome::TimedOut),
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            stdout_truncated,
            stderr_truncated,
        };

        if result.timed_out {
            warn!(duration_ms = result.duration_ms, "Command timed out and was killed");
        } else {
            info!(
                exit_code = result.exit_code,
                duration_ms = result.duration_ms,
                "Command completed"
            );
        }
        trace!(stdout = %result.stdout, stderr = %result.stderr, "Command output");

        Ok(result)
    }

    /// Stop a command that ran past its deadline.  The process group is interrupted first so the
    /// command gets a chance to flush its output, then killed once `kill_timeout` has passed.
    /// Members of the group are killed even if the command itself exits on the interrupt.
    async fn terminate(&self, child: &mut Child) {
        let pid = child.id();

        if cfg!(unix) && !self.kill_timeout.is_zero() {
            if let Some(pid) = pid {
                process_group::interrupt(pid);
            }
            let waited = tokio::time::timeout(self.kill_timeout, child.wait()).await;
            if let Ok(status) = waited {
                debug!(?status, "Command exited after being interrupted");
                if let Some(pid) = pid {
                    process_group::kill(pid);
                }
                return;
            }
            debug!(kill_timeout = ?self.kill_timeout, "Command ignored the interrupt");
        }

        if let Some(pid) = pid {
            process_group::kill(pid);
        }
        // `kill` also reaps the child, so there's no zombie left behind
        if let Err(e) = child.kill().await {
            debug!(error = %e, "Failed to kill timed out command");
        }
    }
}

/// Signals sent to the process group a command was started in.  Its id is the command's pid.
#[cfg(unix)]
mod process_group {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;
    use tracing::*;

    pub(super) fn interrupt(pgid: u32) {
        send(pgid, Signal::SIGINT)
    }

    pub(super) fn kill(pgid: u32) {
        send(pgid, Signal::SIGKILL)
    }

    fn send(pgid: u32, signal: Signal) {
        let Ok(pgid) = i32::try_from(pgid) else {
            return;
        };
        // ESRCH just means every member has already exited
        if let Err(e) = killpg(Pid::from_raw(pgid), signal) {
            debug!(pgid, ?signal, error = %e, "Failed to signal process group");
        }
    }
}

#[cfg(not(unix))]
mod process_group {
    pub(super) fn interrupt(_pgid: u32) {}

    pub(super) fn kill(_pgid: u32) {}
}

/// How a started command ended
#[derive(Debug)]
enum Outcome {
    Completed(ExitStatus),
    TimedOut,
}

impl Outcome {
    fn exit_code(&self) -> i32 {
        match self {
            Outcome::Completed(status) => exit_status_code(status),
            Outcome::TimedOut => TIMEOUT_EXIT_CODE,
        }
    }
}

/// The numeric exit code of a finished process.  On Unix, a process terminated by a signal is
/// reported the way shells do, as `128 + signal`.
fn exit_status_code(status: &ExitStatus) -> i32 {
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

    warn!(?status, "Exit status has neither a code nor a signal");
    UNKNOWN_EXIT_CODE
}

/// Bytes read from one of the child's output pipes, up to a limit.
#[derive(Debug, Default)]
struct OutputBuffer {
    bytes: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl OutputBuffer {
    fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.bytes.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }
}

/// A background task draining one output pipe into a shared buffer.
///
/// The buffer lives outside the task so that whatever was captured survives even if the task has
/// to be abandoned (a grandchild process can hold the pipe open long after the child is gone).
struct OutputCapture {
    buffer: Arc<Mutex<OutputBuffer>>,
    task: Option<JoinHandle<()>>,
}

impl OutputCapture {
    fn start<R>(pipe: Option<R>, limit: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(OutputBuffer {
            limit,
            ..Default::default()
        }));

        let task = pipe.map(|mut pipe| {
            let buffer = buffer.clone();
            tokio::spawn(async move {
                let mut chunk = vec![0u8; READ_CHUNK_SIZE];
                loop {
                    match pipe.read(&mut chunk).await {
                        Ok(0) => break,
                        Ok(n) => buffer.lock().await.push(&chunk[..n]),
                        Err(e) => {
                            debug!(error = %e, "Error reading command output");
                            break;
                        }
                    }
                }
            })
        });

        Self { buffer, task }
    }

    /// Wait up to `grace` for the pipe to reach EOF, then return the captured text and whether
    /// any of it was discarded.
    async fn finish(mut self, grace: Duration) -> (String, bool) {
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                debug!("Output pipe still open after the command ended; abandoning it");
                task.abort();
            }
        }

        let buffer = self.buffer.lock().await;
        (
            String::from_utf8_lossy(&buffer.bytes).into_owned(),
            buffer.truncated,
        )
    }
}
