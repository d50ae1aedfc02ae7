//! Subprocess seam for agent invocations.
//!
//! [`ProcessRunner`] is the narrow interface the coordinator talks to;
//! [`CliRunner`] is the real implementation. The runner owns the
//! active-process registry: `kill` consults it, and `run` is the only place
//! that removes entries, so cleanup is guaranteed regardless of outcome.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::errors::ExecutionError;

/// Captured output of a successful run.
#[derive(Debug)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Spawn `program` with `args` rooted at `cwd`, tracked under `key`,
    /// and capture its output under a wall-clock `timeout`.
    async fn run(
        &self,
        key: Uuid,
        program: &str,
        args: &[String],
        cwd: &Path,
        timeout: Duration,
    ) -> Result<RunOutput, ExecutionError>;

    /// Terminate the tracked process for `key`.
    async fn kill(&self, key: Uuid) -> Result<(), ExecutionError>;

    /// Terminate every tracked process (shutdown path).
    async fn kill_all(&self);
}

struct TrackedChild {
    child: Child,
    /// Set by `kill` before the signal goes out, so `run` can tell a
    /// deliberate kill apart from an ordinary failure.
    killed: bool,
}

/// Real subprocess runner backed by `tokio::process`.
#[derive(Default)]
pub struct CliRunner {
    active: Mutex<HashMap<Uuid, TrackedChild>>,
}

impl CliRunner {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProcessRunner for CliRunner {
    async fn run(
        &self,
        key: Uuid,
        program: &str,
        args: &[String],
        cwd: &Path,
        timeout: Duration,
    ) -> Result<RunOutput, ExecutionError> {
        let mut child = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(ExecutionError::Spawn)?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        self.active
            .lock()
            .await
            .insert(key, TrackedChild { child, killed: false });

        let read = match tokio::time::timeout(timeout, read_streams(stdout, stderr)).await {
            Ok(inner) => Some(inner),
            Err(_) => None,
        };

        // The executor owns cleanup of the tracking entry, on every path.
        let tracked = self.active.lock().await.remove(&key);
        let Some(mut tracked) = tracked else {
            warn!(key = %key, "tracked process entry missing at completion");
            return Err(ExecutionError::Killed);
        };

        if read.is_none() {
            let _ = tracked.child.start_kill();
        }
        let status = tracked.child.wait().await?;

        let Some(read) = read else {
            return Err(ExecutionError::Timeout {
                seconds: timeout.as_secs(),
            });
        };
        let (stdout, stderr) = read?;

        if tracked.killed {
            return Err(ExecutionError::Killed);
        }
        if !status.success() {
            return Err(ExecutionError::NonZeroExit {
                code: status.code().unwrap_or(-1),
                stderr: excerpt(&stderr),
            });
        }
        Ok(RunOutput { stdout, stderr })
    }

    async fn kill(&self, key: Uuid) -> Result<(), ExecutionError> {
        let mut active = self.active.lock().await;
        let Some(tracked) = active.get_mut(&key) else {
            return Err(ExecutionError::NotRunning { id: key });
        };
        tracked.killed = true;
        tracked.child.start_kill().map_err(ExecutionError::Io)
    }

    async fn kill_all(&self) {
        let mut active = self.active.lock().await;
        for (key, tracked) in active.iter_mut() {
            tracked.killed = true;
            if let Err(e) = tracked.child.start_kill() {
                warn!(key = %key, error = %e, "failed to kill agent process");
            }
        }
    }
}

async fn read_streams(
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
) -> io::Result<(String, String)> {
    let stdout_fut = async {
        let mut buf = String::new();
        if let Some(mut stream) = stdout {
            stream.read_to_string(&mut buf).await?;
        }
        Ok::<_, io::Error>(buf)
    };
    let stderr_fut = async {
        let mut buf = String::new();
        if let Some(mut stream) = stderr {
            stream.read_to_string(&mut buf).await?;
        }
        Ok::<_, io::Error>(buf)
    };
    tokio::try_join!(stdout_fut, stderr_fut)
}

/// Bounded stderr excerpt for error messages.
fn excerpt(stderr: &str) -> String {
    const MAX: usize = 1000;
    let trimmed = stderr.trim();
    if trimmed.len() <= MAX {
        trimmed.to_string()
    } else {
        let start = trimmed.len() - MAX;
        let start = trimmed
            .char_indices()
            .map(|(i, _)| i)
            .find(|&i| i >= start)
            .unwrap_or(0);
        trimmed[start..].to_string()
    }
}
