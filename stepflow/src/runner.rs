//! Subprocess execution for shell and script steps
//!
//! Every invocation runs with a timeout; the child is killed when the timeout
//! fires. Output is captured and truncated to a configured size.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

/// Default cap on captured stdout/stderr
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// What to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl Invocation {
    /// `<shell> -c <command>`
    pub fn shell(shell: &str, command: &str) -> Self {
        Self {
            program: shell.to_string(),
            args: vec!["-c".to_string(), command.to_string()],
            env: Vec::new(),
        }
    }

    /// `<python> -c <script>`
    pub fn python(python: &str, script: &str) -> Self {
        Self {
            program: python.to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: Vec::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Captured result of a finished process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// `None` when the process was killed by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("Command timed out after {0}s")]
    Timeout(u64),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Subprocess collaborator used by the executor
#[async_trait]
pub trait SubprocessRunner: Send + Sync {
    async fn run(
        &self,
        invocation: &Invocation,
        cwd: &Path,
        timeout: Duration,
    ) -> Result<ProcessOutput, RunnerError>;
}

/// Truncate output to max bytes on a UTF-8 boundary
fn truncate_output(output: &[u8], max_bytes: usize) -> (String, bool) {
    if output.len() <= max_bytes {
        (String::from_utf8_lossy(output).to_string(), false)
    } else {
        let mut end = max_bytes;
        while end > 0 && (output[end] & 0b1100_0000) == 0b1000_0000 {
            end -= 1;
        }
        (String::from_utf8_lossy(&output[..end]).to_string(), true)
    }
}

/// [`SubprocessRunner`] on top of `tokio::process`
#[derive(Debug, Clone)]
pub struct TokioRunner {
    max_output_bytes: usize,
}

impl Default for TokioRunner {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_OUTPUT_BYTES)
    }
}

impl TokioRunner {
    pub fn new(max_output_bytes: usize) -> Self {
        Self { max_output_bytes }
    }
}

#[async_trait]
impl SubprocessRunner for TokioRunner {
    async fn run(
        &self,
        invocation: &Invocation,
        cwd: &Path,
        timeout: Duration,
    ) -> Result<ProcessOutput, RunnerError> {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &invocation.env {
            cmd.env(key, value);
        }

        let child = cmd.spawn()?;
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let (stdout, stdout_truncated) =
                    truncate_output(&output.stdout, self.max_output_bytes);
                let (stderr, stderr_truncated) =
                    truncate_output(&output.stderr, self.max_output_bytes);
                let truncated = stdout_truncated || stderr_truncated;
                if truncated {
                    tracing::warn!(
                        "Output of '{}' truncated to {} bytes",
                        invocation.program,
                        self.max_output_bytes
                    );
                }
                Ok(ProcessOutput {
                    exit_code: output.status.code(),
                    stdout,
                    stderr,
                    truncated,
                })
            }
            Ok(Err(io_err)) => Err(RunnerError::IoError(io_err)),
            // The child future is dropped here, which kills the process
            Err(_elapsed) => Err(RunnerError::Timeout(timeout.as_secs())),
        }
    }
}
