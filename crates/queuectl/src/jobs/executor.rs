use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;

use tokio::process::Command;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Output kept from a single stream before truncation.
const MAX_OUTPUT_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ExecError {
    pub message: String,
    pub exit_code: Option<i32>,
}

impl ExecError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            exit_code: None,
        }
    }
}

/// Runs a job's command. One call is one attempt.
pub trait Executor: Send + Sync {
    fn execute<'a>(&'a self, command: &'a str) -> BoxFuture<'a, Result<ExecOutput, ExecError>>;
}

/// Runs commands through `sh -c`. A non-zero exit status is a failure.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: String,
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }
}

impl ShellExecutor {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    async fn run(&self, command: &str) -> Result<ExecOutput, ExecError> {
        let output = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ExecError::new(format!("failed to spawn {}: {e}", self.shell)))?;

        let stdout = truncate(&output.stdout);
        let stderr = truncate(&output.stderr);

        if output.status.success() {
            return Ok(ExecOutput { stdout, stderr });
        }

        let exit_code = output.status.code();
        let message = match (exit_code, stderr.trim()) {
            (Some(code), "") => format!("command exited with status {code}"),
            (Some(code), err) => format!("command exited with status {code}: {err}"),
            (None, "") => "command terminated by signal".to_string(),
            (None, err) => format!("command terminated by signal: {err}"),
        };

        Err(ExecError { message, exit_code })
    }
}

impl Executor for ShellExecutor {
    fn execute<'a>(&'a self, command: &'a str) -> BoxFuture<'a, Result<ExecOutput, ExecError>> {
        Box::pin(self.run(command))
    }
}

fn truncate(bytes: &[u8]) -> String {
    if bytes.len() <= MAX_OUTPUT_BYTES {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    let mut s = String::from_utf8_lossy(&bytes[..MAX_OUTPUT_BYTES]).into_owned();
    s.push_str("\n... [truncated]");
    s
}
