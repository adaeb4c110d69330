//! Subprocess execution with a deadline

use std::{process::Stdio, time::Duration};

use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandStatus {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandStatus {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("failed to run {program}: {message}")]
    Spawn { program: String, message: String },
    #[error("command timed out after {0:?}")]
    Timeout(Duration),
}

/// Runs `expression` through `shell -c`, killing the child once `timeout` elapses.
pub async fn run_expression(
    shell: &str,
    expression: &str,
    timeout: Duration,
) -> Result<CommandStatus, ShellError> {
    let output = Command::new(shell)
        .arg("-c")
        .arg(expression)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(timeout, output)
        .await
        .map_err(|_| ShellError::Timeout(timeout))?
        .map_err(|err| ShellError::Spawn {
            program: shell.to_string(),
            message: err.to_string(),
        })?;

    Ok(CommandStatus {
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}
