//! Subprocess invocation helpers.
//!
//! A [`ProcessSpec`] describes a command line. It is either launched as a
//! long-running child whose output goes to the daemon's own stdout/stderr, or
//! run to completion with output captured line by line.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

use crate::error::{Result, SupervisorError};

/// Command line for a managed process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    /// Command to execute
    pub command: String,
    /// Arguments placed before any per-call arguments
    pub args: Vec<String>,
    /// Working directory
    pub working_dir: Option<PathBuf>,
    /// Environment variables to set
    pub env: Vec<(String, String)>,
}

impl ProcessSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
        }
    }

    /// Add a command argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple command arguments.
    #[must_use]
    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Add an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Build a command with the base arguments followed by `extra`.
    pub fn command<I, S>(&self, extra: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut command = Command::new(&self.command);
        command.args(&self.args).args(extra);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        for (key, value) in &self.env {
            command.env(key, value);
        }
        command.stdin(Stdio::null());
        command
    }

    /// Launch a long-running child that shares the daemon's stdout and stderr.
    pub fn spawn<I, S>(&self, extra: I) -> Result<Child>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut command = self.command(extra);
        command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        command
            .spawn()
            .map_err(|e| SupervisorError::spawn_failed(&self.command, &e))
    }

    /// Run to completion, capturing output.
    pub async fn run<I, S>(&self, extra: I) -> Result<ProcessResult>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut command = self.command(extra);
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = command
            .spawn()
            .map_err(|e| SupervisorError::spawn_failed(&self.command, &e))?;

        let stdout_task = tokio::spawn(collect_lines(child.stdout.take()));
        let stderr_task = tokio::spawn(collect_lines(child.stderr.take()));

        let status = child
            .wait()
            .await
            .map_err(|e| SupervisorError::wait_failed(&self.command, e.to_string()))?;

        let stdout = stdout_task
            .await
            .map_err(|e| SupervisorError::wait_failed(&self.command, e.to_string()))?
            .map_err(|e| SupervisorError::wait_failed(&self.command, e.to_string()))?;
        let stderr = stderr_task
            .await
            .map_err(|e| SupervisorError::wait_failed(&self.command, e.to_string()))?
            .map_err(|e| SupervisorError::wait_failed(&self.command, e.to_string()))?;

        Ok(ProcessResult {
            exit_code: status.code(),
            stdout,
            stderr,
        })
    }
}

/// Result of a process run to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessResult {
    /// Exit code, absent when terminated by a signal
    pub exit_code: Option<i32>,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl ProcessResult {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Combined output, stderr first.
    #[must_use]
    pub fn output(&self) -> String {
        self.stderr
            .iter()
            .chain(self.stdout.iter())
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

async fn collect_lines<T>(source: Option<T>) -> std::io::Result<Vec<String>>
where
    T: tokio::io::AsyncRead + Unpin,
{
    let Some(stream) = source else {
        return Ok(Vec::new());
    };

    let mut lines = BufReader::new(stream).lines();
    let mut collected = Vec::new();
    while let Some(line) = lines.next_line().await? {
        collected.push(line);
    }
    Ok(collected)
}
