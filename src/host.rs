//! Host-side command execution
//!
//! Backends drive virsh, qemu-img, ovs-vsctl, kind and docker through
//! [`CommandRunner`] so tests can script their output.

use std::process::Stdio;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::{Error, Result};

/// Exit status and captured streams of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Process exit code (-1 when killed by a signal)
    pub exit_code: i32,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output carrying `stdout`
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output carrying `stderr`
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Whether the command exited zero
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout on success, otherwise a [`Error::CommandFailed`] naming `command`
    pub fn into_stdout(self, command: &str) -> Result<String> {
        if self.success() {
            Ok(self.stdout)
        } else {
            Err(Error::command_failed(command, self.diagnostic()))
        }
    }

    /// Best single-line explanation of a failure
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            stderr.to_string()
        } else if !self.stdout.trim().is_empty() {
            self.stdout.trim().to_string()
        } else {
            format!("exit status {}", self.exit_code)
        }
    }
}

/// Runs programs on the machine the orchestrator itself runs on
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, feeding `stdin` when given
    ///
    /// A non-zero exit is returned as output, not as an error; `Err` means
    /// the program could not be started.
    async fn run(&self, program: &str, args: Vec<String>, stdin: Option<String>)
        -> Result<CommandOutput>;
}

/// [`CommandRunner`] backed by real processes
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(
        &self,
        program: &str,
        args: Vec<String>,
        stdin: Option<String>,
    ) -> Result<CommandOutput> {
        debug!(program = %program, args = ?args, "running host command");
        let command_line = format!("{} {}", program, args.join(" "));

        let mut child = Command::new(program)
            .args(&args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::command_failed(&command_line, e.to_string()))?;

        // stdin is fed while stdout/stderr drain, or a child that fills
        // its output pipe before reading all input would deadlock
        let pipe = child.stdin.take();
        let feed = async move {
            match (stdin, pipe) {
                (Some(input), Some(mut pipe)) => pipe.write_all(input.as_bytes()).await,
                _ => Ok(()),
            }
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output?;
        if let Err(e) = fed {
            // a child may exit without consuming all of its input
            if e.kind() != std::io::ErrorKind::BrokenPipe {
                return Err(e.into());
            }
        }
        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Convenience for building an owned argument list
pub fn args<const N: usize>(items: [&str; N]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Fail with an install hint for the first tool that is not on `PATH`
pub async fn check_prerequisites(
    runner: &dyn CommandRunner,
    tools: &[(&str, &str)],
) -> Result<()> {
    for (tool, hint) in tools {
        let found = runner
            .run("which", args([*tool]), None)
            .await
            .map(|o| o.success())
            .unwrap_or(false);
        if !found {
            return Err(Error::PrerequisiteNotFound {
                tool: tool.to_string(),
                hint: hint.to_string(),
            });
        }
        debug!(tool = %tool, "prerequisite found");
    }
    Ok(())
}
