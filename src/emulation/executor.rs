//! Sandbox Command Execution
//!
//! Runs shaping commands inside a named sandbox.

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{Error, Result};

/// Outcome of one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Whether the command exited successfully
    pub success: bool,
    /// Combined stdout and stderr
    pub output: String,
}

impl CommandOutput {
    /// Successful output
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
        }
    }

    /// Failed output
    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
        }
    }
}

/// Executes a command against a named sandbox
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run `command` inside `sandbox`
    async fn exec(&self, sandbox: &str, command: &str) -> Result<CommandOutput>;
}

/// Executor backed by `docker exec`
#[derive(Debug, Clone)]
pub struct DockerExecutor {
    /// Docker CLI binary
    docker: String,
}

impl Default for DockerExecutor {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerExecutor {
    /// Create an executor using the given docker binary
    pub fn new(docker: impl Into<String>) -> Self {
        Self {
            docker: docker.into(),
        }
    }
}

#[async_trait]
impl CommandExecutor for DockerExecutor {
    async fn exec(&self, sandbox: &str, command: &str) -> Result<CommandOutput> {
        let output = Command::new(&self.docker)
            .arg("exec")
            .arg(sandbox)
            .args(command.split_whitespace())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Command {
                sandbox: sandbox.to_string(),
                command: command.to_string(),
                output: format!("failed to spawn {}: {}", self.docker, e),
            })?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(CommandOutput {
            success: output.status.success(),
            output: text.trim().to_string(),
        })
    }
}
