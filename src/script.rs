// External process execution with a hard timeout

use crate::error::AgentError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Trimmed stdout, `None` when empty. Most agent scripts print nothing on success.
    pub fn text(&self) -> Option<&str> {
        let t = self.stdout.trim();
        if t.is_empty() { None } else { Some(t) }
    }
}

#[async_trait]
pub trait ScriptRunner: Send + Sync {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, AgentError>;
}

/// Runs the script and applies the "null output on success" convention:
/// a non-zero exit or any stdout text is an `ExternalTool` error.
pub async fn run_expect_silent(
    runner: &dyn ScriptRunner,
    program: &str,
    args: &[String],
    timeout: Duration,
) -> Result<(), AgentError> {
    let out = runner.run(program, args, timeout).await?;
    if !out.success() || out.text().is_some() {
        let output = out
            .text()
            .map(str::to_string)
            .unwrap_or_else(|| out.stderr.trim().to_string());
        return Err(AgentError::ExternalTool {
            tool: program.to_string(),
            output,
        });
    }
    Ok(())
}

/// Converts a list of `&str` into owned args.
pub fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// Spawns real processes via `tokio::process`.
#[derive(Debug, Default, Clone)]
pub struct ProcessRunner;

#[async_trait]
impl ScriptRunner for ProcessRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, AgentError> {
        tracing::debug!(program, ?args, "exec");
        let child = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output();
        let output = match tokio::time::timeout(timeout, child).await {
            Ok(Ok(o)) => o,
            Ok(Err(e)) => {
                return Err(AgentError::ExternalTool {
                    tool: program.to_string(),
                    output: e.to_string(),
                });
            }
            Err(_) => {
                return Err(AgentError::Timeout(format!(
                    "{} did not finish within {:?}",
                    program, timeout
                )));
            }
        };
        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
