//! Shell command tool.
//!
//! Runs a command through `sh -c`, capturing stdout and stderr. The risk
//! evaluator gates commands against the configured allow and deny lists
//! before execution; this tool enforces the deny list a second time as a
//! hard stop.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::{require_str, Capability, Tool, ToolContext, ToolOutput};
use crate::error::{DbRheoError, Result};
use crate::types::AbortSignal;

const CAPABILITIES: &[Capability] = &[Capability::Transform];

/// Caps captured output per stream.
const MAX_CAPTURE_BYTES: usize = 65_536;

/// Executes an allowlisted shell command.
pub struct ShellTool;

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell_tool"
    }

    fn description(&self) -> &str {
        "Run a shell command in the workspace directory and capture its \
         output. Only commands on the configured allowlist run without \
         confirmation."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The command line to run"
                }
            },
            "required": ["command"]
        })
    }

    fn capabilities(&self) -> &[Capability] {
        CAPABILITIES
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    fn validate_args(&self, args: &serde_json::Value) -> Result<()> {
        require_str(args, "command").map(|_| ())
    }

    async fn execute(
        &self,
        args: &serde_json::Value,
        ctx: &ToolContext,
        signal: &AbortSignal,
    ) -> Result<ToolOutput> {
        let command = require_str(args, "command")?;

        // Deny patterns are a hard stop even if the gate was bypassed.
        for pattern in ctx.config.shell_denylist() {
            if let Ok(re) = regex::Regex::new(&pattern) {
                if re.is_match(command) {
                    return Err(DbRheoError::risk_rejected(format!(
                        "Command matches deny pattern '{pattern}'"
                    )));
                }
            }
        }

        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(ctx.config.workspace_root())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DbRheoError::tool_execution(format!("Cannot spawn shell: {e}")))?;

        let output = tokio::select! {
            output = child.wait_with_output() => output
                .map_err(|e| DbRheoError::tool_execution(format!("Command failed: {e}")))?,
            _ = signal.tripped() => {
                return Err(DbRheoError::Cancelled);
            }
        };

        let stdout = truncate_capture(&output.stdout);
        let stderr = truncate_capture(&output.stderr);
        let exit_code = output.status.code().unwrap_or(-1);

        Ok(ToolOutput::new(
            serde_json::json!({
                "command": command,
                "exit_code": exit_code,
                "stdout": stdout,
                "stderr": stderr,
            }),
            format!("exit {exit_code}"),
        ))
    }
}

fn truncate_capture(bytes: &[u8]) -> String {
    let slice = &bytes[..bytes.len().min(MAX_CAPTURE_BYTES)];
    String::from_utf8_lossy(slice).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::connection::ConnectionManager;
    use crate::db::AdapterFactory;
    use std::sync::Arc;

    fn context() -> ToolContext {
        ToolContext::new(
            Arc::new(AgentConfig::for_tests(serde_yaml::Value::Null)),
            Arc::new(ConnectionManager::new(Arc::new(AdapterFactory::new()))),
        )
    }

    #[tokio::test]
    async fn test_captures_stdout_and_exit_code() {
        let output = ShellTool
            .execute(
                &serde_json::json!({"command": "echo hello"}),
                &context(),
                &AbortSignal::new(),
            )
            .await
            .unwrap();
        assert_eq!(output.content["exit_code"], 0);
        assert_eq!(output.content["stdout"], "hello\n");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_reported_not_an_error() {
        let output = ShellTool
            .execute(
                &serde_json::json!({"command": "ls /definitely/not/a/path"}),
                &context(),
                &AbortSignal::new(),
            )
            .await
            .unwrap();
        assert_ne!(output.content["exit_code"], 0);
        assert!(!output.content["stderr"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deny_pattern_is_a_hard_stop() {
        let err = ShellTool
            .execute(
                &serde_json::json!({"command": "sudo ls"}),
                &context(),
                &AbortSignal::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "RiskRejectedError");
    }

    #[tokio::test]
    async fn test_tripped_signal_cancels() {
        let signal = AbortSignal::new();
        signal.trip();
        let err = ShellTool
            .execute(
                &serde_json::json!({"command": "sleep 5"}),
                &context(),
                &signal,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "CancelledError");
    }
}
