//! Code execution tool.
//!
//! Writes the supplied script to a temporary file and runs it through the
//! configured interpreter. Always gated at Medium risk or above.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::{require_str, Capability, Tool, ToolContext, ToolOutput};
use crate::error::{DbRheoError, Result};
use crate::types::AbortSignal;

const CAPABILITIES: &[Capability] = &[Capability::Transform, Capability::Analyze];

const MAX_CAPTURE_BYTES: usize = 65_536;

/// Runs a short script via the configured interpreter.
pub struct CodeTool;

#[async_trait]
impl Tool for CodeTool {
    fn name(&self) -> &str {
        "code_tool"
    }

    fn description(&self) -> &str {
        "Execute a short script with the configured interpreter (python3 by \
         default) and capture its output. Useful for data transformation \
         the database cannot express."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "code": {
                    "type": "string",
                    "description": "The script source to run"
                }
            },
            "required": ["code"]
        })
    }

    fn capabilities(&self) -> &[Capability] {
        CAPABILITIES
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_secs(60)
    }

    fn validate_args(&self, args: &serde_json::Value) -> Result<()> {
        require_str(args, "code").map(|_| ())
    }

    async fn execute(
        &self,
        args: &serde_json::Value,
        ctx: &ToolContext,
        signal: &AbortSignal,
    ) -> Result<ToolOutput> {
        let code = require_str(args, "code")?;
        let interpreter = ctx.config.get_str("tools.code_interpreter", "python3");

        let dir = tempfile::tempdir()
            .map_err(|e| DbRheoError::tool_execution(format!("Cannot create temp dir: {e}")))?;
        let script_path = dir.path().join("script");
        tokio::fs::write(&script_path, code)
            .await
            .map_err(|e| DbRheoError::tool_execution(format!("Cannot write script: {e}")))?;

        let child = Command::new(&interpreter)
            .arg(&script_path)
            .current_dir(ctx.config.workspace_root())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                DbRheoError::tool_execution(format!("Cannot spawn '{interpreter}': {e}"))
            })?;

        let output = tokio::select! {
            output = child.wait_with_output() => output
                .map_err(|e| DbRheoError::tool_execution(format!("Script failed: {e}")))?,
            _ = signal.tripped() => return Err(DbRheoError::Cancelled),
        };

        let exit_code = output.status.code().unwrap_or(-1);
        Ok(ToolOutput::new(
            serde_json::json!({
                "interpreter": interpreter,
                "exit_code": exit_code,
                "stdout": truncate_capture(&output.stdout),
                "stderr": truncate_capture(&output.stderr),
            }),
            format!("{interpreter} exited {exit_code}"),
        ))
    }
}

fn truncate_capture(bytes: &[u8]) -> String {
    let slice = &bytes[..bytes.len().min(MAX_CAPTURE_BYTES)];
    String::from_utf8_lossy(slice).into_owned()
}
