//! Workspace file tools.
//!
//! Both tools resolve paths against the workspace root and refuse to
//! follow `..` escapes. Writes outside the workspace are additionally
//! flagged by the risk evaluator before execution is ever attempted.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use super::{require_str, Capability, Tool, ToolContext, ToolOutput};
use crate::error::{DbRheoError, Result};
use crate::types::AbortSignal;

const READ_CAPABILITIES: &[Capability] = &[Capability::Read];
const WRITE_CAPABILITIES: &[Capability] = &[Capability::Write, Capability::Export];

/// Resolves `path` inside the workspace, rejecting escapes.
fn resolve_in_workspace(workspace: &Path, path: &str) -> Result<PathBuf> {
    let candidate = Path::new(path);
    let resolved = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        workspace.join(candidate)
    };

    if resolved.components().any(|c| matches!(c, Component::ParentDir))
        || !resolved.starts_with(workspace)
    {
        return Err(DbRheoError::tool_execution(format!(
            "Path '{path}' is outside the workspace root"
        )));
    }
    Ok(resolved)
}

/// Reads a workspace file.
pub struct FileReadTool;

#[async_trait]
impl Tool for FileReadTool {
    fn name(&self) -> &str {
        "file_read_tool"
    }

    fn description(&self) -> &str {
        "Read a text file from the workspace. Returns the content, \
         truncated at the configured size cap."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path relative to the workspace root"
                }
            },
            "required": ["path"]
        })
    }

    fn capabilities(&self) -> &[Capability] {
        READ_CAPABILITIES
    }

    fn validate_args(&self, args: &serde_json::Value) -> Result<()> {
        require_str(args, "path").map(|_| ())
    }

    async fn execute(
        &self,
        args: &serde_json::Value,
        ctx: &ToolContext,
        _signal: &AbortSignal,
    ) -> Result<ToolOutput> {
        let path = require_str(args, "path")?;
        let resolved = resolve_in_workspace(&ctx.config.workspace_root(), path)?;
        let max_bytes = ctx.config.get_u64("tools.file_max_bytes", 262_144) as usize;

        let bytes = tokio::fs::read(&resolved)
            .await
            .map_err(|e| DbRheoError::tool_execution(format!("Cannot read '{path}': {e}")))?;
        let truncated = bytes.len() > max_bytes;
        let slice = &bytes[..bytes.len().min(max_bytes)];
        let content = String::from_utf8_lossy(slice).into_owned();

        Ok(ToolOutput::new(
            serde_json::json!({
                "path": path,
                "content": content,
                "bytes": bytes.len(),
                "truncated": truncated,
            }),
            format!("read {} bytes from {path}", bytes.len()),
        ))
    }
}

/// Writes a workspace file.
pub struct FileWriteTool;

#[async_trait]
impl Tool for FileWriteTool {
    fn name(&self) -> &str {
        "file_write_tool"
    }

    fn description(&self) -> &str {
        "Write a text file inside the workspace, creating parent \
         directories as needed. Set 'append' to add to an existing file."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path relative to the workspace root"
                },
                "content": {
                    "type": "string",
                    "description": "Text content to write"
                },
                "append": {
                    "type": "boolean",
                    "description": "Append instead of overwrite (default: false)"
                }
            },
            "required": ["path", "content"]
        })
    }

    fn capabilities(&self) -> &[Capability] {
        WRITE_CAPABILITIES
    }

    fn validate_args(&self, args: &serde_json::Value) -> Result<()> {
        require_str(args, "path")?;
        require_str(args, "content").map(|_| ())
    }

    async fn execute(
        &self,
        args: &serde_json::Value,
        ctx: &ToolContext,
        _signal: &AbortSignal,
    ) -> Result<ToolOutput> {
        let path = require_str(args, "path")?;
        let content = require_str(args, "content")?;
        let append = args.get("append").and_then(|v| v.as_bool()).unwrap_or(false);
        let resolved = resolve_in_workspace(&ctx.config.workspace_root(), path)?;

        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DbRheoError::tool_execution(format!("Cannot create {parent:?}: {e}")))?;
        }

        if append {
            use tokio::io::AsyncWriteExt;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&resolved)
                .await
                .map_err(|e| DbRheoError::tool_execution(format!("Cannot open '{path}': {e}")))?;
            file.write_all(content.as_bytes())
                .await
                .map_err(|e| DbRheoError::tool_execution(format!("Cannot write '{path}': {e}")))?;
        } else {
            tokio::fs::write(&resolved, content)
                .await
                .map_err(|e| DbRheoError::tool_execution(format!("Cannot write '{path}': {e}")))?;
        }

        Ok(ToolOutput::new(
            serde_json::json!({
                "path": path,
                "bytes_written": content.len(),
                "appended": append,
            }),
            format!("wrote {} bytes to {path}", content.len()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::connection::ConnectionManager;
    use crate::db::AdapterFactory;
    use std::sync::Arc;

    fn context_in(dir: &Path) -> ToolContext {
        let overrides: serde_yaml::Value = serde_yaml::from_str(&format!(
            "workspace_root: {}",
            dir.display()
        ))
        .unwrap();
        ToolContext::new(
            Arc::new(AgentConfig::for_tests(overrides)),
            Arc::new(ConnectionManager::new(Arc::new(AdapterFactory::new()))),
        )
    }

    #[tokio::test]
    async fn test_write_then_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_in(dir.path());
        let signal = AbortSignal::new();

        FileWriteTool
            .execute(
                &serde_json::json!({"path": "out/notes.txt", "content": "hello"}),
                &ctx,
                &signal,
            )
            .await
            .unwrap();

        let output = FileReadTool
            .execute(&serde_json::json!({"path": "out/notes.txt"}), &ctx, &signal)
            .await
            .unwrap();
        assert_eq!(output.content["content"], "hello");
        assert_eq!(output.content["truncated"], false);
    }

    #[tokio::test]
    async fn test_append_mode() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_in(dir.path());
        let signal = AbortSignal::new();

        for part in ["a", "b"] {
            FileWriteTool
                .execute(
                    &serde_json::json!({"path": "log.txt", "content": part, "append": true}),
                    &ctx,
                    &signal,
                )
                .await
                .unwrap();
        }

        let output = FileReadTool
            .execute(&serde_json::json!({"path": "log.txt"}), &ctx, &signal)
            .await
            .unwrap();
        assert_eq!(output.content["content"], "ab");
    }

    #[tokio::test]
    async fn test_escape_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_in(dir.path());
        let signal = AbortSignal::new();

        let err = FileWriteTool
            .execute(
                &serde_json::json!({"path": "../escape.txt", "content": "x"}),
                &ctx,
                &signal,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ToolExecutionError");

        let err = FileReadTool
            .execute(&serde_json::json!({"path": "/etc/passwd"}), &ctx, &signal)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ToolExecutionError");
    }

    #[tokio::test]
    async fn test_read_truncates_at_cap() {
        let dir = tempfile::tempdir().unwrap();
        let overrides: serde_yaml::Value = serde_yaml::from_str(&format!(
            "workspace_root: {}\ntools:\n  file_max_bytes: 4",
            dir.path().display()
        ))
        .unwrap();
        let ctx = ToolContext::new(
            Arc::new(AgentConfig::for_tests(overrides)),
            Arc::new(ConnectionManager::new(Arc::new(AdapterFactory::new()))),
        );
        let signal = AbortSignal::new();

        FileWriteTool
            .execute(
                &serde_json::json!({"path": "big.txt", "content": "0123456789"}),
                &ctx,
                &signal,
            )
            .await
            .unwrap();
        let output = FileReadTool
            .execute(&serde_json::json!({"path": "big.txt"}), &ctx, &signal)
            .await
            .unwrap();
        assert_eq!(output.content["content"], "0123");
        assert_eq!(output.content["truncated"], true);
    }
}
