//! Query export tool.
//!
//! Runs a query and writes the result to a workspace file as CSV or JSON.

use std::time::Duration;

use async_trait::async_trait;

use super::sql::result_to_json;
use super::{require_str, Capability, Tool, ToolContext, ToolOutput};
use crate::db::{QueryOptions, ResultSet, Value};
use crate::error::{DbRheoError, Result};
use crate::types::AbortSignal;

const CAPABILITIES: &[Capability] = &[Capability::Query, Capability::Export, Capability::Write];

/// Exports query results to a file.
pub struct ExportTool;

#[async_trait]
impl Tool for ExportTool {
    fn name(&self) -> &str {
        "export_tool"
    }

    fn description(&self) -> &str {
        "Run a query and export the result to a workspace file as CSV or \
         JSON."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "sql": {
                    "type": "string",
                    "description": "The query to export"
                },
                "path": {
                    "type": "string",
                    "description": "Output path relative to the workspace root"
                },
                "format": {
                    "type": "string",
                    "enum": ["csv", "json"],
                    "description": "Output format (default: csv)"
                },
                "connection": {
                    "type": "string",
                    "description": "Named connection alias (defaults to the current connection)"
                }
            },
            "required": ["sql", "path"]
        })
    }

    fn capabilities(&self) -> &[Capability] {
        CAPABILITIES
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_secs(120)
    }

    fn validate_args(&self, args: &serde_json::Value) -> Result<()> {
        require_str(args, "sql")?;
        require_str(args, "path").map(|_| ())
    }

    async fn execute(
        &self,
        args: &serde_json::Value,
        ctx: &ToolContext,
        signal: &AbortSignal,
    ) -> Result<ToolOutput> {
        let sql = require_str(args, "sql")?;
        let path = require_str(args, "path")?;
        let format = args
            .get("format")
            .and_then(|v| v.as_str())
            .unwrap_or("csv")
            .to_lowercase();

        let connection = match args.get("connection").and_then(|v| v.as_str()) {
            Some(alias) => ctx.connections.get(alias).await?,
            None => ctx.connections.current_checked().await?,
        };

        // Exports read at a higher cap than interactive queries.
        let opts = QueryOptions {
            timeout: None,
            max_rows: Some(100_000),
            read_only: true,
        };
        let result = connection.execute(sql, &[], &opts).await?;

        if signal.is_tripped() {
            return Err(DbRheoError::Cancelled);
        }

        let rendered = match format.as_str() {
            "csv" => render_csv(&result),
            "json" => serde_json::to_string_pretty(&result_to_json(&result))
                .map_err(|e| DbRheoError::internal(format!("JSON render: {e}")))?,
            other => {
                return Err(DbRheoError::invalid_tool_call(format!(
                    "Unsupported export format '{other}'"
                )))
            }
        };

        // Reuse the file tool for path containment and directory creation.
        super::FileWriteTool
            .execute(
                &serde_json::json!({"path": path, "content": rendered}),
                ctx,
                signal,
            )
            .await?;

        Ok(ToolOutput::new(
            serde_json::json!({
                "path": path,
                "format": format,
                "rows": result.rows.len(),
                "truncated": result.truncated,
            }),
            format!("exported {} rows to {path}", result.rows.len()),
        ))
    }
}

fn render_csv(result: &ResultSet) -> String {
    let mut out = String::new();
    let header: Vec<String> = result
        .columns
        .iter()
        .map(|c| csv_escape(&c.name))
        .collect();
    out.push_str(&header.join(","));
    out.push('\n');
    for row in &result.rows {
        let cells: Vec<String> = row
            .iter()
            .map(|v| match v {
                Value::Null => String::new(),
                other => csv_escape(&other.to_display_string()),
            })
            .collect();
        out.push_str(&cells.join(","));
        out.push('\n');
    }
    out
}

fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
