//! SQL execution tool.
//!
//! Runs a statement against the current (or a named) connection and hands
//! the result set back to the model as JSON. Row output is capped; the cap
//! is reported so the model knows the result was truncated.

use std::time::Duration;

use async_trait::async_trait;

use super::{require_str, Capability, Tool, ToolContext, ToolOutput};
use crate::db::{QueryOptions, ResultSet, Value};
use crate::error::Result;
use crate::types::AbortSignal;

const CAPABILITIES: &[Capability] = &[
    Capability::Query,
    Capability::Modify,
    Capability::SchemaChange,
];

/// Executes SQL on an active connection.
pub struct SqlTool;

#[async_trait]
impl Tool for SqlTool {
    fn name(&self) -> &str {
        "sql_tool"
    }

    fn description(&self) -> &str {
        "Execute a SQL statement against the current database connection. \
         Returns columns and rows for queries, or the affected row count for \
         data modification. Use the 'connection' argument to target a named \
         connection."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "sql": {
                    "type": "string",
                    "description": "The SQL statement to execute"
                },
                "connection": {
                    "type": "string",
                    "description": "Named connection alias (defaults to the current connection)"
                },
                "max_rows": {
                    "type": "integer",
                    "description": "Maximum rows to return (default: 1000)"
                }
            },
            "required": ["sql"]
        })
    }

    fn capabilities(&self) -> &[Capability] {
        CAPABILITIES
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_secs(60)
    }

    fn validate_args(&self, args: &serde_json::Value) -> Result<()> {
        require_str(args, "sql").map(|_| ())
    }

    async fn execute(
        &self,
        args: &serde_json::Value,
        ctx: &ToolContext,
        _signal: &AbortSignal,
    ) -> Result<ToolOutput> {
        let sql = require_str(args, "sql")?;
        let connection = match args.get("connection").and_then(|v| v.as_str()) {
            Some(alias) => ctx.connections.get(alias).await?,
            None => ctx.connections.current_checked().await?,
        };

        let opts = QueryOptions {
            timeout: None,
            max_rows: args
                .get("max_rows")
                .and_then(|v| v.as_u64())
                .map(|n| n as usize),
            read_only: false,
        };

        let result = connection.execute(sql, &[], &opts).await?;
        let summary = summarize(&result);
        Ok(ToolOutput::new(result_to_json(&result), summary))
    }
}

/// Renders a result set as the JSON payload for the model.
pub(crate) fn result_to_json(result: &ResultSet) -> serde_json::Value {
    serde_json::json!({
        "columns": result.columns.iter().map(|c| c.name.clone()).collect::<Vec<_>>(),
        "rows": result
            .rows
            .iter()
            .map(|row| row.iter().map(Value::to_json).collect::<Vec<_>>())
            .collect::<Vec<_>>(),
        "rows_affected": result.rows_affected,
        "truncated": result.truncated,
        "elapsed_ms": result.elapsed.as_millis() as u64,
    })
}

fn summarize(result: &ResultSet) -> String {
    if result.rows.is_empty() && result.rows_affected > 0 {
        format!(
            "{} rows affected in {}ms",
            result.rows_affected,
            result.elapsed.as_millis()
        )
    } else if result.truncated {
        format!(
            "{} rows (truncated) in {}ms",
            result.rows.len(),
            result.elapsed.as_millis()
        )
    } else {
        format!(
            "{} rows in {}ms",
            result.rows.len(),
            result.elapsed.as_millis()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::connection::ConnectionManager;
    use crate::db::{AdapterFactory, DatabaseConfig};
    use std::sync::Arc;

    async fn context() -> ToolContext {
        let connections = Arc::new(ConnectionManager::new(Arc::new(AdapterFactory::new())));
        connections
            .open("main", DatabaseConfig::sqlite(":memory:"), true)
            .await
            .unwrap();
        ToolContext::new(
            Arc::new(AgentConfig::for_tests(serde_yaml::Value::Null)),
            connections,
        )
    }

    #[test]
    fn test_validate_args() {
        let tool = SqlTool;
        assert!(tool.validate_args(&serde_json::json!({"sql": "SELECT 1"})).is_ok());
        assert!(tool.validate_args(&serde_json::json!({})).is_err());
    }

    #[tokio::test]
    async fn test_execute_select() {
        let ctx = context().await;
        let signal = AbortSignal::new();
        let output = SqlTool
            .execute(
                &serde_json::json!({"sql": "SELECT 1 AS a, 'x' AS b"}),
                &ctx,
                &signal,
            )
            .await
            .unwrap();

        assert_eq!(output.content["columns"], serde_json::json!(["a", "b"]));
        assert_eq!(output.content["rows"][0][0], serde_json::json!(1));
        assert!(output.summary.contains("1 rows"));
    }

    #[tokio::test]
    async fn test_execute_dml_reports_rows_affected() {
        let ctx = context().await;
        let signal = AbortSignal::new();
        SqlTool
            .execute(
                &serde_json::json!({"sql": "CREATE TABLE t (a INTEGER)"}),
                &ctx,
                &signal,
            )
            .await
            .unwrap();
        let output = SqlTool
            .execute(
                &serde_json::json!({"sql": "INSERT INTO t (a) VALUES (1), (2)"}),
                &ctx,
                &signal,
            )
            .await
            .unwrap();
        assert_eq!(output.content["rows_affected"], serde_json::json!(2));
    }

    #[tokio::test]
    async fn test_unknown_connection_alias_errors() {
        let ctx = context().await;
        let signal = AbortSignal::new();
        let err = SqlTool
            .execute(
                &serde_json::json!({"sql": "SELECT 1", "connection": "ghost"}),
                &ctx,
                &signal,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ConnectError");
    }
}
