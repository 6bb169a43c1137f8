//! Schema discovery tool.

use async_trait::async_trait;

use super::{Capability, Tool, ToolContext, ToolOutput};
use crate::error::{DbRheoError, Result};
use crate::types::AbortSignal;

const CAPABILITIES: &[Capability] = &[Capability::Explore, Capability::Analyze];

/// Introspects the connected database: table listing or per-table detail.
pub struct SchemaTool;

#[async_trait]
impl Tool for SchemaTool {
    fn name(&self) -> &str {
        "schema_tool"
    }

    fn description(&self) -> &str {
        "Explore the database schema. Without arguments, lists all tables \
         and views. With a 'table' argument, returns that table's columns, \
         indexes, and foreign keys."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "table": {
                    "type": "string",
                    "description": "Table to describe in detail (optional)"
                },
                "connection": {
                    "type": "string",
                    "description": "Named connection alias (defaults to the current connection)"
                }
            },
            "required": []
        })
    }

    fn capabilities(&self) -> &[Capability] {
        CAPABILITIES
    }

    async fn execute(
        &self,
        args: &serde_json::Value,
        ctx: &ToolContext,
        _signal: &AbortSignal,
    ) -> Result<ToolOutput> {
        let connection = match args.get("connection").and_then(|v| v.as_str()) {
            Some(alias) => ctx.connections.get(alias).await?,
            None => ctx.connections.current_checked().await?,
        };
        let schema = connection.adapter.introspect().await?;

        if let Some(table_name) = args.get("table").and_then(|v| v.as_str()) {
            let table = schema.table(table_name).ok_or_else(|| {
                DbRheoError::query(format!("Table '{table_name}' does not exist"))
            })?;
            let content = serde_json::to_value(table)
                .map_err(|e| DbRheoError::internal(format!("schema serialization: {e}")))?;
            return Ok(ToolOutput::new(
                content,
                format!("{} columns in {}", table.columns.len(), table.name),
            ));
        }

        let content = serde_json::json!({
            "tables": schema
                .tables
                .iter()
                .map(|t| serde_json::json!({
                    "name": t.name,
                    "columns": t.columns.len(),
                    "primary_key": t.primary_key(),
                }))
                .collect::<Vec<_>>(),
            "views": schema.views,
            "procedures": schema.procedures,
        });
        Ok(ToolOutput::new(
            content,
            format!("{} tables, {} views", schema.tables.len(), schema.views.len()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::connection::ConnectionManager;
    use crate::db::{AdapterFactory, DatabaseConfig, QueryOptions};
    use std::sync::Arc;

    async fn context() -> ToolContext {
        let connections = Arc::new(ConnectionManager::new(Arc::new(AdapterFactory::new())));
        let conn = connections
            .open("main", DatabaseConfig::sqlite(":memory:"), true)
            .await
            .unwrap();
        conn.execute(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT NOT NULL)",
            &[],
            &QueryOptions::default(),
        )
        .await
        .unwrap();
        ToolContext::new(
            Arc::new(AgentConfig::for_tests(serde_yaml::Value::Null)),
            connections,
        )
    }

    #[tokio::test]
    async fn test_list_tables() {
        let ctx = context().await;
        let output = SchemaTool
            .execute(&serde_json::json!({}), &ctx, &AbortSignal::new())
            .await
            .unwrap();
        assert_eq!(output.content["tables"][0]["name"], "users");
        assert!(output.summary.contains("1 tables"));
    }

    #[tokio::test]
    async fn test_describe_table() {
        let ctx = context().await;
        let output = SchemaTool
            .execute(
                &serde_json::json!({"table": "users"}),
                &ctx,
                &AbortSignal::new(),
            )
            .await
            .unwrap();
        assert_eq!(output.content["name"], "users");
        assert_eq!(output.content["columns"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_table_errors() {
        let ctx = context().await;
        let err = SchemaTool
            .execute(
                &serde_json::json!({"table": "ghost"}),
                &ctx,
                &AbortSignal::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "QueryError");
    }
}
