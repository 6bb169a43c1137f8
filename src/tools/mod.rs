//! Tool protocol: the trait every unit of work implements, plus the shared
//! invocation context.
//!
//! Tools are discovered by name through the registry, classified by the
//! risk evaluator, and driven by the scheduler. A tool never holds a
//! reference to the scheduler; it receives a read-only context and an abort
//! signal per invocation.

mod code;
mod export;
mod file;
mod http;
mod registry;
mod schema;
mod shell;
mod sql;

pub use code::CodeTool;
pub use export::ExportTool;
pub use file::{FileReadTool, FileWriteTool};
pub use http::HttpTool;
pub use registry::{ToolDeclaration, ToolRegistration, ToolRegistry};
pub use schema::SchemaTool;
pub use shell::ShellTool;
pub use sql::SqlTool;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::AgentConfig;
use crate::connection::ConnectionManager;
use crate::error::{DbRheoError, Result};
use crate::types::AbortSignal;

/// Coarse classification of the effect a tool has. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    Query,
    Modify,
    SchemaChange,
    Explore,
    Analyze,
    Export,
    Read,
    Write,
    Import,
    Backup,
    Transform,
}

impl Capability {
    /// Returns the capability as a string for search and persistence.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Modify => "modify",
            Self::SchemaChange => "schema_change",
            Self::Explore => "explore",
            Self::Analyze => "analyze",
            Self::Export => "export",
            Self::Read => "read",
            Self::Write => "write",
            Self::Import => "import",
            Self::Backup => "backup",
            Self::Transform => "transform",
        }
    }

    /// True for capabilities the scheduler may run concurrently.
    pub fn side_effect_free(&self) -> bool {
        matches!(self, Self::Query | Self::Explore | Self::Analyze | Self::Read)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "query" => Ok(Self::Query),
            "modify" => Ok(Self::Modify),
            "schema_change" => Ok(Self::SchemaChange),
            "explore" => Ok(Self::Explore),
            "analyze" => Ok(Self::Analyze),
            "export" => Ok(Self::Export),
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            "import" => Ok(Self::Import),
            "backup" => Ok(Self::Backup),
            "transform" => Ok(Self::Transform),
            _ => Err(format!("Unknown capability: {s}")),
        }
    }
}

/// What a finished tool call hands back: a JSON payload for the model and
/// a one-line summary for the host UI.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub content: serde_json::Value,
    pub summary: String,
}

impl ToolOutput {
    /// Creates an output with a payload and summary.
    pub fn new(content: serde_json::Value, summary: impl Into<String>) -> Self {
        Self {
            content,
            summary: summary.into(),
        }
    }
}

/// Read-only context handed to every tool invocation.
#[derive(Clone)]
pub struct ToolContext {
    pub config: Arc<AgentConfig>,
    pub connections: Arc<ConnectionManager>,
}

impl ToolContext {
    /// Creates a context.
    pub fn new(config: Arc<AgentConfig>, connections: Arc<ConnectionManager>) -> Self {
        Self {
            config,
            connections,
        }
    }
}

/// A concrete unit of work the model can invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Stable tool name, `[a-z][a-z0-9_]{0,63}`.
    fn name(&self) -> &str;

    /// Short description for the registry snapshot.
    fn description(&self) -> &str;

    /// JSON-schema shaped parameter description.
    fn parameters(&self) -> serde_json::Value;

    /// The capabilities this tool claims.
    fn capabilities(&self) -> &[Capability];

    /// Default execution timeout; overridable per call via `_timeout_ms`.
    fn default_timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    /// Cheap argument validation run before the risk gate.
    fn validate_args(&self, _args: &serde_json::Value) -> Result<()> {
        Ok(())
    }

    /// Executes the tool.
    async fn execute(
        &self,
        args: &serde_json::Value,
        ctx: &ToolContext,
        signal: &AbortSignal,
    ) -> Result<ToolOutput>;
}

/// Pulls a required string argument.
pub(crate) fn require_str<'a>(args: &'a serde_json::Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| DbRheoError::invalid_tool_call(format!("missing string argument '{key}'")))
}

/// Registers the built-in tool set on a registry.
pub fn register_builtin_tools(registry: &ToolRegistry) -> Result<()> {
    registry.register(Arc::new(SqlTool), vec![], 100, serde_json::Value::Null)?;
    registry.register(Arc::new(SchemaTool), vec![], 90, serde_json::Value::Null)?;
    registry.register(Arc::new(FileReadTool), vec![], 50, serde_json::Value::Null)?;
    registry.register(Arc::new(FileWriteTool), vec![], 50, serde_json::Value::Null)?;
    registry.register(Arc::new(ExportTool), vec![], 40, serde_json::Value::Null)?;
    registry.register(Arc::new(ShellTool), vec![], 30, serde_json::Value::Null)?;
    registry.register(Arc::new(HttpTool), vec![], 20, serde_json::Value::Null)?;
    registry.register(Arc::new(CodeTool), vec![], 10, serde_json::Value::Null)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_round_trip() {
        for cap in [
            Capability::Query,
            Capability::Modify,
            Capability::SchemaChange,
            Capability::Explore,
            Capability::Analyze,
            Capability::Export,
            Capability::Read,
            Capability::Write,
            Capability::Import,
            Capability::Backup,
            Capability::Transform,
        ] {
            assert_eq!(cap.as_str().parse::<Capability>().unwrap(), cap);
        }
    }

    #[test]
    fn test_side_effect_free_capabilities() {
        assert!(Capability::Query.side_effect_free());
        assert!(Capability::Explore.side_effect_free());
        assert!(Capability::Read.side_effect_free());
        assert!(Capability::Analyze.side_effect_free());
        assert!(!Capability::Modify.side_effect_free());
        assert!(!Capability::Write.side_effect_free());
        assert!(!Capability::SchemaChange.side_effect_free());
        assert!(!Capability::Transform.side_effect_free());
    }

    #[test]
    fn test_require_str() {
        let args = serde_json::json!({"sql": "SELECT 1"});
        assert_eq!(require_str(&args, "sql").unwrap(), "SELECT 1");
        let err = require_str(&args, "missing").unwrap_err();
        assert_eq!(err.kind(), "InvalidToolCallError");
    }

    #[test]
    fn test_register_builtin_tools() {
        let registry = ToolRegistry::new();
        register_builtin_tools(&registry).unwrap();
        assert!(registry.get("sql_tool").is_some());
        assert!(registry.get("schema_tool").is_some());
        assert!(registry.get("shell_tool").is_some());
        assert!(registry.get("http_tool").is_some());
        assert!(registry.get("code_tool").is_some());
        assert!(registry.get("export_tool").is_some());
        assert!(registry.get("file_read_tool").is_some());
        assert!(registry.get("file_write_tool").is_some());
    }
}
