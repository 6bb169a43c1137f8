//! Risk classification for pending tool calls.
//!
//! A pure classifier: given a tool name, its arguments, and the config, it
//! produces a [`RiskAssessment`] that the scheduler uses to decide whether
//! the confirmation gate applies. SQL is parsed with sqlparser and walked
//! recursively (CTEs, set operations, derived tables); statements that do
//! not parse fall back to a keyword heuristic with a conservative default.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use sqlparser::ast::{Query, Select, SetExpr, Statement, TableFactor, TableWithJoins};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use crate::config::AgentConfig;

/// Risk level of a pending call, from harmless to catastrophic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RiskLevel {
    Safe,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Returns the level as a string for events and persistence.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "safe" => Ok(Self::Safe),
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(format!("Unknown risk level: {s}")),
        }
    }
}

/// The outcome of classifying a pending call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiskAssessment {
    /// The determined level.
    pub level: RiskLevel,
    /// Human-readable reasons feeding the confirmation prompt.
    pub reasons: Vec<String>,
    /// Whether the confirmation gate applies.
    pub requires_confirmation: bool,
}

impl RiskAssessment {
    fn new(level: RiskLevel, reasons: Vec<String>, config: &AgentConfig) -> Self {
        let threshold = config
            .confirmation_threshold()
            .parse::<RiskLevel>()
            .unwrap_or(RiskLevel::Medium);
        let requires_confirmation = level >= threshold && !config.allows_dangerous();
        Self {
            level,
            reasons,
            requires_confirmation,
        }
    }
}

/// Classifies a pending tool call. Never executes anything.
pub fn evaluate(tool_name: &str, args: &serde_json::Value, config: &AgentConfig) -> RiskAssessment {
    let (level, reasons) = match tool_name {
        "sql_tool" | "export_tool" => {
            let sql = args.get("sql").and_then(|v| v.as_str()).unwrap_or("");
            classify_sql(sql)
        }
        "shell_tool" => {
            let command = args.get("command").and_then(|v| v.as_str()).unwrap_or("");
            classify_shell(command, config)
        }
        "code_tool" => (
            RiskLevel::Medium,
            vec!["Arbitrary code execution".to_string()],
        ),
        "file_write_tool" => {
            let path = args.get("path").and_then(|v| v.as_str()).unwrap_or("");
            classify_file_write(path, config)
        }
        "file_read_tool" | "schema_tool" => (RiskLevel::Safe, Vec::new()),
        "http_tool" => (RiskLevel::Low, vec!["Outbound network request".to_string()]),
        _ => (
            RiskLevel::Medium,
            vec![format!("Unknown tool '{tool_name}'")],
        ),
    };
    RiskAssessment::new(level, reasons, config)
}

/// Returns true when the statement writes data or changes schema. Used by
/// read-only adapters to reject execution.
pub fn sql_is_mutating(sql: &str) -> bool {
    classify_sql(sql).0 > RiskLevel::Safe
}

/// Classifies a SQL string into a risk level plus reasons.
pub fn classify_sql(sql: &str) -> (RiskLevel, Vec<String>) {
    let trimmed = sql.trim();
    if trimmed.is_empty() {
        return (RiskLevel::High, vec!["Empty SQL statement".to_string()]);
    }

    match Parser::parse_sql(&GenericDialect {}, trimmed) {
        Ok(statements) if !statements.is_empty() => {
            let mut level = RiskLevel::Safe;
            let mut reasons = Vec::new();
            for stmt in &statements {
                let (stmt_level, reason) = classify_statement(stmt);
                if stmt_level > level {
                    level = stmt_level;
                }
                if let Some(reason) = reason {
                    reasons.push(reason);
                }
            }
            // Catalog targets escalate destructive DDL to critical.
            if level >= RiskLevel::High && targets_system_catalog(trimmed) {
                level = RiskLevel::Critical;
                reasons.push("Targets a system catalog".to_string());
            }
            (level, reasons)
        }
        _ => classify_by_keyword(trimmed),
    }
}

fn classify_statement(statement: &Statement) -> (RiskLevel, Option<String>) {
    match statement {
        // Queries may hide mutations inside CTEs; recurse.
        Statement::Query(query) => (classify_query(query), None),

        Statement::Explain {
            analyze, statement, ..
        } => {
            if *analyze {
                // EXPLAIN ANALYZE executes the inner statement.
                let (inner, _) = classify_statement(statement);
                (inner, None)
            } else {
                (RiskLevel::Safe, None)
            }
        }

        Statement::ShowVariable { .. }
        | Statement::ShowTables { .. }
        | Statement::ShowColumns { .. }
        | Statement::ShowCreate { .. }
        | Statement::ShowFunctions { .. }
        | Statement::ShowStatus { .. }
        | Statement::ShowCollation { .. } => (RiskLevel::Safe, None),

        Statement::Insert(_) => (RiskLevel::Low, Some("Inserts rows".to_string())),

        Statement::CreateTable { .. }
        | Statement::CreateIndex { .. }
        | Statement::CreateView { .. }
        | Statement::CreateSchema { .. }
        | Statement::CreateDatabase { .. }
        | Statement::CreateFunction { .. }
        | Statement::CreateProcedure { .. }
        | Statement::CreateSequence { .. }
        | Statement::CreateType { .. } => {
            (RiskLevel::Low, Some("Creates a new object".to_string()))
        }

        Statement::Update(update) => {
            if update.selection.is_some() {
                (RiskLevel::Medium, Some("Updates filtered rows".to_string()))
            } else {
                (
                    RiskLevel::High,
                    Some("UPDATE without a WHERE clause touches every row".to_string()),
                )
            }
        }

        Statement::Delete(delete) => {
            if delete.selection.is_some() {
                (RiskLevel::Medium, Some("Deletes filtered rows".to_string()))
            } else {
                (
                    RiskLevel::High,
                    Some("DELETE without a WHERE clause removes every row".to_string()),
                )
            }
        }

        Statement::Merge { .. } => (RiskLevel::Medium, Some("Merges rows".to_string())),

        Statement::Drop { .. } => (
            RiskLevel::High,
            Some("Drops an object; cannot be undone".to_string()),
        ),
        Statement::Truncate { .. } => (
            RiskLevel::High,
            Some("Truncates all rows; cannot be undone".to_string()),
        ),
        Statement::AlterTable { .. }
        | Statement::AlterIndex { .. }
        | Statement::AlterView { .. }
        | Statement::AlterRole { .. } => (
            RiskLevel::High,
            Some("Alters schema".to_string()),
        ),
        Statement::Grant { .. } | Statement::Revoke { .. } => (
            RiskLevel::High,
            Some("Changes privileges".to_string()),
        ),

        // Conservative default for anything unrecognized.
        _ => (
            RiskLevel::High,
            Some("Unrecognized statement type".to_string()),
        ),
    }
}

/// Walks a Query for data-modifying CTEs or subqueries; returns the worst
/// level found.
fn classify_query(query: &Query) -> RiskLevel {
    let mut level = RiskLevel::Safe;

    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            level = level.max(classify_query(&cte.query));
        }
    }

    level.max(classify_set_expr(&query.body))
}

fn classify_set_expr(set_expr: &SetExpr) -> RiskLevel {
    match set_expr {
        SetExpr::Delete(stmt)
        | SetExpr::Update(stmt)
        | SetExpr::Insert(stmt)
        | SetExpr::Merge(stmt) => classify_statement(stmt).0,
        SetExpr::Query(query) => classify_query(query),
        SetExpr::Select(select) => classify_select(select),
        SetExpr::SetOperation { left, right, .. } => {
            classify_set_expr(left).max(classify_set_expr(right))
        }
        SetExpr::Values(_) | SetExpr::Table(_) => RiskLevel::Safe,
    }
}

fn classify_select(select: &Select) -> RiskLevel {
    select
        .from
        .iter()
        .map(classify_table_with_joins)
        .max()
        .unwrap_or(RiskLevel::Safe)
}

fn classify_table_with_joins(twj: &TableWithJoins) -> RiskLevel {
    let mut level = classify_table_factor(&twj.relation);
    for join in &twj.joins {
        level = level.max(classify_table_factor(&join.relation));
    }
    level
}

fn classify_table_factor(factor: &TableFactor) -> RiskLevel {
    match factor {
        TableFactor::Derived { subquery, .. } => classify_query(subquery),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => classify_table_with_joins(table_with_joins),
        _ => RiskLevel::Safe,
    }
}

/// Keyword fallback when the SQL does not parse. The first significant
/// token decides; unknown statements are treated as destructive.
fn classify_by_keyword(sql: &str) -> (RiskLevel, Vec<String>) {
    let upper = sql.to_uppercase();
    let first = upper.split_whitespace().next().unwrap_or("");

    let (level, reason) = match first {
        "SELECT" | "SHOW" | "EXPLAIN" | "DESCRIBE" | "DESC" | "PRAGMA" => (RiskLevel::Safe, None),
        "INSERT" | "CREATE" => (RiskLevel::Low, None),
        "UPDATE" | "DELETE" => {
            if upper.contains(" WHERE ") {
                (RiskLevel::Medium, None)
            } else {
                (
                    RiskLevel::High,
                    Some(format!("{first} without a WHERE clause")),
                )
            }
        }
        "DROP" | "TRUNCATE" | "ALTER" | "GRANT" | "REVOKE" => (
            RiskLevel::High,
            Some(format!("{first} cannot be undone")),
        ),
        _ => (
            RiskLevel::High,
            Some("Could not parse SQL; treating as destructive".to_string()),
        ),
    };

    let mut reasons: Vec<String> = reason.into_iter().collect();
    if level >= RiskLevel::High && targets_system_catalog(sql) {
        reasons.push("Targets a system catalog".to_string());
        return (RiskLevel::Critical, reasons);
    }
    (level, reasons)
}

fn targets_system_catalog(sql: &str) -> bool {
    let lowered = sql.to_lowercase();
    ["pg_catalog.", "information_schema.", "mysql.", "sqlite_master"]
        .iter()
        .any(|catalog| lowered.contains(catalog))
}

fn classify_shell(command: &str, config: &AgentConfig) -> (RiskLevel, Vec<String>) {
    if command.trim().is_empty() {
        return (RiskLevel::High, vec!["Empty shell command".to_string()]);
    }

    for pattern in config.shell_denylist() {
        if let Ok(re) = regex::Regex::new(&pattern) {
            if re.is_match(command) {
                return (
                    RiskLevel::Critical,
                    vec![format!("Command matches deny pattern '{pattern}'")],
                );
            }
        }
    }

    let program = command.split_whitespace().next().unwrap_or("");
    if config.shell_allowlist().iter().any(|allowed| allowed == program) {
        (RiskLevel::Low, Vec::new())
    } else {
        (
            RiskLevel::High,
            vec![format!("'{program}' is not on the shell allowlist")],
        )
    }
}

fn classify_file_write(path: &str, config: &AgentConfig) -> (RiskLevel, Vec<String>) {
    let workspace = config.workspace_root();
    let target = Path::new(path);
    let resolved = if target.is_absolute() {
        target.to_path_buf()
    } else {
        workspace.join(target)
    };

    // Lexical containment check; `..` components escape the workspace.
    let escapes = resolved
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
        || !resolved.starts_with(&workspace);

    if escapes {
        (
            RiskLevel::High,
            vec![format!("Write outside the workspace root: {path}")],
        )
    } else {
        (RiskLevel::Low, vec!["Writes a workspace file".to_string()])
    }
}
