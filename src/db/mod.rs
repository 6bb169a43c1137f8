//! Database abstraction layer.
//!
//! Provides a trait-based interface for database operations so different
//! backends can be used interchangeably, plus the factory that builds and
//! caches adapters from structured configs or connection strings.

mod factory;
mod mock;
mod mysql;
mod postgres;
mod schema;
mod sqlite;
mod types;

pub use factory::{reset_adapter_caches, AdapterFactory, DatabaseConfig, PoolSettings};
pub use mock::{FailingAdapter, MockAdapter};
pub use mysql::MySqlAdapter;
pub use postgres::PostgresAdapter;
pub use schema::{Column, ForeignKey, Index, Schema, Table};
pub use sqlite::SqliteAdapter;
pub use types::{ColumnInfo, QueryOptions, ResultSet, Row, RowBatch, Value};

use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;

/// Supported database dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Sqlite,
    Postgres,
    MySql,
}

impl Dialect {
    /// Returns the dialect as a string for persistence and cache keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgresql",
            Self::MySql => "mysql",
        }
    }

    /// Parses a dialect from a URL scheme or persisted string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "sqlite" => Some(Self::Sqlite),
            "postgres" | "postgresql" => Some(Self::Postgres),
            "mysql" | "mariadb" => Some(Self::MySql),
            _ => None,
        }
    }

    /// Returns the default port for networked dialects.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Self::Sqlite => None,
            Self::Postgres => Some(5432),
            Self::MySql => Some(3306),
        }
    }

    /// Whether the dialect maps nested transactions onto savepoints.
    pub fn supports_savepoints(&self) -> bool {
        true
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Transaction isolation levels. Dialects that do not support a level fall
/// back to their default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

/// Handle to an open transaction frame. Depth 1 is the outermost
/// transaction; deeper frames are savepoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxHandle {
    pub(crate) depth: usize,
}

impl TxHandle {
    /// The nesting depth of this frame (1 = outermost).
    pub fn depth(&self) -> usize {
        self.depth
    }
}

/// Trait defining the interface for database adapters.
///
/// Adapters are not assumed internally thread-safe with respect to
/// statement interleaving; the connection manager serializes statements per
/// connection. All operations are async and return [`crate::error::Result`].
#[async_trait]
pub trait DatabaseAdapter: Send + Sync {
    /// Establishes the underlying pool. Idempotent: a second call on a
    /// connected adapter is a no-op.
    async fn connect(&self) -> Result<()>;

    /// Closes the pool and releases resources.
    async fn close(&self) -> Result<()>;

    /// Executes a single statement and materializes the result.
    async fn execute_query(
        &self,
        sql: &str,
        params: &[Value],
        opts: &QueryOptions,
    ) -> Result<ResultSet>;

    /// Executes a query lazily, yielding row batches. The stream is finite
    /// and not restartable.
    async fn execute_stream(
        &self,
        sql: &str,
        params: &[Value],
        opts: &QueryOptions,
    ) -> Result<BoxStream<'static, Result<RowBatch>>>;

    /// Begins a transaction, or a savepoint when one is already open.
    async fn begin_tx(&self, isolation: Option<IsolationLevel>) -> Result<TxHandle>;

    /// Commits the given frame. Must be the innermost open frame.
    async fn commit(&self, tx: TxHandle) -> Result<()>;

    /// Rolls back the given frame. Must be the innermost open frame.
    async fn rollback(&self, tx: TxHandle) -> Result<()>;

    /// Introspects tables, views, and relationships.
    async fn introspect(&self) -> Result<Schema>;

    /// Cheap liveness probe with a bounded timeout.
    async fn health_check(&self) -> Result<()>;

    /// The adapter's dialect.
    fn dialect(&self) -> Dialect;

    /// Whether this adapter rejects mutating statements.
    fn is_read_only(&self) -> bool;
}

/// Returns true when the statement's first significant keyword indicates a
/// row-returning query, used to route between fetch and execute paths.
pub(crate) fn statement_returns_rows(sql: &str) -> bool {
    let first = sql
        .trim_start()
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();
    matches!(
        first.as_str(),
        "SELECT" | "WITH" | "SHOW" | "EXPLAIN" | "PRAGMA" | "DESCRIBE" | "DESC" | "VALUES"
    )
}
