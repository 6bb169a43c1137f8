//! Mock adapters for testing.
//!
//! `MockAdapter` returns canned results and records executed SQL;
//! `FailingAdapter` errors on everything, for health-check and eviction
//! paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;

use super::{
    ColumnInfo, DatabaseAdapter, Dialect, IsolationLevel, QueryOptions, ResultSet, RowBatch,
    Schema, TxHandle, Value,
};
use crate::error::{DbRheoError, Result};
use crate::risk::sql_is_mutating;

/// A mock adapter that returns predefined results.
pub struct MockAdapter {
    schema: Schema,
    read_only: bool,
    /// Canned results keyed by a case-insensitive SQL substring.
    canned: Mutex<HashMap<String, ResultSet>>,
    /// Every statement executed, in order.
    executed: Mutex<Vec<String>>,
    /// Artificial latency applied to each query.
    latency: Duration,
    tx_depth: AtomicUsize,
}

impl MockAdapter {
    /// Creates a mock with an empty schema.
    pub fn new() -> Self {
        Self {
            schema: Schema::default(),
            read_only: false,
            canned: Mutex::new(HashMap::new()),
            executed: Mutex::new(Vec::new()),
            latency: Duration::ZERO,
            tx_depth: AtomicUsize::new(0),
        }
    }

    /// Creates a mock with the given schema.
    pub fn with_schema(schema: Schema) -> Self {
        Self {
            schema,
            ..Self::new()
        }
    }

    /// Marks the adapter read-only.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Adds artificial per-query latency.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Registers a canned result returned when the executed SQL contains
    /// `needle` (case-insensitive).
    pub fn stub(self, needle: impl Into<String>, result: ResultSet) -> Self {
        self.canned
            .lock()
            .expect("mock lock poisoned")
            .insert(needle.into().to_lowercase(), result);
        self
    }

    /// Statements executed so far, in order.
    pub fn executed_sql(&self) -> Vec<String> {
        self.executed.lock().expect("mock lock poisoned").clone()
    }

    fn default_result(sql: &str) -> ResultSet {
        if sql.trim_start().to_uppercase().starts_with("SELECT") {
            ResultSet::with_data(
                vec![ColumnInfo::new("result", "text")],
                vec![vec![Value::String(format!("Mock result for: {sql}"))]],
            )
            .with_elapsed(Duration::from_millis(1))
        } else {
            ResultSet::affected(1).with_elapsed(Duration::from_millis(1))
        }
    }
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DatabaseAdapter for MockAdapter {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn execute_query(
        &self,
        sql: &str,
        _params: &[Value],
        opts: &QueryOptions,
    ) -> Result<ResultSet> {
        if (self.read_only || opts.read_only) && sql_is_mutating(sql) {
            return Err(DbRheoError::read_only(
                "Mock connection is read-only",
            ));
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.executed
            .lock()
            .expect("mock lock poisoned")
            .push(sql.to_string());

        let lowered = sql.to_lowercase();
        let canned = self.canned.lock().expect("mock lock poisoned");
        let hit = canned
            .iter()
            .find(|(needle, _)| lowered.contains(needle.as_str()))
            .map(|(_, rs)| rs.clone());
        Ok(hit.unwrap_or_else(|| Self::default_result(sql)))
    }

    async fn execute_stream(
        &self,
        sql: &str,
        params: &[Value],
        opts: &QueryOptions,
    ) -> Result<BoxStream<'static, Result<RowBatch>>> {
        let result = self.execute_query(sql, params, opts).await?;
        let batch = RowBatch {
            columns: result.columns,
            rows: result.rows,
        };
        Ok(futures::stream::iter(vec![Ok(batch)]).boxed())
    }

    async fn begin_tx(&self, _isolation: Option<IsolationLevel>) -> Result<TxHandle> {
        if self.read_only {
            return Err(DbRheoError::read_only(
                "Cannot begin a transaction on a read-only connection",
            ));
        }
        let depth = self.tx_depth.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(TxHandle { depth })
    }

    async fn commit(&self, handle: TxHandle) -> Result<()> {
        let depth = self.tx_depth.load(Ordering::SeqCst);
        if depth == 0 || handle.depth != depth {
            return Err(DbRheoError::tx_state("commit out of order"));
        }
        self.tx_depth.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self, handle: TxHandle) -> Result<()> {
        let depth = self.tx_depth.load(Ordering::SeqCst);
        if depth == 0 || handle.depth != depth {
            return Err(DbRheoError::tx_state("rollback out of order"));
        }
        self.tx_depth.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    async fn introspect(&self) -> Result<Schema> {
        Ok(self.schema.clone())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

/// An adapter whose every operation fails, for exercising eviction and
/// error paths.
pub struct FailingAdapter;

#[async_trait]
impl DatabaseAdapter for FailingAdapter {
    async fn connect(&self) -> Result<()> {
        Err(DbRheoError::connect("mock connect failure"))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn execute_query(
        &self,
        _sql: &str,
        _params: &[Value],
        _opts: &QueryOptions,
    ) -> Result<ResultSet> {
        Err(DbRheoError::query("mock query failure"))
    }

    async fn execute_stream(
        &self,
        _sql: &str,
        _params: &[Value],
        _opts: &QueryOptions,
    ) -> Result<BoxStream<'static, Result<RowBatch>>> {
        Err(DbRheoError::query("mock stream failure"))
    }

    async fn begin_tx(&self, _isolation: Option<IsolationLevel>) -> Result<TxHandle> {
        Err(DbRheoError::tx_state("mock begin failure"))
    }

    async fn commit(&self, _tx: TxHandle) -> Result<()> {
        Err(DbRheoError::tx_state("mock commit failure"))
    }

    async fn rollback(&self, _tx: TxHandle) -> Result<()> {
        Err(DbRheoError::tx_state("mock rollback failure"))
    }

    async fn introspect(&self) -> Result<Schema> {
        Err(DbRheoError::query("mock introspect failure"))
    }

    async fn health_check(&self) -> Result<()> {
        Err(DbRheoError::connect("mock health failure"))
    }

    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn is_read_only(&self) -> bool {
        false
    }
}
