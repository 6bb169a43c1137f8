//! PostgreSQL adapter implementation.
//!
//! Implements the `DatabaseAdapter` trait for PostgreSQL using sqlx.
//! Transactions run on a dedicated connection held for the duration of the
//! outermost frame; nested frames map to savepoints.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::{Column as SqlxColumn, Row as SqlxRow, TypeInfo};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::db::{
    statement_returns_rows, ColumnInfo, DatabaseAdapter, DatabaseConfig, Dialect, IsolationLevel,
    QueryOptions, ResultSet, Row, RowBatch, Schema, Table, TxHandle, Value,
};
use crate::db::schema::{Column, ForeignKey, Index};
use crate::error::{DbRheoError, Result};
use crate::risk::sql_is_mutating;

/// Default query timeout.
const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Default row cap for materialized results.
const DEFAULT_MAX_ROWS: usize = 1000;

/// Rows per streamed batch.
const STREAM_BATCH_SIZE: usize = 256;

/// Health probe timeout.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

/// Connection retry attempts.
const MAX_CONNECT_ATTEMPTS: u32 = 3;

/// Base delay between connect retries (doubles each retry).
const CONNECT_RETRY_BASE: Duration = Duration::from_millis(500);

struct TxState {
    conn: Option<sqlx::pool::PoolConnection<sqlx::Postgres>>,
    depth: usize,
}

/// PostgreSQL database adapter.
pub struct PostgresAdapter {
    config: DatabaseConfig,
    pool: tokio::sync::OnceCell<PgPool>,
    tx: tokio::sync::Mutex<TxState>,
}

impl PostgresAdapter {
    /// Creates an unconnected adapter. The pool is established on the first
    /// `connect` (or lazily by the first statement).
    pub fn new(config: DatabaseConfig) -> Self {
        Self {
            config,
            pool: tokio::sync::OnceCell::new(),
            tx: tokio::sync::Mutex::new(TxState {
                conn: None,
                depth: 0,
            }),
        }
    }

    async fn ensure_pool(&self) -> Result<&PgPool> {
        self.pool
            .get_or_try_init(|| async {
                let conn_str = self.config.to_url()?;
                let mut last_error = None;
                let mut delay = CONNECT_RETRY_BASE;

                for attempt in 1..=MAX_CONNECT_ATTEMPTS {
                    debug!("Connection attempt {} of {}", attempt, MAX_CONNECT_ATTEMPTS);
                    let result = PgPoolOptions::new()
                        .max_connections(self.config.pool.max_connections())
                        .acquire_timeout(Duration::from_secs(self.config.pool.timeout_secs))
                        .connect(&conn_str)
                        .await;

                    match result {
                        Ok(pool) => {
                            debug!("Connected to PostgreSQL");
                            return Ok(pool);
                        }
                        Err(e) => {
                            let transient = is_transient_error(&e);
                            last_error = Some(e);
                            if attempt < MAX_CONNECT_ATTEMPTS && transient {
                                warn!(
                                    "Connection attempt {} failed (transient), retrying in {:?}",
                                    attempt, delay
                                );
                                tokio::time::sleep(delay).await;
                                delay *= 2;
                            }
                        }
                    }
                }

                Err(map_connection_error(
                    last_error.expect("at least one attempt was made"),
                    &self.config,
                ))
            })
            .await
    }

    fn check_read_only(&self, sql: &str, opts: &QueryOptions) -> Result<()> {
        if (self.config.read_only || opts.read_only) && sql_is_mutating(sql) {
            return Err(DbRheoError::read_only(format!(
                "Connection is read-only; refusing to execute: {}",
                first_keyword(sql)
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl DatabaseAdapter for PostgresAdapter {
    async fn connect(&self) -> Result<()> {
        self.ensure_pool().await.map(|_| ())
    }

    async fn close(&self) -> Result<()> {
        if let Some(pool) = self.pool.get() {
            pool.close().await;
        }
        Ok(())
    }

    async fn execute_query(
        &self,
        sql: &str,
        params: &[Value],
        opts: &QueryOptions,
    ) -> Result<ResultSet> {
        self.check_read_only(sql, opts)?;
        let timeout = opts.timeout.unwrap_or(DEFAULT_QUERY_TIMEOUT);
        let max_rows = opts.max_rows.unwrap_or(DEFAULT_MAX_ROWS);
        let start = Instant::now();

        let mut tx_guard = self.tx.lock().await;
        let result = if let Some(conn) = tx_guard.conn.as_mut() {
            run_statement(&mut **conn, sql, params, timeout, max_rows).await
        } else {
            drop(tx_guard);
            let pool = self.ensure_pool().await?;
            run_statement(pool, sql, params, timeout, max_rows).await
        };

        result.map(|rs| rs.with_elapsed(start.elapsed()))
    }

    async fn execute_stream(
        &self,
        sql: &str,
        params: &[Value],
        opts: &QueryOptions,
    ) -> Result<BoxStream<'static, Result<RowBatch>>> {
        self.check_read_only(sql, opts)?;
        let pool = self.ensure_pool().await?.clone();
        let sql = sql.to_string();
        let params = params.to_vec();
        let (tx, rx) = mpsc::channel::<Result<RowBatch>>(4);

        tokio::spawn(async move {
            let mut stream = bind_params(sqlx::query(&sql), &params).fetch(&pool);
            let mut columns: Option<Vec<ColumnInfo>> = None;
            let mut batch: Vec<Row> = Vec::with_capacity(STREAM_BATCH_SIZE);

            while let Some(row_result) = stream.next().await {
                match row_result {
                    Ok(pg_row) => {
                        if columns.is_none() {
                            columns = Some(column_info(&pg_row));
                        }
                        batch.push(convert_row(&pg_row));
                        if batch.len() >= STREAM_BATCH_SIZE {
                            let out = RowBatch {
                                columns: columns.clone().unwrap_or_default(),
                                rows: std::mem::take(&mut batch),
                            };
                            if tx.send(Ok(out)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx
                            .send(Err(DbRheoError::query(format_query_error(e))))
                            .await;
                        return;
                    }
                }
            }

            if !batch.is_empty() {
                let _ = tx
                    .send(Ok(RowBatch {
                        columns: columns.unwrap_or_default(),
                        rows: batch,
                    }))
                    .await;
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn begin_tx(&self, isolation: Option<IsolationLevel>) -> Result<TxHandle> {
        if self.config.read_only {
            return Err(DbRheoError::read_only(
                "Cannot begin a transaction on a read-only connection",
            ));
        }
        let mut tx = self.tx.lock().await;
        if tx.depth == 0 {
            let pool = self.ensure_pool().await?;
            let mut conn = pool
                .acquire()
                .await
                .map_err(|e| DbRheoError::connect(format!("Cannot acquire connection: {e}")))?;
            let begin = match isolation {
                Some(level) => format!("BEGIN ISOLATION LEVEL {}", level.as_sql()),
                None => "BEGIN".to_string(),
            };
            sqlx::query(&begin)
                .execute(&mut *conn)
                .await
                .map_err(|e| DbRheoError::query(format_query_error(e)))?;
            tx.conn = Some(conn);
            tx.depth = 1;
        } else {
            let name = savepoint_name(tx.depth);
            let conn = tx.conn.as_mut().expect("open transaction holds a connection");
            sqlx::query(&format!("SAVEPOINT {name}"))
                .execute(&mut **conn)
                .await
                .map_err(|e| DbRheoError::query(format_query_error(e)))?;
            tx.depth += 1;
        }
        Ok(TxHandle { depth: tx.depth })
    }

    async fn commit(&self, handle: TxHandle) -> Result<()> {
        let mut tx = self.tx.lock().await;
        if tx.depth == 0 || handle.depth != tx.depth {
            return Err(DbRheoError::tx_state(format!(
                "commit for frame {} but current depth is {}",
                handle.depth, tx.depth
            )));
        }
        if tx.depth == 1 {
            let mut conn = tx.conn.take().expect("open transaction holds a connection");
            tx.depth = 0;
            sqlx::query("COMMIT")
                .execute(&mut *conn)
                .await
                .map_err(|e| DbRheoError::query(format_query_error(e)))?;
        } else {
            let name = savepoint_name(tx.depth - 1);
            let conn = tx.conn.as_mut().expect("open transaction holds a connection");
            sqlx::query(&format!("RELEASE SAVEPOINT {name}"))
                .execute(&mut **conn)
                .await
                .map_err(|e| DbRheoError::query(format_query_error(e)))?;
            tx.depth -= 1;
        }
        Ok(())
    }

    async fn rollback(&self, handle: TxHandle) -> Result<()> {
        let mut tx = self.tx.lock().await;
        if tx.depth == 0 || handle.depth != tx.depth {
            return Err(DbRheoError::tx_state(format!(
                "rollback for frame {} but current depth is {}",
                handle.depth, tx.depth
            )));
        }
        if tx.depth == 1 {
            let mut conn = tx.conn.take().expect("open transaction holds a connection");
            tx.depth = 0;
            sqlx::query("ROLLBACK")
                .execute(&mut *conn)
                .await
                .map_err(|e| DbRheoError::query(format_query_error(e)))?;
        } else {
            let name = savepoint_name(tx.depth - 1);
            let conn = tx.conn.as_mut().expect("open transaction holds a connection");
            sqlx::query(&format!("ROLLBACK TO SAVEPOINT {name}"))
                .execute(&mut **conn)
                .await
                .map_err(|e| DbRheoError::query(format_query_error(e)))?;
            sqlx::query(&format!("RELEASE SAVEPOINT {name}"))
                .execute(&mut **conn)
                .await
                .map_err(|e| DbRheoError::query(format_query_error(e)))?;
            tx.depth -= 1;
        }
        Ok(())
    }

    async fn introspect(&self) -> Result<Schema> {
        let pool = self.ensure_pool().await?;

        let (tables_result, columns_result, pks_result, indexes_result, fks_result, views_result) = tokio::join!(
            fetch_table_names(pool),
            fetch_all_columns(pool),
            fetch_primary_keys(pool),
            fetch_indexes(pool),
            fetch_foreign_keys(pool),
            fetch_views(pool),
        );

        let table_names = tables_result?;
        let mut columns_by_table = columns_result?;
        let pks_by_table = pks_result?;
        let mut indexes_by_table = indexes_result?;
        let mut fks_by_table = fks_result?;
        let views = views_result?;

        let tables = table_names
            .into_iter()
            .map(|name| {
                let mut columns = columns_by_table.remove(&name).unwrap_or_default();
                if let Some(pks) = pks_by_table.get(&name) {
                    for col in &mut columns {
                        col.primary_key = pks.contains(&col.name);
                    }
                }
                Table {
                    indexes: indexes_by_table.remove(&name).unwrap_or_default(),
                    foreign_keys: fks_by_table.remove(&name).unwrap_or_default(),
                    name,
                    columns,
                }
            })
            .collect();

        Ok(Schema {
            tables,
            views,
            procedures: Vec::new(),
        })
    }

    async fn health_check(&self) -> Result<()> {
        let pool = self.ensure_pool().await?;
        tokio::time::timeout(HEALTH_TIMEOUT, sqlx::query("SELECT 1").execute(pool))
            .await
            .map_err(|_| DbRheoError::timeout("health check timed out"))?
            .map_err(|e| DbRheoError::connect(format!("health check failed: {e}")))?;
        Ok(())
    }

    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn is_read_only(&self) -> bool {
        self.config.read_only
    }
}

fn savepoint_name(depth: usize) -> String {
    format!("dbrheo_sp_{depth}")
}

fn first_keyword(sql: &str) -> String {
    sql.trim_start()
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_uppercase()
}

/// Executes one statement against any executor (pool or transaction
/// connection), routing between fetch and execute by statement shape.
async fn run_statement<'e, E>(
    executor: E,
    sql: &str,
    params: &[Value],
    timeout: Duration,
    max_rows: usize,
) -> Result<ResultSet>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    if statement_returns_rows(sql) {
        let mut stream = bind_params(sqlx::query(sql), params).fetch(executor);
        let mut rows: Vec<Row> = Vec::new();
        let mut columns: Option<Vec<ColumnInfo>> = None;
        let mut truncated = false;

        tokio::time::timeout(timeout, async {
            while let Some(row_result) = stream.next().await {
                let pg_row = row_result.map_err(|e| DbRheoError::query(format_query_error(e)))?;
                if columns.is_none() {
                    columns = Some(column_info(&pg_row));
                }
                if rows.len() < max_rows {
                    rows.push(convert_row(&pg_row));
                } else {
                    truncated = true;
                    break;
                }
            }
            Ok::<_, DbRheoError>(())
        })
        .await
        .map_err(|_| DbRheoError::timeout(format!("query exceeded {timeout:?}")))??;

        if truncated {
            warn!("Query exceeded {} rows, result truncated", max_rows);
        }

        Ok(ResultSet {
            columns: columns.unwrap_or_default(),
            rows,
            rows_affected: 0,
            truncated,
            elapsed: Duration::ZERO,
        })
    } else {
        let done = tokio::time::timeout(
            timeout,
            bind_params(sqlx::query(sql), params).execute(executor),
        )
        .await
        .map_err(|_| DbRheoError::timeout(format!("statement exceeded {timeout:?}")))?
        .map_err(|e| DbRheoError::query(format_query_error(e)))?;
        Ok(ResultSet::affected(done.rows_affected()))
    }
}

fn bind_params<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Postgres, PgArguments>,
    params: &'q [Value],
) -> sqlx::query::Query<'q, sqlx::Postgres, PgArguments> {
    for param in params {
        query = match param {
            Value::Null => query.bind(None::<String>),
            Value::Bool(b) => query.bind(*b),
            Value::Int(i) => query.bind(*i),
            Value::Float(f) => query.bind(*f),
            Value::String(s) => query.bind(s.as_str()),
            Value::Bytes(b) => query.bind(b.as_slice()),
        };
    }
    query
}

fn column_info(row: &PgRow) -> Vec<ColumnInfo> {
    row.columns()
        .iter()
        .map(|col| ColumnInfo::new(col.name(), col.type_info().name()))
        .collect()
}

/// Converts a sqlx PgRow to our Row type.
fn convert_row(row: &PgRow) -> Row {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, col)| convert_value(row, i, col.type_info().name()))
        .collect()
}

/// Converts a single column value from a PgRow to our Value type.
fn convert_value(row: &PgRow, index: usize, type_name: &str) -> Value {
    match type_name.to_uppercase().as_str() {
        "BOOL" | "BOOLEAN" => row
            .try_get::<Option<bool>, _>(index)
            .ok()
            .flatten()
            .map(Value::Bool)
            .unwrap_or(Value::Null),

        "INT2" | "SMALLINT" => row
            .try_get::<Option<i16>, _>(index)
            .ok()
            .flatten()
            .map(|v| Value::Int(v as i64))
            .unwrap_or(Value::Null),

        "INT4" | "INT" | "INTEGER" => row
            .try_get::<Option<i32>, _>(index)
            .ok()
            .flatten()
            .map(|v| Value::Int(v as i64))
            .unwrap_or(Value::Null),

        "INT8" | "BIGINT" => row
            .try_get::<Option<i64>, _>(index)
            .ok()
            .flatten()
            .map(Value::Int)
            .unwrap_or(Value::Null),

        "FLOAT4" | "REAL" => row
            .try_get::<Option<f32>, _>(index)
            .ok()
            .flatten()
            .map(|v| Value::Float(v as f64))
            .unwrap_or(Value::Null),

        "FLOAT8" | "DOUBLE PRECISION" => row
            .try_get::<Option<f64>, _>(index)
            .ok()
            .flatten()
            .map(Value::Float)
            .unwrap_or(Value::Null),

        "BYTEA" => row
            .try_get::<Option<Vec<u8>>, _>(index)
            .ok()
            .flatten()
            .map(Value::Bytes)
            .unwrap_or(Value::Null),

        _ => row
            .try_get::<Option<String>, _>(index)
            .ok()
            .flatten()
            .map(Value::String)
            .unwrap_or(Value::Null),
    }
}

async fn fetch_table_names(pool: &PgPool) -> Result<Vec<String>> {
    sqlx::query_scalar(
        r#"
        SELECT table_name::text
        FROM information_schema.tables
        WHERE table_schema = 'public' AND table_type = 'BASE TABLE'
        ORDER BY table_name
        "#,
    )
    .fetch_all(pool)
    .await
    .map_err(|e| DbRheoError::query(format!("Failed to fetch tables: {e}")))
}

async fn fetch_views(pool: &PgPool) -> Result<Vec<String>> {
    sqlx::query_scalar(
        r#"
        SELECT table_name::text
        FROM information_schema.views
        WHERE table_schema = 'public'
        ORDER BY table_name
        "#,
    )
    .fetch_all(pool)
    .await
    .map_err(|e| DbRheoError::query(format!("Failed to fetch views: {e}")))
}

async fn fetch_all_columns(
    pool: &PgPool,
) -> Result<std::collections::HashMap<String, Vec<Column>>> {
    let rows: Vec<(String, String, String, String, Option<String>)> = sqlx::query_as(
        r#"
        SELECT
            table_name::text,
            column_name::text,
            data_type::text,
            is_nullable::text,
            column_default::text
        FROM information_schema.columns
        WHERE table_schema = 'public'
        ORDER BY table_name, ordinal_position
        "#,
    )
    .fetch_all(pool)
    .await
    .map_err(|e| DbRheoError::query(format!("Failed to fetch columns: {e}")))?;

    let mut columns_by_table: std::collections::HashMap<String, Vec<Column>> =
        std::collections::HashMap::new();

    for (table_name, column_name, data_type, is_nullable, default) in rows {
        columns_by_table.entry(table_name).or_default().push(Column {
            name: column_name,
            data_type,
            nullable: is_nullable == "YES",
            primary_key: false,
            default,
        });
    }

    Ok(columns_by_table)
}

async fn fetch_primary_keys(
    pool: &PgPool,
) -> Result<std::collections::HashMap<String, Vec<String>>> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        r#"
        SELECT
            tc.table_name::text,
            kcu.column_name::text
        FROM information_schema.table_constraints tc
        JOIN information_schema.key_column_usage kcu
            ON tc.constraint_name = kcu.constraint_name
            AND tc.table_schema = kcu.table_schema
        WHERE tc.table_schema = 'public'
            AND tc.constraint_type = 'PRIMARY KEY'
        ORDER BY tc.table_name, kcu.ordinal_position
        "#,
    )
    .fetch_all(pool)
    .await
    .map_err(|e| DbRheoError::query(format!("Failed to fetch primary keys: {e}")))?;

    let mut pks: std::collections::HashMap<String, Vec<String>> = std::collections::HashMap::new();
    for (table_name, column_name) in rows {
        pks.entry(table_name).or_default().push(column_name);
    }
    Ok(pks)
}

async fn fetch_indexes(pool: &PgPool) -> Result<std::collections::HashMap<String, Vec<Index>>> {
    let rows: Vec<(String, String, String, bool)> = sqlx::query_as(
        r#"
        SELECT
            t.relname::text AS table_name,
            i.relname::text AS index_name,
            a.attname::text AS column_name,
            ix.indisunique AS is_unique
        FROM pg_class t
        JOIN pg_index ix ON t.oid = ix.indrelid
        JOIN pg_class i ON i.oid = ix.indexrelid
        JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(ix.indkey)
        JOIN pg_namespace n ON n.oid = t.relnamespace
        WHERE n.nspname = 'public'
            AND NOT ix.indisprimary
        ORDER BY t.relname, i.relname, a.attnum
        "#,
    )
    .fetch_all(pool)
    .await
    .map_err(|e| DbRheoError::query(format!("Failed to fetch indexes: {e}")))?;

    let mut indexes_by_table: std::collections::HashMap<String, Vec<Index>> =
        std::collections::HashMap::new();

    for (table_name, index_name, column_name, is_unique) in rows {
        let indexes = indexes_by_table.entry(table_name).or_default();
        match indexes.last_mut() {
            Some(last) if last.name == index_name => last.columns.push(column_name),
            _ => indexes.push(Index {
                name: index_name,
                columns: vec![column_name],
                unique: is_unique,
            }),
        }
    }

    Ok(indexes_by_table)
}

async fn fetch_foreign_keys(
    pool: &PgPool,
) -> Result<std::collections::HashMap<String, Vec<ForeignKey>>> {
    let rows: Vec<(String, String, String, String)> = sqlx::query_as(
        r#"
        SELECT
            kcu.table_name::text AS from_table,
            kcu.column_name::text AS from_column,
            ccu.table_name::text AS to_table,
            ccu.column_name::text AS to_column
        FROM information_schema.table_constraints tc
        JOIN information_schema.key_column_usage kcu
            ON tc.constraint_name = kcu.constraint_name
            AND tc.table_schema = kcu.table_schema
        JOIN information_schema.constraint_column_usage ccu
            ON tc.constraint_name = ccu.constraint_name
            AND tc.table_schema = ccu.table_schema
        WHERE tc.table_schema = 'public'
            AND tc.constraint_type = 'FOREIGN KEY'
        ORDER BY kcu.table_name, kcu.ordinal_position
        "#,
    )
    .fetch_all(pool)
    .await
    .map_err(|e| DbRheoError::query(format!("Failed to fetch foreign keys: {e}")))?;

    let mut fks: std::collections::HashMap<String, Vec<ForeignKey>> =
        std::collections::HashMap::new();
    for (from_table, from_column, to_table, to_column) in rows {
        fks.entry(from_table).or_default().push(ForeignKey {
            column: from_column,
            ref_table: to_table,
            ref_column: to_column,
        });
    }
    Ok(fks)
}

/// Determines if a connect error is transient and worth retrying.
fn is_transient_error(error: &sqlx::Error) -> bool {
    let error_str = error.to_string().to_lowercase();

    if error_str.contains("connection refused")
        || error_str.contains("timed out")
        || error_str.contains("timeout")
        || error_str.contains("temporarily unavailable")
        || error_str.contains("connection reset")
        || error_str.contains("broken pipe")
    {
        return true;
    }

    false
}

/// Maps sqlx connection errors onto the error taxonomy, keeping the driver
/// detail in the message.
fn map_connection_error(error: sqlx::Error, config: &DatabaseConfig) -> DbRheoError {
    let host = config.host.as_deref().unwrap_or("localhost");
    let port = config.port.or_else(|| config.dialect.default_port()).unwrap_or(0);
    let user = config.user.as_deref().unwrap_or("unknown");
    let database = config.database.as_deref().unwrap_or("unknown");

    let error_str = error.to_string().to_lowercase();

    if error_str.contains("password authentication failed")
        || error_str.contains("authentication failed")
        || error_str.contains("access denied")
    {
        DbRheoError::auth(format!(
            "Authentication failed for user '{user}'. Check your credentials. ({error})"
        ))
    } else if error_str.contains("connection refused") || error_str.contains("could not connect") {
        DbRheoError::connect(format!(
            "Cannot connect to {host}:{port}. Check that the server is running. ({error})"
        ))
    } else if error_str.contains("does not exist") && error_str.contains("database") {
        DbRheoError::connect(format!("Database '{database}' does not exist. ({error})"))
    } else if error_str.contains("timed out") || error_str.contains("timeout") {
        DbRheoError::timeout(format!(
            "Connection to {host}:{port} timed out. The server may be overloaded or unreachable."
        ))
    } else {
        DbRheoError::connect(error.to_string())
    }
}

/// Formats a query error with PostgreSQL detail and hints when available.
fn format_query_error(error: sqlx::Error) -> String {
    if let Some(db_error) = error.as_database_error() {
        let mut result = String::from("ERROR: ");
        result.push_str(db_error.message());

        if let Some(pg_error) = db_error.try_downcast_ref::<sqlx::postgres::PgDatabaseError>() {
            if let Some(detail) = pg_error.detail() {
                result.push_str("\n  DETAIL: ");
                result.push_str(detail);
            }
            if let Some(hint) = pg_error.hint() {
                result.push_str("\n  HINT: ");
                result.push_str(hint);
            }
            if let Some(table) = pg_error.table() {
                result.push_str("\n  TABLE: ");
                result.push_str(table);
            }
            if let Some(constraint) = pg_error.constraint() {
                result.push_str("\n  CONSTRAINT: ");
                result.push_str(constraint);
            }
        }
        result
    } else {
        error.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DatabaseConfig;

    // These tests require a running PostgreSQL database; they are skipped
    // unless DATABASE_URL is set.

    async fn get_test_adapter() -> Option<PostgresAdapter> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let config = DatabaseConfig::from_url(&url).ok()?;
        if config.dialect != Dialect::Postgres {
            return None;
        }
        let adapter = PostgresAdapter::new(config);
        adapter.connect().await.ok()?;
        Some(adapter)
    }

    #[test]
    fn test_savepoint_names_are_deterministic() {
        assert_eq!(savepoint_name(1), "dbrheo_sp_1");
        assert_eq!(savepoint_name(3), "dbrheo_sp_3");
    }

    #[test]
    fn test_read_only_gate_rejects_mutations() {
        let mut config = DatabaseConfig::from_url("postgresql://u@localhost/db").unwrap();
        config.read_only = true;
        let adapter = PostgresAdapter::new(config);
        let err = adapter
            .check_read_only("DELETE FROM t", &QueryOptions::default())
            .unwrap_err();
        assert_eq!(err.kind(), "ReadOnlyError");
        assert!(adapter
            .check_read_only("SELECT * FROM t", &QueryOptions::default())
            .is_ok());
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let Some(adapter) = get_test_adapter().await else {
            eprintln!("Skipping test: DATABASE_URL not set");
            return;
        };
        adapter.connect().await.unwrap();
        adapter.connect().await.unwrap();
        adapter.health_check().await.unwrap();
        adapter.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_execute_simple_select() {
        let Some(adapter) = get_test_adapter().await else {
            eprintln!("Skipping test: DATABASE_URL not set");
            return;
        };

        let result = adapter
            .execute_query(
                "SELECT 1 as num, 'hello' as greeting",
                &[],
                &QueryOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(result.columns.len(), 2);
        assert_eq!(result.columns[0].name, "num");
        assert_eq!(result.rows.len(), 1);
        assert!(!result.truncated);

        adapter.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_nested_transaction_uses_savepoints() {
        let Some(adapter) = get_test_adapter().await else {
            eprintln!("Skipping test: DATABASE_URL not set");
            return;
        };

        let outer = adapter.begin_tx(None).await.unwrap();
        assert_eq!(outer.depth(), 1);
        let inner = adapter.begin_tx(None).await.unwrap();
        assert_eq!(inner.depth(), 2);

        adapter.rollback(inner).await.unwrap();
        adapter.commit(outer).await.unwrap();

        adapter.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_commit_out_of_order_fails() {
        let Some(adapter) = get_test_adapter().await else {
            eprintln!("Skipping test: DATABASE_URL not set");
            return;
        };

        let outer = adapter.begin_tx(None).await.unwrap();
        let _inner = adapter.begin_tx(None).await.unwrap();
        let err = adapter.commit(outer).await.unwrap_err();
        assert_eq!(err.kind(), "TxStateError");

        adapter.close().await.unwrap();
    }
}
