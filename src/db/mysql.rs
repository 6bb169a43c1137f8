//! MySQL / MariaDB adapter implementation.
//!
//! Shares the execution model of the other adapters: a sqlx pool for
//! stateless statements, a dedicated connection while a transaction is
//! open, savepoints for nesting.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use sqlx::mysql::{MySqlArguments, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{Column as SqlxColumn, Row as SqlxRow, TypeInfo};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use crate::db::schema::{Column, ForeignKey, Index};
use crate::db::{
    statement_returns_rows, ColumnInfo, DatabaseAdapter, DatabaseConfig, Dialect, IsolationLevel,
    QueryOptions, ResultSet, Row, RowBatch, Schema, Table, TxHandle, Value,
};
use crate::error::{DbRheoError, Result};
use crate::risk::sql_is_mutating;

const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_ROWS: usize = 1000;
const STREAM_BATCH_SIZE: usize = 256;
const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

struct TxState {
    conn: Option<sqlx::pool::PoolConnection<sqlx::MySql>>,
    depth: usize,
}

/// MySQL database adapter.
pub struct MySqlAdapter {
    config: DatabaseConfig,
    pool: tokio::sync::OnceCell<MySqlPool>,
    tx: tokio::sync::Mutex<TxState>,
}

impl MySqlAdapter {
    /// Creates an unconnected adapter.
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

    async fn ensure_pool(&self) -> Result<&MySqlPool> {
        self.pool
            .get_or_try_init(|| async {
                let conn_str = self.config.to_url()?;
                MySqlPoolOptions::new()
                    .max_connections(self.config.pool.max_connections())
                    .acquire_timeout(Duration::from_secs(self.config.pool.timeout_secs))
                    .connect(&conn_str)
                    .await
                    .map_err(|e| map_connection_error(e, &self.config))
            })
            .await
    }

    fn check_read_only(&self, sql: &str, opts: &QueryOptions) -> Result<()> {
        if (self.config.read_only || opts.read_only) && sql_is_mutating(sql) {
            return Err(DbRheoError::read_only(
                "Connection is read-only; refusing to execute a mutating statement",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl DatabaseAdapter for MySqlAdapter {
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
                    Ok(row) => {
                        if columns.is_none() {
                            columns = Some(column_info(&row));
                        }
                        batch.push(convert_row(&row));
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
                        let _ = tx.send(Err(DbRheoError::query(e.to_string()))).await;
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
            if let Some(level) = isolation {
                sqlx::query(&format!(
                    "SET TRANSACTION ISOLATION LEVEL {}",
                    level.as_sql()
                ))
                .execute(&mut *conn)
                .await
                .map_err(|e| DbRheoError::query(e.to_string()))?;
            }
            sqlx::query("BEGIN")
                .execute(&mut *conn)
                .await
                .map_err(|e| DbRheoError::query(e.to_string()))?;
            tx.conn = Some(conn);
            tx.depth = 1;
        } else {
            let name = savepoint_name(tx.depth);
            let conn = tx.conn.as_mut().expect("open transaction holds a connection");
            sqlx::query(&format!("SAVEPOINT {name}"))
                .execute(&mut **conn)
                .await
                .map_err(|e| DbRheoError::query(e.to_string()))?;
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
                .map_err(|e| DbRheoError::query(e.to_string()))?;
        } else {
            let name = savepoint_name(tx.depth - 1);
            let conn = tx.conn.as_mut().expect("open transaction holds a connection");
            sqlx::query(&format!("RELEASE SAVEPOINT {name}"))
                .execute(&mut **conn)
                .await
                .map_err(|e| DbRheoError::query(e.to_string()))?;
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
                .map_err(|e| DbRheoError::query(e.to_string()))?;
        } else {
            let name = savepoint_name(tx.depth - 1);
            let conn = tx.conn.as_mut().expect("open transaction holds a connection");
            sqlx::query(&format!("ROLLBACK TO SAVEPOINT {name}"))
                .execute(&mut **conn)
                .await
                .map_err(|e| DbRheoError::query(e.to_string()))?;
            sqlx::query(&format!("RELEASE SAVEPOINT {name}"))
                .execute(&mut **conn)
                .await
                .map_err(|e| DbRheoError::query(e.to_string()))?;
            tx.depth -= 1;
        }
        Ok(())
    }

    async fn introspect(&self) -> Result<Schema> {
        let pool = self.ensure_pool().await?;

        let table_names: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT table_name
            FROM information_schema.tables
            WHERE table_schema = DATABASE() AND table_type = 'BASE TABLE'
            ORDER BY table_name
            "#,
        )
        .fetch_all(pool)
        .await
        .map_err(|e| DbRheoError::query(format!("Failed to fetch tables: {e}")))?;

        let views: Vec<String> = sqlx::query_scalar(
            "SELECT table_name FROM information_schema.views WHERE table_schema = DATABASE() ORDER BY table_name",
        )
        .fetch_all(pool)
        .await
        .map_err(|e| DbRheoError::query(format!("Failed to fetch views: {e}")))?;

        let procedures: Vec<String> = sqlx::query_scalar(
            "SELECT routine_name FROM information_schema.routines WHERE routine_schema = DATABASE() ORDER BY routine_name",
        )
        .fetch_all(pool)
        .await
        .unwrap_or_default();

        let column_rows: Vec<(String, String, String, String, Option<String>, String)> =
            sqlx::query_as(
                r#"
                SELECT table_name, column_name, column_type, is_nullable, column_default, column_key
                FROM information_schema.columns
                WHERE table_schema = DATABASE()
                ORDER BY table_name, ordinal_position
                "#,
            )
            .fetch_all(pool)
            .await
            .map_err(|e| DbRheoError::query(format!("Failed to fetch columns: {e}")))?;

        let mut columns_by_table: std::collections::HashMap<String, Vec<Column>> =
            std::collections::HashMap::new();
        for (table, column, data_type, nullable, default, key) in column_rows {
            columns_by_table.entry(table).or_default().push(Column {
                name: column,
                data_type,
                nullable: nullable == "YES",
                primary_key: key == "PRI",
                default,
            });
        }

        let index_rows: Vec<(String, String, String, i64)> = sqlx::query_as(
            r#"
            SELECT table_name, index_name, column_name, non_unique
            FROM information_schema.statistics
            WHERE table_schema = DATABASE() AND index_name <> 'PRIMARY'
            ORDER BY table_name, index_name, seq_in_index
            "#,
        )
        .fetch_all(pool)
        .await
        .map_err(|e| DbRheoError::query(format!("Failed to fetch indexes: {e}")))?;

        let mut indexes_by_table: std::collections::HashMap<String, Vec<Index>> =
            std::collections::HashMap::new();
        for (table, index_name, column, non_unique) in index_rows {
            let indexes = indexes_by_table.entry(table).or_default();
            match indexes.last_mut() {
                Some(last) if last.name == index_name => last.columns.push(column),
                _ => indexes.push(Index {
                    name: index_name,
                    columns: vec![column],
                    unique: non_unique == 0,
                }),
            }
        }

        let fk_rows: Vec<(String, String, String, String)> = sqlx::query_as(
            r#"
            SELECT table_name, column_name, referenced_table_name, referenced_column_name
            FROM information_schema.key_column_usage
            WHERE table_schema = DATABASE() AND referenced_table_name IS NOT NULL
            ORDER BY table_name, ordinal_position
            "#,
        )
        .fetch_all(pool)
        .await
        .map_err(|e| DbRheoError::query(format!("Failed to fetch foreign keys: {e}")))?;

        let mut fks_by_table: std::collections::HashMap<String, Vec<ForeignKey>> =
            std::collections::HashMap::new();
        for (table, column, ref_table, ref_column) in fk_rows {
            fks_by_table.entry(table).or_default().push(ForeignKey {
                column,
                ref_table,
                ref_column,
            });
        }

        let tables = table_names
            .into_iter()
            .map(|name| Table {
                columns: columns_by_table.remove(&name).unwrap_or_default(),
                indexes: indexes_by_table.remove(&name).unwrap_or_default(),
                foreign_keys: fks_by_table.remove(&name).unwrap_or_default(),
                name,
            })
            .collect();

        Ok(Schema {
            tables,
            views,
            procedures,
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
        Dialect::MySql
    }

    fn is_read_only(&self) -> bool {
        self.config.read_only
    }
}

fn savepoint_name(depth: usize) -> String {
    format!("dbrheo_sp_{depth}")
}

async fn run_statement<'e, E>(
    executor: E,
    sql: &str,
    params: &[Value],
    timeout: Duration,
    max_rows: usize,
) -> Result<ResultSet>
where
    E: sqlx::Executor<'e, Database = sqlx::MySql>,
{
    if statement_returns_rows(sql) {
        let mut stream = bind_params(sqlx::query(sql), params).fetch(executor);
        let mut rows: Vec<Row> = Vec::new();
        let mut columns: Option<Vec<ColumnInfo>> = None;
        let mut truncated = false;

        tokio::time::timeout(timeout, async {
            while let Some(row_result) = stream.next().await {
                let row = row_result.map_err(|e| DbRheoError::query(e.to_string()))?;
                if columns.is_none() {
                    columns = Some(column_info(&row));
                }
                if rows.len() < max_rows {
                    rows.push(convert_row(&row));
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
        .map_err(|e| DbRheoError::query(e.to_string()))?;
        Ok(ResultSet::affected(done.rows_affected()))
    }
}

fn bind_params<'q>(
    mut query: sqlx::query::Query<'q, sqlx::MySql, MySqlArguments>,
    params: &'q [Value],
) -> sqlx::query::Query<'q, sqlx::MySql, MySqlArguments> {
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

fn column_info(row: &MySqlRow) -> Vec<ColumnInfo> {
    row.columns()
        .iter()
        .map(|col| ColumnInfo::new(col.name(), col.type_info().name()))
        .collect()
}

fn convert_row(row: &MySqlRow) -> Row {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, col)| convert_value(row, i, col.type_info().name()))
        .collect()
}

fn convert_value(row: &MySqlRow, index: usize, type_name: &str) -> Value {
    match type_name.to_uppercase().as_str() {
        "BOOLEAN" | "BOOL" => row
            .try_get::<Option<bool>, _>(index)
            .ok()
            .flatten()
            .map(Value::Bool)
            .unwrap_or(Value::Null),

        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "INTEGER" | "BIGINT" => row
            .try_get::<Option<i64>, _>(index)
            .ok()
            .flatten()
            .map(Value::Int)
            .unwrap_or(Value::Null),

        "FLOAT" | "DOUBLE" => row
            .try_get::<Option<f64>, _>(index)
            .ok()
            .flatten()
            .map(Value::Float)
            .unwrap_or(Value::Null),

        "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" | "VARBINARY" | "BINARY" => row
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

fn map_connection_error(error: sqlx::Error, config: &DatabaseConfig) -> DbRheoError {
    let host = config.host.as_deref().unwrap_or("localhost");
    let port = config.port.or_else(|| config.dialect.default_port()).unwrap_or(0);
    let user = config.user.as_deref().unwrap_or("unknown");

    let error_str = error.to_string().to_lowercase();
    if error_str.contains("access denied") || error_str.contains("authentication") {
        DbRheoError::auth(format!(
            "Authentication failed for user '{user}'. Check your credentials. ({error})"
        ))
    } else if error_str.contains("timed out") || error_str.contains("timeout") {
        DbRheoError::timeout(format!("Connection to {host}:{port} timed out."))
    } else {
        DbRheoError::connect(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DatabaseConfig;

    // These tests require a running MySQL server; they are skipped unless
    // MYSQL_URL is set.

    async fn get_test_adapter() -> Option<MySqlAdapter> {
        let url = std::env::var("MYSQL_URL").ok()?;
        let config = DatabaseConfig::from_url(&url).ok()?;
        if config.dialect != Dialect::MySql {
            return None;
        }
        let adapter = MySqlAdapter::new(config);
        adapter.connect().await.ok()?;
        Some(adapter)
    }

    #[test]
    fn test_dialect_reported() {
        let adapter = MySqlAdapter::new(
            DatabaseConfig::from_url("mysql://root@localhost/app").unwrap(),
        );
        assert_eq!(adapter.dialect(), Dialect::MySql);
        assert!(!adapter.is_read_only());
    }

    #[tokio::test]
    async fn test_execute_simple_select() {
        let Some(adapter) = get_test_adapter().await else {
            eprintln!("Skipping test: MYSQL_URL not set");
            return;
        };

        let result = adapter
            .execute_query("SELECT 1 AS num", &[], &QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(result.columns[0].name, "num");
        assert_eq!(result.rows.len(), 1);

        adapter.close().await.unwrap();
    }
}
