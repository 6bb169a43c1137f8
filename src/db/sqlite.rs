//! SQLite adapter implementation.
//!
//! SQLite is the zero-setup dialect: file-backed or in-memory, no server.
//! Introspection goes through `sqlite_master` and the PRAGMA interface.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column as SqlxColumn, Row as SqlxRow, TypeInfo};
use std::str::FromStr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

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
    conn: Option<sqlx::pool::PoolConnection<sqlx::Sqlite>>,
    depth: usize,
}

/// SQLite database adapter.
pub struct SqliteAdapter {
    config: DatabaseConfig,
    pool: tokio::sync::OnceCell<SqlitePool>,
    tx: tokio::sync::Mutex<TxState>,
}

impl SqliteAdapter {
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

    async fn ensure_pool(&self) -> Result<&SqlitePool> {
        self.pool
            .get_or_try_init(|| async {
                let path = self
                    .config
                    .database
                    .as_deref()
                    .ok_or_else(|| DbRheoError::config("sqlite config is missing a path"))?;

                // Build options from the bare path to sidestep URL slash
                // ambiguity between relative and absolute files.
                let options = if path == ":memory:" {
                    SqliteConnectOptions::from_str("sqlite::memory:")
                        .map_err(|e| DbRheoError::connect(format!("Invalid sqlite target: {e}")))?
                } else {
                    SqliteConnectOptions::new()
                        .filename(path)
                        .create_if_missing(!self.config.read_only)
                };
                let options = options.read_only(self.config.read_only);

                // Each pooled connection to ":memory:" would get its own
                // database; in-memory targets are pinned to one connection.
                let max_connections = if path == ":memory:" {
                    1
                } else {
                    self.config.pool.max_connections()
                };

                debug!(path = %path, "Opening SQLite database");
                SqlitePoolOptions::new()
                    .max_connections(max_connections)
                    .acquire_timeout(Duration::from_secs(self.config.pool.timeout_secs))
                    .connect_with(options)
                    .await
                    .map_err(|e| DbRheoError::connect(format!("Cannot open '{path}': {e}")))
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
impl DatabaseAdapter for SqliteAdapter {
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
        if isolation.is_some() {
            debug!("SQLite ignores explicit isolation levels");
        }
        let mut tx = self.tx.lock().await;
        if tx.depth == 0 {
            let pool = self.ensure_pool().await?;
            let mut conn = pool
                .acquire()
                .await
                .map_err(|e| DbRheoError::connect(format!("Cannot acquire connection: {e}")))?;
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
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(pool)
        .await
        .map_err(|e| DbRheoError::query(format!("Failed to fetch tables: {e}")))?;

        let views: Vec<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'view' ORDER BY name")
                .fetch_all(pool)
                .await
                .map_err(|e| DbRheoError::query(format!("Failed to fetch views: {e}")))?;

        let mut tables = Vec::with_capacity(table_names.len());
        for name in table_names {
            tables.push(introspect_table(pool, &name).await?);
        }

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
        Dialect::Sqlite
    }

    fn is_read_only(&self) -> bool {
        self.config.read_only
    }
}

async fn introspect_table(pool: &SqlitePool, name: &str) -> Result<Table> {
    // PRAGMA arguments cannot be bound; identifiers come from
    // sqlite_master, quoted defensively all the same.
    let quoted = name.replace('"', "\"\"");

    let column_rows = sqlx::query(&format!("PRAGMA table_info(\"{quoted}\")"))
        .fetch_all(pool)
        .await
        .map_err(|e| DbRheoError::query(format!("Failed to fetch columns for {name}: {e}")))?;

    let columns = column_rows
        .iter()
        .map(|row| {
            let pk_rank: i64 = row.try_get("pk").unwrap_or(0);
            Column {
                name: row.try_get::<String, _>("name").unwrap_or_default(),
                data_type: row.try_get::<String, _>("type").unwrap_or_default(),
                nullable: row.try_get::<i64, _>("notnull").unwrap_or(0) == 0,
                primary_key: pk_rank > 0,
                default: row.try_get::<Option<String>, _>("dflt_value").unwrap_or(None),
            }
        })
        .collect();

    let index_rows = sqlx::query(&format!("PRAGMA index_list(\"{quoted}\")"))
        .fetch_all(pool)
        .await
        .map_err(|e| DbRheoError::query(format!("Failed to fetch indexes for {name}: {e}")))?;

    let mut indexes = Vec::new();
    for row in &index_rows {
        let index_name: String = row.try_get("name").unwrap_or_default();
        let unique = row.try_get::<i64, _>("unique").unwrap_or(0) == 1;
        let quoted_index = index_name.replace('"', "\"\"");
        let info_rows = sqlx::query(&format!("PRAGMA index_info(\"{quoted_index}\")"))
            .fetch_all(pool)
            .await
            .map_err(|e| DbRheoError::query(format!("Failed to fetch index info: {e}")))?;
        indexes.push(Index {
            name: index_name,
            columns: info_rows
                .iter()
                .filter_map(|r| r.try_get::<Option<String>, _>("name").ok().flatten())
                .collect(),
            unique,
        });
    }

    let fk_rows = sqlx::query(&format!("PRAGMA foreign_key_list(\"{quoted}\")"))
        .fetch_all(pool)
        .await
        .map_err(|e| DbRheoError::query(format!("Failed to fetch foreign keys for {name}: {e}")))?;

    let foreign_keys = fk_rows
        .iter()
        .map(|row| ForeignKey {
            column: row.try_get::<String, _>("from").unwrap_or_default(),
            ref_table: row.try_get::<String, _>("table").unwrap_or_default(),
            ref_column: row.try_get::<String, _>("to").unwrap_or_default(),
        })
        .collect();

    Ok(Table {
        name: name.to_string(),
        columns,
        indexes,
        foreign_keys,
    })
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
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
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
    mut query: sqlx::query::Query<'q, sqlx::Sqlite, SqliteArguments<'q>>,
    params: &'q [Value],
) -> sqlx::query::Query<'q, sqlx::Sqlite, SqliteArguments<'q>> {
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

fn column_info(row: &SqliteRow) -> Vec<ColumnInfo> {
    row.columns()
        .iter()
        .map(|col| ColumnInfo::new(col.name(), col.type_info().name()))
        .collect()
}

fn convert_row(row: &SqliteRow) -> Row {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, col)| convert_value(row, i, col.type_info().name()))
        .collect()
}

fn convert_value(row: &SqliteRow, index: usize, type_name: &str) -> Value {
    match type_name.to_uppercase().as_str() {
        "BOOLEAN" | "BOOL" => row
            .try_get::<Option<bool>, _>(index)
            .ok()
            .flatten()
            .map(Value::Bool)
            .unwrap_or(Value::Null),

        "INTEGER" | "INT" | "INT4" | "INT8" | "BIGINT" => row
            .try_get::<Option<i64>, _>(index)
            .ok()
            .flatten()
            .map(Value::Int)
            .unwrap_or(Value::Null),

        "REAL" | "FLOAT" | "DOUBLE" => row
            .try_get::<Option<f64>, _>(index)
            .ok()
            .flatten()
            .map(Value::Float)
            .unwrap_or(Value::Null),

        "BLOB" => row
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
