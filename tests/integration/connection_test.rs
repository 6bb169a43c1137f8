//! Connection and adapter integration tests.
//!
//! SQLite tests are self-contained; PostgreSQL tests require DATABASE_URL.

use std::sync::Arc;

use dbrheo::connection::ConnectionManager;
use dbrheo::db::{
    AdapterFactory, DatabaseAdapter, DatabaseConfig, Dialect, PostgresAdapter, QueryOptions,
    Value,
};
use dbrheo::transaction::TransactionManager;
use dbrheo::types::AbortSignal;

fn get_test_database_url() -> Option<String> {
    std::env::var("DATABASE_URL").ok()
}

#[tokio::test]
async fn test_sqlite_end_to_end() {
    let factory = Arc::new(AdapterFactory::new());
    let manager = ConnectionManager::new(factory);
    let conn = manager
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
    let inserted = conn
        .execute(
            "INSERT INTO users (email) VALUES (?), (?)",
            &[Value::from("a@example.com"), Value::from("b@example.com")],
            &QueryOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(inserted.rows_affected, 2);

    let result = conn
        .execute(
            "SELECT id, email FROM users ORDER BY id",
            &[],
            &QueryOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(result.rows.len(), 2);
    assert_eq!(result.rows[0][1], Value::String("a@example.com".into()));

    let schema = conn.adapter.introspect().await.unwrap();
    assert_eq!(schema.tables.len(), 1);
    assert_eq!(schema.tables[0].primary_key(), vec!["id"]);
}

#[tokio::test]
async fn test_transaction_manager_over_sqlite_connection() {
    let factory = Arc::new(AdapterFactory::new());
    let manager = ConnectionManager::new(factory);
    let conn = manager
        .open("main", DatabaseConfig::sqlite(":memory:"), true)
        .await
        .unwrap();
    conn.execute("CREATE TABLE t (a INTEGER)", &[], &QueryOptions::default())
        .await
        .unwrap();

    let tx = TransactionManager::new(conn.adapter.clone());
    let signal = AbortSignal::new();
    let adapter = conn.adapter.clone();

    // A failed body leaves the table untouched.
    let result: dbrheo::Result<()> = tx
        .with_tx(&signal, || async {
            adapter
                .execute_query("INSERT INTO t VALUES (1)", &[], &QueryOptions::default())
                .await?;
            Err(dbrheo::DbRheoError::tool_execution("boom"))
        })
        .await;
    assert!(result.is_err());

    let count = conn
        .execute("SELECT COUNT(*) FROM t", &[], &QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(count.rows[0][0], Value::Int(0));
}

#[tokio::test]
async fn test_factory_rejects_unknown_scheme() {
    let factory = AdapterFactory::new();
    let err = match factory.from_url("oracle://h/db").await {
        Err(e) => e,
        Ok(_) => panic!("expected an error"),
    };
    assert_eq!(err.kind(), "UnsupportedDialectError");
}

#[tokio::test]
async fn test_postgres_connect_and_query() {
    let Some(url) = get_test_database_url() else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };
    let config = DatabaseConfig::from_url(&url).unwrap();
    if config.dialect != Dialect::Postgres {
        eprintln!("Skipping test: DATABASE_URL is not postgres");
        return;
    }

    let adapter = PostgresAdapter::new(config);
    adapter.connect().await.unwrap();
    let result = adapter
        .execute_query(
            "SELECT 1 AS num, 'hello' AS greeting",
            &[],
            &QueryOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(result.columns[0].name, "num");
    assert_eq!(result.rows[0][0], Value::Int(1));
    adapter.close().await.unwrap();
}

#[tokio::test]
async fn test_postgres_introspection() {
    let Some(url) = get_test_database_url() else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };
    let config = DatabaseConfig::from_url(&url).unwrap();
    if config.dialect != Dialect::Postgres {
        eprintln!("Skipping test: DATABASE_URL is not postgres");
        return;
    }

    let adapter = PostgresAdapter::new(config);
    adapter.connect().await.unwrap();
    let schema = adapter.introspect().await.unwrap();
    // Whatever the database holds, introspection must not error and
    // every reported table needs a name.
    assert!(schema.tables.iter().all(|t| !t.name.is_empty()));
    adapter.close().await.unwrap();
}
