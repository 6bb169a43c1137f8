//! Connection manager: named active connections and switching.
//!
//! Owns the `alias -> ActiveConnection` map plus the "current" pointer that
//! tools resolve against. Statements are serialized per connection; a
//! failed health probe evicts and re-opens the connection once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::db::{
    AdapterFactory, DatabaseAdapter, DatabaseConfig, QueryOptions, ResultSet, Value,
};
use crate::error::{DbRheoError, Result};

/// A named, opened database session.
pub struct ActiveConnection {
    /// Alias the connection was opened under.
    pub alias: String,
    /// The underlying adapter.
    pub adapter: Arc<dyn DatabaseAdapter>,
    /// The config it was opened with (used for eviction re-opens).
    config: DatabaseConfig,
    created_at: Instant,
    last_used_at: Mutex<Instant>,
    /// Serializes statements: adapters are not assumed safe under
    /// interleaved statements, and callers queue FIFO on this lock.
    stmt_lock: Mutex<()>,
}

impl ActiveConnection {
    fn new(alias: String, adapter: Arc<dyn DatabaseAdapter>, config: DatabaseConfig) -> Self {
        let now = Instant::now();
        Self {
            alias,
            adapter,
            config,
            created_at: now,
            last_used_at: Mutex::new(now),
            stmt_lock: Mutex::new(()),
        }
    }

    /// Executes a statement with at most one in flight per connection.
    pub async fn execute(
        &self,
        sql: &str,
        params: &[Value],
        opts: &QueryOptions,
    ) -> Result<ResultSet> {
        let _guard = self.stmt_lock.lock().await;
        *self.last_used_at.lock().await = Instant::now();
        self.adapter.execute_query(sql, params, opts).await
    }

    /// Seconds since the connection was opened.
    pub fn age_secs(&self) -> u64 {
        self.created_at.elapsed().as_secs()
    }

    /// Seconds since the last statement.
    pub async fn idle_secs(&self) -> u64 {
        self.last_used_at.lock().await.elapsed().as_secs()
    }
}

/// Summary row for `list()`.
#[derive(Debug, Clone)]
pub struct ConnectionSummary {
    pub alias: String,
    pub description: String,
    pub dialect: String,
    pub read_only: bool,
    pub current: bool,
}

struct State {
    connections: HashMap<String, Arc<ActiveConnection>>,
    current: Option<String>,
}

/// Manages named database connections.
pub struct ConnectionManager {
    factory: Arc<AdapterFactory>,
    state: RwLock<State>,
    /// Coalesces concurrent opens: the second caller of `open` for an alias
    /// waits here and then finds the first caller's result in the map.
    open_lock: Mutex<()>,
}

impl ConnectionManager {
    /// Creates a manager backed by the given adapter factory.
    pub fn new(factory: Arc<AdapterFactory>) -> Self {
        Self {
            factory,
            state: RwLock::new(State {
                connections: HashMap::new(),
                current: None,
            }),
            open_lock: Mutex::new(()),
        }
    }

    /// Opens (or reuses) a connection under `alias`. A newly opened alias
    /// becomes current unless `make_current` is false.
    pub async fn open(
        &self,
        alias: &str,
        config: DatabaseConfig,
        make_current: bool,
    ) -> Result<Arc<ActiveConnection>> {
        let _guard = self.open_lock.lock().await;

        if let Some(existing) = self.state.read().await.connections.get(alias).cloned() {
            debug!(alias, "Alias already open, reusing connection");
            if make_current {
                self.state.write().await.current = Some(alias.to_string());
            }
            return Ok(existing);
        }

        let adapter = self.factory.adapter_for(&config).await?;
        let connection = Arc::new(ActiveConnection::new(
            alias.to_string(),
            adapter,
            config,
        ));

        let mut state = self.state.write().await;
        state
            .connections
            .insert(alias.to_string(), connection.clone());
        if make_current || state.current.is_none() {
            state.current = Some(alias.to_string());
        }
        info!(alias, "Opened connection");
        Ok(connection)
    }

    /// Switches the current alias.
    pub async fn use_alias(&self, alias: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.connections.contains_key(alias) {
            return Err(DbRheoError::connect(format!(
                "No open connection named '{alias}'"
            )));
        }
        state.current = Some(alias.to_string());
        Ok(())
    }

    /// Returns the current connection.
    pub async fn current(&self) -> Result<Arc<ActiveConnection>> {
        let state = self.state.read().await;
        let alias = state
            .current
            .clone()
            .ok_or_else(|| DbRheoError::connect("No active database connection"))?;
        state
            .connections
            .get(&alias)
            .cloned()
            .ok_or_else(|| DbRheoError::internal(format!("current alias '{alias}' has no entry")))
    }

    /// Returns the current connection after a health probe, evicting and
    /// re-opening once on failure.
    pub async fn current_checked(&self) -> Result<Arc<ActiveConnection>> {
        let connection = self.current().await?;
        if connection.adapter.health_check().await.is_ok() {
            return Ok(connection);
        }
        warn!(alias = %connection.alias, "Health check failed, re-opening connection");
        let alias = connection.alias.clone();
        let config = connection.config.clone();
        self.close(&alias).await?;
        self.open(&alias, config, true).await
    }

    /// Returns a connection by alias.
    pub async fn get(&self, alias: &str) -> Result<Arc<ActiveConnection>> {
        self.state
            .read()
            .await
            .connections
            .get(alias)
            .cloned()
            .ok_or_else(|| DbRheoError::connect(format!("No open connection named '{alias}'")))
    }

    /// The current alias, if any.
    pub async fn current_alias(&self) -> Option<String> {
        self.state.read().await.current.clone()
    }

    /// Lists open connections, current first.
    pub async fn list(&self) -> Vec<ConnectionSummary> {
        let state = self.state.read().await;
        let mut rows: Vec<ConnectionSummary> = state
            .connections
            .values()
            .map(|c| ConnectionSummary {
                alias: c.alias.clone(),
                description: c.config.display_string(),
                dialect: c.adapter.dialect().to_string(),
                read_only: c.adapter.is_read_only(),
                current: state.current.as_deref() == Some(c.alias.as_str()),
            })
            .collect();
        rows.sort_by(|a, b| b.current.cmp(&a.current).then(a.alias.cmp(&b.alias)));
        rows
    }

    /// Closes one connection. Clears the current pointer if it pointed
    /// here.
    pub async fn close(&self, alias: &str) -> Result<()> {
        let removed = {
            let mut state = self.state.write().await;
            let removed = state.connections.remove(alias);
            if state.current.as_deref() == Some(alias) {
                state.current = state.connections.keys().next().cloned();
            }
            removed
        };
        if let Some(connection) = removed {
            connection.adapter.close().await?;
            info!(alias, "Closed connection");
        }
        Ok(())
    }

    /// Closes everything.
    pub async fn close_all(&self) -> Result<()> {
        let drained: Vec<Arc<ActiveConnection>> = {
            let mut state = self.state.write().await;
            state.current = None;
            state.connections.drain().map(|(_, c)| c).collect()
        };
        for connection in drained {
            let _ = connection.adapter.close().await;
        }
        Ok(())
    }
}
