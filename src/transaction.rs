//! Transaction manager: scoped transaction lifecycle for one adapter.
//!
//! Maintains a stack of transaction frames over the adapter's begin /
//! commit / rollback primitives. `with_tx` is the main entry point: begin
//! on entry, commit on success, roll back on any failure including
//! cancellation. Nested scopes map to savepoints where the dialect supports
//! them, so an inner rollback preserves outer state.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::db::{DatabaseAdapter, IsolationLevel, TxHandle};
use crate::error::{DbRheoError, Result};
use crate::types::AbortSignal;

/// Per-adapter transaction lifecycle manager.
pub struct TransactionManager {
    adapter: Arc<dyn DatabaseAdapter>,
    frames: Mutex<Vec<TxHandle>>,
}

impl TransactionManager {
    /// Creates a manager attached to one adapter.
    pub fn new(adapter: Arc<dyn DatabaseAdapter>) -> Self {
        Self {
            adapter,
            frames: Mutex::new(Vec::new()),
        }
    }

    /// Current nesting depth (0 = no open transaction).
    pub async fn depth(&self) -> usize {
        self.frames.lock().await.len()
    }

    /// Begins a new frame. The adapter turns nested begins into savepoints
    /// or fails with `TxStateError` when it cannot.
    pub async fn begin(&self, isolation: Option<IsolationLevel>) -> Result<TxHandle> {
        if self.adapter.is_read_only() {
            return Err(DbRheoError::read_only(
                "Cannot begin a transaction on a read-only connection",
            ));
        }
        let handle = self.adapter.begin_tx(isolation).await?;
        self.frames.lock().await.push(handle);
        debug!(depth = handle.depth(), "Began transaction frame");
        Ok(handle)
    }

    /// Commits the innermost open frame.
    pub async fn commit(&self) -> Result<()> {
        let handle = {
            let mut frames = self.frames.lock().await;
            frames
                .pop()
                .ok_or_else(|| DbRheoError::tx_state("commit without an open transaction"))?
        };
        self.adapter.commit(handle).await
    }

    /// Rolls back the innermost open frame.
    pub async fn rollback(&self) -> Result<()> {
        let handle = {
            let mut frames = self.frames.lock().await;
            frames
                .pop()
                .ok_or_else(|| DbRheoError::tx_state("rollback without an open transaction"))?
        };
        self.adapter.rollback(handle).await
    }

    /// Runs `body` inside a transaction frame: commits on success, rolls
    /// back on error or when the abort signal trips mid-body.
    pub async fn with_tx<T, F, Fut>(&self, signal: &AbortSignal, body: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if signal.is_tripped() {
            return Err(DbRheoError::Cancelled);
        }

        self.begin(None).await?;

        let result = tokio::select! {
            result = body() => result,
            _ = signal.tripped() => Err(DbRheoError::Cancelled),
        };

        match result {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(e) => {
                // Roll back, but surface the original error.
                if let Err(rollback_err) = self.rollback().await {
                    debug!(error = %rollback_err, "Rollback after failure also failed");
                }
                Err(e)
            }
        }
    }
}
