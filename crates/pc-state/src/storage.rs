//! # State Persistence
//!
//! Storage port plus the debounced persistence task. Writes are coalesced so
//! a burst of actions produces one save; teardown flushes the latest state
//! and closes the backend exactly once.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info};

use crate::state::EngineState;

/// Errors from the persistence backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage closed")]
    Closed,
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("backend error: {0}")]
    Backend(String),
}

/// Port for the state persistence backend.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Load the persisted state, if any.
    async fn load(&self) -> Result<Option<EngineState>, StorageError>;

    /// Persist a state snapshot, replacing the previous one.
    async fn save(&self, state: &EngineState) -> Result<(), StorageError>;

    /// Flush and close the backend. Saves after close fail.
    async fn close(&self) -> Result<(), StorageError>;
}

/// In-memory backend, used in tests and as the default for ephemeral runs.
#[derive(Default)]
pub struct MemoryStorage {
    inner: parking_lot::Mutex<MemoryStorageInner>,
}

#[derive(Default)]
struct MemoryStorageInner {
    stored: Option<String>,
    closed: bool,
    save_count: u64,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of saves performed, for debounce assertions.
    #[must_use]
    pub fn save_count(&self) -> u64 {
        self.inner.lock().save_count
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn load(&self) -> Result<Option<EngineState>, StorageError> {
        let inner = self.inner.lock();
        if inner.closed {
            return Err(StorageError::Closed);
        }
        match &inner.stored {
            Some(json) => Ok(Some(serde_json::from_str(json)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, state: &EngineState) -> Result<(), StorageError> {
        let json = serde_json::to_string(state)?;
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(StorageError::Closed);
        }
        inner.stored = Some(json);
        inner.save_count += 1;
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.inner.lock().closed = true;
        Ok(())
    }
}

/// Spawn the debounced persistence task.
///
/// Watches `state_rx` and saves at most once per `debounce` window. The task
/// ends when `stop_rx` flips to true (or either sender is dropped); it then
/// flushes the final state and closes the backend.
pub fn spawn_persistence(
    storage: Arc<dyn Storage>,
    mut state_rx: watch::Receiver<Arc<EngineState>>,
    debounce: Duration,
    mut stop_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        state_rx.mark_changed();
        loop {
            tokio::select! {
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    // coalesce further changes arriving inside the window
                    sleep(debounce).await;
                    let state = state_rx.borrow_and_update().clone();
                    if let Err(err) = storage.save(&state).await {
                        error!(%err, "state save failed");
                    } else {
                        debug!(block = state.block_number, "state persisted");
                    }
                }
                res = stop_rx.changed() => {
                    if res.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
        // teardown: flush whatever we last saw, then close
        let state = state_rx.borrow().clone();
        if let Err(err) = storage.save(&state).await {
            error!(%err, "final state save failed");
        }
        if let Err(err) = storage.close().await {
            error!(%err, "storage close failed");
        } else {
            info!("storage closed");
        }
    })
}
