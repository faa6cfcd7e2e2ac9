//! Blocking work off the async executor.

use a3s_store_core::error::{Result, StoreError};

/// Run blocking filesystem or hashing work on the blocking pool.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::StorageIo(format!("Blocking task failed: {}", e)))?
}
