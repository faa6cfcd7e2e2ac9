//! Crash-consistent JSON index files.
//!
//! Index documents are written to a sibling `*.tmp` file, synced, then
//! renamed over the live file, so readers observe either the previous or the
//! new version and never a torn write.

use std::io::Write;
use std::path::Path;

use a3s_store_core::error::{Result, StoreError};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Load a JSON document, returning `T::default()` when the file is absent.
pub(crate) fn load_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }

    let data = std::fs::read_to_string(path).map_err(|e| {
        StoreError::StorageIo(format!("Failed to read index {}: {}", path.display(), e))
    })?;

    serde_json::from_str(&data).map_err(|e| {
        StoreError::Serialization(format!("Failed to parse index {}: {}", path.display(), e))
    })
}

/// Atomically replace `path` with the JSON encoding of `value`.
pub(crate) fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            StoreError::StorageIo(format!(
                "Failed to create directory {}: {}",
                parent.display(),
                e
            ))
        })?;
    }

    let json = serde_json::to_vec_pretty(value)?;

    let tmp_path = path.with_extension("json.tmp");
    let mut file = std::fs::File::create(&tmp_path).map_err(|e| {
        StoreError::StorageIo(format!(
            "Failed to create tmp file {}: {}",
            tmp_path.display(),
            e
        ))
    })?;
    file.write_all(&json)
        .and_then(|_| file.sync_all())
        .map_err(|e| {
            StoreError::StorageIo(format!(
                "Failed to write tmp file {}: {}",
                tmp_path.display(),
                e
            ))
        })?;
    drop(file);

    std::fs::rename(&tmp_path, path).map_err(|e| {
        StoreError::StorageIo(format!(
            "Failed to rename {} → {}: {}",
            tmp_path.display(),
            path.display(),
            e
        ))
    })?;

    Ok(())
}
