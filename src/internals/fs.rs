//! Atomic JSON persistence.
//!
//! Every file the pipeline writes (daemon state, tracker snapshots, caches,
//! DLQ entries) goes through [`atomic_write_json`]: serialize, write to a
//! sibling temp file, rename into place. Readers never observe a torn write.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use tokio::fs;

use crate::error::{PipelineError, PipelineResult};

/// Serialize `value` and atomically replace `path` with it.
///
/// Parent directories are created as needed.
pub async fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> PipelineResult<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| PipelineError::storage(path.display().to_string(), e.to_string()))?;
    atomic_write_bytes(path, &bytes).await
}

/// Atomically replace `path` with `bytes` via temp file + rename.
pub async fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> PipelineResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| PipelineError::storage(parent.display().to_string(), e.to_string()))?;
    }

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)
        .await
        .map_err(|e| PipelineError::storage(tmp.display().to_string(), e.to_string()))?;
    fs::rename(&tmp, path)
        .await
        .map_err(|e| PipelineError::storage(path.display().to_string(), e.to_string()))?;
    Ok(())
}

/// Load a JSON file, returning `None` when it does not exist.
///
/// A file that exists but fails to parse is a storage error: the caller
/// decides whether that is fatal (daemon state) or a refetch (caches).
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> PipelineResult<Option<T>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(PipelineError::storage(path.display().to_string(), e.to_string())),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| PipelineError::storage(path.display().to_string(), e.to_string()))
}
