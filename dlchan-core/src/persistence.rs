//! Shared persistence utilities: atomic file writes and forgiving JSON loads.
//!
//! Every store in this crate persists a whole structure per write. Writes go
//! to a `.tmp` sibling that is renamed over the target, so a concurrent
//! reader sees either the previous or the next version of the file.

use crate::error::StoreError;
use std::io;
use std::path::Path;

/// Atomically write JSON data to a file.
///
/// Serializes `data` to pretty-printed JSON, writes to a `.tmp` sibling file,
/// then renames it over the target path. Creates parent directories if needed.
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, data: &T) -> Result<(), StoreError> {
    let json = serde_json::to_string_pretty(data)?;
    atomic_write(path, json.as_bytes()).map_err(|e| StoreError::io(path, e))
}

/// Atomically write raw bytes to a file.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Load and deserialize JSON from a file.
///
/// Returns `Ok(None)` if the file doesn't exist.
/// Returns `Err` on I/O errors or deserialization failures.
pub fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path)?;
    let value =
        serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}

/// Load a store, treating a missing or unreadable file as the default value.
///
/// Corruption is logged and healed by the next write of the caller.
pub fn load_or_default<T>(path: &Path, store: &str) -> T
where
    T: serde::de::DeserializeOwned + Default,
{
    match load_json(path) {
        Ok(Some(value)) => value,
        Ok(None) => T::default(),
        Err(e) => {
            tracing::warn!(
                store,
                path = %path.display(),
                error = %e,
                "Store unreadable, treating it as empty"
            );
            T::default()
        }
    }
}
