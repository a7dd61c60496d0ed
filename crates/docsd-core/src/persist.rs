//! Atomic tempfile-then-rename writes shared by the state store and the
//! remote-head cache: both persist a JSON document that must never be
//! observed half-written after a crash mid-flush.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

/// Write `contents` to `path` atomically: write to a sibling tempfile, then
/// rename over the destination. The rename is atomic on the same filesystem
/// on every platform this targets (Unix `rename(2)`, Windows `MoveFileEx`).
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating parent directory {}", dir.display()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("creating tempfile in {}", dir.display()))?;
    tmp.write_all(contents)
        .with_context(|| format!("writing tempfile for {}", path.display()))?;
    tmp.flush().context("flushing tempfile")?;
    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("renaming tempfile onto {}", path.display()))?;
    Ok(())
}

/// Read and parse a JSON document at `path`, returning `None` if the file
/// does not exist and logging (not failing) on corruption — per §7, data
/// corruption on load is a warning, never a startup blocker.
pub fn load_json_lenient<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read persisted file, starting empty");
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to parse persisted file, starting empty");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_through_atomic_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        atomic_write(&path, b"{\"a\":1}").unwrap();
        let value: serde_json::Value = load_json_lenient(&path).unwrap();
        assert_eq!(value, json!({"a": 1}));
    }

    #[test]
    fn missing_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let value: Option<serde_json::Value> = load_json_lenient(&path);
        assert!(value.is_none());
    }

    #[test]
    fn corrupt_file_returns_none_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.json");
        std::fs::write(&path, b"not json").unwrap();
        let value: Option<serde_json::Value> = load_json_lenient(&path);
        assert!(value.is_none());
    }
}
