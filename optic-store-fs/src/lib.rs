#![deny(missing_docs)]
//! Filesystem-backed implementations of the optic store ports.
//!
//! Buckets and tables map to subdirectories under a root; object keys
//! map to nested paths. Writes go to a temporary sibling first and are
//! renamed into place, so a partially written object is never readable.
//! Provides true persistence across process restarts for local and
//! single-machine deployments.

mod artifact;
mod meta;

pub use artifact::FsArtifactStore;
pub use meta::FsMetaStore;

use optic_protocol::{ErrorCategory, WorkflowError};
use std::path::{Path, PathBuf};

/// Counter for unique temp-file names within the process.
static TEMP_SEQ: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

/// Write `content` to `path` atomically: write a temporary sibling,
/// then rename it into place.
async fn write_atomic(path: &Path, content: &str) -> Result<(), WorkflowError> {
    let parent = path.parent().ok_or_else(|| {
        WorkflowError::new(
            ErrorCategory::Storage,
            "ARTIFACT_WRITE_FAILED",
            format!("object path {} has no parent", path.display()),
        )
        .non_retryable()
    })?;
    tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| io_error("create_dir_all", path, e))?;

    let seq = TEMP_SEQ.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    let mut tmp: PathBuf = path.to_path_buf();
    tmp.set_extension(format!("tmp-{}-{seq}", std::process::id()));
    tokio::fs::write(&tmp, content)
        .await
        .map_err(|e| io_error("write", &tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| io_error("rename", path, e))?;
    Ok(())
}

/// Map an I/O failure to a transient STORAGE error.
fn io_error(operation: &str, path: &Path, error: std::io::Error) -> WorkflowError {
    WorkflowError::new(
        ErrorCategory::Storage,
        "ARTIFACT_IO_FAILED",
        format!("{operation} failed for {}: {error}", path.display()),
    )
    .with_operation(operation.to_string())
    .with_source(error)
}

/// Reject keys that could escape the store root.
fn validate_key(key: &str) -> Result<(), WorkflowError> {
    let escapes = key.starts_with('/')
        || key
            .split('/')
            .any(|segment| segment == ".." || segment.is_empty());
    if escapes {
        return Err(WorkflowError::new(
            ErrorCategory::Storage,
            "INVALID_ARTIFACT_KEY",
            format!("object key {key} is not a clean relative path"),
        )
        .non_retryable());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_must_stay_below_the_root() {
        assert!(validate_key("2025/04/01/verif-1/images/metadata.json").is_ok());
        assert!(validate_key("/absolute").is_err());
        assert!(validate_key("a//b").is_err());
        assert!(validate_key("a/../b").is_err());
    }

    #[tokio::test]
    async fn atomic_write_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/c.json");
        write_atomic(&path, "{}").await.unwrap();
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "{}");
    }

    #[tokio::test]
    async fn atomic_write_replaces_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("object.json");
        write_atomic(&path, "first").await.unwrap();
        write_atomic(&path, "second").await.unwrap();
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "second");
    }
}
