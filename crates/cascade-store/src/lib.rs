//! File-backed persistence for the Cascade pipeline.
//!
//! This crate provides the storage layer: per-record JSON stores for sites,
//! environments, jobs, and sanitization profiles with atomic writes and
//! blake3 checksums, an append-only `ActivityStore` for the audit trail,
//! `StoreLayout` for directory structure management, and the lock-table
//! checkpoint used for crash-recovery visibility.

pub mod activity;
pub mod layout;
pub mod lockstate;
pub mod records;

pub use activity::{ActivityPage, ActivityStore};
pub use layout::{StoreLayout, STORE_FORMAT_VERSION};
pub use lockstate::{LockCheckpoint, LockSnapshot, StoreGuard};
pub use records::{EnvStore, JobStore, ProfileStore, SiteStore};

use std::path::Path;
use thiserror::Error;

/// Fsync a directory to ensure that a preceding `rename()` is durable.
///
/// On Linux with ext4 `data=ordered` (the default), renames are usually
/// durable without an explicit dir fsync, but POSIX does not guarantee this.
/// Calling `fsync()` on the parent directory makes the rename durable on
/// all filesystems and mount configurations.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("integrity check failed for record '{id}': expected {expected}, got {actual}")]
    IntegrityFailure {
        id: String,
        expected: String,
        actual: String,
    },
    #[error("record not found: {0}")]
    RecordNotFound(String),
    #[error("activity '{0}' already exists; activity records are append-only")]
    DuplicateActivity(String),
    #[error("store is in use by another process (lock file: {0})")]
    StoreBusy(String),
    #[error("store format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_display_record_not_found() {
        let e = StoreError::RecordNotFound("env_1".to_owned());
        assert!(e.to_string().contains("env_1"));
    }

    #[test]
    fn store_error_display_version_mismatch() {
        let e = StoreError::VersionMismatch {
            expected: 2,
            found: 1,
        };
        let msg = e.to_string();
        assert!(msg.contains('2'));
        assert!(msg.contains('1'));
    }

    #[test]
    fn store_error_display_integrity_failure() {
        let e = StoreError::IntegrityFailure {
            id: "job_1".to_owned(),
            expected: "exp".to_owned(),
            actual: "act".to_owned(),
        };
        let msg = e.to_string();
        assert!(msg.contains("exp"));
        assert!(msg.contains("act"));
    }

    #[test]
    fn store_error_display_duplicate_activity() {
        let e = StoreError::DuplicateActivity("act-1".to_owned());
        assert!(e.to_string().contains("append-only"));
    }
}
