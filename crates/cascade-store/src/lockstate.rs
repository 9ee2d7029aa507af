//! Lock-table checkpointing and the store-wide advisory lock.
//!
//! The live lock table is in-memory, owned by the core lock manager. It is
//! checkpointed here after every mutation so that a crash leaves the last
//! set of holders visible on disk: orphaned locks (a holder token with no
//! live job) require operator intervention and must never be silently
//! cleared.

use crate::layout::StoreLayout;
use crate::{fsync_dir, StoreError};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use tempfile::NamedTempFile;

/// Serialized form of one held lock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockSnapshot {
    pub env_id: String,
    pub holder: String,
    #[serde(default)]
    pub reason: Option<String>,
    pub manual: bool,
    pub acquired_at: String,
}

/// Reads and writes the `locks.json` checkpoint.
pub struct LockCheckpoint {
    layout: StoreLayout,
}

impl LockCheckpoint {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    pub fn save(&self, locks: &[LockSnapshot]) -> Result<(), StoreError> {
        let dir = self.layout.root().join("store");
        std::fs::create_dir_all(&dir)?;
        let dest = self.layout.lock_checkpoint_file();
        let content = serde_json::to_string_pretty(locks)?;
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&dest).map_err(|e| StoreError::Io(e.error))?;
        fsync_dir(&dir)?;
        Ok(())
    }

    pub fn load(&self) -> Result<Vec<LockSnapshot>, StoreError> {
        let path = self.layout.lock_checkpoint_file();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Exclusive advisory lock on the store root. Held for the lifetime of the
/// daemon so two processes cannot share one data dir.
pub struct StoreGuard {
    lock_file: File,
}

impl StoreGuard {
    pub fn acquire(layout: &StoreLayout) -> Result<Self, StoreError> {
        let lock_path = layout.lock_file();
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)?;

        file.try_lock_exclusive().map_err(|_| {
            StoreError::StoreBusy(lock_path.display().to_string())
        })?;

        Ok(Self { lock_file: file })
    }
}

impl Drop for StoreGuard {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.lock_file);
    }
}
