use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Current store format version. Incremented on incompatible layout changes.
pub const STORE_FORMAT_VERSION: u32 = 1;
const VERSION_FILE: &str = "version";

/// Directory layout for the Cascade pipeline store.
///
/// Manages paths for site, environment, job, profile, and activity records,
/// the lock-table checkpoint, and the store version marker. All
/// subdirectories are created lazily on [`initialize`](Self::initialize).
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreVersion {
    format_version: u32,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn sites_dir(&self) -> PathBuf {
        self.root.join("store").join("sites")
    }

    #[inline]
    pub fn environments_dir(&self) -> PathBuf {
        self.root.join("store").join("environments")
    }

    #[inline]
    pub fn jobs_dir(&self) -> PathBuf {
        self.root.join("store").join("jobs")
    }

    #[inline]
    pub fn profiles_dir(&self) -> PathBuf {
        self.root.join("store").join("profiles")
    }

    #[inline]
    pub fn activities_dir(&self) -> PathBuf {
        self.root.join("store").join("activities")
    }

    /// Advisory lock file preventing two daemons from sharing a data dir.
    #[inline]
    pub fn lock_file(&self) -> PathBuf {
        self.root.join("store").join(".lock")
    }

    /// Checkpoint of the in-memory lock table, for crash-recovery visibility.
    #[inline]
    pub fn lock_checkpoint_file(&self) -> PathBuf {
        self.root.join("store").join("locks.json")
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.sites_dir())?;
        fs::create_dir_all(self.environments_dir())?;
        fs::create_dir_all(self.jobs_dir())?;
        fs::create_dir_all(self.profiles_dir())?;
        fs::create_dir_all(self.activities_dir())?;

        let version_path = self.root.join("store").join(VERSION_FILE);
        if version_path.exists() {
            self.verify_version()?;
        } else {
            let ver = StoreVersion {
                format_version: STORE_FORMAT_VERSION,
            };
            let content = serde_json::to_string_pretty(&ver)?;
            let store_dir = self.root.join("store");
            let mut tmp = NamedTempFile::new_in(&store_dir)?;
            tmp.write_all(content.as_bytes())?;
            tmp.as_file().sync_all()?;
            tmp.persist(&version_path)
                .map_err(|e| StoreError::Io(e.error))?;
            crate::fsync_dir(&store_dir)?;
        }

        Ok(())
    }

    pub fn verify_version(&self) -> Result<(), StoreError> {
        let version_path = self.root.join("store").join(VERSION_FILE);
        let content = fs::read_to_string(&version_path)?;
        let ver: StoreVersion = serde_json::from_str(&content)?;

        if ver.format_version != STORE_FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: STORE_FORMAT_VERSION,
                found: ver.format_version,
            });
        }
        Ok(())
    }
}
