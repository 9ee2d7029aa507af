//! Record stores for sites, environments, jobs, and sanitization profiles.
//!
//! One JSON file per record, keyed by id. Writes go through a temp file,
//! fsync, rename, and parent-dir fsync so a crash never leaves a torn
//! record behind. Environment and job records embed a blake3 checksum that
//! is verified on every read.

use crate::layout::StoreLayout;
use crate::{fsync_dir, StoreError};
use cascade_schema::{EnvRecord, JobRecord, SanitizationProfile, SiteRecord};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::warn;

fn write_atomic(dir: &Path, dest: &Path, content: &str) -> Result<(), StoreError> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(content.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| StoreError::Io(e.error))?;
    fsync_dir(dir)?;
    Ok(())
}

fn read_record<T: DeserializeOwned>(path: &Path, id: &str) -> Result<T, StoreError> {
    if !path.exists() {
        return Err(StoreError::RecordNotFound(id.to_owned()));
    }
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn list_records<T: DeserializeOwned>(
    dir: &Path,
    get: impl Fn(&str) -> Result<T, StoreError>,
) -> Result<Vec<T>, StoreError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut results = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            let name = entry.file_name();
            let name_str = name.to_str().unwrap_or("");
            if !name_str.starts_with('.') {
                match get(name_str) {
                    Ok(rec) => results.push(rec),
                    Err(e) => warn!("skipping unreadable record {name_str}: {e}"),
                }
            }
        }
    }
    Ok(results)
}

fn compute_checksum<T: Serialize>(value: &T) -> Result<String, StoreError> {
    let json = serde_json::to_string_pretty(value)?;
    Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
}

/// Store of environment records, checksummed on write and verified on read.
pub struct EnvStore {
    layout: StoreLayout,
}

impl EnvStore {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    pub fn put(&self, rec: &EnvRecord) -> Result<(), StoreError> {
        let dir = self.layout.environments_dir();
        let dest = dir.join(rec.id.as_str());

        let mut with_checksum = rec.clone();
        with_checksum.checksum = None;
        with_checksum.checksum = Some(compute_checksum(&with_checksum)?);
        let content = serde_json::to_string_pretty(&with_checksum)?;
        write_atomic(&dir, &dest, &content)
    }

    pub fn get(&self, env_id: &str) -> Result<EnvRecord, StoreError> {
        let path = self.layout.environments_dir().join(env_id);
        let rec: EnvRecord = read_record(&path, env_id)?;

        // Verify checksum if present (backward-compatible: legacy files have None)
        if let Some(ref expected) = rec.checksum {
            let mut copy = rec.clone();
            copy.checksum = None;
            let actual = compute_checksum(&copy)?;
            if actual != *expected {
                return Err(StoreError::IntegrityFailure {
                    id: env_id.to_owned(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        Ok(rec)
    }

    pub fn exists(&self, env_id: &str) -> bool {
        self.layout.environments_dir().join(env_id).exists()
    }

    pub fn list(&self) -> Result<Vec<EnvRecord>, StoreError> {
        list_records(&self.layout.environments_dir(), |id| self.get(id))
    }

    pub fn list_for_site(&self, site_id: &str) -> Result<Vec<EnvRecord>, StoreError> {
        let mut envs = self.list()?;
        envs.retain(|e| e.site_id == site_id);
        envs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(envs)
    }
}

/// Store of site records.
pub struct SiteStore {
    layout: StoreLayout,
}

impl SiteStore {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    pub fn put(&self, rec: &SiteRecord) -> Result<(), StoreError> {
        let dir = self.layout.sites_dir();
        let dest = dir.join(rec.id.as_str());
        let content = serde_json::to_string_pretty(rec)?;
        write_atomic(&dir, &dest, &content)
    }

    pub fn get(&self, site_id: &str) -> Result<SiteRecord, StoreError> {
        let path = self.layout.sites_dir().join(site_id);
        read_record(&path, site_id)
    }

    pub fn exists(&self, site_id: &str) -> bool {
        self.layout.sites_dir().join(site_id).exists()
    }

    pub fn list(&self) -> Result<Vec<SiteRecord>, StoreError> {
        let mut sites = list_records(&self.layout.sites_dir(), |id| self.get(id))?;
        sites.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(sites)
    }
}

/// Store of promotion job records, checksummed like environments.
///
/// Jobs are never removed: terminal records stay as the historical trail
/// referenced by activity entries.
pub struct JobStore {
    layout: StoreLayout,
}

impl JobStore {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    pub fn put(&self, rec: &JobRecord) -> Result<(), StoreError> {
        let dir = self.layout.jobs_dir();
        let dest = dir.join(rec.id.as_str());

        let mut with_checksum = rec.clone();
        with_checksum.checksum = None;
        with_checksum.checksum = Some(compute_checksum(&with_checksum)?);
        let content = serde_json::to_string_pretty(&with_checksum)?;
        write_atomic(&dir, &dest, &content)
    }

    pub fn get(&self, job_id: &str) -> Result<JobRecord, StoreError> {
        let path = self.layout.jobs_dir().join(job_id);
        let rec: JobRecord = read_record(&path, job_id)?;

        if let Some(ref expected) = rec.checksum {
            let mut copy = rec.clone();
            copy.checksum = None;
            let actual = compute_checksum(&copy)?;
            if actual != *expected {
                return Err(StoreError::IntegrityFailure {
                    id: job_id.to_owned(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        Ok(rec)
    }

    pub fn exists(&self, job_id: &str) -> bool {
        self.layout.jobs_dir().join(job_id).exists()
    }

    pub fn list(&self) -> Result<Vec<JobRecord>, StoreError> {
        list_records(&self.layout.jobs_dir(), |id| self.get(id))
    }

    /// Jobs (pending or running) touching the given environment as source
    /// or destination.
    pub fn active_for_env(&self, env_id: &str) -> Result<Vec<JobRecord>, StoreError> {
        let mut jobs = self.list()?;
        jobs.retain(|j| {
            !j.status.is_terminal() && (j.source_env == env_id || j.dest_env == env_id)
        });
        Ok(jobs)
    }
}

/// Store of sanitization profiles.
pub struct ProfileStore {
    layout: StoreLayout,
}

impl ProfileStore {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    pub fn put(&self, profile: &SanitizationProfile) -> Result<(), StoreError> {
        let dir = self.layout.profiles_dir();
        let dest = dir.join(profile.id.as_str());
        let content = serde_json::to_string_pretty(profile)?;
        write_atomic(&dir, &dest, &content)
    }

    pub fn get(&self, profile_id: &str) -> Result<SanitizationProfile, StoreError> {
        let path = self.layout.profiles_dir().join(profile_id);
        read_record(&path, profile_id)
    }

    pub fn exists(&self, profile_id: &str) -> bool {
        self.layout.profiles_dir().join(profile_id).exists()
    }

    pub fn list(&self) -> Result<Vec<SanitizationProfile>, StoreError> {
        list_records(&self.layout.profiles_dir(), |id| self.get(id))
    }
}
