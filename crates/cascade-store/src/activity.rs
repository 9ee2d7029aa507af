//! Append-only activity store.
//!
//! One file per entry, named so lexicographic order equals chronological
//! order. The store exposes `append` and paginated `list` only; there is no
//! update or delete path.

use crate::layout::StoreLayout;
use crate::{fsync_dir, StoreError};
use cascade_schema::ActivityRecord;
use serde::Serialize;
use std::fs;
use std::io::Write;
use tempfile::NamedTempFile;
use tracing::warn;

pub struct ActivityStore {
    layout: StoreLayout,
}

/// One page of activity entries, newest first.
#[derive(Debug, Serialize)]
pub struct ActivityPage {
    pub entries: Vec<ActivityRecord>,
    pub total: usize,
    pub page: usize,
    pub per_page: usize,
}

impl ActivityStore {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    /// Append one entry. The file name is the record id, which carries a
    /// sortable timestamp prefix.
    pub fn append(&self, rec: &ActivityRecord) -> Result<(), StoreError> {
        let dir = self.layout.activities_dir();
        let dest = dir.join(rec.id.as_str());
        if dest.exists() {
            return Err(StoreError::DuplicateActivity(rec.id.to_string()));
        }
        let content = serde_json::to_string_pretty(rec)?;
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&dest).map_err(|e| StoreError::Io(e.error))?;
        fsync_dir(&dir)?;
        Ok(())
    }

    pub fn get(&self, activity_id: &str) -> Result<ActivityRecord, StoreError> {
        let path = self.layout.activities_dir().join(activity_id);
        if !path.exists() {
            return Err(StoreError::RecordNotFound(activity_id.to_owned()));
        }
        let content = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// All entries for a site, newest first.
    pub fn list_for_site(&self, site_id: &str) -> Result<Vec<ActivityRecord>, StoreError> {
        let dir = self.layout.activities_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names: Vec<String> = fs::read_dir(&dir)?
            .filter_map(Result::ok)
            .filter_map(|e| e.file_name().to_str().map(String::from))
            .filter(|n| !n.starts_with('.'))
            .collect();
        names.sort();
        names.reverse();

        let mut entries = Vec::new();
        for name in names {
            match self.get(&name) {
                Ok(rec) => {
                    if rec.site_id == site_id {
                        entries.push(rec);
                    }
                }
                Err(e) => warn!("skipping unreadable activity {name}: {e}"),
            }
        }
        Ok(entries)
    }

    /// Paginated view over a site's trail. Pages are 1-based.
    pub fn page_for_site(
        &self,
        site_id: &str,
        page: usize,
        per_page: usize,
    ) -> Result<ActivityPage, StoreError> {
        let all = self.list_for_site(site_id)?;
        let total = all.len();
        let page = page.max(1);
        let per_page = per_page.clamp(1, 500);
        let entries = all
            .into_iter()
            .skip((page - 1) * per_page)
            .take(per_page)
            .collect();
        Ok(ActivityPage {
            entries,
            total,
            page,
            per_page,
        })
    }

}
