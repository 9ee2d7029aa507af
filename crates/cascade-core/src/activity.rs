//! Activity logging façade over the append-only store.
//!
//! Every state-changing operation records an entry here, failures and
//! rejections included, so the audit trail reflects attempted actions and
//! not only successes.

use crate::CoreError;
use cascade_schema::{generate_id, ActivityId, ActivityRecord, ActivityStatus, SiteId};
use cascade_store::ActivityStore;
use tracing::warn;

pub struct ActivityLogger {
    store: ActivityStore,
}

impl ActivityLogger {
    pub fn new(store: ActivityStore) -> Self {
        Self { store }
    }

    /// Append one entry and return its id. No update or delete exists.
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &self,
        site_id: &SiteId,
        user_id: Option<&str>,
        action: &str,
        description: impl Into<String>,
        metadata: serde_json::Value,
        status: ActivityStatus,
        error: Option<String>,
        duration_ms: Option<u64>,
    ) -> Result<ActivityId, CoreError> {
        let id = ActivityId::new(generate_id("act", action));
        let rec = ActivityRecord {
            id: id.clone(),
            site_id: site_id.clone(),
            user_id: user_id.map(ToOwned::to_owned),
            action: action.to_owned(),
            description: description.into(),
            metadata,
            status,
            error,
            duration_ms,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        self.store.append(&rec)?;
        Ok(id)
    }

    /// Like [`record`](Self::record) but never fails the surrounding
    /// operation: used on paths that are already handling another error.
    #[allow(clippy::too_many_arguments)]
    pub fn record_best_effort(
        &self,
        site_id: &SiteId,
        user_id: Option<&str>,
        action: &str,
        description: impl Into<String>,
        metadata: serde_json::Value,
        status: ActivityStatus,
        error: Option<String>,
        duration_ms: Option<u64>,
    ) {
        if let Err(e) = self.record(
            site_id,
            user_id,
            action,
            description,
            metadata,
            status,
            error,
            duration_ms,
        ) {
            warn!("activity append failed for {action}: {e}");
        }
    }

    pub fn store(&self) -> &ActivityStore {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_store::StoreLayout;

    fn logger() -> (tempfile::TempDir, ActivityLogger) {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();
        (dir, ActivityLogger::new(ActivityStore::new(layout)))
    }

    #[test]
    fn record_appends_with_generated_id() {
        let (_dir, logger) = logger();
        let site = SiteId::new("site_1");
        let id = logger
            .record(
                &site,
                Some("alice"),
                "env.start",
                "start staging",
                serde_json::json!({"env": "env_1"}),
                ActivityStatus::Ok,
                None,
                Some(12),
            )
            .unwrap();

        let entries = logger.store().list_for_site("site_1").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, id);
        assert_eq!(entries[0].user_id.as_deref(), Some("alice"));
        assert_eq!(entries[0].duration_ms, Some(12));
    }

    #[test]
    fn failures_are_recorded_too() {
        let (_dir, logger) = logger();
        let site = SiteId::new("site_1");
        logger
            .record(
                &site,
                None,
                "promote",
                "promotion failed",
                serde_json::Value::Null,
                ActivityStatus::Failed,
                Some("database step failed".to_owned()),
                Some(400),
            )
            .unwrap();

        let entries = logger.store().list_for_site("site_1").unwrap();
        assert_eq!(entries[0].status, ActivityStatus::Failed);
        assert!(entries[0].error.as_deref().unwrap().contains("database"));
    }
}
