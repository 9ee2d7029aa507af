//! Append-only activity records: the pipeline's audit trail.

use crate::types::{ActivityId, SiteId};
use serde::{Deserialize, Serialize};

/// Outcome of the action an activity records.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ActivityStatus {
    Ok,
    Failed,
    /// Refused before any side effect (policy or validation).
    Rejected,
    /// Stopped cooperatively at a step boundary.
    Cancelled,
}

impl std::fmt::Display for ActivityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActivityStatus::Ok => write!(f, "ok"),
            ActivityStatus::Failed => write!(f, "failed"),
            ActivityStatus::Rejected => write!(f, "rejected"),
            ActivityStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One audit entry. Never mutated after creation; written for every
/// user-visible or state-changing action, including failed attempts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActivityRecord {
    pub id: ActivityId,
    pub site_id: SiteId,
    /// `None` for system-initiated actions.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Action kind, e.g. `promote`, `env.start`, `env.lock`.
    pub action: String,
    pub description: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub status: ActivityStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    pub timestamp: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activity_json_roundtrip() {
        let rec = ActivityRecord {
            id: ActivityId::new("act_1"),
            site_id: SiteId::new("site_1"),
            user_id: None,
            action: "promote".to_owned(),
            description: "promote staging -> production".to_owned(),
            metadata: serde_json::json!({"job_id": "job_1"}),
            status: ActivityStatus::Ok,
            error: None,
            duration_ms: Some(1250),
            timestamp: "2026-01-01T00:00:00Z".to_owned(),
        };
        let json = serde_json::to_string(&rec).unwrap();
        let back: ActivityRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn status_display() {
        assert_eq!(ActivityStatus::Rejected.to_string(), "rejected");
    }
}
