//! Core pipeline records: sites, environments, and promotion jobs.
//!
//! Records reference each other by id only. Stores hold them in maps keyed
//! by id; nothing here owns a live object graph.

use crate::types::{EnvId, JobId, ProfileId, RevisionId, SiteId, SnapshotId};
use crate::SchemaError;
use serde::{Deserialize, Serialize};

/// Lifecycle state of one environment instance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EnvState {
    Provisioning,
    Running,
    Stopped,
    Destroying,
    Destroyed,
    Error,
}

impl std::fmt::Display for EnvState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvState::Provisioning => write!(f, "provisioning"),
            EnvState::Running => write!(f, "running"),
            EnvState::Stopped => write!(f, "stopped"),
            EnvState::Destroying => write!(f, "destroying"),
            EnvState::Destroyed => write!(f, "destroyed"),
            EnvState::Error => write!(f, "error"),
        }
    }
}

/// A hosted site owning one or more environments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SiteRecord {
    pub id: SiteId,
    pub name: String,
    pub created_at: String,
}

/// One deployable instance of a site at a stage.
///
/// The lock holder is deliberately absent: the lock table is owned by the
/// lock manager and checkpointed separately, never read back from here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvRecord {
    pub id: EnvId,
    pub site_id: SiteId,
    /// Stage label, e.g. `dev`, `staging`, `production`.
    pub stage: String,
    pub state: EnvState,
    /// Opaque handle owned by the runtime adapter.
    #[serde(default)]
    pub container_ref: Option<String>,
    #[serde(default)]
    pub revision: Option<RevisionId>,
    #[serde(default)]
    pub db_snapshot: Option<SnapshotId>,
    /// Whether this environment is the site's designated promotion source.
    /// At most one per site.
    #[serde(default)]
    pub production_source: bool,
    pub created_at: String,
    pub updated_at: String,
    /// blake3 checksum for integrity verification. `None` for legacy records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// Which parts of an environment a promotion carries over.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Components {
    #[serde(default)]
    pub code: bool,
    #[serde(default)]
    pub database: bool,
}

impl Components {
    pub const CODE: Components = Components {
        code: true,
        database: false,
    };
    pub const DATABASE: Components = Components {
        code: false,
        database: true,
    };
    pub const ALL: Components = Components {
        code: true,
        database: true,
    };

    pub fn is_empty(self) -> bool {
        !self.code && !self.database
    }

    /// Parse a wire-format component list, e.g. `["code", "database"]`.
    pub fn from_list(items: &[String]) -> Result<Self, SchemaError> {
        let mut c = Components::default();
        for item in items {
            match item.as_str() {
                "code" => c.code = true,
                "database" => c.database = true,
                other => return Err(SchemaError::UnknownComponent(other.to_owned())),
            }
        }
        if c.is_empty() {
            return Err(SchemaError::EmptyComponents);
        }
        Ok(c)
    }

    pub fn to_list(self) -> Vec<String> {
        let mut items = Vec::new();
        if self.code {
            items.push("code".to_owned());
        }
        if self.database {
            items.push("database".to_owned());
        }
        items
    }
}

impl std::fmt::Display for Components {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_list().join("+"))
    }
}

/// Status of a promotion job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Outcome of a single workflow step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StepOutcome {
    Ok,
    Failed,
    Skipped,
}

/// One entry in a job's ordered step log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepRecord {
    pub name: String,
    pub started_at: String,
    pub finished_at: String,
    pub outcome: StepOutcome,
    #[serde(default)]
    pub detail: Option<String>,
}

/// Destination state captured before any mutation, kept for manual revert.
/// No automatic rollback is ever performed from these values.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RollbackRef {
    #[serde(default)]
    pub revision: Option<RevisionId>,
    #[serde(default)]
    pub db_snapshot: Option<SnapshotId>,
}

/// One in-flight or completed promotion. Immutable once terminal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobRecord {
    pub id: JobId,
    pub source_env: EnvId,
    pub dest_env: EnvId,
    pub components: Components,
    #[serde(default)]
    pub sanitization_profile: Option<ProfileId>,
    /// Restore the destination to `stopped` after promotion if it was
    /// stopped beforehand. Off by default: the destination is left running.
    #[serde(default)]
    pub restore_stopped: bool,
    pub status: JobStatus,
    pub created_at: String,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub finished_at: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub rollback_ref: RollbackRef,
    #[serde(default)]
    pub steps: Vec<StepRecord>,
    /// blake3 checksum for integrity verification. `None` for legacy records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// Validate a stage or site name: short, filesystem- and URL-safe.
pub fn validate_name(name: &str) -> Result<(), SchemaError> {
    if name.is_empty() || name.len() > 64 {
        return Err(SchemaError::InvalidName(
            "name must be 1-64 characters".to_owned(),
        ));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        return Err(SchemaError::InvalidName(
            "name must match [a-zA-Z0-9_-]".to_owned(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn components_from_list() {
        let c = Components::from_list(&["code".to_owned(), "database".to_owned()]).unwrap();
        assert_eq!(c, Components::ALL);
        let c = Components::from_list(&["code".to_owned()]).unwrap();
        assert!(c.code && !c.database);
    }

    #[test]
    fn components_rejects_unknown() {
        let err = Components::from_list(&["files".to_owned()]).unwrap_err();
        assert!(err.to_string().contains("files"));
    }

    #[test]
    fn components_rejects_empty() {
        assert!(Components::from_list(&[]).is_err());
    }

    #[test]
    fn components_display() {
        assert_eq!(Components::ALL.to_string(), "code+database");
        assert_eq!(Components::DATABASE.to_string(), "database");
    }

    #[test]
    fn job_status_terminality() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn env_state_display() {
        assert_eq!(EnvState::Provisioning.to_string(), "provisioning");
        assert_eq!(EnvState::Destroyed.to_string(), "destroyed");
    }

    #[test]
    fn validate_name_limits() {
        assert!(validate_name("staging").is_ok());
        assert!(validate_name("prod-eu_1").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name(&"x".repeat(65)).is_err());
    }

    #[test]
    fn env_record_json_roundtrip() {
        let rec = EnvRecord {
            id: EnvId::new("env_1"),
            site_id: SiteId::new("site_1"),
            stage: "staging".to_owned(),
            state: EnvState::Running,
            container_ref: Some("ctr_9".to_owned()),
            revision: Some(RevisionId::new("rev_a")),
            db_snapshot: None,
            production_source: false,
            created_at: "2026-01-01T00:00:00Z".to_owned(),
            updated_at: "2026-01-01T00:00:00Z".to_owned(),
            checksum: None,
        };
        let json = serde_json::to_string(&rec).unwrap();
        let back: EnvRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rec);
    }
}
