//! Domain model for the Cascade environment pipeline.
//!
//! This crate defines the shared vocabulary: typed string ids, site and
//! environment records, promotion jobs with their step logs, append-only
//! activity records, and TOML-authored sanitization profiles. Everything
//! here is plain serializable data; behavior lives in `cascade-core`.

pub mod activity;
pub mod model;
pub mod profile;
pub mod types;

pub use activity::{ActivityRecord, ActivityStatus};
pub use model::{
    validate_name, Components, EnvRecord, EnvState, JobRecord, JobStatus, RollbackRef, SiteRecord,
    StepOutcome, StepRecord,
};
pub use profile::{SanitizationAction, SanitizationProfile, SanitizationRule};
pub use types::{
    generate_id, ActivityId, EnvId, HolderToken, JobId, ProfileId, RevisionId, SiteId, SnapshotId,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("unknown promotion component: {0}")]
    UnknownComponent(String),
    #[error("at least one promotion component is required")]
    EmptyComponents,
    #[error("invalid name: {0}")]
    InvalidName(String),
    #[error("sanitization profile '{0}' has no rules")]
    EmptyProfile(String),
    #[error("invalid sanitization rule: {0}")]
    InvalidRule(String),
    #[error("profile parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
