//! Core orchestration for the Cascade environment pipeline.
//!
//! This crate ties together the record stores and collaborator adapters
//! into the `Engine` — the API-facing surface for environment lifecycle,
//! promotion, sync-from-production, comparison, and manual locking. It
//! also provides the per-environment lock manager with deadlock-free
//! pair acquisition, the lifecycle state machine, the activity logger,
//! and the bounded background worker pool that executes promotion jobs.

pub mod activity;
pub mod engine;
pub mod jobs;
pub mod lifecycle;
pub mod locks;

pub use activity::ActivityLogger;
pub use engine::{
    Comparison, Engine, EngineOptions, EnvSummary, LockView, ProjectSummary, PromoteRequest,
};
pub use jobs::JobManager;
pub use lifecycle::validate_transition;
pub use locks::{LockInfo, LockManager};

use cascade_schema::{EnvId, HolderToken};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("environment '{env}' is locked by '{holder}'")]
    LockConflict { env: EnvId, holder: HolderToken },
    #[error("lock on '{env}' is not held by '{holder}'")]
    NotHolder { env: EnvId, holder: HolderToken },
    #[error("policy violation: {0}")]
    PolicyViolation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("job queue is full; retry later")]
    QueueFull,
    #[error("adapter error: {0}")]
    Adapter(#[from] cascade_adapters::AdapterError),
    #[error("store error: {0}")]
    Store(#[from] cascade_store::StoreError),
    #[error("schema error: {0}")]
    Schema(#[from] cascade_schema::SchemaError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    pub fn is_lock_conflict(&self) -> bool {
        matches!(self, CoreError::LockConflict { .. })
    }
}
