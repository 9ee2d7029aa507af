//! Collaborator adapters for the Cascade pipeline.
//!
//! This crate defines the three contracts the core orchestrates —
//! `RuntimeAdapter` (container lifecycle), `VcsAdapter` (code state), and
//! `DbSyncAdapter` (dump/sanitize/restore/compare) — plus two
//! implementations: a shared-state mock with failure injection for tests,
//! and command-template adapters that shell out to operator-configured
//! tooling.

pub mod command;
pub mod dbsync;
pub mod mock;
pub mod runtime;
pub mod vcs;

pub use command::CommandConfig;
pub use dbsync::{DbComparison, DbDump, DbSyncAdapter, DumpTable, TableDelta};
pub use mock::{MockAdapters, MockBarrier};
pub use runtime::{RuntimeAdapter, RuntimeStatus};
pub use vcs::{CodeDiff, VcsAdapter};

use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("adapter I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("adapter unavailable: {0}")]
    Unavailable(String),
    #[error("environment '{0}' is not running")]
    NotRunning(String),
    #[error("transient adapter failure: {0}")]
    Transient(String),
    #[error("adapter operation failed: {0}")]
    Failed(String),
    #[error("adapter configuration error: {0}")]
    Config(String),
}

impl AdapterError {
    /// Whether the job manager may retry the failed step.
    pub fn is_transient(&self) -> bool {
        matches!(self, AdapterError::Transient(_) | AdapterError::Io(_))
    }
}

/// The three collaborators bundled for the orchestrator.
pub struct AdapterSet {
    pub runtime: Box<dyn RuntimeAdapter>,
    pub vcs: Box<dyn VcsAdapter>,
    pub db: Box<dyn DbSyncAdapter>,
}

/// Select an adapter set by name: `mock`, or `command` with a config file.
pub fn select_adapters(
    name: &str,
    config_path: Option<&Path>,
) -> Result<AdapterSet, AdapterError> {
    match name {
        "mock" => Ok(MockAdapters::new().to_set()),
        "command" => {
            let path = config_path.ok_or_else(|| {
                AdapterError::Config("command adapters require --adapter-config".to_owned())
            })?;
            Ok(CommandConfig::parse_file(path)?.into_set())
        }
        other => Err(AdapterError::Unavailable(other.to_owned())),
    }
}
