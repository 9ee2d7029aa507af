//! Version-control contract: code state of an environment's working tree.

use crate::AdapterError;
use cascade_schema::RevisionId;
use serde::{Deserialize, Serialize};

/// Result of diffing two code revisions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CodeDiff {
    pub from: RevisionId,
    pub to: RevisionId,
    /// Paths changed between the two revisions; empty when identical.
    pub changed_paths: Vec<String>,
}

impl CodeDiff {
    pub fn is_empty(&self) -> bool {
        self.changed_paths.is_empty()
    }
}

pub trait VcsAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Refresh and report the current revision of the environment's tree.
    fn fetch(&self, env_id: &str) -> Result<RevisionId, AdapterError>;

    /// Apply the given revision onto the environment's working tree.
    fn checkout(&self, env_id: &str, revision: &RevisionId) -> Result<(), AdapterError>;

    fn diff(&self, from: &RevisionId, to: &RevisionId) -> Result<CodeDiff, AdapterError>;

    /// Publish the environment's tree state at the given revision.
    fn push(&self, env_id: &str, revision: &RevisionId) -> Result<(), AdapterError>;
}
