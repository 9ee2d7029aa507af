//! Container runtime contract: lifecycle control and log access for one
//! environment's container.

use crate::AdapterError;
use serde::{Deserialize, Serialize};

/// Point-in-time runtime view of an environment's container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeStatus {
    pub env_id: String,
    pub running: bool,
    /// Opaque handle into the runtime (container id, unit name, ...).
    pub container_ref: Option<String>,
}

pub trait RuntimeAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn available(&self) -> bool;

    /// Start the environment's container; returns the container reference.
    fn start(&self, env_id: &str) -> Result<String, AdapterError>;

    fn stop(&self, env_id: &str) -> Result<(), AdapterError>;

    fn restart(&self, env_id: &str) -> Result<String, AdapterError>;

    /// Fetch recent container logs.
    fn logs(&self, env_id: &str) -> Result<String, AdapterError>;

    fn status(&self, env_id: &str) -> Result<RuntimeStatus, AdapterError>;
}
