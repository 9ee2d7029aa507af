//! Database-sync contract: dump, sanitize, restore, and structural compare.

use crate::AdapterError;
use cascade_schema::{SanitizationProfile, SnapshotId};
use serde::{Deserialize, Serialize};

/// One table within a dump.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DumpTable {
    pub name: String,
    pub row_count: u64,
    /// Columns whose values have been replaced by a sanitization rule.
    #[serde(default)]
    pub scrubbed_columns: Vec<String>,
}

/// A database dump in transit between environments. The payload itself is
/// adapter-owned (a file, an object-store key); the pipeline only sees this
/// descriptor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DbDump {
    pub id: String,
    pub source_env: String,
    pub tables: Vec<DumpTable>,
    pub sanitized: bool,
}

/// Structural comparison of two environments' databases.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DbComparison {
    pub schema_match: bool,
    pub table_deltas: Vec<TableDelta>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableDelta {
    pub table: String,
    pub rows_a: u64,
    pub rows_b: u64,
}

pub trait DbSyncAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn dump(&self, env_id: &str) -> Result<DbDump, AdapterError>;

    /// Apply a sanitization profile to a dump, producing a scrubbed dump.
    /// The input dump is consumed: an unsanitized dump must not survive
    /// past this call on the sync path.
    fn sanitize(
        &self,
        dump: DbDump,
        profile: &SanitizationProfile,
    ) -> Result<DbDump, AdapterError>;

    /// Restore a dump onto the destination; returns the new snapshot id.
    fn restore(&self, env_id: &str, dump: &DbDump) -> Result<SnapshotId, AdapterError>;

    fn compare(&self, env_a: &str, env_b: &str) -> Result<DbComparison, AdapterError>;
}

/// Apply profile rules to a dump descriptor: drop excluded tables, mark
/// scrubbed columns. Shared by implementations whose payload mutation is
/// driven from the descriptor.
pub fn apply_profile(mut dump: DbDump, profile: &SanitizationProfile) -> DbDump {
    use cascade_schema::SanitizationAction;

    for rule in &profile.rules {
        match rule.action {
            SanitizationAction::Exclude => {
                dump.tables.retain(|t| t.name != rule.table);
            }
            SanitizationAction::Scrub => {
                if let Some(table) = dump.tables.iter_mut().find(|t| t.name == rule.table) {
                    for col in &rule.columns {
                        if !table.scrubbed_columns.contains(col) {
                            table.scrubbed_columns.push(col.clone());
                        }
                    }
                }
            }
        }
    }
    dump.sanitized = true;
    dump
}
