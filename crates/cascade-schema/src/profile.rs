//! Sanitization profiles: named rule sets for scrubbing sensitive data
//! during a database sync.
//!
//! Profiles are authored as TOML files and stored as independent records.
//! The job manager only reads them; creation and editing go through the
//! orchestrator API.
//!
//! ```toml
//! name = "strip-pii"
//!
//! [[rule]]
//! table = "users"
//! columns = ["email", "phone"]
//! action = "scrub"
//!
//! [[rule]]
//! table = "sessions"
//! action = "exclude"
//! ```

use crate::types::ProfileId;
use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// What to do with the matched table/columns during a sync.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SanitizationAction {
    /// Replace the named columns' values with neutral placeholders.
    Scrub,
    /// Drop the whole table from the dump.
    Exclude,
}

/// A single scrub/exclude rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SanitizationRule {
    pub table: String,
    /// Required for `scrub`, ignored for `exclude`.
    #[serde(default)]
    pub columns: Vec<String>,
    pub action: SanitizationAction,
}

/// A named, validated rule set referenced by id from sync requests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SanitizationProfile {
    pub id: ProfileId,
    pub name: String,
    #[serde(rename = "rule")]
    pub rules: Vec<SanitizationRule>,
    pub created_at: String,
}

/// The TOML authoring format: no id/timestamp, those are assigned on import.
#[derive(Debug, Deserialize)]
struct ProfileSource {
    name: String,
    #[serde(rename = "rule", default)]
    rules: Vec<SanitizationRule>,
}

impl SanitizationProfile {
    /// Build a profile from its TOML source, assigning the given id.
    pub fn parse_str(id: ProfileId, src: &str) -> Result<Self, SchemaError> {
        let source: ProfileSource = toml::from_str(src)?;
        let profile = Self {
            id,
            name: source.name,
            rules: source.rules,
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        profile.validate()?;
        Ok(profile)
    }

    pub fn parse_file(id: ProfileId, path: &Path) -> Result<Self, SchemaError> {
        let src = std::fs::read_to_string(path)?;
        Self::parse_str(id, &src)
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        crate::model::validate_name(&self.name)?;
        if self.rules.is_empty() {
            return Err(SchemaError::EmptyProfile(self.name.clone()));
        }
        for rule in &self.rules {
            if rule.table.is_empty() {
                return Err(SchemaError::InvalidRule(
                    "rule is missing a table name".to_owned(),
                ));
            }
            if rule.action == SanitizationAction::Scrub && rule.columns.is_empty() {
                return Err(SchemaError::InvalidRule(format!(
                    "scrub rule for table '{}' names no columns",
                    rule.table
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
name = "strip-pii"

[[rule]]
table = "users"
columns = ["email", "phone"]
action = "scrub"

[[rule]]
table = "sessions"
action = "exclude"
"#;

    #[test]
    fn parses_valid_profile() {
        let p = SanitizationProfile::parse_str(ProfileId::new("prof_1"), SAMPLE).unwrap();
        assert_eq!(p.name, "strip-pii");
        assert_eq!(p.rules.len(), 2);
        assert_eq!(p.rules[0].action, SanitizationAction::Scrub);
        assert_eq!(p.rules[0].columns, vec!["email", "phone"]);
        assert_eq!(p.rules[1].action, SanitizationAction::Exclude);
    }

    #[test]
    fn rejects_empty_rule_set() {
        let err =
            SanitizationProfile::parse_str(ProfileId::new("p"), "name = \"empty\"").unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn rejects_scrub_without_columns() {
        let src = r#"
name = "bad"

[[rule]]
table = "users"
action = "scrub"
"#;
        let err = SanitizationProfile::parse_str(ProfileId::new("p"), src).unwrap_err();
        assert!(err.to_string().contains("users"));
    }

    #[test]
    fn parse_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let p = SanitizationProfile::parse_file(ProfileId::new("prof_f"), &path).unwrap();
        assert_eq!(p.id, "prof_f");
    }
}
