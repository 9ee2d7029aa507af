//! Command-template adapters: each operation shells out to a configured
//! argv with `{placeholder}` substitution.
//!
//! This is the deployment-facing implementation: the operator wires the
//! pipeline to their actual tooling (docker/podman, git, pg_dump/psql)
//! through a TOML file instead of this crate linking against any of them.
//!
//! ```toml
//! transient_exit_codes = [75]
//!
//! [runtime]
//! start = ["docker", "start", "site-{env}"]
//! stop = ["docker", "stop", "site-{env}"]
//! logs = ["docker", "logs", "--tail", "200", "site-{env}"]
//! status = ["docker", "inspect", "-f", "{{.State.Running}}", "site-{env}"]
//!
//! [vcs]
//! fetch = ["sitectl", "vcs-head", "{env}"]
//! checkout = ["sitectl", "vcs-checkout", "{env}", "{rev}"]
//! push = ["sitectl", "vcs-push", "{env}", "{rev}"]
//!
//! [db]
//! dump = ["sitectl", "db-dump", "{env}"]
//! restore = ["sitectl", "db-restore", "{env}", "{dump}"]
//! ```
//!
//! Stdout conventions: `fetch` and `dump` print an identifier on the first
//! line; `status` exits 0 when running; `compare` prints a
//! [`DbComparison`](crate::dbsync::DbComparison) as JSON.

use crate::dbsync::{apply_profile, DbComparison, DbDump, DbSyncAdapter};
use crate::runtime::{RuntimeAdapter, RuntimeStatus};
use crate::vcs::{CodeDiff, VcsAdapter};
use crate::{AdapterError, AdapterSet};
use cascade_schema::{RevisionId, SanitizationProfile, SnapshotId};
use serde::Deserialize;
use std::path::Path;
use std::process::Command;
use tracing::debug;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CommandConfig {
    /// Exit codes treated as transient (retryable) rather than fatal.
    #[serde(default)]
    pub transient_exit_codes: Vec<i32>,
    #[serde(default)]
    pub runtime: OpTable,
    #[serde(default)]
    pub vcs: OpTable,
    #[serde(default)]
    pub db: OpTable,
}

/// Argv templates per operation name; a missing entry means the operation
/// is unsupported by this deployment.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct OpTable {
    #[serde(flatten)]
    pub ops: std::collections::HashMap<String, Vec<String>>,
}

impl CommandConfig {
    pub fn parse_str(src: &str) -> Result<Self, AdapterError> {
        toml::from_str(src).map_err(|e| AdapterError::Config(e.to_string()))
    }

    pub fn parse_file(path: &Path) -> Result<Self, AdapterError> {
        let src = std::fs::read_to_string(path)?;
        Self::parse_str(&src)
    }

    pub fn into_set(self) -> AdapterSet {
        let cfg = std::sync::Arc::new(self);
        AdapterSet {
            runtime: Box::new(CommandRuntime {
                cfg: std::sync::Arc::clone(&cfg),
            }),
            vcs: Box::new(CommandVcs {
                cfg: std::sync::Arc::clone(&cfg),
            }),
            db: Box::new(CommandDbSync { cfg }),
        }
    }

    fn run(
        &self,
        table: &OpTable,
        op: &str,
        substitutions: &[(&str, &str)],
    ) -> Result<String, AdapterError> {
        let argv = table
            .ops
            .get(op)
            .ok_or_else(|| AdapterError::Unavailable(format!("no command configured for {op}")))?;
        if argv.is_empty() {
            return Err(AdapterError::Config(format!("empty argv for {op}")));
        }

        let expand = |arg: &str| {
            let mut out = arg.to_owned();
            for (key, value) in substitutions {
                out = out.replace(&format!("{{{key}}}"), value);
            }
            out
        };
        let program = expand(&argv[0]);
        let args: Vec<String> = argv[1..].iter().map(|a| expand(a)).collect();
        debug!("exec {program} {}", args.join(" "));

        let output = Command::new(&program)
            .args(&args)
            .output()
            .map_err(|e| AdapterError::Transient(format!("failed to spawn {program}: {e}")))?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let code = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let msg = format!("{op} exited with code {code}: {}", stderr.trim());
        if self.transient_exit_codes.contains(&code) {
            Err(AdapterError::Transient(msg))
        } else {
            Err(AdapterError::Failed(msg))
        }
    }
}

fn first_line(stdout: &str) -> String {
    stdout.lines().next().unwrap_or("").trim().to_owned()
}

pub struct CommandRuntime {
    cfg: std::sync::Arc<CommandConfig>,
}

impl RuntimeAdapter for CommandRuntime {
    fn name(&self) -> &str {
        "command"
    }

    fn available(&self) -> bool {
        !self.cfg.runtime.ops.is_empty()
    }

    fn start(&self, env_id: &str) -> Result<String, AdapterError> {
        let out = self
            .cfg
            .run(&self.cfg.runtime, "start", &[("env", env_id)])?;
        Ok(first_line(&out))
    }

    fn stop(&self, env_id: &str) -> Result<(), AdapterError> {
        self.cfg.run(&self.cfg.runtime, "stop", &[("env", env_id)])?;
        Ok(())
    }

    fn restart(&self, env_id: &str) -> Result<String, AdapterError> {
        // Fall back to stop+start when no dedicated restart command exists.
        if self.cfg.runtime.ops.contains_key("restart") {
            let out = self
                .cfg
                .run(&self.cfg.runtime, "restart", &[("env", env_id)])?;
            return Ok(first_line(&out));
        }
        self.stop(env_id)?;
        self.start(env_id)
    }

    fn logs(&self, env_id: &str) -> Result<String, AdapterError> {
        self.cfg.run(&self.cfg.runtime, "logs", &[("env", env_id)])
    }

    fn status(&self, env_id: &str) -> Result<RuntimeStatus, AdapterError> {
        let running = match self.cfg.run(&self.cfg.runtime, "status", &[("env", env_id)]) {
            Ok(_) => true,
            Err(AdapterError::Failed(_)) => false,
            Err(e) => return Err(e),
        };
        Ok(RuntimeStatus {
            env_id: env_id.to_owned(),
            running,
            container_ref: None,
        })
    }
}

pub struct CommandVcs {
    cfg: std::sync::Arc<CommandConfig>,
}

impl VcsAdapter for CommandVcs {
    fn name(&self) -> &str {
        "command"
    }

    fn fetch(&self, env_id: &str) -> Result<RevisionId, AdapterError> {
        let out = self.cfg.run(&self.cfg.vcs, "fetch", &[("env", env_id)])?;
        let rev = first_line(&out);
        if rev.is_empty() {
            return Err(AdapterError::Failed(format!(
                "fetch for {env_id} produced no revision"
            )));
        }
        Ok(RevisionId::new(rev))
    }

    fn checkout(&self, env_id: &str, revision: &RevisionId) -> Result<(), AdapterError> {
        self.cfg.run(
            &self.cfg.vcs,
            "checkout",
            &[("env", env_id), ("rev", revision.as_str())],
        )?;
        Ok(())
    }

    fn diff(&self, from: &RevisionId, to: &RevisionId) -> Result<CodeDiff, AdapterError> {
        let out = self.cfg.run(
            &self.cfg.vcs,
            "diff",
            &[("from", from.as_str()), ("to", to.as_str())],
        )?;
        let changed_paths = out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect();
        Ok(CodeDiff {
            from: from.clone(),
            to: to.clone(),
            changed_paths,
        })
    }

    fn push(&self, env_id: &str, revision: &RevisionId) -> Result<(), AdapterError> {
        self.cfg.run(
            &self.cfg.vcs,
            "push",
            &[("env", env_id), ("rev", revision.as_str())],
        )?;
        Ok(())
    }
}

pub struct CommandDbSync {
    cfg: std::sync::Arc<CommandConfig>,
}

impl DbSyncAdapter for CommandDbSync {
    fn name(&self) -> &str {
        "command"
    }

    fn dump(&self, env_id: &str) -> Result<DbDump, AdapterError> {
        let out = self.cfg.run(&self.cfg.db, "dump", &[("env", env_id)])?;
        let id = first_line(&out);
        if id.is_empty() {
            return Err(AdapterError::Failed(format!(
                "dump for {env_id} produced no id"
            )));
        }
        Ok(DbDump {
            id,
            source_env: env_id.to_owned(),
            tables: Vec::new(),
            sanitized: false,
        })
    }

    fn sanitize(
        &self,
        dump: DbDump,
        profile: &SanitizationProfile,
    ) -> Result<DbDump, AdapterError> {
        // One invocation per rule; the command mutates the dump in place.
        if self.cfg.db.ops.contains_key("sanitize") {
            for rule in &profile.rules {
                self.cfg.run(
                    &self.cfg.db,
                    "sanitize",
                    &[
                        ("dump", dump.id.as_str()),
                        ("table", rule.table.as_str()),
                        ("columns", &rule.columns.join(",")),
                    ],
                )?;
            }
        }
        Ok(apply_profile(dump, profile))
    }

    fn restore(&self, env_id: &str, dump: &DbDump) -> Result<SnapshotId, AdapterError> {
        let out = self.cfg.run(
            &self.cfg.db,
            "restore",
            &[("env", env_id), ("dump", dump.id.as_str())],
        )?;
        let id = first_line(&out);
        Ok(SnapshotId::new(if id.is_empty() {
            format!("snap-{}-{}", env_id, dump.id)
        } else {
            id
        }))
    }

    fn compare(&self, env_a: &str, env_b: &str) -> Result<DbComparison, AdapterError> {
        let out = self.cfg.run(
            &self.cfg.db,
            "compare",
            &[("env_a", env_a), ("env_b", env_b)],
        )?;
        serde_json::from_str(&out)
            .map_err(|e| AdapterError::Failed(format!("compare produced invalid JSON: {e}")))
    }
}
