//! Per-environment mutual exclusion.
//!
//! The lock table lives in memory under one mutex; every mutation is
//! checkpointed to `store/locks.json` so a crash leaves the held set
//! visible on disk. Restored locks are never cleared automatically: a
//! holder token with no corresponding live job is an orphan and requires
//! operator intervention (the age and holder are surfaced through the
//! status endpoints for exactly this reason).
//!
//! Multi-environment acquisition orders by environment id (lower first)
//! so two promotions with swapped source/destination can never deadlock.

use crate::CoreError;
use cascade_schema::{EnvId, HolderToken};
use cascade_store::{LockCheckpoint, LockSnapshot};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// One held lock, as seen by readers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    pub holder: HolderToken,
    pub reason: Option<String>,
    /// Manual locks are user-initiated freezes; they never time out and
    /// are only released by an explicit unlock.
    pub manual: bool,
    pub acquired_at: DateTime<Utc>,
}

pub struct LockManager {
    table: Mutex<HashMap<EnvId, LockInfo>>,
    released: Condvar,
    checkpoint: LockCheckpoint,
}

impl LockManager {
    /// Create a manager, restoring any checkpointed locks from a previous
    /// process. Returns the manager and the restored set for orphan
    /// inspection by the caller.
    pub fn restore(checkpoint: LockCheckpoint) -> Result<(Self, Vec<LockSnapshot>), CoreError> {
        let restored = checkpoint.load()?;
        let mut table = HashMap::new();
        for snap in &restored {
            let acquired_at = snap
                .acquired_at
                .parse::<DateTime<Utc>>()
                .unwrap_or_else(|_| Utc::now());
            table.insert(
                EnvId::new(&snap.env_id),
                LockInfo {
                    holder: HolderToken::new(&snap.holder),
                    reason: snap.reason.clone(),
                    manual: snap.manual,
                    acquired_at,
                },
            );
        }
        Ok((
            Self {
                table: Mutex::new(table),
                released: Condvar::new(),
                checkpoint,
            },
            restored,
        ))
    }

    fn lock_table(&self) -> std::sync::MutexGuard<'_, HashMap<EnvId, LockInfo>> {
        self.table
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Checkpoint failures must not fail the lock operation itself; the
    /// checkpoint is a visibility aid, not the source of truth.
    fn save_checkpoint(&self, table: &HashMap<EnvId, LockInfo>) {
        let snaps: Vec<LockSnapshot> = table
            .iter()
            .map(|(env, info)| LockSnapshot {
                env_id: env.to_string(),
                holder: info.holder.to_string(),
                reason: info.reason.clone(),
                manual: info.manual,
                acquired_at: info.acquired_at.to_rfc3339(),
            })
            .collect();
        if let Err(e) = self.checkpoint.save(&snaps) {
            warn!("lock checkpoint write failed: {e}");
        }
    }

    /// Acquire the lock on one environment, waiting up to `timeout` for a
    /// current holder to release. Non-reentrant: a second acquire by the
    /// same holder conflicts like any other.
    pub fn acquire(
        &self,
        env: &EnvId,
        holder: &HolderToken,
        reason: Option<String>,
        manual: bool,
        timeout: Duration,
    ) -> Result<(), CoreError> {
        let deadline = Instant::now() + timeout;
        let mut table = self.lock_table();
        loop {
            if let Some(existing) = table.get(env) {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(CoreError::LockConflict {
                        env: env.clone(),
                        holder: existing.holder.clone(),
                    });
                }
                let (t, _) = self
                    .released
                    .wait_timeout(table, remaining)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                table = t;
            } else {
                table.insert(
                    env.clone(),
                    LockInfo {
                        holder: holder.clone(),
                        reason,
                        manual,
                        acquired_at: Utc::now(),
                    },
                );
                debug!("lock acquired: {env} by {holder}");
                self.save_checkpoint(&table);
                return Ok(());
            }
        }
    }

    /// Acquire both locks for a two-environment operation, lower id first.
    /// If the second lock cannot be had in time, the first is released
    /// before returning the conflict, so no partial acquisition survives.
    pub fn acquire_pair(
        &self,
        a: &EnvId,
        b: &EnvId,
        holder: &HolderToken,
        timeout: Duration,
    ) -> Result<(), CoreError> {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        let deadline = Instant::now() + timeout;

        self.acquire(first, holder, None, false, timeout)?;
        let remaining = deadline.saturating_duration_since(Instant::now());
        if let Err(e) = self.acquire(second, holder, None, false, remaining) {
            if let Err(release_err) = self.release(first, holder) {
                warn!("failed to release {first} after pair conflict: {release_err}");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Release a lock; errors if the caller is not the holder.
    pub fn release(&self, env: &EnvId, holder: &HolderToken) -> Result<(), CoreError> {
        let mut table = self.lock_table();
        match table.get(env) {
            Some(info) if info.holder == *holder => {
                table.remove(env);
                debug!("lock released: {env} by {holder}");
                self.save_checkpoint(&table);
                self.released.notify_all();
                Ok(())
            }
            Some(_) | None => Err(CoreError::NotHolder {
                env: env.clone(),
                holder: holder.clone(),
            }),
        }
    }

    /// Release both locks of a pair, ignoring a lock that is already gone.
    pub fn release_pair(&self, a: &EnvId, b: &EnvId, holder: &HolderToken) {
        for env in [a, b] {
            if let Err(e) = self.release(env, holder) {
                debug!("release_pair: {e}");
            }
        }
    }

    pub fn holder(&self, env: &EnvId) -> Option<LockInfo> {
        self.lock_table().get(env).cloned()
    }

    pub fn is_locked(&self, env: &EnvId) -> bool {
        self.lock_table().contains_key(env)
    }

    /// Current table as checkpoint snapshots, for the status endpoints.
    pub fn snapshot(&self) -> Vec<LockSnapshot> {
        let table = self.lock_table();
        let mut snaps: Vec<LockSnapshot> = table
            .iter()
            .map(|(env, info)| LockSnapshot {
                env_id: env.to_string(),
                holder: info.holder.to_string(),
                reason: info.reason.clone(),
                manual: info.manual,
                acquired_at: info.acquired_at.to_rfc3339(),
            })
            .collect();
        snaps.sort_by(|x, y| x.env_id.cmp(&y.env_id));
        snaps
    }
}
