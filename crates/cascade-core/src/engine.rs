//! The orchestration engine: composition root and API-facing surface.
//!
//! Synchronous operations (lifecycle, lock/unlock, compare, listings)
//! run on the caller's thread and return their outcome directly.
//! Promotion and sync-from-production validate, check policy, acquire
//! both environment locks under the new job's id, persist the job, and
//! hand it to the worker pool — the caller gets the job id immediately
//! and polls for completion.

use crate::activity::ActivityLogger;
use crate::jobs::{JobManager, PipelineShared};
use crate::lifecycle::validate_transition;
use crate::locks::LockManager;
use crate::CoreError;
use cascade_adapters::{AdapterSet, CodeDiff, DbComparison};
use cascade_schema::{
    generate_id, ActivityStatus, Components, EnvId, EnvRecord, EnvState, HolderToken, JobId,
    JobRecord, JobStatus, ProfileId, RollbackRef, SanitizationProfile, SiteId, SiteRecord,
    validate_name,
};
use cascade_store::{
    ActivityPage, ActivityStore, EnvStore, JobStore, LockCheckpoint, ProfileStore, SiteStore,
    StoreGuard, StoreLayout,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    /// Background worker threads executing promotion jobs.
    pub workers: usize,
    /// Jobs that may wait in the queue before submissions are rejected.
    pub queue_depth: usize,
    /// How long lock acquisition waits before reporting a conflict.
    pub lock_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_depth: 8,
            lock_timeout: Duration::from_millis(200),
        }
    }
}

/// A promotion request as accepted from the API layer.
#[derive(Debug, Clone)]
pub struct PromoteRequest {
    pub source_env: EnvId,
    pub dest_env: EnvId,
    pub components: Components,
    pub sanitization_profile: Option<ProfileId>,
    pub restore_stopped: bool,
    pub user_id: Option<String>,
}

/// Lock details surfaced on listings: holder and age make orphaned locks
/// observable without clearing them.
#[derive(Debug, Clone, Serialize)]
pub struct LockView {
    pub holder: String,
    pub reason: Option<String>,
    pub manual: bool,
    pub acquired_at: String,
    pub age_secs: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvSummary {
    pub id: EnvId,
    pub stage: String,
    pub state: String,
    pub revision: Option<String>,
    pub db_snapshot: Option<String>,
    pub production_source: bool,
    pub lock: Option<LockView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectSummary {
    pub site: SiteRecord,
    pub environments: Vec<EnvSummary>,
}

/// Read-only comparison of two environments.
#[derive(Debug, Clone, Serialize)]
pub struct Comparison {
    pub env_a: EnvId,
    pub env_b: EnvId,
    /// True when a job is in flight against either environment: the diff
    /// was taken from recorded references and may not reflect the final
    /// state.
    pub stale: bool,
    pub code: CodeDiff,
    pub database: DbComparison,
}

pub struct Engine {
    shared: Arc<PipelineShared>,
    jobs: JobManager,
    lock_timeout: Duration,
    // Held for the engine's lifetime; a second process opening the same
    // store root fails fast instead of corrupting records.
    _guard: StoreGuard,
}

impl Engine {
    /// Open (creating if needed) the store at `root` and start the worker
    /// pool. Restores the lock checkpoint and warns about orphaned locks
    /// whose holder has no live job.
    pub fn open(
        root: impl Into<PathBuf>,
        adapters: AdapterSet,
        options: EngineOptions,
    ) -> Result<Self, CoreError> {
        let layout = StoreLayout::new(root);
        layout.initialize()?;
        let guard = StoreGuard::acquire(&layout)?;

        let envs = EnvStore::new(layout.clone());
        let sites = SiteStore::new(layout.clone());
        let jobs_store = JobStore::new(layout.clone());
        let profiles = ProfileStore::new(layout.clone());
        let activity = ActivityLogger::new(ActivityStore::new(layout.clone()));

        let (locks, restored) = LockManager::restore(LockCheckpoint::new(layout))?;
        for snap in &restored {
            let live = jobs_store
                .get(&snap.holder)
                .map(|j| !j.status.is_terminal())
                .unwrap_or(false);
            if !snap.manual && !live {
                warn!(
                    "orphaned lock on {} held by '{}' since {}; operator intervention required",
                    snap.env_id, snap.holder, snap.acquired_at
                );
            }
        }

        let shared = Arc::new(PipelineShared {
            envs,
            sites,
            jobs: jobs_store,
            profiles,
            adapters,
            locks,
            activity,
        });
        let jobs = JobManager::start(Arc::clone(&shared), options.workers, options.queue_depth);

        Ok(Self {
            shared,
            jobs,
            lock_timeout: options.lock_timeout,
            _guard: guard,
        })
    }

    // --- Registration ---

    pub fn register_site(&self, name: &str) -> Result<SiteRecord, CoreError> {
        validate_name(name)?;
        let rec = SiteRecord {
            id: SiteId::new(generate_id("site", name)),
            name: name.to_owned(),
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        self.shared.sites.put(&rec)?;
        info!("registered site {} ({name})", rec.id);
        Ok(rec)
    }

    /// Register an environment for a site. Setting `production_source`
    /// enforces the one-per-site invariant.
    pub fn register_env(
        &self,
        site_id: &SiteId,
        stage: &str,
        production_source: bool,
    ) -> Result<EnvRecord, CoreError> {
        validate_name(stage)?;
        if !self.shared.sites.exists(site_id.as_str()) {
            return Err(CoreError::NotFound(format!("site {site_id}")));
        }
        if production_source {
            let existing = self.shared.envs.list_for_site(site_id.as_str())?;
            if let Some(prod) = existing.iter().find(|e| e.production_source) {
                return Err(CoreError::PolicyViolation(format!(
                    "site {site_id} already has production source {}",
                    prod.id
                )));
            }
        }
        let now = chrono::Utc::now().to_rfc3339();
        let rec = EnvRecord {
            id: EnvId::new(generate_id("env", stage)),
            site_id: site_id.clone(),
            stage: stage.to_owned(),
            state: EnvState::Provisioning,
            container_ref: None,
            revision: None,
            db_snapshot: None,
            production_source,
            created_at: now.clone(),
            updated_at: now,
            checksum: None,
        };
        self.shared.envs.put(&rec)?;
        info!("registered environment {} ({site_id}/{stage})", rec.id);
        Ok(rec)
    }

    pub fn create_profile(&self, toml_src: &str) -> Result<SanitizationProfile, CoreError> {
        let profile =
            SanitizationProfile::parse_str(ProfileId::new(generate_id("prof", toml_src)), toml_src)?;
        self.shared.profiles.put(&profile)?;
        Ok(profile)
    }

    // --- Listings ---

    pub fn list_projects(&self) -> Result<Vec<ProjectSummary>, CoreError> {
        let mut projects = Vec::new();
        for site in self.shared.sites.list()? {
            let environments = self
                .shared
                .envs
                .list_for_site(site.id.as_str())?
                .into_iter()
                .map(|env| self.summarize(env))
                .collect();
            projects.push(ProjectSummary { site, environments });
        }
        Ok(projects)
    }

    fn summarize(&self, env: EnvRecord) -> EnvSummary {
        let lock = self.shared.locks.holder(&env.id).map(|info| LockView {
            holder: info.holder.to_string(),
            reason: info.reason,
            manual: info.manual,
            acquired_at: info.acquired_at.to_rfc3339(),
            age_secs: (chrono::Utc::now() - info.acquired_at).num_seconds(),
        });
        EnvSummary {
            id: env.id,
            stage: env.stage,
            state: env.state.to_string(),
            revision: env.revision.map(cascade_schema::RevisionId::into_inner),
            db_snapshot: env.db_snapshot.map(cascade_schema::SnapshotId::into_inner),
            production_source: env.production_source,
            lock,
        }
    }

    pub fn env(&self, env_id: &EnvId) -> Result<EnvRecord, CoreError> {
        self.shared.envs.get(env_id.as_str()).map_err(|e| match e {
            cascade_store::StoreError::RecordNotFound(_) => {
                CoreError::NotFound(format!("environment {env_id}"))
            }
            other => CoreError::Store(other),
        })
    }

    pub fn job(&self, job_id: &JobId) -> Result<JobRecord, CoreError> {
        self.shared.jobs.get(job_id.as_str()).map_err(|e| match e {
            cascade_store::StoreError::RecordNotFound(_) => {
                CoreError::NotFound(format!("job {job_id}"))
            }
            other => CoreError::Store(other),
        })
    }

    pub fn activities(
        &self,
        site_id: &SiteId,
        page: usize,
        per_page: usize,
    ) -> Result<ActivityPage, CoreError> {
        if !self.shared.sites.exists(site_id.as_str()) {
            return Err(CoreError::NotFound(format!("site {site_id}")));
        }
        Ok(self
            .shared
            .activity
            .store()
            .page_for_site(site_id.as_str(), page, per_page)?)
    }

    /// All currently held locks, for the status surface.
    pub fn locks(&self) -> Vec<cascade_store::LockSnapshot> {
        self.shared.locks.snapshot()
    }

    // --- Lifecycle ---

    pub fn start_env(&self, env_id: &EnvId, user: Option<&str>) -> Result<(), CoreError> {
        self.lifecycle_op(env_id, user, "env.start", EnvState::Running, |env| {
            let container_ref = self.shared.adapters.runtime.start(env.id.as_str())?;
            env.container_ref = Some(container_ref);
            Ok(())
        })
    }

    pub fn stop_env(&self, env_id: &EnvId, user: Option<&str>) -> Result<(), CoreError> {
        self.lifecycle_op(env_id, user, "env.stop", EnvState::Stopped, |env| {
            self.shared.adapters.runtime.stop(env.id.as_str())?;
            Ok(())
        })
    }

    /// Restart keeps the environment in `Running`, so it bypasses the
    /// transition table and only requires the current state to match.
    pub fn restart_env(&self, env_id: &EnvId, user: Option<&str>) -> Result<(), CoreError> {
        let env = self.env(env_id)?;
        let started = std::time::Instant::now();
        let holder = HolderToken::new(generate_id("op", env_id.as_str()));
        self.shared
            .locks
            .acquire(env_id, &holder, None, false, self.lock_timeout)?;

        let result = (|| {
            let mut rec = self.shared.envs.get(env_id.as_str())?;
            if rec.state != EnvState::Running {
                return Err(CoreError::InvalidState(format!(
                    "environment {env_id} is {}, not running",
                    rec.state
                )));
            }
            let container_ref = self.shared.adapters.runtime.restart(env_id.as_str())?;
            rec.container_ref = Some(container_ref);
            rec.updated_at = chrono::Utc::now().to_rfc3339();
            self.shared.envs.put(&rec)?;
            Ok(())
        })();

        if let Err(e) = self.shared.locks.release(env_id, &holder) {
            warn!("lifecycle lock release failed: {e}");
        }
        self.finish_sync_op(&env.site_id, user, "env.restart", env_id, started, result)
    }

    /// Destroy an environment. Rejected while any lock is held on it.
    pub fn destroy_env(&self, env_id: &EnvId, user: Option<&str>) -> Result<(), CoreError> {
        let env = self.env(env_id)?;
        if let Some(info) = self.shared.locks.holder(env_id) {
            return Err(CoreError::InvalidState(format!(
                "environment {env_id} is locked by '{}'; unlock before destroying",
                info.holder
            )));
        }
        validate_transition(env.state, EnvState::Destroying)?;

        let started = std::time::Instant::now();
        let holder = HolderToken::new(generate_id("op", env_id.as_str()));
        self.shared
            .locks
            .acquire(env_id, &holder, None, false, self.lock_timeout)
            .map_err(|_| {
                CoreError::InvalidState(format!("environment {env_id} is locked"))
            })?;

        let result = (|| {
            self.update_env_state(env_id, EnvState::Destroying)?;
            if env.state == EnvState::Running {
                self.shared.adapters.runtime.stop(env_id.as_str())?;
            }
            self.update_env_state(env_id, EnvState::Destroyed)?;
            Ok(())
        })();

        if let Err(e) = self.shared.locks.release(env_id, &holder) {
            warn!("destroy lock release failed: {e}");
        }
        self.finish_sync_op(&env.site_id, user, "env.destroy", env_id, started, result)
    }

    fn lifecycle_op(
        &self,
        env_id: &EnvId,
        user: Option<&str>,
        action: &str,
        target: EnvState,
        op: impl FnOnce(&mut EnvRecord) -> Result<(), CoreError>,
    ) -> Result<(), CoreError> {
        let env = self.env(env_id)?;
        let started = std::time::Instant::now();

        // Serialize against jobs and other lifecycle calls; a held lock
        // surfaces as a conflict rather than queueing the caller.
        let holder = HolderToken::new(generate_id("op", env_id.as_str()));
        self.shared
            .locks
            .acquire(env_id, &holder, None, false, self.lock_timeout)?;

        let result = (|| {
            let mut rec = self.shared.envs.get(env_id.as_str())?;
            validate_transition(rec.state, target)?;
            op(&mut rec)?;
            rec.state = target;
            rec.updated_at = chrono::Utc::now().to_rfc3339();
            self.shared.envs.put(&rec)?;
            Ok(())
        })();

        if let Err(e) = self.shared.locks.release(env_id, &holder) {
            warn!("lifecycle lock release failed: {e}");
        }
        self.finish_sync_op(&env.site_id, user, action, env_id, started, result)
    }

    fn update_env_state(&self, env_id: &EnvId, state: EnvState) -> Result<(), CoreError> {
        let mut rec = self.shared.envs.get(env_id.as_str())?;
        validate_transition(rec.state, state)?;
        rec.state = state;
        rec.updated_at = chrono::Utc::now().to_rfc3339();
        self.shared.envs.put(&rec)?;
        Ok(())
    }

    fn finish_sync_op(
        &self,
        site_id: &SiteId,
        user: Option<&str>,
        action: &str,
        env_id: &EnvId,
        started: std::time::Instant,
        result: Result<(), CoreError>,
    ) -> Result<(), CoreError> {
        let duration_ms = started.elapsed().as_millis() as u64;
        let (status, error) = match &result {
            Ok(()) => (ActivityStatus::Ok, None),
            Err(e) => (ActivityStatus::Failed, Some(e.to_string())),
        };
        self.shared.activity.record_best_effort(
            site_id,
            user,
            action,
            format!("{action} on {env_id}"),
            serde_json::json!({ "env": env_id.as_str() }),
            status,
            error,
            Some(duration_ms),
        );
        result
    }

    // --- Manual locks ---

    pub fn lock_env(
        &self,
        env_id: &EnvId,
        reason: &str,
        user: Option<&str>,
    ) -> Result<(), CoreError> {
        if reason.trim().is_empty() {
            return Err(CoreError::PolicyViolation(
                "manual locks require a reason".to_owned(),
            ));
        }
        let env = self.env(env_id)?;
        let holder = HolderToken::new(generate_id("manual", env_id.as_str()));
        self.shared.locks.acquire(
            env_id,
            &holder,
            Some(reason.to_owned()),
            true,
            self.lock_timeout,
        )?;
        self.shared.activity.record_best_effort(
            &env.site_id,
            user,
            "env.lock",
            format!("manual lock on {env_id}: {reason}"),
            serde_json::json!({ "env": env_id.as_str(), "reason": reason }),
            ActivityStatus::Ok,
            None,
            None,
        );
        Ok(())
    }

    /// Release a manual lock. Job-held locks cannot be unlocked from here;
    /// cancel the job instead.
    pub fn unlock_env(&self, env_id: &EnvId, user: Option<&str>) -> Result<(), CoreError> {
        let env = self.env(env_id)?;
        let info = self
            .shared
            .locks
            .holder(env_id)
            .ok_or_else(|| CoreError::InvalidState(format!("environment {env_id} is not locked")))?;
        if !info.manual {
            return Err(CoreError::InvalidState(format!(
                "lock on {env_id} is held by job '{}'; cancel the job to release it",
                info.holder
            )));
        }
        self.shared.locks.release(env_id, &info.holder)?;
        self.shared.activity.record_best_effort(
            &env.site_id,
            user,
            "env.unlock",
            format!("manual unlock of {env_id}"),
            serde_json::json!({ "env": env_id.as_str() }),
            ActivityStatus::Ok,
            None,
            None,
        );
        Ok(())
    }

    // --- Promotion ---

    /// Validate, check policy, lock both environments under the new job
    /// id, persist the pending job, and queue it. Returns immediately.
    pub fn promote(&self, req: &PromoteRequest) -> Result<JobId, CoreError> {
        let source = self.env(&req.source_env)?;
        let dest = self.env(&req.dest_env)?;

        if source.id == dest.id {
            return Err(CoreError::PolicyViolation(
                "source and destination must differ".to_owned(),
            ));
        }
        // Promotion moves state between a site's own stages; crossing
        // sites would leak one tenant's code and data into another's.
        if source.site_id != dest.site_id {
            return Err(CoreError::PolicyViolation(format!(
                "environments {} and {} belong to different sites",
                source.id, dest.id
            )));
        }
        if req.components.is_empty() {
            return Err(CoreError::PolicyViolation(
                "at least one component (code, database) is required".to_owned(),
            ));
        }
        for env in [&source, &dest] {
            if !matches!(env.state, EnvState::Running | EnvState::Stopped) {
                return Err(CoreError::InvalidState(format!(
                    "environment {} is {}; promotion requires running or stopped",
                    env.id, env.state
                )));
            }
        }

        // Production data never leaves unsanitized. Checked before any
        // lock or adapter call; the rejection itself is the only trace.
        if req.components.database && source.production_source && req.sanitization_profile.is_none()
        {
            self.shared.activity.record_best_effort(
                &source.site_id,
                req.user_id.as_deref(),
                "promote",
                format!(
                    "rejected promotion {} -> {}: database sync from production requires a sanitization profile",
                    source.id, dest.id
                ),
                serde_json::json!({ "source": source.id.as_str(), "dest": dest.id.as_str() }),
                ActivityStatus::Rejected,
                None,
                None,
            );
            return Err(CoreError::PolicyViolation(
                "database sync from production requires a sanitization profile".to_owned(),
            ));
        }
        if let Some(ref pid) = req.sanitization_profile {
            if !self.shared.profiles.exists(pid.as_str()) {
                return Err(CoreError::NotFound(format!("sanitization profile {pid}")));
            }
        }

        let job_id = JobId::new(generate_id("job", source.id.as_str()));
        let holder = HolderToken::new(job_id.as_str());
        self.shared
            .locks
            .acquire_pair(&source.id, &dest.id, &holder, self.lock_timeout)?;

        let job = JobRecord {
            id: job_id.clone(),
            source_env: source.id.clone(),
            dest_env: dest.id.clone(),
            components: req.components,
            sanitization_profile: req.sanitization_profile.clone(),
            restore_stopped: req.restore_stopped,
            status: JobStatus::Pending,
            created_at: chrono::Utc::now().to_rfc3339(),
            started_at: None,
            finished_at: None,
            error: None,
            rollback_ref: RollbackRef::default(),
            steps: Vec::new(),
            checksum: None,
        };
        self.shared.jobs.put(&job)?;

        if let Err(e) = self.jobs.submit(&job_id) {
            // Backpressure: undo the acceptance, keep the record as history.
            self.shared
                .locks
                .release_pair(&source.id, &dest.id, &holder);
            let mut rejected = job;
            rejected.status = JobStatus::Failed;
            rejected.error = Some("rejected: job queue full".to_owned());
            rejected.finished_at = Some(chrono::Utc::now().to_rfc3339());
            self.shared.jobs.put(&rejected)?;
            return Err(e);
        }

        self.shared.activity.record_best_effort(
            &source.site_id,
            req.user_id.as_deref(),
            "promote.accepted",
            format!("promotion {} -> {} accepted", source.id, dest.id),
            serde_json::json!({
                "job_id": job_id.as_str(),
                "components": req.components.to_list(),
            }),
            ActivityStatus::Ok,
            None,
            None,
        );
        info!("promotion {} -> {} accepted as {job_id}", source.id, dest.id);
        Ok(job_id)
    }

    /// Promotion with the source fixed to the site's designated production
    /// environment. A database sync here always requires a profile.
    pub fn sync_from_production(
        &self,
        site_id: &SiteId,
        dest_env: &EnvId,
        components: Components,
        sanitization_profile: Option<ProfileId>,
        user_id: Option<String>,
    ) -> Result<JobId, CoreError> {
        let envs = self.shared.envs.list_for_site(site_id.as_str())?;
        if envs.is_empty() && !self.shared.sites.exists(site_id.as_str()) {
            return Err(CoreError::NotFound(format!("site {site_id}")));
        }
        let production = envs
            .iter()
            .find(|e| e.production_source)
            .ok_or_else(|| {
                CoreError::NotFound(format!("site {site_id} has no production source"))
            })?;

        self.promote(&PromoteRequest {
            source_env: production.id.clone(),
            dest_env: dest_env.clone(),
            components,
            sanitization_profile,
            restore_stopped: false,
            user_id,
        })
    }

    pub fn cancel_job(&self, job_id: &JobId) -> Result<(), CoreError> {
        self.jobs.cancel(job_id)
    }

    // --- Comparison ---

    /// Lock-free read of the code and database deltas between two
    /// environments. Uses the recorded revision references, so a job in
    /// flight against either side marks the result stale instead of
    /// blocking on it.
    pub fn compare(&self, env_a: &EnvId, env_b: &EnvId) -> Result<Comparison, CoreError> {
        let a = self.env(env_a)?;
        let b = self.env(env_b)?;

        let stale = !self.shared.jobs.active_for_env(env_a.as_str())?.is_empty()
            || !self.shared.jobs.active_for_env(env_b.as_str())?.is_empty();

        let rev_a = match a.revision {
            Some(rev) => rev,
            None => self.shared.adapters.vcs.fetch(a.id.as_str())?,
        };
        let rev_b = match b.revision {
            Some(rev) => rev,
            None => self.shared.adapters.vcs.fetch(b.id.as_str())?,
        };
        let code = self.shared.adapters.vcs.diff(&rev_a, &rev_b)?;
        let database = self
            .shared
            .adapters
            .db
            .compare(a.id.as_str(), b.id.as_str())?;

        Ok(Comparison {
            env_a: a.id,
            env_b: b.id,
            stale,
            code,
            database,
        })
    }

    // --- Logs ---

    pub fn env_logs(&self, env_id: &EnvId) -> Result<String, CoreError> {
        self.env(env_id)?;
        Ok(self.shared.adapters.runtime.logs(env_id.as_str())?)
    }

    /// Wait until the given job reaches a terminal state, polling its
    /// record. Returns the terminal record or the job as-is on timeout.
    pub fn wait_for_job(&self, job_id: &JobId, timeout: Duration) -> Result<JobRecord, CoreError> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let job = self.job(job_id)?;
            if job.status.is_terminal() || std::time::Instant::now() >= deadline {
                return Ok(job);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}
