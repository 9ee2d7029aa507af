//! Promotion job execution: a bounded worker pool driving the
//! VCS/database/runtime adapters as one tracked, cancellable unit of work.
//!
//! The engine acquires both environment locks under the job id before a
//! job is queued; this module owns the job from `pending` to its terminal
//! state and releases the locks on every exit path. Partial completion
//! (code applied, database failed) is recorded, never rolled back: the
//! job's rollback reference and step log make the partial state explicit
//! for an operator.

use crate::activity::ActivityLogger;
use crate::lifecycle::validate_transition;
use crate::locks::LockManager;
use crate::CoreError;
use cascade_adapters::AdapterSet;
use cascade_schema::{
    ActivityStatus, EnvId, EnvRecord, EnvState, HolderToken, JobId, JobRecord, JobStatus,
    StepOutcome, StepRecord,
};
use cascade_store::{EnvStore, JobStore, ProfileStore, SiteStore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Everything the orchestrator and the workers share.
pub struct PipelineShared {
    pub envs: EnvStore,
    pub sites: SiteStore,
    pub jobs: JobStore,
    pub profiles: ProfileStore,
    pub adapters: AdapterSet,
    pub locks: LockManager,
    pub activity: ActivityLogger,
}

/// Bounded attempts per step; only transient adapter errors are retried.
const MAX_STEP_ATTEMPTS: u32 = 3;

enum StepFailure {
    Cancelled,
    Failed { step: String, detail: String },
}

pub struct JobManager {
    shared: Arc<PipelineShared>,
    tx: Option<SyncSender<JobId>>,
    // Keeps the channel connected even with zero workers, so a
    // zero-worker pool still queues up to `queue_depth` jobs.
    _rx: Arc<Mutex<Receiver<JobId>>>,
    cancel_flags: Arc<Mutex<HashMap<JobId, Arc<AtomicBool>>>>,
    workers: Vec<JoinHandle<()>>,
}

impl JobManager {
    /// Spawn `workers` background threads consuming a queue of at most
    /// `queue_depth` waiting jobs.
    pub fn start(shared: Arc<PipelineShared>, workers: usize, queue_depth: usize) -> Self {
        let (tx, rx) = sync_channel::<JobId>(queue_depth.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let cancel_flags: Arc<Mutex<HashMap<JobId, Arc<AtomicBool>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let mut handles = Vec::new();
        for n in 0..workers {
            let rx = Arc::clone(&rx);
            let shared = Arc::clone(&shared);
            let flags = Arc::clone(&cancel_flags);
            handles.push(
                std::thread::Builder::new()
                    .name(format!("cascade-worker-{n}"))
                    .spawn(move || worker_loop(&shared, &rx, &flags))
                    .expect("failed to spawn worker thread"),
            );
        }

        Self {
            shared,
            tx: Some(tx),
            _rx: rx,
            cancel_flags,
            workers: handles,
        }
    }

    /// Queue a persisted `pending` job. `QueueFull` applies backpressure:
    /// the caller rejects the request rather than blocking.
    pub fn submit(&self, job_id: &JobId) -> Result<(), CoreError> {
        self.flags_table()
            .entry(job_id.clone())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)));

        let tx = self.tx.as_ref().ok_or(CoreError::QueueFull)?;
        match tx.try_send(job_id.clone()) {
            Ok(()) => {
                debug!("job {job_id} queued");
                Ok(())
            }
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                self.flags_table().remove(job_id);
                Err(CoreError::QueueFull)
            }
        }
    }

    /// Request cooperative cancellation. Takes effect at the next step
    /// boundary; a step already running against an adapter completes first.
    pub fn cancel(&self, job_id: &JobId) -> Result<(), CoreError> {
        let job = self.shared.jobs.get(job_id).map_err(|e| match e {
            cascade_store::StoreError::RecordNotFound(_) => {
                CoreError::NotFound(format!("job {job_id}"))
            }
            other => CoreError::Store(other),
        })?;
        if job.status.is_terminal() {
            return Err(CoreError::InvalidState(format!(
                "job {job_id} is already {}",
                job.status
            )));
        }
        let flag = self
            .flags_table()
            .entry(job_id.clone())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone();
        flag.store(true, Ordering::SeqCst);
        info!("cancellation requested for {job_id}");
        Ok(())
    }

    fn flags_table(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, Arc<AtomicBool>>> {
        self.cancel_flags
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Drop for JobManager {
    fn drop(&mut self) {
        // Closing the channel lets idle workers exit; busy workers finish
        // their current job first.
        self.tx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(
    shared: &Arc<PipelineShared>,
    rx: &Arc<Mutex<Receiver<JobId>>>,
    flags: &Arc<Mutex<HashMap<JobId, Arc<AtomicBool>>>>,
) {
    loop {
        let job_id = {
            let guard = rx.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            match guard.recv() {
                Ok(id) => id,
                Err(_) => return,
            }
        };
        let cancel = flags
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entry(job_id.clone())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone();

        run_job(shared, &job_id, &cancel);

        flags
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&job_id);
    }
}

fn run_job(shared: &PipelineShared, job_id: &JobId, cancel: &AtomicBool) {
    let mut job = match shared.jobs.get(job_id) {
        Ok(job) => job,
        Err(e) => {
            error!("worker cannot load job {job_id}: {e}");
            return;
        }
    };
    if job.status != JobStatus::Pending {
        warn!("job {job_id} is {} rather than pending; skipping", job.status);
        return;
    }

    info!(
        "job {job_id}: promoting {} -> {} ({})",
        job.source_env, job.dest_env, job.components
    );
    let started = Instant::now();
    job.status = JobStatus::Running;
    job.started_at = Some(chrono::Utc::now().to_rfc3339());
    if let Err(e) = shared.jobs.put(&job) {
        error!("job {job_id}: cannot persist running state: {e}");
    }

    let outcome = execute(shared, &mut job, cancel);

    let duration_ms = started.elapsed().as_millis() as u64;
    job.finished_at = Some(chrono::Utc::now().to_rfc3339());
    let (status, activity_status, error_detail) = match outcome {
        Ok(()) => (JobStatus::Succeeded, ActivityStatus::Ok, None),
        Err(StepFailure::Cancelled) => (JobStatus::Cancelled, ActivityStatus::Cancelled, None),
        Err(StepFailure::Failed { step, detail }) => {
            let msg = format!("step '{step}': {detail}");
            (JobStatus::Failed, ActivityStatus::Failed, Some(msg))
        }
    };
    job.status = status;
    job.error = error_detail.clone();
    if let Err(e) = shared.jobs.put(&job) {
        error!("job {job_id}: cannot persist terminal state: {e}");
    }

    let holder = HolderToken::new(job.id.as_str());
    shared
        .locks
        .release_pair(&job.source_env, &job.dest_env, &holder);

    // Either side of the pair names the owning site; a lost destination
    // record falls back to the source so the entry stays listable.
    let site_id = shared
        .envs
        .get(job.dest_env.as_str())
        .or_else(|_| shared.envs.get(job.source_env.as_str()))
        .map(|env| env.site_id)
        .ok();

    if let Some(site_id) = site_id {
        shared.activity.record_best_effort(
            &site_id,
            None,
            "promote",
            format!(
                "promotion {} -> {} {}",
                job.source_env, job.dest_env, job.status
            ),
            serde_json::json!({
                "job_id": job.id.as_str(),
                "components": job.components.to_list(),
            }),
            activity_status,
            error_detail,
            Some(duration_ms),
        );
    } else {
        warn!(
            "job {job_id}: neither environment record survives; skipping the activity entry"
        );
    }
    info!("job {job_id}: {} in {duration_ms}ms", job.status);
}

/// Drive the workflow steps in order, honoring cancellation at boundaries.
fn execute(
    shared: &PipelineShared,
    job: &mut JobRecord,
    cancel: &AtomicBool,
) -> Result<(), StepFailure> {
    let source = job.source_env.clone();
    let dest = job.dest_env.clone();

    // Step 1: snapshot the destination for the rollback reference.
    let dest_before = run_step(shared, job, cancel, "snapshot-destination", || {
        Ok(shared.envs.get(dest.as_str())?)
    })?;
    job.rollback_ref.revision = dest_before.revision.clone();
    job.rollback_ref.db_snapshot = dest_before.db_snapshot.clone();
    persist(shared, job);

    let dest_was_stopped = dest_before.state == EnvState::Stopped;

    // Step 2: a stopped destination is auto-started before promotion.
    if dest_was_stopped {
        run_step(shared, job, cancel, "start-destination", || {
            let container_ref = shared.adapters.runtime.start(dest.as_str())?;
            update_env(shared, &dest, |env| {
                env.state = EnvState::Running;
                env.container_ref = Some(container_ref);
            })
        })?;
    } else {
        skip_step(shared, job, "start-destination", "destination already running");
    }

    // Step 3: code promotion.
    if job.components.code {
        let revision = run_step(shared, job, cancel, "promote-code", || {
            let rev = shared.adapters.vcs.fetch(source.as_str())?;
            shared.adapters.vcs.checkout(dest.as_str(), &rev)?;
            shared.adapters.vcs.push(dest.as_str(), &rev)?;
            Ok(rev)
        })?;
        if let Err(e) = update_env(shared, &dest, |env| {
            env.revision = Some(revision);
        }) {
            return Err(StepFailure::Failed {
                step: "promote-code".to_owned(),
                detail: e.to_string(),
            });
        }
    } else {
        skip_step(shared, job, "promote-code", "component not requested");
    }

    // Step 4: database sync, sanitized when a profile is attached.
    if job.components.database {
        let profile_id = job.sanitization_profile.clone();
        let snapshot = run_step(shared, job, cancel, "sync-database", || {
            let mut dump = shared.adapters.db.dump(source.as_str())?;
            if let Some(ref pid) = profile_id {
                let profile = shared.profiles.get(pid.as_str())?;
                dump = shared.adapters.db.sanitize(dump, &profile)?;
            }
            Ok(shared.adapters.db.restore(dest.as_str(), &dump)?)
        })?;
        if let Err(e) = update_env(shared, &dest, |env| {
            env.db_snapshot = Some(snapshot);
        }) {
            return Err(StepFailure::Failed {
                step: "sync-database".to_owned(),
                detail: e.to_string(),
            });
        }
    } else {
        skip_step(shared, job, "sync-database", "component not requested");
    }

    // Step 5: restore the pre-promotion runtime state only when asked;
    // by default an auto-started destination is left running.
    if dest_was_stopped && job.restore_stopped {
        run_step(shared, job, cancel, "restore-destination-state", || {
            shared.adapters.runtime.stop(dest.as_str())?;
            update_env(shared, &dest, |env| {
                env.state = EnvState::Stopped;
            })
        })?;
    } else {
        skip_step(
            shared,
            job,
            "restore-destination-state",
            "destination left running",
        );
    }

    Ok(())
}

/// Execute one step with bounded retry on transient adapter errors,
/// recording its outcome in the job's step log.
fn run_step<T>(
    shared: &PipelineShared,
    job: &mut JobRecord,
    cancel: &AtomicBool,
    name: &str,
    op: impl Fn() -> Result<T, CoreError>,
) -> Result<T, StepFailure> {
    if cancel.load(Ordering::SeqCst) {
        info!("job {}: cancelled before step '{name}'", job.id);
        return Err(StepFailure::Cancelled);
    }

    let started_at = chrono::Utc::now().to_rfc3339();
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => {
                job.steps.push(StepRecord {
                    name: name.to_owned(),
                    started_at,
                    finished_at: chrono::Utc::now().to_rfc3339(),
                    outcome: StepOutcome::Ok,
                    detail: (attempt > 1).then(|| format!("succeeded on attempt {attempt}")),
                });
                persist(shared, job);
                return Ok(value);
            }
            Err(CoreError::Adapter(e)) if e.is_transient() && attempt < MAX_STEP_ATTEMPTS => {
                warn!(
                    "job {}: step '{name}' attempt {attempt} failed transiently: {e}",
                    job.id
                );
                attempt += 1;
            }
            Err(e) => {
                let detail = e.to_string();
                job.steps.push(StepRecord {
                    name: name.to_owned(),
                    started_at,
                    finished_at: chrono::Utc::now().to_rfc3339(),
                    outcome: StepOutcome::Failed,
                    detail: Some(detail.clone()),
                });
                persist(shared, job);
                return Err(StepFailure::Failed {
                    step: name.to_owned(),
                    detail,
                });
            }
        }
    }
}

fn skip_step(shared: &PipelineShared, job: &mut JobRecord, name: &str, why: &str) {
    let now = chrono::Utc::now().to_rfc3339();
    job.steps.push(StepRecord {
        name: name.to_owned(),
        started_at: now.clone(),
        finished_at: now,
        outcome: StepOutcome::Skipped,
        detail: Some(why.to_owned()),
    });
    persist(shared, job);
}

fn persist(shared: &PipelineShared, job: &JobRecord) {
    if let Err(e) = shared.jobs.put(job) {
        error!("job {}: cannot persist step log: {e}", job.id);
    }
}

/// Apply a mutation to an environment record, validating any state change
/// and stamping the update time.
fn update_env(
    shared: &PipelineShared,
    env_id: &EnvId,
    mutate: impl FnOnce(&mut EnvRecord),
) -> Result<(), CoreError> {
    let mut rec = shared.envs.get(env_id.as_str())?;
    let before = rec.state;
    mutate(&mut rec);
    if rec.state != before {
        validate_transition(before, rec.state)?;
    }
    rec.updated_at = chrono::Utc::now().to_rfc3339();
    shared.envs.put(&rec)?;
    Ok(())
}
