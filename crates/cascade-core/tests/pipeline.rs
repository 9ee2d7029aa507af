//! End-to-end pipeline tests against the mock adapter set.
//!
//! Each test opens an engine on a fresh temporary store. Jobs run on real
//! worker threads; tests that need a job to stay queued open the engine
//! with zero workers so the submission is accepted but never executed.

use cascade_adapters::MockAdapters;
use cascade_core::{CoreError, Engine, EngineOptions, PromoteRequest};
use cascade_schema::{Components, EnvId, EnvRecord, JobStatus, SiteRecord, StepOutcome};
use std::time::Duration;

fn options(workers: usize) -> EngineOptions {
    EngineOptions {
        workers,
        queue_depth: 8,
        lock_timeout: Duration::from_millis(100),
    }
}

/// Engine on a fresh store with a site and two running environments.
fn fixture(
    workers: usize,
) -> (
    tempfile::TempDir,
    MockAdapters,
    Engine,
    SiteRecord,
    EnvRecord,
    EnvRecord,
) {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockAdapters::new();
    let engine = Engine::open(dir.path(), mock.to_set(), options(workers)).unwrap();

    let site = engine.register_site("acme").unwrap();
    let a = engine.register_env(&site.id, "staging", false).unwrap();
    let b = engine.register_env(&site.id, "testing", false).unwrap();
    engine.start_env(&a.id, None).unwrap();
    engine.start_env(&b.id, None).unwrap();
    (dir, mock, engine, site, a, b)
}

fn promote_req(source: &EnvId, dest: &EnvId, components: Components) -> PromoteRequest {
    PromoteRequest {
        source_env: source.clone(),
        dest_env: dest.clone(),
        components,
        sanitization_profile: None,
        restore_stopped: false,
        user_id: Some("tester".to_owned()),
    }
}

const WAIT: Duration = Duration::from_secs(10);

#[test]
fn code_promotion_succeeds_and_updates_destination() {
    let (_dir, mock, engine, _site, a, b) = fixture(1);
    mock.set_revision(a.id.as_str(), "rev-abc");

    let job_id = engine
        .promote(&promote_req(&a.id, &b.id, Components::CODE))
        .unwrap();
    let job = engine.wait_for_job(&job_id, WAIT).unwrap();

    assert_eq!(job.status, JobStatus::Succeeded);
    assert!(job.error.is_none());
    assert!(job.finished_at.is_some());

    let dest = engine.env(&b.id).unwrap();
    assert_eq!(dest.revision.as_deref(), Some("rev-abc"));
    assert!(dest.db_snapshot.is_none(), "database was not requested");
    assert_eq!(mock.revision_of(b.id.as_str()).as_str(), "rev-abc");

    // The database step is recorded as skipped, not omitted.
    let db_step = job.steps.iter().find(|s| s.name == "sync-database").unwrap();
    assert_eq!(db_step.outcome, StepOutcome::Skipped);

    // Both locks are back.
    assert!(engine.locks().is_empty());
}

#[test]
fn full_promotion_syncs_code_and_database() {
    let (_dir, mock, engine, _site, a, b) = fixture(1);
    mock.set_tables(
        a.id.as_str(),
        vec![cascade_adapters::DumpTable {
            name: "users".to_owned(),
            row_count: 42,
            scrubbed_columns: Vec::new(),
        }],
    );

    let job_id = engine
        .promote(&promote_req(&a.id, &b.id, Components::ALL))
        .unwrap();
    let job = engine.wait_for_job(&job_id, WAIT).unwrap();

    assert_eq!(job.status, JobStatus::Succeeded);
    let dest = engine.env(&b.id).unwrap();
    assert!(dest.revision.is_some());
    assert!(dest.db_snapshot.is_some());
    assert_eq!(mock.call_count("restore"), 1);
}

/// A failing database step leaves the already-promoted code in place.
/// The partial state is recorded on the job, never silently rolled back.
#[test]
fn partial_failure_keeps_code_and_reports_database_error() {
    let (_dir, mock, engine, _site, a, b) = fixture(1);
    mock.set_revision(a.id.as_str(), "rev-partial");
    mock.fail_next("restore", 1, false);

    let before = engine.env(&b.id).unwrap();
    let job_id = engine
        .promote(&promote_req(&a.id, &b.id, Components::ALL))
        .unwrap();
    let job = engine.wait_for_job(&job_id, WAIT).unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.is_some());

    let code_step = job.steps.iter().find(|s| s.name == "promote-code").unwrap();
    assert_eq!(code_step.outcome, StepOutcome::Ok);
    let db_step = job.steps.iter().find(|s| s.name == "sync-database").unwrap();
    assert_eq!(db_step.outcome, StepOutcome::Failed);

    // Code reference moved, database reference did not.
    let dest = engine.env(&b.id).unwrap();
    assert_eq!(dest.revision.as_deref(), Some("rev-partial"));
    assert_eq!(dest.db_snapshot, before.db_snapshot);

    // The pre-job references were captured for a manual rollback.
    assert_eq!(job.rollback_ref.revision, before.revision);

    assert!(engine.locks().is_empty(), "locks released after failure");
}

#[test]
fn transient_adapter_errors_are_retried() {
    let (_dir, mock, engine, _site, a, b) = fixture(1);
    mock.fail_next("fetch", 2, true);

    let job_id = engine
        .promote(&promote_req(&a.id, &b.id, Components::CODE))
        .unwrap();
    let job = engine.wait_for_job(&job_id, WAIT).unwrap();

    assert_eq!(job.status, JobStatus::Succeeded);
    // Two failed attempts plus the one that went through.
    assert_eq!(mock.call_count("fetch"), 3);
}

#[test]
fn concurrent_promotions_to_same_destination_conflict() {
    // Zero workers: the first job keeps its locks because nothing runs it.
    let (_dir, _mock, engine, _site, a, b) = fixture(0);
    let c = {
        let site = engine.list_projects().unwrap().remove(0).site;
        let env = engine.register_env(&site.id, "preview", false).unwrap();
        engine.start_env(&env.id, None).unwrap();
        env
    };

    let first = engine
        .promote(&promote_req(&a.id, &b.id, Components::CODE))
        .unwrap();

    let err = engine
        .promote(&promote_req(&c.id, &b.id, Components::CODE))
        .unwrap_err();
    assert!(err.is_lock_conflict());
    match err {
        CoreError::LockConflict { holder, .. } => {
            assert_eq!(holder.as_str(), first.as_str(), "conflict names the job");
        }
        other => panic!("unexpected error: {other}"),
    }
}

/// Opposite-direction promotions take their locks in id order, so two
/// callers hammering A->B and B->A either succeed or get a clean conflict.
#[test]
fn opposite_direction_promotions_never_deadlock() {
    let (_dir, _mock, engine, _site, a, b) = fixture(2);
    let engine = &engine;

    std::thread::scope(|s| {
        for (src, dst) in [(&a.id, &b.id), (&b.id, &a.id)] {
            s.spawn(move || {
                for _ in 0..20 {
                    match engine.promote(&promote_req(src, dst, Components::CODE)) {
                        Ok(job_id) => {
                            let job = engine.wait_for_job(&job_id, WAIT).unwrap();
                            assert!(job.status.is_terminal());
                        }
                        Err(e) => assert!(e.is_lock_conflict(), "unexpected error: {e}"),
                    }
                }
            });
        }
    });

    assert!(engine.locks().is_empty());
}

/// Database syncs out of a production source without a sanitization
/// profile are rejected before any lock or adapter call.
#[test]
fn unsanitized_production_sync_is_rejected_without_side_effects() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockAdapters::new();
    let engine = Engine::open(dir.path(), mock.to_set(), options(1)).unwrap();

    let site = engine.register_site("acme").unwrap();
    let prod = engine.register_env(&site.id, "production", true).unwrap();
    let staging = engine.register_env(&site.id, "staging", false).unwrap();
    engine.start_env(&prod.id, None).unwrap();
    engine.start_env(&staging.id, None).unwrap();

    let calls_before = mock.calls().len();
    let err = engine
        .promote(&promote_req(&prod.id, &staging.id, Components::DATABASE))
        .unwrap_err();
    assert!(matches!(err, CoreError::PolicyViolation(_)));

    assert_eq!(mock.calls().len(), calls_before, "no adapter was touched");
    assert!(engine.locks().is_empty(), "no lock was taken");

    let page = engine.activities(&site.id, 1, 50).unwrap();
    let rejected: Vec<_> = page
        .entries
        .iter()
        .filter(|e| e.status == cascade_schema::ActivityStatus::Rejected)
        .collect();
    assert_eq!(rejected.len(), 1);
    assert!(rejected[0].description.contains("sanitization profile"));
}

#[test]
fn sync_from_production_applies_the_profile() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockAdapters::new();
    let engine = Engine::open(dir.path(), mock.to_set(), options(1)).unwrap();

    let site = engine.register_site("acme").unwrap();
    let prod = engine.register_env(&site.id, "production", true).unwrap();
    let staging = engine.register_env(&site.id, "staging", false).unwrap();
    engine.start_env(&prod.id, None).unwrap();
    engine.start_env(&staging.id, None).unwrap();

    mock.set_tables(
        prod.id.as_str(),
        vec![
            cascade_adapters::DumpTable {
                name: "users".to_owned(),
                row_count: 10,
                scrubbed_columns: Vec::new(),
            },
            cascade_adapters::DumpTable {
                name: "sessions".to_owned(),
                row_count: 500,
                scrubbed_columns: Vec::new(),
            },
        ],
    );

    let profile = engine
        .create_profile(
            r#"
name = "strip-pii"

[[rule]]
table = "users"
columns = ["email"]
action = "scrub"

[[rule]]
table = "sessions"
action = "exclude"
"#,
        )
        .unwrap();

    // Without a profile the same request is a policy violation.
    let err = engine
        .sync_from_production(&site.id, &staging.id, Components::DATABASE, None, None)
        .unwrap_err();
    assert!(matches!(err, CoreError::PolicyViolation(_)));

    let job_id = engine
        .sync_from_production(
            &site.id,
            &staging.id,
            Components::DATABASE,
            Some(profile.id.clone()),
            None,
        )
        .unwrap();
    let job = engine.wait_for_job(&job_id, WAIT).unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);

    // Excluded table dropped, scrubbed columns recorded on the rest.
    let restored = mock.tables_of(staging.id.as_str());
    assert_eq!(restored.len(), 1);
    assert_eq!(restored[0].name, "users");
    assert_eq!(restored[0].scrubbed_columns, vec!["email".to_owned()]);
}

#[test]
fn manual_lock_blocks_promotion_until_unlocked() {
    let (_dir, _mock, engine, _site, a, b) = fixture(1);

    assert!(matches!(
        engine.lock_env(&b.id, "  ", None),
        Err(CoreError::PolicyViolation(_))
    ));
    engine.lock_env(&b.id, "maintenance window", None).unwrap();

    let err = engine
        .promote(&promote_req(&a.id, &b.id, Components::CODE))
        .unwrap_err();
    assert!(err.is_lock_conflict());

    // The lock is visible on the project listing.
    let projects = engine.list_projects().unwrap();
    let env_b = projects[0]
        .environments
        .iter()
        .find(|e| e.id == b.id)
        .unwrap();
    let view = env_b.lock.as_ref().unwrap();
    assert!(view.manual);
    assert_eq!(view.reason.as_deref(), Some("maintenance window"));

    engine.unlock_env(&b.id, None).unwrap();
    assert!(matches!(
        engine.unlock_env(&b.id, None),
        Err(CoreError::InvalidState(_))
    ));

    let job_id = engine
        .promote(&promote_req(&a.id, &b.id, Components::CODE))
        .unwrap();
    let job = engine.wait_for_job(&job_id, WAIT).unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
}

#[test]
fn job_held_locks_cannot_be_manually_unlocked() {
    let (_dir, _mock, engine, _site, a, b) = fixture(0);
    engine
        .promote(&promote_req(&a.id, &b.id, Components::CODE))
        .unwrap();

    let err = engine.unlock_env(&b.id, None).unwrap_err();
    assert!(matches!(err, CoreError::InvalidState(_)));
}

#[test]
fn queue_backpressure_rejects_and_releases_locks() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockAdapters::new();
    let engine = Engine::open(
        dir.path(),
        mock.to_set(),
        EngineOptions {
            workers: 0,
            queue_depth: 1,
            lock_timeout: Duration::from_millis(50),
        },
    )
    .unwrap();

    let site = engine.register_site("acme").unwrap();
    let mut envs = Vec::new();
    for stage in ["a1", "a2", "b1", "b2"] {
        let env = engine.register_env(&site.id, stage, false).unwrap();
        engine.start_env(&env.id, None).unwrap();
        envs.push(env);
    }

    engine
        .promote(&promote_req(&envs[0].id, &envs[1].id, Components::CODE))
        .unwrap();
    let err = engine
        .promote(&promote_req(&envs[2].id, &envs[3].id, Components::CODE))
        .unwrap_err();
    assert!(matches!(err, CoreError::QueueFull));

    // Only the queued pair still holds locks.
    let held: Vec<String> = engine.locks().into_iter().map(|l| l.env_id).collect();
    assert_eq!(held.len(), 2);
    assert!(held.contains(&envs[0].id.to_string()));
    assert!(held.contains(&envs[1].id.to_string()));
}

#[test]
fn comparison_reports_stale_while_a_job_is_in_flight() {
    let (_dir, _mock, engine, _site, a, b) = fixture(0);

    let fresh = engine.compare(&a.id, &b.id).unwrap();
    assert!(!fresh.stale);
    assert!(!fresh.code.is_empty(), "distinct revisions must differ");

    engine
        .promote(&promote_req(&a.id, &b.id, Components::CODE))
        .unwrap();
    let during = engine.compare(&a.id, &b.id).unwrap();
    assert!(during.stale);
}

#[test]
fn comparison_goes_clean_after_the_job_finishes() {
    let (_dir, mock, engine, _site, a, b) = fixture(1);
    mock.set_revision(a.id.as_str(), "rev-same");

    let job_id = engine
        .promote(&promote_req(&a.id, &b.id, Components::ALL))
        .unwrap();
    let job = engine.wait_for_job(&job_id, WAIT).unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);

    let after = engine.compare(&a.id, &b.id).unwrap();
    assert!(!after.stale);
    assert!(after.code.is_empty(), "same revision on both sides");
    assert!(after.database.schema_match);
}

/// One terminal activity entry per job, carrying the measured duration.
#[test]
fn each_job_produces_exactly_one_terminal_activity() {
    let (_dir, _mock, engine, site, a, b) = fixture(1);

    let job_id = engine
        .promote(&promote_req(&a.id, &b.id, Components::CODE))
        .unwrap();
    engine.wait_for_job(&job_id, WAIT).unwrap();

    let page = engine.activities(&site.id, 1, 100).unwrap();
    let terminal: Vec<_> = page
        .entries
        .iter()
        .filter(|e| {
            e.action == "promote" && e.metadata["job_id"] == job_id.as_str()
        })
        .collect();
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].status, cascade_schema::ActivityStatus::Ok);
    assert!(terminal[0].duration_ms.is_some());

    let accepted = page
        .entries
        .iter()
        .filter(|e| e.action == "promote.accepted")
        .count();
    assert_eq!(accepted, 1);
}

#[test]
fn stopped_destination_is_started_and_restored() {
    let (_dir, _mock, engine, _site, a, b) = fixture(1);
    engine.stop_env(&b.id, None).unwrap();

    let mut req = promote_req(&a.id, &b.id, Components::CODE);
    req.restore_stopped = true;
    let job_id = engine.promote(&req).unwrap();
    let job = engine.wait_for_job(&job_id, WAIT).unwrap();

    assert_eq!(job.status, JobStatus::Succeeded);
    let start = job
        .steps
        .iter()
        .find(|s| s.name == "start-destination")
        .unwrap();
    assert_eq!(start.outcome, StepOutcome::Ok);
    let restore = job
        .steps
        .iter()
        .find(|s| s.name == "restore-destination-state")
        .unwrap();
    assert_eq!(restore.outcome, StepOutcome::Ok);

    let dest = engine.env(&b.id).unwrap();
    assert_eq!(dest.state, cascade_schema::EnvState::Stopped);
}

#[test]
fn cancel_rejects_unknown_and_finished_jobs() {
    let (_dir, _mock, engine, _site, a, b) = fixture(1);

    let missing = cascade_schema::JobId::new("job-nope");
    assert!(matches!(
        engine.cancel_job(&missing),
        Err(CoreError::NotFound(_))
    ));

    let job_id = engine
        .promote(&promote_req(&a.id, &b.id, Components::CODE))
        .unwrap();
    engine.wait_for_job(&job_id, WAIT).unwrap();
    assert!(matches!(
        engine.cancel_job(&job_id),
        Err(CoreError::InvalidState(_))
    ));
}

/// A cancellation lands at the next step boundary: the job goes
/// terminal, both locks come back, and exactly one terminal activity
/// entry carries the cancelled status.
#[test]
fn cancellation_at_step_boundary_releases_locks() {
    let (_dir, mock, engine, site, a, b) = fixture(1);
    let barrier = mock.barrier_on("fetch");

    let job_id = engine
        .promote(&promote_req(&a.id, &b.id, Components::ALL))
        .unwrap();
    barrier.wait_entered();
    engine.cancel_job(&job_id).unwrap();
    barrier.release();

    let job = engine.wait_for_job(&job_id, WAIT).unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.finished_at.is_some());
    // The code step in flight ran to completion; the database sync
    // behind the boundary never started.
    assert_eq!(mock.call_count("dump"), 0);

    assert!(engine.locks().is_empty(), "both locks released");

    let page = engine.activities(&site.id, 1, 100).unwrap();
    let terminal: Vec<_> = page
        .entries
        .iter()
        .filter(|e| e.action == "promote" && e.metadata["job_id"] == job_id.as_str())
        .collect();
    assert_eq!(terminal.len(), 1);
    assert_eq!(
        terminal[0].status,
        cascade_schema::ActivityStatus::Cancelled
    );
}

/// Promotion never crosses site boundaries, in either direction of the
/// production shortcut.
#[test]
fn cross_site_promotion_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockAdapters::new();
    let engine = Engine::open(dir.path(), mock.to_set(), options(1)).unwrap();

    let tenant_a = engine.register_site("acme").unwrap();
    let tenant_b = engine.register_site("globex").unwrap();
    let prod_a = engine.register_env(&tenant_a.id, "production", true).unwrap();
    let staging_b = engine.register_env(&tenant_b.id, "staging", false).unwrap();
    engine.start_env(&prod_a.id, None).unwrap();
    engine.start_env(&staging_b.id, None).unwrap();

    let calls_before = mock.calls().len();
    let err = engine
        .promote(&promote_req(&prod_a.id, &staging_b.id, Components::CODE))
        .unwrap_err();
    assert!(matches!(err, CoreError::PolicyViolation(_)));

    let err = engine
        .sync_from_production(
            &tenant_a.id,
            &staging_b.id,
            Components::CODE,
            None,
            None,
        )
        .unwrap_err();
    assert!(matches!(err, CoreError::PolicyViolation(_)));

    assert_eq!(mock.calls().len(), calls_before, "no adapter was touched");
    assert!(engine.locks().is_empty(), "no lock was taken");
}

/// The terminal activity entry is still filed under the site when the
/// destination record can no longer be read back.
#[test]
fn terminal_activity_survives_a_lost_destination_record() {
    let (dir, mock, engine, site, a, b) = fixture(1);
    let barrier = mock.barrier_on("fetch");

    let job_id = engine
        .promote(&promote_req(&a.id, &b.id, Components::CODE))
        .unwrap();
    barrier.wait_entered();
    // Tear the destination record while the job holds both locks.
    std::fs::write(
        dir.path()
            .join("store")
            .join("environments")
            .join(b.id.as_str()),
        "torn",
    )
    .unwrap();
    barrier.release();

    let job = engine.wait_for_job(&job_id, WAIT).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(engine.locks().is_empty());

    let page = engine.activities(&site.id, 1, 100).unwrap();
    let terminal: Vec<_> = page
        .entries
        .iter()
        .filter(|e| e.action == "promote" && e.metadata["job_id"] == job_id.as_str())
        .collect();
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].status, cascade_schema::ActivityStatus::Failed);
}

#[test]
fn lifecycle_transitions_are_enforced() {
    let (_dir, _mock, engine, _site, a, _b) = fixture(1);

    // Running -> Running via start is not a legal transition.
    assert!(engine.start_env(&a.id, None).is_err());
    // Restart is, since the state does not change.
    engine.restart_env(&a.id, None).unwrap();

    engine.stop_env(&a.id, None).unwrap();
    assert!(matches!(
        engine.restart_env(&a.id, None),
        Err(CoreError::InvalidState(_))
    ));

    engine.destroy_env(&a.id, None).unwrap();
    let rec = engine.env(&a.id).unwrap();
    assert_eq!(rec.state, cascade_schema::EnvState::Destroyed);
    assert!(engine.start_env(&a.id, None).is_err());
}

#[test]
fn destroy_refuses_locked_environments() {
    let (_dir, _mock, engine, _site, a, _b) = fixture(1);
    engine.lock_env(&a.id, "migration", None).unwrap();

    let err = engine.destroy_env(&a.id, None).unwrap_err();
    assert!(matches!(err, CoreError::InvalidState(_)));
    engine.unlock_env(&a.id, None).unwrap();
    engine.stop_env(&a.id, None).unwrap();
    engine.destroy_env(&a.id, None).unwrap();
}

#[test]
fn one_production_source_per_site() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockAdapters::new();
    let engine = Engine::open(dir.path(), mock.to_set(), options(1)).unwrap();

    let site = engine.register_site("acme").unwrap();
    engine.register_env(&site.id, "production", true).unwrap();
    let err = engine
        .register_env(&site.id, "production-2", true)
        .unwrap_err();
    assert!(matches!(err, CoreError::PolicyViolation(_)));
}
