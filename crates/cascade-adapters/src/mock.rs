//! In-memory adapter set for tests and local development.
//!
//! All three adapters share one mutex-guarded state table, so the mock
//! behaves like a single coherent backend: a revision checked out by the
//! VCS adapter is the revision the next fetch reports, a restored dump
//! changes what the next compare sees.
//!
//! Failure injection (`fail_next`), call holding (`barrier_on`), and
//! call recording make the mock suitable for exercising the job
//! manager's retry, cancellation, and zero-side-effect policy paths.

use crate::dbsync::{apply_profile, DbComparison, DbDump, DbSyncAdapter, DumpTable, TableDelta};
use crate::runtime::{RuntimeAdapter, RuntimeStatus};
use crate::vcs::{CodeDiff, VcsAdapter};
use crate::{AdapterError, AdapterSet};
use cascade_schema::{RevisionId, SanitizationProfile, SnapshotId};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

#[derive(Debug, Clone, Copy)]
struct FailurePlan {
    remaining: u32,
    transient: bool,
}

#[derive(Default)]
struct GateState {
    entered: bool,
    released: bool,
}

/// One-shot rendezvous point a scheduled operation blocks on.
#[derive(Default)]
struct Gate {
    state: Mutex<GateState>,
    cvar: Condvar,
}

impl Gate {
    fn pass(&self) {
        let mut st = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        st.entered = true;
        self.cvar.notify_all();
        while !st.released {
            st = self
                .cvar
                .wait(st)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }
}

/// Handle returned by [`MockAdapters::barrier_on`]; the gated call stays
/// blocked until [`MockBarrier::release`].
pub struct MockBarrier {
    gate: Arc<Gate>,
}

impl MockBarrier {
    /// Block until the gated operation arrives at the barrier.
    pub fn wait_entered(&self) {
        let mut st = self
            .gate
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        while !st.entered {
            st = self
                .gate
                .cvar
                .wait(st)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    /// Let the held operation proceed.
    pub fn release(&self) {
        let mut st = self
            .gate
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        st.released = true;
        self.gate.cvar.notify_all();
    }
}

/// Wait on a scheduled barrier for `op`, outside the state mutex so the
/// held call never freezes inspection or other adapter calls.
fn pass_gate(state: &Arc<Mutex<MockState>>, op: &str) {
    let gate = state
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .barriers
        .remove(op);
    if let Some(gate) = gate {
        gate.pass();
    }
}

#[derive(Default)]
struct MockState {
    revisions: HashMap<String, RevisionId>,
    tables: HashMap<String, Vec<DumpTable>>,
    snapshots: HashMap<String, SnapshotId>,
    running: HashMap<String, bool>,
    failures: HashMap<String, FailurePlan>,
    barriers: HashMap<String, Arc<Gate>>,
    calls: Vec<String>,
    dump_counter: u64,
}

impl MockState {
    /// Record the call and consume one scheduled failure for `op`, if any.
    fn hit(&mut self, op: &str, subject: &str) -> Result<(), AdapterError> {
        self.calls.push(format!("{op}:{subject}"));
        if let Some(plan) = self.failures.get_mut(op) {
            if plan.remaining > 0 {
                plan.remaining -= 1;
                let transient = plan.transient;
                if plan.remaining == 0 {
                    self.failures.remove(op);
                }
                return Err(if transient {
                    AdapterError::Transient(format!("injected transient failure for {op}"))
                } else {
                    AdapterError::Failed(format!("injected failure for {op}"))
                });
            }
        }
        Ok(())
    }

    fn default_tables(env_id: &str) -> Vec<DumpTable> {
        vec![
            DumpTable {
                name: "users".to_owned(),
                row_count: 10 + env_id.len() as u64,
                scrubbed_columns: Vec::new(),
            },
            DumpTable {
                name: "orders".to_owned(),
                row_count: 25,
                scrubbed_columns: Vec::new(),
            },
        ]
    }

    fn tables_of(&self, env_id: &str) -> Vec<DumpTable> {
        self.tables
            .get(env_id)
            .cloned()
            .unwrap_or_else(|| Self::default_tables(env_id))
    }
}

fn default_revision(env_id: &str) -> RevisionId {
    RevisionId::new(&blake3::hash(format!("rev:{env_id}").as_bytes()).to_hex()[..12])
}

/// Handle for configuring and inspecting the shared mock state.
#[derive(Clone)]
pub struct MockAdapters {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockAdapters {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }
}

impl MockAdapters {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn runtime(&self) -> MockRuntime {
        MockRuntime {
            state: Arc::clone(&self.state),
        }
    }

    pub fn vcs(&self) -> MockVcs {
        MockVcs {
            state: Arc::clone(&self.state),
        }
    }

    pub fn db(&self) -> MockDbSync {
        MockDbSync {
            state: Arc::clone(&self.state),
        }
    }

    /// Bundle the three handles into an [`AdapterSet`]; the returned set
    /// still shares state with `self`, so tests keep their inspection handle.
    pub fn to_set(&self) -> AdapterSet {
        AdapterSet {
            runtime: Box::new(self.runtime()),
            vcs: Box::new(self.vcs()),
            db: Box::new(self.db()),
        }
    }

    /// Schedule the next `count` calls of `op` to fail.
    /// Ops are method names: `start`, `fetch`, `checkout`, `dump`, `restore`, ...
    pub fn fail_next(&self, op: &str, count: u32, transient: bool) {
        self.lock().failures.insert(
            op.to_owned(),
            FailurePlan {
                remaining: count,
                transient,
            },
        );
    }

    /// Hold the next call of `op` open until the returned barrier is
    /// released. `wait_entered` synchronizes the test with the held call.
    pub fn barrier_on(&self, op: &str) -> MockBarrier {
        let gate = Arc::new(Gate::default());
        self.lock().barriers.insert(op.to_owned(), Arc::clone(&gate));
        MockBarrier { gate }
    }

    pub fn set_revision(&self, env_id: &str, rev: impl Into<RevisionId>) {
        self.lock().revisions.insert(env_id.to_owned(), rev.into());
    }

    pub fn set_tables(&self, env_id: &str, tables: Vec<DumpTable>) {
        self.lock().tables.insert(env_id.to_owned(), tables);
    }

    pub fn tables_of(&self, env_id: &str) -> Vec<DumpTable> {
        self.lock().tables_of(env_id)
    }

    pub fn revision_of(&self, env_id: &str) -> RevisionId {
        self.lock()
            .revisions
            .get(env_id)
            .cloned()
            .unwrap_or_else(|| default_revision(env_id))
    }

    /// Every adapter call so far, as `op:subject` strings in call order.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self, op: &str) -> usize {
        let prefix = format!("{op}:");
        self.lock()
            .calls
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .count()
    }
}

pub struct MockRuntime {
    state: Arc<Mutex<MockState>>,
}

impl MockRuntime {
    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl RuntimeAdapter for MockRuntime {
    fn name(&self) -> &str {
        "mock"
    }

    fn available(&self) -> bool {
        true
    }

    fn start(&self, env_id: &str) -> Result<String, AdapterError> {
        pass_gate(&self.state, "start");
        let mut state = self.lock();
        state.hit("start", env_id)?;
        state.running.insert(env_id.to_owned(), true);
        Ok(format!("mock-ctr-{env_id}"))
    }

    fn stop(&self, env_id: &str) -> Result<(), AdapterError> {
        pass_gate(&self.state, "stop");
        let mut state = self.lock();
        state.hit("stop", env_id)?;
        if state.running.get(env_id) != Some(&true) {
            return Err(AdapterError::NotRunning(env_id.to_owned()));
        }
        state.running.insert(env_id.to_owned(), false);
        Ok(())
    }

    fn restart(&self, env_id: &str) -> Result<String, AdapterError> {
        pass_gate(&self.state, "restart");
        let mut state = self.lock();
        state.hit("restart", env_id)?;
        state.running.insert(env_id.to_owned(), true);
        Ok(format!("mock-ctr-{env_id}"))
    }

    fn logs(&self, env_id: &str) -> Result<String, AdapterError> {
        pass_gate(&self.state, "logs");
        let mut state = self.lock();
        state.hit("logs", env_id)?;
        let running = state.running.get(env_id) == Some(&true);
        Ok(format!("[mock] {env_id} running={running}\n"))
    }

    fn status(&self, env_id: &str) -> Result<RuntimeStatus, AdapterError> {
        pass_gate(&self.state, "status");
        let mut state = self.lock();
        state.hit("status", env_id)?;
        let running = state.running.get(env_id) == Some(&true);
        Ok(RuntimeStatus {
            env_id: env_id.to_owned(),
            running,
            container_ref: running.then(|| format!("mock-ctr-{env_id}")),
        })
    }
}

pub struct MockVcs {
    state: Arc<Mutex<MockState>>,
}

impl MockVcs {
    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl VcsAdapter for MockVcs {
    fn name(&self) -> &str {
        "mock"
    }

    fn fetch(&self, env_id: &str) -> Result<RevisionId, AdapterError> {
        pass_gate(&self.state, "fetch");
        let mut state = self.lock();
        state.hit("fetch", env_id)?;
        Ok(state
            .revisions
            .get(env_id)
            .cloned()
            .unwrap_or_else(|| default_revision(env_id)))
    }

    fn checkout(&self, env_id: &str, revision: &RevisionId) -> Result<(), AdapterError> {
        pass_gate(&self.state, "checkout");
        let mut state = self.lock();
        state.hit("checkout", env_id)?;
        state.revisions.insert(env_id.to_owned(), revision.clone());
        Ok(())
    }

    fn diff(&self, from: &RevisionId, to: &RevisionId) -> Result<CodeDiff, AdapterError> {
        pass_gate(&self.state, "diff");
        let mut state = self.lock();
        state.hit("diff", from.as_str())?;
        let changed_paths = if from == to {
            Vec::new()
        } else {
            // One deterministic path per revision pair.
            vec![format!(
                "src/{}",
                &blake3::hash(format!("{from}..{to}").as_bytes()).to_hex()[..8]
            )]
        };
        Ok(CodeDiff {
            from: from.clone(),
            to: to.clone(),
            changed_paths,
        })
    }

    fn push(&self, env_id: &str, _revision: &RevisionId) -> Result<(), AdapterError> {
        pass_gate(&self.state, "push");
        self.lock().hit("push", env_id)
    }
}

pub struct MockDbSync {
    state: Arc<Mutex<MockState>>,
}

impl MockDbSync {
    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl DbSyncAdapter for MockDbSync {
    fn name(&self) -> &str {
        "mock"
    }

    fn dump(&self, env_id: &str) -> Result<DbDump, AdapterError> {
        pass_gate(&self.state, "dump");
        let mut state = self.lock();
        state.hit("dump", env_id)?;
        state.dump_counter += 1;
        let id = format!("dump-{:04}", state.dump_counter);
        Ok(DbDump {
            id,
            source_env: env_id.to_owned(),
            tables: state.tables_of(env_id),
            sanitized: false,
        })
    }

    fn sanitize(
        &self,
        dump: DbDump,
        profile: &SanitizationProfile,
    ) -> Result<DbDump, AdapterError> {
        pass_gate(&self.state, "sanitize");
        let mut state = self.lock();
        state.hit("sanitize", &dump.id)?;
        Ok(apply_profile(dump, profile))
    }

    fn restore(&self, env_id: &str, dump: &DbDump) -> Result<SnapshotId, AdapterError> {
        pass_gate(&self.state, "restore");
        let mut state = self.lock();
        state.hit("restore", env_id)?;
        state.tables.insert(env_id.to_owned(), dump.tables.clone());
        let snapshot = SnapshotId::new(format!("snap-{}-{}", env_id, dump.id));
        state.snapshots.insert(env_id.to_owned(), snapshot.clone());
        Ok(snapshot)
    }

    fn compare(&self, env_a: &str, env_b: &str) -> Result<DbComparison, AdapterError> {
        pass_gate(&self.state, "compare");
        let mut state = self.lock();
        state.hit("compare", env_a)?;
        let a = state.tables_of(env_a);
        let b = state.tables_of(env_b);

        let mut names: Vec<String> = a.iter().map(|t| t.name.clone()).collect();
        for t in &b {
            if !names.contains(&t.name) {
                names.push(t.name.clone());
            }
        }

        let rows = |tables: &[DumpTable], name: &str| {
            tables
                .iter()
                .find(|t| t.name == name)
                .map_or(0, |t| t.row_count)
        };
        let table_deltas = names
            .iter()
            .map(|name| TableDelta {
                table: name.clone(),
                rows_a: rows(&a, name),
                rows_b: rows(&b, name),
            })
            .collect();

        let names_a: Vec<&str> = a.iter().map(|t| t.name.as_str()).collect();
        let names_b: Vec<&str> = b.iter().map(|t| t.name.as_str()).collect();
        Ok(DbComparison {
            schema_match: names_a == names_b,
            table_deltas,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_schema::ProfileId;

    #[test]
    fn runtime_start_stop_status() {
        let mock = MockAdapters::new();
        let rt = mock.runtime();

        let ctr = rt.start("env_1").unwrap();
        assert_eq!(ctr, "mock-ctr-env_1");
        assert!(rt.status("env_1").unwrap().running);

        rt.stop("env_1").unwrap();
        assert!(!rt.status("env_1").unwrap().running);
        assert!(matches!(
            rt.stop("env_1"),
            Err(AdapterError::NotRunning(_))
        ));
    }

    #[test]
    fn vcs_checkout_changes_fetch() {
        let mock = MockAdapters::new();
        let vcs = mock.vcs();

        let before = vcs.fetch("env_1").unwrap();
        vcs.checkout("env_1", &RevisionId::new("rev_x")).unwrap();
        let after = vcs.fetch("env_1").unwrap();
        assert_ne!(before, after);
        assert_eq!(after, "rev_x");
    }

    #[test]
    fn vcs_diff_identical_revisions_is_empty() {
        let mock = MockAdapters::new();
        let vcs = mock.vcs();
        let rev = RevisionId::new("same");
        assert!(vcs.diff(&rev, &rev).unwrap().is_empty());
        assert!(!vcs
            .diff(&rev, &RevisionId::new("other"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn db_dump_restore_moves_tables() {
        let mock = MockAdapters::new();
        let db = mock.db();
        mock.set_tables(
            "env_src",
            vec![DumpTable {
                name: "users".to_owned(),
                row_count: 42,
                scrubbed_columns: Vec::new(),
            }],
        );

        let dump = db.dump("env_src").unwrap();
        let snap = db.restore("env_dst", &dump).unwrap();
        assert!(snap.as_str().starts_with("snap-env_dst-"));

        let cmp = db.compare("env_src", "env_dst").unwrap();
        assert!(cmp.schema_match);
        assert!(cmp.table_deltas.iter().all(|d| d.rows_a == d.rows_b));
    }

    #[test]
    fn failure_injection_transient_then_ok() {
        let mock = MockAdapters::new();
        let vcs = mock.vcs();
        mock.fail_next("fetch", 2, true);

        assert!(matches!(
            vcs.fetch("env_1"),
            Err(AdapterError::Transient(_))
        ));
        assert!(matches!(
            vcs.fetch("env_1"),
            Err(AdapterError::Transient(_))
        ));
        assert!(vcs.fetch("env_1").is_ok());
        assert_eq!(mock.call_count("fetch"), 3);
    }

    #[test]
    fn failure_injection_fatal() {
        let mock = MockAdapters::new();
        let db = mock.db();
        mock.fail_next("dump", 1, false);
        let err = db.dump("env_1").unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn calls_are_recorded_in_order() {
        let mock = MockAdapters::new();
        let rt = mock.runtime();
        rt.start("a").unwrap();
        rt.stop("a").unwrap();
        assert_eq!(mock.calls(), vec!["start:a", "stop:a"]);
    }

    #[test]
    fn barrier_holds_a_call_until_released() {
        let mock = MockAdapters::new();
        let barrier = mock.barrier_on("fetch");
        let vcs = mock.vcs();

        let handle = std::thread::spawn(move || vcs.fetch("env_1"));
        barrier.wait_entered();
        assert_eq!(mock.call_count("fetch"), 0, "call is held at the barrier");
        // Other ops are unaffected while one is held.
        mock.runtime().start("env_1").unwrap();

        barrier.release();
        handle.join().unwrap().unwrap();
        assert_eq!(mock.call_count("fetch"), 1);
    }
}
