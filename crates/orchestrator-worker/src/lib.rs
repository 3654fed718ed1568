// crates/orchestrator-worker/src/lib.rs
// ============================================================================
// Crate: orchestrator-worker
// Description: The Scheduler's single-tick contract and the long-running
//              worker loop that drives it.
// Purpose: Turn pending Runs into terminal ones, one tick (one transaction)
//          at a time, and keep doing so until shutdown.
// Dependencies: orchestrator-core, orchestrator-handlers, tokio, thiserror
// ============================================================================

//! ## Overview
//! [`Scheduler::run_once`] is the entire worker contract: claim the oldest
//! pending run, invoke its handler, enqueue whatever comes next, commit. It
//! never blocks past the transaction it opens except inside the handler
//! itself (`CI_WAIT`'s bounded poll is the only long-running one). The
//! [`worker_loop`] function repeats this forever, sleeping
//! `poll_interval` between empty ticks, until a shutdown signal fires.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::time::Duration;

use orchestrator_core::Run;
use orchestrator_core::RunStatus;
use orchestrator_core::Stage;
use orchestrator_core::Store;
use orchestrator_core::StoreError;
use orchestrator_core::TaskId;
use orchestrator_core::TaskStatus;
use orchestrator_core::next_stage_after;
use orchestrator_core::spawn_retry_or_fail_task;
use orchestrator_handlers::HANDLERS;
use orchestrator_handlers::HandlerDeps;

// ============================================================================
// SECTION: Tick Reporting (ambient audit log)
// ============================================================================

/// One tick's observable outcome, recorded by a [`TickSink`]. Dependency-light
/// structured event rather than a `tracing` span, matching the teacher
/// crate's own telemetry modules.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct TickEvent {
    /// Task the processed run belonged to, if any run was claimed.
    pub task_id: Option<i64>,
    /// Stage of the processed run, if any.
    pub stage: Option<&'static str>,
    /// Attempt number of the processed run, if any.
    pub attempt: Option<u32>,
    /// Final run status after the tick, if any run was claimed.
    pub status: Option<&'static str>,
    /// Error text, when the tick itself (not the run) failed.
    pub error: Option<String>,
}

/// Sink for [`TickEvent`]s. `Null` discards them; `Stdout` writes one JSON
/// line per tick to standard output for operators tailing the worker.
pub trait TickSink: Send + Sync {
    /// Records one tick's outcome.
    fn record(&self, event: &TickEvent);
}

/// Discards every event. Default for tests and library embedding.
pub struct NullSink;

impl TickSink for NullSink {
    fn record(&self, _event: &TickEvent) {}
}

/// Writes one JSON line per tick to standard output.
pub struct StdoutSink;

impl TickSink for StdoutSink {
    fn record(&self, event: &TickEvent) {
        use std::io::Write as _;
        if let Ok(line) = serde_json::to_string(event) {
            let _ = writeln!(std::io::stdout(), "{line}");
        }
    }
}

// ============================================================================
// SECTION: Tick Outcome
// ============================================================================

/// What one call to [`Scheduler::run_once`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// No pending run was available to claim.
    NoWork,
    /// A run was claimed and driven to a terminal or suspended status.
    Processed {
        /// The task the run belonged to.
        task_id: TaskId,
        /// The stage that was attempted.
        stage: Stage,
        /// The attempt number that was attempted.
        attempt: u32,
        /// The run's status after the tick (PASS, FAIL, or PENDING on suspension).
        status: RunStatus,
    },
}

impl TickOutcome {
    /// Matches the HTTP `kick` endpoint's `{"status": "processed"|"no_work"}` contract.
    #[must_use]
    pub const fn as_kick_status(self) -> &'static str {
        match self {
            Self::NoWork => "no_work",
            Self::Processed { .. } => "processed",
        }
    }
}

// ============================================================================
// SECTION: Scheduler
// ============================================================================

/// Drives pending runs to completion one tick at a time.
pub struct Scheduler<'a> {
    store: &'a dyn Store,
    default_max_attempts: u32,
    sink: &'a dyn TickSink,
}

impl<'a> Scheduler<'a> {
    /// Builds a scheduler over `store`, enqueuing successor runs with
    /// `default_max_attempts` (the configured `MAX_ATTEMPTS` default),
    /// reporting each tick to `sink`.
    #[must_use]
    pub const fn new(store: &'a dyn Store, default_max_attempts: u32, sink: &'a dyn TickSink) -> Self {
        Self { store, default_max_attempts, sink }
    }

    /// Processes at most one pending run inside one transactional scope. See
    /// §4.D of the specification for the exact seven-step contract this
    /// implements.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the scope itself cannot be opened or
    /// committed (a store failure rolls the scope back and is surfaced to
    /// the caller so the next tick can retry); a handler error never
    /// escapes this boundary, it is recorded on the run instead.
    pub fn run_once(&self, deps: &HandlerDeps<'_>) -> Result<TickOutcome, StoreError> {
        let mut outcome = TickOutcome::NoWork;
        let mut event = TickEvent { task_id: None, stage: None, attempt: None, status: None, error: None };

        let result = self.store.with_scope(&mut |scope| {
            let Some(claimed) = scope.claim_next_pending_run()? else {
                return Ok(());
            };
            let task = scope
                .get_task(claimed.task_id)?
                .ok_or_else(|| StoreError::Connectivity(format!("task {} vanished mid-tick", claimed.task_id)))?;
            let running = scope.mark_run_running(claimed.id)?;

            event.task_id = Some(running.task_id.get());
            event.stage = Some(running.stage.tag());
            event.attempt = Some(running.attempt);

            let Some(handler) = HANDLERS.get(&running.stage) else {
                let failed = scope.fail_run(running.id, "no handler".to_string())?;
                spawn_retry_or_fail_task(scope, task.id, &failed)?;
                event.status = Some(RunStatus::Fail.tag());
                outcome = TickOutcome::Processed {
                    task_id: task.id,
                    stage: running.stage,
                    attempt: running.attempt,
                    status: RunStatus::Fail,
                };
                return Ok(());
            };

            match handler(scope, &task, &running, deps) {
                Ok(()) => {
                    let final_run = find_run(scope, task.id, running.id)?;
                    handle_terminal_status(self.default_max_attempts, scope, &task, &final_run)?;
                    event.status = Some(final_run.status.tag());
                    outcome = TickOutcome::Processed {
                        task_id: task.id,
                        stage: final_run.stage,
                        attempt: final_run.attempt,
                        status: final_run.status,
                    };
                }
                Err(handler_err) => {
                    event.error = Some(handler_err.to_string());
                    let failed = scope.fail_run(running.id, handler_err.to_string())?;
                    spawn_retry_or_fail_task(scope, task.id, &failed)?;
                    event.status = Some(RunStatus::Fail.tag());
                    outcome = TickOutcome::Processed {
                        task_id: task.id,
                        stage: running.stage,
                        attempt: running.attempt,
                        status: RunStatus::Fail,
                    };
                }
            }
            Ok(())
        });

        match result {
            Ok(()) => {
                if event.task_id.is_some() {
                    self.sink.record(&event);
                }
                Ok(outcome)
            }
            Err(err) => {
                self.sink.record(&TickEvent {
                    task_id: None,
                    stage: None,
                    attempt: None,
                    status: None,
                    error: Some(err.to_string()),
                });
                Err(err)
            }
        }
    }
}

/// Looks up a run's up-to-date row by id from the task's run list. The
/// `StoreScope` contract has no per-run read (every mutator already returns
/// the updated row), so this is only needed after a handler has made its own
/// mutations behind our back inside the same scope.
fn find_run(
    scope: &mut dyn orchestrator_core::StoreScope,
    task_id: TaskId,
    run_id: orchestrator_core::RunId,
) -> Result<Run, StoreError> {
    scope
        .list_runs(task_id)?
        .into_iter()
        .find(|run| run.id == run_id)
        .ok_or_else(|| StoreError::Connectivity(format!("run {run_id} vanished mid-tick")))
}

/// Step 6 of §4.D: on PASS, enqueue the successor (or finish the task); on
/// FAIL, the handler has already spawned a retry/rework; on PENDING
/// (HUMAN_APPROVAL suspension), do nothing.
fn handle_terminal_status(
    default_max_attempts: u32,
    scope: &mut dyn orchestrator_core::StoreScope,
    task: &orchestrator_core::Task,
    run: &Run,
) -> Result<(), StoreError> {
    match run.status {
        RunStatus::Pass => match next_stage_after(run.stage) {
            Some(next_stage) => {
                scope.insert_run(task.id, next_stage, 1, default_max_attempts)?;
                scope.set_task_status(task.id, TaskStatus::Running)?;
            }
            None => {
                // MERGE's own handler already set the task DONE; nothing further to enqueue.
            }
        },
        RunStatus::Fail | RunStatus::Pending => {}
        RunStatus::Running => {
            return Err(StoreError::Connectivity(format!(
                "run {} left RUNNING by its handler; invariant R2 violated",
                run.id
            )));
        }
    }
    Ok(())
}

// ============================================================================
// SECTION: Worker Loop
// ============================================================================

/// Runs [`Scheduler::run_once`] forever, sleeping `poll_interval` after each
/// empty tick, until `shutdown` fires. Ticks that return [`StoreError`] are
/// logged and treated as an empty tick (§7: "scope rolls back; tick returns
/// `no_work`; next tick re-attempts").
pub async fn worker_loop(
    scheduler: &Scheduler<'_>,
    deps: &HandlerDeps<'_>,
    poll_interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        let processed = matches!(scheduler.run_once(deps), Ok(TickOutcome::Processed { .. }));
        if processed {
            continue;
        }
        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_core::CiOutcome;
    use orchestrator_core::CiWaitError;
    use orchestrator_core::CodeHostingError;
    use orchestrator_core::DecisionValue;
    use orchestrator_core::DispatchError;
    use orchestrator_core::SecretScanError;
    use orchestrator_core::StoreScope as _;
    use orchestrator_store_sqlite::SqliteStore;
    use serde_json::Value;
    use serde_json::json;
    use std::sync::Mutex;

    struct ScriptedDispatcher {
        qa_calls: Mutex<u32>,
        qa_first_passes: bool,
    }

    impl orchestrator_core::RoleDispatcher for ScriptedDispatcher {
        fn dispatch(&self, role: &str, input: &Value) -> Result<Value, DispatchError> {
            if role == "QA" {
                let mut calls = self.qa_calls.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                *calls += 1;
                let passed = if *calls == 1 { self.qa_first_passes } else { true };
                return Ok(json!({ "passed": passed, "issues": [], "suggestions": [] }));
            }
            Ok(json!({ "role": role, "received": input }))
        }
    }

    struct AlwaysFailDispatcher;
    impl orchestrator_core::RoleDispatcher for AlwaysFailDispatcher {
        fn dispatch(&self, _role: &str, _input: &Value) -> Result<Value, DispatchError> {
            Err(DispatchError::Failed("simulated outage".to_string()))
        }
    }

    struct NoopCodeHosting;
    impl orchestrator_core::CodeHostingClient for NoopCodeHosting {
        fn ensure_pull_request(
            &self,
            _: &str,
            _: &str,
            _: &str,
        ) -> Result<orchestrator_core::PullRequestRef, CodeHostingError> {
            Err(CodeHostingError::NotConfigured)
        }
        fn merge_pull_request(&self, _: u64) -> Result<(), CodeHostingError> {
            Ok(())
        }
        fn comment_pull_request(&self, _: u64, _: &str) -> Result<(), CodeHostingError> {
            Ok(())
        }
    }

    struct GreenCiWaiter;
    impl orchestrator_core::CiWaiter for GreenCiWaiter {
        fn wait_for_checks(&self, _: u64, _: u64) -> Result<CiOutcome, CiWaitError> {
            Ok(CiOutcome::Passed)
        }
    }

    struct CleanSecretScanner;
    impl orchestrator_core::SecretScanner for CleanSecretScanner {
        fn scan(&self, _: &str) -> Result<Vec<orchestrator_core::SecretFinding>, SecretScanError> {
            Ok(Vec::new())
        }
    }

    fn tick_until_no_work(scheduler: &Scheduler<'_>, deps: &HandlerDeps<'_>, max_ticks: u32) -> u32 {
        let mut ticks = 0;
        for _ in 0..max_ticks {
            ticks += 1;
            match scheduler.run_once(deps) {
                Ok(TickOutcome::NoWork) => return ticks,
                Ok(TickOutcome::Processed { .. }) => {}
                Err(_) => return ticks,
            }
        }
        ticks
    }

    #[test]
    fn s1_happy_path_drives_task_to_done_with_fourteen_passes() {
        let store = SqliteStore::open_in_memory().expect("open store");
        let dispatcher = ScriptedDispatcher { qa_calls: Mutex::new(0), qa_first_passes: true };
        let code_hosting = NoopCodeHosting;
        let ci_waiter = GreenCiWaiter;
        let scanner = CleanSecretScanner;
        let deps = HandlerDeps {
            dispatcher: &dispatcher,
            code_hosting: &code_hosting,
            ci_waiter: &ci_waiter,
            secret_scanner: &scanner,
            ci_timeout_seconds: 1,
        };
        let sink = NullSink;
        let scheduler = Scheduler::new(&store, 3, &sink);

        let mut task_id = None;
        store
            .with_scope(&mut |scope| {
                task_id = Some(scope.create_task("Add widgets", "please add widgets", 3)?.id);
                Ok(())
            })
            .expect("seed task");
        let task_id = task_id.expect("task id");

        // Drive ticks until HUMAN_APPROVAL suspends (no decision recorded yet).
        for _ in 0..20 {
            if matches!(scheduler.run_once(&deps), Ok(TickOutcome::NoWork)) {
                break;
            }
        }

        store
            .with_scope(&mut |scope| {
                scope.insert_decision(task_id, DecisionValue::Approve, None)?;
                Ok(())
            })
            .expect("approve");

        for _ in 0..5 {
            if matches!(scheduler.run_once(&deps), Ok(TickOutcome::NoWork)) {
                break;
            }
        }

        let with_children = store.get_task_with_children(task_id).expect("load").expect("task exists");
        assert_eq!(with_children.task.status, TaskStatus::Done);
        let passes = with_children.runs.iter().filter(|run| run.status == RunStatus::Pass).count();
        assert_eq!(passes, orchestrator_core::STAGE_ORDER.len());
        assert_eq!(with_children.decisions.len(), 1);
    }

    #[test]
    fn s2_qa_failure_reworks_backend_then_recovers() {
        let store = SqliteStore::open_in_memory().expect("open store");
        let dispatcher = ScriptedDispatcher { qa_calls: Mutex::new(0), qa_first_passes: false };
        let code_hosting = NoopCodeHosting;
        let ci_waiter = GreenCiWaiter;
        let scanner = CleanSecretScanner;
        let deps = HandlerDeps {
            dispatcher: &dispatcher,
            code_hosting: &code_hosting,
            ci_waiter: &ci_waiter,
            secret_scanner: &scanner,
            ci_timeout_seconds: 1,
        };
        let sink = NullSink;
        let scheduler = Scheduler::new(&store, 3, &sink);

        let mut task_id = None;
        store
            .with_scope(&mut |scope| {
                task_id = Some(scope.create_task("Add widgets", "please add widgets", 3)?.id);
                Ok(())
            })
            .expect("seed task");
        let task_id = task_id.expect("task id");

        for _ in 0..20 {
            if matches!(scheduler.run_once(&deps), Ok(TickOutcome::NoWork)) {
                break;
            }
        }
        store
            .with_scope(&mut |scope| {
                scope.insert_decision(task_id, DecisionValue::Approve, None)?;
                Ok(())
            })
            .expect("approve");
        for _ in 0..5 {
            if matches!(scheduler.run_once(&deps), Ok(TickOutcome::NoWork)) {
                break;
            }
        }

        let with_children = store.get_task_with_children(task_id).expect("load").expect("task exists");
        assert_eq!(with_children.task.status, TaskStatus::Done);
        let backend_passes = with_children
            .runs
            .iter()
            .filter(|run| run.stage == Stage::Backend && run.status == RunStatus::Pass)
            .count();
        assert_eq!(backend_passes, 2);
        let qa_fails = with_children
            .runs
            .iter()
            .filter(|run| run.stage == Stage::QaBackend && run.status == RunStatus::Fail)
            .count();
        assert_eq!(qa_fails, 1);
    }

    #[test]
    fn s3_retry_exhaustion_fails_task_with_no_later_stage_runs() {
        let store = SqliteStore::open_in_memory().expect("open store");
        let dispatcher = AlwaysFailDispatcher;
        let code_hosting = NoopCodeHosting;
        let ci_waiter = GreenCiWaiter;
        let scanner = CleanSecretScanner;
        let deps = HandlerDeps {
            dispatcher: &dispatcher,
            code_hosting: &code_hosting,
            ci_waiter: &ci_waiter,
            secret_scanner: &scanner,
            ci_timeout_seconds: 1,
        };
        let sink = NullSink;
        let scheduler = Scheduler::new(&store, 3, &sink);

        let mut task_id = None;
        store
            .with_scope(&mut |scope| {
                let task = scope.create_task("Add widgets", "please add widgets", 3)?;
                task_id = Some(task.id);
                let product = scope.claim_next_pending_run()?.expect("product run pending");
                scope.pass_run(product.id, None)?;
                scope.insert_run(task.id, Stage::Backend, 1, 3)?;
                Ok(())
            })
            .expect("seed past product");
        let task_id = task_id.expect("task id");

        let ticks = tick_until_no_work(&scheduler, &deps, 10);
        assert!(ticks <= 10);

        let with_children = store.get_task_with_children(task_id).expect("load").expect("task exists");
        assert_eq!(with_children.task.status, TaskStatus::Failed);
        let backend_fails: Vec<_> = with_children
            .runs
            .iter()
            .filter(|run| run.stage == Stage::Backend && run.status == RunStatus::Fail)
            .collect();
        assert_eq!(backend_fails.len(), 3);
        let mut attempts: Vec<u32> = backend_fails.iter().map(|run| run.attempt).collect();
        attempts.sort_unstable();
        assert_eq!(attempts, vec![1, 2, 3]);
        assert!(with_children.runs.iter().all(|run| {
            !matches!(run.stage, Stage::QaBackend | Stage::Security | Stage::BackendGate)
                || run.status != RunStatus::Pass
        }));
    }

    #[test]
    fn s4_human_reject_then_approve_continues_to_merge() {
        let store = SqliteStore::open_in_memory().expect("open store");
        let dispatcher = ScriptedDispatcher { qa_calls: Mutex::new(0), qa_first_passes: true };
        let code_hosting = NoopCodeHosting;
        let ci_waiter = GreenCiWaiter;
        let scanner = CleanSecretScanner;
        let deps = HandlerDeps {
            dispatcher: &dispatcher,
            code_hosting: &code_hosting,
            ci_waiter: &ci_waiter,
            secret_scanner: &scanner,
            ci_timeout_seconds: 1,
        };
        let sink = NullSink;
        let scheduler = Scheduler::new(&store, 3, &sink);

        let mut task_id = None;
        store
            .with_scope(&mut |scope| {
                task_id = Some(scope.create_task("Add widgets", "please add widgets", 3)?.id);
                Ok(())
            })
            .expect("seed task");
        let task_id = task_id.expect("task id");

        for _ in 0..20 {
            if matches!(scheduler.run_once(&deps), Ok(TickOutcome::NoWork)) {
                break;
            }
        }
        store
            .with_scope(&mut |scope| {
                scope.insert_decision(task_id, DecisionValue::Reject, Some("not ready".to_string()))?;
                Ok(())
            })
            .expect("reject");
        scheduler.run_once(&deps).expect("tick consumes reject");

        let with_children = store.get_task_with_children(task_id).expect("load").expect("task exists");
        let rejected = with_children
            .runs
            .iter()
            .filter(|run| run.stage == Stage::HumanApproval && run.status == RunStatus::Fail)
            .count();
        assert_eq!(rejected, 1);
        let pending_retry = with_children
            .runs
            .iter()
            .any(|run| run.stage == Stage::HumanApproval && run.status == RunStatus::Pending && run.attempt == 2);
        assert!(pending_retry);

        store
            .with_scope(&mut |scope| {
                scope.insert_decision(task_id, DecisionValue::Approve, None)?;
                Ok(())
            })
            .expect("approve");
        for _ in 0..5 {
            if matches!(scheduler.run_once(&deps), Ok(TickOutcome::NoWork)) {
                break;
            }
        }

        let with_children = store.get_task_with_children(task_id).expect("load").expect("task exists");
        assert_eq!(with_children.task.status, TaskStatus::Done);
    }

    #[test]
    fn s5_security_flags_secret_and_reworks_backend() {
        let store = SqliteStore::open_in_memory().expect("open store");
        let dispatcher = ScriptedDispatcher { qa_calls: Mutex::new(0), qa_first_passes: true };
        let code_hosting = NoopCodeHosting;
        let ci_waiter = GreenCiWaiter;

        struct LeakySecretScanner;
        impl orchestrator_core::SecretScanner for LeakySecretScanner {
            fn scan(&self, text: &str) -> Result<Vec<orchestrator_core::SecretFinding>, SecretScanError> {
                if text.contains("sk-ABCDEFGHIJK") {
                    Ok(vec![orchestrator_core::SecretFinding {
                        pattern: "sk_live_key".to_string(),
                        matched: "sk-ABCDEFGHIJK".to_string(),
                    }])
                } else {
                    Ok(Vec::new())
                }
            }
        }
        let scanner = LeakySecretScanner;
        let deps = HandlerDeps {
            dispatcher: &dispatcher,
            code_hosting: &code_hosting,
            ci_waiter: &ci_waiter,
            secret_scanner: &scanner,
            ci_timeout_seconds: 1,
        };
        let sink = NullSink;
        let scheduler = Scheduler::new(&store, 3, &sink);

        let mut task_id = None;
        store
            .with_scope(&mut |scope| {
                let task = scope.create_task("Add widgets", "please add widgets", 3)?;
                task_id = Some(task.id);
                let product = scope.claim_next_pending_run()?.expect("product run pending");
                scope.pass_run(product.id, None)?;
                let backend = scope.insert_run(task.id, Stage::Backend, 1, 3)?;
                scope.insert_artifact(
                    task.id,
                    Some(backend.id),
                    "BackendPlan",
                    json!({ "token": "sk-ABCDEFGHIJK" }),
                )?;
                scope.pass_run(backend.id, None)?;
                scope.insert_run(task.id, Stage::QaBackend, 1, 3)?;
                Ok(())
            })
            .expect("seed past backend");
        let task_id = task_id.expect("task id");

        // QA passes, SECURITY fails on the planted secret.
        scheduler.run_once(&deps).expect("qa tick");
        scheduler.run_once(&deps).expect("security tick");

        let with_children = store.get_task_with_children(task_id).expect("load").expect("task exists");
        let security_fail = with_children
            .runs
            .iter()
            .find(|run| run.stage == Stage::Security)
            .expect("security run exists");
        assert_eq!(security_fail.status, RunStatus::Fail);
        assert_eq!(security_fail.error.as_deref(), Some("Security issues found"));
        let reworked_backend = with_children
            .runs
            .iter()
            .any(|run| run.stage == Stage::Backend && run.status == RunStatus::Pending);
        assert!(reworked_backend);
        let security_artifact = with_children
            .artifacts
            .iter()
            .find(|artifact| artifact.kind == "SecurityReview")
            .expect("security review artifact recorded");
        assert_eq!(security_artifact.data["issues"][0], json!("Potential secret detected"));
    }
}
