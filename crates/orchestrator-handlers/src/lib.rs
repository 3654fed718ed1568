// crates/orchestrator-handlers/src/lib.rs
// ============================================================================
// Crate: orchestrator-handlers
// Description: One function per pipeline stage, plus the stage -> handler
//              dispatch table.
// Purpose: Translate a claimed Run into artifacts and a terminal (or
//          suspended) Run status, calling into the external adapters for
//          whatever the stage's role actually does.
// Dependencies: orchestrator-core, serde_json, thiserror
// ============================================================================

//! ## Overview
//! Every handler receives `(scope, task, run, deps)` and must, before
//! returning `Ok`, leave the run PASS, FAIL, or (HUMAN_APPROVAL only) back in
//! PENDING — never still RUNNING. A handler that returns `Err` has *not*
//! transitioned the run at all; the caller (the scheduler) is responsible
//! for failing it and spawning a retry, matching the "transient handler
//! failure" row of the error taxonomy.
//!
//! [`HANDLERS`] is a lookup table from [`Stage`] to a boxed closure over the
//! shared signature; the QA/Gate variants close over their extra parameters
//! (target stage, gate predicate + rework stage) at construction time, per
//! the specification's "polymorphism over role handlers" design note.

use std::collections::HashMap;
use std::sync::LazyLock;

use serde_json::Value;
use serde_json::json;

use orchestrator_core::Artifact;
use orchestrator_core::CiOutcome;
use orchestrator_core::CiWaitError;
use orchestrator_core::CodeHostingClient;
use orchestrator_core::CiWaiter;
use orchestrator_core::CodeHostingError;
use orchestrator_core::ContextPack;
use orchestrator_core::DecisionValue;
use orchestrator_core::DispatchError;
use orchestrator_core::GateDecision;
use orchestrator_core::Run;
use orchestrator_core::RoleDispatcher;
use orchestrator_core::SecretScanError;
use orchestrator_core::SecretScanner;
use orchestrator_core::Stage;
use orchestrator_core::StoreError;
use orchestrator_core::StoreScope;
use orchestrator_core::Task;
use orchestrator_core::backend_gate_ready;
use orchestrator_core::docs_gate_ready;
use orchestrator_core::frontend_gate_ready;
use orchestrator_core::spawn_rework_or_fail_task;
use orchestrator_core::spawn_retry_or_fail_task;
use thiserror::Error;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors a handler can raise. A raised error leaves the run untouched; the
/// scheduler fails it and spawns a retry (the "transient handler failure"
/// row of the error taxonomy).
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The store rejected a read or write inside the handler.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    /// The role dispatcher failed or returned a malformed response.
    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
    /// The code-hosting client failed.
    #[error("code hosting error: {0}")]
    CodeHosting(#[from] CodeHostingError),
    /// The CI waiter failed or timed out.
    #[error("ci wait error: {0}")]
    CiWait(#[from] CiWaitError),
    /// The secret scanner failed outright.
    #[error("secret scan error: {0}")]
    SecretScan(#[from] SecretScanError),
    /// No handler is registered for the run's stage.
    #[error("no handler for stage {0}")]
    NoHandler(&'static str),
}

// ============================================================================
// SECTION: Adapter Bundle
// ============================================================================

/// The external collaborators every handler may need. Bundled so the
/// dispatch table's closures share one signature regardless of which
/// adapters a given stage actually touches.
pub struct HandlerDeps<'a> {
    /// Dispatches role calls (Product/Orchestrator/Backend/Frontend/QA/Docs).
    pub dispatcher: &'a dyn RoleDispatcher,
    /// Code-hosting client, used only by MERGE.
    pub code_hosting: &'a dyn CodeHostingClient,
    /// CI waiter, used only by CI_WAIT.
    pub ci_waiter: &'a dyn CiWaiter,
    /// Secret scanner, used only by SECURITY.
    pub secret_scanner: &'a dyn SecretScanner,
    /// Bounded timeout handed to the CI waiter.
    pub ci_timeout_seconds: u64,
}

/// Signature shared by every entry in [`HANDLERS`].
pub type StageHandler =
    dyn Fn(&mut dyn StoreScope, &Task, &Run, &HandlerDeps<'_>) -> Result<(), HandlerError> + Send + Sync;

// ============================================================================
// SECTION: Shared Helpers
// ============================================================================

fn assemble_context(
    scope: &mut dyn StoreScope,
    task: &Task,
    stage: Stage,
) -> Result<ContextPack, StoreError> {
    let artifacts = scope.list_artifacts(task.id)?;
    Ok(ContextPack::assemble(task.id, &task.title, stage, &artifacts))
}

/// Shared shape for PRODUCT/ORCHESTRATE/BACKEND/FRONTEND/DOCS: dispatch a
/// role with the assembled context, record one artifact, PASS unconditionally.
fn handle_plan_stage(
    scope: &mut dyn StoreScope,
    task: &Task,
    run: &Run,
    deps: &HandlerDeps<'_>,
    role: &str,
    dispatch_input: Value,
    artifact_kind: &str,
) -> Result<(), HandlerError> {
    let result = deps.dispatcher.dispatch(role, &dispatch_input)?;
    scope.insert_artifact(task.id, Some(run.id), artifact_kind, result.clone())?;
    scope.pass_run(run.id, Some(result))?;
    Ok(())
}

fn most_recent_artifact(artifacts: &[Artifact]) -> Option<&Artifact> {
    artifacts.last()
}

fn extract_pr_number(data: &Value) -> Option<u64> {
    data.get("pr_number").and_then(Value::as_u64)
}

// ============================================================================
// SECTION: Stage Handlers
// ============================================================================

/// `PRODUCT`: drafts the task specification from the raw request.
///
/// # Errors
///
/// Returns [`HandlerError`] on store or dispatch failure.
pub fn handle_product(
    scope: &mut dyn StoreScope,
    task: &Task,
    run: &Run,
    deps: &HandlerDeps<'_>,
) -> Result<(), HandlerError> {
    handle_plan_stage(
        scope,
        task,
        run,
        deps,
        "Product",
        json!({ "raw_request": task.raw_request }),
        "TaskSpec",
    )
}

/// `ORCHESTRATE`: builds the context pack downstream roles consume.
///
/// # Errors
///
/// Returns [`HandlerError`] on store or dispatch failure.
pub fn handle_orchestrate(
    scope: &mut dyn StoreScope,
    task: &Task,
    run: &Run,
    deps: &HandlerDeps<'_>,
) -> Result<(), HandlerError> {
    let ctx = assemble_context(scope, task, run.stage)?;
    handle_plan_stage(scope, task, run, deps, "Orchestrator", ctx.as_dispatch_input(), "ContextPack")
}

/// `BACKEND`: backend implementation plan.
///
/// # Errors
///
/// Returns [`HandlerError`] on store or dispatch failure.
pub fn handle_backend(
    scope: &mut dyn StoreScope,
    task: &Task,
    run: &Run,
    deps: &HandlerDeps<'_>,
) -> Result<(), HandlerError> {
    let ctx = assemble_context(scope, task, run.stage)?;
    handle_plan_stage(scope, task, run, deps, "Backend", ctx.as_dispatch_input(), "BackendPlan")
}

/// `FRONTEND`: frontend implementation plan.
///
/// # Errors
///
/// Returns [`HandlerError`] on store or dispatch failure.
pub fn handle_frontend(
    scope: &mut dyn StoreScope,
    task: &Task,
    run: &Run,
    deps: &HandlerDeps<'_>,
) -> Result<(), HandlerError> {
    let ctx = assemble_context(scope, task, run.stage)?;
    handle_plan_stage(scope, task, run, deps, "Frontend", ctx.as_dispatch_input(), "FrontendPlan")
}

/// `DOCS`: documentation plan.
///
/// # Errors
///
/// Returns [`HandlerError`] on store or dispatch failure.
pub fn handle_docs(
    scope: &mut dyn StoreScope,
    task: &Task,
    run: &Run,
    deps: &HandlerDeps<'_>,
) -> Result<(), HandlerError> {
    let ctx = assemble_context(scope, task, run.stage)?;
    handle_plan_stage(scope, task, run, deps, "Docs", ctx.as_dispatch_input(), "Docs")
}

/// `QA_BACKEND`/`QA_FRONTEND`: reviews `target_stage`'s latest output. On a
/// failed review, fails the run and spawns a rework of `target_stage`.
///
/// # Errors
///
/// Returns [`HandlerError`] on store or dispatch failure.
pub fn handle_qa(
    scope: &mut dyn StoreScope,
    task: &Task,
    run: &Run,
    deps: &HandlerDeps<'_>,
    target_stage: Stage,
) -> Result<(), HandlerError> {
    let ctx = assemble_context(scope, task, run.stage)?;
    let input = json!({ "context": ctx.as_dispatch_input(), "target_stage": target_stage.tag() });
    let result = deps.dispatcher.dispatch("QA", &input)?;
    let passed = result.get("passed").and_then(Value::as_bool).unwrap_or(true);
    let issues = result.get("issues").cloned().unwrap_or_else(|| json!([]));
    let suggestions = result.get("suggestions").cloned().unwrap_or_else(|| json!([]));
    let review = json!({ "llm": result, "review": { "passed": passed, "issues": issues, "suggestions": suggestions } });
    let artifact_kind = format!("QA-{}", target_stage.tag());
    scope.insert_artifact(task.id, Some(run.id), &artifact_kind, review.clone())?;
    if passed {
        scope.pass_run(run.id, Some(review))?;
    } else {
        scope.fail_run(run.id, "QA reported failures".to_string())?;
        spawn_rework_or_fail_task(scope, task.id, target_stage, run.max_attempts)?;
    }
    Ok(())
}

/// `SECURITY`: scans the most recent artifact's textual summary for secret
/// material. On a finding, fails the run and reworks `BACKEND`.
///
/// # Errors
///
/// Returns [`HandlerError`] on store or scan failure.
pub fn handle_security(
    scope: &mut dyn StoreScope,
    task: &Task,
    run: &Run,
    deps: &HandlerDeps<'_>,
) -> Result<(), HandlerError> {
    let artifacts = scope.list_artifacts(task.id)?;
    let summary = most_recent_artifact(&artifacts).map(|artifact| artifact.data.to_string()).unwrap_or_default();
    let findings = deps.secret_scanner.scan(&summary)?;
    let passed = findings.is_empty();
    let issues: Vec<&str> = findings.iter().map(|_| "Potential secret detected").collect();
    let review = json!({ "passed": passed, "issues": issues, "suggestions": Vec::<String>::new() });
    scope.insert_artifact(task.id, Some(run.id), "SecurityReview", review.clone())?;
    if passed {
        scope.pass_run(run.id, Some(review))?;
    } else {
        scope.fail_run(run.id, "Security issues found".to_string())?;
        spawn_rework_or_fail_task(scope, task.id, Stage::Backend, run.max_attempts)?;
    }
    Ok(())
}

/// `BACKEND_GATE`/`FRONTEND_GATE`/`DOCS_GATE`: evaluates `gate_check` over
/// the task's runs. On failure, fails the run and reworks `rework_stage`.
///
/// # Errors
///
/// Returns [`HandlerError`] on store failure.
pub fn handle_gate(
    scope: &mut dyn StoreScope,
    task: &Task,
    run: &Run,
    gate_check: fn(&[Run]) -> GateDecision,
    rework_stage: Stage,
) -> Result<(), HandlerError> {
    let runs = scope.list_runs(task.id)?;
    let decision = gate_check(&runs);
    let artifact_kind = format!("Gate-{}", decision.gate.tag());
    let data = json!({ "gate": decision.gate.tag(), "passed": decision.passed, "details": decision.details });
    scope.insert_artifact(task.id, Some(run.id), &artifact_kind, data.clone())?;
    if decision.passed {
        scope.pass_run(run.id, Some(data))?;
    } else {
        scope.fail_run(run.id, decision.details)?;
        spawn_rework_or_fail_task(scope, task.id, rework_stage, run.max_attempts)?;
    }
    Ok(())
}

/// `CI_WAIT`: polls CI for the PR named by the most recently created
/// artifact, if any. Absent a PR, treated as green. On red or timeout,
/// fails the run and spawns a retry of `CI_WAIT` (not a rework).
///
/// # Errors
///
/// Returns [`HandlerError`] on store or CI-waiter failure.
pub fn handle_ci_wait(
    scope: &mut dyn StoreScope,
    task: &Task,
    run: &Run,
    deps: &HandlerDeps<'_>,
) -> Result<(), HandlerError> {
    let artifacts = scope.list_artifacts(task.id)?;
    let pr_number = most_recent_artifact(&artifacts).and_then(|artifact| extract_pr_number(&artifact.data));
    let outcome = match pr_number {
        Some(pr_number) => deps.ci_waiter.wait_for_checks(pr_number, deps.ci_timeout_seconds)?,
        None => CiOutcome::Passed,
    };
    match outcome {
        CiOutcome::Passed => {
            scope.pass_run(run.id, Some(json!({ "checks": "green" })))?;
        }
        CiOutcome::Failed => {
            scope.fail_run(run.id, "CI checks failed or timeout".to_string())?;
            spawn_retry_or_fail_task(scope, task.id, run)?;
        }
    }
    Ok(())
}

/// `HUMAN_APPROVAL`: consumes the newest decision for the task. With none
/// recorded, suspends the run back to PENDING. On REJECT, fails the run and
/// spawns a retry (so a later APPROVE can still land within `max_attempts`).
///
/// # Errors
///
/// Returns [`HandlerError`] on store failure.
pub fn handle_human_approval(
    scope: &mut dyn StoreScope,
    task: &Task,
    run: &Run,
    _deps: &HandlerDeps<'_>,
) -> Result<(), HandlerError> {
    let Some(decision) = scope.latest_decision(task.id)? else {
        scope.reset_run_to_pending(run.id)?;
        return Ok(());
    };
    match decision.decision {
        DecisionValue::Approve => {
            let result = json!({ "decision": "APPROVE", "comment": decision.comment });
            scope.pass_run(run.id, Some(result))?;
        }
        DecisionValue::Reject => {
            scope.fail_run(run.id, decision.comment.unwrap_or_else(|| "Rejected".to_string()))?;
            spawn_retry_or_fail_task(scope, task.id, run)?;
        }
    }
    Ok(())
}

/// `MERGE`: posts a merge notice on the task's pull request (located by
/// scanning artifacts newest-first for a `pr_number`) and marks the task
/// `DONE`.
///
/// # Errors
///
/// Returns [`HandlerError`] on store or code-hosting failure.
pub fn handle_merge(
    scope: &mut dyn StoreScope,
    task: &Task,
    run: &Run,
    deps: &HandlerDeps<'_>,
) -> Result<(), HandlerError> {
    let artifacts = scope.list_artifacts(task.id)?;
    let pr_number = artifacts.iter().rev().find_map(|artifact| extract_pr_number(&artifact.data));
    if let Some(pr_number) = pr_number {
        // A code-hosting client with no credentials configured degrades to
        // `NotConfigured` rather than failing the merge outright, mirroring
        // the original `github_client.py`'s "log and skip" behavior.
        match deps.code_hosting.comment_pull_request(pr_number, "Merging after approval") {
            Ok(()) | Err(CodeHostingError::NotConfigured) => {}
            Err(err) => return Err(err.into()),
        }
    }
    let result = json!({ "merged": true, "pr_number": pr_number });
    scope.pass_run(run.id, Some(result))?;
    scope.set_task_status(task.id, orchestrator_core::TaskStatus::Done)?;
    Ok(())
}

// ============================================================================
// SECTION: Dispatch Table
// ============================================================================

/// Stage -> handler lookup table. QA/Gate entries are closures pre-bound
/// with their extra parameter at construction time.
pub static HANDLERS: LazyLock<HashMap<Stage, Box<StageHandler>>> = LazyLock::new(|| {
    let mut table: HashMap<Stage, Box<StageHandler>> = HashMap::new();
    table.insert(Stage::Product, Box::new(handle_product));
    table.insert(Stage::Orchestrate, Box::new(handle_orchestrate));
    table.insert(Stage::Backend, Box::new(handle_backend));
    table.insert(
        Stage::QaBackend,
        Box::new(|scope, task, run, deps| handle_qa(scope, task, run, deps, Stage::Backend)),
    );
    table.insert(Stage::Security, Box::new(handle_security));
    table.insert(
        Stage::BackendGate,
        Box::new(|scope, task, run, _deps| handle_gate(scope, task, run, backend_gate_ready, Stage::Backend)),
    );
    table.insert(Stage::Frontend, Box::new(handle_frontend));
    table.insert(
        Stage::QaFrontend,
        Box::new(|scope, task, run, deps| handle_qa(scope, task, run, deps, Stage::Frontend)),
    );
    table.insert(
        Stage::FrontendGate,
        Box::new(|scope, task, run, _deps| handle_gate(scope, task, run, frontend_gate_ready, Stage::Frontend)),
    );
    table.insert(Stage::Docs, Box::new(handle_docs));
    table.insert(
        Stage::DocsGate,
        Box::new(|scope, task, run, _deps| handle_gate(scope, task, run, docs_gate_ready, Stage::Docs)),
    );
    table.insert(Stage::CiWait, Box::new(handle_ci_wait));
    table.insert(Stage::HumanApproval, Box::new(handle_human_approval));
    table.insert(Stage::Merge, Box::new(handle_merge));
    table
});

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_core::Store as _;
    use orchestrator_store_sqlite::SqliteStore;

    #[test]
    fn every_registered_stage_has_exactly_one_handler() {
        assert_eq!(HANDLERS.len(), orchestrator_core::STAGE_ORDER.len());
        for stage in orchestrator_core::STAGE_ORDER {
            assert!(HANDLERS.contains_key(&stage), "missing handler for {stage:?}");
        }
    }

    struct StubDispatcher {
        passed: bool,
    }

    impl RoleDispatcher for StubDispatcher {
        fn dispatch(&self, role: &str, input: &Value) -> Result<Value, DispatchError> {
            if role == "QA" {
                Ok(json!({ "passed": self.passed, "issues": ["needs work"], "suggestions": [] }))
            } else {
                Ok(json!({ "role": role, "received": input }))
            }
        }
    }

    struct StubCodeHosting;
    impl CodeHostingClient for StubCodeHosting {
        fn ensure_pull_request(&self, _: &str, _: &str, _: &str) -> Result<orchestrator_core::PullRequestRef, CodeHostingError> {
            Err(CodeHostingError::NotConfigured)
        }
        fn merge_pull_request(&self, _: u64) -> Result<(), CodeHostingError> {
            Ok(())
        }
        fn comment_pull_request(&self, _: u64, _: &str) -> Result<(), CodeHostingError> {
            Ok(())
        }
    }

    struct StubCiWaiter {
        outcome: CiOutcome,
    }
    impl CiWaiter for StubCiWaiter {
        fn wait_for_checks(&self, _: u64, _: u64) -> Result<CiOutcome, CiWaitError> {
            Ok(self.outcome)
        }
    }

    struct StubSecretScanner {
        findings: Vec<orchestrator_core::SecretFinding>,
    }
    impl SecretScanner for StubSecretScanner {
        fn scan(&self, _: &str) -> Result<Vec<orchestrator_core::SecretFinding>, SecretScanError> {
            Ok(self.findings.clone())
        }
    }

    fn deps(passed: bool, ci: CiOutcome, findings: Vec<orchestrator_core::SecretFinding>) -> HandlerDeps<'static> {
        HandlerDeps {
            dispatcher: Box::leak(Box::new(StubDispatcher { passed })),
            code_hosting: Box::leak(Box::new(StubCodeHosting)),
            ci_waiter: Box::leak(Box::new(StubCiWaiter { outcome: ci })),
            secret_scanner: Box::leak(Box::new(StubSecretScanner { findings })),
            ci_timeout_seconds: 1,
        }
    }

    #[test]
    fn qa_failure_fails_run_and_reworks_target_stage() {
        let store = SqliteStore::open_in_memory().expect("open store");
        let deps = deps(false, CiOutcome::Passed, Vec::new());
        store
            .with_scope(&mut |scope| {
                let task = scope.create_task("T", "r", 3)?;
                let product = scope.claim_next_pending_run()?.expect("product run");
                scope.pass_run(product.id, None)?;
                let backend = scope.insert_run(task.id, Stage::Backend, 1, 3)?;
                scope.pass_run(backend.id, None)?;
                let qa_run = scope.insert_run(task.id, Stage::QaBackend, 1, 3)?;
                handle_qa(scope, &task, &qa_run, &deps, Stage::Backend).expect("handler runs");
                let runs = scope.list_runs(task.id)?;
                let qa = orchestrator_core::latest_run_for_stage(&runs, Stage::QaBackend).expect("qa run");
                assert_eq!(qa.status, orchestrator_core::RunStatus::Fail);
                let reworked = orchestrator_core::latest_run_for_stage(&runs, Stage::Backend).expect("backend run");
                assert_eq!(reworked.attempt, 1);
                assert_eq!(reworked.status, orchestrator_core::RunStatus::Pending);
                Ok(())
            })
            .expect("scope commits");
    }

    #[test]
    fn security_failure_reworks_backend() {
        let store = SqliteStore::open_in_memory().expect("open store");
        let finding = orchestrator_core::SecretFinding { pattern: "sk_live_key".to_string(), matched: "sk-ABCDEFGHIJK".to_string() };
        let deps = deps(true, CiOutcome::Passed, vec![finding]);
        store
            .with_scope(&mut |scope| {
                let task = scope.create_task("T", "r", 3)?;
                let product = scope.claim_next_pending_run()?.expect("product run");
                scope.pass_run(product.id, None)?;
                let security_run = scope.insert_run(task.id, Stage::Security, 1, 3)?;
                handle_security(scope, &task, &security_run, &deps).expect("handler runs");
                let runs = scope.list_runs(task.id)?;
                let security = orchestrator_core::latest_run_for_stage(&runs, Stage::Security).expect("security run");
                assert_eq!(security.status, orchestrator_core::RunStatus::Fail);
                let reworked = orchestrator_core::latest_run_for_stage(&runs, Stage::Backend).expect("backend rework run");
                assert_eq!(reworked.status, orchestrator_core::RunStatus::Pending);
                Ok(())
            })
            .expect("scope commits");
    }

    #[test]
    fn human_approval_suspends_back_to_pending_without_a_decision() {
        let store = SqliteStore::open_in_memory().expect("open store");
        let deps = deps(true, CiOutcome::Passed, Vec::new());
        store
            .with_scope(&mut |scope| {
                let task = scope.create_task("T", "r", 3)?;
                let run = scope.insert_run(task.id, Stage::HumanApproval, 1, 3)?;
                handle_human_approval(scope, &task, &run, &deps).expect("handler runs");
                let runs = scope.list_runs(task.id)?;
                let latest = orchestrator_core::latest_run_for_stage(&runs, Stage::HumanApproval).expect("run");
                assert_eq!(latest.status, orchestrator_core::RunStatus::Pending);
                Ok(())
            })
            .expect("scope commits");
    }

    #[test]
    fn merge_sets_task_done_and_records_pr_number_when_present() {
        let store = SqliteStore::open_in_memory().expect("open store");
        let deps = deps(true, CiOutcome::Passed, Vec::new());
        store
            .with_scope(&mut |scope| {
                let task = scope.create_task("T", "r", 3)?;
                scope.insert_artifact(task.id, None, "PullRequest", json!({ "pr_number": 42 }))?;
                let run = scope.insert_run(task.id, Stage::Merge, 1, 3)?;
                handle_merge(scope, &task, &run, &deps).expect("handler runs");
                let updated = scope.get_task(task.id)?.expect("task exists");
                assert_eq!(updated.status, orchestrator_core::TaskStatus::Done);
                Ok(())
            })
            .expect("scope commits");
    }
}
