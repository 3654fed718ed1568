// crates/orchestrator-core/src/rework.rs
// ============================================================================
// Module: Retry and Rework
// Description: Spawns the next Run when a stage's own attempt is exhausted
//              (retry) or when a downstream gate/QA/security check sends
//              work back to an earlier stage (rework).
// Purpose: Give stage handlers and the Scheduler a single, shared
//          implementation of the two distinct failure-recovery operations
//          named in the specification's open question.
// Dependencies: crate::error, crate::identifiers, crate::model, crate::store
// ============================================================================

//! ## Overview
//! `spawn_retry_or_fail_task` and `spawn_rework_or_fail_task` are deliberately
//! kept as two separate functions: a retry re-enqueues the *same* stage
//! after its own attempt fails, while a rework enqueues an *earlier* stage
//! after a downstream quality check rejects the work. Both a handler (QA,
//! Security, a Gate, CI_WAIT, HUMAN_APPROVAL) and the Scheduler (no-handler,
//! handler panic/error, or the generic retry path) call into these, so they
//! live in `orchestrator-core` rather than in any one handler or the worker
//! crate, avoiding a dependency cycle between the two.

use crate::error::StoreError;
use crate::identifiers::TaskId;
use crate::model::Run;
use crate::model::Stage;
use crate::model::TaskStatus;
use crate::store::StoreScope;

/// Re-enqueues `run`'s own stage at the next attempt, or fails the task if
/// the attempt budget is exhausted.
///
/// # Errors
///
/// Returns [`StoreError`] on connectivity failure.
pub fn spawn_retry_or_fail_task(
    scope: &mut dyn StoreScope,
    task_id: TaskId,
    run: &Run,
) -> Result<(), StoreError> {
    if run.attempt < run.max_attempts {
        scope.insert_run(task_id, run.stage, run.attempt + 1, run.max_attempts)?;
    } else {
        scope.set_task_status(task_id, TaskStatus::Failed)?;
    }
    Ok(())
}

/// Enqueues a fresh attempt at `target_stage`, or fails the task if the
/// rework cap for that stage has been exceeded.
///
/// The cap is "`max_attempts` reworks targeting a given earlier stage"
/// (§4.D): every Run ever created at `target_stage` — the original forward
/// pass plus every rework — counts against it, via
/// [`StoreScope::count_stage_runs`].
///
/// # Errors
///
/// Returns [`StoreError`] on connectivity failure.
pub fn spawn_rework_or_fail_task(
    scope: &mut dyn StoreScope,
    task_id: TaskId,
    target_stage: Stage,
    max_attempts: u32,
) -> Result<(), StoreError> {
    let prior_runs = scope.count_stage_runs(task_id, target_stage)?;
    if prior_runs < max_attempts {
        scope.insert_run(task_id, target_stage, 1, max_attempts)?;
    } else {
        scope.set_task_status(task_id, TaskStatus::Failed)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifiers::RunId;
    use crate::model::Artifact;
    use crate::model::Decision;
    use crate::model::DecisionValue;
    use crate::model::RunStatus;
    use crate::model::Task;
    use crate::time::Timestamp;
    use serde_json::Value;

    #[derive(Default)]
    struct FakeScope {
        inserted_runs: Vec<(Stage, u32)>,
        status: Option<TaskStatus>,
        stage_run_count: u32,
    }

    impl StoreScope for FakeScope {
        fn create_task(&mut self, _: &str, _: &str, _: u32) -> Result<Task, StoreError> {
            unimplemented!("not exercised by rework tests")
        }
        fn get_task(&mut self, _: TaskId) -> Result<Option<Task>, StoreError> {
            unimplemented!("not exercised by rework tests")
        }
        fn list_runs(&mut self, _: TaskId) -> Result<Vec<Run>, StoreError> {
            unimplemented!("not exercised by rework tests")
        }
        fn list_artifacts(&mut self, _: TaskId) -> Result<Vec<Artifact>, StoreError> {
            unimplemented!("not exercised by rework tests")
        }
        fn latest_decision(&mut self, _: TaskId) -> Result<Option<Decision>, StoreError> {
            unimplemented!("not exercised by rework tests")
        }
        fn claim_next_pending_run(&mut self) -> Result<Option<Run>, StoreError> {
            unimplemented!("not exercised by rework tests")
        }
        fn mark_run_running(&mut self, _: RunId) -> Result<Run, StoreError> {
            unimplemented!("not exercised by rework tests")
        }
        fn pass_run(&mut self, _: RunId, _: Option<Value>) -> Result<Run, StoreError> {
            unimplemented!("not exercised by rework tests")
        }
        fn fail_run(&mut self, _: RunId, _: String) -> Result<Run, StoreError> {
            unimplemented!("not exercised by rework tests")
        }
        fn reset_run_to_pending(&mut self, _: RunId) -> Result<Run, StoreError> {
            unimplemented!("not exercised by rework tests")
        }
        fn insert_run(
            &mut self,
            task_id: TaskId,
            stage: Stage,
            attempt: u32,
            max_attempts: u32,
        ) -> Result<Run, StoreError> {
            self.inserted_runs.push((stage, attempt));
            Ok(Run {
                id: RunId::from_raw(1).expect("1 is positive"),
                task_id,
                stage,
                status: RunStatus::Pending,
                attempt,
                max_attempts,
                payload: None,
                result: None,
                error: None,
                created_at: Timestamp(0),
                updated_at: Timestamp(0),
            })
        }
        fn insert_artifact(
            &mut self,
            _: TaskId,
            _: Option<RunId>,
            _: &str,
            _: Value,
        ) -> Result<Artifact, StoreError> {
            unimplemented!("not exercised by rework tests")
        }
        fn set_task_status(&mut self, task_id: TaskId, status: TaskStatus) -> Result<Task, StoreError> {
            self.status = Some(status);
            Ok(Task {
                id: task_id,
                title: String::new(),
                raw_request: String::new(),
                status,
                created_at: Timestamp(0),
                updated_at: Timestamp(0),
            })
        }
        fn insert_decision(
            &mut self,
            _: TaskId,
            _: DecisionValue,
            _: Option<String>,
        ) -> Result<Decision, StoreError> {
            unimplemented!("not exercised by rework tests")
        }
        fn count_stage_runs(&mut self, _: TaskId, _: Stage) -> Result<u32, StoreError> {
            Ok(self.stage_run_count)
        }
    }

    fn run(stage: Stage, attempt: u32, max_attempts: u32) -> Run {
        Run {
            id: RunId::from_raw(7).expect("7 is positive"),
            task_id: TaskId::from_raw(1).expect("1 is positive"),
            stage,
            status: RunStatus::Fail,
            attempt,
            max_attempts,
            payload: None,
            result: None,
            error: None,
            created_at: Timestamp(0),
            updated_at: Timestamp(0),
        }
    }

    #[test]
    fn retry_inserts_next_attempt_when_budget_remains() {
        let mut scope = FakeScope::default();
        let task_id = TaskId::from_raw(1).expect("1 is positive");
        let r = run(Stage::Backend, 1, 3);
        spawn_retry_or_fail_task(&mut scope, task_id, &r).expect("spawn retry");
        assert_eq!(scope.inserted_runs, vec![(Stage::Backend, 2)]);
        assert_eq!(scope.status, None);
    }

    #[test]
    fn retry_fails_task_when_budget_exhausted() {
        let mut scope = FakeScope::default();
        let task_id = TaskId::from_raw(1).expect("1 is positive");
        let r = run(Stage::Backend, 3, 3);
        spawn_retry_or_fail_task(&mut scope, task_id, &r).expect("spawn retry");
        assert!(scope.inserted_runs.is_empty());
        assert_eq!(scope.status, Some(TaskStatus::Failed));
    }

    #[test]
    fn rework_inserts_fresh_attempt_at_target_stage_when_cap_not_reached() {
        let mut scope = FakeScope { stage_run_count: 1, ..FakeScope::default() };
        let task_id = TaskId::from_raw(1).expect("1 is positive");
        spawn_rework_or_fail_task(&mut scope, task_id, Stage::Backend, 3).expect("spawn rework");
        assert_eq!(scope.inserted_runs, vec![(Stage::Backend, 1)]);
    }

    #[test]
    fn rework_fails_task_when_cap_reached() {
        let mut scope = FakeScope { stage_run_count: 3, ..FakeScope::default() };
        let task_id = TaskId::from_raw(1).expect("1 is positive");
        spawn_rework_or_fail_task(&mut scope, task_id, Stage::Backend, 3).expect("spawn rework");
        assert!(scope.inserted_runs.is_empty());
        assert_eq!(scope.status, Some(TaskStatus::Failed));
    }
}
