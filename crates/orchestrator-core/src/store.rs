// crates/orchestrator-core/src/store.rs
// ============================================================================
// Module: Store Interface
// Description: Backend-agnostic transactional persistence contract for the pipeline.
// Purpose: Define the scoped transactional unit the Scheduler drives every tick.
// Dependencies: serde_json, crate::error, crate::identifiers, crate::model
// ============================================================================

//! ## Overview
//! A [`Store`] hands out a [`StoreScope`] for the duration of one call to
//! [`Store::with_scope`]. The scope's mutations commit as a whole when the
//! closure returns `Ok`, and roll back entirely on `Err` or panic unwind —
//! there is no partial-commit path. This is the "all-or-nothing database
//! transaction" the specification requires around every worker tick.

use serde_json::Value;

use crate::error::StoreError;
use crate::identifiers::RunId;
use crate::identifiers::TaskId;
use crate::model::Artifact;
use crate::model::Decision;
use crate::model::DecisionValue;
use crate::model::Run;
use crate::model::Stage;
use crate::model::Task;
use crate::model::TaskStatus;

/// A `Task` together with all of its children, ordered per the data model
/// (`Artifact`s and `Run`s ascending by `id`, `Decision`s ascending by `id`).
#[derive(Debug, Clone, PartialEq)]
pub struct TaskWithChildren {
    /// The task itself.
    pub task: Task,
    /// All runs for the task, ascending `id`.
    pub runs: Vec<Run>,
    /// All artifacts for the task, ascending `id`.
    pub artifacts: Vec<Artifact>,
    /// All decisions for the task, ascending `id`.
    pub decisions: Vec<Decision>,
}

/// Durable persistence for tasks, runs, artifacts, and decisions.
pub trait Store: Send + Sync {
    /// Runs `body` inside one transactional scope. Commits on `Ok`, rolls
    /// back on `Err`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the scope cannot be opened, or whatever
    /// `body` returns.
    fn with_scope(
        &self,
        body: &mut dyn FnMut(&mut dyn StoreScope) -> Result<(), StoreError>,
    ) -> Result<(), StoreError>;

    /// Loads a task and all of its children.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on connectivity failure.
    fn get_task_with_children(&self, task_id: TaskId) -> Result<Option<TaskWithChildren>, StoreError>;
}

/// The mutating surface available inside one [`Store::with_scope`] call.
///
/// # Invariants
/// - Every method here is part of the same transaction; none of them are
///   individually durable until the enclosing scope commits.
pub trait StoreScope {
    /// Creates a new `Task` in `PENDING` status and seeds its initial
    /// `PRODUCT` run in `PENDING` status with `attempt = 1`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on connectivity failure.
    fn create_task(&mut self, title: &str, raw_request: &str, max_attempts: u32)
    -> Result<Task, StoreError>;

    /// Loads a task by id within the scope.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on connectivity failure.
    fn get_task(&mut self, task_id: TaskId) -> Result<Option<Task>, StoreError>;

    /// Lists all runs for a task, ascending `id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on connectivity failure.
    fn list_runs(&mut self, task_id: TaskId) -> Result<Vec<Run>, StoreError>;

    /// Lists all artifacts for a task, ascending `id` (canonical chronological order).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on connectivity failure.
    fn list_artifacts(&mut self, task_id: TaskId) -> Result<Vec<Artifact>, StoreError>;

    /// Returns the newest decision for a task, if any (`Invariant D1`).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on connectivity failure.
    fn latest_decision(&mut self, task_id: TaskId) -> Result<Option<Decision>, StoreError>;

    /// Selects the `PENDING` run with the smallest `(created_at, id)`,
    /// holding a row-level (or transaction-level) lock on it for the
    /// remainder of the scope so no other worker can claim it concurrently.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on connectivity failure.
    fn claim_next_pending_run(&mut self) -> Result<Option<Run>, StoreError>;

    /// Transitions a claimed run `PENDING -> RUNNING`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on connectivity failure.
    fn mark_run_running(&mut self, run_id: RunId) -> Result<Run, StoreError>;

    /// Transitions a run to terminal `PASS`, recording `result`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on connectivity failure.
    fn pass_run(&mut self, run_id: RunId, result: Option<Value>) -> Result<Run, StoreError>;

    /// Transitions a run to terminal `FAIL`, recording `error`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on connectivity failure.
    fn fail_run(&mut self, run_id: RunId, error: String) -> Result<Run, StoreError>;

    /// Resets a `RUNNING` run back to `PENDING` (the `HUMAN_APPROVAL`
    /// suspension form; `Invariant R2`'s sole exception).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on connectivity failure.
    fn reset_run_to_pending(&mut self, run_id: RunId) -> Result<Run, StoreError>;

    /// Inserts a new `PENDING` run at `stage` with `attempt = 1`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on connectivity failure.
    fn insert_run(
        &mut self,
        task_id: TaskId,
        stage: Stage,
        attempt: u32,
        max_attempts: u32,
    ) -> Result<Run, StoreError>;

    /// Appends an artifact for the task (and optionally its producing run).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on connectivity failure.
    fn insert_artifact(
        &mut self,
        task_id: TaskId,
        run_id: Option<RunId>,
        kind: &str,
        data: Value,
    ) -> Result<Artifact, StoreError>;

    /// Sets a task's status.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on connectivity failure.
    fn set_task_status(&mut self, task_id: TaskId, status: TaskStatus) -> Result<Task, StoreError>;

    /// Appends a human-approval decision for a task.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on connectivity failure.
    fn insert_decision(
        &mut self,
        task_id: TaskId,
        decision: DecisionValue,
        comment: Option<String>,
    ) -> Result<Decision, StoreError>;

    /// Counts how many rework runs have ever been inserted at `stage` for
    /// `task_id` (attempt `1` runs created after the first natural forward
    /// pass through that stage). Used to enforce the rework cap of §4.D.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on connectivity failure.
    fn count_stage_runs(&mut self, task_id: TaskId, stage: Stage) -> Result<u32, StoreError>;
}
