// crates/orchestrator-core/src/model.rs
// ============================================================================
// Module: Pipeline Data Model
// Description: Task, Run, Artifact, and Decision records and their status enums.
// Purpose: Capture the durable state of one change request moving through the pipeline.
// Dependencies: serde, crate::identifiers, crate::time
// ============================================================================

//! ## Overview
//! Four entities make up the durable state of the pipeline: a [`Task`] owns
//! an ordered set of [`Run`]s (one attempt at one [`Stage`]), an append-only
//! log of [`Artifact`]s, and a log of human [`Decision`]s.
//!
//! # Invariants
//! - `Run` status transitions follow `PENDING -> RUNNING -> {PASS, FAIL}`;
//!   the sole exception is the `HUMAN_APPROVAL` handler, which may reset a
//!   `RUNNING` run back to `PENDING` within the same tick when no decision
//!   has been recorded yet.
//! - For any `(task_id, stage, attempt)` triple, at most one `Run` exists.
//! - `Artifact`s are append-only; they are never updated, only created or
//!   cascade-deleted with their `Task`.
//! - Only the newest `Decision` for a `Task` is authoritative.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::identifiers::ArtifactId;
use crate::identifiers::DecisionId;
use crate::identifiers::RunId;
use crate::identifiers::TaskId;
use crate::time::Timestamp;

// ============================================================================
// SECTION: Stage
// ============================================================================

/// The fixed, ordered pipeline stage registry.
///
/// # Invariants
/// - Variants are stable for serialization and storage; renaming a variant
///   is a breaking schema change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    /// Product analysis: drafts the task specification from the raw request.
    Product,
    /// Builds the per-stage context pack for downstream roles.
    Orchestrate,
    /// Backend implementation plan.
    Backend,
    /// QA review targeting the backend stage.
    QaBackend,
    /// Secret-pattern security review.
    Security,
    /// Gate: backend + QA backend + security must all PASS.
    BackendGate,
    /// Frontend implementation plan.
    Frontend,
    /// QA review targeting the frontend stage.
    QaFrontend,
    /// Gate: frontend + QA frontend must both PASS.
    FrontendGate,
    /// Documentation plan.
    Docs,
    /// Gate: at least one docs run must PASS.
    DocsGate,
    /// Waits for external CI checks on the most recently opened PR.
    CiWait,
    /// Suspends for a human approval decision.
    HumanApproval,
    /// Posts the merge and marks the task DONE.
    Merge,
}

/// The canonical stage order. Index position is the traversal order; see
/// [`next_stage_after`].
pub const STAGE_ORDER: [Stage; 14] = [
    Stage::Product,
    Stage::Orchestrate,
    Stage::Backend,
    Stage::QaBackend,
    Stage::Security,
    Stage::BackendGate,
    Stage::Frontend,
    Stage::QaFrontend,
    Stage::FrontendGate,
    Stage::Docs,
    Stage::DocsGate,
    Stage::CiWait,
    Stage::HumanApproval,
    Stage::Merge,
];

/// Returns the stage that follows `stage` in the canonical order, or `None`
/// when `stage` is the terminal stage (`MERGE`).
#[must_use]
pub fn next_stage_after(stage: Stage) -> Option<Stage> {
    let index = STAGE_ORDER.iter().position(|candidate| *candidate == stage)?;
    STAGE_ORDER.get(index + 1).copied()
}

impl Stage {
    /// Returns a stable, human-readable tag for the stage (used in artifact
    /// kinds such as `Gate-BACKEND_GATE`).
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Product => "PRODUCT",
            Self::Orchestrate => "ORCHESTRATE",
            Self::Backend => "BACKEND",
            Self::QaBackend => "QA_BACKEND",
            Self::Security => "SECURITY",
            Self::BackendGate => "BACKEND_GATE",
            Self::Frontend => "FRONTEND",
            Self::QaFrontend => "QA_FRONTEND",
            Self::FrontendGate => "FRONTEND_GATE",
            Self::Docs => "DOCS",
            Self::DocsGate => "DOCS_GATE",
            Self::CiWait => "CI_WAIT",
            Self::HumanApproval => "HUMAN_APPROVAL",
            Self::Merge => "MERGE",
        }
    }

    /// Parses the tag produced by [`Stage::tag`], or `None` if unrecognized.
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        STAGE_ORDER.iter().copied().find(|stage| stage.tag() == tag)
    }
}

// ============================================================================
// SECTION: Status Enums
// ============================================================================

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Newly created, no run has ever advanced it.
    Pending,
    /// At least one run has been attempted and the task has not failed or finished.
    Running,
    /// Retry budget exhausted, or a rejection with no further attempts.
    Failed,
    /// Merge run passed; terminal success.
    Done,
}

impl TaskStatus {
    /// Returns whether this status is terminal (`FAILED` or `DONE`).
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Done)
    }

    /// Stable storage tag.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Failed => "FAILED",
            Self::Done => "DONE",
        }
    }

    /// Parses the tag produced by [`TaskStatus::tag`].
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "FAILED" => Some(Self::Failed),
            "DONE" => Some(Self::Done),
            _ => None,
        }
    }
}

/// Run lifecycle status.
///
/// # Invariants
/// - Transitions follow `Pending -> Running -> {Pass, Fail}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Waiting to be claimed by a worker.
    Pending,
    /// Claimed by a worker; a handler is executing.
    Running,
    /// Terminal success.
    Pass,
    /// Terminal failure.
    Fail,
}

impl RunStatus {
    /// Returns whether this status is terminal (`Pass` or `Fail`).
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Pass | Self::Fail)
    }

    /// Stable storage tag.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
        }
    }

    /// Parses the tag produced by [`RunStatus::tag`].
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "PASS" => Some(Self::Pass),
            "FAIL" => Some(Self::Fail),
            _ => None,
        }
    }
}

/// Decision kind. Only `HumanApproval` exists today; kept as an enum so the
/// decision log can carry other kinds without a schema migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionKind {
    /// A human adjudication of the pending `HUMAN_APPROVAL` run.
    HumanApproval,
}

impl DecisionKind {
    /// Stable storage tag.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::HumanApproval => "HUMAN_APPROVAL",
        }
    }

    /// Parses the tag produced by [`DecisionKind::tag`].
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "HUMAN_APPROVAL" => Some(Self::HumanApproval),
            _ => None,
        }
    }
}

/// Decision value recorded by a human adjudication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionValue {
    /// Approves the pending task.
    Approve,
    /// Rejects the pending task.
    Reject,
}

impl DecisionValue {
    /// Stable storage tag.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Approve => "APPROVE",
            Self::Reject => "REJECT",
        }
    }

    /// Parses the tag produced by [`DecisionValue::tag`].
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "APPROVE" => Some(Self::Approve),
            "REJECT" => Some(Self::Reject),
            _ => None,
        }
    }
}

// ============================================================================
// SECTION: Entities
// ============================================================================

/// A user-submitted change request moving through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Task identifier.
    pub id: TaskId,
    /// Short human-readable title.
    pub title: String,
    /// Original free-form change request text.
    pub raw_request: String,
    /// Current task status.
    pub status: TaskStatus,
    /// Creation timestamp.
    pub created_at: Timestamp,
    /// Last-updated timestamp.
    pub updated_at: Timestamp,
}

/// One attempt at one stage of one task.
///
/// # Invariants
/// - `attempt >= 1` and `max_attempts >= 1`.
/// - A `Pass`/`Fail` run is immutable; see `Invariant R3`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Run identifier.
    pub id: RunId,
    /// Owning task identifier.
    pub task_id: TaskId,
    /// Stage this run attempts.
    pub stage: Stage,
    /// Current run status.
    pub status: RunStatus,
    /// 1-based attempt counter for this stage.
    pub attempt: u32,
    /// Maximum attempts allowed for this stage before the task fails.
    pub max_attempts: u32,
    /// Optional input payload recorded when the run was created.
    pub payload: Option<Value>,
    /// Optional structured result recorded by the handler on PASS.
    pub result: Option<Value>,
    /// Optional failure description recorded by the handler on FAIL.
    pub error: Option<String>,
    /// Creation timestamp.
    pub created_at: Timestamp,
    /// Last-updated timestamp.
    pub updated_at: Timestamp,
}

/// An immutable, append-only record produced by a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Artifact identifier.
    pub id: ArtifactId,
    /// Owning task identifier.
    pub task_id: TaskId,
    /// Producing run identifier, if any.
    pub run_id: Option<RunId>,
    /// Free-form artifact tag (e.g. `TaskSpec`, `Gate-BACKEND_GATE`).
    pub kind: String,
    /// Arbitrary structured payload.
    pub data: Value,
    /// Creation timestamp.
    pub created_at: Timestamp,
}

/// A human adjudication of a task's pending `HUMAN_APPROVAL` run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// Decision identifier.
    pub id: DecisionId,
    /// Owning task identifier.
    pub task_id: TaskId,
    /// Decision kind (always `HumanApproval` today).
    pub kind: DecisionKind,
    /// Decision value.
    pub decision: DecisionValue,
    /// Optional free-form comment.
    pub comment: Option<String>,
    /// Creation timestamp.
    pub created_at: Timestamp,
}

// ============================================================================
// SECTION: Gate Predicates
// ============================================================================

/// Returns the latest (highest-attempt) run for `stage` on this task, if any.
#[must_use]
pub fn latest_run_for_stage(runs: &[Run], stage: Stage) -> Option<&Run> {
    runs.iter().filter(|run| run.stage == stage).max_by_key(|run| run.attempt)
}

/// Outcome of evaluating a gate predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateDecision {
    /// The gate stage that was evaluated.
    pub gate: Stage,
    /// Whether the gate passed.
    pub passed: bool,
    /// Human-readable detail, used as the `Run.error` on failure.
    pub details: String,
}

/// `BACKEND_GATE` passes iff the latest `BACKEND`, `QA_BACKEND`, and
/// `SECURITY` runs on the task all have status `PASS`.
#[must_use]
pub fn backend_gate_ready(runs: &[Run]) -> GateDecision {
    let stages = [Stage::Backend, Stage::QaBackend, Stage::Security];
    let passed = stages
        .iter()
        .all(|stage| latest_run_for_stage(runs, *stage).is_some_and(|run| run.status == RunStatus::Pass));
    let details = if passed {
        "Backend, QA, Security all passed".to_string()
    } else {
        "Awaiting backend/QA/Security pass".to_string()
    };
    GateDecision { gate: Stage::BackendGate, passed, details }
}

/// `FRONTEND_GATE` passes iff the latest `FRONTEND` and `QA_FRONTEND` runs
/// on the task both have status `PASS`.
#[must_use]
pub fn frontend_gate_ready(runs: &[Run]) -> GateDecision {
    let stages = [Stage::Frontend, Stage::QaFrontend];
    let passed = stages
        .iter()
        .all(|stage| latest_run_for_stage(runs, *stage).is_some_and(|run| run.status == RunStatus::Pass));
    let details =
        if passed { "Frontend and QA passed".to_string() } else { "Awaiting frontend/QA pass".to_string() };
    GateDecision { gate: Stage::FrontendGate, passed, details }
}

/// `DOCS_GATE` passes iff any `DOCS` run on the task has status `PASS`.
#[must_use]
pub fn docs_gate_ready(runs: &[Run]) -> GateDecision {
    let passed = runs.iter().any(|run| run.stage == Stage::Docs && run.status == RunStatus::Pass);
    let details = if passed { "Docs delivered".to_string() } else { "Docs pending".to_string() };
    GateDecision { gate: Stage::DocsGate, passed, details }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(stage: Stage, attempt: u32, status: RunStatus) -> Run {
        Run {
            id: RunId::from_raw(1).expect("id"),
            task_id: TaskId::from_raw(1).expect("id"),
            stage,
            status,
            attempt,
            max_attempts: 3,
            payload: None,
            result: None,
            error: None,
            created_at: Timestamp(0),
            updated_at: Timestamp(0),
        }
    }

    #[test]
    fn stage_order_is_linear_and_terminal_at_merge() {
        assert_eq!(next_stage_after(Stage::Product), Some(Stage::Orchestrate));
        assert_eq!(next_stage_after(Stage::Merge), None);
    }

    #[test]
    fn latest_run_picks_highest_attempt() {
        let runs =
            vec![run(Stage::Backend, 1, RunStatus::Fail), run(Stage::Backend, 2, RunStatus::Pass)];
        let latest = latest_run_for_stage(&runs, Stage::Backend).expect("latest run");
        assert_eq!(latest.attempt, 2);
        assert_eq!(latest.status, RunStatus::Pass);
    }

    #[test]
    fn backend_gate_requires_all_three_stages_passing() {
        let runs = vec![
            run(Stage::Backend, 1, RunStatus::Pass),
            run(Stage::QaBackend, 1, RunStatus::Pass),
            run(Stage::Security, 1, RunStatus::Fail),
        ];
        assert!(!backend_gate_ready(&runs).passed);

        let runs = vec![
            run(Stage::Backend, 1, RunStatus::Pass),
            run(Stage::QaBackend, 1, RunStatus::Pass),
            run(Stage::Security, 1, RunStatus::Pass),
        ];
        assert!(backend_gate_ready(&runs).passed);
    }

    #[test]
    fn docs_gate_only_needs_one_passing_run() {
        let runs = vec![run(Stage::Docs, 1, RunStatus::Fail), run(Stage::Docs, 2, RunStatus::Pass)];
        assert!(docs_gate_ready(&runs).passed);
    }

    #[test]
    fn docs_gate_counts_any_pass_not_only_the_latest_attempt() {
        // DOCS_GATE is defined over "any DOCS Run", unlike BACKEND_GATE/FRONTEND_GATE
        // which only look at the latest attempt per stage.
        let runs = vec![run(Stage::Docs, 1, RunStatus::Pass), run(Stage::Docs, 2, RunStatus::Fail)];
        assert!(docs_gate_ready(&runs).passed);
    }
}
