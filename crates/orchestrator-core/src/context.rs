// crates/orchestrator-core/src/context.rs
// ============================================================================
// Module: Context Assembler
// Description: Builds the read-only ContextPack handlers consume for a given stage.
// Purpose: Give every handler a consistent view of prior artifacts without mutating state.
// Dependencies: serde_json, crate::model
// ============================================================================

//! ## Overview
//! [`ContextPack`] is a read model: it never mutates `Task`/`Run`/`Artifact`
//! state, it only projects it for a handler invocation.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;

use crate::identifiers::RunId;
use crate::identifiers::TaskId;
use crate::model::Artifact;
use crate::model::Stage;

/// The task specification produced by the `PRODUCT` stage, or a default
/// derived from the task title when no `TaskSpec` artifact exists yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Goal statement for the change request.
    pub goal: String,
    /// Acceptance criteria, if the `PRODUCT` stage has run.
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Constraints called out by the `PRODUCT` stage.
    #[serde(default)]
    pub constraints: Vec<String>,
}

impl TaskSpec {
    /// Builds the default spec used before a `TaskSpec` artifact exists.
    #[must_use]
    pub fn default_for_title(title: &str) -> Self {
        Self { goal: title.to_string(), acceptance_criteria: Vec::new(), constraints: Vec::new() }
    }
}

/// One artifact projected into a [`ContextPack`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextArtifact {
    /// Artifact kind tag.
    pub kind: String,
    /// Artifact payload.
    pub data: Value,
    /// Producing run identifier, if any.
    pub run_id: Option<RunId>,
}

/// The read-only context a handler receives for its stage invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextPack {
    /// Owning task identifier.
    pub task_id: TaskId,
    /// Task title.
    pub title: String,
    /// Stage this context was assembled for.
    pub stage: Stage,
    /// The task's specification (from `TaskSpec`, or a title-derived default).
    pub task_spec: TaskSpec,
    /// All artifacts for the task, ascending `id` order.
    pub artifacts: Vec<ContextArtifact>,
}

impl ContextPack {
    /// Assembles a [`ContextPack`] for `stage` from the task's prior
    /// artifacts. `artifacts` must already be ordered ascending by `id`
    /// (the canonical chronological order, per the data model).
    #[must_use]
    pub fn assemble(task_id: TaskId, title: &str, stage: Stage, artifacts: &[Artifact]) -> Self {
        let task_spec = artifacts
            .iter()
            .rev()
            .find(|artifact| artifact.kind == "TaskSpec")
            .and_then(|artifact| serde_json::from_value(artifact.data.clone()).ok())
            .unwrap_or_else(|| TaskSpec::default_for_title(title));
        let artifacts = artifacts
            .iter()
            .map(|artifact| ContextArtifact {
                kind: artifact.kind.clone(),
                data: artifact.data.clone(),
                run_id: artifact.run_id,
            })
            .collect();
        Self { task_id, title: title.to_string(), stage, task_spec, artifacts }
    }

    /// Serializes this context pack as the `input` payload handed to the
    /// role dispatcher.
    #[must_use]
    pub fn as_dispatch_input(&self) -> Value {
        json!({
            "task_id": self.task_id.get(),
            "title": self.title,
            "stage": self.stage.tag(),
            "task_spec": self.task_spec,
            "artifacts": self.artifacts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifiers::ArtifactId;
    use crate::time::Timestamp;

    fn artifact(kind: &str, data: Value) -> Artifact {
        Artifact {
            id: ArtifactId::from_raw(1).expect("id"),
            task_id: TaskId::from_raw(1).expect("id"),
            run_id: None,
            kind: kind.to_string(),
            data,
            created_at: Timestamp(0),
        }
    }

    #[test]
    fn falls_back_to_title_derived_spec_when_no_task_spec_artifact() {
        let ctx = ContextPack::assemble(TaskId::from_raw(1).expect("id"), "Add widgets", Stage::Backend, &[]);
        assert_eq!(ctx.task_spec.goal, "Add widgets");
        assert!(ctx.task_spec.acceptance_criteria.is_empty());
    }

    #[test]
    fn picks_up_the_most_recent_task_spec_artifact() {
        let artifacts = vec![
            artifact("TaskSpec", serde_json::json!({"goal": "old", "acceptance_criteria": [], "constraints": []})),
            artifact("TaskSpec", serde_json::json!({"goal": "new", "acceptance_criteria": ["a"], "constraints": []})),
        ];
        let ctx = ContextPack::assemble(TaskId::from_raw(1).expect("id"), "Title", Stage::Backend, &artifacts);
        assert_eq!(ctx.task_spec.goal, "new");
        assert_eq!(ctx.task_spec.acceptance_criteria, vec!["a".to_string()]);
    }
}
