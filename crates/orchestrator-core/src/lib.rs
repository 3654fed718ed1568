// crates/orchestrator-core/src/lib.rs
// ============================================================================
// Crate: orchestrator-core
// Description: Domain types, persistence contract, and external-adapter
//              interfaces shared by every other crate in the workspace.
// ============================================================================

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod adapters;
pub mod context;
pub mod error;
pub mod identifiers;
pub mod model;
pub mod rework;
pub mod store;
pub mod time;

pub use adapters::CiOutcome;
pub use adapters::CiWaiter;
pub use adapters::CodeHostingClient;
pub use adapters::PullRequestRef;
pub use adapters::RoleDispatcher;
pub use adapters::SecretFinding;
pub use adapters::SecretScanner;
pub use context::ContextArtifact;
pub use context::ContextPack;
pub use context::TaskSpec;
pub use error::CiWaitError;
pub use error::CodeHostingError;
pub use error::DispatchError;
pub use error::SecretScanError;
pub use error::StoreError;
pub use identifiers::ArtifactId;
pub use identifiers::DecisionId;
pub use identifiers::RunId;
pub use identifiers::TaskId;
pub use model::Artifact;
pub use model::Decision;
pub use model::DecisionKind;
pub use model::DecisionValue;
pub use model::GateDecision;
pub use model::Run;
pub use model::RunStatus;
pub use model::STAGE_ORDER;
pub use model::Stage;
pub use model::Task;
pub use model::TaskStatus;
pub use model::backend_gate_ready;
pub use model::docs_gate_ready;
pub use model::frontend_gate_ready;
pub use model::latest_run_for_stage;
pub use model::next_stage_after;
pub use rework::spawn_retry_or_fail_task;
pub use rework::spawn_rework_or_fail_task;
pub use store::Store;
pub use store::StoreScope;
pub use store::TaskWithChildren;
pub use time::Timestamp;
