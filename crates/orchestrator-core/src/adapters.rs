// crates/orchestrator-core/src/adapters.rs
// ============================================================================
// Module: External Adapters (interfaces)
// Description: Trait-per-external-system boundary for everything the pipeline
//              calls outside its own process: role dispatch, code hosting,
//              CI, and secret scanning.
// Purpose: Let orchestrator-worker and orchestrator-handlers depend on
//          behavior, not on reqwest/process calls directly.
// Dependencies: serde_json, crate::error
// ============================================================================

use serde_json::Value;

use crate::error::CiWaitError;
use crate::error::CodeHostingError;
use crate::error::DispatchError;
use crate::error::SecretScanError;

/// Dispatches one stage's work to whatever produces the role's output — an
/// LLM role, a scripted tool, a human-in-the-loop queue. `role` is one of
/// `"Product"`, `"Orchestrator"`, `"Backend"`, `"Frontend"`, `"QA"`, `"Docs"`
/// — a handler-chosen label, not a [`crate::model::Stage`] tag, since both
/// `QA_BACKEND` and `QA_FRONTEND` dispatch the same `"QA"` role with a
/// `target_stage` field inside `input` instead.
///
/// # Invariants
/// - A call with the same `(role, input)` is not guaranteed to be
///   idempotent; handlers are responsible for treating the result as a
///   single attempt.
pub trait RoleDispatcher: Send + Sync {
    /// Dispatches `input` to `role` and returns its output payload.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError`] on transport failure or a malformed
    /// response.
    fn dispatch(&self, role: &str, input: &Value) -> Result<Value, DispatchError>;
}

/// Outcome of requesting a pull request for a task's branch.
#[derive(Debug, Clone, PartialEq)]
pub struct PullRequestRef {
    /// Repository-scoped PR number.
    pub number: u64,
    /// Canonical web URL for the PR.
    pub url: String,
}

/// A narrow, best-effort client over the hosting platform's REST API
/// (branches, pull requests, merges). Implementations must degrade
/// gracefully — returning [`CodeHostingError::NotConfigured`] rather than
/// panicking — when no credentials are configured.
pub trait CodeHostingClient: Send + Sync {
    /// Opens (or returns the existing) pull request for `branch` against
    /// the default branch.
    ///
    /// # Errors
    ///
    /// Returns [`CodeHostingError`].
    fn ensure_pull_request(
        &self,
        branch: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequestRef, CodeHostingError>;

    /// Merges an open pull request.
    ///
    /// # Errors
    ///
    /// Returns [`CodeHostingError`].
    fn merge_pull_request(&self, pr_number: u64) -> Result<(), CodeHostingError>;

    /// Posts a comment on a pull request (used for the MERGE stage's merge notice).
    ///
    /// # Errors
    ///
    /// Returns [`CodeHostingError`].
    fn comment_pull_request(&self, pr_number: u64, body: &str) -> Result<(), CodeHostingError>;
}

/// Check-run status as reported by the hosting platform's CI integration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CiOutcome {
    /// All required checks are green.
    Passed,
    /// At least one required check failed.
    Failed,
}

/// Polls continuous-integration status for a pull request until it
/// settles or a timeout elapses.
pub trait CiWaiter: Send + Sync {
    /// Blocks the calling thread, polling until the PR's checks settle or
    /// `timeout_seconds` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`CiWaitError`].
    fn wait_for_checks(&self, pr_number: u64, timeout_seconds: u64) -> Result<CiOutcome, CiWaitError>;
}

/// One match reported by [`SecretScanner::scan`].
#[derive(Debug, Clone, PartialEq)]
pub struct SecretFinding {
    /// Name of the pattern that matched (e.g. `"sk_live_key"`).
    pub pattern: String,
    /// The matched substring, already present in the scanned text verbatim
    /// (no additional redaction is performed by the scanner itself).
    pub matched: String,
}

/// Scans generated artifact text for accidental secret material before it
/// is allowed to reach a pull request.
pub trait SecretScanner: Send + Sync {
    /// Scans `text`, returning every match found.
    ///
    /// # Errors
    ///
    /// Returns [`SecretScanError`] only if scanning itself cannot complete.
    fn scan(&self, text: &str) -> Result<Vec<SecretFinding>, SecretScanError>;
}
