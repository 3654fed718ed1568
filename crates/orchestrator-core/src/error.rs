// crates/orchestrator-core/src/error.rs
// ============================================================================
// Module: Pipeline Errors
// Description: Store and adapter error taxonomy shared across the workspace.
// Purpose: Give every external boundary a stable, programmatically matchable error type.
// Dependencies: thiserror
// ============================================================================

use thiserror::Error;

/// Errors returned by a [`crate::store::Store`] implementation.
///
/// # Invariants
/// - Both variants are treated identically by the Scheduler: "skip this
///   tick", per §4.A of the specification.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connectivity to the underlying database was lost.
    #[error("store connectivity error: {0}")]
    Connectivity(String),
    /// A write conflicted with a concurrent transaction.
    #[error("store serialization conflict: {0}")]
    Conflict(String),
}

/// Errors returned by the role dispatcher adapter.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The dispatched call failed (timeout, non-2xx response, transport error).
    #[error("dispatch error: {0}")]
    Failed(String),
    /// The role's response could not be parsed as the expected output shape.
    #[error("malformed dispatch response: {0}")]
    MalformedResponse(String),
}

/// Errors returned by the code-hosting client adapter.
#[derive(Debug, Error)]
pub enum CodeHostingError {
    /// Not configured (missing token/repo); callers degrade gracefully.
    #[error("code hosting client not configured")]
    NotConfigured,
    /// The remote call failed.
    #[error("code hosting error: {0}")]
    Failed(String),
}

/// Errors returned by the CI waiter adapter.
#[derive(Debug, Error)]
pub enum CiWaitError {
    /// Not configured; callers degrade gracefully.
    #[error("ci waiter not configured")]
    NotConfigured,
    /// Polling timed out before checks settled.
    #[error("timed out waiting for checks on pr #{0}")]
    TimedOut(u64),
    /// The remote call failed.
    #[error("ci wait error: {0}")]
    Failed(String),
}

/// Errors returned by the secret scanner adapter.
#[derive(Debug, Error)]
pub enum SecretScanError {
    /// Scanning failed outright (should not occur for a pure local scan).
    #[error("secret scan error: {0}")]
    Failed(String),
}
