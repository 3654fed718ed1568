// crates/orchestrator-core/src/time.rs
// ============================================================================
// Module: Pipeline Time Model
// Description: Canonical timestamp representation for tasks, runs, artifacts, decisions.
// Purpose: Keep timestamp handling explicit and independent of any particular clock source.
// Dependencies: serde
// ============================================================================

//! ## Overview
//! The core never reads the wall clock itself; timestamps are supplied by the
//! store on insert/update and carried as plain Unix-millisecond values.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Unix-epoch milliseconds.
///
/// # Invariants
/// - No validation is performed; monotonicity across a single row is a
///   store responsibility (see `Invariant R2`/`A1` in the data model).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Returns the raw Unix-millisecond value.
    #[must_use]
    pub const fn millis(self) -> i64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
