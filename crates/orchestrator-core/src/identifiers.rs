// crates/orchestrator-core/src/identifiers.rs
// ============================================================================
// Module: Pipeline Identifiers
// Description: Canonical opaque identifiers for tasks, runs, artifacts, and decisions.
// Purpose: Provide strongly typed, serializable identifiers with stable wire forms.
// Dependencies: serde
// ============================================================================

//! ## Overview
//! Identifiers are opaque 1-based integers assigned by the store on insert.
//! They serialize as plain integers on the wire.

use std::fmt;
use std::num::NonZeroI64;

use serde::Deserialize;
use serde::Serialize;

macro_rules! id_newtype {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        ///
        /// # Invariants
        /// - Always >= 1 (non-zero, 1-based, assigned by the store on insert).
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(NonZeroI64);

        impl $name {
            /// Creates an identifier from a non-zero row id.
            #[must_use]
            pub const fn new(id: NonZeroI64) -> Self {
                Self(id)
            }

            /// Creates an identifier from a raw row id (returns `None` if non-positive).
            #[must_use]
            pub fn from_raw(raw: i64) -> Option<Self> {
                NonZeroI64::new(raw).filter(|v| v.get() > 0).map(Self)
            }

            /// Returns the raw row id (always >= 1).
            #[must_use]
            pub const fn get(self) -> i64 {
                self.0.get()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.get().fmt(f)
            }
        }
    };
}

id_newtype!(TaskId, "Identifier for a Task.");
id_newtype!(RunId, "Identifier for a Run (one attempt at one stage).");
id_newtype!(ArtifactId, "Identifier for an Artifact.");
id_newtype!(DecisionId, "Identifier for a Decision.");
