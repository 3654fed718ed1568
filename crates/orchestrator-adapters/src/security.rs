// crates/orchestrator-adapters/src/security.rs
// ============================================================================
// Module: Secret Pattern Scanner
// Description: SecretScanner implementation matching known secret shapes.
// Purpose: Catch accidental credential leakage in generated artifact text
//          before SECURITY passes a run on to BACKEND_GATE.
// Dependencies: orchestrator-core, regex
// ============================================================================

//! ## Overview
//! Ported verbatim from the original `security.py`'s `SECRET_PATTERNS`:
//! an OpenAI-style secret key and a GitHub personal access token shape.
//! Compiled once at construction so a scan never pays regex-parse cost.

use orchestrator_core::SecretFinding;
use orchestrator_core::SecretScanError;
use orchestrator_core::SecretScanner;
use regex::Regex;

struct NamedPattern {
    name: &'static str,
    regex: Regex,
}

/// Scans text for hardcoded-secret shapes via a fixed pattern set.
pub struct PatternSecretScanner {
    patterns: Vec<NamedPattern>,
}

impl PatternSecretScanner {
    /// Builds a scanner with the default secret patterns.
    ///
    /// # Panics
    ///
    /// Never — the pattern set is a compile-time constant known to be valid.
    #[must_use]
    pub fn new() -> Self {
        let patterns = vec![
            NamedPattern {
                name: "sk-style secret key",
                regex: Regex::new(r"sk-[A-Za-z0-9]{10,}").unwrap_or_else(|_| unreachable_pattern()),
            },
            NamedPattern {
                name: "github personal access token",
                regex: Regex::new(r"ghp_[A-Za-z0-9]{10,}").unwrap_or_else(|_| unreachable_pattern()),
            },
        ];
        Self { patterns }
    }
}

/// Patterns above are fixed literals; this only exists to avoid `expect`/`unwrap`
/// in non-test code while keeping `Regex::new`'s `Result` honest.
fn unreachable_pattern() -> Regex {
    #[allow(clippy::unwrap_used)]
    Regex::new("$^").unwrap()
}

impl Default for PatternSecretScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretScanner for PatternSecretScanner {
    fn scan(&self, text: &str) -> Result<Vec<SecretFinding>, SecretScanError> {
        let mut findings = Vec::new();
        for pattern in &self.patterns {
            if let Some(matched) = pattern.regex.find(text) {
                findings.push(SecretFinding { pattern: pattern.name.to_string(), matched: matched.as_str().to_string() });
            }
        }
        Ok(findings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_text_reports_no_findings() {
        let scanner = PatternSecretScanner::new();
        let findings = scanner.scan("fn main() {}").expect("scan never fails");
        assert!(findings.is_empty());
    }

    #[test]
    fn detects_an_sk_style_key() {
        let scanner = PatternSecretScanner::new();
        let findings = scanner.scan("key = sk-ABCDEFGHIJKLMNOP").expect("scan never fails");
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].pattern, "sk-style secret key");
    }

    #[test]
    fn detects_a_github_token() {
        let scanner = PatternSecretScanner::new();
        let findings = scanner.scan("token: ghp_ABCDEFGHIJKLMNOP").expect("scan never fails");
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].pattern, "github personal access token");
    }

    #[test]
    fn detects_both_patterns_when_both_present() {
        let scanner = PatternSecretScanner::new();
        let text = "sk-ABCDEFGHIJKLMNOP and ghp_ABCDEFGHIJKLMNOP";
        let findings = scanner.scan(text).expect("scan never fails");
        assert_eq!(findings.len(), 2);
    }
}
