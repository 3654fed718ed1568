// crates/orchestrator-adapters/src/dispatcher.rs
// ============================================================================
// Module: Role Dispatcher Adapters
// Description: Concrete RoleDispatcher implementations — a deterministic
//              stub and an HTTP-backed dispatcher.
// Purpose: Let the pipeline run without an LLM configured, and talk to one
//          when LLM_ENDPOINT is set.
// Dependencies: orchestrator-core, reqwest, serde_json
// ============================================================================

//! ## Overview
//! [`StubRoleDispatcher`] mirrors the original `llm.py`'s placeholder
//! `call(role, input_json)`: it never fails and returns `{role, received,
//! prompt}` so the pipeline is runnable with no LLM configured.
//! [`HttpRoleDispatcher`] POSTs `{"role", "input"}` to a configured endpoint
//! and expects a JSON object back.

use std::time::Duration;

use orchestrator_core::DispatchError;
use orchestrator_core::RoleDispatcher;
use reqwest::blocking::Client;
use serde_json::Value;
use serde_json::json;

/// Role-specific prompt prefixes, mirroring `orchestrator/prompts.py`'s
/// `ROLE_PROMPTS` table. Empty string for unrecognized roles.
fn role_prompt(role: &str) -> &'static str {
    match role {
        "Product" => "Draft a task specification from the raw request.",
        "Orchestrator" => "Summarize the context pack for downstream roles.",
        "Backend" => "Produce a backend implementation plan.",
        "Frontend" => "Produce a frontend implementation plan.",
        "QA" => "Review the named stage's output and report pass/fail.",
        "Docs" => "Produce documentation for the change.",
        _ => "",
    }
}

/// Deterministic placeholder dispatcher. Never fails; used when
/// `LLM_ENDPOINT` is unset.
pub struct StubRoleDispatcher;

impl RoleDispatcher for StubRoleDispatcher {
    fn dispatch(&self, role: &str, input: &Value) -> Result<Value, DispatchError> {
        Ok(json!({ "role": role, "received": input, "prompt": role_prompt(role) }))
    }
}

/// Dispatches role calls over HTTP to a configured LLM-fronting endpoint.
///
/// # Invariants
/// - The endpoint is expected to return a JSON object; any other shape is a
///   [`DispatchError::MalformedResponse`].
pub struct HttpRoleDispatcher {
    endpoint: String,
    client: Client,
}

impl HttpRoleDispatcher {
    /// Builds a dispatcher posting to `endpoint` with a bounded request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError`] if the underlying HTTP client cannot be built.
    pub fn new(endpoint: String, timeout_seconds: u64) -> Result<Self, DispatchError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .map_err(|err| DispatchError::Failed(err.to_string()))?;
        Ok(Self { endpoint, client })
    }
}

impl RoleDispatcher for HttpRoleDispatcher {
    fn dispatch(&self, role: &str, input: &Value) -> Result<Value, DispatchError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "role": role, "input": input }))
            .send()
            .map_err(|err| DispatchError::Failed(err.to_string()))?;
        if !response.status().is_success() {
            return Err(DispatchError::Failed(format!("dispatcher returned status {}", response.status())));
        }
        let body: Value = response.json().map_err(|err| DispatchError::MalformedResponse(err.to_string()))?;
        if !body.is_object() {
            return Err(DispatchError::MalformedResponse("expected a JSON object response".to_string()));
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_echoes_role_and_input_with_its_prompt() {
        let dispatcher = StubRoleDispatcher;
        let input = json!({ "raw_request": "add widgets" });
        let output = dispatcher.dispatch("Product", &input).expect("stub never fails");
        assert_eq!(output["role"], json!("Product"));
        assert_eq!(output["received"], input);
        assert!(output["prompt"].as_str().is_some_and(|p| !p.is_empty()));
    }

    #[test]
    fn stub_returns_empty_prompt_for_unknown_roles() {
        let dispatcher = StubRoleDispatcher;
        let output = dispatcher.dispatch("Unknown", &json!({})).expect("stub never fails");
        assert_eq!(output["prompt"], json!(""));
    }
}
