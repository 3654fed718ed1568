// crates/orchestrator-adapters/src/github.rs
// ============================================================================
// Module: GitHub Code Hosting Adapter
// Description: CodeHostingClient and CiWaiter implementations backed by the
//              GitHub REST API.
// Purpose: Open/merge/comment on pull requests and poll their check status.
// Dependencies: orchestrator-core, reqwest
// ============================================================================

//! ## Overview
//! Mirrors the original `github_client.py` and `ci_gate.py`: every call
//! degrades to [`CodeHostingError::NotConfigured`] / [`CiWaitError::NotConfigured`]
//! when `GITHUB_REPO` is unset, rather than erroring out, and `wait_for_checks`
//! polls `mergeable_state` on a fixed interval until it lands in
//! `{"clean", "has_hooks"}` or the timeout elapses.

use std::thread;
use std::time::Duration;
use std::time::Instant;

use orchestrator_core::CiOutcome;
use orchestrator_core::CiWaitError;
use orchestrator_core::CiWaiter;
use orchestrator_core::CodeHostingClient;
use orchestrator_core::CodeHostingError;
use orchestrator_core::PullRequestRef;
use reqwest::blocking::Client;
use serde_json::Value;
use serde_json::json;

/// Interval between check-status polls in [`GitHubClient::wait_for_checks`].
const POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Credentials and target repository for the GitHub adapter.
///
/// # Invariants
/// - `repo` absent means every adapter call degrades gracefully rather than
///   hitting the network, mirroring `GITHUB_REPO` being unset in the
///   original settings.
#[derive(Debug, Clone, Default)]
pub struct GitHubConfig {
    /// Bearer token for the GitHub REST API. Unauthenticated calls are made
    /// if absent (subject to GitHub's anonymous rate limits).
    pub token: Option<String>,
    /// `owner/repo` slug. Required for any adapter call to actually run.
    pub repo: Option<String>,
}

/// A narrow client over the GitHub REST API for pull-request lifecycle and
/// check-status polling.
pub struct GitHubClient {
    config: GitHubConfig,
    base_url: String,
    client: Client,
}

impl GitHubClient {
    /// Builds a client for `config`, pointed at the public GitHub API.
    ///
    /// # Errors
    ///
    /// Returns [`CodeHostingError::Failed`] if the HTTP client cannot be
    /// constructed.
    pub fn new(config: GitHubConfig) -> Result<Self, CodeHostingError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("orchestrator/0.1")
            .build()
            .map_err(|err| CodeHostingError::Failed(err.to_string()))?;
        Ok(Self { config, base_url: "https://api.github.com".to_string(), client })
    }

    fn authorize(&self, builder: reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder {
        let builder = builder.header("Accept", "application/vnd.github+json");
        match &self.config.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn repo_or_not_configured(&self) -> Result<&str, CodeHostingError> {
        self.config.repo.as_deref().ok_or(CodeHostingError::NotConfigured)
    }
}

impl CodeHostingClient for GitHubClient {
    fn ensure_pull_request(&self, branch: &str, title: &str, body: &str) -> Result<PullRequestRef, CodeHostingError> {
        let repo = self.repo_or_not_configured()?;
        let url = format!("{}/repos/{repo}/pulls", self.base_url);
        let payload = json!({ "title": title, "head": branch, "base": "main", "body": body });
        let response = self
            .authorize(self.client.post(&url))
            .json(&payload)
            .send()
            .map_err(|err| CodeHostingError::Failed(err.to_string()))?;
        if !response.status().is_success() {
            return Err(CodeHostingError::Failed(format!("pull request create failed: {}", response.status())));
        }
        let body: Value = response.json().map_err(|err| CodeHostingError::Failed(err.to_string()))?;
        let number = body
            .get("number")
            .and_then(Value::as_u64)
            .ok_or_else(|| CodeHostingError::Failed("pull request response missing number".to_string()))?;
        let html_url = body.get("html_url").and_then(Value::as_str).unwrap_or_default().to_string();
        Ok(PullRequestRef { number, url: html_url })
    }

    fn merge_pull_request(&self, pr_number: u64) -> Result<(), CodeHostingError> {
        let repo = self.repo_or_not_configured()?;
        let url = format!("{}/repos/{repo}/pulls/{pr_number}/merge", self.base_url);
        let response = self
            .authorize(self.client.put(&url))
            .send()
            .map_err(|err| CodeHostingError::Failed(err.to_string()))?;
        if !response.status().is_success() {
            return Err(CodeHostingError::Failed(format!("pull request merge failed: {}", response.status())));
        }
        Ok(())
    }

    fn comment_pull_request(&self, pr_number: u64, body: &str) -> Result<(), CodeHostingError> {
        let repo = self.repo_or_not_configured()?;
        let url = format!("{}/repos/{repo}/issues/{pr_number}/comments", self.base_url);
        let response = self
            .authorize(self.client.post(&url))
            .json(&json!({ "body": body }))
            .send()
            .map_err(|err| CodeHostingError::Failed(err.to_string()))?;
        if !response.status().is_success() {
            return Err(CodeHostingError::Failed(format!("pull request comment failed: {}", response.status())));
        }
        Ok(())
    }
}

impl GitHubClient {
    /// Fetches whether `pr_number`'s checks currently report green, per the
    /// same `mergeable_state` contract as the original `check_pr_status`.
    fn check_pr_status(&self, pr_number: u64) -> Result<bool, CiWaitError> {
        let repo = self.config.repo.as_deref().ok_or(CiWaitError::NotConfigured)?;
        let url = format!("{}/repos/{repo}/pulls/{pr_number}", self.base_url);
        let response = self.authorize(self.client.get(&url)).send().map_err(|err| CiWaitError::Failed(err.to_string()))?;
        if !response.status().is_success() {
            return Err(CiWaitError::Failed(format!("pull request fetch failed: {}", response.status())));
        }
        let body: Value = response.json().map_err(|err| CiWaitError::Failed(err.to_string()))?;
        let state = body.get("mergeable_state").and_then(Value::as_str).unwrap_or_default();
        Ok(matches!(state, "clean" | "has_hooks"))
    }
}

impl CiWaiter for GitHubClient {
    fn wait_for_checks(&self, pr_number: u64, timeout_seconds: u64) -> Result<CiOutcome, CiWaitError> {
        if self.config.repo.is_none() {
            return Err(CiWaitError::NotConfigured);
        }
        let deadline = Instant::now() + Duration::from_secs(timeout_seconds);
        loop {
            if self.check_pr_status(pr_number)? {
                return Ok(CiOutcome::Passed);
            }
            if Instant::now() >= deadline {
                return Err(CiWaitError::TimedOut(pr_number));
            }
            thread::sleep(POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now())));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_repo_degrades_to_not_configured_on_every_operation() {
        let client = GitHubClient::new(GitHubConfig::default()).expect("client builds");
        assert!(matches!(client.ensure_pull_request("b", "t", ""), Err(CodeHostingError::NotConfigured)));
        assert!(matches!(client.merge_pull_request(1), Err(CodeHostingError::NotConfigured)));
        assert!(matches!(client.comment_pull_request(1, "hi"), Err(CodeHostingError::NotConfigured)));
        assert!(matches!(client.wait_for_checks(1, 1), Err(CiWaitError::NotConfigured)));
    }
}
