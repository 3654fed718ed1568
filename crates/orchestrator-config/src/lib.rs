// crates/orchestrator-config/src/lib.rs
// ============================================================================
// Module: Pipeline Orchestrator Config
// Description: Environment-variable configuration loading and validation.
// Purpose: Provide strict, fail-closed config parsing for the worker, HTTP
//          API, and CLI entry points.
// Dependencies: thiserror
// ============================================================================

//! ## Overview
//! Configuration is loaded from the process environment. `GITHUB_TOKEN`,
//! `GITHUB_REPO`, and `LLM_ENDPOINT` are optional — their absence degrades
//! the corresponding adapter rather than failing config load, mirroring
//! `github_client.py`/`llm.py`'s "skip and log" behavior. Numeric fields
//! fail closed: missing values fall back to their default, but a present,
//! non-numeric, or zero value is a hard [`ConfigError`].

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

use std::env;
use std::env::VarError;

use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default connection string when `DATABASE_URL` is unset.
pub const DEFAULT_DATABASE_URL: &str = "orchestrator.sqlite3";
/// Default worker poll interval in seconds.
pub const DEFAULT_WORKER_POLL_INTERVAL_SECONDS: u64 = 5;
/// Default per-stage retry/rework cap.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default HTTP API bind host.
pub const DEFAULT_API_HOST: &str = "0.0.0.0";
/// Default HTTP API bind port.
pub const DEFAULT_API_PORT: u16 = 8000;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors returned while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable was present but not valid unicode.
    #[error("environment variable {0} is not valid unicode")]
    NotUnicode(&'static str),
    /// A numeric field was present but failed to parse, or parsed to zero.
    #[error("environment variable {0} must be a positive integer, got {1:?}")]
    Invalid(&'static str, String),
}

// ============================================================================
// SECTION: Config
// ============================================================================

/// Fully resolved process configuration.
///
/// # Invariants
/// - `worker_poll_interval_seconds` and `max_attempts` are always
///   greater than zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Connection string/path for the run store.
    pub database_url: String,
    /// Bearer token for the GitHub REST API, if configured.
    pub github_token: Option<String>,
    /// `owner/repo` slug for the GitHub REST API, if configured.
    pub github_repo: Option<String>,
    /// Endpoint the role dispatcher POSTs to, if an LLM is configured.
    pub llm_endpoint: Option<String>,
    /// Seconds the worker loop sleeps between empty ticks.
    pub worker_poll_interval_seconds: u64,
    /// Per-stage retry/rework cap before a task fails.
    pub max_attempts: u32,
    /// HTTP API bind host.
    pub api_host: String,
    /// HTTP API bind port.
    pub api_port: u16,
}

impl Config {
    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a present value is not valid unicode, or a
    /// numeric field is present but non-numeric or zero.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_source(&ProcessEnv)
    }

    /// Loads configuration from an arbitrary [`EnvSource`], so callers
    /// (and tests) can supply values without mutating the real process
    /// environment.
    ///
    /// # Errors
    ///
    /// See [`Config::from_env`].
    pub fn from_source(source: &dyn EnvSource) -> Result<Self, ConfigError> {
        let database_url = optional_string(source, "DATABASE_URL")?.unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());
        let github_token = optional_string(source, "GITHUB_TOKEN")?;
        let github_repo = optional_string(source, "GITHUB_REPO")?;
        let llm_endpoint = optional_string(source, "LLM_ENDPOINT")?;
        let worker_poll_interval_seconds =
            positive_u64(source, "WORKER_POLL_INTERVAL_SECONDS", DEFAULT_WORKER_POLL_INTERVAL_SECONDS)?;
        let max_attempts = positive_u32(source, "MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?;
        let api_host = optional_string(source, "API_HOST")?.unwrap_or_else(|| DEFAULT_API_HOST.to_string());
        let api_port = positive_u16(source, "API_PORT", DEFAULT_API_PORT)?;

        Ok(Self {
            database_url,
            github_token,
            github_repo,
            llm_endpoint,
            worker_poll_interval_seconds,
            max_attempts,
            api_host,
            api_port,
        })
    }
}

// ============================================================================
// SECTION: Environment source abstraction
// ============================================================================

/// Abstracts reading environment variables so config loading is testable
/// without mutating the real process environment.
pub trait EnvSource {
    /// Reads `key`, returning `Ok(None)` if unset.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotUnicode`] if the value is present but not
    /// valid unicode.
    fn get(&self, key: &'static str) -> Result<Option<String>, ConfigError>;
}

/// Reads from the real process environment via [`std::env::var`].
struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn get(&self, key: &'static str) -> Result<Option<String>, ConfigError> {
        match env::var(key) {
            Ok(value) => Ok(Some(value)),
            Err(VarError::NotPresent) => Ok(None),
            Err(VarError::NotUnicode(_)) => Err(ConfigError::NotUnicode(key)),
        }
    }
}

fn optional_string(source: &dyn EnvSource, key: &'static str) -> Result<Option<String>, ConfigError> {
    Ok(source.get(key)?.filter(|value| !value.is_empty()))
}

fn positive_u64(source: &dyn EnvSource, key: &'static str, default: u64) -> Result<u64, ConfigError> {
    match optional_string(source, key)? {
        None => Ok(default),
        Some(raw) => {
            let parsed: u64 = raw.parse().map_err(|_| ConfigError::Invalid(key, raw.clone()))?;
            if parsed == 0 { Err(ConfigError::Invalid(key, raw)) } else { Ok(parsed) }
        }
    }
}

fn positive_u32(source: &dyn EnvSource, key: &'static str, default: u32) -> Result<u32, ConfigError> {
    match optional_string(source, key)? {
        None => Ok(default),
        Some(raw) => {
            let parsed: u32 = raw.parse().map_err(|_| ConfigError::Invalid(key, raw.clone()))?;
            if parsed == 0 { Err(ConfigError::Invalid(key, raw)) } else { Ok(parsed) }
        }
    }
}

fn positive_u16(source: &dyn EnvSource, key: &'static str, default: u16) -> Result<u16, ConfigError> {
    match optional_string(source, key)? {
        None => Ok(default),
        Some(raw) => {
            let parsed: u16 = raw.parse().map_err(|_| ConfigError::Invalid(key, raw.clone()))?;
            if parsed == 0 { Err(ConfigError::Invalid(key, raw)) } else { Ok(parsed) }
        }
    }
}
