// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration loading from the environment.
//!
//! The orchestrator is configured entirely through environment variables so
//! it can run unattended in CI-like contexts. Unknown or malformed optional
//! values fall back to their defaults with a warning; a malformed
//! `LLM_ENDPOINTS` is a hard error because nothing useful can run without
//! endpoints.

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ConfigError;
use crate::merge::MergeStrategy;

/// Default prompts directory under the user's home, used when `PROMPTS_DIR`
/// is not set.
pub const PROMPTS_DIR_NAME: &str = ".maestro/prompts";

/// One LLM endpoint as declared in the `LLM_ENDPOINTS` JSON array.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSpec {
    /// Display name used in logs and error messages.
    pub name: String,
    /// Base URL, e.g. `https://llm.example.com` (no trailing `/v1`).
    pub endpoint: String,
    /// Optional bearer token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Static routing weight.
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

/// LLM request parameters.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub endpoints: Vec<EndpointSpec>,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub request_timeout_secs: u64,
}

/// Git remote and local checkout settings.
#[derive(Debug, Clone)]
pub struct GitSettings {
    pub repo_url: String,
    pub token: String,
    pub target_repo_path: PathBuf,
    pub main_branch: String,
    pub branch_prefix: String,
    pub merge_strategy: MergeStrategy,
}

/// Worker pool settings.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Concurrency limit on in-flight dispatches.
    pub max_workers: usize,
    /// Per-task wall-clock budget in seconds.
    pub worker_timeout_secs: u64,
    /// Argv prefix for the sandbox subprocess; the JSON payload is appended.
    pub sandbox_command: Vec<String>,
}

/// Planner loop constants.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub sleep_ms: u64,
    pub min_handoffs_for_replan: usize,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub max_consecutive_errors: u32,
    pub max_iterations: u64,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            sleep_ms: 500,
            min_handoffs_for_replan: 3,
            backoff_base_ms: 2_000,
            backoff_max_ms: 30_000,
            max_consecutive_errors: 10,
            max_iterations: 10_000,
        }
    }
}

/// Reconciler sweep settings.
#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub interval_secs: u64,
    /// Shell commands run as the build/test oracle, in order.
    pub check_commands: Vec<String>,
    pub max_fix_tasks: usize,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            check_commands: Vec::new(),
            max_fix_tasks: 5,
        }
    }
}

/// Monitor settings.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub tick_ms: u64,
    /// USD per 1000 tokens, for the cost estimate in snapshots.
    pub token_cost_per_1k: f64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            tick_ms: 1_000,
            token_cost_per_1k: 0.001,
        }
    }
}

/// Full orchestrator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub llm: LlmSettings,
    pub git: GitSettings,
    pub worker: WorkerSettings,
    pub planner_loop: LoopSettings,
    pub reconciler: ReconcilerSettings,
    pub monitor: MonitorSettings,
    /// Directory holding the four system prompt files.
    pub prompts_dir: PathBuf,
    /// Where the NDJSON event feed is written, if anywhere.
    pub event_log_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let endpoints_raw = std::env::var("LLM_ENDPOINTS")
            .map_err(|_| ConfigError::MissingField("LLM_ENDPOINTS".to_string()))?;
        let endpoints: Vec<EndpointSpec> = serde_json::from_str(&endpoints_raw).map_err(|e| {
            ConfigError::InvalidValue {
                field: "LLM_ENDPOINTS".to_string(),
                message: e.to_string(),
            }
        })?;
        if endpoints.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "LLM_ENDPOINTS".to_string(),
                message: "at least one endpoint is required".to_string(),
            });
        }

        let llm = LlmSettings {
            endpoints,
            model: env_or("LLM_MODEL", "glm-5".to_string()),
            max_tokens: env_or("LLM_MAX_TOKENS", 8_192u32),
            temperature: env_or("LLM_TEMPERATURE", 0.3f32),
            request_timeout_secs: env_or("LLM_REQUEST_TIMEOUT", 120u64),
        };

        let merge_strategy = match std::env::var("MERGE_STRATEGY") {
            Ok(raw) => MergeStrategy::from_str(&raw).unwrap_or_else(|e| {
                warn!("Invalid MERGE_STRATEGY: {}; using fast-forward", e);
                MergeStrategy::FastForward
            }),
            Err(_) => MergeStrategy::FastForward,
        };

        let git = GitSettings {
            repo_url: std::env::var("GIT_REPO_URL")
                .map_err(|_| ConfigError::MissingField("GIT_REPO_URL".to_string()))?,
            token: std::env::var("GIT_TOKEN").unwrap_or_default(),
            target_repo_path: PathBuf::from(env_or(
                "TARGET_REPO_PATH",
                "./target-repo".to_string(),
            )),
            main_branch: env_or("MAIN_BRANCH", "main".to_string()),
            branch_prefix: env_or("BRANCH_PREFIX", "swarm/".to_string()),
            merge_strategy,
        };

        let worker = WorkerSettings {
            max_workers: env_or("MAX_WORKERS", 100usize),
            worker_timeout_secs: env_or("WORKER_TIMEOUT", 1_800u64),
            sandbox_command: split_command(&env_or(
                "SANDBOX_COMMAND",
                "node sandbox/agent.js".to_string(),
            )),
        };

        let planner_loop = LoopSettings {
            sleep_ms: env_or("LOOP_SLEEP_MS", 500),
            min_handoffs_for_replan: env_or("MIN_HANDOFFS_FOR_REPLAN", 3),
            backoff_base_ms: env_or("BACKOFF_BASE_MS", 2_000),
            backoff_max_ms: env_or("BACKOFF_MAX_MS", 30_000),
            max_consecutive_errors: env_or("MAX_CONSECUTIVE_ERRORS", 10),
            max_iterations: env_or("MAX_ITERATIONS", 10_000),
        };

        let reconciler = ReconcilerSettings {
            interval_secs: env_or("RECONCILER_INTERVAL_SECS", 300),
            check_commands: std::env::var("RECONCILER_CHECK_COMMANDS")
                .map(|raw| {
                    raw.split(';')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            max_fix_tasks: env_or("MAX_FIX_TASKS", 5),
        };

        let monitor = MonitorSettings {
            tick_ms: env_or("MONITOR_TICK_MS", 1_000),
            token_cost_per_1k: env_or("TOKEN_COST_PER_1K", 0.001),
        };

        let prompts_dir = std::env::var("PROMPTS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_prompts_dir());

        let event_log_path = std::env::var("EVENT_LOG_PATH").ok().map(PathBuf::from);

        Ok(Self {
            llm,
            git,
            worker,
            planner_loop,
            reconciler,
            monitor,
            prompts_dir,
            event_log_path,
        })
    }
}

/// Get the default prompts directory (`~/.maestro/prompts`).
pub fn default_prompts_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(PROMPTS_DIR_NAME)
}

/// Read an environment variable, falling back to a default on absence or
/// parse failure (with a warning for the latter).
fn env_or<T: FromStr + std::fmt::Display>(key: &str, default: T) -> T
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(e) => {
                warn!("Invalid {}={:?}: {}; using {}", key, raw, e, default);
                default
            }
        },
        Err(_) => default,
    }
}

/// Split a command line into argv on whitespace.
fn split_command(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_spec_parsing() {
        let json = r#"[
            {"name": "primary", "endpoint": "https://a.example.com", "apiKey": "k", "weight": 80},
            {"name": "fallback", "endpoint": "https://b.example.com", "weight": 20}
        ]"#;
        let specs: Vec<EndpointSpec> = serde_json::from_str(json).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].name, "primary");
        assert_eq!(specs[0].api_key.as_deref(), Some("k"));
        assert_eq!(specs[0].weight, 80.0);
        assert!(specs[1].api_key.is_none());
    }

    #[test]
    fn test_endpoint_spec_default_weight() {
        let json = r#"[{"name": "only", "endpoint": "http://localhost:8000"}]"#;
        let specs: Vec<EndpointSpec> = serde_json::from_str(json).unwrap();
        assert_eq!(specs[0].weight, 1.0);
    }

    #[test]
    fn test_split_command() {
        assert_eq!(
            split_command("node sandbox/agent.js"),
            vec!["node".to_string(), "sandbox/agent.js".to_string()]
        );
        assert!(split_command("   ").is_empty());
    }

    #[test]
    fn test_loop_settings_defaults() {
        let settings = LoopSettings::default();
        assert_eq!(settings.sleep_ms, 500);
        assert_eq!(settings.min_handoffs_for_replan, 3);
        assert_eq!(settings.backoff_base_ms, 2_000);
        assert_eq!(settings.backoff_max_ms, 30_000);
        assert_eq!(settings.max_consecutive_errors, 10);
    }

    #[test]
    fn test_reconciler_defaults() {
        let settings = ReconcilerSettings::default();
        assert_eq!(settings.interval_secs, 300);
        assert_eq!(settings.max_fix_tasks, 5);
        assert!(settings.check_commands.is_empty());
    }

    #[test]
    fn test_default_prompts_dir() {
        let dir = default_prompts_dir();
        assert!(dir.ends_with(PROMPTS_DIR_NAME));
    }
}
