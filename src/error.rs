// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for the maestro orchestrator.
//!
//! This module provides strongly-typed errors for each subsystem, using
//! `thiserror` for ergonomic error definitions and `anyhow` for propagation
//! at the application boundary.

use thiserror::Error;

/// Errors that can occur when talking to an LLM endpoint fleet.
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("Authentication failed: {0}")]
    AuthError(String),

    #[error("API error: {message}")]
    ApiError {
        message: String,
        status_code: Option<u16>,
    },

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Response parsing error: {0}")]
    ParseError(String),

    #[error("Timeout after {0}ms")]
    Timeout(u64),

    #[error("No endpoints configured")]
    NotConfigured,

    #[error("All {attempts} endpoints failed: {detail}")]
    AllEndpointsFailed { attempts: usize, detail: String },

    #[error("No endpoint became ready within {0}s")]
    NotReady(u64),
}

impl LlmError {
    /// Create an API error with status code.
    pub fn api(message: impl Into<String>, status_code: u16) -> Self {
        Self::ApiError {
            message: message.into(),
            status_code: Some(status_code),
        }
    }

    /// Create an API error without status code.
    pub fn api_message(message: impl Into<String>) -> Self {
        Self::ApiError {
            message: message.into(),
            status_code: None,
        }
    }

    /// Check if this error is retryable on another endpoint.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited(_) | Self::NetworkError(_) | Self::Timeout(_) | Self::ApiError { .. }
        )
    }
}

/// Errors that can occur while running a sandbox worker subprocess.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Spawn failed: {0}")]
    SpawnFailed(String),

    #[error("Worker timed out after {timeout_secs}s (task {task_id})")]
    Timeout { task_id: String, timeout_secs: u64 },

    #[error("Worker produced no handoff (task {0})")]
    NoHandoff(String),

    #[error("Final worker output was not a handoff: {0}")]
    MalformedHandoff(String),

    #[error("Worker exited with {code:?} and no handoff: {stderr}")]
    Crashed { code: Option<i32>, stderr: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from local git subprocess invocations.
#[derive(Error, Debug)]
pub enum GitError {
    #[error("git {command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the task queue state machine.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Duplicate task id: {0}")]
    Duplicate(String),

    #[error("Invalid transition for {id}: {from} -> {to}")]
    InvalidTransition { id: String, from: String, to: String },
}

/// Errors that can occur during configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required setting: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("JSON parsing error: {0}")]
    JsonError(String),

    #[error("IO error reading config: {0}")]
    IoError(String),
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        Self::JsonError(err.to_string())
    }
}

/// Errors from the planner loop.
#[derive(Error, Debug)]
pub enum PlannerError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Maximum consecutive errors exceeded: {0}")]
    MaxErrorsExceeded(u32),

    #[error("Planner was stopped")]
    Stopped,
}

/// Result type alias using anyhow for flexible error handling.
pub type Result<T> = anyhow::Result<T>;
