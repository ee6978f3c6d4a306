// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Core type definitions for the orchestrator.
//!
//! These are the wire types shared between the planner, the sandbox workers,
//! and the merge queue. Everything that crosses a process boundary is
//! camelCase JSON, matching the sandbox subprocess contract and the NDJSON
//! event feed.

use serde::{Deserialize, Serialize};

// ============================================================================
// Task
// ============================================================================

/// A single unit of work dispatched to one sandbox worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique identifier for this task.
    pub id: String,
    /// Natural-language instruction for the worker.
    pub description: String,
    /// Repository paths the worker is expected to modify.
    #[serde(default)]
    pub scope: Vec<String>,
    /// Textual completion criterion.
    #[serde(default)]
    pub acceptance: String,
    /// Remote branch the worker pushes to.
    pub branch: String,
    /// Current lifecycle status.
    #[serde(default)]
    pub status: TaskStatus,
    /// Priority; lower is more urgent.
    #[serde(default = "default_priority")]
    pub priority: i32,
    /// Monotonic creation timestamp in milliseconds.
    #[serde(default)]
    pub created_at: u64,
    /// Parent task id when produced by the sub-planner.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

pub(crate) fn default_priority() -> i32 {
    5
}

impl Task {
    /// Create a new pending task with minimal required fields.
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            branch: id.clone(),
            id,
            description: description.into(),
            scope: Vec::new(),
            acceptance: String::new(),
            status: TaskStatus::Pending,
            priority: default_priority(),
            created_at: 0,
            parent_id: None,
        }
    }

    /// Set the scope paths for this task.
    pub fn with_scope(mut self, scope: Vec<String>) -> Self {
        self.scope = scope;
        self
    }

    /// Set the branch name for this task.
    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = branch.into();
        self
    }

    /// Set the priority for this task.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the acceptance criterion.
    pub fn with_acceptance(mut self, acceptance: impl Into<String>) -> Self {
        self.acceptance = acceptance.into();
        self
    }

    /// Set the creation timestamp (monotonic milliseconds).
    pub fn with_created_at(mut self, created_at: u64) -> Self {
        self.created_at = created_at;
        self
    }

    /// Mark this task as a child of another task.
    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }
}

/// Lifecycle status of a task.
///
/// Transitions only move forward: pending -> assigned -> running -> one of
/// the terminal states. There are no back-edges; recovery happens by creating
/// a new fix task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Assigned,
    Running,
    Complete,
    Failed,
    Blocked,
    Partial,
}

impl TaskStatus {
    /// Check if this status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Complete | Self::Failed | Self::Blocked | Self::Partial
        )
    }

    /// Check whether a transition to `next` is legal.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, TaskStatus::Assigned)
                | (Self::Assigned, TaskStatus::Running)
                | (Self::Running, TaskStatus::Complete)
                | (Self::Running, TaskStatus::Failed)
                | (Self::Running, TaskStatus::Blocked)
                | (Self::Running, TaskStatus::Partial)
        )
    }

    /// Lowercase wire name, useful in log and error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
            Self::Partial => "partial",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Handoff
// ============================================================================

/// The structured result a sandbox worker returns for one task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Handoff {
    /// Id of the task this handoff answers.
    pub task_id: String,
    /// Outcome reported by the worker.
    pub status: HandoffStatus,
    /// Worker's natural-language account of what happened.
    #[serde(default)]
    pub summary: String,
    /// Paths the worker modified.
    #[serde(default)]
    pub files_changed: Vec<String>,
    /// Unified diff text; opaque to the orchestrator.
    #[serde(default)]
    pub diff: String,
    /// Free-text concerns raised by the worker.
    #[serde(default)]
    pub concerns: Vec<String>,
    /// Free-text suggestions for follow-up work.
    #[serde(default)]
    pub suggestions: Vec<String>,
    /// Numeric work measurements.
    #[serde(default)]
    pub metrics: HandoffMetrics,
}

impl Handoff {
    /// Synthesize a failed handoff for a task that produced none.
    pub fn failed(task_id: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: HandoffStatus::Failed,
            summary: summary.into(),
            files_changed: Vec::new(),
            diff: String::new(),
            concerns: Vec::new(),
            suggestions: Vec::new(),
            metrics: HandoffMetrics::default(),
        }
    }

    /// Whether the merge queue should attempt this task's branch.
    pub fn is_mergeable(&self) -> bool {
        matches!(self.status, HandoffStatus::Complete | HandoffStatus::Partial)
    }

    /// A worker that used zero tokens and zero tool calls did no real work.
    pub fn is_suspicious(&self) -> bool {
        self.metrics.tokens_used == 0 && self.metrics.tool_call_count == 0
    }

    /// Whether the worker reported an empty diff.
    pub fn is_empty_diff(&self) -> bool {
        self.diff.trim().is_empty() && self.files_changed.is_empty()
    }
}

/// Outcome category reported by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandoffStatus {
    Complete,
    Partial,
    Failed,
    Blocked,
}

impl HandoffStatus {
    /// The task status a handoff outcome maps to.
    pub fn as_task_status(&self) -> TaskStatus {
        match self {
            Self::Complete => TaskStatus::Complete,
            Self::Partial => TaskStatus::Partial,
            Self::Failed => TaskStatus::Failed,
            Self::Blocked => TaskStatus::Blocked,
        }
    }
}

impl std::fmt::Display for HandoffStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Complete => "complete",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

/// Work measurements attached to a handoff. Absent fields default to zero.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct HandoffMetrics {
    pub lines_added: u64,
    pub lines_removed: u64,
    pub files_created: u64,
    pub files_modified: u64,
    pub tokens_used: u64,
    pub tool_call_count: u64,
    pub duration_ms: u64,
}

impl HandoffMetrics {
    /// Sum another handoff's metrics into this one. Duration takes the max,
    /// since subtasks run concurrently.
    pub fn absorb(&mut self, other: &HandoffMetrics) {
        self.lines_added += other.lines_added;
        self.lines_removed += other.lines_removed;
        self.files_created += other.files_created;
        self.files_modified += other.files_modified;
        self.tokens_used += other.tokens_used;
        self.tool_call_count += other.tool_call_count;
        self.duration_ms = self.duration_ms.max(other.duration_ms);
    }
}

// ============================================================================
// Chat messages
// ============================================================================

/// Role of a chat message in an LLM conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A message in the planner's long-lived LLM conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

// ============================================================================
// Sandbox payload
// ============================================================================

/// The single JSON argument handed to a sandbox subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerPayload {
    pub task: Task,
    pub system_prompt: String,
    pub repo_url: String,
    pub git_token: String,
    pub llm_config: WorkerLlmConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<serde_json::Value>,
}

/// LLM connection parameters forwarded to a sandbox worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerLlmConfig {
    pub endpoint: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

// ============================================================================
// Merge outcomes
// ============================================================================

/// Result of one merge queue attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MergeOutcome {
    /// Branch the attempt was made for.
    pub branch: String,
    /// Outcome category.
    pub status: MergeStatus,
    /// Whether the branch landed on the mainline.
    pub success: bool,
    /// Human-readable detail.
    pub message: String,
    /// Conflicting paths when status is `Conflict`.
    #[serde(default)]
    pub conflicts: Vec<String>,
}

/// Outcome category of a merge attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStatus {
    Merged,
    Conflict,
    Failed,
    Skipped,
}
