// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Recursive task decomposition.
//!
//! When a task's scope is too wide for one worker, the sub-planner asks the
//! LLM to split it into subtasks, dispatches them concurrently through the
//! shared worker pool and concurrency limiter, and folds the child handoffs
//! into a single parent handoff. Subtask scopes must be subsets of the
//! parent's scope; anything outside is discarded.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::LlmError;
use crate::llm::{CompletionClient, CompletionOverrides};
use crate::planner::parse::parse_plan;
use crate::types::{ChatMessage, Handoff, HandoffStatus, Task};
use crate::worker::{LlmConfigSource, WorkerPool};

/// Sub-planner tuning knobs.
#[derive(Debug, Clone)]
pub struct SubPlannerConfig {
    /// Scope size at which a task is decomposed instead of dispatched.
    pub scope_threshold: usize,
    /// Maximum recursion depth.
    pub max_depth: u32,
    /// Per-level fan-out cap; excess subtasks are dropped with a warning.
    pub max_fanout: usize,
}

impl Default for SubPlannerConfig {
    fn default() -> Self {
        Self {
            scope_threshold: 4,
            max_depth: 3,
            max_fanout: 16,
        }
    }
}

/// Decomposes oversized tasks and aggregates child outcomes.
pub struct SubPlanner {
    llm: Arc<dyn CompletionClient>,
    system_prompt: String,
    pool: Arc<WorkerPool>,
    limiter: Arc<Semaphore>,
    llm_config_source: LlmConfigSource,
    config: SubPlannerConfig,
}

impl SubPlanner {
    pub fn new(
        llm: Arc<dyn CompletionClient>,
        system_prompt: impl Into<String>,
        pool: Arc<WorkerPool>,
        limiter: Arc<Semaphore>,
        llm_config_source: LlmConfigSource,
        config: SubPlannerConfig,
    ) -> Self {
        Self {
            llm,
            system_prompt: system_prompt.into(),
            pool,
            limiter,
            llm_config_source,
            config,
        }
    }

    /// Whether a task at this depth should be decomposed rather than
    /// dispatched directly.
    pub fn should_decompose(&self, task: &Task, depth: u32) -> bool {
        task.scope.len() >= self.config.scope_threshold && depth <= self.config.max_depth
    }

    /// Decompose `parent`, run the children, and aggregate their handoffs.
    /// Never errors: catastrophic failures come back as a synthetic failed
    /// handoff with a recovery suggestion.
    pub async fn run(&self, parent: &Task, depth: u32) -> Handoff {
        let subtasks = match self.decompose(parent).await {
            Ok(subtasks) => subtasks,
            Err(e) => {
                warn!(task_id = %parent.id, error = %e, "sub-planner LLM call failed");
                return self.bail(parent, format!("sub-planner failed: {}", e));
            }
        };
        if subtasks.is_empty() {
            return self.bail(
                parent,
                "sub-planner produced no valid subtasks".to_string(),
            );
        }

        debug!(task_id = %parent.id, children = subtasks.len(), depth, "decomposed");
        let results = join_all(
            subtasks
                .iter()
                .map(|subtask| self.run_child(subtask, depth)),
        )
        .await;

        aggregate(parent, &subtasks, results)
    }

    fn bail(&self, parent: &Task, reason: String) -> Handoff {
        let mut handoff = Handoff::failed(&parent.id, reason);
        handoff
            .suggestions
            .push("retry this task as a direct worker dispatch".to_string());
        handoff
    }

    async fn decompose(&self, parent: &Task) -> Result<Vec<Task>, LlmError> {
        let parent_json = serde_json::to_string_pretty(parent).unwrap_or_default();
        let messages = vec![
            ChatMessage::system(&self.system_prompt),
            ChatMessage::user(format!(
                "Split the following task into independent subtasks. Each subtask's \
                 scope must only contain files from the parent scope. Respond with a \
                 JSON array of subtask objects.\n\n{}",
                parent_json
            )),
        ];

        let completion = self
            .llm
            .complete(&messages, &CompletionOverrides::default())
            .await?;
        let parsed = parse_plan(&completion.content);

        let parent_scope: HashSet<&str> = parent.scope.iter().map(|s| s.as_str()).collect();
        let mut subtasks = Vec::new();
        for raw in parsed.into_parts().1 {
            let Some(description) = raw.description.filter(|d| !d.trim().is_empty()) else {
                continue;
            };
            // Keep only scope entries inside the parent's scope; a subtask
            // with nothing left is dropped.
            let scope: Vec<String> = raw
                .scope
                .into_iter()
                .filter(|path| parent_scope.contains(path.as_str()))
                .collect();
            if scope.is_empty() {
                debug!(task_id = %parent.id, "dropping subtask with no in-scope files");
                continue;
            }

            let index = subtasks.len() + 1;
            let id = format!("{}-sub-{}", parent.id, index);
            let branch = format!("{}-sub-{}", parent.branch, index);
            subtasks.push(
                Task::new(id, description)
                    .with_scope(scope)
                    .with_acceptance(raw.acceptance.unwrap_or_default())
                    .with_branch(branch)
                    .with_priority(parent.priority)
                    .with_created_at(parent.created_at)
                    .with_parent(&parent.id),
            );
        }

        if subtasks.len() > self.config.max_fanout {
            warn!(
                task_id = %parent.id,
                dropped = subtasks.len() - self.config.max_fanout,
                "capping sub-planner fan-out"
            );
            subtasks.truncate(self.config.max_fanout);
        }
        Ok(subtasks)
    }

    /// Run one child, recursing when the child itself is oversized. Boxed to
    /// keep the recursive future finite.
    fn run_child<'a>(
        &'a self,
        task: &'a Task,
        depth: u32,
    ) -> Pin<Box<dyn Future<Output = Handoff> + Send + 'a>> {
        Box::pin(async move {
            let permit = match Arc::clone(&self.limiter).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    return Handoff::failed(&task.id, "concurrency limiter closed");
                }
            };

            let handoff = if self.should_decompose(task, depth + 1) {
                self.run(task, depth + 1).await
            } else {
                match self
                    .pool
                    .assign_task(task, (self.llm_config_source)())
                    .await
                {
                    Ok(handoff) => handoff,
                    Err(e) => Handoff::failed(&task.id, format!("worker error: {}", e)),
                }
            };

            drop(permit);
            handoff
        })
    }
}

/// Fold child handoffs into the parent's handoff.
fn aggregate(parent: &Task, children: &[Task], results: Vec<Handoff>) -> Handoff {
    let all_complete = results
        .iter()
        .all(|h| h.status == HandoffStatus::Complete);
    let all_failed = results.iter().all(|h| h.status == HandoffStatus::Failed);
    let any_progress = results
        .iter()
        .any(|h| matches!(h.status, HandoffStatus::Complete | HandoffStatus::Partial));

    let status = if all_complete {
        HandoffStatus::Complete
    } else if all_failed {
        HandoffStatus::Failed
    } else if any_progress {
        HandoffStatus::Partial
    } else {
        HandoffStatus::Blocked
    };

    let mut metrics = crate::types::HandoffMetrics::default();
    let mut files_changed: Vec<String> = Vec::new();
    let mut seen_files: HashSet<String> = HashSet::new();
    let mut concerns = Vec::new();
    let mut suggestions = Vec::new();
    let mut summaries = Vec::new();

    for handoff in &results {
        metrics.absorb(&handoff.metrics);
        for file in &handoff.files_changed {
            if seen_files.insert(file.clone()) {
                files_changed.push(file.clone());
            }
        }
        for concern in &handoff.concerns {
            concerns.push(format!("[{}] {}", handoff.task_id, concern));
        }
        for suggestion in &handoff.suggestions {
            suggestions.push(format!("[{}] {}", handoff.task_id, suggestion));
        }
        summaries.push(format!(
            "{} ({}): {}",
            handoff.task_id,
            handoff.status,
            crate::planner::prompt::clip(&handoff.summary, 120)
        ));
    }

    let complete_count = results
        .iter()
        .filter(|h| h.status == HandoffStatus::Complete)
        .count();

    Handoff {
        task_id: parent.id.clone(),
        status,
        summary: format!(
            "{}/{} subtasks complete across {} files.\n{}",
            complete_count,
            children.len(),
            files_changed.len(),
            summaries.join("\n")
        ),
        files_changed,
        diff: String::new(),
        concerns,
        suggestions,
        metrics,
    }
}
