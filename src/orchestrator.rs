// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The orchestrator shell.
//!
//! Builds every subsystem from configuration, wires the callbacks between
//! them, and owns the lifecycle: start the background services, run the
//! planner to completion, then shut everything down in dependency order
//! (planner, reconciler, merge queue, monitor, worker pool).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::gitops::GitClient;
use crate::llm::{CompletionClient, LlmClient};
use crate::merge::MergeQueue;
use crate::monitor::Monitor;
use crate::planner::parse::slug;
use crate::planner::{Planner, PlannerOptions};
use crate::prompts::SystemPrompts;
use crate::queue::TaskQueue;
use crate::reconciler::Reconciler;
use crate::subplanner::{SubPlanner, SubPlannerConfig};
use crate::telemetry::{EventLog, LogEvent};
use crate::types::{Task, WorkerLlmConfig};
use crate::worker::{
    LlmConfigSource, PayloadTemplate, SubprocessSandbox, TimedOutBranches, WorkerPool,
};

/// Conflict-fix tasks injected per run, at most.
pub const MAX_CONFLICT_FIX_TASKS: usize = 10;

/// Conflicting files carried into a fix task's scope, at most.
pub const CONFLICT_SCOPE_MAX: usize = 5;

/// Marker in branch names that suppresses cascading fixes.
pub const CONFLICT_FIX_MARKER: &str = "conflict-fix";

/// Builds bounded conflict-fix tasks from merge-conflict events.
pub struct ConflictFixer {
    branch_prefix: String,
    counter: AtomicUsize,
}

impl ConflictFixer {
    pub fn new(branch_prefix: impl Into<String>) -> Self {
        Self {
            branch_prefix: branch_prefix.into(),
            counter: AtomicUsize::new(0),
        }
    }

    /// Number of fix tasks produced so far.
    pub fn issued(&self) -> usize {
        self.counter.load(Ordering::SeqCst).min(MAX_CONFLICT_FIX_TASKS)
    }

    /// Produce a fix task for a conflicted branch, or `None` when the branch
    /// is itself a conflict fix (no cascades) or the per-run cap is reached.
    pub fn make_fix_task(&self, branch: &str, conflicting_files: &[String]) -> Option<Task> {
        if branch.contains(CONFLICT_FIX_MARKER) {
            warn!(branch, "conflict on a conflict-fix branch; not cascading");
            return None;
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        if n >= MAX_CONFLICT_FIX_TASKS {
            warn!(branch, "conflict-fix cap reached; dropping");
            return None;
        }

        let scope: Vec<String> = conflicting_files
            .iter()
            .take(CONFLICT_SCOPE_MAX)
            .cloned()
            .collect();
        let id = format!("{}-{:03}", CONFLICT_FIX_MARKER, n + 1);
        let description = format!(
            "Branch {} conflicts with the mainline. Reconcile and re-land the \
             changes touching: {}",
            branch,
            scope.join(", ")
        );
        let fix_branch = format!("{}{}-{}", self.branch_prefix, id, slug(branch));
        Some(
            Task::new(id, description)
                .with_scope(scope)
                .with_branch(fix_branch)
                .with_priority(1),
        )
    }
}

/// Wires and runs the whole system.
pub struct Orchestrator {
    llm: Arc<LlmClient>,
    queue: Arc<TaskQueue>,
    monitor: Arc<Monitor>,
    merge: Arc<MergeQueue>,
    planner: Arc<Planner>,
    reconciler: Arc<Reconciler>,
    shutdown_done: AtomicBool,
}

impl Orchestrator {
    /// Build every subsystem from configuration and wire the callbacks.
    pub fn new(config: Config) -> Result<Self> {
        let prompts = SystemPrompts::load(&config.prompts_dir);
        let event_log = Arc::new(match &config.event_log_path {
            Some(path) => EventLog::open(path)?,
            None => EventLog::disabled(),
        });

        let git = Arc::new(GitClient::new(&config.git.target_repo_path));
        let queue = Arc::new(TaskQueue::new());
        let worker_timeout = Duration::from_secs(config.worker.worker_timeout_secs);

        let monitor = Arc::new(Monitor::new(
            Duration::from_millis(config.monitor.tick_ms),
            worker_timeout,
            config.monitor.token_cost_per_1k,
        ));
        {
            let queue = Arc::clone(&queue);
            monitor.set_pending_provider(Arc::new(move || queue.pending_count()));
        }

        let llm = Arc::new(LlmClient::new(
            config.llm.endpoints.clone(),
            config.llm.model.clone(),
            config.llm.max_tokens,
            config.llm.temperature,
            Duration::from_secs(config.llm.request_timeout_secs),
        )?);
        let llm_dyn: Arc<dyn CompletionClient> = Arc::clone(&llm) as Arc<dyn CompletionClient>;

        let llm_config_source: LlmConfigSource = {
            let llm = Arc::clone(&llm);
            let fallback = config.llm.endpoints[0].clone();
            Arc::new(move || {
                let (endpoint, api_key) = llm
                    .preferred_endpoint()
                    .unwrap_or_else(|| (fallback.endpoint.clone(), fallback.api_key.clone()));
                WorkerLlmConfig {
                    endpoint,
                    model: llm.model().to_string(),
                    max_tokens: llm.max_tokens(),
                    temperature: llm.temperature(),
                    api_key,
                }
            })
        };

        let timed_out = TimedOutBranches::new();
        let sandbox = {
            let event_log = Arc::clone(&event_log);
            SubprocessSandbox::new(config.worker.sandbox_command.clone()).with_progress(Arc::new(
                move |task_id, tag, message| {
                    event_log.emit(
                        &LogEvent::info(tag, "worker", message).with_task(task_id),
                    );
                },
            ))
        };
        let pool = Arc::new(WorkerPool::new(
            Arc::new(sandbox),
            PayloadTemplate {
                system_prompt: prompts.worker.clone(),
                repo_url: config.git.repo_url.clone(),
                git_token: config.git.token.clone(),
            },
            worker_timeout,
            timed_out.clone(),
        ));

        let merge = Arc::new(MergeQueue::new(
            Arc::clone(&git),
            config.git.main_branch.clone(),
            config.git.merge_strategy,
            timed_out,
        ));
        {
            let monitor = Arc::clone(&monitor);
            let event_log = Arc::clone(&event_log);
            merge.on_merge_result(Arc::new(move |outcome| {
                monitor.record_merge_attempt(outcome.success);
                event_log.emit(
                    &LogEvent::info("merge-queue", "merge", format!("{}: {}", outcome.branch, outcome.message))
                        .with_data(serde_json::to_value(outcome).unwrap_or_default()),
                );
            }));
        }

        let limiter = Arc::new(Semaphore::new(config.worker.max_workers));
        let subplanner = Arc::new(SubPlanner::new(
            Arc::clone(&llm_dyn),
            prompts.sub_planner.clone(),
            Arc::clone(&pool),
            Arc::clone(&limiter),
            Arc::clone(&llm_config_source),
            SubPlannerConfig::default(),
        ));

        let planner = Arc::new(Planner::new(PlannerOptions {
            llm: Arc::clone(&llm_dyn),
            system_prompt: prompts.planner.clone(),
            queue: Arc::clone(&queue),
            pool: Arc::clone(&pool),
            git: Arc::clone(&git),
            monitor: Arc::clone(&monitor),
            merge: Arc::clone(&merge),
            subplanner,
            limiter,
            llm_config_source,
            loop_settings: config.planner_loop.clone(),
            branch_prefix: config.git.branch_prefix.clone(),
        }));

        // Merge conflicts feed back into the planner as bounded fix tasks.
        {
            let fixer = ConflictFixer::new(config.git.branch_prefix.clone());
            let planner = Arc::clone(&planner);
            merge.on_conflict(Arc::new(move |branch, files| {
                if let Some(task) = fixer.make_fix_task(branch, files) {
                    info!(branch, task_id = %task.id, "injecting conflict-fix task");
                    planner.inject_task(task);
                }
            }));
        }

        let reconciler = {
            let planner = Arc::clone(&planner);
            Arc::new(Reconciler::new(
                Arc::clone(&git),
                llm_dyn,
                prompts.reconciler.clone(),
                config.reconciler.clone(),
                config.git.branch_prefix.clone(),
                Arc::new(move |task| planner.inject_task(task)),
            ))
        };

        // Task lifecycle and metrics onto the NDJSON feed.
        {
            let event_log = Arc::clone(&event_log);
            queue.on_status_change(Arc::new(move |task_id, from, to| {
                event_log.emit(
                    &LogEvent::info("queue", "queue", format!("{} -> {}", from, to))
                        .with_task(task_id),
                );
            }));
        }
        {
            let event_log = Arc::clone(&event_log);
            monitor.on_snapshot(Arc::new(move |snapshot| {
                event_log.emit(
                    &LogEvent::info("monitor", "monitor", "metrics")
                        .with_data(serde_json::to_value(snapshot).unwrap_or_default()),
                );
            }));
        }

        Ok(Self {
            llm,
            queue,
            monitor,
            merge,
            planner,
            reconciler,
            shutdown_done: AtomicBool::new(false),
        })
    }

    /// The concrete LLM client, for readiness probing.
    pub fn llm(&self) -> &Arc<LlmClient> {
        &self.llm
    }

    pub fn planner(&self) -> &Arc<Planner> {
        &self.planner
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    /// Run the full system until the planner goes idle, then shut down.
    pub async fn run(&self, request: &str) -> Result<()> {
        Arc::clone(&self.monitor).start();
        Arc::clone(&self.merge).start_background();
        Arc::clone(&self.reconciler).start();

        let result = Arc::clone(&self.planner).run(request).await;
        self.shutdown().await;
        result?;

        let snapshot = self.monitor.snapshot();
        info!(
            completed = snapshot.completed_total,
            failed = snapshot.failed_total,
            merged = snapshot.merge_successes,
            tokens = snapshot.total_tokens_used,
            "run finished"
        );
        Ok(())
    }

    /// Stop all subsystems in dependency order. Idempotent.
    pub async fn shutdown(&self) {
        if self.shutdown_done.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down");
        self.planner.stop();
        self.reconciler.stop().await;
        self.merge.stop_background().await;
        self.monitor.stop().await;
        // The worker pool is stateless; in-flight sandboxes are killed by
        // their own timeouts or die with the process.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("src/f{}.rs", i)).collect()
    }

    #[test]
    fn test_fix_task_shape() {
        let fixer = ConflictFixer::new("swarm/");
        let task = fixer.make_fix_task("swarm/task-007-auth", &files(3)).unwrap();

        assert_eq!(task.id, "conflict-fix-001");
        assert_eq!(task.priority, 1);
        assert_eq!(task.scope.len(), 3);
        assert!(task.branch.starts_with("swarm/conflict-fix-001-"));
        assert!(task.description.contains("swarm/task-007-auth"));
    }

    #[test]
    fn test_fix_task_scope_capped_at_five() {
        let fixer = ConflictFixer::new("swarm/");
        let task = fixer.make_fix_task("swarm/task-1", &files(12)).unwrap();
        assert_eq!(task.scope.len(), CONFLICT_SCOPE_MAX);
    }

    #[test]
    fn test_fix_tasks_capped_per_run() {
        let fixer = ConflictFixer::new("swarm/");
        let mut issued = 0;
        for i in 0..25 {
            if fixer
                .make_fix_task(&format!("swarm/task-{}", i), &files(1))
                .is_some()
            {
                issued += 1;
            }
        }
        assert_eq!(issued, MAX_CONFLICT_FIX_TASKS);
        assert_eq!(fixer.issued(), MAX_CONFLICT_FIX_TASKS);
    }

    #[test]
    fn test_no_cascading_fixes() {
        let fixer = ConflictFixer::new("swarm/");
        assert!(fixer
            .make_fix_task("swarm/conflict-fix-001-xyz", &files(1))
            .is_none());
        // The cap is not consumed by suppressed cascades.
        assert_eq!(fixer.issued(), 0);
    }

    #[test]
    fn test_fix_ids_are_sequential() {
        let fixer = ConflictFixer::new("swarm/");
        let t1 = fixer.make_fix_task("swarm/a", &files(1)).unwrap();
        let t2 = fixer.make_fix_task("swarm/b", &files(1)).unwrap();
        assert_eq!(t1.id, "conflict-fix-001");
        assert_eq!(t2.id, "conflict-fix-002");
    }
}
