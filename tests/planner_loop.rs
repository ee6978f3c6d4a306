// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! End-to-end planner loop scenarios with a scripted LLM and fake sandboxes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use maestro::config::LoopSettings;
use maestro::error::{LlmError, PlannerError, WorkerError};
use maestro::gitops::GitClient;
use maestro::llm::{Completion, CompletionClient, CompletionOverrides, TokenUsage};
use maestro::merge::{MergeQueue, MergeStrategy};
use maestro::monitor::Monitor;
use maestro::planner::{Planner, PlannerOptions};
use maestro::queue::TaskQueue;
use maestro::subplanner::{SubPlanner, SubPlannerConfig};
use maestro::types::{
    ChatMessage, Handoff, HandoffMetrics, HandoffStatus, TaskStatus, WorkerLlmConfig,
    WorkerPayload,
};
use maestro::worker::{PayloadTemplate, Sandbox, TimedOutBranches, WorkerPool};

/// LLM stub that replays scripted responses, then keeps answering with an
/// empty batch.
struct ScriptedLlm {
    responses: Mutex<Vec<String>>,
    calls: AtomicUsize,
    fail_always: bool,
}

impl ScriptedLlm {
    fn new(responses: Vec<&str>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(String::from).collect()),
            calls: AtomicUsize::new(0),
            fail_always: false,
        }
    }

    fn failing() -> Self {
        Self {
            responses: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            fail_always: true,
        }
    }
}

#[async_trait]
impl CompletionClient for ScriptedLlm {
    async fn complete(
        &self,
        _messages: &[ChatMessage],
        _overrides: &CompletionOverrides,
    ) -> Result<Completion, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_always {
            return Err(LlmError::AllEndpointsFailed {
                attempts: 1,
                detail: "scripted outage".to_string(),
            });
        }
        let mut responses = self.responses.lock().unwrap();
        let content = if responses.is_empty() {
            r#"{"tasks":[]}"#.to_string()
        } else {
            responses.remove(0)
        };
        Ok(Completion {
            content,
            usage: TokenUsage {
                prompt_tokens: 100,
                completion_tokens: 50,
                total_tokens: 150,
            },
            finish_reason: "stop".to_string(),
            endpoint: "scripted".to_string(),
            latency_ms: 1,
        })
    }
}

/// Sandbox stub with a concurrency gauge and configurable behavior.
struct FakeSandbox {
    delay: Duration,
    fail: bool,
    zero_metrics: bool,
    current: AtomicUsize,
    max_seen: AtomicUsize,
}

impl FakeSandbox {
    fn new() -> Self {
        Self {
            delay: Duration::ZERO,
            fail: false,
            zero_metrics: false,
            current: AtomicUsize::new(0),
            max_seen: AtomicUsize::new(0),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    fn with_zero_metrics(mut self) -> Self {
        self.zero_metrics = true;
        self
    }
}

#[async_trait]
impl Sandbox for FakeSandbox {
    async fn run(
        &self,
        payload: &WorkerPayload,
        _timeout: Duration,
    ) -> Result<Handoff, WorkerError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.current.fetch_sub(1, Ordering::SeqCst);

        if self.fail {
            return Err(WorkerError::NoHandoff(payload.task.id.clone()));
        }
        let metrics = if self.zero_metrics {
            HandoffMetrics::default()
        } else {
            HandoffMetrics {
                tokens_used: 1_000,
                tool_call_count: 5,
                duration_ms: 50,
                lines_added: 10,
                ..Default::default()
            }
        };
        Ok(Handoff {
            task_id: payload.task.id.clone(),
            status: HandoffStatus::Complete,
            summary: format!("completed {}", payload.task.id),
            files_changed: payload.task.scope.clone(),
            diff: if self.zero_metrics {
                String::new()
            } else {
                "--- a\n+++ b\n".to_string()
            },
            concerns: vec![],
            suggestions: vec![],
            metrics,
        })
    }
}

struct Harness {
    planner: Arc<Planner>,
    queue: Arc<TaskQueue>,
    monitor: Arc<Monitor>,
    llm: Arc<ScriptedLlm>,
    sandbox: Arc<FakeSandbox>,
    _dir: tempfile::TempDir,
}

fn harness(responses: Vec<&str>, sandbox: FakeSandbox, max_workers: usize) -> Harness {
    harness_with(ScriptedLlm::new(responses), sandbox, max_workers, LoopSettings {
        sleep_ms: 10,
        min_handoffs_for_replan: 3,
        backoff_base_ms: 1,
        backoff_max_ms: 5,
        max_consecutive_errors: 10,
        max_iterations: 1_000,
    })
}

fn harness_with(
    llm: ScriptedLlm,
    sandbox: FakeSandbox,
    max_workers: usize,
    settings: LoopSettings,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let git = Arc::new(GitClient::new(dir.path()));

    let llm = Arc::new(llm);
    let sandbox = Arc::new(sandbox);
    let queue = Arc::new(TaskQueue::new());
    let monitor = Arc::new(Monitor::new(
        Duration::from_millis(100),
        Duration::from_secs(1800),
        0.001,
    ));
    {
        let queue = Arc::clone(&queue);
        monitor.set_pending_provider(Arc::new(move || queue.pending_count()));
    }

    let timed_out = TimedOutBranches::new();
    let pool = Arc::new(WorkerPool::new(
        Arc::clone(&sandbox) as Arc<dyn Sandbox>,
        PayloadTemplate {
            system_prompt: "worker".to_string(),
            repo_url: "https://example.com/repo.git".to_string(),
            git_token: String::new(),
        },
        Duration::from_secs(30),
        timed_out.clone(),
    ));
    let merge = Arc::new(MergeQueue::new(
        Arc::clone(&git),
        "main",
        MergeStrategy::FastForward,
        timed_out,
    ));
    let limiter = Arc::new(Semaphore::new(max_workers));
    let llm_config_source = Arc::new(|| WorkerLlmConfig {
        endpoint: "http://llm".to_string(),
        model: "glm-5".to_string(),
        max_tokens: 1024,
        temperature: 0.3,
        api_key: None,
    });
    let subplanner = Arc::new(SubPlanner::new(
        Arc::clone(&llm) as Arc<dyn CompletionClient>,
        "split",
        Arc::clone(&pool),
        Arc::clone(&limiter),
        llm_config_source.clone(),
        SubPlannerConfig::default(),
    ));

    let planner = Arc::new(Planner::new(PlannerOptions {
        llm: Arc::clone(&llm) as Arc<dyn CompletionClient>,
        system_prompt: "plan".to_string(),
        queue: Arc::clone(&queue),
        pool,
        git,
        monitor: Arc::clone(&monitor),
        merge,
        subplanner,
        limiter,
        llm_config_source,
        loop_settings: settings,
        branch_prefix: "swarm/".to_string(),
    }));

    Harness {
        planner,
        queue,
        monitor,
        llm,
        sandbox,
        _dir: dir,
    }
}

#[tokio::test]
async fn empty_plan_halts_immediately() {
    let h = harness(
        vec![r#"{"scratchpad":"nothing to do","tasks":[]}"#],
        FakeSandbox::new(),
        4,
    );

    Arc::clone(&h.planner).run("trivial request").await.unwrap();

    assert_eq!(h.llm.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.planner.scratchpad(), "nothing to do");
    assert!(h.planner.dispatched_ids().is_empty());

    let snap = h.monitor.snapshot();
    assert_eq!(snap.completed_total, 0);
    assert_eq!(snap.failed_total, 0);
    assert_eq!(snap.active_workers, 0);
    assert_eq!(snap.pending_tasks, 0);
}

#[tokio::test]
async fn single_task_success_flows_to_completion() {
    let h = harness(
        vec![r#"{"scratchpad":"one task","tasks":[{"id":"t1","description":"edit a","scope":["src/a"]}]}"#],
        FakeSandbox::new(),
        4,
    );

    Arc::clone(&h.planner).run("build src/a").await.unwrap();

    assert_eq!(h.planner.dispatched_ids(), vec!["t1".to_string()]);
    assert_eq!(h.queue.get("t1").unwrap().status, TaskStatus::Complete);

    let handoffs = h.planner.collected_handoffs();
    assert_eq!(handoffs.len(), 1);
    assert_eq!(handoffs[0].status, HandoffStatus::Complete);
    assert_eq!(handoffs[0].files_changed, vec!["src/a".to_string()]);

    let snap = h.monitor.snapshot();
    assert_eq!(snap.completed_total, 1);
    assert_eq!(snap.failed_total, 0);
    assert_eq!(snap.total_tokens_used, 1_000 + 150 * 2);
}

#[tokio::test]
async fn truncated_response_salvages_first_task_only() {
    // Scenario: response cut off inside the second task object.
    let h = harness(
        vec![r#"{"scratchpad":"ok","tasks":[{"id":"t1","description":"a"},{"id":"t2","description":"b"#],
        FakeSandbox::new(),
        4,
    );

    Arc::clone(&h.planner).run("req").await.unwrap();

    assert_eq!(h.planner.dispatched_ids(), vec!["t1".to_string()]);
    assert_eq!(h.planner.scratchpad(), "ok");
    assert!(h.queue.get("t2").is_none());
}

#[tokio::test]
async fn duplicate_ids_are_filtered_across_iterations() {
    let batch1 = r#"{"scratchpad":"first","tasks":[{"id":"t1","description":"a"}]}"#;
    // The model misbehaves and re-emits t1 alongside a new task.
    let batch2 = r#"{"scratchpad":"second","tasks":[{"id":"t1","description":"again"},{"id":"t2","description":"b"}]}"#;
    let h = harness(vec![batch1, batch2], FakeSandbox::new(), 4);

    Arc::clone(&h.planner).run("req").await.unwrap();

    assert_eq!(
        h.planner.dispatched_ids(),
        vec!["t1".to_string(), "t2".to_string()]
    );
    // t1 went through its lifecycle exactly once.
    assert_eq!(h.queue.get("t1").unwrap().status, TaskStatus::Complete);
}

#[tokio::test]
async fn concurrency_never_exceeds_max_workers() {
    let tasks: Vec<String> = (0..8)
        .map(|i| format!(r#"{{"id":"t{}","description":"task {}"}}"#, i, i))
        .collect();
    let response = format!(r#"{{"scratchpad":"fanout","tasks":[{}]}}"#, tasks.join(","));
    let h = harness(
        vec![&response],
        FakeSandbox::new().with_delay(Duration::from_millis(50)),
        2,
    );

    Arc::clone(&h.planner).run("req").await.unwrap();

    assert_eq!(h.planner.dispatched_ids().len(), 8);
    assert!(
        h.sandbox.max_seen.load(Ordering::SeqCst) <= 2,
        "dispatch concurrency exceeded the limiter"
    );

    let snap = h.monitor.snapshot();
    assert_eq!(snap.completed_total, 8);
}

#[tokio::test]
async fn worker_failure_synthesizes_failed_handoff() {
    let h = harness(
        vec![r#"{"scratchpad":"","tasks":[{"id":"t1","description":"doomed"}]}"#],
        FakeSandbox::new().failing(),
        4,
    );

    Arc::clone(&h.planner).run("req").await.unwrap();

    assert_eq!(h.queue.get("t1").unwrap().status, TaskStatus::Failed);
    let handoffs = h.planner.collected_handoffs();
    assert_eq!(handoffs.len(), 1);
    assert_eq!(handoffs[0].status, HandoffStatus::Failed);
    assert!(handoffs[0].summary.contains("worker error"));
    assert_eq!(h.monitor.snapshot().failed_total, 1);
}

#[tokio::test]
async fn suspicious_complete_handoff_is_flagged_but_kept_complete() {
    // The sandbox says complete with zero tokens and zero tool calls: the
    // monitor flags it, but the status is taken verbatim.
    let h = harness(
        vec![r#"{"scratchpad":"","tasks":[{"id":"t1","description":"noop"}]}"#],
        FakeSandbox::new().with_zero_metrics(),
        4,
    );

    Arc::clone(&h.planner).run("req").await.unwrap();

    assert_eq!(h.queue.get("t1").unwrap().status, TaskStatus::Complete);
    let snap = h.monitor.snapshot();
    assert_eq!(snap.suspicious_tasks, 1);
    assert_eq!(snap.empty_diffs, 1);
    assert_eq!(snap.completed_total, 1);
}

#[tokio::test]
async fn llm_outage_aborts_after_max_consecutive_errors() {
    let h = harness_with(
        ScriptedLlm::failing(),
        FakeSandbox::new(),
        4,
        LoopSettings {
            sleep_ms: 5,
            min_handoffs_for_replan: 3,
            backoff_base_ms: 1,
            backoff_max_ms: 4,
            max_consecutive_errors: 3,
            max_iterations: 1_000,
        },
    );

    let err = Arc::clone(&h.planner).run("req").await.unwrap_err();
    assert!(matches!(err, PlannerError::MaxErrorsExceeded(3)));
    assert_eq!(h.llm.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn injected_tasks_bypass_the_llm() {
    let h = harness(
        vec![r#"{"scratchpad":"","tasks":[]}"#],
        FakeSandbox::new(),
        4,
    );

    let fix = maestro::types::Task::new("conflict-fix-001", "resolve conflicts")
        .with_scope(vec!["src/a".to_string()])
        .with_branch("swarm/conflict-fix-001")
        .with_priority(1);
    h.planner.inject_task(fix);

    Arc::clone(&h.planner).run("req").await.unwrap();

    // The injected task ran even though planning produced nothing.
    assert!(h
        .planner
        .dispatched_ids()
        .contains(&"conflict-fix-001".to_string()));
    assert_eq!(
        h.queue.get("conflict-fix-001").unwrap().status,
        TaskStatus::Complete
    );
}

#[tokio::test]
async fn stop_is_honored_at_tick_boundary() {
    let h = harness(
        vec![r#"{"scratchpad":"","tasks":[{"id":"t1","description":"slow"}]}"#],
        FakeSandbox::new().with_delay(Duration::from_secs(30)),
        4,
    );

    let planner = Arc::clone(&h.planner);
    let run = tokio::spawn(async move { planner.run("req").await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    h.planner.stop();

    let result = tokio::time::timeout(Duration::from_secs(2), run)
        .await
        .expect("planner did not stop in time")
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn oversized_task_routes_through_subplanner() {
    // Parent scope of 4 files crosses the decomposition threshold; the
    // second scripted response answers the sub-planner with two subtasks.
    let parent = r#"{"scratchpad":"big","tasks":[{"id":"big-1","description":"refactor","scope":["src/a.rs","src/b.rs","src/c.rs","src/d.rs"]}]}"#;
    let split = r#"[{"description":"half one","scope":["src/a.rs","src/b.rs"]},
                    {"description":"half two","scope":["src/c.rs","src/d.rs"]}]"#;
    let h = harness(vec![parent, split], FakeSandbox::new(), 8);

    Arc::clone(&h.planner).run("req").await.unwrap();

    assert_eq!(h.queue.get("big-1").unwrap().status, TaskStatus::Complete);
    let handoffs = h.planner.collected_handoffs();
    assert_eq!(handoffs.len(), 1);
    assert_eq!(handoffs[0].task_id, "big-1");
    // The parent handoff is the union of both children's files.
    assert_eq!(handoffs[0].files_changed.len(), 4);
    assert!(handoffs[0].summary.contains("2/2 subtasks complete"));
}
