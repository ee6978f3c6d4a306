// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Ephemeral sandbox worker pool.
//!
//! There are no long-lived workers: each dispatch spawns one sandbox
//! subprocess, hands it a JSON payload as its single argument, streams its
//! stdout, and parses the final line as the task's [`Handoff`]. A worker that
//! exceeds its wall-clock budget is killed outright and its branch is
//! remembered so the merge queue never attempts it.
//!
//! # Subprocess contract
//!
//! - argv: the configured sandbox command plus one JSON [`WorkerPayload`].
//! - stdout: NDJSON-ish; lines prefixed `[spawn]` or `[worker:<id>]` are
//!   progress logs, anything else is free-form noise, and the **last** line
//!   must be a JSON handoff.
//! - exit code: informative only; the handoff line is the truth.

use std::collections::HashSet;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::WorkerError;
use crate::types::{Handoff, Task, WorkerLlmConfig, WorkerPayload};

/// Notable worker lifecycle moments detected in progress output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    SandboxCreated,
    RepoCloned,
    WorkerStarted,
    BranchPushed,
}

impl WorkerPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SandboxCreated => "sandbox_created",
            Self::RepoCloned => "repo_cloned",
            Self::WorkerStarted => "worker_started",
            Self::BranchPushed => "branch_pushed",
        }
    }
}

/// A progress line split into its phase tag and message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressLine {
    /// `spawn`, `worker:<id>`, or `worker` when no prefix was present.
    pub tag: String,
    pub message: String,
}

/// Split a non-JSON worker output line into tag and message.
pub fn parse_progress(line: &str) -> ProgressLine {
    let trimmed = line.trim();
    if let Some(rest) = trimmed.strip_prefix("[spawn]") {
        return ProgressLine {
            tag: "spawn".to_string(),
            message: rest.trim().to_string(),
        };
    }
    if let Some(rest) = trimmed.strip_prefix("[worker:") {
        if let Some(end) = rest.find(']') {
            return ProgressLine {
                tag: format!("worker:{}", &rest[..end]),
                message: rest[end + 1..].trim().to_string(),
            };
        }
    }
    ProgressLine {
        tag: "worker".to_string(),
        message: trimmed.to_string(),
    }
}

/// Detect a lifecycle phase transition in a progress message.
pub fn detect_phase(message: &str) -> Option<WorkerPhase> {
    let lower = message.to_lowercase();
    if lower.contains("sandbox") && (lower.contains("creat") || lower.contains("ready")) {
        Some(WorkerPhase::SandboxCreated)
    } else if lower.contains("clon") {
        Some(WorkerPhase::RepoCloned)
    } else if lower.contains("worker start") || lower.contains("agent start") {
        Some(WorkerPhase::WorkerStarted)
    } else if lower.contains("push") {
        Some(WorkerPhase::BranchPushed)
    } else {
        None
    }
}

/// Branches whose workers were killed on timeout. The merge queue skips
/// these because their pushes may be half-finished.
#[derive(Clone, Default)]
pub struct TimedOutBranches {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl TimedOutBranches {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, branch: &str) {
        self.inner.lock().unwrap().insert(branch.to_string());
    }

    pub fn contains(&self, branch: &str) -> bool {
        self.inner.lock().unwrap().contains(branch)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}

/// Callback for worker progress lines: `(task_id, tag, message)`.
pub type ProgressCallback = Arc<dyn Fn(&str, &str, &str) + Send + Sync>;

/// Produces the LLM connection a freshly dispatched worker should use.
/// Routed through the client's current endpoint preference.
pub type LlmConfigSource = Arc<dyn Fn() -> WorkerLlmConfig + Send + Sync>;

/// The sandbox execution seam. Production uses [`SubprocessSandbox`]; tests
/// substitute an in-process fake returning canned handoffs.
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn run(&self, payload: &WorkerPayload, timeout: Duration)
        -> Result<Handoff, WorkerError>;
}

/// Sandbox implementation that spawns a child process per task.
pub struct SubprocessSandbox {
    command: Vec<String>,
    on_progress: Option<ProgressCallback>,
}

impl SubprocessSandbox {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            on_progress: None,
        }
    }

    /// Set a callback receiving every progress line.
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = Some(callback);
        self
    }

    fn emit_progress(&self, task_id: &str, line: &str) {
        let progress = parse_progress(line);
        if let Some(phase) = detect_phase(&progress.message) {
            info!(
                task_id,
                tag = %progress.tag,
                phase = phase.as_str(),
                "worker phase"
            );
        } else {
            debug!(task_id, tag = %progress.tag, "{}", progress.message);
        }
        if let Some(callback) = &self.on_progress {
            callback(task_id, &progress.tag, &progress.message);
        }
    }
}

#[async_trait]
impl Sandbox for SubprocessSandbox {
    async fn run(
        &self,
        payload: &WorkerPayload,
        timeout: Duration,
    ) -> Result<Handoff, WorkerError> {
        let task_id = payload.task.id.clone();
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| WorkerError::SpawnFailed("empty sandbox command".to_string()))?;
        let payload_json = serde_json::to_string(payload)
            .map_err(|e| WorkerError::SpawnFailed(e.to_string()))?;

        let mut child = Command::new(program)
            .args(args)
            .arg(payload_json)
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| WorkerError::SpawnFailed(e.to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerError::SpawnFailed("no stdout handle".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| WorkerError::SpawnFailed("no stderr handle".to_string()))?;

        // Drain stderr concurrently so the child never blocks on a full pipe.
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let deadline = tokio::time::Instant::now() + timeout;
        let mut lines = BufReader::new(stdout).lines();
        let mut last_line: Option<String> = None;

        loop {
            match tokio::time::timeout_at(deadline, lines.next_line()).await {
                Err(_) => {
                    warn!(task_id = %task_id, "worker timed out, killing");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    stderr_task.abort();
                    return Err(WorkerError::Timeout {
                        task_id,
                        timeout_secs: timeout.as_secs(),
                    });
                }
                Ok(Ok(Some(line))) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    if serde_json::from_str::<serde_json::Value>(trimmed).is_err() {
                        self.emit_progress(&task_id, trimmed);
                    }
                    last_line = Some(trimmed.to_string());
                }
                Ok(Ok(None)) => break,
                Ok(Err(e)) => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    stderr_task.abort();
                    return Err(WorkerError::Io(e));
                }
            }
        }

        let status = match tokio::time::timeout_at(deadline, child.wait()).await {
            Err(_) => {
                warn!(task_id = %task_id, "worker lingered after stdout close, killing");
                let _ = child.start_kill();
                let _ = child.wait().await;
                stderr_task.abort();
                return Err(WorkerError::Timeout {
                    task_id,
                    timeout_secs: timeout.as_secs(),
                });
            }
            Ok(status) => status?,
        };
        let stderr_text = stderr_task.await.unwrap_or_default();

        let Some(final_line) = last_line else {
            if status.success() {
                return Err(WorkerError::NoHandoff(task_id));
            }
            return Err(WorkerError::Crashed {
                code: status.code(),
                stderr: clip(&stderr_text, 500),
            });
        };

        match serde_json::from_str::<Handoff>(&final_line) {
            Ok(handoff) => Ok(handoff),
            Err(_) if !status.success() => Err(WorkerError::Crashed {
                code: status.code(),
                stderr: clip(&stderr_text, 500),
            }),
            Err(_) => Err(WorkerError::MalformedHandoff(clip(&final_line, 200))),
        }
    }
}

fn clip(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.trim().to_string()
    } else {
        let end = s
            .char_indices()
            .take_while(|(i, _)| *i < max)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        format!("{}...", s[..end].trim())
    }
}

// ============================================================================
// Worker pool
// ============================================================================

/// Static parts of the payload, shared by every dispatch.
#[derive(Debug, Clone)]
pub struct PayloadTemplate {
    pub system_prompt: String,
    pub repo_url: String,
    pub git_token: String,
}

/// Stateless dispatcher over a [`Sandbox`]. The concurrency limiter lives
/// upstream in the planner; the pool just runs what it is given and keeps
/// the bookkeeping the rest of the system needs.
pub struct WorkerPool {
    sandbox: Arc<dyn Sandbox>,
    template: PayloadTemplate,
    timeout: Duration,
    timed_out: TimedOutBranches,
    active: AtomicUsize,
}

impl WorkerPool {
    pub fn new(
        sandbox: Arc<dyn Sandbox>,
        template: PayloadTemplate,
        timeout: Duration,
        timed_out: TimedOutBranches,
    ) -> Self {
        Self {
            sandbox,
            template,
            timeout,
            timed_out,
            active: AtomicUsize::new(0),
        }
    }

    /// Number of dispatches currently inside a sandbox.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Shared set of branches whose workers were killed.
    pub fn timed_out_branches(&self) -> &TimedOutBranches {
        &self.timed_out
    }

    /// Run one task in a fresh sandbox and return its handoff.
    pub async fn assign_task(
        &self,
        task: &Task,
        llm_config: WorkerLlmConfig,
    ) -> Result<Handoff, WorkerError> {
        let payload = WorkerPayload {
            task: task.clone(),
            system_prompt: self.template.system_prompt.clone(),
            repo_url: self.template.repo_url.clone(),
            git_token: self.template.git_token.clone(),
            llm_config,
            trace: None,
        };

        self.active.fetch_add(1, Ordering::SeqCst);
        let result = self.sandbox.run(&payload, self.timeout).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        if matches!(result, Err(WorkerError::Timeout { .. })) {
            self.timed_out.insert(&task.branch);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HandoffStatus;

    fn llm_config() -> WorkerLlmConfig {
        WorkerLlmConfig {
            endpoint: "https://llm.example.com".to_string(),
            model: "glm-5".to_string(),
            max_tokens: 2048,
            temperature: 0.3,
            api_key: None,
        }
    }

    fn template() -> PayloadTemplate {
        PayloadTemplate {
            system_prompt: "You are a coding agent.".to_string(),
            repo_url: "https://example.com/repo.git".to_string(),
            git_token: String::new(),
        }
    }

    fn pool_with(command: Vec<&str>, timeout_secs: u64) -> WorkerPool {
        let sandbox = Arc::new(SubprocessSandbox::new(
            command.into_iter().map(String::from).collect(),
        ));
        WorkerPool::new(
            sandbox,
            template(),
            Duration::from_secs(timeout_secs),
            TimedOutBranches::new(),
        )
    }

    #[test]
    fn test_parse_progress_prefixes() {
        let p = parse_progress("[spawn] creating sandbox");
        assert_eq!(p.tag, "spawn");
        assert_eq!(p.message, "creating sandbox");

        let p = parse_progress("[worker:w-3] tool call write_file");
        assert_eq!(p.tag, "worker:w-3");
        assert_eq!(p.message, "tool call write_file");

        let p = parse_progress("loose output");
        assert_eq!(p.tag, "worker");
        assert_eq!(p.message, "loose output");
    }

    #[test]
    fn test_detect_phase() {
        assert_eq!(
            detect_phase("Creating sandbox..."),
            Some(WorkerPhase::SandboxCreated)
        );
        assert_eq!(
            detect_phase("Cloning repository into /workspace"),
            Some(WorkerPhase::RepoCloned)
        );
        assert_eq!(
            detect_phase("worker started, 15 max iterations"),
            Some(WorkerPhase::WorkerStarted)
        );
        assert_eq!(
            detect_phase("Branch pushed to origin"),
            Some(WorkerPhase::BranchPushed)
        );
        assert_eq!(detect_phase("iteration 3 of 15"), None);
    }

    #[test]
    fn test_timed_out_branches() {
        let branches = TimedOutBranches::new();
        assert!(branches.is_empty());
        branches.insert("swarm/task-1");
        branches.insert("swarm/task-1");
        assert!(branches.contains("swarm/task-1"));
        assert!(!branches.contains("swarm/task-2"));
        assert_eq!(branches.len(), 1);
    }

    #[tokio::test]
    async fn test_final_line_handoff() {
        let pool = pool_with(
            vec![
                "sh",
                "-c",
                r#"echo '[spawn] creating sandbox'; echo 'noise'; echo '{"taskId":"t1","status":"complete","summary":"done","filesChanged":["src/a"]}'"#,
            ],
            30,
        );
        let task = Task::new("t1", "do things").with_branch("swarm/t1");
        let handoff = pool.assign_task(&task, llm_config()).await.unwrap();
        assert_eq!(handoff.status, HandoffStatus::Complete);
        assert_eq!(handoff.files_changed, vec!["src/a".to_string()]);
        assert_eq!(pool.active_count(), 0);
        assert!(pool.timed_out_branches().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_kills_and_records_branch() {
        let pool = pool_with(vec!["sh", "-c", "sleep 5 #"], 1);
        let task = Task::new("t-slow", "sleepy").with_branch("swarm/t-slow");

        let start = std::time::Instant::now();
        let err = pool.assign_task(&task, llm_config()).await.unwrap_err();
        assert!(start.elapsed() < Duration::from_secs(4));
        assert!(matches!(err, WorkerError::Timeout { .. }));
        assert!(pool.timed_out_branches().contains("swarm/t-slow"));
    }

    #[tokio::test]
    async fn test_malformed_final_line() {
        let pool = pool_with(vec!["sh", "-c", "echo 'this is not a handoff'"], 30);
        let task = Task::new("t1", "x");
        let err = pool.assign_task(&task, llm_config()).await.unwrap_err();
        assert!(matches!(err, WorkerError::MalformedHandoff(_)));
    }

    #[tokio::test]
    async fn test_no_output() {
        let pool = pool_with(vec!["true"], 30);
        let task = Task::new("t1", "x");
        let err = pool.assign_task(&task, llm_config()).await.unwrap_err();
        assert!(matches!(err, WorkerError::NoHandoff(_)));
    }

    #[tokio::test]
    async fn test_crash_without_handoff() {
        let pool = pool_with(vec!["sh", "-c", "echo oops >&2; exit 3"], 30);
        let task = Task::new("t1", "x");
        let err = pool.assign_task(&task, llm_config()).await.unwrap_err();
        match err {
            WorkerError::Crashed { code, stderr } => {
                assert_eq!(code, Some(3));
                assert!(stderr.contains("oops"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_nonzero_exit_with_valid_handoff_is_accepted() {
        let pool = pool_with(
            vec![
                "sh",
                "-c",
                r#"echo '{"taskId":"t1","status":"partial","summary":"half"}'; exit 1"#,
            ],
            30,
        );
        let task = Task::new("t1", "x");
        let handoff = pool.assign_task(&task, llm_config()).await.unwrap();
        assert_eq!(handoff.status, HandoffStatus::Partial);
    }

    #[tokio::test]
    async fn test_progress_callback_receives_tagged_lines() {
        let seen: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let sandbox = SubprocessSandbox::new(
            vec![
                "sh".to_string(),
                "-c".to_string(),
                r#"echo '[spawn] booting'; echo '{"taskId":"t1","status":"complete","summary":""}'"#
                    .to_string(),
            ],
        )
        .with_progress(Arc::new(move |_task, tag, message| {
            seen_clone
                .lock()
                .unwrap()
                .push((tag.to_string(), message.to_string()));
        }));
        let pool = WorkerPool::new(
            Arc::new(sandbox),
            template(),
            Duration::from_secs(30),
            TimedOutBranches::new(),
        );

        let task = Task::new("t1", "x");
        pool.assign_task(&task, llm_config()).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], ("spawn".to_string(), "booting".to_string()));
    }
}
