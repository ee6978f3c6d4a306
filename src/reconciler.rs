// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Periodic repository healthcheck.
//!
//! The reconciler runs the configured build/test oracle against the mainline
//! checkout on an interval. When a command fails, the captured output is
//! grouped by file, summarized for the LLM, and the response is turned into
//! a bounded set of priority-1 fix tasks injected into the planner. An LLM
//! failure skips the sweep; the next interval retries.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ReconcilerSettings;
use crate::gitops::GitClient;
use crate::llm::{CompletionClient, CompletionOverrides};
use crate::planner::parse::{parse_plan, slug};
use crate::types::{ChatMessage, Task};

/// Callback that feeds a fix task into the planner's dispatch pipeline.
pub type InjectFn = Arc<dyn Fn(Task) + Send + Sync>;

/// Lines kept per file in the failure report.
const REPORT_LINES_PER_FILE: usize = 5;

/// Character budget of the failure report sent to the LLM.
const REPORT_MAX_CHARS: usize = 4_000;

/// One failed oracle command and its captured output.
#[derive(Debug, Clone)]
pub struct CheckFailure {
    pub command: String,
    pub output: String,
}

/// Periodic build/test oracle and fix-task generator.
pub struct Reconciler {
    git: Arc<GitClient>,
    llm: Arc<dyn CompletionClient>,
    system_prompt: String,
    settings: ReconcilerSettings,
    branch_prefix: String,
    inject: InjectFn,
    fix_seq: AtomicU32,
    stop_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Reconciler {
    pub fn new(
        git: Arc<GitClient>,
        llm: Arc<dyn CompletionClient>,
        system_prompt: impl Into<String>,
        settings: ReconcilerSettings,
        branch_prefix: impl Into<String>,
        inject: InjectFn,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            git,
            llm,
            system_prompt: system_prompt.into(),
            settings,
            branch_prefix: branch_prefix.into(),
            inject,
            fix_seq: AtomicU32::new(0),
            stop_tx,
            handle: Mutex::new(None),
        }
    }

    /// Start the periodic sweep task. Idempotent.
    pub fn start(self: Arc<Self>) {
        let mut handle_slot = self.handle.lock().unwrap();
        if handle_slot.is_some() {
            return;
        }
        let reconciler = Arc::clone(&self);
        let mut stop_rx = self.stop_tx.subscribe();
        let interval = Duration::from_secs(self.settings.interval_secs);
        *handle_slot = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = tokio::time::sleep(interval) => reconciler.sweep().await,
                }
            }
            info!("reconciler stopped");
        }));
    }

    /// Stop the periodic task. Idempotent.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// One sweep: run the oracle, and on failure inject fix tasks.
    pub async fn sweep(&self) {
        if self.settings.check_commands.is_empty() {
            debug!("no check commands configured; skipping sweep");
            return;
        }

        let failures = self.run_checks().await;
        if failures.is_empty() {
            info!("repository healthy");
            return;
        }

        let report = build_failure_report(&failures);
        match self.generate_fix_tasks(&report).await {
            Ok(tasks) => {
                info!(count = tasks.len(), "injecting fix tasks");
                for task in tasks {
                    (self.inject)(task);
                }
            }
            Err(e) => {
                // Skipped, not fatal: the next sweep retries.
                warn!(error = %e, "reconciler LLM call failed; skipping sweep");
            }
        }
    }

    /// Run the oracle commands against the checkout, holding the git lock so
    /// the merge queue cannot mutate the tree mid-build.
    async fn run_checks(&self) -> Vec<CheckFailure> {
        let _guard = self.git.lock().await;
        let mut failures = Vec::new();

        for command in &self.settings.check_commands {
            debug!(command = %command, "running check");
            let result = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(command)
                .current_dir(self.git.repo_path())
                .output()
                .await;

            match result {
                Ok(output) if output.status.success() => {}
                Ok(output) => {
                    let mut text = String::from_utf8_lossy(&output.stderr).into_owned();
                    text.push('\n');
                    text.push_str(&String::from_utf8_lossy(&output.stdout));
                    failures.push(CheckFailure {
                        command: command.clone(),
                        output: text,
                    });
                }
                Err(e) => failures.push(CheckFailure {
                    command: command.clone(),
                    output: format!("failed to spawn: {}", e),
                }),
            }
        }
        failures
    }

    async fn generate_fix_tasks(&self, report: &str) -> Result<Vec<Task>, crate::error::LlmError> {
        let messages = vec![
            ChatMessage::system(&self.system_prompt),
            ChatMessage::user(format!(
                "The mainline build is broken. Produce at most {} fix tasks as a \
                 JSON array of objects with description and scope fields.\n\n{}",
                self.settings.max_fix_tasks, report
            )),
        ];
        let completion = self
            .llm
            .complete(&messages, &CompletionOverrides::default())
            .await?;

        let (_, raw_tasks) = parse_plan(&completion.content).into_parts();
        let mut tasks = Vec::new();
        for raw in raw_tasks.into_iter().take(self.settings.max_fix_tasks) {
            let Some(description) = raw.description.filter(|d| !d.trim().is_empty()) else {
                continue;
            };
            let n = self.fix_seq.fetch_add(1, Ordering::SeqCst) + 1;
            let id = format!("fix-{:03}", n);
            let branch = format!("{}{}-{}", self.branch_prefix, id, slug(&description));
            tasks.push(
                Task::new(id, description)
                    .with_scope(raw.scope)
                    .with_acceptance(
                        raw.acceptance
                            .unwrap_or_else(|| "the build and tests pass".to_string()),
                    )
                    .with_branch(branch)
                    .with_priority(1),
            );
        }
        Ok(tasks)
    }
}

static FILE_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9_][A-Za-z0-9_./-]*\.[A-Za-z]{1,4}(?::\d+)?").unwrap());

/// Group error lines by the first file-looking token they mention.
pub fn group_errors_by_file(output: &str) -> BTreeMap<String, Vec<String>> {
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let key = FILE_TOKEN
            .find(trimmed)
            .map(|m| {
                let token = m.as_str();
                token.split(':').next().unwrap_or(token).to_string()
            })
            .unwrap_or_else(|| "general".to_string());
        groups.entry(key).or_default().push(trimmed.to_string());
    }
    groups
}

/// Compact failure report: per-file error groups, line- and size-capped.
pub fn build_failure_report(failures: &[CheckFailure]) -> String {
    let mut report = String::new();
    for failure in failures {
        report.push_str(&format!("# Command failed: {}\n", failure.command));
        for (file, lines) in group_errors_by_file(&failure.output) {
            report.push_str(&format!("## {}\n", file));
            for line in lines.iter().take(REPORT_LINES_PER_FILE) {
                report.push_str("  ");
                report.push_str(line);
                report.push('\n');
            }
            if lines.len() > REPORT_LINES_PER_FILE {
                report.push_str(&format!(
                    "  (+{} more lines)\n",
                    lines.len() - REPORT_LINES_PER_FILE
                ));
            }
        }
        if report.len() > REPORT_MAX_CHARS {
            report.truncate(
                report
                    .char_indices()
                    .take_while(|(i, _)| *i < REPORT_MAX_CHARS)
                    .last()
                    .map(|(i, c)| i + c.len_utf8())
                    .unwrap_or(0),
            );
            report.push_str("\n(truncated)\n");
            break;
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::{Completion, TokenUsage};
    use async_trait::async_trait;

    struct ScriptedLlm {
        response: Option<String>,
    }

    #[async_trait]
    impl CompletionClient for ScriptedLlm {
        async fn complete(
            &self,
            _messages: &[ChatMessage],
            _overrides: &CompletionOverrides,
        ) -> Result<Completion, LlmError> {
            match &self.response {
                Some(content) => Ok(Completion {
                    content: content.clone(),
                    usage: TokenUsage::default(),
                    finish_reason: "stop".to_string(),
                    endpoint: "scripted".to_string(),
                    latency_ms: 1,
                }),
                None => Err(LlmError::NotConfigured),
            }
        }
    }

    fn reconciler(
        response: Option<&str>,
        check_commands: Vec<String>,
        repo: &std::path::Path,
    ) -> (Arc<Reconciler>, Arc<Mutex<Vec<Task>>>) {
        let injected: Arc<Mutex<Vec<Task>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&injected);
        let reconciler = Arc::new(Reconciler::new(
            Arc::new(GitClient::new(repo)),
            Arc::new(ScriptedLlm {
                response: response.map(String::from),
            }),
            "You fix broken builds.",
            ReconcilerSettings {
                interval_secs: 300,
                check_commands,
                max_fix_tasks: 5,
            },
            "swarm/",
            Arc::new(move |task| sink.lock().unwrap().push(task)),
        ));
        (reconciler, injected)
    }

    #[test]
    fn test_group_errors_by_file() {
        let output = "\
src/lib.rs:10: error: mismatched types
src/lib.rs:42: error: missing lifetime
tests/api.rs:7: assertion failed
everything is on fire";
        let groups = group_errors_by_file(output);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups["src/lib.rs"].len(), 2);
        assert_eq!(groups["tests/api.rs"].len(), 1);
        assert_eq!(groups["general"].len(), 1);
    }

    #[test]
    fn test_failure_report_caps_lines() {
        let output = (0..20)
            .map(|i| format!("src/lib.rs:{}: error", i))
            .collect::<Vec<_>>()
            .join("\n");
        let report = build_failure_report(&[CheckFailure {
            command: "cargo check".to_string(),
            output,
        }]);
        assert!(report.contains("# Command failed: cargo check"));
        assert!(report.contains("## src/lib.rs"));
        assert!(report.contains("(+15 more lines)"));
    }

    #[tokio::test]
    async fn test_sweep_healthy_repo_injects_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (reconciler, injected) =
            reconciler(Some("[]"), vec!["true".to_string()], dir.path());
        reconciler.sweep().await;
        assert!(injected.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_failure_injects_priority_one_fix_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let response = r#"[
            {"description": "fix type mismatch in lib", "scope": ["src/lib.rs"]},
            {"description": "fix api test", "scope": ["tests/api.rs"]}
        ]"#;
        let (reconciler, injected) = reconciler(
            Some(response),
            vec!["echo 'src/lib.rs:10: error: boom' >&2; exit 1".to_string()],
            dir.path(),
        );
        reconciler.sweep().await;

        let tasks = injected.lock().unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].id, "fix-001");
        assert_eq!(tasks[0].priority, 1);
        assert_eq!(tasks[0].scope, vec!["src/lib.rs".to_string()]);
        assert!(tasks[0].branch.starts_with("swarm/fix-001-"));
    }

    #[tokio::test]
    async fn test_fix_tasks_capped() {
        let dir = tempfile::tempdir().unwrap();
        let many: Vec<String> = (0..10)
            .map(|i| format!(r#"{{"description": "fix {}", "scope": []}}"#, i))
            .collect();
        let response = format!("[{}]", many.join(","));
        let (reconciler, injected) =
            reconciler(Some(&response), vec!["false".to_string()], dir.path());
        reconciler.sweep().await;
        assert_eq!(injected.lock().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_llm_failure_skips_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let (reconciler, injected) = reconciler(None, vec!["false".to_string()], dir.path());
        reconciler.sweep().await;
        assert!(injected.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_check_commands_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let (reconciler, injected) = reconciler(Some("[]"), vec![], dir.path());
        reconciler.sweep().await;
        assert!(injected.lock().unwrap().is_empty());
    }
}
