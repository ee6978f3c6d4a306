// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Background merge queue.
//!
//! Worker branches land on the mainline through a single FIFO consumer so
//! merge order is deterministic and the working tree is never touched by two
//! operations at once. Every git step runs under the git lock. Conflicts are
//! not retried here; they are reported through `on_conflict` and become
//! follow-up tasks upstream.

use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::GitError;
use crate::gitops::{GitClient, GitGuard};
use crate::types::{MergeOutcome, MergeStatus};
use crate::worker::TimedOutBranches;

/// How a fetched branch is applied to the mainline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeStrategy {
    /// `git merge --ff-only`; fails (without conflict) when main diverged.
    #[default]
    FastForward,
    /// Rebase the branch onto main, then fast-forward main.
    Rebase,
    /// `git merge --no-ff`, always creating a merge commit.
    MergeCommit,
}

impl FromStr for MergeStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fast-forward" | "ff" => Ok(Self::FastForward),
            "rebase" => Ok(Self::Rebase),
            "merge-commit" | "merge" => Ok(Self::MergeCommit),
            other => Err(format!("unknown merge strategy: {}", other)),
        }
    }
}

impl std::fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::FastForward => "fast-forward",
            Self::Rebase => "rebase",
            Self::MergeCommit => "merge-commit",
        };
        f.write_str(s)
    }
}

/// Callback fired with every merge attempt's outcome.
pub type MergeResultCallback = Arc<dyn Fn(&MergeOutcome) + Send + Sync>;

/// Callback fired when a branch conflicts: `(branch, conflicting_files)`.
pub type ConflictCallback = Arc<dyn Fn(&str, &[String]) + Send + Sync>;

/// Temporary branch used by the rebase strategy.
const REBASE_TMP_BRANCH: &str = "maestro/merge-tmp";

/// FIFO consumer that applies worker branches to the mainline.
pub struct MergeQueue {
    git: Arc<GitClient>,
    main_branch: String,
    strategy: MergeStrategy,
    timed_out: TimedOutBranches,
    tx: mpsc::UnboundedSender<String>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    on_result: Arc<RwLock<Vec<MergeResultCallback>>>,
    on_conflict: Arc<RwLock<Vec<ConflictCallback>>>,
    stop_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl MergeQueue {
    pub fn new(
        git: Arc<GitClient>,
        main_branch: impl Into<String>,
        strategy: MergeStrategy,
        timed_out: TimedOutBranches,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (stop_tx, _) = watch::channel(false);
        Self {
            git,
            main_branch: main_branch.into(),
            strategy,
            timed_out,
            tx,
            rx: Mutex::new(Some(rx)),
            on_result: Arc::new(RwLock::new(Vec::new())),
            on_conflict: Arc::new(RwLock::new(Vec::new())),
            stop_tx,
            handle: Mutex::new(None),
        }
    }

    /// Register a merge-result callback.
    pub fn on_merge_result(&self, callback: MergeResultCallback) {
        self.on_result.write().unwrap().push(callback);
    }

    /// Register a conflict callback.
    pub fn on_conflict(&self, callback: ConflictCallback) {
        self.on_conflict.write().unwrap().push(callback);
    }

    /// Append a branch to the queue. Safe to call before `start_background`.
    pub fn enqueue(&self, branch: impl Into<String>) {
        let branch = branch.into();
        if self.tx.send(branch.clone()).is_err() {
            warn!(branch = %branch, "merge queue receiver is gone, dropping");
        }
    }

    /// Spawn the background consumer. Idempotent; the second call is a no-op.
    pub fn start_background(self: Arc<Self>) {
        let Some(mut rx) = self.rx.lock().unwrap().take() else {
            return;
        };
        let mut stop_rx = self.stop_tx.subscribe();
        let queue = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    item = rx.recv() => match item {
                        Some(branch) => queue.process_branch(&branch).await,
                        None => break,
                    },
                }
            }
            info!("merge queue stopped");
        });
        *self.handle.lock().unwrap() = Some(handle);
    }

    /// Stop the consumer and wait for the in-flight item to finish.
    pub async fn stop_background(&self) {
        let _ = self.stop_tx.send(true);
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn process_branch(&self, branch: &str) {
        if self.timed_out.contains(branch) {
            self.report(MergeOutcome {
                branch: branch.to_string(),
                status: MergeStatus::Skipped,
                success: false,
                message: "branch belongs to a timed-out worker".to_string(),
                conflicts: Vec::new(),
            });
            return;
        }

        let outcome = self.attempt(branch).await;
        self.report(outcome);
    }

    fn report(&self, outcome: MergeOutcome) {
        match outcome.status {
            MergeStatus::Merged => info!(branch = %outcome.branch, "merged"),
            MergeStatus::Conflict => {
                warn!(branch = %outcome.branch, files = outcome.conflicts.len(), "merge conflict")
            }
            MergeStatus::Failed => warn!(branch = %outcome.branch, "merge failed: {}", outcome.message),
            MergeStatus::Skipped => info!(branch = %outcome.branch, "merge skipped"),
        }

        if outcome.status == MergeStatus::Conflict {
            let callbacks = self.on_conflict.read().unwrap().clone();
            for callback in callbacks {
                callback(&outcome.branch, &outcome.conflicts);
            }
        }
        let callbacks = self.on_result.read().unwrap().clone();
        for callback in callbacks {
            callback(&outcome);
        }
    }

    async fn attempt(&self, branch: &str) -> MergeOutcome {
        let guard = self.git.lock().await;
        match self.apply(&guard, branch).await {
            Ok(outcome) => outcome,
            Err(e) => MergeOutcome {
                branch: branch.to_string(),
                status: MergeStatus::Failed,
                success: false,
                message: e.to_string(),
                conflicts: Vec::new(),
            },
        }
    }

    async fn apply(&self, guard: &GitGuard<'_>, branch: &str) -> Result<MergeOutcome, GitError> {
        let git = &self.git;
        git.fetch(guard, branch).await?;
        git.checkout(guard, &self.main_branch).await?;

        if !git.is_clean(guard).await? {
            return Ok(MergeOutcome {
                branch: branch.to_string(),
                status: MergeStatus::Failed,
                success: false,
                message: format!("working tree on {} is not clean", self.main_branch),
                conflicts: Vec::new(),
            });
        }

        match self.strategy {
            MergeStrategy::FastForward => self.apply_fast_forward(guard, branch).await,
            MergeStrategy::Rebase => self.apply_rebase(guard, branch).await,
            MergeStrategy::MergeCommit => self.apply_merge_commit(guard, branch).await,
        }
    }

    async fn apply_fast_forward(
        &self,
        guard: &GitGuard<'_>,
        branch: &str,
    ) -> Result<MergeOutcome, GitError> {
        match self.git.merge_ff_only(guard, "FETCH_HEAD").await {
            Ok(()) => Ok(self.merged(branch, "fast-forwarded")),
            Err(e) => Ok(MergeOutcome {
                branch: branch.to_string(),
                status: MergeStatus::Failed,
                success: false,
                message: format!("cannot fast-forward: {}", e),
                conflicts: Vec::new(),
            }),
        }
    }

    async fn apply_rebase(
        &self,
        guard: &GitGuard<'_>,
        branch: &str,
    ) -> Result<MergeOutcome, GitError> {
        let git = &self.git;
        git.checkout_new(guard, REBASE_TMP_BRANCH, "FETCH_HEAD").await?;

        if let Err(e) = git.rebase_onto(guard, &self.main_branch).await {
            let conflicts = git.conflicted_paths(guard).await.unwrap_or_default();
            git.abort_rebase(guard).await;
            git.checkout(guard, &self.main_branch).await?;
            git.delete_branch(guard, REBASE_TMP_BRANCH).await;

            if conflicts.is_empty() {
                return Ok(MergeOutcome {
                    branch: branch.to_string(),
                    status: MergeStatus::Failed,
                    success: false,
                    message: format!("rebase failed: {}", e),
                    conflicts: Vec::new(),
                });
            }
            return Ok(self.conflicted(branch, conflicts));
        }

        git.checkout(guard, &self.main_branch).await?;
        let result = git.merge_ff_only(guard, REBASE_TMP_BRANCH).await;
        git.delete_branch(guard, REBASE_TMP_BRANCH).await;
        match result {
            Ok(()) => Ok(self.merged(branch, "rebased and fast-forwarded")),
            Err(e) => Ok(MergeOutcome {
                branch: branch.to_string(),
                status: MergeStatus::Failed,
                success: false,
                message: format!("fast-forward after rebase failed: {}", e),
                conflicts: Vec::new(),
            }),
        }
    }

    async fn apply_merge_commit(
        &self,
        guard: &GitGuard<'_>,
        branch: &str,
    ) -> Result<MergeOutcome, GitError> {
        let git = &self.git;
        match git.merge_no_ff(guard, "FETCH_HEAD").await {
            Ok(()) => Ok(self.merged(branch, "merged with merge commit")),
            Err(e) => {
                let conflicts = git.conflicted_paths(guard).await.unwrap_or_default();
                git.abort_merge(guard).await;
                if conflicts.is_empty() {
                    return Ok(MergeOutcome {
                        branch: branch.to_string(),
                        status: MergeStatus::Failed,
                        success: false,
                        message: format!("merge failed: {}", e),
                        conflicts: Vec::new(),
                    });
                }
                Ok(self.conflicted(branch, conflicts))
            }
        }
    }

    fn merged(&self, branch: &str, message: &str) -> MergeOutcome {
        MergeOutcome {
            branch: branch.to_string(),
            status: MergeStatus::Merged,
            success: true,
            message: message.to_string(),
            conflicts: Vec::new(),
        }
    }

    fn conflicted(&self, branch: &str, conflicts: Vec<String>) -> MergeOutcome {
        MergeOutcome {
            branch: branch.to_string(),
            status: MergeStatus::Conflict,
            success: false,
            message: format!("{} conflicting files", conflicts.len()),
            conflicts,
        }
    }
}
