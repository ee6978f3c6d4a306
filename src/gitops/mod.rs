// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Serialized git access for the target checkout.
//!
//! The working tree and index are process-global, so every local git
//! invocation must happen under one exclusive lock. [`GitClient`] enforces
//! this in the type system: each command takes a [`GitGuard`], which can only
//! be obtained from [`GitClient::lock`]. The lock is fair (FIFO waiters) and
//! the guard releases on every exit path, including panics and cancellation.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::process::Command;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::error::GitError;

/// Porcelain XY codes that indicate an unresolved merge conflict.
pub const CONFLICT_CODES: &[&str] = &["UU", "AA", "DD", "AU", "UA", "DU", "UD"];

/// Proof of holding the git lock. Borrowed from [`GitClient::lock`].
pub struct GitGuard<'a> {
    _inner: MutexGuard<'a, ()>,
}

/// One entry of `git status --porcelain` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PorcelainEntry {
    /// Two-character XY status code.
    pub code: String,
    /// Path relative to the repository root.
    pub path: String,
}

/// Client for git subprocess invocations against a single checkout.
pub struct GitClient {
    repo_path: PathBuf,
    lock: Mutex<()>,
    invocations: AtomicU64,
}

impl GitClient {
    /// Create a client for the checkout at `repo_path`.
    pub fn new(repo_path: impl AsRef<Path>) -> Self {
        Self {
            repo_path: repo_path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
            invocations: AtomicU64::new(0),
        }
    }

    /// Path of the checkout this client operates on.
    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Acquire the git lock. Waiters are served in FIFO order.
    pub async fn lock(&self) -> GitGuard<'_> {
        GitGuard {
            _inner: self.lock.lock().await,
        }
    }

    /// Number of git commands executed so far.
    pub fn invocation_count(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    /// Run a git command and return trimmed stdout.
    pub async fn run(&self, _guard: &GitGuard<'_>, args: &[&str]) -> Result<String, GitError> {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        debug!(args = ?args, "git");

        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(GitError::CommandFailed {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    /// Run a git command, ignoring failure. Used for aborts and cleanup.
    pub async fn run_quiet(&self, guard: &GitGuard<'_>, args: &[&str]) {
        if let Err(e) = self.run(guard, args).await {
            debug!("git {:?} (ignored): {}", args, e);
        }
    }

    // ------------------------------------------------------------------
    // Subcommand helpers
    // ------------------------------------------------------------------

    pub async fn fetch(&self, guard: &GitGuard<'_>, branch: &str) -> Result<(), GitError> {
        self.run(guard, &["fetch", "origin", branch]).await?;
        Ok(())
    }

    pub async fn checkout(&self, guard: &GitGuard<'_>, branch: &str) -> Result<(), GitError> {
        self.run(guard, &["checkout", branch]).await?;
        Ok(())
    }

    /// Create or reset a branch at `start` and check it out.
    pub async fn checkout_new(
        &self,
        guard: &GitGuard<'_>,
        branch: &str,
        start: &str,
    ) -> Result<(), GitError> {
        self.run(guard, &["checkout", "-B", branch, start]).await?;
        Ok(())
    }

    pub async fn merge_ff_only(&self, guard: &GitGuard<'_>, reference: &str) -> Result<(), GitError> {
        self.run(guard, &["merge", "--ff-only", reference]).await?;
        Ok(())
    }

    pub async fn merge_no_ff(&self, guard: &GitGuard<'_>, reference: &str) -> Result<(), GitError> {
        self.run(guard, &["merge", "--no-ff", "--no-edit", reference])
            .await?;
        Ok(())
    }

    pub async fn rebase_onto(&self, guard: &GitGuard<'_>, base: &str) -> Result<(), GitError> {
        self.run(guard, &["rebase", base]).await?;
        Ok(())
    }

    pub async fn abort_rebase(&self, guard: &GitGuard<'_>) {
        self.run_quiet(guard, &["rebase", "--abort"]).await;
    }

    pub async fn abort_merge(&self, guard: &GitGuard<'_>) {
        self.run_quiet(guard, &["merge", "--abort"]).await;
    }

    pub async fn delete_branch(&self, guard: &GitGuard<'_>, branch: &str) {
        self.run_quiet(guard, &["branch", "-D", branch]).await;
    }

    /// Parsed `git status --porcelain` entries.
    pub async fn status_porcelain(
        &self,
        guard: &GitGuard<'_>,
    ) -> Result<Vec<PorcelainEntry>, GitError> {
        let output = self.run(guard, &["status", "--porcelain"]).await?;
        Ok(parse_porcelain(&output))
    }

    /// Paths with unresolved conflict codes in the index or worktree.
    pub async fn conflicted_paths(&self, guard: &GitGuard<'_>) -> Result<Vec<String>, GitError> {
        let entries = self.status_porcelain(guard).await?;
        Ok(entries
            .into_iter()
            .filter(|e| CONFLICT_CODES.contains(&e.code.as_str()))
            .map(|e| e.path)
            .collect())
    }

    /// Whether the working tree has no pending changes.
    pub async fn is_clean(&self, guard: &GitGuard<'_>) -> Result<bool, GitError> {
        Ok(self.status_porcelain(guard).await?.is_empty())
    }

    /// Subjects of the most recent `n` commits, newest first.
    pub async fn recent_commits(
        &self,
        guard: &GitGuard<'_>,
        n: usize,
    ) -> Result<Vec<String>, GitError> {
        let count = format!("-{}", n);
        let output = self.run(guard, &["log", &count, "--format=%s"]).await?;
        Ok(output.lines().map(|s| s.to_string()).collect())
    }

    /// All tracked paths in the checkout.
    pub async fn ls_files(&self, guard: &GitGuard<'_>) -> Result<Vec<String>, GitError> {
        let output = self.run(guard, &["ls-files"]).await?;
        Ok(output.lines().map(|s| s.to_string()).collect())
    }

    pub async fn current_branch(&self, guard: &GitGuard<'_>) -> Result<String, GitError> {
        self.run(guard, &["rev-parse", "--abbrev-ref", "HEAD"]).await
    }

    /// `git diff --shortstat` between `base` and the working tree.
    pub async fn short_stat(&self, guard: &GitGuard<'_>, base: &str) -> Result<String, GitError> {
        self.run(guard, &["diff", "--shortstat", base]).await
    }
}

/// Parse `git status --porcelain` output into entries.
pub fn parse_porcelain(output: &str) -> Vec<PorcelainEntry> {
    output
        .lines()
        .filter(|line| line.len() > 3)
        .map(|line| {
            let code = line[..2].to_string();
            // Rename entries look like "R  old -> new"; the conflict codes we
            // care about never rename, but keep the target path regardless.
            let rest = line[3..].trim();
            let path = match rest.rsplit_once(" -> ") {
                Some((_, new)) => new.to_string(),
                None => rest.to_string(),
            };
            PorcelainEntry { code, path }
        })
        .collect()
}
