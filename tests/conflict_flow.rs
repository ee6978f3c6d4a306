// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Merge-conflict feedback flow against a real git remote: two branches edit
//! the same line, the first lands, the second conflicts and becomes a
//! bounded conflict-fix task.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use maestro::gitops::GitClient;
use maestro::merge::{MergeQueue, MergeStrategy};
use maestro::monitor::Monitor;
use maestro::orchestrator::ConflictFixer;
use maestro::types::{MergeOutcome, MergeStatus, Task};
use maestro::worker::TimedOutBranches;

async fn sh(dir: &Path, script: &str) {
    let status = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(script)
        .current_dir(dir)
        .status()
        .await
        .unwrap();
    assert!(status.success(), "script failed: {}", script);
}

/// Create a bare remote with `main` plus two branches that rewrite the same
/// line of file.txt, and a local checkout for the merge queue.
async fn fixture(root: &Path) -> PathBuf {
    let remote = root.join("remote.git");
    let seed = root.join("seed");
    let checkout = root.join("checkout");

    sh(root, &format!("git init -q --bare {}", remote.display())).await;
    sh(root, &format!("git init -q -b main {}", seed.display())).await;
    sh(
        &seed,
        &format!(
            "git config user.email swarm@example.com && git config user.name Swarm \
             && echo base > file.txt && git add . && git commit -q -m base \
             && git remote add origin {} && git push -q origin main",
            remote.display()
        ),
    )
    .await;

    // Two workers, each from main, rewriting the same line.
    for (branch, content) in [("swarm/t1", "from-t1"), ("swarm/t2", "from-t2")] {
        let ws = root.join(branch.replace('/', "-"));
        sh(
            root,
            &format!("git clone -q {} {}", remote.display(), ws.display()),
        )
        .await;
        sh(
            &ws,
            &format!(
                "git config user.email swarm@example.com && git config user.name Swarm \
                 && git checkout -q -b {branch} \
                 && echo {content} > file.txt && git add . && git commit -q -m {content} \
                 && git push -q origin {branch}"
            ),
        )
        .await;
    }

    sh(
        root,
        &format!("git clone -q {} {}", remote.display(), checkout.display()),
    )
    .await;
    sh(
        &checkout,
        "git config user.email swarm@example.com && git config user.name Swarm",
    )
    .await;
    checkout
}

async fn wait_for<F: Fn() -> bool>(cond: F, what: &str) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn conflicting_branch_becomes_a_fix_task() {
    let dir = tempfile::tempdir().unwrap();
    let checkout = fixture(dir.path()).await;

    let git = Arc::new(GitClient::new(&checkout));
    let monitor = Arc::new(Monitor::new(
        Duration::from_millis(100),
        Duration::from_secs(1800),
        0.001,
    ));
    let queue = Arc::new(MergeQueue::new(
        Arc::clone(&git),
        "main",
        MergeStrategy::MergeCommit,
        TimedOutBranches::new(),
    ));

    let outcomes: Arc<Mutex<Vec<MergeOutcome>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let sink = Arc::clone(&outcomes);
        let monitor = Arc::clone(&monitor);
        queue.on_merge_result(Arc::new(move |outcome| {
            monitor.record_merge_attempt(outcome.success);
            sink.lock().unwrap().push(outcome.clone());
        }));
    }

    let fixer = Arc::new(ConflictFixer::new("swarm/"));
    let fix_tasks: Arc<Mutex<Vec<Task>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let fixer = Arc::clone(&fixer);
        let sink = Arc::clone(&fix_tasks);
        queue.on_conflict(Arc::new(move |branch, files| {
            if let Some(task) = fixer.make_fix_task(branch, files) {
                sink.lock().unwrap().push(task);
            }
        }));
    }

    Arc::clone(&queue).start_background();
    queue.enqueue("swarm/t1");
    queue.enqueue("swarm/t2");

    wait_for(
        || outcomes.lock().unwrap().len() == 2,
        "both merge outcomes",
    )
    .await;
    queue.stop_background().await;

    // FIFO: the first branch lands, the second hits the conflict.
    let outcomes = outcomes.lock().unwrap();
    assert_eq!(outcomes[0].branch, "swarm/t1");
    assert_eq!(outcomes[0].status, MergeStatus::Merged);
    assert_eq!(outcomes[1].branch, "swarm/t2");
    assert_eq!(outcomes[1].status, MergeStatus::Conflict);
    assert_eq!(outcomes[1].conflicts, vec!["file.txt".to_string()]);

    // The conflict produced exactly one bounded fix task.
    let fix_tasks = fix_tasks.lock().unwrap();
    assert_eq!(fix_tasks.len(), 1);
    let fix = &fix_tasks[0];
    assert_eq!(fix.id, "conflict-fix-001");
    assert_eq!(fix.priority, 1);
    assert_eq!(fix.scope, vec!["file.txt".to_string()]);
    assert!(fix.branch.contains("conflict-fix"));

    // Merge accounting reached the monitor: one success, one failure.
    let snap = monitor.snapshot();
    assert_eq!(snap.merge_attempts, 2);
    assert_eq!(snap.merge_successes, 1);
    assert_eq!(snap.merge_failures, 1);
    assert!(snap.commits_per_hour > 0.0);
    assert!((snap.merge_success_rate - 0.5).abs() < 1e-9);

    // A fix task's own conflicts never cascade.
    assert!(fixer.make_fix_task(&fix.branch, &fix.scope).is_none());
}
