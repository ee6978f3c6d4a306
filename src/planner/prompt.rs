// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Planner message builders.
//!
//! The planner keeps one long-lived conversation. The initial message carries
//! the request plus the repository's specification artifacts; every follow-up
//! carries a compressed view of the repo, the handoffs collected since the
//! last plan, and the full dispatch history so the model never re-emits an
//! id.

use std::path::Path;

use crate::gitops::GitClient;
use crate::types::Handoff;

/// Handoff summaries are clipped to this many characters.
pub const HANDOFF_SUMMARY_MAX: usize = 300;

/// File lists in handoff digests are clipped to this many entries.
pub const HANDOFF_FILES_MAX: usize = 30;

/// At most this many handoffs are digested per follow-up message.
pub const HANDOFFS_PER_MESSAGE_MAX: usize = 20;

/// Commit subjects included in the repo view.
pub const RECENT_COMMITS: usize = 15;

/// File-tree entries included in the repo view.
const FILE_TREE_MAX: usize = 400;

/// Character budget per specification artifact.
const ARTIFACT_MAX: usize = 8_000;

/// Specification artifacts probed in the target repository.
const SPEC_FILE: &str = "SPEC.md";
const FEATURES_FILE: &str = "FEATURES.md";
const CONVENTIONS_FILE: &str = "AGENTS.md";
const DECISIONS_FILE: &str = "DECISIONS.md";

/// Snapshot of the repository used to ground planner messages.
#[derive(Debug, Clone, Default)]
pub struct RepoState {
    pub file_tree: Vec<String>,
    pub recent_commits: Vec<String>,
    pub spec: Option<String>,
    pub features: Option<String>,
    pub conventions: Option<String>,
    pub decisions: Option<String>,
}

impl RepoState {
    /// Collect the current repo view. Git reads run under the git lock;
    /// artifact files are plain filesystem reads.
    pub async fn collect(git: &GitClient) -> Self {
        let (file_tree, recent_commits) = {
            let guard = git.lock().await;
            let files = git.ls_files(&guard).await.unwrap_or_default();
            let commits = git
                .recent_commits(&guard, RECENT_COMMITS)
                .await
                .unwrap_or_default();
            (files, commits)
        };

        Self {
            file_tree,
            recent_commits,
            spec: read_artifact(git.repo_path(), SPEC_FILE),
            features: read_artifact(git.repo_path(), FEATURES_FILE),
            conventions: read_artifact(git.repo_path(), CONVENTIONS_FILE),
            decisions: read_artifact(git.repo_path(), DECISIONS_FILE),
        }
    }
}

fn read_artifact(root: &Path, name: &str) -> Option<String> {
    std::fs::read_to_string(root.join(name))
        .ok()
        .map(|s| clip(&s, ARTIFACT_MAX))
}

/// Build the first message of the run.
pub fn build_initial_message(request: &str, state: &RepoState) -> String {
    let mut msg = String::new();
    msg.push_str("# Request\n\n");
    msg.push_str(request.trim());
    msg.push('\n');

    if let Some(spec) = &state.spec {
        msg.push_str("\n# Specification\n\n");
        msg.push_str(spec);
        msg.push('\n');
    }
    if let Some(features) = &state.features {
        msg.push_str("\n# Feature Catalog\n\n");
        msg.push_str(features);
        msg.push('\n');
    }
    if let Some(conventions) = &state.conventions {
        msg.push_str("\n# Conventions\n\n");
        msg.push_str(conventions);
        msg.push('\n');
    }
    if let Some(decisions) = &state.decisions {
        msg.push_str("\n# Decisions\n\n");
        msg.push_str(decisions);
        msg.push('\n');
    }

    push_repo_view(&mut msg, state);
    msg
}

/// Build a follow-up message after handoffs have arrived.
pub fn build_followup_message(
    state: &RepoState,
    handoffs: &[Handoff],
    active_ids: &[String],
    dispatched_ids: &[String],
) -> String {
    let mut msg = String::new();
    push_repo_view(&mut msg, state);

    if let Some(features) = &state.features {
        msg.push_str("\n# Feature Catalog (updated)\n\n");
        msg.push_str(features);
        msg.push('\n');
    }
    if let Some(decisions) = &state.decisions {
        msg.push_str("\n# Decisions (updated)\n\n");
        msg.push_str(decisions);
        msg.push('\n');
    }

    msg.push_str("\n# Worker Handoffs since last plan\n\n");
    if handoffs.is_empty() {
        msg.push_str("(none)\n");
    }
    for handoff in handoffs.iter().take(HANDOFFS_PER_MESSAGE_MAX) {
        push_handoff_digest(&mut msg, handoff);
    }
    if handoffs.len() > HANDOFFS_PER_MESSAGE_MAX {
        msg.push_str(&format!(
            "(+{} more handoffs omitted)\n",
            handoffs.len() - HANDOFFS_PER_MESSAGE_MAX
        ));
    }

    msg.push_str("\n# Currently active task ids\n\n");
    if active_ids.is_empty() {
        msg.push_str("(none)\n");
    } else {
        msg.push_str(&active_ids.join(", "));
        msg.push('\n');
    }

    msg.push_str("\n# Previously dispatched task ids\n\n");
    if dispatched_ids.is_empty() {
        msg.push_str("(none)\n");
    } else {
        msg.push_str(&dispatched_ids.join(", "));
        msg.push('\n');
    }
    msg.push_str("\nDO NOT re-emit any of these IDs.\n");

    msg
}

fn push_repo_view(msg: &mut String, state: &RepoState) {
    msg.push_str("\n# Repository\n\n## File tree\n\n");
    if state.file_tree.is_empty() {
        msg.push_str("(empty repository)\n");
    } else {
        for path in state.file_tree.iter().take(FILE_TREE_MAX) {
            msg.push_str(path);
            msg.push('\n');
        }
        if state.file_tree.len() > FILE_TREE_MAX {
            msg.push_str(&format!(
                "(+{} more files)\n",
                state.file_tree.len() - FILE_TREE_MAX
            ));
        }
    }

    msg.push_str("\n## Recent commits\n\n");
    if state.recent_commits.is_empty() {
        msg.push_str("(no commits)\n");
    } else {
        for subject in &state.recent_commits {
            msg.push_str("- ");
            msg.push_str(subject);
            msg.push('\n');
        }
    }
}

fn push_handoff_digest(msg: &mut String, handoff: &Handoff) {
    msg.push_str(&format!("### {} ({})\n", handoff.task_id, handoff.status));
    msg.push_str(&clip(&handoff.summary, HANDOFF_SUMMARY_MAX));
    msg.push('\n');

    if !handoff.files_changed.is_empty() {
        let shown: Vec<&str> = handoff
            .files_changed
            .iter()
            .take(HANDOFF_FILES_MAX)
            .map(|s| s.as_str())
            .collect();
        msg.push_str(&format!("Files: {}", shown.join(", ")));
        if handoff.files_changed.len() > HANDOFF_FILES_MAX {
            msg.push_str(&format!(
                " (+{} more)",
                handoff.files_changed.len() - HANDOFF_FILES_MAX
            ));
        }
        msg.push('\n');
    }
    for concern in &handoff.concerns {
        msg.push_str("Concern: ");
        msg.push_str(&clip(concern, HANDOFF_SUMMARY_MAX));
        msg.push('\n');
    }
    for suggestion in &handoff.suggestions {
        msg.push_str("Suggestion: ");
        msg.push_str(&clip(suggestion, HANDOFF_SUMMARY_MAX));
        msg.push('\n');
    }
    msg.push('\n');
}

/// Clip to `max` characters, appending an ellipsis when cut. Safe on
/// multi-byte input.
pub fn clip(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{}...", cut)
    }
}
