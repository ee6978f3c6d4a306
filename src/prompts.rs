// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The four system prompts.
//!
//! Prompts are read from the configured prompts directory so operators can
//! tune them without rebuilding; each falls back to a built-in default when
//! the file is missing.

use std::path::Path;

use tracing::debug;

const PLANNER_FILE: &str = "planner.md";
const WORKER_FILE: &str = "worker.md";
const SUB_PLANNER_FILE: &str = "subplanner.md";
const RECONCILER_FILE: &str = "reconciler.md";

const DEFAULT_PLANNER: &str = r#"You are the planner of an autonomous coding swarm. You decompose a build
request into small, independent tasks that each fit one short-lived worker.

Rules:
- Each task must name the repository paths it may touch in `scope`.
- Tasks in one batch must not overlap in scope; overlapping edits cause merge
  conflicts.
- Prefer many small tasks over few large ones. A task should be finishable in
  a few minutes of focused work.
- Use the handoff feedback to decide what to do next: re-issue failed work as
  new tasks with sharper instructions, and stop emitting tasks once the
  request is satisfied.

Respond with JSON only, in this shape:
{"scratchpad": "<your working notes, rewritten each time>",
 "tasks": [{"id": "...", "description": "...", "scope": ["path", ...],
            "acceptance": "...", "priority": 1}]}

Return an empty tasks array when there is nothing left to do."#;

const DEFAULT_WORKER: &str = r#"You are a coding agent working alone in an ephemeral sandbox on one task.
Clone state is yours; nobody else sees your working tree. Modify only the
files in your task's scope, commit your work, and push your branch. Keep
changes minimal and self-contained, and describe honestly in your handoff
what you did, what you did not finish, and anything that worries you."#;

const DEFAULT_SUB_PLANNER: &str = r#"You split one oversized coding task into independent subtasks. Each subtask
must cover a disjoint subset of the parent task's scope; never invent files
outside it. Subtasks run concurrently, so they must not depend on each
other's output. Respond with a JSON array of subtask objects with
description and scope fields."#;

const DEFAULT_RECONCILER: &str = r#"You repair a broken mainline. Given grouped build and test failures, produce
the smallest set of fix tasks that makes the build green again. Each task
gets a description and the scope of files it may touch. Respond with a JSON
array only."#;

/// The loaded prompt set.
#[derive(Debug, Clone)]
pub struct SystemPrompts {
    pub planner: String,
    pub worker: String,
    pub sub_planner: String,
    pub reconciler: String,
}

impl SystemPrompts {
    /// Built-in defaults.
    pub fn defaults() -> Self {
        Self {
            planner: DEFAULT_PLANNER.to_string(),
            worker: DEFAULT_WORKER.to_string(),
            sub_planner: DEFAULT_SUB_PLANNER.to_string(),
            reconciler: DEFAULT_RECONCILER.to_string(),
        }
    }

    /// Load prompts from `dir`, falling back to defaults per file.
    pub fn load(dir: &Path) -> Self {
        Self {
            planner: load_one(dir, PLANNER_FILE, DEFAULT_PLANNER),
            worker: load_one(dir, WORKER_FILE, DEFAULT_WORKER),
            sub_planner: load_one(dir, SUB_PLANNER_FILE, DEFAULT_SUB_PLANNER),
            reconciler: load_one(dir, RECONCILER_FILE, DEFAULT_RECONCILER),
        }
    }
}

fn load_one(dir: &Path, name: &str, default: &str) -> String {
    let path = dir.join(name);
    match std::fs::read_to_string(&path) {
        Ok(content) if !content.trim().is_empty() => content,
        Ok(_) => {
            debug!(path = %path.display(), "prompt file empty; using default");
            default.to_string()
        }
        Err(_) => {
            debug!(path = %path.display(), "prompt file missing; using default");
            default.to_string()
        }
    }
}
