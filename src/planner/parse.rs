// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Parsing of planner LLM responses.
//!
//! The planner asks for `{"scratchpad": "...", "tasks": [...]}` but accepts a
//! bare JSON array of tasks as a backward-compatible fallback, and salvages
//! truncated responses: every syntactically complete task object inside the
//! `tasks` array is kept, the incomplete trailing object is discarded, and
//! the scratchpad is recovered by an escape-aware scan.

use serde::Deserialize;

use crate::types::Task;

/// A task as emitted by the LLM, before defaults are applied.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct RawTask {
    pub id: Option<String>,
    pub description: Option<String>,
    pub scope: Vec<String>,
    pub acceptance: Option<String>,
    pub branch: Option<String>,
    pub priority: Option<i32>,
}

/// Outcome of parsing one planner response.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanParse {
    /// The response parsed cleanly.
    Ok {
        scratchpad: String,
        tasks: Vec<RawTask>,
    },
    /// The response was truncated; these tasks were salvaged.
    Partial {
        scratchpad: Option<String>,
        tasks: Vec<RawTask>,
    },
    /// Nothing usable was found.
    Empty,
}

impl PlanParse {
    pub fn tasks(&self) -> &[RawTask] {
        match self {
            Self::Ok { tasks, .. } | Self::Partial { tasks, .. } => tasks,
            Self::Empty => &[],
        }
    }

    pub fn scratchpad(&self) -> Option<&str> {
        match self {
            Self::Ok { scratchpad, .. } => Some(scratchpad),
            Self::Partial { scratchpad, .. } => scratchpad.as_deref(),
            Self::Empty => None,
        }
    }

    pub fn into_parts(self) -> (Option<String>, Vec<RawTask>) {
        match self {
            Self::Ok { scratchpad, tasks } => (Some(scratchpad), tasks),
            Self::Partial { scratchpad, tasks } => (scratchpad, tasks),
            Self::Empty => (None, Vec::new()),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct PlanResponse {
    scratchpad: String,
    tasks: Vec<RawTask>,
}

impl Default for PlanResponse {
    fn default() -> Self {
        Self {
            scratchpad: String::new(),
            tasks: Vec::new(),
        }
    }
}

/// Parse a raw LLM response into a plan.
pub fn parse_plan(raw: &str) -> PlanParse {
    let cleaned = strip_code_fences(raw);
    let Some(start) = cleaned.find(['{', '[']) else {
        return PlanParse::Empty;
    };
    let body = &cleaned[start..];

    // Structured path: a complete top-level JSON value.
    if let Some(end) = find_balanced_end(body) {
        let slice = &body[..end];
        if body.starts_with('{') {
            if let Ok(response) = serde_json::from_str::<PlanResponse>(slice) {
                return PlanParse::Ok {
                    scratchpad: response.scratchpad,
                    tasks: keep_described(response.tasks),
                };
            }
        } else if let Ok(tasks) = serde_json::from_str::<Vec<RawTask>>(slice) {
            return PlanParse::Ok {
                scratchpad: String::new(),
                tasks: keep_described(tasks),
            };
        }
    }

    // Salvage path: brace-match complete objects out of a truncated stream.
    let tasks = keep_described(salvage_tasks(body));
    let scratchpad = extract_string_field(body, "scratchpad");
    if tasks.is_empty() && scratchpad.is_none() {
        PlanParse::Empty
    } else {
        PlanParse::Partial { scratchpad, tasks }
    }
}

fn keep_described(tasks: Vec<RawTask>) -> Vec<RawTask> {
    tasks
        .into_iter()
        .filter(|t| {
            t.description
                .as_ref()
                .map(|d| !d.trim().is_empty())
                .unwrap_or(false)
        })
        .collect()
}

/// Strip a surrounding triple-backtick fence, if any.
fn strip_code_fences(s: &str) -> &str {
    let trimmed = s.trim();
    let Some(start) = trimmed.find("```") else {
        return trimmed;
    };
    let after = &trimmed[start + 3..];
    // Skip the language tag on the fence line.
    let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after[body_start..];
    match body.rfind("```") {
        Some(end) => body[..end].trim(),
        None => body.trim(),
    }
}

/// Index one past the end of the first balanced top-level JSON value, or
/// `None` if the value is truncated.
fn find_balanced_end(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i + c.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}

/// Pull complete task objects out of a (possibly truncated) response body.
fn salvage_tasks(body: &str) -> Vec<RawTask> {
    let array_start = if body.starts_with('[') {
        0
    } else {
        match find_key_array(body, "tasks") {
            Some(idx) => idx,
            None => return Vec::new(),
        }
    };

    let mut tasks = Vec::new();
    let mut rest = &body[array_start + 1..];
    loop {
        let Some(obj_offset) = rest.find(['{', ']']) else {
            break;
        };
        if rest.as_bytes()[obj_offset] == b']' {
            break;
        }
        let obj_body = &rest[obj_offset..];
        match find_balanced_end(obj_body) {
            Some(end) => {
                if let Ok(task) = serde_json::from_str::<RawTask>(&obj_body[..end]) {
                    tasks.push(task);
                }
                rest = &obj_body[end..];
            }
            // Incomplete trailing object: discard and stop.
            None => break,
        }
    }
    tasks
}

/// Find the `[` opening the array value of `"key"`, scanning outside strings.
fn find_key_array(body: &str, key: &str) -> Option<usize> {
    let needle = format!("\"{}\"", key);
    let key_idx = body.find(&needle)?;
    let after = &body[key_idx + needle.len()..];
    let colon = after.find(':')?;
    let rest = &after[colon + 1..];
    let bracket = rest.find('[')?;
    // Only whitespace may sit between the colon and the bracket.
    if !rest[..bracket].trim().is_empty() {
        return None;
    }
    Some(key_idx + needle.len() + colon + 1 + bracket)
}

/// Recover a string field (`"name": "..."`) with JSON escape handling.
/// Returns `None` when the string is unterminated.
fn extract_string_field(body: &str, name: &str) -> Option<String> {
    let needle = format!("\"{}\"", name);
    let key_idx = body.find(&needle)?;
    let after = &body[key_idx + needle.len()..];
    let colon = after.find(':')?;
    let rest = after[colon + 1..].trim_start();
    if !rest.starts_with('"') {
        return None;
    }

    let mut escaped = false;
    for (i, c) in rest.char_indices().skip(1) {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '"' {
            let quoted = &rest[..i + 1];
            return serde_json::from_str::<String>(quoted).ok();
        }
    }
    None
}

// ============================================================================
// Materialization
// ============================================================================

/// Maximum slug length used in generated branch names.
const SLUG_MAX: usize = 30;

/// Turn a raw task into a dispatchable [`Task`], filling defaults.
///
/// `seq` advances only when an id has to be generated, producing `task-NNN`.
/// Returns `None` when the raw task has no usable description.
pub fn materialize_task(
    raw: RawTask,
    seq: &mut u32,
    branch_prefix: &str,
    created_at: u64,
) -> Option<Task> {
    let description = raw.description?.trim().to_string();
    if description.is_empty() {
        return None;
    }

    let id = match raw.id.filter(|id| !id.trim().is_empty()) {
        Some(id) => id.trim().to_string(),
        None => {
            *seq += 1;
            format!("task-{:03}", seq)
        }
    };

    let branch = match raw.branch.filter(|b| !b.trim().is_empty()) {
        Some(branch) => branch.trim().to_string(),
        None => format!("{}{}-{}", branch_prefix, id, slug(&description)),
    };

    Some(
        Task::new(id, description)
            .with_scope(raw.scope)
            .with_acceptance(raw.acceptance.unwrap_or_default())
            .with_branch(branch)
            .with_priority(raw.priority.unwrap_or(5))
            .with_created_at(created_at),
    )
}

/// Lowercase, dash-separated slug of a description.
pub fn slug(s: &str) -> String {
    let mut out = String::with_capacity(SLUG_MAX);
    let mut last_dash = true;
    for c in s.chars() {
        if out.len() >= SLUG_MAX {
            break;
        }
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    out.trim_matches('-').to_string()
}
