// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The streaming planner loop.
//!
//! The planner owns one long-lived LLM conversation for the whole run. Each
//! iteration it drains worker handoffs, decides whether to re-plan (first
//! iteration, enough new handoffs, or nothing in flight), dispatches the new
//! batch through the concurrency limiter, and sleeps. Dispatches run
//! concurrently; the limiter blocks the dispatch path, which is the system's
//! backpressure. Oversized tasks route through the sub-planner instead of a
//! single worker.

pub mod parse;
pub mod prompt;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, info, warn};

use crate::config::LoopSettings;
use crate::error::PlannerError;
use crate::gitops::GitClient;
use crate::llm::{CompletionClient, CompletionOverrides};
use crate::merge::MergeQueue;
use crate::monitor::Monitor;
use crate::queue::TaskQueue;
use crate::subplanner::SubPlanner;
use crate::types::{ChatMessage, Handoff, Task};
use crate::worker::{LlmConfigSource, WorkerPool};

use parse::{materialize_task, parse_plan};
use prompt::{build_followup_message, build_initial_message, RepoState};

/// Planner construction options.
pub struct PlannerOptions {
    pub llm: Arc<dyn CompletionClient>,
    pub system_prompt: String,
    pub queue: Arc<TaskQueue>,
    pub pool: Arc<WorkerPool>,
    pub git: Arc<GitClient>,
    pub monitor: Arc<Monitor>,
    pub merge: Arc<MergeQueue>,
    pub subplanner: Arc<SubPlanner>,
    pub limiter: Arc<Semaphore>,
    pub llm_config_source: LlmConfigSource,
    pub loop_settings: LoopSettings,
    pub branch_prefix: String,
}

struct PlannerState {
    conversation: Vec<ChatMessage>,
    /// Rewritten (not appended) with every parsed response.
    scratchpad: String,
    dispatched_ids: Vec<String>,
    dispatched_set: HashSet<String>,
    active: HashSet<String>,
    all_handoffs: Vec<Handoff>,
    task_seq: u32,
    planning_done: bool,
}

/// The streaming planner.
pub struct Planner {
    llm: Arc<dyn CompletionClient>,
    queue: Arc<TaskQueue>,
    pool: Arc<WorkerPool>,
    git: Arc<GitClient>,
    monitor: Arc<Monitor>,
    merge: Arc<MergeQueue>,
    subplanner: Arc<SubPlanner>,
    limiter: Arc<Semaphore>,
    llm_config_source: LlmConfigSource,
    settings: LoopSettings,
    branch_prefix: String,
    state: Mutex<PlannerState>,
    epoch: Instant,
    handoff_tx: mpsc::UnboundedSender<Handoff>,
    handoff_rx: Mutex<Option<mpsc::UnboundedReceiver<Handoff>>>,
    inject_tx: mpsc::UnboundedSender<Task>,
    inject_rx: Mutex<Option<mpsc::UnboundedReceiver<Task>>>,
    stop_tx: watch::Sender<bool>,
}

impl Planner {
    pub fn new(options: PlannerOptions) -> Self {
        let (handoff_tx, handoff_rx) = mpsc::unbounded_channel();
        let (inject_tx, inject_rx) = mpsc::unbounded_channel();
        let (stop_tx, _) = watch::channel(false);
        Self {
            llm: options.llm,
            queue: options.queue,
            pool: options.pool,
            git: options.git,
            monitor: options.monitor,
            merge: options.merge,
            subplanner: options.subplanner,
            limiter: options.limiter,
            llm_config_source: options.llm_config_source,
            settings: options.loop_settings,
            branch_prefix: options.branch_prefix,
            state: Mutex::new(PlannerState {
                conversation: vec![ChatMessage::system(options.system_prompt)],
                scratchpad: String::new(),
                dispatched_ids: Vec::new(),
                dispatched_set: HashSet::new(),
                active: HashSet::new(),
                all_handoffs: Vec::new(),
                task_seq: 0,
                planning_done: false,
            }),
            epoch: Instant::now(),
            handoff_tx,
            handoff_rx: Mutex::new(Some(handoff_rx)),
            inject_tx,
            inject_rx: Mutex::new(Some(inject_rx)),
            stop_tx,
        }
    }

    /// Request a stop; honored at the next tick boundary.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Feed a task into the dispatch pipeline without consulting the LLM.
    /// Used by the reconciler and the merge-conflict handler.
    pub fn inject_task(&self, task: Task) {
        if self.inject_tx.send(task).is_err() {
            warn!("planner is gone; injected task dropped");
        }
    }

    /// Current scratchpad contents.
    pub fn scratchpad(&self) -> String {
        self.state.lock().unwrap().scratchpad.clone()
    }

    /// Ids dispatched so far, in dispatch order.
    pub fn dispatched_ids(&self) -> Vec<String> {
        self.state.lock().unwrap().dispatched_ids.clone()
    }

    /// Number of tasks currently in flight.
    pub fn active_count(&self) -> usize {
        self.state.lock().unwrap().active.len()
    }

    /// All handoffs collected so far.
    pub fn collected_handoffs(&self) -> Vec<Handoff> {
        self.state.lock().unwrap().all_handoffs.clone()
    }

    /// Run the planner loop to completion.
    pub async fn run(self: Arc<Self>, request: &str) -> Result<(), PlannerError> {
        let mut handoff_rx = self
            .handoff_rx
            .lock()
            .unwrap()
            .take()
            .ok_or(PlannerError::Stopped)?;
        let mut inject_rx = self
            .inject_rx
            .lock()
            .unwrap()
            .take()
            .ok_or(PlannerError::Stopped)?;
        let mut stop_rx = self.stop_tx.subscribe();

        let mut iteration: u64 = 0;
        let mut consecutive_errors: u32 = 0;
        let mut handoffs_since_plan: Vec<Handoff> = Vec::new();

        info!("planner loop starting");
        loop {
            if *stop_rx.borrow() {
                info!("planner stopped");
                return Ok(());
            }

            // Injected tasks bypass the LLM entirely.
            while let Ok(task) = inject_rx.try_recv() {
                info!(task_id = %task.id, "dispatching injected task");
                Self::dispatch(&self, task).await;
            }

            // Drain new handoffs.
            while let Ok(handoff) = handoff_rx.try_recv() {
                self.state
                    .lock()
                    .unwrap()
                    .all_handoffs
                    .push(handoff.clone());
                handoffs_since_plan.push(handoff);
            }

            let (active_count, planning_done) = {
                let state = self.state.lock().unwrap();
                (state.active.len(), state.planning_done)
            };
            let has_capacity = self.limiter.available_permits() > 0;
            let replan = has_capacity
                && (iteration == 0
                    || handoffs_since_plan.len() >= self.settings.min_handoffs_for_replan
                    || active_count == 0);

            if replan && !planning_done {
                match self
                    .plan_once(request, &handoffs_since_plan, iteration == 0)
                    .await
                {
                    Ok(batch) => {
                        consecutive_errors = 0;
                        handoffs_since_plan.clear();
                        if batch.is_empty() {
                            info!("planner emitted an empty batch; planning finished");
                            self.state.lock().unwrap().planning_done = true;
                        }
                        for task in batch {
                            Self::dispatch(&self, task).await;
                        }
                    }
                    Err(e) => {
                        consecutive_errors += 1;
                        warn!(
                            error = %e,
                            consecutive_errors,
                            "planner iteration failed"
                        );
                        if consecutive_errors >= self.settings.max_consecutive_errors {
                            return Err(PlannerError::MaxErrorsExceeded(consecutive_errors));
                        }
                        let backoff = backoff_delay(
                            consecutive_errors,
                            self.settings.backoff_base_ms,
                            self.settings.backoff_max_ms,
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = stop_rx.changed() => {}
                        }
                    }
                }
            }

            let (active_count, planning_done) = {
                let state = self.state.lock().unwrap();
                (state.active.len(), state.planning_done)
            };
            if planning_done && active_count == 0 && self.queue.pending_count() == 0 {
                // Pick up any handoffs that raced with the last drain.
                while let Ok(handoff) = handoff_rx.try_recv() {
                    self.state.lock().unwrap().all_handoffs.push(handoff);
                }
                info!("planner idle; loop complete");
                return Ok(());
            }

            iteration += 1;
            if iteration >= self.settings.max_iterations {
                warn!(iteration, "planner hit the iteration ceiling");
                return Ok(());
            }

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(self.settings.sleep_ms)) => {}
                _ = stop_rx.changed() => {}
            }
        }
    }

    /// One planning step: build a message, call the LLM, and return the
    /// batch of new (non-duplicate) tasks to dispatch.
    async fn plan_once(
        &self,
        request: &str,
        handoffs_since_plan: &[Handoff],
        first: bool,
    ) -> Result<Vec<Task>, PlannerError> {
        let repo = RepoState::collect(&self.git).await;
        let message = if first {
            build_initial_message(request, &repo)
        } else {
            let (active_ids, dispatched_ids) = {
                let state = self.state.lock().unwrap();
                let mut active: Vec<String> = state.active.iter().cloned().collect();
                active.sort();
                (active, state.dispatched_ids.clone())
            };
            build_followup_message(&repo, handoffs_since_plan, &active_ids, &dispatched_ids)
        };

        let messages = {
            let mut state = self.state.lock().unwrap();
            state.conversation.push(ChatMessage::user(message));
            state.conversation.clone()
        };

        let completion = self
            .llm
            .complete(&messages, &CompletionOverrides::default())
            .await?;
        self.monitor
            .record_token_usage(completion.usage.total_tokens);

        let parsed = parse_plan(&completion.content);
        let new_tasks = {
            let mut state = self.state.lock().unwrap();
            state
                .conversation
                .push(ChatMessage::assistant(&completion.content));
            // Rewritten wholesale, never appended; an absent or empty
            // scratchpad leaves the previous one standing.
            if let Some(pad) = parsed.scratchpad() {
                if !pad.is_empty() {
                    state.scratchpad = pad.to_string();
                }
            }

            let created_at = self.epoch.elapsed().as_millis() as u64;
            let mut new_tasks = Vec::new();
            let (_, raw_tasks) = parsed.into_parts();
            for raw in raw_tasks {
                let Some(task) =
                    materialize_task(raw, &mut state.task_seq, &self.branch_prefix, created_at)
                else {
                    continue;
                };
                if state.dispatched_set.contains(&task.id) {
                    debug!(task_id = %task.id, "dropping duplicate task id from plan");
                    continue;
                }
                new_tasks.push(task);
            }
            new_tasks
        };

        info!(batch = new_tasks.len(), first, "plan parsed");
        Ok(new_tasks)
    }

    /// Dispatch one task. Blocks on the concurrency limiter, then runs the
    /// worker (or sub-planner) on a spawned task.
    async fn dispatch(this: &Arc<Self>, task: Task) {
        {
            let mut state = this.state.lock().unwrap();
            if !state.dispatched_set.insert(task.id.clone()) {
                warn!(task_id = %task.id, "task id already dispatched; skipping");
                return;
            }
            state.dispatched_ids.push(task.id.clone());
            state.active.insert(task.id.clone());
        }
        if let Err(e) = this.queue.enqueue(task.clone()) {
            warn!(task_id = %task.id, error = %e, "enqueue failed");
            this.state.lock().unwrap().active.remove(&task.id);
            return;
        }

        let permit = match Arc::clone(&this.limiter).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                warn!(task_id = %task.id, "limiter closed; dropping dispatch");
                this.state.lock().unwrap().active.remove(&task.id);
                return;
            }
        };

        let planner = Arc::clone(this);
        tokio::spawn(async move {
            let _permit = permit;
            planner.run_dispatch(task).await;
        });
    }

    async fn run_dispatch(&self, task: Task) {
        let id = task.id.clone();
        let worker_id = format!("sandbox-{}", uuid::Uuid::new_v4().simple());
        let _ = self.queue.assign(&id, &worker_id);
        let _ = self.queue.start(&id);
        self.monitor.worker_started(&id);
        let started = Instant::now();

        let outcome = if self.subplanner.should_decompose(&task, 0) {
            debug!(task_id = %id, scope = task.scope.len(), "routing through sub-planner");
            Ok(self.subplanner.run(&task, 0).await)
        } else {
            self.pool
                .assign_task(&task, (self.llm_config_source)())
                .await
        };

        let mut handoff = match outcome {
            Ok(handoff) => handoff,
            Err(e) => {
                warn!(task_id = %id, error = %e, "worker failed; synthesizing handoff");
                Handoff::failed(&id, format!("worker error: {}", e))
            }
        };
        // Key the handoff to the dispatched task regardless of what the
        // sandbox echoed back.
        handoff.task_id = id.clone();
        if handoff.metrics.duration_ms == 0 {
            handoff.metrics.duration_ms = started.elapsed().as_millis() as u64;
        }

        if let Err(e) = self.queue.finish(&id, handoff.status.as_task_status()) {
            warn!(task_id = %id, error = %e, "terminal transition rejected");
        }
        self.monitor.record_handoff(&handoff);
        if handoff.is_mergeable() {
            self.merge.enqueue(&task.branch);
        }

        // The handoff must be in the channel before the task leaves the
        // active set, or the loop's idle check could exit without it.
        let _ = self.handoff_tx.send(handoff);
        self.monitor.worker_finished(&id);
        self.state.lock().unwrap().active.remove(&id);
    }
}

/// Exponential backoff: base * 2^(errors-1), capped.
fn backoff_delay(consecutive_errors: u32, base_ms: u64, max_ms: u64) -> Duration {
    let exponent = consecutive_errors.saturating_sub(1).min(31);
    let delay = base_ms.saturating_mul(1u64 << exponent).min(max_ms);
    Duration::from_millis(delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_progression() {
        assert_eq!(backoff_delay(1, 2_000, 30_000), Duration::from_millis(2_000));
        assert_eq!(backoff_delay(2, 2_000, 30_000), Duration::from_millis(4_000));
        assert_eq!(backoff_delay(3, 2_000, 30_000), Duration::from_millis(8_000));
        assert_eq!(backoff_delay(4, 2_000, 30_000), Duration::from_millis(16_000));
        // Capped from here on.
        assert_eq!(backoff_delay(5, 2_000, 30_000), Duration::from_millis(30_000));
        assert_eq!(backoff_delay(10, 2_000, 30_000), Duration::from_millis(30_000));
        // No overflow at absurd counts.
        assert_eq!(backoff_delay(64, 2_000, 30_000), Duration::from_millis(30_000));
    }
}
