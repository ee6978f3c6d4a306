// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Health ticks and run metrics.
//!
//! The monitor samples the whole system on a periodic tick (default 1 s) and
//! pushes a [`MetricsSnapshot`] to registered callbacks. Counters are plain
//! atomics updated from the dispatch path; nothing here requires compound
//! locking. Wall-clock-derived rates (commits per hour, cost) are computed at
//! snapshot time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::types::Handoff;

/// Callback receiving each tick's snapshot.
pub type SnapshotCallback = Arc<dyn Fn(&MetricsSnapshot) + Send + Sync>;

/// Provider for the pending-task gauge, wired to the task queue.
pub type PendingProvider = Arc<dyn Fn() -> usize + Send + Sync>;

/// Point-in-time view of the run, emitted once per tick.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub active_workers: usize,
    pub pending_tasks: usize,
    pub completed_total: u64,
    pub failed_total: u64,
    /// Completions since the previous tick.
    pub completed_delta: u64,
    /// Failures since the previous tick.
    pub failed_delta: u64,
    pub total_tokens_used: u64,
    pub merge_attempts: u64,
    pub merge_successes: u64,
    pub merge_failures: u64,
    pub merge_success_rate: f64,
    pub empty_diffs: u64,
    pub suspicious_tasks: u64,
    /// Workers running longer than the worker timeout.
    pub stuck_workers: usize,
    pub commits_per_hour: f64,
    pub estimated_cost_usd: f64,
    pub elapsed_secs: u64,
}

struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
    tokens: AtomicU64,
    merge_attempts: AtomicU64,
    merge_successes: AtomicU64,
    merge_failures: AtomicU64,
    empty_diffs: AtomicU64,
    suspicious: AtomicU64,
}

impl Counters {
    fn new() -> Self {
        Self {
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            tokens: AtomicU64::new(0),
            merge_attempts: AtomicU64::new(0),
            merge_successes: AtomicU64::new(0),
            merge_failures: AtomicU64::new(0),
            empty_diffs: AtomicU64::new(0),
            suspicious: AtomicU64::new(0),
        }
    }
}

/// Aggregates run metrics and emits periodic snapshots.
pub struct Monitor {
    started: Instant,
    tick: Duration,
    worker_timeout: Duration,
    token_cost_per_1k: f64,
    counters: Counters,
    active_workers: AtomicUsize,
    worker_starts: Mutex<HashMap<String, Instant>>,
    last_completed: AtomicU64,
    last_failed: AtomicU64,
    pending_provider: RwLock<Option<PendingProvider>>,
    callbacks: RwLock<Vec<SnapshotCallback>>,
    stop_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Monitor {
    pub fn new(tick: Duration, worker_timeout: Duration, token_cost_per_1k: f64) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            started: Instant::now(),
            tick,
            worker_timeout,
            token_cost_per_1k,
            counters: Counters::new(),
            active_workers: AtomicUsize::new(0),
            worker_starts: Mutex::new(HashMap::new()),
            last_completed: AtomicU64::new(0),
            last_failed: AtomicU64::new(0),
            pending_provider: RwLock::new(None),
            callbacks: RwLock::new(Vec::new()),
            stop_tx,
            handle: Mutex::new(None),
        }
    }

    /// Register a snapshot callback.
    pub fn on_snapshot(&self, callback: SnapshotCallback) {
        self.callbacks.write().unwrap().push(callback);
    }

    /// Wire the pending-task gauge to the task queue.
    pub fn set_pending_provider(&self, provider: PendingProvider) {
        *self.pending_provider.write().unwrap() = Some(provider);
    }

    // ------------------------------------------------------------------
    // Recorders
    // ------------------------------------------------------------------

    pub fn worker_started(&self, task_id: &str) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
        self.worker_starts
            .lock()
            .unwrap()
            .insert(task_id.to_string(), Instant::now());
    }

    pub fn worker_finished(&self, task_id: &str) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
        self.worker_starts.lock().unwrap().remove(task_id);
    }

    pub fn record_token_usage(&self, tokens: u64) {
        self.counters.tokens.fetch_add(tokens, Ordering::Relaxed);
    }

    pub fn record_merge_attempt(&self, success: bool) {
        self.counters.merge_attempts.fetch_add(1, Ordering::Relaxed);
        if success {
            self.counters.merge_successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.merge_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_empty_diff(&self) {
        self.counters.empty_diffs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_suspicious_task(&self) {
        self.counters.suspicious.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_completed(&self) {
        self.counters.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_failed(&self) {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record everything a handoff tells us in one call.
    pub fn record_handoff(&self, handoff: &Handoff) {
        self.record_token_usage(handoff.metrics.tokens_used);
        if handoff.status == crate::types::HandoffStatus::Failed {
            self.record_task_failed();
        } else {
            self.record_task_completed();
        }
        if handoff.is_empty_diff() {
            self.record_empty_diff();
        }
        if handoff.is_suspicious() {
            warn!(task_id = %handoff.task_id, "suspicious handoff: zero tokens and zero tool calls");
            self.record_suspicious_task();
        }
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    /// Build a snapshot of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let completed = self.counters.completed.load(Ordering::Relaxed);
        let failed = self.counters.failed.load(Ordering::Relaxed);
        let completed_delta = completed - self.last_completed.swap(completed, Ordering::Relaxed);
        let failed_delta = failed - self.last_failed.swap(failed, Ordering::Relaxed);

        let merge_attempts = self.counters.merge_attempts.load(Ordering::Relaxed);
        let merge_successes = self.counters.merge_successes.load(Ordering::Relaxed);
        let merge_failures = self.counters.merge_failures.load(Ordering::Relaxed);
        let merge_success_rate = if merge_attempts > 0 {
            merge_successes as f64 / merge_attempts as f64
        } else {
            0.0
        };

        let elapsed = self.started.elapsed();
        let hours = elapsed.as_secs_f64() / 3600.0;
        let commits_per_hour = if hours > 0.0 {
            merge_successes as f64 / hours
        } else {
            0.0
        };

        let tokens = self.counters.tokens.load(Ordering::Relaxed);
        let pending_tasks = self
            .pending_provider
            .read()
            .unwrap()
            .as_ref()
            .map(|p| p())
            .unwrap_or(0);

        let stuck_workers = {
            let starts = self.worker_starts.lock().unwrap();
            starts
                .values()
                .filter(|started| started.elapsed() > self.worker_timeout)
                .count()
        };

        MetricsSnapshot {
            active_workers: self.active_workers.load(Ordering::SeqCst),
            pending_tasks,
            completed_total: completed,
            failed_total: failed,
            completed_delta,
            failed_delta,
            total_tokens_used: tokens,
            merge_attempts,
            merge_successes,
            merge_failures,
            merge_success_rate,
            empty_diffs: self.counters.empty_diffs.load(Ordering::Relaxed),
            suspicious_tasks: self.counters.suspicious.load(Ordering::Relaxed),
            stuck_workers,
            commits_per_hour,
            estimated_cost_usd: tokens as f64 / 1000.0 * self.token_cost_per_1k,
            elapsed_secs: elapsed.as_secs(),
        }
    }

    /// Start the periodic tick task. Idempotent.
    pub fn start(self: Arc<Self>) {
        let mut handle_slot = self.handle.lock().unwrap();
        if handle_slot.is_some() {
            return;
        }
        let monitor = Arc::clone(&self);
        let mut stop_rx = self.stop_tx.subscribe();
        *handle_slot = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(monitor.tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = interval.tick() => {
                        let snapshot = monitor.snapshot();
                        if snapshot.stuck_workers > 0 {
                            warn!(stuck = snapshot.stuck_workers, "stuck workers detected");
                        }
                        debug!(
                            active = snapshot.active_workers,
                            pending = snapshot.pending_tasks,
                            cph = snapshot.commits_per_hour,
                            "tick"
                        );
                        let callbacks = monitor.callbacks.read().unwrap().clone();
                        for callback in callbacks {
                            callback(&snapshot);
                        }
                    }
                }
            }
        }));
    }

    /// Stop the tick task. Idempotent.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
