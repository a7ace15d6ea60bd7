//! Retry controller — the bounded attempt loop.
//!
//! First-success-wins: a success verdict ends the run immediately, a stop
//! verdict ends it immediately as a failure, everything else continues with
//! an interval adjusted by the backoff policy. Repeated time-validation
//! failures tighten the interval instead (the claim window is about to
//! open; polling faster beats backing off).
//!
//! Cancellation is cooperative: the task's status is checked at the top of
//! every iteration and again after each inter-attempt sleep. An in-flight
//! dispatch completes, but its result is discarded once status leaves
//! Running.

use std::sync::Arc;
use std::time::Duration;

use couponsnipe_core::{Result, SnipeError};

use crate::dispatch::{Dispatch, ResponseRecord};
use crate::rules::{Verdict, classify};
use crate::store::{KvStore, persist_tasks};
use crate::task::{BackoffMode, ExecutionPolicy, SharedTasks, TaskStatus};

/// Time-validation failures tolerated before the interval tightens.
const TIME_VALIDATION_THRESHOLD: u32 = 3;
/// Floor for the tightened interval.
const MIN_TIGHT_INTERVAL_MS: u64 = 30;

/// How one run ended. Exactly one of these explains the terminal status.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// A success rule matched on this attempt.
    Success { attempt: u32, result: ResponseRecord },
    /// The attempt budget ran out without a success or stop.
    Exhausted { attempts: u32, last: Option<ResponseRecord> },
    /// A stop rule or terminal phrase matched.
    Stopped { reason: String, attempts: u32 },
    /// The task left Running state mid-run.
    Cancelled { attempts: u32 },
}

/// Drives the attempt loop for one task at a time.
pub struct RetryController {
    tasks: SharedTasks,
    store: Arc<dyn KvStore>,
    dispatcher: Arc<dyn Dispatch>,
}

impl RetryController {
    pub fn new(tasks: SharedTasks, store: Arc<dyn KvStore>, dispatcher: Arc<dyn Dispatch>) -> Self {
        Self { tasks, store, dispatcher }
    }

    /// Run the retry loop for `task_id` until a terminal outcome.
    pub async fn run(&self, task_id: &str) -> Result<RunOutcome> {
        let (policy, rules) = {
            let tasks = self.tasks.lock().await;
            let task = tasks
                .get(task_id)
                .ok_or_else(|| SnipeError::Task(format!("not found: {task_id}")))?;
            (task.policy.clone(), task.rules.clone())
        };

        let mut attempt: u32 = 0;
        let mut interval = policy.interval_ms;
        let mut tv_failures: u32 = 0;
        let mut last: Option<ResponseRecord> = None;

        tracing::info!(
            "🚀 Retry loop started for {task_id} (budget {} attempts)",
            policy.max_attempts
        );

        while attempt < policy.max_attempts {
            // Cooperative cancellation guard, also hit right after a sleep.
            if !self.is_running(task_id).await {
                tracing::info!("🛑 Task {task_id} no longer running, discarding loop");
                return Ok(RunOutcome::Cancelled { attempts: attempt });
            }
            attempt += 1;

            let snapshot = {
                let tasks = self.tasks.lock().await;
                tasks
                    .get(task_id)
                    .ok_or_else(|| SnipeError::Task(format!("not found: {task_id}")))?
                    .clone()
            };

            match self.dispatcher.dispatch(&snapshot, attempt).await {
                Ok(response) => {
                    self.with_task(task_id, |task| task.stats.record_response(&response)).await;

                    match classify(&response, &rules) {
                        Verdict::Success => {
                            self.with_task(task_id, |task| {
                                task.stats.successes += 1;
                                task.status = TaskStatus::Completed;
                            })
                            .await;
                            tracing::info!(
                                "🎉 Task {task_id} succeeded on attempt {attempt} ({:.1}ms)",
                                response.duration_ms
                            );
                            return Ok(RunOutcome::Success { attempt, result: response });
                        }
                        Verdict::Stop(reason) => {
                            self.with_task(task_id, |task| {
                                task.stats.failures += 1;
                                task.status = TaskStatus::Failed;
                            })
                            .await;
                            tracing::info!("🛑 Task {task_id} stopped: {reason}");
                            return Ok(RunOutcome::Stopped { reason, attempts: attempt });
                        }
                        Verdict::Continue { time_validation, reason } => {
                            if time_validation {
                                tv_failures += 1;
                                self.with_task(task_id, |task| {
                                    task.stats.time_validation_failures += 1;
                                })
                                .await;
                            }
                            interval = next_interval(interval, &policy, tv_failures, false);
                            tracing::debug!(
                                "Attempt {attempt} for {task_id}: {reason} (next in {interval}ms)"
                            );
                            last = Some(response);
                        }
                    }
                }
                Err(e) => {
                    self.with_task(task_id, |task| task.stats.record_failure()).await;
                    interval = next_interval(interval, &policy, tv_failures, true);
                    tracing::warn!(
                        "⚠️ Attempt {attempt} for {task_id} failed: {e} (next in {interval}ms)"
                    );
                }
            }

            if attempt < policy.max_attempts {
                tokio::time::sleep(Duration::from_millis(interval)).await;
            }
        }

        self.with_task(task_id, |task| {
            task.status = TaskStatus::Failed;
        })
        .await;
        tracing::info!("❌ Task {task_id} exhausted after {attempt} attempts");
        Ok(RunOutcome::Exhausted { attempts: attempt, last })
    }

    async fn is_running(&self, task_id: &str) -> bool {
        let tasks = self.tasks.lock().await;
        tasks.get(task_id).map(|t| t.status == TaskStatus::Running).unwrap_or(false)
    }

    /// Mutate one task, bump `updated_at`, and persist the map best-effort.
    async fn with_task<F>(&self, task_id: &str, mutate: F)
    where
        F: FnOnce(&mut crate::task::Task),
    {
        let mut tasks = self.tasks.lock().await;
        if let Some(task) = tasks.get_mut(task_id) {
            mutate(task);
            task.touch();
        }
        persist_tasks(self.store.as_ref(), &tasks).await;
    }
}

/// Compute the delay before the next attempt.
///
/// Dispatch errors double the interval under exponential backoff. Continue
/// verdicts grow it by ×1.5 — unless time validation has failed more than
/// the threshold, in which case the interval tightens toward the base
/// (`max(30, base − 10)`) to poll harder at the window boundary.
pub(crate) fn next_interval(
    current: u64,
    policy: &ExecutionPolicy,
    tv_failures: u32,
    after_error: bool,
) -> u64 {
    if after_error {
        return match policy.backoff {
            BackoffMode::Exponential => (current.saturating_mul(2)).min(policy.max_interval_ms),
            BackoffMode::None => current,
        };
    }
    if tv_failures > TIME_VALIDATION_THRESHOLD {
        return policy.interval_ms.saturating_sub(10).max(MIN_TIGHT_INTERVAL_MS);
    }
    match policy.backoff {
        BackoffMode::Exponential => (current.saturating_mul(3) / 2).min(policy.max_interval_ms),
        BackoffMode::None => current,
    }
}
