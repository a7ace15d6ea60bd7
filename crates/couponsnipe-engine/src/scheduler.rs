//! Task scheduler — arms one timer per task and hands off to the retry loop.
//!
//! The fire instant is `execute_at − advance_ms − avg_delay` in reference
//! clock terms; the precision wait owns that arithmetic. Delays beyond what
//! a single timer can represent are chunked and backed by a durable alarm
//! index in the store, which `restore` consults so a restart re-arms them
//! even if the persisted task status drifted.
//!
//! Every armed timer has a `JoinHandle` in the handle map. Cancel aborts the
//! handle and flips status; the retry loop's own status guards catch the
//! window where an abort lands after the timer already fired.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use couponsnipe_clock::Clock;
use couponsnipe_core::{Result, SnipeError};

use crate::retry::{RetryController, RunOutcome};
use crate::store::{KvStore, persist_tasks};
use crate::task::{SharedTasks, TaskStatus};

/// Largest delay a single timer arm covers (the 32-bit signed millisecond
/// ceiling, ~24.8 days). Longer waits chunk and persist an alarm entry.
pub const TIMER_MAX_MS: i64 = 2_147_483_647;

/// Store key for the durable alarm index: task id → fire instant (epoch ms).
const ALARMS_KEY: &str = "alarms";

pub struct TaskScheduler {
    tasks: SharedTasks,
    store: Arc<dyn KvStore>,
    clock: Arc<Clock>,
    retry: Arc<RetryController>,
    handles: tokio::sync::Mutex<HashMap<String, tokio::task::JoinHandle<()>>>,
}

impl TaskScheduler {
    pub fn new(
        tasks: SharedTasks,
        store: Arc<dyn KvStore>,
        clock: Arc<Clock>,
        retry: Arc<RetryController>,
    ) -> Self {
        Self {
            tasks,
            store,
            clock,
            retry,
            handles: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Arm a task: mark it Running, persist, and spawn its timer. A target
    /// in the past fires the retry loop immediately.
    pub async fn schedule(self: &Arc<Self>, task_id: &str) -> Result<()> {
        let (target_ms, advance_ms) = {
            let mut tasks = self.tasks.lock().await;
            let task = tasks
                .get_mut(task_id)
                .ok_or_else(|| SnipeError::Task(format!("not found: {task_id}")))?;
            if task.status == TaskStatus::Running {
                return Err(SnipeError::Task(format!("already running: {task_id}")));
            }
            task.status = TaskStatus::Running;
            task.stats.reset_run();
            task.touch();
            let out = (task.target_ms(), task.schedule.advance_ms);
            persist_tasks(self.store.as_ref(), &tasks).await;
            out
        };

        let remaining = self.clock.remaining_ms(target_ms, advance_ms);
        if remaining > TIMER_MAX_MS {
            self.record_alarm(task_id, target_ms).await?;
            tracing::info!(
                "📅 Task {task_id} is {:.1} days out, armed as durable alarm",
                remaining as f64 / 86_400_000.0
            );
        } else {
            tracing::info!("⏰ Task {task_id} armed, fires in {remaining}ms");
        }

        self.spawn_timer(task_id.to_string(), target_ms, advance_ms).await;
        Ok(())
    }

    async fn spawn_timer(self: &Arc<Self>, task_id: String, target_ms: i64, advance_ms: u64) {
        // Insert under the handles lock: the spawned task's self-removal
        // blocks on the same lock, so even an immediate fire cannot finish
        // before its handle is in the map.
        let mut handles = self.handles.lock().await;
        let scheduler = Arc::clone(self);
        let handle_id = task_id.clone();
        let handle = tokio::spawn(async move {
            // Chunk oversized delays; recompute each round since the clock
            // offset may drift across a multi-week wait.
            loop {
                let remaining = scheduler.clock.remaining_ms(target_ms, advance_ms);
                if remaining <= TIMER_MAX_MS {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(TIMER_MAX_MS as u64)).await;
            }
            scheduler.clock.precision_wait(target_ms, advance_ms).await;
            scheduler.clear_alarm(&task_id).await;

            // The task may have been cancelled while the timer was pending.
            let still_running = {
                let tasks = scheduler.tasks.lock().await;
                tasks.get(&task_id).map(|t| t.status == TaskStatus::Running).unwrap_or(false)
            };
            if still_running {
                match scheduler.retry.run(&task_id).await {
                    Ok(RunOutcome::Success { attempt, .. }) => {
                        tracing::info!("✅ Task {task_id} completed on attempt {attempt}");
                    }
                    Ok(RunOutcome::Exhausted { attempts, .. }) => {
                        tracing::warn!("❌ Task {task_id} exhausted its {attempts} attempts");
                    }
                    Ok(RunOutcome::Stopped { reason, .. }) => {
                        tracing::warn!("🛑 Task {task_id} stopped: {reason}");
                    }
                    Ok(RunOutcome::Cancelled { .. }) => {
                        tracing::info!("🛑 Task {task_id} cancelled mid-run");
                    }
                    Err(e) => {
                        tracing::error!("⚠️ Retry loop for {task_id} failed: {e}");
                    }
                }
            } else {
                tracing::info!("🛑 Timer for {task_id} fired after cancellation, skipping");
            }
            scheduler.handles.lock().await.remove(&task_id);
        });
        handles.insert(handle_id, handle);
    }

    /// Cancel a task. Idempotent: cancelling a finished, already-cancelled,
    /// or unknown task is a no-op, never an error.
    pub async fn cancel(&self, task_id: &str) {
        if let Some(handle) = self.handles.lock().await.remove(task_id) {
            handle.abort();
        }
        self.clear_alarm(task_id).await;

        let mut tasks = self.tasks.lock().await;
        if let Some(task) = tasks.get_mut(task_id) {
            if task.status == TaskStatus::Running {
                task.status = TaskStatus::Cancelled;
                task.touch();
                tracing::info!("🛑 Task {task_id} cancelled");
            }
        }
        persist_tasks(self.store.as_ref(), &tasks).await;
    }

    /// Re-arm interrupted work on startup, after the task map has been
    /// loaded: every persisted Running task, plus any durable alarm entry
    /// whose task lost its Running status. Alarm entries without a task are
    /// pruned.
    pub async fn restore(self: &Arc<Self>) {
        let mut pending: Vec<(String, i64, u64)> = {
            let tasks = self.tasks.lock().await;
            tasks
                .values()
                .filter(|t| t.status == TaskStatus::Running)
                .map(|t| (t.id.clone(), t.target_ms(), t.schedule.advance_ms))
                .collect()
        };

        let alarms = self.alarm_index().await;
        if !alarms.is_empty() {
            let mut tasks = self.tasks.lock().await;
            let mut dirty = false;
            for id in alarms.keys() {
                if pending.iter().any(|(armed, _, _)| armed == id) {
                    continue;
                }
                match tasks.get_mut(id) {
                    Some(task) => {
                        task.status = TaskStatus::Running;
                        task.touch();
                        dirty = true;
                        pending.push((id.clone(), task.target_ms(), task.schedule.advance_ms));
                        tracing::info!("📅 Durable alarm re-armed task {id}");
                    }
                    None => {
                        tracing::warn!("⚠️ Dropping durable alarm for unknown task {id}");
                    }
                }
            }
            if dirty {
                persist_tasks(self.store.as_ref(), &tasks).await;
            }
            drop(tasks);

            // Rewrite the index without the orphaned entries.
            let live: serde_json::Map<String, serde_json::Value> = alarms
                .into_iter()
                .filter(|(id, _)| pending.iter().any(|(armed, _, _)| armed == id))
                .collect();
            if let Err(e) = self.store.set(ALARMS_KEY, serde_json::Value::Object(live)).await {
                tracing::warn!("⚠️ Failed to prune alarm index: {e}");
            }
        }

        if pending.is_empty() {
            return;
        }
        tracing::info!("📅 Re-arming {} interrupted task(s)", pending.len());
        for (id, target_ms, advance_ms) in pending {
            self.spawn_timer(id, target_ms, advance_ms).await;
        }
    }

    /// True while a timer or retry loop is live for this task.
    pub async fn is_armed(&self, task_id: &str) -> bool {
        self.handles.lock().await.contains_key(task_id)
    }

    async fn alarm_index(&self) -> serde_json::Map<String, serde_json::Value> {
        match self.store.get(ALARMS_KEY).await {
            Ok(Some(serde_json::Value::Object(map))) => map,
            Ok(_) => serde_json::Map::new(),
            Err(e) => {
                tracing::warn!("⚠️ Failed to read alarm index: {e}");
                serde_json::Map::new()
            }
        }
    }

    async fn record_alarm(&self, task_id: &str, fire_at_ms: i64) -> Result<()> {
        let mut index = self.alarm_index().await;
        index.insert(task_id.to_string(), serde_json::json!(fire_at_ms));
        self.store.set(ALARMS_KEY, serde_json::Value::Object(index)).await
    }

    /// Best-effort removal from the alarm index.
    async fn clear_alarm(&self, task_id: &str) {
        let mut index = self.alarm_index().await;
        if index.remove(task_id).is_some() {
            if let Err(e) = self.store.set(ALARMS_KEY, serde_json::Value::Object(index)).await {
                tracing::warn!("⚠️ Failed to clear alarm for {task_id}: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{Dispatch, ResponseRecord};
    use crate::store::MemoryStore;
    use crate::task::{ExecutionPolicy, RequestSpec, Schedule, Task};
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use couponsnipe_core::DispatchError;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::time::Instant;

    /// Records when dispatch was called, answers 200.
    struct RecordingDispatcher {
        fired_at_ms: AtomicI64,
    }

    impl RecordingDispatcher {
        fn new() -> Self {
            Self { fired_at_ms: AtomicI64::new(0) }
        }
    }

    #[async_trait]
    impl Dispatch for RecordingDispatcher {
        async fn dispatch(
            &self,
            _task: &Task,
            _attempt: u32,
        ) -> std::result::Result<ResponseRecord, DispatchError> {
            self.fired_at_ms.store(Utc::now().timestamp_millis(), Ordering::SeqCst);
            Ok(ResponseRecord {
                status: 200,
                body: String::new(),
                headers: BTreeMap::new(),
                duration_ms: 1.0,
                completed_at: Utc::now().timestamp_millis(),
                path: "standard".into(),
            })
        }
    }

    fn build(
        execute_in_ms: i64,
        advance_ms: u64,
    ) -> (Arc<TaskScheduler>, Arc<RecordingDispatcher>, SharedTasks, String) {
        let mut schedule = Schedule::at(Utc::now() + ChronoDuration::milliseconds(execute_in_ms));
        schedule.advance_ms = advance_ms;
        let task = Task::new(
            "sched-test",
            RequestSpec::new("https://shop.example/claim", "POST"),
            schedule,
            ExecutionPolicy { max_attempts: 1, ..Default::default() },
        );
        let id = task.id.clone();
        let tasks: SharedTasks =
            Arc::new(tokio::sync::Mutex::new(HashMap::from([(id.clone(), task)])));
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let retry = Arc::new(RetryController::new(
            Arc::clone(&tasks),
            Arc::clone(&store),
            Arc::clone(&dispatcher) as Arc<dyn Dispatch>,
        ));
        let scheduler = Arc::new(TaskScheduler::new(
            Arc::clone(&tasks),
            store,
            Arc::new(Clock::new()),
            retry,
        ));
        (scheduler, dispatcher, tasks, id)
    }

    #[tokio::test]
    async fn test_fires_at_execute_at_minus_advance() {
        // Target 600ms out with a 100ms advance: dispatch lands near +500ms.
        let (scheduler, dispatcher, tasks, id) = build(600, 100);
        let armed = Instant::now();
        scheduler.schedule(&id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(900)).await;

        let fired = dispatcher.fired_at_ms.load(Ordering::SeqCst);
        assert!(fired > 0, "dispatch never fired");
        let waited = armed.elapsed().as_millis() as i64
            - (Utc::now().timestamp_millis() - fired);
        assert!((waited - 500).abs() <= 50, "fired after {waited}ms, expected ~500ms");
        assert_eq!(tasks.lock().await.get(&id).unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_past_target_fires_immediately() {
        let (scheduler, dispatcher, tasks, id) = build(-5_000, 500);
        scheduler.schedule(&id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(dispatcher.fired_at_ms.load(Ordering::SeqCst) > 0);
        assert_eq!(tasks.lock().await.get(&id).unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_completed_task_is_disarmed() {
        // An immediate fire with a fast dispatcher must not leave a stale
        // handle behind once the run completes.
        let (scheduler, _dispatcher, tasks, id) = build(-1_000, 0);
        scheduler.schedule(&id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(tasks.lock().await.get(&id).unwrap().status, TaskStatus::Completed);
        assert!(!scheduler.is_armed(&id).await, "finished task still armed");
    }

    #[tokio::test]
    async fn test_cancel_before_fire_suppresses_dispatch() {
        let (scheduler, dispatcher, tasks, id) = build(5_000, 0);
        scheduler.schedule(&id).await.unwrap();
        assert!(scheduler.is_armed(&id).await);

        scheduler.cancel(&id).await;
        assert_eq!(tasks.lock().await.get(&id).unwrap().status, TaskStatus::Cancelled);

        // Cancelling again (and cancelling an unknown id) is a no-op.
        scheduler.cancel(&id).await;
        scheduler.cancel("ghost").await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(dispatcher.fired_at_ms.load(Ordering::SeqCst), 0);
        assert_eq!(tasks.lock().await.get(&id).unwrap().status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_double_schedule_is_rejected() {
        let (scheduler, _dispatcher, _tasks, id) = build(5_000, 0);
        scheduler.schedule(&id).await.unwrap();
        assert!(scheduler.schedule(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_restore_rearms_running_tasks() {
        let (scheduler, dispatcher, tasks, id) = build(200, 0);
        // Simulate a process that died with the task marked Running.
        tasks.lock().await.get_mut(&id).unwrap().status = TaskStatus::Running;

        scheduler.restore().await;
        assert!(scheduler.is_armed(&id).await);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(dispatcher.fired_at_ms.load(Ordering::SeqCst) > 0);
        assert_eq!(tasks.lock().await.get(&id).unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_far_future_writes_durable_alarm() {
        let (scheduler, _dispatcher, _tasks, id) = build(TIMER_MAX_MS + 60_000, 0);
        scheduler.schedule(&id).await.unwrap();

        let index = scheduler.alarm_index().await;
        assert!(index.contains_key(&id), "expected a durable alarm entry");

        scheduler.cancel(&id).await;
        assert!(scheduler.alarm_index().await.is_empty());
    }

    #[tokio::test]
    async fn test_restore_consults_alarm_index() {
        let (scheduler, _dispatcher, tasks, id) = build(TIMER_MAX_MS + 60_000, 0);
        scheduler
            .record_alarm(&id, tasks.lock().await.get(&id).unwrap().target_ms())
            .await
            .unwrap();
        // Orphaned entry from a long-deleted task.
        scheduler.record_alarm("ghost", 0).await.unwrap();

        // The persisted status drifted back to Pending; only the alarm entry
        // remembers this task was armed.
        scheduler.restore().await;
        assert!(scheduler.is_armed(&id).await);
        assert_eq!(tasks.lock().await.get(&id).unwrap().status, TaskStatus::Running);

        let index = scheduler.alarm_index().await;
        assert!(index.contains_key(&id));
        assert!(!index.contains_key("ghost"));
    }
}
