//! Command surface — the one object embedders and the CLI talk to.
//!
//! Owns the shared task map, the store, the clock, and the scheduler, and
//! exposes task lifecycle commands plus time sync, immediate execution, an
//! export/import snapshot, and a bounded in-memory execution log.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use couponsnipe_clock::{Clock, SyncStatus, TimeSource, builtin_sources};
use couponsnipe_core::config::Settings;
use couponsnipe_core::{Result, SnipeError};

use crate::dispatch::{Dispatch, HttpDispatcher, ResponseRecord};
use crate::retry::RetryController;
use crate::rules::{Verdict, classify};
use crate::scheduler::TaskScheduler;
use crate::signer::SignerRegistry;
use crate::store::{FileStore, KvStore, load_tasks, persist_tasks};
use crate::task::{
    BackoffMode, ExecutionPolicy, RequestSpec, RuleSet, Schedule, SharedTasks, Task, TaskStatus,
};

/// Snapshot format version, bumped on incompatible changes.
const SNAPSHOT_VERSION: u32 = 1;

/// Parameters for a new task. Unset knobs inherit the configured defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewTask {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    /// RFC 3339 (`2026-06-18T20:00:00+08:00`) or wall-clock
    /// `HH:MM[:SS[:ms]]`, resolved to today or tomorrow, whichever is next.
    #[serde(default)]
    pub execute_at: Option<String>,
    #[serde(default)]
    pub advance_ms: Option<u64>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub interval_ms: Option<u64>,
    #[serde(default)]
    pub concurrency: Option<u32>,
    #[serde(default)]
    pub backoff: Option<BackoffMode>,
    #[serde(default)]
    pub rules: Option<RuleSet>,
}

/// Portable dump of tasks and settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    pub tasks: Vec<Task>,
    pub settings: Settings,
}

/// One line of the bounded execution log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub level: String,
    /// Set for entries tied to one task; None for service-wide events.
    pub task_id: Option<String>,
    pub message: String,
}

pub struct SnipeService {
    settings: Settings,
    tasks: SharedTasks,
    store: Arc<dyn KvStore>,
    clock: Arc<Clock>,
    scheduler: Arc<TaskScheduler>,
    dispatcher: Arc<dyn Dispatch>,
    sources: Vec<TimeSource>,
    logs: tokio::sync::Mutex<VecDeque<LogEntry>>,
}

impl SnipeService {
    /// Production wiring: file store under the home directory, HTTP
    /// dispatcher with the default signer registry.
    pub fn new(settings: Settings) -> Arc<Self> {
        let store: Arc<dyn KvStore> = Arc::new(FileStore::new(&FileStore::default_path()));
        let dispatcher: Arc<dyn Dispatch> = Arc::new(HttpDispatcher::new(
            Arc::new(SignerRegistry::with_defaults()),
            &settings.execution.user_agent,
        ));
        Self::with_parts(settings, store, dispatcher)
    }

    /// Wiring seam for tests and embedders with their own store/transport.
    pub fn with_parts(
        settings: Settings,
        store: Arc<dyn KvStore>,
        dispatcher: Arc<dyn Dispatch>,
    ) -> Arc<Self> {
        let tasks: SharedTasks = Arc::new(tokio::sync::Mutex::new(Default::default()));
        let clock = Arc::new(Clock::new());
        let retry = Arc::new(RetryController::new(
            Arc::clone(&tasks),
            Arc::clone(&store),
            Arc::clone(&dispatcher),
        ));
        let scheduler = Arc::new(TaskScheduler::new(
            Arc::clone(&tasks),
            Arc::clone(&store),
            Arc::clone(&clock),
            retry,
        ));
        Arc::new(Self {
            settings,
            tasks,
            store,
            clock,
            scheduler,
            dispatcher,
            sources: builtin_sources(),
            logs: tokio::sync::Mutex::new(VecDeque::new()),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Load persisted tasks and re-arm interrupted timers. Call once at
    /// startup.
    pub async fn restore(&self) {
        let loaded = load_tasks(self.store.as_ref()).await;
        if !loaded.is_empty() {
            tracing::info!("📦 Restored {} task(s) from the store", loaded.len());
            *self.tasks.lock().await = loaded;
        }
        self.scheduler.restore().await;
    }

    /// Create a task from the request parameters and persist it. The task is
    /// created Pending; `start` arms it.
    pub async fn create_task(&self, new: NewTask) -> Result<Task> {
        if new.url.trim().is_empty() {
            return Err(SnipeError::Task("url must not be empty".into()));
        }

        let execute_at = match new.execute_at.as_deref() {
            None => Utc::now(),
            Some(raw) => match parse_execute_at(raw, Local::now()) {
                Ok(at) => at,
                Err(e) => {
                    // An unparsable time degrades to "fire on start" rather
                    // than losing the task.
                    tracing::warn!("⚠️ {e}; task will fire as soon as it is started");
                    self.log("warn", &format!("{e}; falling back to immediate fire")).await;
                    Utc::now()
                }
            },
        };

        let mut request = RequestSpec::new(&new.url, new.method.as_deref().unwrap_or("POST"));
        request.headers = new.headers;
        request.body = new.body;

        let exec = &self.settings.execution;
        let policy = ExecutionPolicy {
            max_attempts: new.max_attempts.unwrap_or(exec.max_attempts),
            interval_ms: new.interval_ms.unwrap_or(exec.interval_ms),
            timeout_ms: exec.timeout_ms,
            concurrency: new.concurrency.unwrap_or(exec.concurrency),
            backoff: new.backoff.unwrap_or_default(),
            max_interval_ms: exec.max_interval_ms,
        };

        let mut schedule = Schedule::at(execute_at);
        schedule.advance_ms = new.advance_ms.unwrap_or(exec.advance_ms);

        let mut task = Task::new(&new.name, request, schedule, policy);
        if let Some(rules) = new.rules {
            task.rules = rules;
        }

        let mut tasks = self.tasks.lock().await;
        tasks.insert(task.id.clone(), task.clone());
        persist_tasks(self.store.as_ref(), &tasks).await;
        drop(tasks);

        self.log_task("info", Some(&task.id), &format!("Task created: {}", task.name)).await;
        Ok(task)
    }

    /// Arm a task's timer. Refreshes the clock first when sync is enabled,
    /// so the fire instant is computed against a fresh offset.
    pub async fn start(&self, task_id: &str) -> Result<()> {
        if self.settings.clock.enabled {
            self.sync_time().await;
        }
        self.scheduler.schedule(task_id).await?;
        self.log_task("info", Some(task_id), "Task started").await;
        Ok(())
    }

    /// Cancel a task. Idempotent.
    pub async fn stop(&self, task_id: &str) {
        self.scheduler.cancel(task_id).await;
        self.log_task("info", Some(task_id), "Task stopped").await;
    }

    /// All tasks, newest first.
    pub async fn list(&self) -> Vec<Task> {
        let tasks = self.tasks.lock().await;
        let mut list: Vec<Task> = tasks.values().cloned().collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        list
    }

    pub async fn get(&self, task_id: &str) -> Option<Task> {
        self.tasks.lock().await.get(task_id).cloned()
    }

    /// Cancel (if running) and delete a task.
    pub async fn delete(&self, task_id: &str) -> Result<()> {
        self.scheduler.cancel(task_id).await;
        let mut tasks = self.tasks.lock().await;
        tasks
            .remove(task_id)
            .ok_or_else(|| SnipeError::Task(format!("not found: {task_id}")))?;
        persist_tasks(self.store.as_ref(), &tasks).await;
        drop(tasks);
        self.log_task("info", Some(task_id), "Task deleted").await;
        Ok(())
    }

    /// Fire a single attempt right now, bypassing schedule and retry budget.
    /// Stats are recorded; the task's status is untouched.
    pub async fn execute_immediate(&self, task_id: &str) -> Result<(ResponseRecord, Verdict)> {
        let task = self
            .get(task_id)
            .await
            .ok_or_else(|| SnipeError::Task(format!("not found: {task_id}")))?;

        let response = self.dispatcher.dispatch(&task, 1).await?;
        let verdict = classify(&response, &task.rules);

        let mut tasks = self.tasks.lock().await;
        if let Some(task) = tasks.get_mut(task_id) {
            task.stats.record_response(&response);
            if verdict == Verdict::Success {
                task.stats.successes += 1;
            }
            task.touch();
        }
        persist_tasks(self.store.as_ref(), &tasks).await;
        drop(tasks);

        self.log_task(
            "info",
            Some(task_id),
            &format!("Immediate run: status {} ({verdict:?})", response.status),
        )
        .await;
        Ok((response, verdict))
    }

    /// Sync the clock against the configured reference source and report the
    /// resulting state. A failed sync still reports (stale) state.
    pub async fn sync_time(&self) -> SyncStatus {
        if let Some(source) =
            TimeSource::for_site(&self.sources, &self.settings.clock.default_source)
        {
            let ok = self.clock.sync(source).await;
            self.log(
                if ok { "info" } else { "warn" },
                &format!(
                    "Time sync via {}: {}",
                    source.name,
                    if ok { "ok" } else { "failed" }
                ),
            )
            .await;
        }
        self.clock
            .status(Duration::from_secs(self.settings.clock.sync_interval_secs * 2))
    }

    /// Dump all tasks and settings into a portable snapshot.
    pub async fn export(&self) -> Snapshot {
        let tasks = self.tasks.lock().await;
        Snapshot {
            version: SNAPSHOT_VERSION,
            exported_at: Utc::now(),
            tasks: tasks.values().cloned().collect(),
            settings: self.settings.clone(),
        }
    }

    /// Merge a snapshot's tasks into the map (snapshot wins on id collision)
    /// and persist. Tasks that were mid-run when exported come back Pending;
    /// timers do not survive an export.
    pub async fn import(&self, snapshot: Snapshot) -> Result<usize> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SnipeError::Task(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        let count = snapshot.tasks.len();
        let mut tasks = self.tasks.lock().await;
        for mut task in snapshot.tasks {
            if task.status == TaskStatus::Running {
                task.status = TaskStatus::Pending;
            }
            tasks.insert(task.id.clone(), task);
        }
        persist_tasks(self.store.as_ref(), &tasks).await;
        drop(tasks);
        self.log("info", &format!("Imported {count} task(s)")).await;
        Ok(count)
    }

    /// Cancel everything and wipe tasks from memory and the store.
    pub async fn clear_all(&self) -> Result<()> {
        let ids: Vec<String> = self.tasks.lock().await.keys().cloned().collect();
        for id in &ids {
            self.scheduler.cancel(id).await;
        }
        self.tasks.lock().await.clear();
        self.store.clear().await?;
        self.log("info", &format!("Cleared {} task(s)", ids.len())).await;
        Ok(())
    }

    /// Append a service-wide entry to the bounded execution log, evicting the
    /// oldest entry once the configured cap is reached.
    pub async fn log(&self, level: &str, message: &str) {
        self.log_task(level, None, message).await;
    }

    /// Append an entry attributed to one task.
    pub async fn log_task(&self, level: &str, task_id: Option<&str>, message: &str) {
        let mut logs = self.logs.lock().await;
        if logs.len() >= self.settings.log.max_entries {
            logs.pop_front();
        }
        logs.push_back(LogEntry {
            at: Utc::now(),
            level: level.to_string(),
            task_id: task_id.map(String::from),
            message: message.to_string(),
        });
    }

    /// Execution log, newest first.
    pub async fn logs(&self) -> Vec<LogEntry> {
        self.logs.lock().await.iter().rev().cloned().collect()
    }

    /// Execution log entries for one task, newest first.
    pub async fn logs_for(&self, task_id: &str) -> Vec<LogEntry> {
        self.logs
            .lock()
            .await
            .iter()
            .rev()
            .filter(|e| e.task_id.as_deref() == Some(task_id))
            .cloned()
            .collect()
    }
}

/// Resolve an execution time string. Accepts RFC 3339 or a wall-clock
/// `HH:MM[:SS[:ms]]` resolved against the local date: today if still ahead,
/// otherwise tomorrow.
pub fn parse_execute_at(raw: &str, now: DateTime<Local>) -> Result<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Ok(at.with_timezone(&Utc));
    }

    let parts: Vec<&str> = raw.split(':').collect();
    if !(2..=4).contains(&parts.len()) {
        return Err(SnipeError::Schedule(format!("unrecognized execute time {raw:?}")));
    }
    let mut nums = [0u32; 4];
    for (i, part) in parts.iter().enumerate() {
        nums[i] = part
            .parse()
            .map_err(|_| SnipeError::Schedule(format!("unrecognized execute time {raw:?}")))?;
    }
    let [h, m, s, ms] = nums;
    let time = NaiveTime::from_hms_milli_opt(h, m, s, ms)
        .ok_or_else(|| SnipeError::Schedule(format!("execute time out of range {raw:?}")))?;

    let mut date = now.date_naive();
    if time <= now.time() {
        date = date.succ_opt().unwrap_or(date);
    }
    let local = Local
        .from_local_datetime(&date.and_time(time))
        .earliest()
        .ok_or_else(|| SnipeError::Schedule(format!("execute time invalid locally {raw:?}")))?;
    Ok(local.with_timezone(&Utc))
}
