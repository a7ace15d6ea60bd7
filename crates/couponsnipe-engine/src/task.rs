//! Task definitions — the core data model for scheduled work.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dispatch::ResponseRecord;

/// Task map shared between the scheduler, retry loops, and the service.
/// Keyed by task id, so concurrent tasks touch disjoint entries.
pub type SharedTasks = Arc<tokio::sync::Mutex<HashMap<String, Task>>>;

/// A scheduled single-request task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task ID, stable for the task's lifetime.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Current status.
    pub status: TaskStatus,
    /// The request to fire.
    pub request: RequestSpec,
    /// When to fire it.
    pub schedule: Schedule,
    /// Attempt budget, intervals, timeout, hedging.
    pub policy: ExecutionPolicy,
    /// Success/stop/continue classification rules.
    pub rules: RuleSet,
    /// Per-run statistics.
    pub stats: TaskStats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(name: &str, request: RequestSpec, schedule: Schedule, policy: ExecutionPolicy) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            status: TaskStatus::Pending,
            request,
            schedule,
            policy,
            rules: RuleSet::default(),
            stats: TaskStats::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Fire instant in epoch millis: target execute time minus nothing —
    /// the advance offset is applied by the precision wait.
    pub fn target_ms(&self) -> i64 {
        self.schedule.execute_at.timestamp_millis()
    }
}

/// Task status. Linear per run: Pending → Running → terminal. A terminal
/// task may be restarted, which re-enters the path from Pending.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// The outgoing request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSpec {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Opaque payload, sent as-is.
    #[serde(default)]
    pub body: Option<String>,
    /// Site identifier used to select response rules and a signer
    /// (e.g. `meituan.com`). Derived from the URL host when not given.
    #[serde(default)]
    pub target_site: String,
}

fn default_method() -> String { "POST".into() }

impl RequestSpec {
    pub fn new(url: &str, method: &str) -> Self {
        Self {
            url: url.to_string(),
            method: method.to_string(),
            headers: BTreeMap::new(),
            body: None,
            target_site: site_from_url(url),
        }
    }
}

/// Extract a bare site identifier from a URL (`https://www.jd.com/x` → `jd.com`).
pub fn site_from_url(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.trim_start_matches("www.").to_string()))
        .unwrap_or_else(|| "unknown".into())
}

/// Scheduling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    /// Absolute target time in the reference clock's terms.
    pub execute_at: DateTime<Utc>,
    /// Lead time subtracted before firing, covering request travel latency.
    #[serde(default = "default_advance_ms")]
    pub advance_ms: u64,
    /// Informational only.
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_advance_ms() -> u64 { 500 }
fn default_timezone() -> String { "Asia/Shanghai".into() }

impl Schedule {
    pub fn at(execute_at: DateTime<Utc>) -> Self {
        Self {
            execute_at,
            advance_ms: default_advance_ms(),
            timezone: default_timezone(),
        }
    }
}

/// Retry/backoff/hedging knobs for one task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay between attempts.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Per-attempt cap, enforced by the dispatcher.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Hedged request paths per logical attempt. 1 = no hedging. Hedging can
    /// produce duplicate server-side effects; callers opt in explicitly.
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
    #[serde(default)]
    pub backoff: BackoffMode,
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,
}

fn default_max_attempts() -> u32 { 10 }
fn default_interval_ms() -> u64 { 50 }
fn default_timeout_ms() -> u64 { 15_000 }
fn default_concurrency() -> u32 { 1 }
fn default_max_interval_ms() -> u64 { 5_000 }

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            interval_ms: default_interval_ms(),
            timeout_ms: default_timeout_ms(),
            concurrency: default_concurrency(),
            backoff: BackoffMode::default(),
            max_interval_ms: default_max_interval_ms(),
        }
    }
}

/// Inter-attempt delay growth.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackoffMode {
    #[default]
    None,
    Exponential,
}

/// A single response predicate. Parsed once at task creation; evaluation
/// never re-parses condition strings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rule {
    /// HTTP status code equality.
    StatusCode { value: u16 },
    /// Case-insensitive substring containment in the body.
    BodyContains { value: String },
    /// Structured-field equality via a dotted path (`data.code`).
    JsonEquals { path: String, value: serde_json::Value },
    /// Structured-field inequality via a dotted path.
    JsonNotEquals { path: String, value: serde_json::Value },
}

/// Success and stop predicates for one task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleSet {
    /// Any match ⇒ the run succeeded.
    #[serde(default)]
    pub success: Vec<Rule>,
    /// Any match ⇒ stop retrying, the run failed for good.
    #[serde(default)]
    pub stop: Vec<Rule>,
    /// Terminal body phrases (already claimed, sold out, ...). Checked after
    /// the stop rules.
    #[serde(default = "default_stop_phrases")]
    pub stop_phrases: Vec<String>,
}

/// Business-message classes that end a run no matter how much attempt budget
/// remains. The Chinese entries are the exact strings the target sites emit.
pub fn default_stop_phrases() -> Vec<String> {
    [
        "已经领取过",
        "已经抢过",
        "活动已结束",
        "库存不足",
        "不在活动时间",
        "用户不符合条件",
        "已达上限",
        "already claimed",
        "sold out",
        "event ended",
        "not in active window",
        "limit reached",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for RuleSet {
    fn default() -> Self {
        Self {
            success: vec![Rule::StatusCode { value: 200 }],
            stop: Vec::new(),
            stop_phrases: default_stop_phrases(),
        }
    }
}

/// Per-task statistics, mutated by the retry loop after each attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskStats {
    pub attempts: u32,
    pub successes: u32,
    pub failures: u32,
    pub time_validation_failures: u32,
    pub last_executed: Option<DateTime<Utc>>,
    pub last_result: Option<ResponseRecord>,
    /// Running mean over dispatch latencies: `avg' = avg + (sample − avg) / n`.
    pub average_response_time_ms: f64,
    /// Latency samples behind the running mean. Failed dispatches count an
    /// attempt but contribute no sample.
    #[serde(default)]
    pub latency_samples: u32,
}

impl TaskStats {
    /// Record a completed dispatch: one attempt, one latency sample, and the
    /// response as last result.
    pub fn record_response(&mut self, response: &ResponseRecord) {
        self.attempts += 1;
        self.last_executed = Some(Utc::now());
        self.last_result = Some(response.clone());
        self.latency_samples += 1;
        let n = self.latency_samples as f64;
        self.average_response_time_ms += (response.duration_ms - self.average_response_time_ms) / n;
    }

    /// Record a dispatch that never produced a response.
    pub fn record_failure(&mut self) {
        self.attempts += 1;
        self.failures += 1;
        self.last_executed = Some(Utc::now());
    }

    /// Reset run-scoped counters when a task is restarted.
    pub fn reset_run(&mut self) {
        self.attempts = 0;
        self.time_validation_failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_with_latency(ms: f64) -> ResponseRecord {
        ResponseRecord {
            status: 200,
            body: String::new(),
            headers: BTreeMap::new(),
            duration_ms: ms,
            completed_at: 0,
            path: "standard".into(),
        }
    }

    #[test]
    fn test_average_is_arithmetic_mean() {
        let mut stats = TaskStats::default();
        let samples = [12.0, 48.0, 7.5, 100.0, 33.3];
        for s in samples {
            stats.record_response(&response_with_latency(s));
        }
        let mean: f64 = samples.iter().sum::<f64>() / samples.len() as f64;
        assert!((stats.average_response_time_ms - mean).abs() < 1e-9);
        assert_eq!(stats.attempts, 5);
        assert_eq!(stats.latency_samples, 5);
    }

    #[test]
    fn test_failures_do_not_skew_average() {
        let mut stats = TaskStats::default();
        stats.record_response(&response_with_latency(10.0));
        stats.record_failure();
        stats.record_response(&response_with_latency(30.0));
        assert_eq!(stats.attempts, 3);
        assert_eq!(stats.failures, 1);
        assert!((stats.average_response_time_ms - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_site_from_url() {
        assert_eq!(site_from_url("https://www.jd.com/coupon"), "jd.com");
        assert_eq!(site_from_url("https://cube.meituan.com/x?y=1"), "cube.meituan.com");
        assert_eq!(site_from_url("not a url"), "unknown");
    }

    #[test]
    fn test_task_serde_round_trip() {
        let task = Task::new(
            "jd 20:00 coupon",
            RequestSpec::new("https://api.m.jd.com/claim", "POST"),
            Schedule::at(Utc::now()),
            ExecutionPolicy::default(),
        );
        let json = serde_json::to_string(&task).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, task.id);
        assert_eq!(back.policy, task.policy);
        assert_eq!(back.rules, task.rules);
        assert_eq!(back.schedule.advance_ms, 500);
    }

    #[test]
    fn test_rule_serde_shape() {
        let rule = Rule::JsonEquals { path: "data.code".into(), value: serde_json::json!(0) };
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["kind"], "json_equals");
        assert_eq!(json["path"], "data.code");
    }
}
