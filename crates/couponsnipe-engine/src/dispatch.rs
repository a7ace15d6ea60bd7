//! Execution dispatcher — sends the actual request(s).
//!
//! One `dispatch` call is one logical attempt. With `concurrency > 1` the
//! attempt fans out into hedged variant paths (baseline, short-delayed,
//! rapid-fire burst, re-randomized identity) raced in parallel and collapsed
//! to a single winning outcome before classification. Hedging trades
//! duplicate sends for latency-jitter tolerance; it is never a correctness
//! mechanism.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use rand::Rng;
use serde::{Deserialize, Serialize};

use couponsnipe_core::DispatchError;

use crate::signer::SignerRegistry;
use crate::task::Task;

/// Spacing between rapid-fire burst sends.
const BURST_SPACING_MS: u64 = 10;
/// Sends in one rapid-fire burst.
const BURST_COUNT: usize = 3;
/// Lag applied to the delayed hedge path.
const HEDGE_DELAY_MS: u64 = 50;
/// Upper bound on hedged paths regardless of configured concurrency.
const MAX_HEDGE_PATHS: u32 = 4;

/// A completed HTTP exchange, as seen by the classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub status: u16,
    pub body: String,
    pub headers: BTreeMap<String, String>,
    pub duration_ms: f64,
    /// Completion instant, epoch millis. Tie-breaker for hedge winners.
    pub completed_at: i64,
    /// Which hedge path produced this response.
    pub path: String,
}

impl ResponseRecord {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Transport seam. The retry loop only sees this trait; tests script it.
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(&self, task: &Task, attempt: u32)
    -> Result<ResponseRecord, DispatchError>;
}

/// A request fully assembled for sending: defaults + signer headers + task
/// headers, body, and the per-attempt timeout.
#[derive(Debug, Clone)]
struct PreparedRequest {
    url: String,
    method: String,
    headers: BTreeMap<String, String>,
    body: Option<String>,
    timeout: Duration,
}

/// reqwest-backed dispatcher.
pub struct HttpDispatcher {
    client: reqwest::Client,
    signers: Arc<SignerRegistry>,
    user_agent: String,
}

impl HttpDispatcher {
    pub fn new(signers: Arc<SignerRegistry>, user_agent: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            signers,
            user_agent: user_agent.to_string(),
        }
    }

    /// Assemble the outgoing request. Signer failure or absence degrades to
    /// unsigned headers; it never blocks the attempt.
    async fn prepare(&self, task: &Task) -> PreparedRequest {
        let mut headers = BTreeMap::from([
            ("User-Agent".to_string(), self.user_agent.clone()),
            ("Accept".to_string(), "application/json, text/plain, */*".to_string()),
            ("Accept-Language".to_string(), "zh-CN,zh;q=0.9,en;q=0.8".to_string()),
            ("Cache-Control".to_string(), "no-cache".to_string()),
            ("Pragma".to_string(), "no-cache".to_string()),
        ]);

        for (k, v) in self.signers.sign_for(&task.request.target_site, &task.request).await {
            headers.insert(k, v);
        }

        // Task headers win over defaults and signer output.
        for (k, v) in &task.request.headers {
            headers.insert(k.clone(), v.clone());
        }

        // Auto-detect JSON bodies without an explicit content type.
        if let Some(body) = &task.request.body
            && !headers.keys().any(|k| k.eq_ignore_ascii_case("content-type"))
            && (body.trim_start().starts_with('{') || body.trim_start().starts_with('['))
        {
            headers.insert("Content-Type".into(), "application/json;charset=UTF-8".into());
        }

        PreparedRequest {
            url: task.request.url.clone(),
            method: task.request.method.clone(),
            headers,
            body: task.request.body.clone(),
            timeout: Duration::from_millis(task.policy.timeout_ms),
        }
    }

    async fn send_once(
        &self,
        prepared: &PreparedRequest,
        path: &str,
    ) -> Result<ResponseRecord, DispatchError> {
        let method = reqwest::Method::from_bytes(prepared.method.to_uppercase().as_bytes())
            .map_err(|_| DispatchError::Aborted(format!("unsupported method: {}", prepared.method)))?;

        let mut request = self
            .client
            .request(method, &prepared.url)
            .timeout(prepared.timeout);

        for (key, value) in &prepared.headers {
            request = request.header(key.as_str(), value.as_str());
        }
        if let Some(body) = &prepared.body {
            request = request.body(body.clone());
        }

        let started = Instant::now();
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                DispatchError::Timeout
            } else if e.is_builder() || e.is_request() {
                DispatchError::Aborted(e.to_string())
            } else {
                DispatchError::Network(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), v.to_str().unwrap_or("?").to_string()))
            .collect();
        let body = response
            .text()
            .await
            .map_err(|e| DispatchError::Network(format!("read body failed: {e}")))?;

        Ok(ResponseRecord {
            status,
            body,
            headers,
            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
            completed_at: Utc::now().timestamp_millis(),
            path: path.to_string(),
        })
    }

    /// Burst path: sends at fixed micro-intervals, keeps the first response.
    async fn rapid_fire(&self, prepared: &PreparedRequest) -> Result<ResponseRecord, DispatchError> {
        let mut futs = Vec::with_capacity(BURST_COUNT);
        for i in 0..BURST_COUNT {
            let delay = Duration::from_millis(BURST_SPACING_MS * i as u64);
            futs.push(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                self.send_once(prepared, "burst").await
            });
        }

        let mut last_err = DispatchError::Aborted("empty burst".into());
        for result in futures::future::join_all(futs).await {
            match result {
                Ok(response) => return Ok(response),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    /// Masked path: same request under a re-randomized client identity.
    async fn masked(&self, prepared: &PreparedRequest) -> Result<ResponseRecord, DispatchError> {
        let mut variant = prepared.clone();
        variant.headers.insert("User-Agent".into(), random_user_agent());
        variant.headers.insert("X-Request-ID".into(), random_token("req"));
        self.send_once(&variant, "masked").await
    }
}

#[async_trait]
impl Dispatch for HttpDispatcher {
    async fn dispatch(&self, task: &Task, _attempt: u32) -> Result<ResponseRecord, DispatchError> {
        let prepared = self.prepare(task).await;
        let paths = task.policy.concurrency.clamp(1, MAX_HEDGE_PATHS);

        if paths == 1 {
            return self.send_once(&prepared, "standard").await;
        }

        let mut futs: Vec<BoxFuture<'_, Result<ResponseRecord, DispatchError>>> =
            vec![Box::pin(self.send_once(&prepared, "standard"))];
        if paths >= 2 {
            futs.push(Box::pin(async {
                tokio::time::sleep(Duration::from_millis(HEDGE_DELAY_MS)).await;
                self.send_once(&prepared, "delayed").await
            }));
        }
        if paths >= 3 {
            futs.push(Box::pin(self.rapid_fire(&prepared)));
        }
        if paths >= 4 {
            futs.push(Box::pin(self.masked(&prepared)));
        }

        let results = futures::future::join_all(futs).await;
        tracing::debug!(
            "🎯 Hedged dispatch for '{}': {} paths raced",
            task.name,
            results.len()
        );
        select_winner(results)
    }
}

/// Collapse hedge results to one outcome: any 2xx wins (earliest completion
/// breaks ties); otherwise the lowest status code; otherwise the first error.
pub(crate) fn select_winner(
    results: Vec<Result<ResponseRecord, DispatchError>>,
) -> Result<ResponseRecord, DispatchError> {
    let mut responses = Vec::new();
    let mut first_err = None;
    for result in results {
        match result {
            Ok(r) => responses.push(r),
            Err(e) => {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
    }

    if let Some(winner) = responses
        .iter()
        .filter(|r| r.is_success())
        .min_by_key(|r| r.completed_at)
    {
        return Ok(winner.clone());
    }
    if let Some(best) = responses.into_iter().min_by_key(|r| r.status) {
        return Ok(best);
    }
    Err(first_err.unwrap_or_else(|| DispatchError::Aborted("no hedge path produced a result".into())))
}

fn random_user_agent() -> String {
    const AGENTS: [&str; 4] = [
        "Mozilla/5.0 (iPhone; CPU iPhone OS 16_6 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/16.6 Mobile/15E148 Safari/604.1",
        "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1",
        "Mozilla/5.0 (Linux; Android 13; SM-G991B) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Mobile Safari/537.36",
        "Mozilla/5.0 (Linux; Android 14; Pixel 7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Mobile Safari/537.36",
    ];
    let idx = rand::thread_rng().gen_range(0..AGENTS.len());
    AGENTS[idx].to_string()
}

fn random_token(prefix: &str) -> String {
    let n: u64 = rand::thread_rng().r#gen();
    format!("{prefix}_{}_{n:x}", Utc::now().timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{ExecutionPolicy, RequestSpec, Schedule};
    use httpmock::prelude::*;

    fn record(status: u16, completed_at: i64, path: &str) -> ResponseRecord {
        ResponseRecord {
            status,
            body: String::new(),
            headers: BTreeMap::new(),
            duration_ms: 1.0,
            completed_at,
            path: path.into(),
        }
    }

    fn make_task(url: &str, concurrency: u32) -> Task {
        let mut task = Task::new(
            "dispatch-test",
            RequestSpec::new(url, "GET"),
            Schedule::at(Utc::now()),
            ExecutionPolicy { concurrency, timeout_ms: 2_000, ..Default::default() },
        );
        task.request.target_site = "unregistered.example".into();
        task
    }

    #[test]
    fn test_winner_prefers_earliest_success() {
        let results = vec![
            Ok(record(200, 150, "delayed")),
            Ok(record(200, 100, "standard")),
            Ok(record(500, 50, "burst")),
        ];
        let winner = select_winner(results).unwrap();
        assert_eq!(winner.path, "standard");
    }

    #[test]
    fn test_winner_falls_back_to_lowest_status() {
        let results = vec![
            Ok(record(503, 10, "standard")),
            Ok(record(429, 20, "delayed")),
            Err(DispatchError::Timeout),
        ];
        let winner = select_winner(results).unwrap();
        assert_eq!(winner.status, 429);
    }

    #[test]
    fn test_winner_surfaces_error_when_all_paths_fail() {
        let results = vec![
            Err(DispatchError::Timeout),
            Err(DispatchError::Network("refused".into())),
        ];
        assert_eq!(select_winner(results).unwrap_err(), DispatchError::Timeout);
    }

    #[tokio::test]
    async fn test_single_dispatch_builds_record() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/claim");
                then.status(200).body(r#"{"code":0}"#);
            })
            .await;

        let dispatcher = HttpDispatcher::new(Arc::new(SignerRegistry::new()), "test-agent");
        let task = make_task(&server.url("/claim"), 1);
        let response = dispatcher.dispatch(&task, 1).await.unwrap();

        mock.assert_async().await;
        assert_eq!(response.status, 200);
        assert_eq!(response.path, "standard");
        assert!(response.body.contains("\"code\":0"));
        assert!(response.duration_ms > 0.0);
    }

    #[tokio::test]
    async fn test_timeout_surfaces_dispatch_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/slow");
                then.status(200).delay(Duration::from_millis(500));
            })
            .await;

        let dispatcher = HttpDispatcher::new(Arc::new(SignerRegistry::new()), "test-agent");
        let mut task = make_task(&server.url("/slow"), 1);
        task.policy.timeout_ms = 50;

        let err = dispatcher.dispatch(&task, 1).await.unwrap_err();
        assert_eq!(err, DispatchError::Timeout);
    }

    #[tokio::test]
    async fn test_hedged_dispatch_races_multiple_paths() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/hedge");
                then.status(200).body("ok");
            })
            .await;

        let dispatcher = HttpDispatcher::new(Arc::new(SignerRegistry::new()), "test-agent");
        let task = make_task(&server.url("/hedge"), 3);
        let response = dispatcher.dispatch(&task, 1).await.unwrap();

        assert!(response.is_success());
        // standard + delayed + 3-send burst
        assert!(mock.hits_async().await >= 3);
    }

    #[tokio::test]
    async fn test_unsupported_method_aborts() {
        let dispatcher = HttpDispatcher::new(Arc::new(SignerRegistry::new()), "test-agent");
        let mut task = make_task("http://localhost:1/x", 1);
        task.request.method = "NOT A METHOD".into();
        match dispatcher.dispatch(&task, 1).await {
            Err(DispatchError::Aborted(msg)) => assert!(msg.contains("method")),
            other => panic!("expected abort, got {other:?}"),
        }
    }
}
