//! Clock offset estimation against an external reference.
//!
//! `offset = (remote_time + rtt/2) − local_time_at_request_start`. A failed
//! sync never disturbs the previous offset (stale-but-available) and never
//! surfaces an error to callers.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::source::TimeSource;

/// Delay samples kept for the rolling average.
const MAX_DELAY_SAMPLES: usize = 10;

/// Process-wide clock state. Lazily refreshed, never persisted.
#[derive(Debug, Default)]
pub(crate) struct ClockState {
    /// Estimated (reference − local) in milliseconds. 0 until the first
    /// successful sync.
    pub offset_ms: f64,
    pub last_sync_at: Option<DateTime<Utc>>,
    /// One-way delay samples, newest last.
    pub delay_samples: VecDeque<f64>,
}

impl ClockState {
    fn push_delay(&mut self, delay_ms: f64) {
        if self.delay_samples.len() >= MAX_DELAY_SAMPLES {
            self.delay_samples.pop_front();
        }
        self.delay_samples.push_back(delay_ms);
    }
}

/// Aggregated one-way network delay estimate.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct DelayStats {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub count: usize,
}

impl DelayStats {
    pub const ZERO: DelayStats = DelayStats { avg: 0.0, min: 0.0, max: 0.0, count: 0 };
}

/// Sync health report.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SyncStatus {
    pub offset_ms: f64,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub delay: DelayStats,
    /// False when no sync succeeded within the given freshness window.
    pub recent: bool,
}

/// Reference-clock tracker.
pub struct Clock {
    client: reqwest::Client,
    state: Mutex<ClockState>,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            state: Mutex::new(ClockState::default()),
        }
    }

    /// Current time in reference-clock terms, epoch milliseconds.
    pub fn synced_now(&self) -> i64 {
        let offset = self.state.lock().unwrap().offset_ms;
        Utc::now().timestamp_millis() + offset.round() as i64
    }

    /// Current clock offset in milliseconds.
    pub fn offset_ms(&self) -> f64 {
        self.state.lock().unwrap().offset_ms
    }

    /// Sync against a reference source. Returns false on any failure
    /// (network, non-2xx, unparsable payload) and leaves prior state intact.
    pub async fn sync(&self, source: &TimeSource) -> bool {
        let local_at_start = Utc::now().timestamp_millis();
        let started = Instant::now();

        let response = match self
            .client
            .get(&source.url)
            .header("Cache-Control", "no-cache")
            .header("Pragma", "no-cache")
            .timeout(Duration::from_secs(10))
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("⚠️ Time sync request to {} failed: {e}", source.name);
                return false;
            }
        };

        let rtt_ms = started.elapsed().as_secs_f64() * 1000.0;

        if !response.status().is_success() {
            tracing::warn!("⚠️ Time sync with {} returned {}", source.name, response.status());
            return false;
        }

        let payload: serde_json::Value = match response.json().await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("⚠️ Time sync payload from {} unreadable: {e}", source.name);
                return false;
            }
        };

        let Some(remote_ms) = source.shape.extract(&payload) else {
            tracing::warn!("⚠️ Time sync payload from {} had no timestamp", source.name);
            return false;
        };

        let one_way_ms = rtt_ms / 2.0;
        let offset_ms = (remote_ms as f64 + one_way_ms) - local_at_start as f64;

        let mut state = self.state.lock().unwrap();
        state.offset_ms = offset_ms;
        state.last_sync_at = Some(Utc::now());
        state.push_delay(one_way_ms);

        tracing::info!(
            "🕐 Synced with {}: offset {:+.1}ms, one-way delay {:.1}ms",
            source.name,
            offset_ms,
            one_way_ms
        );
        true
    }

    /// Rolling one-way delay estimate. All-zero before the first sync.
    pub fn delay_estimate(&self) -> DelayStats {
        let state = self.state.lock().unwrap();
        if state.delay_samples.is_empty() {
            return DelayStats::ZERO;
        }
        let sum: f64 = state.delay_samples.iter().sum();
        let min = state.delay_samples.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = state.delay_samples.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        DelayStats {
            avg: sum / state.delay_samples.len() as f64,
            min,
            max,
            count: state.delay_samples.len(),
        }
    }

    /// Health report; `recent` is false when the last successful sync is
    /// older than `freshness`.
    pub fn status(&self, freshness: Duration) -> SyncStatus {
        let delay = self.delay_estimate();
        let state = self.state.lock().unwrap();
        let recent = state
            .last_sync_at
            .map(|at| (Utc::now() - at).num_milliseconds() < freshness.as_millis() as i64)
            .unwrap_or(false);
        SyncStatus {
            offset_ms: state.offset_ms,
            last_sync_at: state.last_sync_at,
            delay,
            recent,
        }
    }

    #[cfg(test)]
    pub(crate) fn force_state(&self, offset_ms: f64, delays: &[f64]) {
        let mut state = self.state.lock().unwrap();
        state.offset_ms = offset_ms;
        state.last_sync_at = Some(Utc::now());
        state.delay_samples = delays.iter().copied().collect();
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::TimeShape;
    use httpmock::prelude::*;

    #[tokio::test]
    async fn test_sync_sets_offset_within_rtt_tolerance() {
        let server = MockServer::start_async().await;
        let remote: i64 = 1_700_000_000_000;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/time");
                then.status(200).json_body(serde_json::json!({"data": remote}));
            })
            .await;

        let clock = Clock::new();
        let source = TimeSource::new("test", &server.url("/time"), TimeShape::Probe);

        let before = Utc::now().timestamp_millis();
        assert!(clock.sync(&source).await);
        let after = Utc::now().timestamp_millis();

        // offset ≈ remote − local, within the full round trip.
        let offset = clock.offset_ms();
        let expected_low = (remote - after) as f64 - 1.0;
        let expected_high = (remote - before) as f64 + (after - before) as f64 + 1.0;
        assert!(offset >= expected_low && offset <= expected_high, "offset {offset} out of range");

        // synced_now lands near the remote epoch.
        let now = clock.synced_now();
        assert!((now - remote).abs() < 5_000, "synced_now {now} too far from {remote}");

        let delay = clock.delay_estimate();
        assert_eq!(delay.count, 1);
        assert!(delay.avg >= 0.0);
    }

    #[tokio::test]
    async fn test_failed_sync_keeps_previous_offset() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/time");
                then.status(503);
            })
            .await;

        let clock = Clock::new();
        clock.force_state(1234.5, &[10.0]);

        let source = TimeSource::new("broken", &server.url("/time"), TimeShape::Probe);
        assert!(!clock.sync(&source).await);
        assert_eq!(clock.offset_ms(), 1234.5);
        assert_eq!(clock.delay_estimate().count, 1);
    }

    #[tokio::test]
    async fn test_malformed_payload_returns_false() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/time");
                then.status(200).body("this is not json");
            })
            .await;

        let clock = Clock::new();
        let source = TimeSource::new("garbled", &server.url("/time"), TimeShape::Probe);
        assert!(!clock.sync(&source).await);
        assert_eq!(clock.offset_ms(), 0.0);
    }

    #[test]
    fn test_unsynced_clock_degrades_to_local() {
        let clock = Clock::new();
        let local = Utc::now().timestamp_millis();
        assert!((clock.synced_now() - local).abs() < 100);
        assert_eq!(clock.delay_estimate(), DelayStats::ZERO);
    }

    #[test]
    fn test_delay_ring_buffer_caps_at_ten() {
        let clock = Clock::new();
        let samples: Vec<f64> = (0..9).map(|i| i as f64).collect();
        clock.force_state(0.0, &samples);
        {
            let mut state = clock.state.lock().unwrap();
            state.push_delay(100.0);
            state.push_delay(200.0);
        }
        let stats = clock.delay_estimate();
        assert_eq!(stats.count, 10);
        // Oldest sample (0.0) dropped.
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 200.0);
    }

    #[test]
    fn test_status_staleness() {
        let clock = Clock::new();
        let status = clock.status(Duration::from_secs(60));
        assert!(!status.recent);
        clock.force_state(5.0, &[2.0]);
        let status = clock.status(Duration::from_secs(60));
        assert!(status.recent);
        assert_eq!(status.offset_ms, 5.0);
    }
}
