//! Precision wait: coarse sleep, then a high-resolution poll.
//!
//! A single long `tokio::time::sleep` can overshoot by several milliseconds
//! under timer coalescing, which is fatal when a coupon pool empties in the
//! first tens of milliseconds. The wait therefore sleeps coarsely to within
//! a one-second window of the target and polls a monotonic clock for the
//! remainder.

use std::time::{Duration, Instant};

use crate::sync::Clock;

/// Width of the fine-grained polling window.
const FINE_WINDOW_MS: i64 = 1000;

impl Clock {
    /// Milliseconds until the fire instant for `target_ms` (reference-clock
    /// epoch millis), after subtracting the advance offset and the average
    /// one-way network delay. Negative when the instant has passed.
    pub fn remaining_ms(&self, target_ms: i64, advance_ms: u64) -> i64 {
        let delay = self.delay_estimate().avg.round() as i64;
        target_ms - self.synced_now() - advance_ms as i64 - delay
    }

    /// Suspend until `target_ms − advance_ms − avg_delay` in reference-clock
    /// terms. Returns immediately when that instant has already passed.
    pub async fn precision_wait(&self, target_ms: i64, advance_ms: u64) {
        let remaining = self.remaining_ms(target_ms, advance_ms);
        if remaining <= 0 {
            return;
        }

        // Coarse phase: sleep until the fine window opens.
        if remaining > FINE_WINDOW_MS {
            tokio::time::sleep(Duration::from_millis((remaining - FINE_WINDOW_MS) as u64)).await;
        }

        // Recompute — the offset may have been refreshed while sleeping.
        let remaining = self.remaining_ms(target_ms, advance_ms);
        if remaining <= 0 {
            return;
        }

        // Fine phase: poll against a monotonic deadline.
        let deadline = Instant::now() + Duration::from_millis(remaining as u64);
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            if left > Duration::from_millis(2) {
                tokio::time::sleep(Duration::from_millis(1)).await;
            } else {
                tokio::task::yield_now().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_past_target_returns_immediately() {
        let clock = Clock::new();
        let target = Utc::now().timestamp_millis() - 5_000;
        let started = Instant::now();
        clock.precision_wait(target, 500).await;
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_wait_fires_near_target_minus_advance() {
        let clock = Clock::new();
        let advance: u64 = 100;
        let wait_ms: i64 = 400;
        let target = Utc::now().timestamp_millis() + wait_ms + advance as i64;

        let started = Instant::now();
        clock.precision_wait(target, advance).await;
        let elapsed = started.elapsed().as_millis() as i64;

        // Fire within ±50ms of target − advance.
        assert!(
            (elapsed - wait_ms).abs() <= 50,
            "waited {elapsed}ms, expected ~{wait_ms}ms"
        );
    }

    #[tokio::test]
    async fn test_remaining_accounts_for_advance_and_delay() {
        let clock = Clock::new();
        clock.force_state(0.0, &[20.0]);
        let target = Utc::now().timestamp_millis() + 1_000;
        let remaining = clock.remaining_ms(target, 500);
        // 1000 − 500 advance − 20 delay, give or take scheduling jitter.
        assert!((remaining - 480).abs() <= 20, "remaining {remaining}");
    }
}
