//! Retry and crash policies for the supervision loop.
//!
//! [`BackoffPolicy`] spaces out failed launch attempts; [`CrashTracker`] counts
//! consecutive crashes and decides whether the watchdog restarts the worker or
//! gives up in `Offline`. Both are configuration inputs rather than constants.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::duration_ms;
use crate::types::status::WatchdogStatus;

/// Retry backoff policy.
///
/// The delay for attempt `n` (0-indexed) is `first × factor^n`, clamped to `max`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffPolicy {
    /// Initial delay before the first retry.
    #[serde(with = "duration_ms", rename = "firstMs")]
    pub first: Duration,
    /// Maximum delay cap for retries.
    #[serde(with = "duration_ms", rename = "maxMs")]
    pub max: Duration,
    /// Multiplicative growth factor (`>= 1.0` recommended).
    pub factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            first: Duration::from_secs(1),
            max: Duration::from_secs(30),
            factor: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Computes the delay for the given attempt number (0-indexed).
    pub fn next(&self, attempt: u32) -> Duration {
        let max_secs = self.max.as_secs_f64();
        let clamped_exp = attempt.min(i32::MAX as u32) as i32;
        let unclamped_secs = self.first.as_secs_f64() * self.factor.powi(clamped_exp);

        if !unclamped_secs.is_finite() || unclamped_secs < 0.0 || unclamped_secs > max_secs {
            self.max
        } else {
            Duration::from_secs_f64(unclamped_secs)
        }
    }
}

/// Counts consecutive crashes of the supervised worker.
///
/// A crash after the worker stayed up for at least `stable_uptime` starts a
/// new streak instead of extending the current one.
#[derive(Debug, Clone)]
pub struct CrashTracker {
    max_consecutive: u32,
    stable_uptime: Duration,
    consecutive: u32,
}

impl CrashTracker {
    /// Create a tracker that gives up after `max_consecutive` crashes in a row
    #[must_use]
    pub fn new(max_consecutive: u32, stable_uptime: Duration) -> Self {
        Self {
            max_consecutive,
            stable_uptime,
            consecutive: 0,
        }
    }

    /// Record a crash of a session that had been up for `uptime`.
    ///
    /// Returns the status the watchdog moves to once the dead process is torn
    /// down: `Starting` to relaunch, `Offline` when the ceiling is exceeded.
    pub fn record_crash(&mut self, uptime: Duration) -> WatchdogStatus {
        if uptime >= self.stable_uptime {
            self.consecutive = 0;
        }
        self.consecutive = self.consecutive.saturating_add(1);

        if self.consecutive > self.max_consecutive {
            WatchdogStatus::Offline
        } else {
            WatchdogStatus::Starting
        }
    }

    /// Forget the current streak (deliberate restart or fresh launch)
    pub fn reset(&mut self) {
        self.consecutive = 0;
    }

    /// Crashes in the current streak
    #[must_use]
    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}
