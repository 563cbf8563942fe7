//! Health metrics and the composite score

use crate::credentials::PoolStats;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Active credentials needed for the full pool-size score
pub const TARGET_POOL_SIZE: usize = 10;

/// Fresh credentials needed for the full freshness score
pub const TARGET_FRESH: usize = 5;

/// Overall status band
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Excellent,
    Good,
    Fair,
    Poor,
    Critical,
}

impl HealthLevel {
    pub fn from_score(score: f64) -> Self {
        if score >= 80.0 {
            Self::Excellent
        } else if score >= 60.0 {
            Self::Good
        } else if score >= 40.0 {
            Self::Fair
        } else if score >= 20.0 {
            Self::Poor
        } else {
            Self::Critical
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Poor => "poor",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for HealthLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One sample of system health
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthMetrics {
    pub timestamp: DateTime<Utc>,
    /// Active credentials
    pub pool_size: usize,
    pub fresh_count: usize,
    pub avg_success_rate: f64,
    /// Success rate over the rolling request window
    pub recent_success_rate: f64,
    pub replenishment_rate: f64,
    /// Lifetime share of failed requests
    pub error_rate: f64,
}

impl HealthMetrics {
    /// Combines pool statistics with request outcomes
    pub fn sample(pool: &PoolStats, requests: &RequestStats, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            pool_size: pool.active,
            fresh_count: pool.fresh,
            avg_success_rate: pool.avg_success_rate,
            recent_success_rate: requests.recent_success_rate,
            replenishment_rate: requests.replenishment_rate,
            error_rate: requests.error_rate,
        }
    }

    /// Weighted composite in `[0, 100]`
    ///
    /// Weights: pool size 20, freshness 15, average success 25, recent
    /// success 20, replenishment 10, error rate 10.
    pub fn health_score(&self) -> f64 {
        let ratio = |n: usize, target: usize| (n as f64 / target as f64).min(1.0);

        let score = ratio(self.pool_size, TARGET_POOL_SIZE) * 20.0
            + ratio(self.fresh_count, TARGET_FRESH) * 15.0
            + self.avg_success_rate.clamp(0.0, 1.0) * 25.0
            + self.recent_success_rate.clamp(0.0, 1.0) * 20.0
            + self.replenishment_rate.clamp(0.0, 1.0) * 10.0
            + (1.0 - self.error_rate).clamp(0.0, 1.0) * 10.0;

        score.clamp(0.0, 100.0)
    }

    pub fn level(&self) -> HealthLevel {
        HealthLevel::from_score(self.health_score())
    }
}

/// Request counters as seen by the health monitor
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RequestStats {
    pub total_requests: u64,
    pub failed_requests: u64,
    pub recent_success_rate: f64,
    pub error_rate: f64,
    pub replenish_attempts: u64,
    pub replenish_successes: u64,
    pub replenishment_rate: f64,
}

struct TrackerInner {
    recent: VecDeque<bool>,
    total: u64,
    failed: u64,
    replenish_attempts: u64,
    replenish_successes: u64,
}

/// Records request outcomes for the health monitor
///
/// Shared between workers (which record) and the monitor (which reads).
pub struct RequestTracker {
    window: usize,
    inner: Mutex<TrackerInner>,
}

impl RequestTracker {
    /// Creates a tracker keeping the last `window` outcomes
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            inner: Mutex::new(TrackerInner {
                recent: VecDeque::with_capacity(window.max(1)),
                total: 0,
                failed: 0,
                replenish_attempts: 0,
                replenish_successes: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record(&self, success: bool) {
        let mut inner = self.lock();
        if inner.recent.len() == self.window {
            inner.recent.pop_front();
        }
        inner.recent.push_back(success);
        inner.total += 1;
        if !success {
            inner.failed += 1;
        }
    }

    /// Records whether an attempt to obtain new credentials yielded any
    pub fn record_replenishment(&self, success: bool) {
        let mut inner = self.lock();
        inner.replenish_attempts += 1;
        if success {
            inner.replenish_successes += 1;
        }
    }

    /// Snapshot of all counters
    ///
    /// Rates default to the healthy value when nothing has been recorded.
    pub fn stats(&self) -> RequestStats {
        let inner = self.lock();

        let recent_success_rate = if inner.recent.is_empty() {
            1.0
        } else {
            inner.recent.iter().filter(|ok| **ok).count() as f64 / inner.recent.len() as f64
        };
        let error_rate = if inner.total == 0 {
            0.0
        } else {
            inner.failed as f64 / inner.total as f64
        };
        let replenishment_rate = if inner.replenish_attempts == 0 {
            1.0
        } else {
            inner.replenish_successes as f64 / inner.replenish_attempts as f64
        };

        RequestStats {
            total_requests: inner.total,
            failed_requests: inner.failed,
            recent_success_rate,
            error_rate,
            replenish_attempts: inner.replenish_attempts,
            replenish_successes: inner.replenish_successes,
            replenishment_rate,
        }
    }
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(pool_size: usize, fresh_count: usize, success: f64, error_rate: f64) -> HealthMetrics {
        HealthMetrics {
            timestamp: Utc::now(),
            pool_size,
            fresh_count,
            avg_success_rate: success,
            recent_success_rate: success,
            replenishment_rate: 1.0,
            error_rate,
        }
    }

    #[test]
    fn test_perfect_score() {
        let m = metrics(10, 5, 1.0, 0.0);
        assert!((m.health_score() - 100.0).abs() < 1e-9);
        assert_eq!(m.level(), HealthLevel::Excellent);
    }

    #[test]
    fn test_partial_score() {
        // 5/10 pool -> 10, 0 fresh -> 0, 0.5 success -> 12.5 + 10, replenish 10, error 0.5 -> 5
        let m = metrics(5, 0, 0.5, 0.5);
        assert!((m.health_score() - 47.5).abs() < 1e-9);
        assert_eq!(m.level(), HealthLevel::Fair);
    }

    #[test]
    fn test_level_bands() {
        assert_eq!(HealthLevel::from_score(80.0), HealthLevel::Excellent);
        assert_eq!(HealthLevel::from_score(79.9), HealthLevel::Good);
        assert_eq!(HealthLevel::from_score(60.0), HealthLevel::Good);
        assert_eq!(HealthLevel::from_score(40.0), HealthLevel::Fair);
        assert_eq!(HealthLevel::from_score(20.0), HealthLevel::Poor);
        assert_eq!(HealthLevel::from_score(19.9), HealthLevel::Critical);
    }

    #[test]
    fn test_tracker_rolling_window() {
        let tracker = RequestTracker::new(4);
        for _ in 0..4 {
            tracker.record(false);
        }
        for _ in 0..4 {
            tracker.record(true);
        }

        let stats = tracker.stats();
        assert_eq!(stats.total_requests, 8);
        assert_eq!(stats.failed_requests, 4);
        assert_eq!(stats.recent_success_rate, 1.0);
        assert_eq!(stats.error_rate, 0.5);
    }

    #[test]
    fn test_tracker_defaults_when_empty() {
        let stats = RequestTracker::new(10).stats();
        assert_eq!(stats.recent_success_rate, 1.0);
        assert_eq!(stats.error_rate, 0.0);
        assert_eq!(stats.replenishment_rate, 1.0);
    }

    #[test]
    fn test_replenishment_rate() {
        let tracker = RequestTracker::new(10);
        tracker.record_replenishment(true);
        tracker.record_replenishment(false);
        tracker.record_replenishment(false);
        tracker.record_replenishment(true);
        assert_eq!(tracker.stats().replenishment_rate, 0.5);
    }
}
