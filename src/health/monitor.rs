//! Background health loop
//!
//! One task samples metrics on a fixed interval, raises alerts and runs
//! remediation. It also wakes immediately when the credential pool asks for
//! replenishment.

use super::alerts::{plan_recovery, Alert, AlertEngine, RecoveryAction};
use super::metrics::{HealthLevel, HealthMetrics, RequestStats, RequestTracker, TARGET_POOL_SIZE};
use crate::config::HealthConfig;
use crate::credentials::{CredentialBundle, CredentialPool, PoolStats};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Snapshots kept for the trend calculation
const TREND_WINDOW: usize = 5;

/// Score difference that counts as a trend
const TREND_THRESHOLD: f64 = 5.0;

/// Alerts kept for reporting
const RECENT_ALERTS: usize = 20;

/// Where new credential bundles come from
///
/// Typically a browser session that captures fresh auth headers.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn acquire_bundles(&self, wanted: usize) -> Result<Vec<CredentialBundle>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthTrend {
    Improving,
    Declining,
    Stable,
}

/// Serializable snapshot for external reporting
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    pub health_score: f64,
    pub health_level: HealthLevel,
    pub trend: HealthTrend,
    pub metrics: HealthMetrics,
    pub pool: PoolStats,
    pub requests: RequestStats,
    pub recent_alerts: Vec<Alert>,
}

/// What one tick observed and did
#[derive(Debug, Clone)]
pub struct TickOutcome {
    pub metrics: HealthMetrics,
    pub alerts: Vec<Alert>,
    pub actions: Vec<RecoveryAction>,
}

/// Compares the older and newer halves of the last few scores
pub fn compute_trend(scores: &[f64]) -> HealthTrend {
    let recent = &scores[scores.len().saturating_sub(TREND_WINDOW)..];
    if recent.len() < 2 {
        return HealthTrend::Stable;
    }

    let mid = recent.len() / 2;
    let mean = |s: &[f64]| s.iter().sum::<f64>() / s.len() as f64;
    let diff = mean(&recent[mid..]) - mean(&recent[..mid]);

    if diff > TREND_THRESHOLD {
        HealthTrend::Improving
    } else if diff < -TREND_THRESHOLD {
        HealthTrend::Declining
    } else {
        HealthTrend::Stable
    }
}

pub struct HealthMonitor {
    pool: Arc<CredentialPool>,
    tracker: Arc<RequestTracker>,
    source: Option<Arc<dyn CredentialSource>>,
    config: HealthConfig,
    alerts: AlertEngine,
    history: VecDeque<HealthMetrics>,
    recent_alerts: VecDeque<Alert>,
}

impl HealthMonitor {
    /// Creates a monitor over `pool`
    ///
    /// # Arguments
    ///
    /// * `pool` - The credential pool to watch and replenish
    /// * `tracker` - Request outcomes recorded by the workers
    /// * `source` - Where new credentials come from; without one,
    ///   `RequestCredentials` only logs
    /// * `config` - Interval, window sizes and cooldown
    pub fn new(
        pool: Arc<CredentialPool>,
        tracker: Arc<RequestTracker>,
        source: Option<Arc<dyn CredentialSource>>,
        config: HealthConfig,
    ) -> Self {
        let alerts = AlertEngine::new(Duration::from_secs(config.alert_cooldown_secs));
        Self {
            pool,
            tracker,
            source,
            alerts,
            history: VecDeque::with_capacity(config.history_size),
            recent_alerts: VecDeque::with_capacity(RECENT_ALERTS),
            config,
        }
    }

    pub fn collect_metrics(&self) -> HealthMetrics {
        HealthMetrics::sample(&self.pool.stats(), &self.tracker.stats(), Utc::now())
    }

    /// Runs one monitoring cycle
    pub async fn tick(&mut self) -> TickOutcome {
        let metrics = self.collect_metrics();
        self.record(metrics.clone());

        let alerts = self.alerts.evaluate(&metrics);
        for alert in &alerts {
            if self.recent_alerts.len() == RECENT_ALERTS {
                self.recent_alerts.pop_front();
            }
            self.recent_alerts.push_back(alert.clone());
        }

        let actions = if self.config.recovery_enabled {
            plan_recovery(&metrics)
        } else {
            Vec::new()
        };
        for action in &actions {
            self.run_action(*action, &metrics).await;
        }

        tracing::info!(
            score = %format!("{:.1}", metrics.health_score()),
            level = %metrics.level(),
            pool_size = metrics.pool_size,
            fresh = metrics.fresh_count,
            recent_success = %format!("{:.2}", metrics.recent_success_rate),
            "Health check"
        );

        TickOutcome {
            metrics,
            alerts,
            actions,
        }
    }

    fn record(&mut self, metrics: HealthMetrics) {
        if self.history.len() >= self.config.history_size.max(1) {
            self.history.pop_front();
        }
        self.history.push_back(metrics);
    }

    async fn run_action(&self, action: RecoveryAction, metrics: &HealthMetrics) {
        match action {
            RecoveryAction::SweepExpired => {
                let removed = self.pool.sweep();
                tracing::info!(removed, "Recovery: swept expired credentials");
            }
            RecoveryAction::RequestCredentials => {
                let wanted = TARGET_POOL_SIZE.saturating_sub(metrics.pool_size).max(1);
                self.request_credentials(wanted).await;
            }
            RecoveryAction::NoAction => {
                tracing::debug!("Recovery: no automated fix for current condition");
            }
        }
    }

    /// Asks the source for bundles and adds them to the pool
    ///
    /// Returns how many were added.
    pub async fn request_credentials(&self, wanted: usize) -> usize {
        let Some(source) = &self.source else {
            tracing::warn!(wanted, "Credentials needed but no credential source is configured");
            return 0;
        };

        match source.acquire_bundles(wanted).await {
            Ok(bundles) => {
                let added = bundles.into_iter().filter(|b| self.pool.add(b.clone())).count();
                self.tracker.record_replenishment(added > 0);
                tracing::info!(wanted, added, "Recovery: requested new credentials");
                added
            }
            Err(e) => {
                self.tracker.record_replenishment(false);
                tracing::error!(error = %e, "Credential source failed");
                0
            }
        }
    }

    /// Responds to a replenishment request raised by the pool
    async fn replenish(&self) {
        self.pool.sweep();
        let active = self.pool.stats().active;
        self.request_credentials(TARGET_POOL_SIZE.saturating_sub(active).max(1))
            .await;
    }

    pub fn history(&self) -> impl Iterator<Item = &HealthMetrics> {
        self.history.iter()
    }

    pub fn trend(&self) -> HealthTrend {
        let scores: Vec<f64> = self.history.iter().map(HealthMetrics::health_score).collect();
        compute_trend(&scores)
    }

    /// Builds a report from the latest sample, taking one if none exists
    pub fn report(&self) -> HealthReport {
        let metrics = self
            .history
            .back()
            .cloned()
            .unwrap_or_else(|| self.collect_metrics());

        HealthReport {
            generated_at: Utc::now(),
            health_score: metrics.health_score(),
            health_level: metrics.level(),
            trend: self.trend(),
            pool: self.pool.stats(),
            requests: self.tracker.stats(),
            recent_alerts: self.recent_alerts.iter().cloned().collect(),
            metrics,
        }
    }

    /// Starts the background loop
    ///
    /// The loop ends when `shutdown` is called on the handle or the parent
    /// token is cancelled.
    pub fn spawn(mut self, parent: &CancellationToken) -> MonitorHandle {
        let cancel = parent.child_token();
        let token = cancel.clone();
        let period = Duration::from_secs(self.config.health_check_interval_secs.max(1));

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let pool = self.pool.clone();

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        self.tick().await;
                    }
                    _ = pool.replenishment_requested() => {
                        if self.config.recovery_enabled {
                            tracing::info!("Replenishment requested by credential pool");
                            self.replenish().await;
                        }
                    }
                }
            }

            tracing::debug!("Health monitor stopped");
            self.report()
        });

        MonitorHandle { cancel, handle }
    }
}

/// Handle to a running monitor
pub struct MonitorHandle {
    cancel: CancellationToken,
    handle: JoinHandle<HealthReport>,
}

impl MonitorHandle {
    /// Stops the loop and waits for it, returning the final report
    pub async fn shutdown(self) -> Option<HealthReport> {
        self.cancel.cancel();
        match self.handle.await {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::error!(error = %e, "Health monitor task failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::PoolSettings;
    use crate::HarvestError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingSource {
        fn new(fail: bool) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail,
            }
        }
    }

    #[async_trait]
    impl CredentialSource for CountingSource {
        async fn acquire_bundles(&self, wanted: usize) -> Result<Vec<CredentialBundle>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(HarvestError::Browser("session capture failed".to_string()));
            }
            Ok((0..wanted)
                .map(|i| CredentialBundle::new().with_session_id(format!("s-{}-{}", call, i)))
                .collect())
        }
    }

    fn monitor_with(source: Option<Arc<dyn CredentialSource>>) -> HealthMonitor {
        HealthMonitor::new(
            Arc::new(CredentialPool::new(PoolSettings::default())),
            Arc::new(RequestTracker::new(10)),
            source,
            HealthConfig::default(),
        )
    }

    #[test]
    fn test_trend() {
        assert_eq!(compute_trend(&[]), HealthTrend::Stable);
        assert_eq!(compute_trend(&[50.0]), HealthTrend::Stable);
        assert_eq!(compute_trend(&[40.0, 42.0, 60.0, 70.0]), HealthTrend::Improving);
        assert_eq!(compute_trend(&[90.0, 90.0, 60.0, 50.0, 50.0]), HealthTrend::Declining);
        assert_eq!(compute_trend(&[70.0, 72.0, 71.0, 73.0]), HealthTrend::Stable);
        // Only the last five samples count
        assert_eq!(
            compute_trend(&[0.0, 0.0, 0.0, 80.0, 80.0, 80.0, 80.0, 80.0]),
            HealthTrend::Stable
        );
    }

    #[tokio::test]
    async fn test_tick_replenishes_empty_pool() {
        let source = Arc::new(CountingSource::new(false));
        let mut monitor = monitor_with(Some(source.clone()));

        let outcome = monitor.tick().await;
        assert_eq!(outcome.metrics.pool_size, 0);
        assert!(outcome.actions.contains(&RecoveryAction::RequestCredentials));
        assert!(!outcome.alerts.is_empty());

        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(monitor.pool.len(), TARGET_POOL_SIZE);
        assert_eq!(monitor.tracker.stats().replenish_successes, 1);
    }

    #[tokio::test]
    async fn test_recovery_disabled() {
        let source = Arc::new(CountingSource::new(false));
        let mut monitor = HealthMonitor::new(
            Arc::new(CredentialPool::new(PoolSettings::default())),
            Arc::new(RequestTracker::new(10)),
            Some(source.clone()),
            HealthConfig {
                recovery_enabled: false,
                ..HealthConfig::default()
            },
        );

        let outcome = monitor.tick().await;
        assert!(outcome.actions.is_empty());
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failing_source_is_recorded() {
        let monitor = monitor_with(Some(Arc::new(CountingSource::new(true))));
        assert_eq!(monitor.request_credentials(3).await, 0);

        let stats = monitor.tracker.stats();
        assert_eq!(stats.replenish_attempts, 1);
        assert_eq!(stats.replenishment_rate, 0.0);
    }

    #[tokio::test]
    async fn test_report_without_history() {
        let monitor = monitor_with(None);
        let report = monitor.report();
        assert_eq!(report.trend, HealthTrend::Stable);
        assert_eq!(report.pool.total, 0);

        let json = serde_json::to_value(&report).unwrap();
        assert!(json.get("health_level").is_some());
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let mut monitor = HealthMonitor::new(
            Arc::new(CredentialPool::new(PoolSettings::default())),
            Arc::new(RequestTracker::new(10)),
            None,
            HealthConfig {
                history_size: 3,
                ..HealthConfig::default()
            },
        );
        for _ in 0..5 {
            monitor.tick().await;
        }
        assert_eq!(monitor.history().count(), 3);
    }

    #[tokio::test]
    async fn test_spawned_monitor_reacts_to_replenishment_signal() {
        let source = Arc::new(CountingSource::new(false));
        let pool = Arc::new(CredentialPool::new(PoolSettings::default()));
        let monitor = HealthMonitor::new(
            pool.clone(),
            Arc::new(RequestTracker::new(10)),
            Some(source.clone()),
            HealthConfig {
                health_check_interval_secs: 3600,
                ..HealthConfig::default()
            },
        );

        let handle = monitor.spawn(&CancellationToken::new());
        // Let the immediate first tick finish before raising the signal
        tokio::time::sleep(Duration::from_millis(50)).await;
        let calls_after_tick = source.calls.load(Ordering::SeqCst);

        pool.request_replenishment();
        let record = pool
            .wait_for_credentials(&[], Duration::from_secs(2))
            .await;
        assert!(record.is_some());

        let report = handle.shutdown().await.unwrap();
        assert!(report.pool.total > 0);
        assert!(source.calls.load(Ordering::SeqCst) >= calls_after_tick);
    }
}
