//! Health monitor and recovery loop
//!
//! This module handles:
//! - Sampling pool and request metrics into a 0-100 health score
//! - Threshold alerts with per-rule cooldowns
//! - Automated remediation (sweeping, requesting new credentials)
//! - History, trend and a serializable report

mod alerts;
mod metrics;
mod monitor;

pub use alerts::{plan_recovery, Alert, AlertCondition, AlertEngine, AlertSeverity, RecoveryAction};
pub use metrics::{HealthLevel, HealthMetrics, RequestStats, RequestTracker, TARGET_FRESH, TARGET_POOL_SIZE};
pub use monitor::{
    compute_trend, CredentialSource, HealthMonitor, HealthReport, HealthTrend, MonitorHandle,
    TickOutcome,
};
