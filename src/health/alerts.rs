//! Threshold alerts and the remediation they map to

use super::metrics::HealthMetrics;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Conditions the monitor watches for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCondition {
    LowPoolSize,
    NoFreshCredentials,
    LowSuccessRate,
    HighErrorRate,
    LowReplenishmentRate,
    CriticalHealth,
}

impl AlertCondition {
    pub const ALL: [AlertCondition; 6] = [
        Self::LowPoolSize,
        Self::NoFreshCredentials,
        Self::LowSuccessRate,
        Self::HighErrorRate,
        Self::LowReplenishmentRate,
        Self::CriticalHealth,
    ];

    pub fn is_met(&self, m: &HealthMetrics) -> bool {
        match self {
            Self::LowPoolSize => m.pool_size < 3,
            Self::NoFreshCredentials => m.fresh_count == 0,
            Self::LowSuccessRate => m.recent_success_rate < 0.5,
            Self::HighErrorRate => m.error_rate > 0.3,
            Self::LowReplenishmentRate => m.replenishment_rate > 0.0 && m.replenishment_rate < 0.3,
            Self::CriticalHealth => m.health_score() < 20.0,
        }
    }

    pub fn severity(&self) -> AlertSeverity {
        match self {
            Self::LowPoolSize | Self::LowSuccessRate | Self::LowReplenishmentRate => {
                AlertSeverity::Warning
            }
            Self::NoFreshCredentials | Self::HighErrorRate => AlertSeverity::Error,
            Self::CriticalHealth => AlertSeverity::Critical,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::LowPoolSize => "credential pool is running low",
            Self::NoFreshCredentials => "no fresh credentials left in the pool",
            Self::LowSuccessRate => "recent request success rate is low",
            Self::HighErrorRate => "request error rate is high",
            Self::LowReplenishmentRate => "credential replenishment keeps failing",
            Self::CriticalHealth => "overall health is critical",
        }
    }
}

/// Remediation the monitor can take on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Drop credentials past their TTL
    SweepExpired,
    /// Ask the credential source for new bundles
    RequestCredentials,
    /// Nothing safe to automate; the alert is the outcome
    NoAction,
}

/// Matches metrics to remediation, in execution order and without repeats
///
/// Recovery thresholds are stricter than the alert thresholds for error and
/// success rates.
pub fn plan_recovery(m: &HealthMetrics) -> Vec<RecoveryAction> {
    let mut actions = Vec::new();
    let mut push = |action| {
        if !actions.contains(&action) {
            actions.push(action);
        }
    };

    if m.pool_size < 3 {
        push(RecoveryAction::SweepExpired);
        push(RecoveryAction::RequestCredentials);
    }
    if m.fresh_count == 0 {
        push(RecoveryAction::RequestCredentials);
    }
    if m.error_rate > 0.5 || m.recent_success_rate < 0.3 {
        push(RecoveryAction::NoAction);
    }

    actions
}

/// An alert that fired
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub condition: AlertCondition,
    pub severity: AlertSeverity,
    pub message: String,
    pub raised_at: DateTime<Utc>,
    pub health_score: f64,
}

struct AlertRule {
    condition: AlertCondition,
    last_triggered: Option<Instant>,
}

/// Evaluates every rule, suppressing repeats within the cooldown
pub struct AlertEngine {
    rules: Vec<AlertRule>,
    cooldown: Duration,
}

impl AlertEngine {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            rules: AlertCondition::ALL
                .iter()
                .map(|&condition| AlertRule {
                    condition,
                    last_triggered: None,
                })
                .collect(),
            cooldown,
        }
    }

    pub fn evaluate(&mut self, metrics: &HealthMetrics) -> Vec<Alert> {
        self.evaluate_at(metrics, Instant::now())
    }

    /// `evaluate` with an explicit clock
    pub fn evaluate_at(&mut self, metrics: &HealthMetrics, now: Instant) -> Vec<Alert> {
        let score = metrics.health_score();
        let mut fired = Vec::new();

        for rule in &mut self.rules {
            if !rule.condition.is_met(metrics) {
                continue;
            }
            let cooling = rule
                .last_triggered
                .is_some_and(|last| now.saturating_duration_since(last) < self.cooldown);
            if cooling {
                continue;
            }

            rule.last_triggered = Some(now);
            let alert = Alert {
                condition: rule.condition,
                severity: rule.condition.severity(),
                message: rule.condition.message().to_string(),
                raised_at: metrics.timestamp,
                health_score: score,
            };
            log_alert(&alert);
            fired.push(alert);
        }

        fired
    }
}

fn log_alert(alert: &Alert) {
    match alert.severity {
        AlertSeverity::Info => {
            tracing::info!(condition = ?alert.condition, score = alert.health_score, "{}", alert.message)
        }
        AlertSeverity::Warning => {
            tracing::warn!(condition = ?alert.condition, score = alert.health_score, "{}", alert.message)
        }
        AlertSeverity::Error | AlertSeverity::Critical => {
            tracing::error!(
                condition = ?alert.condition,
                severity = ?alert.severity,
                score = alert.health_score,
                "{}",
                alert.message
            )
        }
    }
}
