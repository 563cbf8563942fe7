//! Rotating pool of credential bundles
//!
//! The pool is the only owner of credential state. Callers receive snapshots
//! from `acquire` and feed outcomes back through `report`; selection and
//! scoring both happen under one internal lock.

use crate::config::CredentialConfig;
use crate::credentials::record::{CredentialBundle, CredentialId, CredentialRecord};
use crate::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Notify};

/// Thresholds governing capacity, expiry and eviction
#[derive(Debug, Clone, PartialEq)]
pub struct PoolSettings {
    pub ttl: ChronoDuration,
    pub max_size: usize,
    pub min_uses_for_eviction: u32,
    pub max_failure_rate: f64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        PoolSettings::from(&CredentialConfig::default())
    }
}

impl From<&CredentialConfig> for PoolSettings {
    fn from(config: &CredentialConfig) -> Self {
        Self {
            ttl: ChronoDuration::seconds(config.credential_ttl_secs as i64),
            max_size: config.pool_max_size,
            min_uses_for_eviction: config.min_uses_for_eviction,
            max_failure_rate: config.max_failure_rate,
        }
    }
}

/// Snapshot of the pool for health scoring and reporting
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub active: usize,
    /// Active and younger than the TTL
    pub fresh: usize,
    /// Mean success rate over records that have been used; 0.0 when none have
    pub avg_success_rate: f64,
    pub oldest_age_secs: Option<i64>,
    pub newest_age_secs: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ExportedCredential {
    bundle: CredentialBundle,
    created_at: DateTime<Utc>,
}

struct PoolInner {
    records: Vec<CredentialRecord>,
    next_id: CredentialId,
}

/// Credential pool with health-scored selection
pub struct CredentialPool {
    settings: PoolSettings,
    inner: Mutex<PoolInner>,
    replenish: Notify,
    generation: watch::Sender<u64>,
}

impl CredentialPool {
    pub fn new(settings: PoolSettings) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            settings,
            inner: Mutex::new(PoolInner {
                records: Vec::new(),
                next_id: 1,
            }),
            replenish: Notify::new(),
            generation,
        }
    }

    pub fn from_config(config: &CredentialConfig) -> Self {
        Self::new(PoolSettings::from(config))
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a bundle; returns false if an identical bundle is already pooled
    pub fn add(&self, bundle: CredentialBundle) -> bool {
        self.add_at(bundle, Utc::now())
    }

    /// `add` with an explicit creation time
    pub fn add_at(&self, bundle: CredentialBundle, created_at: DateTime<Utc>) -> bool {
        let fingerprint = bundle.fingerprint();
        let mut inner = self.lock();

        if inner
            .records
            .iter()
            .any(|r| r.bundle.fingerprint() == fingerprint)
        {
            tracing::debug!("Credential bundle already pooled, skipping");
            return false;
        }

        if inner.records.len() >= self.settings.max_size {
            if let Some(oldest) = inner
                .records
                .iter()
                .enumerate()
                .min_by_key(|(_, r)| r.created_at)
                .map(|(idx, _)| idx)
            {
                let evicted = inner.records.remove(oldest);
                tracing::debug!(id = evicted.id, "Pool at capacity, evicted oldest credential");
            }
        }

        let id = inner.next_id;
        inner.next_id += 1;
        inner
            .records
            .push(CredentialRecord::new(id, bundle, created_at));
        let size = inner.records.len();
        drop(inner);

        self.generation.send_modify(|g| *g += 1);
        tracing::info!(id, pool_size = size, "Credential added to pool");
        true
    }

    /// Returns the best usable credential not in `exclude`
    ///
    /// Ranked by success rate, then by recency. Never blocks; an empty result
    /// raises the replenishment signal.
    pub fn acquire(&self, exclude: &[CredentialId]) -> Option<CredentialRecord> {
        self.acquire_at(exclude, Utc::now())
    }

    pub fn acquire_at(
        &self,
        exclude: &[CredentialId],
        now: DateTime<Utc>,
    ) -> Option<CredentialRecord> {
        let best = {
            let inner = self.lock();
            inner
                .records
                .iter()
                .filter(|r| r.is_usable(now, self.settings.ttl) && !exclude.contains(&r.id))
                .max_by(|a, b| {
                    a.success_rate()
                        .partial_cmp(&b.success_rate())
                        .unwrap_or(Ordering::Equal)
                        .then_with(|| a.created_at.cmp(&b.created_at))
                })
                .cloned()
        };

        if best.is_none() {
            tracing::warn!(excluded = exclude.len(), "No usable credential in pool");
            self.request_replenishment();
        }
        best
    }

    /// Records the outcome of a request made with credential `id`
    ///
    /// Returns whether the credential is still active. Unknown IDs (already
    /// swept or evicted) are ignored.
    pub fn report(&self, id: CredentialId, success: bool) -> bool {
        self.report_at(id, success, Utc::now())
    }

    pub fn report_at(&self, id: CredentialId, success: bool, now: DateTime<Utc>) -> bool {
        let mut inner = self.lock();
        let Some(record) = inner.records.iter_mut().find(|r| r.id == id) else {
            tracing::debug!(id, "Report for unknown credential ignored");
            return false;
        };

        record.record_use(success, now);

        let deactivate = record.active
            && record.use_count >= self.settings.min_uses_for_eviction
            && record.failure_rate() >= self.settings.max_failure_rate;

        if deactivate {
            record.active = false;
            tracing::warn!(
                id,
                uses = record.use_count,
                failures = record.failure_count,
                "Credential failure rate too high, deactivated"
            );
        }
        let active = record.active;
        drop(inner);

        if deactivate {
            self.request_replenishment();
        }
        active
    }

    /// Removes records older than the TTL; returns how many were removed
    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now())
    }

    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let mut inner = self.lock();
        let before = inner.records.len();
        inner
            .records
            .retain(|r| r.is_fresh(now, self.settings.ttl));
        let removed = before - inner.records.len();

        if removed > 0 {
            tracing::info!(removed, remaining = inner.records.len(), "Swept expired credentials");
        }
        removed
    }

    pub fn stats(&self) -> PoolStats {
        self.stats_at(Utc::now())
    }

    pub fn stats_at(&self, now: DateTime<Utc>) -> PoolStats {
        let inner = self.lock();
        let records = &inner.records;

        let used: Vec<f64> = records
            .iter()
            .filter(|r| r.use_count > 0)
            .map(|r| r.success_rate())
            .collect();
        let avg_success_rate = if used.is_empty() {
            0.0
        } else {
            used.iter().sum::<f64>() / used.len() as f64
        };

        PoolStats {
            total: records.len(),
            active: records.iter().filter(|r| r.active).count(),
            fresh: records
                .iter()
                .filter(|r| r.is_usable(now, self.settings.ttl))
                .count(),
            avg_success_rate,
            oldest_age_secs: records
                .iter()
                .map(|r| r.age(now).num_seconds())
                .max(),
            newest_age_secs: records
                .iter()
                .map(|r| r.age(now).num_seconds())
                .min(),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raises the replenishment signal observed by the health monitor
    pub fn request_replenishment(&self) {
        self.replenish.notify_one();
    }

    /// Resolves once replenishment has been requested
    ///
    /// A request raised while nobody is waiting is kept until the next call.
    pub async fn replenishment_requested(&self) {
        self.replenish.notified().await;
    }

    /// Waits up to `timeout` for a usable credential outside `exclude`
    ///
    /// Returns as soon as one is available, including immediately.
    pub async fn wait_for_credentials(
        &self,
        exclude: &[CredentialId],
        timeout: Duration,
    ) -> Option<CredentialRecord> {
        let mut added = self.generation.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(record) = self.acquire(exclude) {
                return Some(record);
            }
            match tokio::time::timeout_at(deadline, added.changed()).await {
                Ok(Ok(())) => continue,
                _ => return None,
            }
        }
    }

    /// Writes every fresh bundle to `path` as JSON; returns how many were written
    pub fn export_json(&self, path: &Path) -> Result<usize> {
        let now = Utc::now();
        let exported: Vec<ExportedCredential> = self
            .lock()
            .records
            .iter()
            .filter(|r| r.is_usable(now, self.settings.ttl))
            .map(|r| ExportedCredential {
                bundle: r.bundle.clone(),
                created_at: r.created_at,
            })
            .collect();

        std::fs::write(path, serde_json::to_string_pretty(&exported)?)?;
        tracing::info!(count = exported.len(), path = %path.display(), "Exported credentials");
        Ok(exported.len())
    }

    /// Loads bundles written by `export_json`, skipping expired ones
    ///
    /// Returns the number of bundles added.
    pub fn import_json(&self, path: &Path) -> Result<usize> {
        let now = Utc::now();

        let added = read_credential_file(path)?
            .into_iter()
            .filter(|(_, created_at)| now - *created_at < self.settings.ttl)
            .filter(|(bundle, created_at)| self.add_at(bundle.clone(), *created_at))
            .count();

        tracing::info!(added, path = %path.display(), "Imported credentials");
        Ok(added)
    }
}

/// Reads a credential file in the `export_json` format
///
/// Returns each bundle with its original creation time.
pub fn read_credential_file(path: &Path) -> Result<Vec<(CredentialBundle, DateTime<Utc>)>> {
    let content = std::fs::read_to_string(path)?;
    let imported: Vec<ExportedCredential> = serde_json::from_str(&content)?;
    Ok(imported
        .into_iter()
        .map(|c| (c.bundle, c.created_at))
        .collect())
}
