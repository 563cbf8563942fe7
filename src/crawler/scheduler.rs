//! Job scheduler for bounding concurrency and pacing requests
//!
//! This module handles:
//! - Global concurrency limiting via a semaphore
//! - Tracking how many jobs are in flight (and the peak)
//! - The randomized pause every worker takes between requests

use crate::config::CrawlerConfig;
use crate::retry::jittered_delay;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct ProbeCounters {
    current: AtomicUsize,
    peak: AtomicUsize,
}

/// Observes in-flight jobs
///
/// Cloning shares the counters.
#[derive(Debug, Clone, Default)]
pub struct ActiveProbe {
    counters: Arc<ProbeCounters>,
}

impl ActiveProbe {
    pub fn new() -> Self {
        Self::default()
    }

    fn enter(&self) -> ActiveGuard {
        let now = self.counters.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(now, Ordering::SeqCst);
        ActiveGuard {
            counters: self.counters.clone(),
        }
    }

    /// Jobs currently holding a permit
    pub fn current(&self) -> usize {
        self.counters.current.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous jobs seen so far
    pub fn peak(&self) -> usize {
        self.counters.peak.load(Ordering::SeqCst)
    }
}

struct ActiveGuard {
    counters: Arc<ProbeCounters>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.counters.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A running job's slot; dropping it frees the slot
pub struct JobPermit {
    _permit: OwnedSemaphorePermit,
    _guard: ActiveGuard,
}

/// Scheduler bounding how many units of work run at once
///
/// The scheduler coordinates:
/// - Global concurrency limits (`max-concurrency` permits)
/// - The jittered delay between consecutive requests of one worker
#[derive(Clone)]
pub struct JobScheduler {
    semaphore: Arc<Semaphore>,
    probe: ActiveProbe,
    delay_min: Duration,
    delay_max: Duration,
}

impl JobScheduler {
    /// Creates a new scheduler
    ///
    /// # Arguments
    ///
    /// * `max_concurrency` - Number of jobs allowed in flight (at least 1)
    /// * `delay_min` - Lower bound of the inter-request pause
    /// * `delay_max` - Upper bound of the inter-request pause
    pub fn new(max_concurrency: usize, delay_min: Duration, delay_max: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrency.max(1))),
            probe: ActiveProbe::new(),
            delay_min,
            delay_max,
        }
    }

    pub fn from_config(config: &CrawlerConfig) -> Self {
        let (min, max) = config.delay_range();
        Self::new(config.max_concurrency as usize, min, max)
    }

    /// Waits for a free slot
    ///
    /// # Returns
    ///
    /// * `Some(JobPermit)` - The slot, held until dropped
    /// * `None` - The scheduler was closed or `cancel` fired while waiting
    pub async fn acquire(&self, cancel: &CancellationToken) -> Option<JobPermit> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            permit = self.semaphore.clone().acquire_owned() => permit.ok()?,
        };

        Some(JobPermit {
            _permit: permit,
            _guard: self.probe.enter(),
        })
    }

    /// Sleeps for a random duration within the configured delay range
    ///
    /// Returns false when cancelled before the pause elapsed.
    pub async fn pause(&self, cancel: &CancellationToken) -> bool {
        let delay = jittered_delay(self.delay_min, self.delay_max);
        if delay.is_zero() {
            return !cancel.is_cancelled();
        }

        tracing::trace!(delay_ms = delay.as_millis() as u64, "Pausing between requests");
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Refuses all future `acquire` calls
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn probe(&self) -> ActiveProbe {
        self.probe.clone()
    }

    /// Free slots right now
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instant_scheduler(max_concurrency: usize) -> JobScheduler {
        JobScheduler::new(max_concurrency, Duration::ZERO, Duration::ZERO)
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_limit() {
        let scheduler = instant_scheduler(3);
        let cancel = CancellationToken::new();
        let probe = scheduler.probe();

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let scheduler = scheduler.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let _permit = scheduler.acquire(&cancel).await.unwrap();
                    tokio::time::sleep(Duration::from_millis(20)).await;
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(probe.peak(), 3);
        assert_eq!(probe.current(), 0);
        assert_eq!(scheduler.available(), 3);
    }

    #[tokio::test]
    async fn test_acquire_returns_none_when_cancelled() {
        let scheduler = instant_scheduler(1);
        let cancel = CancellationToken::new();

        let held = scheduler.acquire(&cancel).await;
        assert!(held.is_some());

        cancel.cancel();
        assert!(scheduler.acquire(&cancel).await.is_none());
    }

    #[tokio::test]
    async fn test_acquire_after_close() {
        let scheduler = instant_scheduler(2);
        scheduler.close();
        assert!(scheduler.acquire(&CancellationToken::new()).await.is_none());
    }

    #[tokio::test]
    async fn test_pause_is_interrupted_by_cancel() {
        let scheduler =
            JobScheduler::new(1, Duration::from_secs(60), Duration::from_secs(120));
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        assert!(!scheduler.pause(&cancel).await);
    }

    #[tokio::test]
    async fn test_zero_delay_pause() {
        let scheduler = instant_scheduler(1);
        assert!(scheduler.pause(&CancellationToken::new()).await);
    }

    #[test]
    fn test_from_config() {
        let config = CrawlerConfig {
            max_concurrency: 5,
            ..CrawlerConfig::default()
        };
        let scheduler = JobScheduler::from_config(&config);
        assert_eq!(scheduler.available(), 5);
    }
}
