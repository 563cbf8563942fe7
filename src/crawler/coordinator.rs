//! Harvest coordinator - main orchestration logic
//!
//! This module drives a task through its two stages, including:
//! - Creating tasks and deciding how to resume them
//! - Walking the search feed for discovery, checkpointing every page
//! - Fanning content collection out over parents under the concurrency bound
//! - Rotating credentials when the remote service rejects one
//! - Routing every failure to a retry, a stage transition or the task record

use crate::config::Config;
use crate::credentials::{CredentialId, CredentialPool, CredentialRecord};
use crate::crawler::browser::{collect_items, BrowserSurface, ScrollPlan};
use crate::crawler::detection::Detection;
use crate::crawler::pagination::{FeedRequest, FeedSource, FetchedPage, PageWalk, PagingState};
use crate::crawler::parser::{embedded_question, parse_child_item, parse_discovery_item, parse_parent};
use crate::crawler::scheduler::{ActiveProbe, JobScheduler};
use crate::health::RequestTracker;
use crate::state::{determine_resume_strategy, ResumeStrategy, Stage, Task};
use crate::storage::{
    lock_storage, DetectionRecord, DiscoveryResult, EntityKind, PendingEntity, Storage,
    StorageResult, TaskProgress, UpsertOutcome,
};
use crate::{ErrorClass, HarvestError, Result};
use chrono::NaiveDate;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Parents loaded per content batch
const PARENT_BATCH: usize = 500;

/// How a run of one task ended
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed,
    /// Stopped on request; the interrupted stage stays resumable
    Cancelled,
    Failed { stage: Stage, error: String },
}

/// Result of running one task
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub task_id: String,
    pub strategy: ResumeStrategy,
    pub outcome: TaskOutcome,
    pub progress: TaskProgress,
}

/// Per-parent result of content collection
#[derive(Debug, Clone, Default)]
struct ParentHarvest {
    inserted: u64,
    updated: u64,
    duplicates: u64,
}

/// Main orchestrator structure
///
/// Cheap to clone: all state is shared.
pub struct Orchestrator<S> {
    config: Arc<Config>,
    storage: Arc<Mutex<S>>,
    pool: Arc<CredentialPool>,
    feed: Arc<dyn FeedSource>,
    tracker: Arc<RequestTracker>,
    scheduler: JobScheduler,
    browser: Option<Arc<dyn BrowserSurface>>,
}

impl<S> Clone for Orchestrator<S> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            storage: self.storage.clone(),
            pool: self.pool.clone(),
            feed: self.feed.clone(),
            tracker: self.tracker.clone(),
            scheduler: self.scheduler.clone(),
            browser: self.browser.clone(),
        }
    }
}

impl<S: Storage + Send + 'static> Orchestrator<S> {
    /// Creates a new orchestrator
    ///
    /// # Arguments
    ///
    /// * `config` - Full harvester configuration
    /// * `storage` - Shared store; locked only for synchronous writes
    /// * `pool` - Credential pool used for every request
    /// * `feed` - Page source (the HTTP API in production)
    pub fn new(
        config: Config,
        storage: Arc<Mutex<S>>,
        pool: Arc<CredentialPool>,
        feed: Arc<dyn FeedSource>,
    ) -> Self {
        let scheduler = JobScheduler::from_config(&config.crawler);
        let tracker = Arc::new(RequestTracker::new(config.health.recent_window));
        Self {
            config: Arc::new(config),
            storage,
            pool,
            feed,
            tracker,
            scheduler,
            browser: None,
        }
    }

    /// Attaches a browser surface used when the API path runs out of credentials
    pub fn with_browser(mut self, browser: Arc<dyn BrowserSurface>) -> Self {
        self.browser = Some(browser);
        self
    }

    /// Shares a request tracker with a health monitor
    pub fn with_tracker(mut self, tracker: Arc<RequestTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn tracker(&self) -> Arc<RequestTracker> {
        self.tracker.clone()
    }

    pub fn probe(&self) -> ActiveProbe {
        self.scheduler.probe()
    }

    /// Creates and persists a new task
    pub fn create_task(
        &self,
        keywords: &str,
        start_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
    ) -> Result<Task> {
        let task = Task::new(keywords, start_date, end_date);
        self.persist(|s| s.insert_task(&task))?;
        tracing::info!(task_id = %task.id, keywords, "Created task");
        Ok(task)
    }

    /// Runs (or resumes) a task until both stages complete, it fails, or
    /// `cancel` fires
    ///
    /// # Returns
    ///
    /// * `Ok(RunSummary)` - How the run ended; stage failures are reported here
    /// * `Err(HarvestError)` - The task does not exist or its state could not be saved
    pub async fn run_task(&self, task_id: &str, cancel: &CancellationToken) -> Result<RunSummary> {
        let mut task = self
            .persist(|s| s.get_task(task_id))?
            .ok_or_else(|| HarvestError::TaskNotFound(task_id.to_string()))?;

        let strategy = determine_resume_strategy(&task);
        tracing::info!(task_id, ?strategy, keywords = %task.keywords, "Running task");

        let outcome = match strategy {
            ResumeStrategy::AlreadyDone => TaskOutcome::Completed,
            ResumeStrategy::ResumeContent => self.run_content(&mut task, cancel).await?,
            ResumeStrategy::StartFresh | ResumeStrategy::ResumeDiscovery => {
                match self.run_discovery(&mut task, cancel).await? {
                    TaskOutcome::Completed => self.run_content(&mut task, cancel).await?,
                    other => other,
                }
            }
        };

        let progress = self.refresh_counters(&mut task).unwrap_or_else(|e| {
            tracing::warn!(task_id, error = %e, "Could not refresh task counters");
            TaskProgress::default()
        });
        match &outcome {
            TaskOutcome::Completed => tracing::info!(
                task_id,
                parents = progress.parents,
                children = progress.children,
                unique_children = progress.unique_children,
                "Task completed"
            ),
            TaskOutcome::Cancelled => tracing::warn!(task_id, "Task cancelled; resumable"),
            TaskOutcome::Failed { stage, error } => {
                tracing::error!(task_id, %stage, error = %error, "Task failed")
            }
        }

        Ok(RunSummary {
            task_id: task_id.to_string(),
            strategy,
            outcome,
            progress,
        })
    }

    /// Runs every task with an unfinished stage, oldest first
    pub async fn resume_interrupted(&self, cancel: &CancellationToken) -> Result<Vec<RunSummary>> {
        let tasks = self.persist(|s| s.list_interrupted_tasks())?;
        tracing::info!(count = tasks.len(), "Resuming interrupted tasks");

        let mut summaries = Vec::with_capacity(tasks.len());
        for task in tasks {
            if cancel.is_cancelled() {
                break;
            }
            summaries.push(self.run_task(&task.id, cancel).await?);
        }
        Ok(summaries)
    }

    /// Creates one task per keyword query and runs them in order
    pub async fn run_batch(
        &self,
        queries: &[String],
        start_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
        cancel: &CancellationToken,
    ) -> Result<Vec<RunSummary>> {
        let mut summaries = Vec::with_capacity(queries.len());
        for keywords in queries {
            if cancel.is_cancelled() {
                break;
            }
            let task = self.create_task(keywords, start_date, end_date)?;
            summaries.push(self.run_task(&task.id, cancel).await?);
        }
        Ok(summaries)
    }

    // ===== Discovery =====

    async fn run_discovery(
        &self,
        task: &mut Task,
        cancel: &CancellationToken,
    ) -> Result<TaskOutcome> {
        task.begin_stage(Stage::Discovery)?;
        self.save_task(task)?;

        let Some(_permit) = self.scheduler.acquire(cancel).await else {
            return Ok(TaskOutcome::Cancelled);
        };

        match self.walk_discovery(task, cancel).await {
            Ok(()) => {
                if let Err(e) = self.refresh_counters(task) {
                    return self.fail(task, Stage::Discovery, e);
                }
                task.complete_stage(Stage::Discovery)?;
                self.save_task(task)?;
                tracing::info!(task_id = %task.id, parents = task.total_parents, "Discovery completed");
                Ok(TaskOutcome::Completed)
            }
            Err(HarvestError::Cancelled) => {
                self.save_task(task)?;
                Ok(TaskOutcome::Cancelled)
            }
            Err(e) => self.fail(task, Stage::Discovery, e),
        }
    }

    async fn walk_discovery(&self, task: &mut Task, cancel: &CancellationToken) -> Result<()> {
        let request = FeedRequest::Search {
            keywords: task.keywords.clone(),
            start_date: task.start_date,
            end_date: task.end_date,
        };
        let crawler = &self.config.crawler;
        let mut walk = PageWalk::new(crawler.max_pages, None);
        let mut state = task.discovery_checkpoint.clone();
        let mut exclude = Vec::new();

        if state.page_index > 0 {
            tracing::info!(
                task_id = %task.id,
                page = state.page_index,
                offset = state.offset,
                "Resuming discovery from checkpoint"
            );
        }
        if state.page_index >= crawler.max_pages {
            return Ok(());
        }

        loop {
            if cancel.is_cancelled() {
                return Err(HarvestError::Cancelled);
            }

            let page = match self
                .fetch_with_rotation(&task.id, &request, &state, &mut exclude, cancel)
                .await
            {
                Ok(page) => page,
                Err(HarvestError::PoolExhausted) if self.browser_fallback_available() => {
                    return self.discover_through_browser(task, cancel).await;
                }
                Err(e) => return Err(e),
            };

            let stored = self.store_discovery_page(&task.id, &page.items)?;
            self.persist(|s| s.save_discovery_checkpoint(&task.id, &page.next))?;
            task.discovery_checkpoint = page.next.clone();

            tracing::info!(
                task_id = %task.id,
                page = page.next.page_index,
                items = page.items.len(),
                new = stored,
                "Discovery page committed"
            );

            if let Some(reason) = walk.advance(&page, page.items.len()) {
                tracing::debug!(task_id = %task.id, ?reason, "Discovery walk finished");
                return Ok(());
            }
            state = page.next;

            if !self.scheduler.pause(cancel).await {
                return Err(HarvestError::Cancelled);
            }
        }
    }

    /// Upserts discovery results and their parents; returns how many were new
    fn store_discovery_page(&self, task_id: &str, items: &[serde_json::Value]) -> Result<usize> {
        let template = &self.config.api.parent_page_url;
        let mut new = 0;

        for item in items {
            let Some(result) = parse_discovery_item(item, task_id, template) else {
                tracing::debug!(task_id, "Skipping search item without a parent");
                continue;
            };
            let parent = parse_parent(&result, None);

            if self.persist(|s| s.upsert_discovery(&result))?.is_new() {
                new += 1;
            }
            self.persist(|s| s.upsert_parent(&parent))?;
        }
        Ok(new)
    }

    fn browser_fallback_available(&self) -> bool {
        self.browser.is_some() && self.config.api.search_page_url.is_some()
    }

    async fn discover_through_browser(
        &self,
        task: &mut Task,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (Some(browser), Some(template)) = (&self.browser, &self.config.api.search_page_url)
        else {
            return Err(HarvestError::PoolExhausted);
        };

        let keywords: String = url::form_urlencoded::byte_serialize(task.keywords.as_bytes()).collect();
        let url = template.replace("{keywords}", &keywords);
        tracing::warn!(task_id = %task.id, url = %url, "Credential pool exhausted, falling back to browser");

        let items = collect_items(browser.as_ref(), &url, ScrollPlan::default(), cancel).await?;
        if cancel.is_cancelled() {
            return Err(HarvestError::Cancelled);
        }
        let stored = self.store_discovery_page(&task.id, &items)?;
        tracing::info!(task_id = %task.id, items = items.len(), new = stored, "Browser discovery committed");
        Ok(())
    }

    // ===== Content =====

    async fn run_content(&self, task: &mut Task, cancel: &CancellationToken) -> Result<TaskOutcome> {
        task.begin_stage(Stage::Content)?;
        self.save_task(task)?;

        let mut first_error: Option<HarvestError> = None;
        let mut cancelled = false;

        loop {
            let pending = match self
                .persist(|s| s.list_unprocessed(EntityKind::Parent, &task.id, PARENT_BATCH))
            {
                Ok(pending) => pending,
                Err(e) => {
                    first_error = Some(e);
                    break;
                }
            };
            if pending.is_empty() {
                break;
            }
            let batch_full = pending.len() == PARENT_BATCH;
            tracing::info!(task_id = %task.id, parents = pending.len(), "Collecting content");

            let handles: Vec<_> = pending
                .into_iter()
                .map(|parent| {
                    let this = self.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        let parent_id = parent.natural_id.clone();
                        let result = match this.scheduler.acquire(&cancel).await {
                            Some(_permit) => this.collect_parent(&parent, &cancel).await,
                            None => Err(HarvestError::Cancelled),
                        };
                        (parent_id, result)
                    })
                })
                .collect();

            for handle in handles {
                match handle.await {
                    Ok((parent_id, Ok(harvest))) => tracing::info!(
                        task_id = %task.id,
                        parent_id = %parent_id,
                        inserted = harvest.inserted,
                        updated = harvest.updated,
                        duplicates = harvest.duplicates,
                        "Parent collected"
                    ),
                    Ok((_, Err(HarvestError::Cancelled))) => cancelled = true,
                    Ok((parent_id, Err(e))) => {
                        tracing::error!(task_id = %task.id, parent_id = %parent_id, error = %e, "Parent failed");
                        first_error.get_or_insert(e);
                    }
                    Err(join_error) => {
                        tracing::error!(task_id = %task.id, error = %join_error, "Content job panicked");
                        first_error.get_or_insert(HarvestError::Io(std::io::Error::new(
                            std::io::ErrorKind::Other,
                            join_error.to_string(),
                        )));
                    }
                }
            }

            if let Err(e) = self.refresh_counters(task) {
                first_error.get_or_insert(e);
            }
            if cancelled || first_error.is_some() || !batch_full {
                break;
            }
        }

        if let Some(e) = first_error {
            return self.fail(task, Stage::Content, e);
        }
        if cancelled || cancel.is_cancelled() {
            self.save_task(task)?;
            return Ok(TaskOutcome::Cancelled);
        }

        task.complete_stage(Stage::Content)?;
        self.save_task(task)?;
        Ok(TaskOutcome::Completed)
    }

    /// Walks one parent's children feed and checkpoints the parent when done
    async fn collect_parent(
        &self,
        pending: &PendingEntity,
        cancel: &CancellationToken,
    ) -> Result<ParentHarvest> {
        let task_id = pending.task_id.as_str();
        let parent_id = pending.natural_id.as_str();
        let template = &self.config.api.parent_page_url;
        let crawler = &self.config.crawler;

        let request = FeedRequest::Children {
            parent_id: parent_id.to_string(),
        };
        let base = DiscoveryResult {
            natural_id: parent_id.to_string(),
            task_id: task_id.to_string(),
            url: pending.url.clone(),
            title: pending.title.clone().unwrap_or_default(),
            preview: None,
            author: None,
            answer_count: None,
            processed: false,
        };

        let mut walk = PageWalk::new(crawler.max_pages, crawler.max_items_per_parent);
        let mut state = PagingState::default();
        let mut exclude = Vec::new();
        let mut harvest = ParentHarvest::default();
        let mut details_saved = false;

        loop {
            if cancel.is_cancelled() {
                return Err(HarvestError::Cancelled);
            }

            let page = self
                .fetch_with_rotation(task_id, &request, &state, &mut exclude, cancel)
                .await?;

            if !details_saved {
                if let Some(question) = page.items.iter().find_map(embedded_question) {
                    let mut parent = parse_parent(&base, Some(question));
                    if parent.content.is_empty() {
                        parent.content = pending.title.clone().unwrap_or_default();
                    }
                    self.persist(|s| s.upsert_parent(&parent))?;
                    details_saved = true;
                }
            }

            let allowance = walk.allowance(page.items.len());
            for item in page.items.iter().take(allowance) {
                let Some(child) = parse_child_item(item, task_id, parent_id, template) else {
                    continue;
                };
                match self.persist(|s| s.upsert_child(&child))? {
                    UpsertOutcome::Inserted => harvest.inserted += 1,
                    UpsertOutcome::Updated => harvest.updated += 1,
                    UpsertOutcome::Duplicate => harvest.duplicates += 1,
                }
            }

            if let Some(reason) = walk.advance(&page, allowance) {
                tracing::debug!(task_id, parent_id, ?reason, items = walk.items_seen(), "Children walk finished");
                break;
            }
            state = page.next;

            if !self.scheduler.pause(cancel).await {
                return Err(HarvestError::Cancelled);
            }
        }

        self.persist(|s| s.mark_children_processed(task_id, parent_id))?;
        self.persist(|s| s.mark_processed(EntityKind::Parent, parent_id, task_id))?;
        self.persist(|s| s.mark_processed(EntityKind::Discovery, parent_id, task_id))?;
        Ok(harvest)
    }

    // ===== Fetching =====

    /// Takes the best credential, waiting for replenishment when the pool is dry
    async fn acquire_credential(
        &self,
        exclude: &[CredentialId],
        cancel: &CancellationToken,
    ) -> Result<CredentialRecord> {
        if let Some(record) = self.pool.acquire(exclude) {
            return Ok(record);
        }

        let wait = Duration::from_secs(self.config.crawler.replenish_wait_secs);
        tracing::info!(wait_secs = wait.as_secs(), "Waiting for credential replenishment");
        tokio::select! {
            _ = cancel.cancelled() => Err(HarvestError::Cancelled),
            record = self.pool.wait_for_credentials(exclude, wait) => {
                record.ok_or(HarvestError::PoolExhausted)
            }
        }
    }

    /// Fetches one page, rotating to a new credential once on auth rejection
    ///
    /// Rejected credentials are reported to the pool and added to `exclude`
    /// for the rest of the unit of work.
    async fn fetch_with_rotation(
        &self,
        task_id: &str,
        request: &FeedRequest,
        state: &PagingState,
        exclude: &mut Vec<CredentialId>,
        cancel: &CancellationToken,
    ) -> Result<FetchedPage> {
        let mut credential = self.acquire_credential(exclude, cancel).await?;
        let mut rotated = false;

        loop {
            match self.feed.fetch_page(request, state, &credential.bundle).await {
                Ok(page) => {
                    self.pool.report(credential.id, true);
                    self.tracker.record(true);
                    return Ok(page);
                }
                Err(e) => {
                    self.tracker.record(false);
                    self.record_detection(task_id, &e);

                    if e.class() != ErrorClass::AuthRejected {
                        return Err(e);
                    }

                    let still_active = self.pool.report(credential.id, false);
                    exclude.push(credential.id);
                    tracing::warn!(
                        task_id,
                        credential = credential.id,
                        still_active,
                        error = %e,
                        "Credential rejected"
                    );

                    if rotated {
                        return Err(e);
                    }
                    self.pool.request_replenishment();
                    credential = self.acquire_credential(exclude, cancel).await?;
                    rotated = true;
                }
            }
        }
    }

    fn record_detection(&self, task_id: &str, error: &HarvestError) {
        let Some(detection) = Detection::from_error(error) else {
            return;
        };
        let record = DetectionRecord {
            task_id: Some(task_id.to_string()),
            kind: detection.kind,
            url: error_url(error).unwrap_or_default().to_string(),
            status_code: detection.status,
            detail: detection.detail,
        };

        if let Err(e) = self.persist(|s| s.record_detection(&record)) {
            tracing::warn!(task_id, error = %e, "Failed to record detection");
        }
    }

    // ===== Persistence =====

    /// Runs a storage call, retrying it once on failure
    fn persist<T>(&self, op: impl Fn(&mut S) -> StorageResult<T>) -> Result<T> {
        let first = {
            let mut storage = lock_storage(&self.storage);
            op(&mut *storage)
        };

        match first {
            Ok(value) => Ok(value),
            Err(e) => {
                tracing::warn!(error = %e, "Storage call failed, retrying once");
                let mut storage = lock_storage(&self.storage);
                op(&mut *storage).map_err(HarvestError::from)
            }
        }
    }

    fn save_task(&self, task: &Task) -> Result<()> {
        self.persist(|s| s.save_task(task))
    }

    /// Recomputes counters in the store and mirrors them onto `task`
    fn refresh_counters(&self, task: &mut Task) -> Result<TaskProgress> {
        let progress = self.persist(|s| s.update_task_counters(&task.id))?;
        task.total_parents = progress.discovered;
        task.processed_parents = progress.discovered_processed;
        task.total_children = progress.children;
        task.processed_children = progress.children_processed;
        Ok(progress)
    }

    fn fail(&self, task: &mut Task, stage: Stage, error: HarvestError) -> Result<TaskOutcome> {
        let message = error.to_string();
        tracing::error!(task_id = %task.id, %stage, class = ?error.class(), error = %message, "Stage failed");
        task.fail_stage(stage, message.clone())?;
        self.save_task(task)?;
        Ok(TaskOutcome::Failed {
            stage,
            error: message,
        })
    }
}

/// The URL an error refers to, when it carries one
fn error_url(error: &HarvestError) -> Option<&str> {
    match error {
        HarvestError::Http { url, .. }
        | HarvestError::Timeout { url }
        | HarvestError::AuthRejected { url, .. }
        | HarvestError::RateLimited { url, .. }
        | HarvestError::ServerError { url, .. }
        | HarvestError::MalformedPage { url, .. } => Some(url.as_str()),
        _ => None,
    }
}
