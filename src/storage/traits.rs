//! Storage traits and error types
//!
//! This module defines the trait interface for storage backends and
//! associated error types.

use crate::crawler::PagingState;
use crate::state::Task;
use crate::storage::{
    ChildEntity, DetectionRecord, DiscoveryResult, EntityKind, ParentEntity, PendingEntity,
    TaskProgress, UpsertOutcome,
};
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Corrupt row in {table}: {message}")]
    CorruptRow { table: &'static str, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Trait for storage backend implementations
///
/// All entity writes are keyed by `(natural_id, task_id)` and are safe to
/// repeat: re-delivering the same page never produces a second row.
pub trait Storage {
    // ===== Task Management =====

    /// Inserts a new task row
    fn insert_task(&mut self, task: &Task) -> StorageResult<()>;

    /// Gets a task by ID
    fn get_task(&self, task_id: &str) -> StorageResult<Option<Task>>;

    /// Writes stage states, counters, last error and checkpoint of `task`
    fn save_task(&mut self, task: &Task) -> StorageResult<()>;

    /// Persists the discovery paging position after a committed page
    fn save_discovery_checkpoint(
        &mut self,
        task_id: &str,
        checkpoint: &PagingState,
    ) -> StorageResult<()>;

    /// Recomputes the task's counters from the entity tables and stores them
    fn update_task_counters(&mut self, task_id: &str) -> StorageResult<TaskProgress>;

    /// Tasks with either stage not completed, oldest first
    fn list_interrupted_tasks(&self) -> StorageResult<Vec<Task>>;

    /// All tasks, newest first
    fn list_tasks(&self) -> StorageResult<Vec<Task>>;

    // ===== Entity Upserts =====

    /// Upserts a discovery result
    fn upsert_discovery(&mut self, result: &DiscoveryResult) -> StorageResult<UpsertOutcome>;

    /// Upserts a parent entity
    ///
    /// On conflict every mutable field is overwritten; `processed` and
    /// `created_at` keep their stored values.
    fn upsert_parent(&mut self, parent: &ParentEntity) -> StorageResult<UpsertOutcome>;

    /// Upserts a child entity
    ///
    /// Returns `Duplicate` without writing when another child of the same task
    /// already carries the same non-empty content hash.
    fn upsert_child(&mut self, child: &ChildEntity) -> StorageResult<UpsertOutcome>;

    // ===== Checkpoints =====

    /// Sets the `processed` flag of one entity
    ///
    /// Returns false when no such row exists.
    fn mark_processed(
        &mut self,
        kind: EntityKind,
        natural_id: &str,
        task_id: &str,
    ) -> StorageResult<bool>;

    /// Marks every child of `parent_id` processed; returns the number changed
    fn mark_children_processed(&mut self, task_id: &str, parent_id: &str)
        -> StorageResult<usize>;

    /// Lists entities of `kind` in the task whose `processed` flag is unset
    fn list_unprocessed(
        &self,
        kind: EntityKind,
        task_id: &str,
        limit: usize,
    ) -> StorageResult<Vec<PendingEntity>>;

    // ===== Statistics =====

    /// Totals and processed counts per entity kind
    fn task_progress(&self, task_id: &str) -> StorageResult<TaskProgress>;

    /// Number of distinct child content hashes in the task
    fn count_unique_children(&self, task_id: &str) -> StorageResult<u64>;

    // ===== Detections =====

    /// Records an anti-bot intervention
    fn record_detection(&mut self, detection: &DetectionRecord) -> StorageResult<()>;

    /// Detection counts per kind for a task, most frequent first
    fn detection_summary(&self, task_id: &str) -> StorageResult<Vec<(String, u64)>>;
}
