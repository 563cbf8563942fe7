//! SQLite storage implementation
//!
//! This module provides a SQLite-based implementation of the Storage trait.

use crate::crawler::PagingState;
use crate::state::{StageState, Task};
use crate::storage::schema::initialize_schema;
use crate::storage::traits::{Storage, StorageError, StorageResult};
use crate::storage::{
    ChildEntity, DetectionRecord, DiscoveryResult, EntityKind, ParentEntity, PendingEntity,
    TaskProgress, UpsertOutcome,
};
use crate::HarvestError;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;

const TASK_COLUMNS: &str = "id, keywords, start_date, end_date, discovery_state, content_state,
     total_parents, processed_parents, total_children, processed_children, last_error,
     discovery_cursor, discovery_offset, discovery_page, created_at, updated_at";

const DATE_FORMAT: &str = "%Y-%m-%d";

/// SQLite storage backend
pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    /// Creates a new SqliteStorage instance
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    ///
    /// # Returns
    ///
    /// * `Ok(SqliteStorage)` - Successfully opened/created database
    /// * `Err(HarvestError)` - Failed to open database
    pub fn new(path: &Path) -> Result<Self, HarvestError> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self { conn })
    }

    /// Creates an in-memory database
    pub fn new_in_memory() -> Result<Self, HarvestError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        initialize_schema(&conn)?;
        Ok(Self { conn })
    }

    fn row_exists(&self, kind: EntityKind, natural_id: &str, task_id: &str) -> StorageResult<bool> {
        let sql = format!(
            "SELECT 1 FROM {} WHERE natural_id = ?1 AND task_id = ?2",
            kind.table()
        );
        let found: Option<i64> = self
            .conn
            .query_row(&sql, params![natural_id, task_id], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    fn count_with_processed(&self, kind: EntityKind, task_id: &str) -> StorageResult<(u64, u64)> {
        let sql = format!(
            "SELECT COUNT(*), COALESCE(SUM(processed), 0) FROM {} WHERE task_id = ?1",
            kind.table()
        );
        let (total, processed): (i64, i64) = self
            .conn
            .query_row(&sql, params![task_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok((total as u64, processed as u64))
    }

    fn query_tasks(&self, sql: &str) -> StorageResult<Vec<Task>> {
        let mut stmt = self.conn.prepare(sql)?;
        let tasks = stmt
            .query_map([], row_to_task)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tasks)
    }
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn parse_stage_state(row: &Row<'_>, idx: usize) -> rusqlite::Result<StageState> {
    let raw: String = row.get(idx)?;
    StageState::from_db_string(&raw)
        .ok_or_else(|| conversion_error(idx, format!("unknown stage state '{}'", raw)))
}

fn parse_date(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<NaiveDate>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        NaiveDate::parse_from_str(&s, DATE_FORMAT)
            .map_err(|e| conversion_error(idx, format!("bad date '{}': {}", s, e)))
    })
    .transpose()
}

fn parse_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, format!("bad timestamp '{}': {}", raw, e)))
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        keywords: row.get(1)?,
        start_date: parse_date(row, 2)?,
        end_date: parse_date(row, 3)?,
        discovery_state: parse_stage_state(row, 4)?,
        content_state: parse_stage_state(row, 5)?,
        total_parents: row.get::<_, i64>(6)? as u64,
        processed_parents: row.get::<_, i64>(7)? as u64,
        total_children: row.get::<_, i64>(8)? as u64,
        processed_children: row.get::<_, i64>(9)? as u64,
        last_error: row.get(10)?,
        discovery_checkpoint: PagingState {
            cursor: row.get(11)?,
            offset: row.get::<_, i64>(12)? as u64,
            page_index: row.get::<_, i64>(13)? as u32,
        },
        created_at: parse_timestamp(row, 14)?,
        updated_at: parse_timestamp(row, 15)?,
    })
}

fn format_date(date: Option<NaiveDate>) -> Option<String> {
    date.map(|d| d.format(DATE_FORMAT).to_string())
}

impl Storage for SqliteStorage {
    // ===== Task Management =====

    fn insert_task(&mut self, task: &Task) -> StorageResult<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO tasks ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                TASK_COLUMNS
            ),
            params![
                task.id,
                task.keywords,
                format_date(task.start_date),
                format_date(task.end_date),
                task.discovery_state.to_db_string(),
                task.content_state.to_db_string(),
                task.total_parents as i64,
                task.processed_parents as i64,
                task.total_children as i64,
                task.processed_children as i64,
                task.last_error,
                task.discovery_checkpoint.cursor,
                task.discovery_checkpoint.offset as i64,
                task.discovery_checkpoint.page_index as i64,
                task.created_at.to_rfc3339(),
                task.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn get_task(&self, task_id: &str) -> StorageResult<Option<Task>> {
        let task = self
            .conn
            .query_row(
                &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
                params![task_id],
                row_to_task,
            )
            .optional()?;
        Ok(task)
    }

    fn save_task(&mut self, task: &Task) -> StorageResult<()> {
        let changed = self.conn.execute(
            "UPDATE tasks SET discovery_state = ?1, content_state = ?2, total_parents = ?3,
             processed_parents = ?4, total_children = ?5, processed_children = ?6,
             last_error = ?7, discovery_cursor = ?8, discovery_offset = ?9,
             discovery_page = ?10, updated_at = ?11
             WHERE id = ?12",
            params![
                task.discovery_state.to_db_string(),
                task.content_state.to_db_string(),
                task.total_parents as i64,
                task.processed_parents as i64,
                task.total_children as i64,
                task.processed_children as i64,
                task.last_error,
                task.discovery_checkpoint.cursor,
                task.discovery_checkpoint.offset as i64,
                task.discovery_checkpoint.page_index as i64,
                Utc::now().to_rfc3339(),
                task.id,
            ],
        )?;

        if changed == 0 {
            return Err(StorageError::TaskNotFound(task.id.clone()));
        }
        Ok(())
    }

    fn save_discovery_checkpoint(
        &mut self,
        task_id: &str,
        checkpoint: &PagingState,
    ) -> StorageResult<()> {
        let changed = self.conn.execute(
            "UPDATE tasks SET discovery_cursor = ?1, discovery_offset = ?2, discovery_page = ?3,
             updated_at = ?4 WHERE id = ?5",
            params![
                checkpoint.cursor,
                checkpoint.offset as i64,
                checkpoint.page_index as i64,
                Utc::now().to_rfc3339(),
                task_id,
            ],
        )?;

        if changed == 0 {
            return Err(StorageError::TaskNotFound(task_id.to_string()));
        }
        Ok(())
    }

    fn update_task_counters(&mut self, task_id: &str) -> StorageResult<TaskProgress> {
        let progress = self.task_progress(task_id)?;
        self.conn.execute(
            "UPDATE tasks SET total_parents = ?1, processed_parents = ?2, total_children = ?3,
             processed_children = ?4, updated_at = ?5 WHERE id = ?6",
            params![
                progress.discovered as i64,
                progress.discovered_processed as i64,
                progress.children as i64,
                progress.children_processed as i64,
                Utc::now().to_rfc3339(),
                task_id,
            ],
        )?;
        Ok(progress)
    }

    fn list_interrupted_tasks(&self) -> StorageResult<Vec<Task>> {
        self.query_tasks(&format!(
            "SELECT {} FROM tasks
             WHERE discovery_state != 'completed' OR content_state != 'completed'
             ORDER BY created_at ASC",
            TASK_COLUMNS
        ))
    }

    fn list_tasks(&self) -> StorageResult<Vec<Task>> {
        self.query_tasks(&format!(
            "SELECT {} FROM tasks ORDER BY created_at DESC",
            TASK_COLUMNS
        ))
    }

    // ===== Entity Upserts =====

    fn upsert_discovery(&mut self, result: &DiscoveryResult) -> StorageResult<UpsertOutcome> {
        let existed = self.row_exists(EntityKind::Discovery, &result.natural_id, &result.task_id)?;
        let now = Utc::now().to_rfc3339();

        self.conn.execute(
            "INSERT INTO discovery_results
             (natural_id, task_id, url, title, preview, author, answer_count, processed, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
             ON CONFLICT(natural_id, task_id) DO UPDATE SET
                url = excluded.url,
                title = excluded.title,
                preview = excluded.preview,
                author = excluded.author,
                answer_count = excluded.answer_count,
                updated_at = excluded.updated_at",
            params![
                result.natural_id,
                result.task_id,
                result.url,
                result.title,
                result.preview,
                result.author,
                result.answer_count.map(|n| n as i64),
                result.processed,
                now,
            ],
        )?;

        Ok(if existed {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Inserted
        })
    }

    fn upsert_parent(&mut self, parent: &ParentEntity) -> StorageResult<UpsertOutcome> {
        let existed = self.row_exists(EntityKind::Parent, &parent.natural_id, &parent.task_id)?;
        let tags = serde_json::to_string(&parent.tags)?;
        let now = Utc::now().to_rfc3339();

        self.conn.execute(
            "INSERT INTO parents
             (natural_id, task_id, title, content, author, url, follower_count, view_count,
              answer_count, tags, processed, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)
             ON CONFLICT(natural_id, task_id) DO UPDATE SET
                title = excluded.title,
                content = excluded.content,
                author = excluded.author,
                url = excluded.url,
                follower_count = excluded.follower_count,
                view_count = excluded.view_count,
                answer_count = excluded.answer_count,
                tags = excluded.tags,
                updated_at = excluded.updated_at",
            params![
                parent.natural_id,
                parent.task_id,
                parent.title,
                parent.content,
                parent.author,
                parent.url,
                parent.follower_count as i64,
                parent.view_count as i64,
                parent.answer_count as i64,
                tags,
                parent.processed,
                now,
            ],
        )?;

        Ok(if existed {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Inserted
        })
    }

    fn upsert_child(&mut self, child: &ChildEntity) -> StorageResult<UpsertOutcome> {
        if !child.content.is_empty() {
            let duplicate_of: Option<String> = self
                .conn
                .query_row(
                    "SELECT natural_id FROM children
                     WHERE task_id = ?1 AND content_hash = ?2 AND natural_id != ?3
                     LIMIT 1",
                    params![child.task_id, child.content_hash, child.natural_id],
                    |row| row.get(0),
                )
                .optional()?;

            if let Some(existing) = duplicate_of {
                tracing::debug!(
                    child = %child.natural_id,
                    existing = %existing,
                    "Skipping child with duplicate content"
                );
                return Ok(UpsertOutcome::Duplicate);
            }
        }

        let existed = self.row_exists(EntityKind::Child, &child.natural_id, &child.task_id)?;
        let now = Utc::now().to_rfc3339();

        self.conn.execute(
            "INSERT INTO children
             (natural_id, task_id, parent_id, child_kind, content, content_hash, author, url,
              vote_count, comment_count, source_created_at, source_updated_at, processed,
              created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)
             ON CONFLICT(natural_id, task_id) DO UPDATE SET
                parent_id = excluded.parent_id,
                child_kind = excluded.child_kind,
                content = excluded.content,
                content_hash = excluded.content_hash,
                author = excluded.author,
                url = excluded.url,
                vote_count = excluded.vote_count,
                comment_count = excluded.comment_count,
                source_created_at = excluded.source_created_at,
                source_updated_at = excluded.source_updated_at,
                updated_at = excluded.updated_at",
            params![
                child.natural_id,
                child.task_id,
                child.parent_id,
                child.kind.to_db_string(),
                child.content,
                child.content_hash,
                child.author,
                child.url,
                child.vote_count as i64,
                child.comment_count as i64,
                child.source_created_at,
                child.source_updated_at,
                child.processed,
                now,
            ],
        )?;

        Ok(if existed {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Inserted
        })
    }

    // ===== Checkpoints =====

    fn mark_processed(
        &mut self,
        kind: EntityKind,
        natural_id: &str,
        task_id: &str,
    ) -> StorageResult<bool> {
        let sql = format!(
            "UPDATE {} SET processed = 1, updated_at = ?1 WHERE natural_id = ?2 AND task_id = ?3",
            kind.table()
        );
        let changed = self.conn.execute(
            &sql,
            params![Utc::now().to_rfc3339(), natural_id, task_id],
        )?;
        Ok(changed > 0)
    }

    fn mark_children_processed(
        &mut self,
        task_id: &str,
        parent_id: &str,
    ) -> StorageResult<usize> {
        let changed = self.conn.execute(
            "UPDATE children SET processed = 1, updated_at = ?1
             WHERE task_id = ?2 AND parent_id = ?3 AND processed = 0",
            params![Utc::now().to_rfc3339(), task_id, parent_id],
        )?;
        Ok(changed)
    }

    fn list_unprocessed(
        &self,
        kind: EntityKind,
        task_id: &str,
        limit: usize,
    ) -> StorageResult<Vec<PendingEntity>> {
        let sql = match kind {
            EntityKind::Discovery | EntityKind::Parent => format!(
                "SELECT natural_id, task_id, url, title, NULL FROM {}
                 WHERE task_id = ?1 AND processed = 0 ORDER BY rowid LIMIT ?2",
                kind.table()
            ),
            EntityKind::Child => "SELECT natural_id, task_id, url, NULL, parent_id FROM children
                 WHERE task_id = ?1 AND processed = 0 ORDER BY rowid LIMIT ?2"
                .to_string(),
        };

        let mut stmt = self.conn.prepare(&sql)?;
        let pending = stmt
            .query_map(params![task_id, limit as i64], |row| {
                Ok(PendingEntity {
                    kind,
                    natural_id: row.get(0)?,
                    task_id: row.get(1)?,
                    url: row.get(2)?,
                    title: row.get(3)?,
                    parent_id: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(pending)
    }

    // ===== Statistics =====

    fn task_progress(&self, task_id: &str) -> StorageResult<TaskProgress> {
        let (discovered, discovered_processed) =
            self.count_with_processed(EntityKind::Discovery, task_id)?;
        let (parents, parents_processed) = self.count_with_processed(EntityKind::Parent, task_id)?;
        let (children, children_processed) =
            self.count_with_processed(EntityKind::Child, task_id)?;

        Ok(TaskProgress {
            discovered,
            discovered_processed,
            parents,
            parents_processed,
            children,
            children_processed,
            unique_children: self.count_unique_children(task_id)?,
        })
    }

    fn count_unique_children(&self, task_id: &str) -> StorageResult<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(DISTINCT content_hash) FROM children WHERE task_id = ?1",
            params![task_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    // ===== Detections =====

    fn record_detection(&mut self, detection: &DetectionRecord) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO detections (task_id, kind, url, status_code, detail, detected_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                detection.task_id,
                detection.kind.as_str(),
                detection.url,
                detection.status_code,
                detection.detail,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn detection_summary(&self, task_id: &str) -> StorageResult<Vec<(String, u64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT kind, COUNT(*) FROM detections WHERE task_id = ?1
             GROUP BY kind ORDER BY COUNT(*) DESC, kind ASC",
        )?;
        let summary = stmt
            .query_map(params![task_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::detection::DetectionKind;
    use crate::state::Stage;
    use crate::storage::ChildKind;

    fn storage_with_task() -> (SqliteStorage, Task) {
        let mut storage = SqliteStorage::new_in_memory().unwrap();
        let task = Task::new("rust ownership", None, None);
        storage.insert_task(&task).unwrap();
        (storage, task)
    }

    fn discovery(task_id: &str, id: &str) -> DiscoveryResult {
        DiscoveryResult {
            natural_id: id.to_string(),
            task_id: task_id.to_string(),
            url: format!("https://www.example.com/question/{}", id),
            title: format!("Question {}", id),
            preview: None,
            author: None,
            answer_count: Some(3),
            processed: false,
        }
    }

    fn parent(task_id: &str, id: &str, title: &str) -> ParentEntity {
        ParentEntity {
            natural_id: id.to_string(),
            task_id: task_id.to_string(),
            title: title.to_string(),
            content: "What is a borrow?".to_string(),
            author: Some("alice".to_string()),
            url: format!("https://www.example.com/question/{}", id),
            follower_count: 10,
            view_count: 100,
            answer_count: 2,
            tags: vec!["rust".to_string()],
            processed: false,
        }
    }

    #[test]
    fn test_task_roundtrip() {
        let mut storage = SqliteStorage::new_in_memory().unwrap();
        let start = NaiveDate::from_ymd_opt(2024, 1, 1);
        let task = Task::new("rust", start, None);
        storage.insert_task(&task).unwrap();

        let loaded = storage.get_task(&task.id).unwrap().unwrap();
        assert_eq!(loaded.id, task.id);
        assert_eq!(loaded.keywords, "rust");
        assert_eq!(loaded.start_date, start);
        assert_eq!(loaded.end_date, None);
        assert_eq!(loaded.discovery_state, StageState::NotStarted);
        assert_eq!(loaded.discovery_checkpoint, PagingState::default());

        assert!(storage.get_task("missing").unwrap().is_none());
    }

    #[test]
    fn test_save_task_persists_stage_states() {
        let (mut storage, mut task) = storage_with_task();
        task.begin_stage(Stage::Discovery).unwrap();
        task.fail_stage(Stage::Discovery, "timeout").unwrap();
        storage.save_task(&task).unwrap();

        let loaded = storage.get_task(&task.id).unwrap().unwrap();
        assert_eq!(loaded.discovery_state, StageState::Failed);
        assert_eq!(loaded.last_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_save_unknown_task_fails() {
        let mut storage = SqliteStorage::new_in_memory().unwrap();
        let task = Task::new("never inserted", None, None);
        assert!(matches!(
            storage.save_task(&task),
            Err(StorageError::TaskNotFound(_))
        ));
    }

    #[test]
    fn test_discovery_checkpoint() {
        let (mut storage, task) = storage_with_task();
        let checkpoint = PagingState {
            cursor: Some("abc".to_string()),
            offset: 40,
            page_index: 2,
        };
        storage
            .save_discovery_checkpoint(&task.id, &checkpoint)
            .unwrap();

        let loaded = storage.get_task(&task.id).unwrap().unwrap();
        assert_eq!(loaded.discovery_checkpoint, checkpoint);
    }

    #[test]
    fn test_upsert_child_is_idempotent() {
        let (mut storage, task) = storage_with_task();
        let mut child = ChildEntity::new("a1", &task.id, "q1", ChildKind::Answer, "first body");
        child.vote_count = 1;

        assert_eq!(storage.upsert_child(&child).unwrap(), UpsertOutcome::Inserted);

        child.vote_count = 7;
        assert_eq!(storage.upsert_child(&child).unwrap(), UpsertOutcome::Updated);

        let (count, votes): (i64, i64) = storage
            .conn
            .query_row(
                "SELECT COUNT(*), MAX(vote_count) FROM children WHERE natural_id = 'a1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(votes, 7);
    }

    #[test]
    fn test_upsert_child_dedups_by_content_hash() {
        let (mut storage, task) = storage_with_task();
        let first = ChildEntity::new("a1", &task.id, "q1", ChildKind::Answer, "same text");
        let second = ChildEntity::new("a2", &task.id, "q1", ChildKind::Answer, "same text");

        assert!(storage.upsert_child(&first).unwrap().is_new());
        assert_eq!(
            storage.upsert_child(&second).unwrap(),
            UpsertOutcome::Duplicate
        );

        let progress = storage.task_progress(&task.id).unwrap();
        assert_eq!(progress.children, 1);
        assert_eq!(progress.unique_children, 1);
    }

    #[test]
    fn test_dedup_is_scoped_to_task() {
        let (mut storage, task) = storage_with_task();
        let other = Task::new("other", None, None);
        storage.insert_task(&other).unwrap();

        let a = ChildEntity::new("a1", &task.id, "q1", ChildKind::Answer, "shared");
        let b = ChildEntity::new("a9", &other.id, "q1", ChildKind::Answer, "shared");
        assert!(storage.upsert_child(&a).unwrap().is_new());
        assert!(storage.upsert_child(&b).unwrap().is_new());
    }

    #[test]
    fn test_empty_content_is_not_deduplicated() {
        let (mut storage, task) = storage_with_task();
        let a = ChildEntity::new("c1", &task.id, "q1", ChildKind::Comment, "");
        let b = ChildEntity::new("c2", &task.id, "q1", ChildKind::Comment, "");
        assert!(storage.upsert_child(&a).unwrap().is_new());
        assert!(storage.upsert_child(&b).unwrap().is_new());
    }

    #[test]
    fn test_upsert_parent_preserves_processed_and_created_at() {
        let (mut storage, task) = storage_with_task();
        storage
            .upsert_parent(&parent(&task.id, "q1", "Old title"))
            .unwrap();
        assert!(storage
            .mark_processed(EntityKind::Parent, "q1", &task.id)
            .unwrap());

        let created_before: String = storage
            .conn
            .query_row(
                "SELECT created_at FROM parents WHERE natural_id = 'q1'",
                [],
                |row| row.get(0),
            )
            .unwrap();

        let outcome = storage
            .upsert_parent(&parent(&task.id, "q1", "New title"))
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Updated);

        let (title, processed, created_after): (String, bool, String) = storage
            .conn
            .query_row(
                "SELECT title, processed, created_at FROM parents WHERE natural_id = 'q1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(title, "New title");
        assert!(processed);
        assert_eq!(created_after, created_before);
    }

    #[test]
    fn test_crash_after_two_of_three_parents() {
        let (mut storage, task) = storage_with_task();
        for id in ["q1", "q2", "q3"] {
            storage.upsert_discovery(&discovery(&task.id, id)).unwrap();
        }

        storage
            .mark_processed(EntityKind::Discovery, "q1", &task.id)
            .unwrap();
        storage
            .mark_processed(EntityKind::Discovery, "q2", &task.id)
            .unwrap();

        let pending = storage
            .list_unprocessed(EntityKind::Discovery, &task.id, 100)
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].natural_id, "q3");
        assert_eq!(pending[0].kind, EntityKind::Discovery);
    }

    #[test]
    fn test_list_unprocessed_respects_limit_and_order() {
        let (mut storage, task) = storage_with_task();
        for id in ["q5", "q1", "q9"] {
            storage.upsert_discovery(&discovery(&task.id, id)).unwrap();
        }

        let pending = storage
            .list_unprocessed(EntityKind::Discovery, &task.id, 2)
            .unwrap();
        let ids: Vec<_> = pending.iter().map(|p| p.natural_id.as_str()).collect();
        assert_eq!(ids, vec!["q5", "q1"]);
    }

    #[test]
    fn test_mark_children_processed() {
        let (mut storage, task) = storage_with_task();
        for (id, body) in [("a1", "x"), ("a2", "y")] {
            let child = ChildEntity::new(id, &task.id, "q1", ChildKind::Answer, body);
            storage.upsert_child(&child).unwrap();
        }

        assert_eq!(storage.mark_children_processed(&task.id, "q1").unwrap(), 2);
        assert!(storage
            .list_unprocessed(EntityKind::Child, &task.id, 10)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_mark_processed_missing_row() {
        let (mut storage, task) = storage_with_task();
        assert!(!storage
            .mark_processed(EntityKind::Parent, "nope", &task.id)
            .unwrap());
    }

    #[test]
    fn test_update_task_counters() {
        let (mut storage, task) = storage_with_task();
        for id in ["q1", "q2"] {
            storage.upsert_discovery(&discovery(&task.id, id)).unwrap();
        }
        storage
            .mark_processed(EntityKind::Discovery, "q1", &task.id)
            .unwrap();
        let child = ChildEntity::new("a1", &task.id, "q1", ChildKind::Answer, "body");
        storage.upsert_child(&child).unwrap();

        let progress = storage.update_task_counters(&task.id).unwrap();
        assert_eq!(progress.discovered, 2);
        assert_eq!(progress.discovered_processed, 1);

        let loaded = storage.get_task(&task.id).unwrap().unwrap();
        assert_eq!(loaded.total_parents, 2);
        assert_eq!(loaded.processed_parents, 1);
        assert_eq!(loaded.total_children, 1);
        assert_eq!(loaded.processed_children, 0);
    }

    #[test]
    fn test_list_interrupted_tasks() {
        let mut storage = SqliteStorage::new_in_memory().unwrap();

        let fresh = Task::new("fresh", None, None);
        let mut done = Task::new("done", None, None);
        done.begin_stage(Stage::Discovery).unwrap();
        done.complete_stage(Stage::Discovery).unwrap();
        done.begin_stage(Stage::Content).unwrap();
        done.complete_stage(Stage::Content).unwrap();

        storage.insert_task(&fresh).unwrap();
        storage.insert_task(&done).unwrap();

        let interrupted = storage.list_interrupted_tasks().unwrap();
        assert_eq!(interrupted.len(), 1);
        assert_eq!(interrupted[0].id, fresh.id);
        assert_eq!(storage.list_tasks().unwrap().len(), 2);
    }

    #[test]
    fn test_detection_summary() {
        let (mut storage, task) = storage_with_task();
        for kind in [
            DetectionKind::RateLimit,
            DetectionKind::RateLimit,
            DetectionKind::Captcha,
        ] {
            storage
                .record_detection(&DetectionRecord {
                    task_id: Some(task.id.clone()),
                    kind,
                    url: "https://api.example.com/search".to_string(),
                    status_code: Some(429),
                    detail: "test".to_string(),
                })
                .unwrap();
        }

        let summary = storage.detection_summary(&task.id).unwrap();
        assert_eq!(
            summary,
            vec![("rate_limit".to_string(), 2), ("captcha".to_string(), 1)]
        );
    }
}
