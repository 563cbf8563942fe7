//! Statistics generation from the harvest database
//!
//! This module provides functionality for extracting and displaying
//! per-task statistics from the storage layer.

use crate::credentials::PoolStats;
use crate::state::Task;
use crate::storage::{Storage, TaskProgress};
use crate::Result;
use std::fmt::Write;

/// Statistics for one task
#[derive(Debug, Clone)]
pub struct TaskStatistics {
    pub task: Task,

    /// Row counts per entity kind
    pub progress: TaskProgress,

    /// Detection counts by kind, most frequent first
    pub detections: Vec<(String, u64)>,
}

impl TaskStatistics {
    /// Share of discovered parents whose content has been collected, in percent
    pub fn completion_percent(&self) -> f64 {
        if self.progress.discovered == 0 {
            return 0.0;
        }
        self.progress.discovered_processed as f64 / self.progress.discovered as f64 * 100.0
    }

    /// Children dropped or merged by content-hash deduplication
    pub fn duplicate_children(&self) -> u64 {
        self.progress
            .children
            .saturating_sub(self.progress.unique_children)
    }
}

/// Loads statistics for one task
///
/// # Arguments
///
/// * `storage` - The storage backend to query
/// * `task` - The task to summarize
///
/// # Returns
///
/// * `Ok(TaskStatistics)` - Successfully loaded statistics
/// * `Err(HarvestError)` - Failed to query statistics
pub fn load_statistics(storage: &dyn Storage, task: Task) -> Result<TaskStatistics> {
    let progress = storage.task_progress(&task.id)?;
    let detections = storage.detection_summary(&task.id)?;

    Ok(TaskStatistics {
        task,
        progress,
        detections,
    })
}

/// Loads statistics for every task, newest first
pub fn load_all_statistics(storage: &dyn Storage) -> Result<Vec<TaskStatistics>> {
    storage
        .list_tasks()?
        .into_iter()
        .map(|task| load_statistics(storage, task))
        .collect()
}

/// Renders statistics as a plain-text report
///
/// `pool` is included when a credential pool is loaded in this process.
pub fn render_statistics(stats: &[TaskStatistics], pool: Option<&PoolStats>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "=== Harvest Statistics ===\n");

    if stats.is_empty() {
        let _ = writeln!(out, "No tasks recorded.\n");
    }

    for s in stats {
        let task = &s.task;
        let p = &s.progress;

        let _ = writeln!(out, "Task {} [{}]", task.id, task.keywords);
        if task.start_date.is_some() || task.end_date.is_some() {
            let date = |d: Option<chrono::NaiveDate>| {
                d.map(|d| d.to_string()).unwrap_or_else(|| "-".to_string())
            };
            let _ = writeln!(
                out,
                "  Date range: {} .. {}",
                date(task.start_date),
                date(task.end_date)
            );
        }
        let _ = writeln!(
            out,
            "  Stages: discovery={} content={}",
            task.discovery_state, task.content_state
        );
        let _ = writeln!(
            out,
            "  Discovered: {} ({} processed, {:.1}%)",
            p.discovered,
            p.discovered_processed,
            s.completion_percent()
        );
        let _ = writeln!(out, "  Parents: {} ({} processed)", p.parents, p.parents_processed);
        let _ = writeln!(
            out,
            "  Children: {} ({} processed, {} unique, {} duplicate)",
            p.children,
            p.children_processed,
            p.unique_children,
            s.duplicate_children()
        );
        if let Some(error) = &task.last_error {
            let _ = writeln!(out, "  Last error: {}", error);
        }

        if !s.detections.is_empty() {
            let _ = writeln!(out, "  Detections:");
            for (kind, count) in &s.detections {
                let _ = writeln!(out, "    {}: {}", kind, count);
            }
        }
        let _ = writeln!(out);
    }

    if let Some(pool) = pool {
        let _ = writeln!(out, "Credential Pool:");
        let _ = writeln!(
            out,
            "  {} total, {} active, {} fresh",
            pool.total, pool.active, pool.fresh
        );
        let _ = writeln!(
            out,
            "  Average success rate: {:.1}%",
            pool.avg_success_rate * 100.0
        );
    }

    out
}

/// Prints statistics to stdout in a formatted manner
pub fn print_statistics(stats: &[TaskStatistics], pool: Option<&PoolStats>) {
    print!("{}", render_statistics(stats, pool));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ChildEntity, ChildKind, DetectionRecord, DiscoveryResult, SqliteStorage};
    use crate::crawler::DetectionKind;

    fn discovery(task_id: &str, id: &str) -> DiscoveryResult {
        DiscoveryResult {
            natural_id: id.to_string(),
            task_id: task_id.to_string(),
            url: format!("https://www.example.com/question/{}", id),
            title: format!("Question {}", id),
            preview: None,
            author: None,
            answer_count: None,
            processed: false,
        }
    }

    #[test]
    fn test_load_and_render_statistics() {
        let mut storage = SqliteStorage::new_in_memory().unwrap();
        let task = Task::new("rust async", None, None);
        storage.insert_task(&task).unwrap();

        for id in ["q1", "q2"] {
            storage.upsert_discovery(&discovery(&task.id, id)).unwrap();
        }
        storage
            .mark_processed(crate::storage::EntityKind::Discovery, "q1", &task.id)
            .unwrap();
        storage
            .upsert_child(&ChildEntity::new("a1", &task.id, "q1", ChildKind::Answer, "first"))
            .unwrap();
        storage
            .record_detection(&DetectionRecord {
                task_id: Some(task.id.clone()),
                kind: DetectionKind::RateLimit,
                url: "https://api.example.com/search".to_string(),
                status_code: Some(429),
                detail: "slow down".to_string(),
            })
            .unwrap();

        let stats = load_all_statistics(&storage).unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].progress.discovered, 2);
        assert_eq!(stats[0].completion_percent(), 50.0);
        assert_eq!(stats[0].detections, vec![("rate_limit".to_string(), 1)]);

        let text = render_statistics(&stats, None);
        assert!(text.contains("rust async"));
        assert!(text.contains("Discovered: 2 (1 processed, 50.0%)"));
        assert!(text.contains("rate_limit: 1"));
        assert!(!text.contains("Credential Pool"));
    }

    #[test]
    fn test_render_empty_with_pool() {
        let pool = PoolStats {
            total: 4,
            active: 3,
            fresh: 2,
            avg_success_rate: 0.75,
            oldest_age_secs: None,
            newest_age_secs: None,
        };
        let text = render_statistics(&[], Some(&pool));
        assert!(text.contains("No tasks recorded."));
        assert!(text.contains("4 total, 3 active, 2 fresh"));
        assert!(text.contains("75.0%"));
    }
}
