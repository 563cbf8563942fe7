//! Storage module for persisting harvest data
//!
//! This module handles all database operations for the harvester, including:
//! - SQLite database initialization and schema management
//! - Task rows with stage states and the discovery checkpoint
//! - Idempotent upserts of discovery results, parents and children
//! - Content-hash deduplication of children within a task
//! - Per-entity `processed` checkpoints for resumption

mod schema;
mod sqlite;
mod traits;

pub use sqlite::SqliteStorage;
pub use traits::{Storage, StorageError, StorageResult};

use crate::crawler::detection::DetectionKind;
use crate::HarvestError;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Initializes or opens a storage database
///
/// # Arguments
///
/// * `path` - Path to the SQLite database file
///
/// # Returns
///
/// * `Ok(SqliteStorage)` - Successfully initialized storage
/// * `Err(HarvestError)` - Failed to initialize storage
pub fn open_storage(path: &Path) -> Result<SqliteStorage, HarvestError> {
    SqliteStorage::new(path)
}

/// Locks a shared storage handle, recovering the guard if a holder panicked
///
/// Every write is its own SQLite statement, so a panic mid-call leaves no
/// half-applied state behind the mutex.
pub fn lock_storage<S>(storage: &Mutex<S>) -> MutexGuard<'_, S> {
    storage.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Computes the SHA-256 hex digest used to deduplicate child content
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// The entity tables that carry a `processed` checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Discovery,
    Parent,
    Child,
}

impl EntityKind {
    pub(crate) fn table(&self) -> &'static str {
        match self {
            Self::Discovery => "discovery_results",
            Self::Parent => "parents",
            Self::Child => "children",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Discovery => "discovery",
            Self::Parent => "parent",
            Self::Child => "child",
        };
        write!(f, "{}", name)
    }
}

/// Result of an upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// A new row was written
    Inserted,
    /// An existing row with the same key had its fields overwritten
    Updated,
    /// Same content already stored under another ID in this task; nothing written
    Duplicate,
}

impl UpsertOutcome {
    /// True when the write added a new row
    pub fn is_new(&self) -> bool {
        matches!(self, Self::Inserted)
    }
}

/// A parent reference found while walking the search feed
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryResult {
    pub natural_id: String,
    pub task_id: String,
    pub url: String,
    pub title: String,
    pub preview: Option<String>,
    pub author: Option<String>,
    pub answer_count: Option<u64>,
    pub processed: bool,
}

/// A question and its metadata
#[derive(Debug, Clone, PartialEq)]
pub struct ParentEntity {
    pub natural_id: String,
    pub task_id: String,
    pub title: String,
    pub content: String,
    pub author: Option<String>,
    pub url: String,
    pub follower_count: u64,
    pub view_count: u64,
    pub answer_count: u64,
    pub tags: Vec<String>,
    pub processed: bool,
}

/// Whether a child row is an answer or a comment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildKind {
    Answer,
    Comment,
}

impl ChildKind {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Answer => "answer",
            Self::Comment => "comment",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "answer" => Some(Self::Answer),
            "comment" => Some(Self::Comment),
            _ => None,
        }
    }
}

/// An answer or comment belonging to a parent
#[derive(Debug, Clone, PartialEq)]
pub struct ChildEntity {
    pub natural_id: String,
    pub task_id: String,
    pub parent_id: String,
    pub kind: ChildKind,
    pub content: String,
    pub content_hash: String,
    pub author: Option<String>,
    pub url: String,
    pub vote_count: u64,
    pub comment_count: u64,
    /// Source timestamps (unix seconds) as reported by the feed
    pub source_created_at: Option<i64>,
    pub source_updated_at: Option<i64>,
    pub processed: bool,
}

impl ChildEntity {
    /// Builds an unprocessed child, hashing its content
    pub fn new(
        natural_id: impl Into<String>,
        task_id: impl Into<String>,
        parent_id: impl Into<String>,
        kind: ChildKind,
        content: impl Into<String>,
    ) -> Self {
        let content = content.into();
        Self {
            natural_id: natural_id.into(),
            task_id: task_id.into(),
            parent_id: parent_id.into(),
            kind,
            content_hash: content_hash(&content),
            content,
            author: None,
            url: String::new(),
            vote_count: 0,
            comment_count: 0,
            source_created_at: None,
            source_updated_at: None,
            processed: false,
        }
    }
}

/// A row returned by `list_unprocessed`
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntity {
    pub kind: EntityKind,
    pub natural_id: String,
    pub task_id: String,
    pub url: String,
    pub title: Option<String>,
    /// Only set for children
    pub parent_id: Option<String>,
}

/// Per-task totals and processed counts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskProgress {
    pub discovered: u64,
    pub discovered_processed: u64,
    pub parents: u64,
    pub parents_processed: u64,
    pub children: u64,
    pub children_processed: u64,
    pub unique_children: u64,
}

/// An anti-bot intervention observed while fetching
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionRecord {
    pub task_id: Option<String>,
    pub kind: DetectionKind,
    pub url: String,
    pub status_code: Option<u16>,
    pub detail: String,
}
