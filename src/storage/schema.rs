//! Database schema definitions
//!
//! This module contains all SQL schema definitions for the harvest database.

/// SQL schema for the database
pub const SCHEMA_SQL: &str = r#"
-- One row per harvest job; never deleted
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    keywords TEXT NOT NULL,
    start_date TEXT,
    end_date TEXT,
    discovery_state TEXT NOT NULL,
    content_state TEXT NOT NULL,
    total_parents INTEGER NOT NULL DEFAULT 0,
    processed_parents INTEGER NOT NULL DEFAULT 0,
    total_children INTEGER NOT NULL DEFAULT 0,
    processed_children INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    discovery_cursor TEXT,
    discovery_offset INTEGER NOT NULL DEFAULT 0,
    discovery_page INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_keywords ON tasks(keywords);

-- Parent references found while walking the search feed
CREATE TABLE IF NOT EXISTS discovery_results (
    natural_id TEXT NOT NULL,
    task_id TEXT NOT NULL REFERENCES tasks(id),
    url TEXT NOT NULL,
    title TEXT NOT NULL,
    preview TEXT,
    author TEXT,
    answer_count INTEGER,
    processed INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (natural_id, task_id)
);

CREATE INDEX IF NOT EXISTS idx_discovery_pending ON discovery_results(task_id, processed);

CREATE TABLE IF NOT EXISTS parents (
    natural_id TEXT NOT NULL,
    task_id TEXT NOT NULL REFERENCES tasks(id),
    title TEXT NOT NULL,
    content TEXT NOT NULL,
    author TEXT,
    url TEXT NOT NULL,
    follower_count INTEGER NOT NULL DEFAULT 0,
    view_count INTEGER NOT NULL DEFAULT 0,
    answer_count INTEGER NOT NULL DEFAULT 0,
    tags TEXT NOT NULL DEFAULT '[]',
    processed INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (natural_id, task_id)
);

CREATE INDEX IF NOT EXISTS idx_parents_pending ON parents(task_id, processed);

CREATE TABLE IF NOT EXISTS children (
    natural_id TEXT NOT NULL,
    task_id TEXT NOT NULL REFERENCES tasks(id),
    parent_id TEXT NOT NULL,
    child_kind TEXT NOT NULL,
    content TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    author TEXT,
    url TEXT NOT NULL,
    vote_count INTEGER NOT NULL DEFAULT 0,
    comment_count INTEGER NOT NULL DEFAULT 0,
    source_created_at INTEGER,
    source_updated_at INTEGER,
    processed INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (natural_id, task_id)
);

CREATE INDEX IF NOT EXISTS idx_children_hash ON children(task_id, content_hash);
CREATE INDEX IF NOT EXISTS idx_children_parent ON children(task_id, parent_id);

-- Anti-bot interventions observed while fetching
CREATE TABLE IF NOT EXISTS detections (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT REFERENCES tasks(id),
    kind TEXT NOT NULL,
    url TEXT NOT NULL,
    status_code INTEGER,
    detail TEXT NOT NULL,
    detected_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_detections_task ON detections(task_id);
"#;

/// Initializes the database schema
///
/// # Arguments
///
/// * `conn` - The database connection
///
/// # Returns
///
/// * `Ok(())` - Schema initialized successfully
/// * `Err(rusqlite::Error)` - Failed to initialize schema
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}
