//! Output module for harvest reports
//!
//! This module handles:
//! - Per-task progress and deduplication statistics
//! - Detection summaries and credential pool state for `--stats`

pub mod stats;

pub use stats::{
    load_all_statistics, load_statistics, print_statistics, render_statistics, TaskStatistics,
};
