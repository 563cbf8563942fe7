//! Crawler module for feed fetching and harvest orchestration
//!
//! This module contains the core harvesting logic, including:
//! - HTTP fetching with retry logic and credential headers
//! - Anti-bot detection on every response
//! - Cursor/offset pagination with checkpointable state
//! - Feed item parsing into discovery results, parents and children
//! - Bounded concurrency with jittered pacing
//! - Browser scroll collection as a fallback surface
//! - Overall task coordination

pub mod browser;
mod coordinator;
pub mod detection;
mod fetcher;
pub mod pagination;
pub mod parser;
mod scheduler;

pub use browser::{collect_items, BrowserSurface, ScrollPlan};
pub use coordinator::{Orchestrator, RunSummary, TaskOutcome};
pub use detection::{detect, Detection, DetectionKind};
pub use fetcher::{build_http_client, HttpFeedSource, PassthroughSigner, RequestSigner};
pub use pagination::{FeedRequest, FeedSource, FetchedPage, PageWalk, PagingState, StopReason};
pub use scheduler::{ActiveProbe, JobPermit, JobScheduler};
