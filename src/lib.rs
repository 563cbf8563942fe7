//! qa-harvester: a resumable crawl-orchestration engine
//!
//! This crate collects questions, answers and comments from a paged feed API,
//! persisting every page as it arrives so that multi-hour jobs survive crashes,
//! rate limiting and anti-bot interventions. Credentials rotate through a
//! health-scored pool that a background monitor keeps replenished.

pub mod config;
pub mod crawler;
pub mod credentials;
pub mod health;
pub mod output;
pub mod retry;
pub mod state;
pub mod storage;

use thiserror::Error;

/// Main error type for harvester operations
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("HTTP error for {url}: {source}")]
    Http { url: String, source: reqwest::Error },

    #[error("Request timeout for {url}")]
    Timeout { url: String },

    #[error("Authentication rejected for {url} (HTTP {status})")]
    AuthRejected { url: String, status: u16 },

    #[error("Rate limited by {url}")]
    RateLimited {
        url: String,
        retry_after: Option<u64>,
    },

    #[error("Server error for {url} (HTTP {status})")]
    ServerError { url: String, status: u16 },

    #[error("Malformed page from {url}: {message}")]
    MalformedPage { url: String, message: String },

    #[error("No usable credential in the pool")]
    PoolExhausted,

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Storage error: {0}")]
    StorageError(#[from] storage::StorageError),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] ::url::ParseError),

    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid {stage} stage transition: {from} -> {to}")]
    InvalidTransition {
        stage: state::Stage,
        from: state::StageState,
        to: state::StageState,
    },

    #[error("Task {task_id} cannot collect content before discovery completes")]
    DiscoveryIncomplete { task_id: String },

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Job cancelled")]
    Cancelled,

    #[error("Browser surface error: {0}")]
    Browser(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure classes the orchestrator routes on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Timeouts, connection failures, 5xx, 429 and malformed bodies
    TransientNetwork,
    /// 401/403 or an invalidated session
    AuthRejected,
    /// Unparseable continuation data; degraded, never fatal
    DataIntegrity,
    /// The store rejected a write or read
    PersistenceUnavailable,
    /// The credential pool had nothing to hand out
    ExhaustedPool,
    /// Cancellation requested by the caller
    Cancelled,
    /// Everything else (configuration, state machine misuse, IO)
    Fatal,
}

impl HarvestError {
    /// Classifies this error for routing decisions
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Http { source, .. } | Self::Reqwest(source) => {
                if source.is_timeout() || source.is_connect() || source.is_request() {
                    ErrorClass::TransientNetwork
                } else {
                    ErrorClass::Fatal
                }
            }
            Self::Timeout { .. }
            | Self::RateLimited { .. }
            | Self::ServerError { .. }
            | Self::MalformedPage { .. } => ErrorClass::TransientNetwork,
            Self::AuthRejected { .. } => ErrorClass::AuthRejected,
            Self::UrlParse(_) | Self::Serialization(_) => ErrorClass::DataIntegrity,
            Self::Database(_) | Self::StorageError(_) => ErrorClass::PersistenceUnavailable,
            Self::PoolExhausted => ErrorClass::ExhaustedPool,
            Self::Cancelled => ErrorClass::Cancelled,
            Self::Config(_)
            | Self::InvalidTransition { .. }
            | Self::DiscoveryIncomplete { .. }
            | Self::TaskNotFound(_)
            | Self::Browser(_)
            | Self::Io(_) => ErrorClass::Fatal,
        }
    }
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),
}

/// Result type alias for harvester operations
pub type Result<T> = std::result::Result<T, HarvestError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// Re-export commonly used types
pub use config::Config;
pub use credentials::{CredentialBundle, CredentialPool, CredentialRecord};
pub use crawler::{Orchestrator, PagingState};
pub use state::{determine_resume_strategy, ResumeStrategy, Stage, StageState, Task};
pub use storage::{SqliteStorage, Storage};
