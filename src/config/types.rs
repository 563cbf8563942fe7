use serde::Deserialize;
use std::time::Duration;

/// Main configuration structure for the harvester
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub crawler: CrawlerConfig,
    pub api: ApiConfig,
    #[serde(default)]
    pub credentials: CredentialConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    pub output: OutputConfig,
}

/// Crawl pacing and limits
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CrawlerConfig {
    /// Maximum number of units of work in flight at once
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,

    /// Items requested per page
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Lower bound of the randomized delay between requests (milliseconds)
    #[serde(default = "default_delay_min")]
    pub inter_request_delay_min_ms: u64,

    /// Upper bound of the randomized delay between requests (milliseconds)
    #[serde(default = "default_delay_max")]
    pub inter_request_delay_max_ms: u64,

    /// Safety ceiling on pages fetched for a single feed
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,

    /// Optional cap on children collected per parent
    #[serde(default)]
    pub max_items_per_parent: Option<u64>,

    /// How long to wait for the pool to be replenished before giving up
    #[serde(default = "default_replenish_wait")]
    pub replenish_wait_secs: u64,
}

impl CrawlerConfig {
    pub fn delay_range(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.inter_request_delay_min_ms),
            Duration::from_millis(self.inter_request_delay_max_ms),
        )
    }
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            page_size: default_page_size(),
            inter_request_delay_min_ms: default_delay_min(),
            inter_request_delay_max_ms: default_delay_max(),
            max_pages: default_max_pages(),
            max_items_per_parent: None,
            replenish_wait_secs: default_replenish_wait(),
        }
    }
}

/// Remote feed endpoints
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ApiConfig {
    /// Search feed used for discovery
    pub search_url: String,

    /// Children feed; `{parent_id}` is replaced by the parent's natural ID
    pub children_url: String,

    /// Public page URL of a parent; `{parent_id}` is replaced as above
    #[serde(default = "default_parent_page_url")]
    pub parent_page_url: String,

    /// Human-facing search page for the browser fallback; `{keywords}` is
    /// replaced by the URL-encoded task keywords
    #[serde(default)]
    pub search_page_url: Option<String>,

    /// User agent sent when the credential bundle does not carry one
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Credential pool sizing and eviction thresholds
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CredentialConfig {
    /// Age after which a credential is no longer handed out (seconds)
    #[serde(default = "default_credential_ttl")]
    pub credential_ttl_secs: u64,

    /// Maximum number of records kept in the pool
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: usize,

    /// Minimum uses before the failure rate is judged
    #[serde(default = "default_min_uses")]
    pub min_uses_for_eviction: u32,

    /// Failure rate at or above which a credential is deactivated
    #[serde(default = "default_max_failure_rate")]
    pub max_failure_rate: f64,

    /// Optional JSON file of bundles loaded at startup
    #[serde(default)]
    pub seed_file: Option<String>,
}

impl CredentialConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.credential_ttl_secs)
    }
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            credential_ttl_secs: default_credential_ttl(),
            pool_max_size: default_pool_max_size(),
            min_uses_for_eviction: default_min_uses(),
            max_failure_rate: default_max_failure_rate(),
            seed_file: None,
        }
    }
}

/// Health monitor configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HealthConfig {
    /// Seconds between health ticks
    #[serde(default = "default_health_interval")]
    pub health_check_interval_secs: u64,

    /// Whether remediation actions run automatically
    #[serde(default = "default_true")]
    pub recovery_enabled: bool,

    /// Number of recent request outcomes in the rolling success window
    #[serde(default = "default_recent_window")]
    pub recent_window: usize,

    /// Number of metric snapshots kept for trend analysis
    #[serde(default = "default_history_size")]
    pub history_size: usize,

    /// Minimum seconds between two firings of the same alert
    #[serde(default = "default_alert_cooldown")]
    pub alert_cooldown_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: default_health_interval(),
            recovery_enabled: true,
            recent_window: default_recent_window(),
            history_size: default_history_size(),
            alert_cooldown_secs: default_alert_cooldown(),
        }
    }
}

/// Retry policy for transient failures
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RetryConfig {
    /// Retries after the first attempt
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Output configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OutputConfig {
    /// Path to the SQLite database file
    pub database_path: String,
}

fn default_max_concurrency() -> u32 {
    3
}

fn default_page_size() -> u32 {
    20
}

fn default_delay_min() -> u64 {
    1000
}

fn default_delay_max() -> u64 {
    3000
}

fn default_max_pages() -> u32 {
    1000
}

fn default_replenish_wait() -> u64 {
    30
}

fn default_parent_page_url() -> String {
    "https://www.zhihu.com/question/{parent_id}".to_string()
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36"
        .to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_credential_ttl() -> u64 {
    3600
}

fn default_pool_max_size() -> usize {
    100
}

fn default_min_uses() -> u32 {
    5
}

fn default_max_failure_rate() -> f64 {
    0.8
}

fn default_health_interval() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_recent_window() -> usize {
    100
}

fn default_history_size() -> usize {
    100
}

fn default_alert_cooldown() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> u64 {
    1000
}

fn default_max_delay() -> u64 {
    60_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}
