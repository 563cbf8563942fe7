//! qa-harvester main entry point
//!
//! This is the command-line interface for the resumable Q&A harvester.

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use clap::Parser;
use qa_harvester::config::{load_config_with_hash, Config};
use qa_harvester::credentials::read_credential_file;
use qa_harvester::crawler::{HttpFeedSource, RunSummary, TaskOutcome};
use qa_harvester::health::{CredentialSource, HealthMonitor, RequestTracker};
use qa_harvester::output::{load_all_statistics, load_statistics, print_statistics};
use qa_harvester::storage::open_storage;
use qa_harvester::{CredentialBundle, CredentialPool, Orchestrator, Storage};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// qa-harvester: a resumable Q&A feed harvester
///
/// Discovers questions matching keywords, then collects every answer for
/// each of them. Progress is committed page by page, so an interrupted run
/// picks up where it stopped.
#[derive(Parser, Debug)]
#[command(name = "qa-harvester")]
#[command(version)]
#[command(about = "A resumable Q&A feed harvester", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Keyword query to harvest; repeat for several tasks
    #[arg(long, value_name = "QUERY")]
    keywords: Vec<String>,

    /// Only discover content published on or after this date (YYYY-MM-DD)
    #[arg(long, value_name = "DATE")]
    start_date: Option<NaiveDate>,

    /// Only discover content published on or before this date (YYYY-MM-DD)
    #[arg(long, value_name = "DATE")]
    end_date: Option<NaiveDate>,

    /// Run or resume one existing task
    #[arg(long, value_name = "TASK_ID", conflicts_with = "keywords")]
    task: Option<String>,

    /// Resume every interrupted task
    #[arg(long, conflicts_with_all = ["keywords", "task"])]
    resume: bool,

    /// Show statistics from the database and exit
    #[arg(long, conflicts_with_all = ["dry_run", "keywords", "resume"])]
    stats: bool,

    /// Validate config and show what would be harvested without fetching
    #[arg(long, conflicts_with_all = ["stats", "resume", "task"])]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, config_hash) = load_config_with_hash(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    tracing::info!(hash = %config_hash, "Configuration loaded");

    if let (Some(start), Some(end)) = (cli.start_date, cli.end_date) {
        if start > end {
            bail!("--start-date {} is after --end-date {}", start, end);
        }
    }

    if cli.dry_run {
        handle_dry_run(&config, &cli);
        Ok(())
    } else if cli.stats {
        handle_stats(&config, cli.task.as_deref())
    } else {
        handle_harvest(config, cli).await
    }
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("qa_harvester=info,warn"),
            1 => EnvFilter::new("qa_harvester=debug,info"),
            2 => EnvFilter::new("qa_harvester=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Handles the --dry-run mode: shows the effective configuration
fn handle_dry_run(config: &Config, cli: &Cli) {
    println!("=== qa-harvester Dry Run ===\n");

    println!("Crawler:");
    println!("  Max concurrency: {}", config.crawler.max_concurrency);
    println!("  Page size: {}", config.crawler.page_size);
    println!(
        "  Delay between requests: {}-{}ms",
        config.crawler.inter_request_delay_min_ms, config.crawler.inter_request_delay_max_ms
    );
    println!("  Max pages per feed: {}", config.crawler.max_pages);
    match config.crawler.max_items_per_parent {
        Some(cap) => println!("  Max children per parent: {}", cap),
        None => println!("  Max children per parent: unlimited"),
    }

    println!("\nAPI:");
    println!("  Search: {}", config.api.search_url);
    println!("  Children: {}", config.api.children_url);
    if let Some(page) = &config.api.search_page_url {
        println!("  Browser search page: {}", page);
    }

    println!("\nCredentials:");
    println!("  TTL: {}s", config.credentials.credential_ttl_secs);
    println!("  Pool max size: {}", config.credentials.pool_max_size);
    match &config.credentials.seed_file {
        Some(path) => println!("  Seed file: {}", path),
        None => println!("  Seed file: none"),
    }

    println!("\nOutput:");
    println!("  Database: {}", config.output.database_path);

    println!("\n✓ Configuration is valid");
    if !cli.keywords.is_empty() {
        println!("✓ Would harvest {} keyword queries:", cli.keywords.len());
        for keywords in &cli.keywords {
            println!("  - {}", keywords);
        }
    }
}

/// Handles the --stats mode: shows statistics from the database
fn handle_stats(config: &Config, task_id: Option<&str>) -> anyhow::Result<()> {
    println!("Database: {}\n", config.output.database_path);

    let storage = open_storage(Path::new(&config.output.database_path))
        .context("failed to open database")?;

    let stats = match task_id {
        Some(id) => {
            let task = storage
                .get_task(id)?
                .with_context(|| format!("no task with id {}", id))?;
            vec![load_statistics(&storage, task)?]
        }
        None => load_all_statistics(&storage)?,
    };

    let pool = config
        .credentials
        .seed_file
        .as_ref()
        .map(|_| seeded_pool(config))
        .transpose()?;
    print_statistics(&stats, pool.as_ref().map(|p| p.stats()).as_ref());

    Ok(())
}

/// Builds the credential pool, importing the seed file when one is configured
fn seeded_pool(config: &Config) -> anyhow::Result<CredentialPool> {
    let pool = CredentialPool::from_config(&config.credentials);
    if let Some(path) = &config.credentials.seed_file {
        let path = Path::new(path);
        if path.exists() {
            let added = pool
                .import_json(path)
                .with_context(|| format!("failed to import credentials from {}", path.display()))?;
            tracing::info!(added, "Seeded credential pool");
        } else {
            tracing::warn!(path = %path.display(), "Credential seed file not found");
        }
    }
    Ok(pool)
}

/// Re-reads the seed file whenever the monitor asks for credentials
///
/// An external process is expected to refresh the file.
struct SeedFileSource {
    path: PathBuf,
    ttl: chrono::Duration,
}

#[async_trait]
impl CredentialSource for SeedFileSource {
    async fn acquire_bundles(&self, wanted: usize) -> qa_harvester::Result<Vec<CredentialBundle>> {
        let now = Utc::now();
        Ok(read_credential_file(&self.path)?
            .into_iter()
            .filter(|(_, created_at)| now - *created_at < self.ttl)
            .map(|(bundle, _)| bundle)
            .take(wanted)
            .collect())
    }
}

/// Handles the main harvest operation
async fn handle_harvest(config: Config, cli: Cli) -> anyhow::Result<()> {
    if cli.keywords.is_empty() && cli.task.is_none() && !cli.resume {
        bail!("nothing to do: pass --keywords, --task or --resume");
    }

    let storage = open_storage(Path::new(&config.output.database_path))
        .context("failed to open database")?;
    let storage = Arc::new(Mutex::new(storage));

    let pool = Arc::new(seeded_pool(&config)?);
    if pool.is_empty() {
        tracing::warn!("Credential pool is empty; requests will wait for replenishment");
    }

    let feed = HttpFeedSource::from_config(&config).context("failed to build HTTP client")?;
    let tracker = Arc::new(RequestTracker::new(config.health.recent_window));

    let source: Option<Arc<dyn CredentialSource>> =
        config.credentials.seed_file.as_ref().map(|path| {
            Arc::new(SeedFileSource {
                path: PathBuf::from(path),
                ttl: chrono::Duration::seconds(config.credentials.credential_ttl_secs as i64),
            }) as Arc<dyn CredentialSource>
        });

    let cancel = CancellationToken::new();
    let monitor = HealthMonitor::new(pool.clone(), tracker.clone(), source, config.health.clone())
        .spawn(&cancel);

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping after in-flight pages");
            interrupt.cancel();
        }
    });

    let seed_file = config.credentials.seed_file.clone();
    let orchestrator = Orchestrator::new(config, storage, pool.clone(), Arc::new(feed))
        .with_tracker(tracker);

    let result = if cli.resume {
        orchestrator.resume_interrupted(&cancel).await
    } else if let Some(task_id) = &cli.task {
        orchestrator.run_task(task_id, &cancel).await.map(|s| vec![s])
    } else {
        orchestrator
            .run_batch(&cli.keywords, cli.start_date, cli.end_date, &cancel)
            .await
    };

    if let Some(report) = monitor.shutdown().await {
        tracing::info!(
            score = %format!("{:.1}", report.health_score),
            level = %report.health_level,
            trend = ?report.trend,
            "Final health"
        );
    }
    if let Some(path) = seed_file {
        if let Err(e) = pool.export_json(Path::new(&path)) {
            tracing::warn!(error = %e, "Failed to save credentials");
        }
    }

    let summaries = result.context("harvest aborted")?;
    print_summaries(&summaries);

    let failed = summaries
        .iter()
        .filter(|s| matches!(s.outcome, TaskOutcome::Failed { .. }))
        .count();
    if failed > 0 {
        bail!("{} of {} tasks failed; rerun with --resume", failed, summaries.len());
    }
    Ok(())
}

fn print_summaries(summaries: &[RunSummary]) {
    for s in summaries {
        let outcome = match &s.outcome {
            TaskOutcome::Completed => "completed".to_string(),
            TaskOutcome::Cancelled => "cancelled (resumable)".to_string(),
            TaskOutcome::Failed { stage, error } => format!("{} failed: {}", stage, error),
        };
        println!(
            "{}  {}  parents={} children={} unique={}",
            s.task_id,
            outcome,
            s.progress.parents,
            s.progress.children,
            s.progress.unique_children
        );
    }
}
