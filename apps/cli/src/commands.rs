//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use sitecrawl_core::{Coordinator, JobSpec, JobTicket};
use sitecrawl_crawler::{HttpSessionFactory, canonicalize_absolute};
use sitecrawl_shared::{
    AppConfig, JobDefaults, JobState, PoolConfig, expand_home, init_config, load_config,
};
use sitecrawl_storage::Storage;
use tracing::info;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// sitecrawl: crawl sites into a reduced, searchable page store.
#[derive(Parser)]
#[command(
    name = "sitecrawl",
    version,
    about = "Crawl websites through a shared worker pool into a local page store.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Crawl one or more sites concurrently.
    Crawl {
        /// Seed URLs (one job per URL).
        #[arg(required = true)]
        urls: Vec<String>,

        /// Tenant that owns the crawled sites.
        #[arg(short, long, default_value = "local", env = "SITECRAWL_TENANT")]
        tenant: String,

        /// Maximum link depth (overrides config).
        #[arg(short, long)]
        depth: Option<u32>,

        /// Advisory page cap per site (overrides config).
        #[arg(long)]
        max_pages: Option<usize>,

        /// Worker pool size (overrides config).
        #[arg(short, long)]
        workers: Option<usize>,

        /// Database path (overrides config).
        #[arg(long)]
        db: Option<String>,

        /// Action label recorded in the run log.
        #[arg(long, default_value = "scrape")]
        action: String,
    },

    /// List the persisted pages of a site.
    Pages {
        /// Site seed URL.
        #[arg(long)]
        site: String,

        /// Database path (overrides config).
        #[arg(long)]
        db: Option<String>,

        /// Print the reduced content of every page.
        #[arg(long)]
        content: bool,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "sitecrawl=info",
        1 => "sitecrawl=debug",
        _ => "sitecrawl=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Crawl {
            urls,
            tenant,
            depth,
            max_pages,
            workers,
            db,
            action,
        } => {
            let overrides = CrawlOverrides {
                depth,
                max_pages,
                workers,
                db,
            };
            cmd_crawl(&urls, &tenant, &action, overrides).await
        }
        Command::Pages { site, db, content } => cmd_pages(&site, db.as_deref(), content).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

/// Flags that override config file values for `crawl`.
struct CrawlOverrides {
    depth: Option<u32>,
    max_pages: Option<usize>,
    workers: Option<usize>,
    db: Option<String>,
}

fn database_path(config: &AppConfig, flag: Option<&str>) -> Result<PathBuf> {
    let raw = flag.unwrap_or(&config.storage.database_path);
    Ok(expand_home(raw)?)
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_crawl(
    urls: &[String],
    tenant: &str,
    action: &str,
    overrides: CrawlOverrides,
) -> Result<()> {
    let config = load_config()?;

    let mut pool = PoolConfig::from(&config);
    if let Some(workers) = overrides.workers {
        if workers == 0 {
            return Err(eyre!("--workers must be at least 1"));
        }
        pool.workers = workers;
    }
    let mut defaults = JobDefaults::from(&config);
    if let Some(depth) = overrides.depth {
        defaults.max_depth = depth;
    }
    if let Some(max_pages) = overrides.max_pages {
        defaults.max_pages = max_pages;
    }

    let db_path = database_path(&config, overrides.db.as_deref())?;
    let storage = Arc::new(Storage::open(&db_path).await?);
    let factory = Arc::new(HttpSessionFactory::new(&pool.navigation)?);
    let coordinator = Coordinator::new(pool.clone(), factory, storage.clone(), storage.clone());

    info!(
        seeds = urls.len(),
        workers = pool.workers,
        max_depth = defaults.max_depth,
        db = %db_path.display(),
        "starting crawl"
    );

    let multi = MultiProgress::new();
    let style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold} {msg}")?
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "✓"]);

    let mut tickets: Vec<(JobTicket, ProgressBar)> = Vec::with_capacity(urls.len());
    for url in urls {
        let spec = JobSpec {
            action: action.to_string(),
            ..JobSpec::new(url.as_str(), tenant, defaults)
        };
        let ticket = coordinator
            .add_job(spec)
            .await
            .map_err(|e| eyre!("cannot start crawl of '{url}': {e}"))?;

        let bar = multi.add(ProgressBar::new_spinner());
        bar.set_style(style.clone());
        bar.set_prefix(ticket.job.seed_url().to_string());
        bar.enable_steady_tick(Duration::from_millis(80));
        tickets.push((ticket, bar));
    }

    watch_jobs(&tickets).await;
    coordinator.shutdown().await;

    println!();
    for (ticket, _) in &tickets {
        let progress = ticket.job.snapshot();
        let outcome = match ticket.job.run_token() {
            Some(token) => match storage.get_run(token).await?.and_then(|run| run.success) {
                Some(true) => "complete",
                Some(false) => "forced",
                None => "unfinished",
            },
            None => "unlogged",
        };
        println!(
            "  {:<40} site {}  pages {:>4}  failed {:>3}  {outcome}",
            ticket.job.seed_url(),
            ticket.site_id,
            progress.completed,
            progress.failed
        );
    }
    println!();
    println!("  Database: {}", db_path.display());

    Ok(())
}

/// Refresh one spinner per job until every job is done. Ctrl-C cancels all jobs.
async fn watch_jobs(tickets: &[(JobTicket, ProgressBar)]) {
    let mut refresh = tokio::time::interval(Duration::from_millis(200));
    let mut cancelled = false;

    loop {
        tokio::select! {
            _ = refresh.tick() => {}
            _ = tokio::signal::ctrl_c(), if !cancelled => {
                info!("interrupted, stopping jobs");
                for (ticket, _) in tickets {
                    ticket.job.cleanup();
                }
                cancelled = true;
            }
        }

        let mut all_done = true;
        for (ticket, bar) in tickets {
            let progress = ticket.job.snapshot();
            if progress.state == JobState::Done {
                if !bar.is_finished() {
                    bar.finish_with_message(format!(
                        "{} pages, {} failed",
                        progress.completed, progress.failed
                    ));
                }
                continue;
            }
            all_done = false;
            bar.set_message(format!(
                "[{}] {} pages, {} queued, {} in flight",
                progress.state, progress.completed, progress.queued, progress.in_flight
            ));
        }
        if all_done {
            break;
        }
    }
}

async fn cmd_pages(site: &str, db: Option<&str>, content: bool) -> Result<()> {
    let config = load_config()?;
    let db_path = database_path(&config, db)?;
    let storage = Storage::open_readonly(&db_path).await?;

    let site_url = canonicalize_absolute(site).map_err(|e| eyre!("invalid site URL: {e}"))?;
    let record = storage
        .find_site(&site_url)
        .await?
        .ok_or_else(|| eyre!("no crawl recorded for '{site_url}'"))?;

    let pages = storage.list_pages(&record.id).await?;
    info!(site = %site_url, pages = pages.len(), "listing pages");

    println!();
    println!("  Site:   {} ({})", record.url, record.id);
    println!("  Tenant: {}", record.tenant_id);
    println!("  Pages:  {}", pages.len());
    println!();
    for page in &pages {
        let kind = if page.is_internal { "int" } else { "ext" };
        let label = page.summary.lines().next().unwrap_or("-");
        println!("  [{kind}] {:<60} {label}", page.url);
        if content {
            for line in page.content.lines() {
                println!("        {line}");
            }
            println!();
        }
    }

    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
