//! Application configuration for sitecrawl.
//!
//! User config lives at `~/.sitecrawl/sitecrawl.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SiteCrawlError};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "sitecrawl.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".sitecrawl";

// ---------------------------------------------------------------------------
// Config structs (matching sitecrawl.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Worker pool and control loop tuning.
    #[serde(default)]
    pub pool: PoolSection,

    /// Per-page navigation limits.
    #[serde(default)]
    pub navigation: NavigationSection,

    /// Default traversal bounds for new jobs.
    #[serde(default)]
    pub crawl: CrawlSection,

    /// Content reduction settings.
    #[serde(default)]
    pub reducer: ReducerSection,

    /// Page store location.
    #[serde(default)]
    pub storage: StorageSection,
}

/// `[pool]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSection {
    /// Number of automation sessions kept in the pool.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Control loop tick interval.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    /// How long the loop may go without progress before every job is forced done.
    /// Must exceed `batch_timeout_secs`.
    #[serde(default = "default_stall_ceiling")]
    pub stall_ceiling_secs: u64,

    /// Wall-clock bound for a dispatch batch before its workers are reclaimed.
    /// Must exceed both navigation timeouts combined.
    #[serde(default = "default_batch_timeout")]
    pub batch_timeout_secs: u64,

    /// Pool age after which new jobs are held until a teardown happens.
    #[serde(default = "default_recycle_after")]
    pub recycle_after_secs: u64,

    /// How long a held caller waits before forcing a reset.
    #[serde(default = "default_admission_ceiling")]
    pub admission_ceiling_secs: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            tick_ms: default_tick_ms(),
            stall_ceiling_secs: default_stall_ceiling(),
            batch_timeout_secs: default_batch_timeout(),
            recycle_after_secs: default_recycle_after(),
            admission_ceiling_secs: default_admission_ceiling(),
        }
    }
}

fn default_workers() -> usize {
    4
}
fn default_tick_ms() -> u64 {
    100
}
fn default_stall_ceiling() -> u64 {
    90
}
fn default_batch_timeout() -> u64 {
    60
}
fn default_recycle_after() -> u64 {
    30 * 60
}
fn default_admission_ceiling() -> u64 {
    10 * 60
}

/// `[navigation]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavigationSection {
    /// Timeout for the first (network idle) attempt.
    #[serde(default = "default_nav_timeout")]
    pub timeout_ms: u64,

    /// Timeout for the relaxed (markup parsed) retry.
    #[serde(default = "default_relaxed_timeout")]
    pub relaxed_timeout_ms: u64,

    /// User-Agent sent by the HTTP session.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for NavigationSection {
    fn default() -> Self {
        Self {
            timeout_ms: default_nav_timeout(),
            relaxed_timeout_ms: default_relaxed_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_nav_timeout() -> u64 {
    15_000
}
fn default_relaxed_timeout() -> u64 {
    30_000
}
fn default_user_agent() -> String {
    concat!("sitecrawl/", env!("CARGO_PKG_VERSION")).into()
}

/// `[crawl]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlSection {
    /// Maximum link depth from the seed URL.
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,

    /// Advisory cap on internal pages per job.
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
}

impl Default for CrawlSection {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            max_pages: default_max_pages(),
        }
    }
}

fn default_max_depth() -> u32 {
    2
}
fn default_max_pages() -> usize {
    200
}

/// `[reducer]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReducerSection {
    /// Attributes that survive reduction.
    #[serde(default = "default_keep_attrs")]
    pub keep_attrs: Vec<String>,
}

impl Default for ReducerSection {
    fn default() -> Self {
        Self {
            keep_attrs: default_keep_attrs(),
        }
    }
}

fn default_keep_attrs() -> Vec<String> {
    ["href", "title", "alt", "aria-label"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSection {
    /// Path of the libSQL database file.
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

fn default_database_path() -> String {
    "~/.sitecrawl/sitecrawl.db".into()
}

// ---------------------------------------------------------------------------
// Runtime configs (merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime tuning for the worker pool coordinator.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of automation sessions.
    pub workers: usize,
    /// Control loop tick interval.
    pub tick: Duration,
    /// Accumulated no-progress time that triggers forced termination.
    pub stall_ceiling: Duration,
    /// Deadline for every dispatch batch.
    pub batch_timeout: Duration,
    /// Pool age after which admission is held.
    pub recycle_after: Duration,
    /// Maximum time a caller is held before a forced reset.
    pub admission_ceiling: Duration,
    /// Navigation limits handed to every fetch task.
    pub navigation: NavigationConfig,
    /// Attributes kept by the content reducer.
    pub keep_attrs: Vec<String>,
}

impl From<&AppConfig> for PoolConfig {
    fn from(config: &AppConfig) -> Self {
        let pool = &config.pool;
        Self {
            workers: pool.workers,
            tick: Duration::from_millis(pool.tick_ms),
            stall_ceiling: Duration::from_secs(pool.stall_ceiling_secs),
            batch_timeout: Duration::from_secs(pool.batch_timeout_secs),
            recycle_after: Duration::from_secs(pool.recycle_after_secs),
            admission_ceiling: Duration::from_secs(pool.admission_ceiling_secs),
            navigation: NavigationConfig::from(config),
            keep_attrs: config.reducer.keep_attrs.clone(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

/// Traversal bounds applied to jobs that do not specify their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobDefaults {
    pub max_depth: u32,
    pub max_pages: usize,
}

impl From<&AppConfig> for JobDefaults {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_depth: config.crawl.max_depth,
            max_pages: config.crawl.max_pages,
        }
    }
}

/// Timeouts for the two-step navigation strategy.
#[derive(Debug, Clone)]
pub struct NavigationConfig {
    /// First attempt (wait for network idle).
    pub timeout: Duration,
    /// Relaxed retry (wait for markup parsed).
    pub relaxed_timeout: Duration,
    /// User-Agent for HTTP-backed sessions.
    pub user_agent: String,
}

impl From<&AppConfig> for NavigationConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            timeout: Duration::from_millis(config.navigation.timeout_ms),
            relaxed_timeout: Duration::from_millis(config.navigation.relaxed_timeout_ms),
            user_agent: config.navigation.user_agent.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.sitecrawl/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| SiteCrawlError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.sitecrawl/sitecrawl.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| SiteCrawlError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        SiteCrawlError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    validate(&config)?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| SiteCrawlError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| SiteCrawlError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| SiteCrawlError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Expand a leading `~/` against the home directory.
pub fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| SiteCrawlError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}

/// Reject values that would make the coordinator unable to make progress.
fn validate(config: &AppConfig) -> Result<()> {
    if config.pool.workers == 0 {
        return Err(SiteCrawlError::config("[pool] workers must be at least 1"));
    }
    if config.pool.tick_ms == 0 {
        return Err(SiteCrawlError::config("[pool] tick_ms must be positive"));
    }
    if config.navigation.relaxed_timeout_ms == 0 || config.navigation.timeout_ms == 0 {
        return Err(SiteCrawlError::config(
            "[navigation] timeouts must be positive",
        ));
    }

    let task_budget_ms = config
        .navigation
        .timeout_ms
        .saturating_add(config.navigation.relaxed_timeout_ms);
    if config.pool.batch_timeout_secs.saturating_mul(1000) <= task_budget_ms {
        return Err(SiteCrawlError::config(format!(
            "[pool] batch_timeout_secs ({}s) must exceed the navigation budget of {task_budget_ms}ms",
            config.pool.batch_timeout_secs
        )));
    }
    if config.pool.stall_ceiling_secs <= config.pool.batch_timeout_secs {
        return Err(SiteCrawlError::config(format!(
            "[pool] stall_ceiling_secs ({}s) must exceed batch_timeout_secs ({}s)",
            config.pool.stall_ceiling_secs, config.pool.batch_timeout_secs
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("stall_ceiling_secs"));
        assert!(toml_str.contains("keep_attrs"));
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let toml_str = r#"
[pool]
workers = 8

[crawl]
max_depth = 4
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.pool.workers, 8);
        assert_eq!(config.pool.tick_ms, 100);
        assert_eq!(config.crawl.max_depth, 4);
        assert_eq!(config.crawl.max_pages, 200);
        assert_eq!(config.reducer.keep_attrs, vec!["href", "title", "alt", "aria-label"]);
    }

    #[test]
    fn pool_config_from_app_config() {
        let app = AppConfig::default();
        let pool = PoolConfig::from(&app);
        assert_eq!(pool.workers, 4);
        assert_eq!(pool.tick, Duration::from_millis(100));
        assert_eq!(pool.stall_ceiling, Duration::from_secs(90));
        assert_eq!(pool.batch_timeout, Duration::from_secs(60));
        assert_eq!(pool.navigation.timeout, Duration::from_millis(15_000));
        assert_eq!(pool.navigation.relaxed_timeout, Duration::from_millis(30_000));

        let defaults = JobDefaults::from(&app);
        assert_eq!(defaults.max_depth, 2);
        assert_eq!(defaults.max_pages, 200);
    }

    #[test]
    fn zero_workers_rejected() {
        let tmp = std::env::temp_dir().join(format!("sc_cfg_{}.toml", uuid::Uuid::now_v7()));
        std::fs::write(&tmp, "[pool]\nworkers = 0\n").unwrap();
        let err = load_config_from(&tmp).unwrap_err();
        assert!(err.to_string().contains("workers"));
        let _ = std::fs::remove_file(&tmp);
    }

    #[test]
    fn default_deadlines_outlast_a_doubly_timed_out_page() {
        let app = AppConfig::default();
        validate(&app).unwrap();
        let pool = PoolConfig::from(&app);
        let task_budget = pool.navigation.timeout + pool.navigation.relaxed_timeout;
        assert!(pool.batch_timeout > task_budget);
        assert!(pool.stall_ceiling > pool.batch_timeout);
    }

    #[test]
    fn stall_ceiling_below_batch_timeout_rejected() {
        let mut app = AppConfig::default();
        app.pool.stall_ceiling_secs = 30;
        app.pool.batch_timeout_secs = 90;
        let err = validate(&app).unwrap_err();
        assert!(err.to_string().contains("stall_ceiling_secs"));
    }

    #[test]
    fn batch_timeout_within_navigation_budget_rejected() {
        let mut app = AppConfig::default();
        app.pool.batch_timeout_secs = 45;
        let err = validate(&app).unwrap_err();
        assert!(err.to_string().contains("batch_timeout_secs"));
    }

    #[test]
    fn expand_home_leaves_absolute_paths() {
        assert_eq!(
            expand_home("/var/lib/sitecrawl.db").unwrap(),
            PathBuf::from("/var/lib/sitecrawl.db")
        );
    }
}
