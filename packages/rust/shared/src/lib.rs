//! Shared types, error model, and configuration for sitecrawl.
//!
//! This crate is the foundation depended on by all other sitecrawl crates.
//! It provides:
//! - [`SiteCrawlError`]: the unified error type
//! - Domain types ([`PageTask`], [`CompletedPage`], [`JobState`], [`SiteId`])
//! - Configuration ([`AppConfig`], [`PoolConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CrawlSection, JobDefaults, NavigationConfig, NavigationSection, PoolConfig, PoolSection,
    ReducerSection, StorageSection, config_dir, config_file_path, expand_home, init_config,
    load_config, load_config_from,
};
pub use error::{Result, SiteCrawlError};
pub use types::{
    CompletedPage, JobId, JobState, PageTask, RunReport, RunToken, SiteId, SiteRecord,
};
