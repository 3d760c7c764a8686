//! Error types for sitecrawl.
//!
//! Library crates use [`SiteCrawlError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all sitecrawl operations.
#[derive(Debug, thiserror::Error)]
pub enum SiteCrawlError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error while driving an automation session.
    #[error("network error: {0}")]
    Network(String),

    /// URL or markup parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Invalid caller input (bad seed URL, zero depth budget, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// The coordinator is draining and no longer admits jobs.
    #[error("coordinator is shutting down")]
    Shutdown,
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, SiteCrawlError>;

impl SiteCrawlError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = SiteCrawlError::config("unknown section [pool.extra]");
        assert_eq!(err.to_string(), "config error: unknown section [pool.extra]");

        let err = SiteCrawlError::validation("seed url has no host");
        assert!(err.to_string().contains("no host"));

        assert_eq!(
            SiteCrawlError::Shutdown.to_string(),
            "coordinator is shutting down"
        );
    }
}
