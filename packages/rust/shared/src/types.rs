//! Core domain types shared by the crawler, the store and the coordinator.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for crawl job identifiers (time-sortable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Generate a new time-sortable job identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a site record in the page store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteId(pub String);

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque token returned by the run logger when a job starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunToken(pub String);

// ---------------------------------------------------------------------------
// Site record
// ---------------------------------------------------------------------------

/// A site row as known to the page store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteRecord {
    /// Store identifier.
    pub id: SiteId,
    /// Owning tenant.
    pub tenant_id: String,
    /// Canonical base URL of the site.
    pub url: String,
}

// ---------------------------------------------------------------------------
// PageTask
// ---------------------------------------------------------------------------

/// One unit of work: fetch `url` on behalf of a job.
///
/// Created when a link is accepted into a job's queue and consumed exactly once
/// by a worker claim. Claims move tasks between collections; they never edit them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageTask {
    /// Canonical URL to fetch.
    pub url: String,
    /// Link distance from the seed (external-phase tasks are always 0).
    pub depth: u32,
    /// Whether this task belongs to the deferred external phase.
    pub is_external_phase: bool,
}

impl PageTask {
    /// An internal-phase task.
    pub fn internal(url: impl Into<String>, depth: u32) -> Self {
        Self {
            url: url.into(),
            depth,
            is_external_phase: false,
        }
    }

    /// An external-phase task (depth 0, never link-expanded).
    pub fn external(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            depth: 0,
            is_external_phase: true,
        }
    }
}

// ---------------------------------------------------------------------------
// CompletedPage
// ---------------------------------------------------------------------------

/// A fetched and reduced page, accumulated by its job until persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPage {
    /// Canonical URL.
    pub url: String,
    /// Indented tag serialization produced by the content reducer.
    pub reduced_content: String,
    /// Short candidate summary phrases (empty for external pages).
    pub summary_phrases: Vec<String>,
    /// `true` for pages of the crawled site, `false` for external-phase pages.
    pub is_internal: bool,
    /// Newline-separated canonical internal links found on the page.
    pub internal_links_raw: String,
    /// Newline-separated canonical external links found on the page.
    pub external_links_raw: String,
}

impl CompletedPage {
    /// Summary phrases joined the way the store keeps them.
    pub fn summary_text(&self) -> String {
        self.summary_phrases.join("\n")
    }
}

// ---------------------------------------------------------------------------
// Job lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle states of a crawl job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Initializing,
    Crawling,
    ExternalPhase,
    Completing,
    Done,
}

impl JobState {
    /// Whether workers may still be dispatched for this state.
    pub fn is_crawling(self) -> bool {
        matches!(self, Self::Crawling | Self::ExternalPhase)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initializing => "initializing",
            Self::Crawling => "crawling",
            Self::ExternalPhase => "external_phase",
            Self::Completing => "completing",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// Final counters handed to the run logger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    /// Free-form action label supplied by the caller (e.g. `scrape`).
    pub action: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Pages fetched and recorded.
    pub pages_ok: usize,
    /// Pages that could not be fetched.
    pub pages_failed: usize,
    /// `false` when the job was force-terminated.
    pub success: bool,
}
