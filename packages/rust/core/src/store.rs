//! Persistence seams consumed by crawl jobs.
//!
//! The coordinator only talks to [`PageStore`] and [`RunLogger`]; the libSQL
//! [`Storage`] implements both.

use async_trait::async_trait;

use sitecrawl_shared::{CompletedPage, Result, RunReport, RunToken, SiteId, SiteRecord};
use sitecrawl_storage::Storage;

/// Site and page persistence.
#[async_trait]
pub trait PageStore: Send + Sync {
    /// Look up a site by canonical base URL.
    async fn find_site(&self, url: &str) -> Result<Option<SiteRecord>>;

    /// Create a site record and return its ID.
    async fn create_site(&self, url: &str, tenant_id: &str) -> Result<SiteId>;

    /// Insert or replace one page, keyed by `(site_id, url)`.
    async fn upsert_page(&self, site_id: &SiteId, page: &CompletedPage) -> Result<()>;
}

/// Crawl run bookkeeping.
#[async_trait]
pub trait RunLogger: Send + Sync {
    async fn log_start(&self, action: &str, tenant_id: &str) -> Result<RunToken>;

    async fn log_completion(&self, token: &RunToken, report: &RunReport) -> Result<()>;
}

#[async_trait]
impl PageStore for Storage {
    async fn find_site(&self, url: &str) -> Result<Option<SiteRecord>> {
        Storage::find_site(self, url).await
    }

    async fn create_site(&self, url: &str, tenant_id: &str) -> Result<SiteId> {
        Storage::create_site(self, url, tenant_id).await
    }

    async fn upsert_page(&self, site_id: &SiteId, page: &CompletedPage) -> Result<()> {
        Storage::upsert_page(self, site_id, page).await
    }
}

#[async_trait]
impl RunLogger for Storage {
    async fn log_start(&self, action: &str, tenant_id: &str) -> Result<RunToken> {
        self.insert_run(action, tenant_id).await
    }

    async fn log_completion(&self, token: &RunToken, report: &RunReport) -> Result<()> {
        self.finish_run(token, report).await
    }
}
