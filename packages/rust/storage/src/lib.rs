//! libSQL storage layer (local file).
//!
//! The [`Storage`] struct wraps a libSQL database holding site records, the
//! reduced pages of every crawl and the crawl run log.
//!
//! **Access rules:**
//! - the coordinator writes through [`Storage::open`]
//! - inspection commands read through [`Storage::open_readonly`]

mod migrations;

use std::path::Path;

use chrono::Utc;
use libsql::{Connection, Database, params};
use sha2::{Digest, Sha256};
use sitecrawl_shared::{CompletedPage, Result, RunReport, RunToken, SiteCrawlError, SiteId, SiteRecord};
use uuid::Uuid;

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SiteCrawlError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| SiteCrawlError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| SiteCrawlError::Storage(e.to_string()))?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(SiteCrawlError::Storage(format!(
                "database not found: {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| SiteCrawlError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| SiteCrawlError::Storage(e.to_string()))?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        SiteCrawlError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(SiteCrawlError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Site operations
    // -----------------------------------------------------------------------

    /// Look up a site by its canonical base URL.
    pub async fn find_site(&self, url: &str) -> Result<Option<SiteRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, tenant_id, url FROM sites WHERE url = ?1",
                params![url],
            )
            .await
            .map_err(|e| SiteCrawlError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_site(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(SiteCrawlError::Storage(e.to_string())),
        }
    }

    /// Create a site record, or return the existing one's ID if `url` is taken.
    pub async fn create_site(&self, url: &str, tenant_id: &str) -> Result<SiteId> {
        self.check_writable()?;
        let id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO sites (id, tenant_id, url, created_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(url) DO NOTHING",
                params![id.as_str(), tenant_id, url, now.as_str()],
            )
            .await
            .map_err(|e| SiteCrawlError::Storage(e.to_string()))?;

        let site = self
            .find_site(url)
            .await?
            .ok_or_else(|| SiteCrawlError::Storage(format!("site {url} vanished after insert")))?;
        Ok(site.id)
    }

    /// List all sites owned by `tenant_id`.
    pub async fn list_sites(&self, tenant_id: &str) -> Result<Vec<SiteRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, tenant_id, url FROM sites WHERE tenant_id = ?1 ORDER BY url",
                params![tenant_id],
            )
            .await
            .map_err(|e| SiteCrawlError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_site(&row)?);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Page operations
    // -----------------------------------------------------------------------

    /// Upsert a page (insert or update on conflict by `site_id + url`).
    pub async fn upsert_page(&self, site_id: &SiteId, page: &CompletedPage) -> Result<()> {
        self.check_writable()?;
        let id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();
        let hash = content_hash(&page.reduced_content);
        self.conn
            .execute(
                "INSERT INTO pages (id, site_id, url, summary, content, content_hash, is_internal,
                                    internal_links, external_links, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(site_id, url) DO UPDATE SET
                   summary = excluded.summary,
                   content = excluded.content,
                   content_hash = excluded.content_hash,
                   is_internal = excluded.is_internal,
                   internal_links = excluded.internal_links,
                   external_links = excluded.external_links,
                   updated_at = excluded.updated_at",
                params![
                    id.as_str(),
                    site_id.0.as_str(),
                    page.url.as_str(),
                    page.summary_text(),
                    page.reduced_content.as_str(),
                    hash.as_str(),
                    i64::from(page.is_internal),
                    page.internal_links_raw.as_str(),
                    page.external_links_raw.as_str(),
                    now.as_str(),
                ],
            )
            .await
            .map_err(|e| SiteCrawlError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Get a page by site and canonical URL.
    pub async fn get_page(&self, site_id: &SiteId, url: &str) -> Result<Option<StoredPage>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, site_id, url, summary, content, content_hash, is_internal,
                        internal_links, external_links, updated_at
                 FROM pages WHERE site_id = ?1 AND url = ?2",
                params![site_id.0.as_str(), url],
            )
            .await
            .map_err(|e| SiteCrawlError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_page(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(SiteCrawlError::Storage(e.to_string())),
        }
    }

    /// List all pages of a site, internal pages first, then by URL.
    pub async fn list_pages(&self, site_id: &SiteId) -> Result<Vec<StoredPage>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, site_id, url, summary, content, content_hash, is_internal,
                        internal_links, external_links, updated_at
                 FROM pages WHERE site_id = ?1 ORDER BY is_internal DESC, url",
                params![site_id.0.as_str()],
            )
            .await
            .map_err(|e| SiteCrawlError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_page(&row)?);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Crawl run log
    // -----------------------------------------------------------------------

    /// Record the start of a crawl run. Returns its token.
    pub async fn insert_run(&self, action: &str, tenant_id: &str) -> Result<RunToken> {
        self.check_writable()?;
        let id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO crawl_runs (id, action, tenant_id, started_at) VALUES (?1, ?2, ?3, ?4)",
                params![id.as_str(), action, tenant_id, now.as_str()],
            )
            .await
            .map_err(|e| SiteCrawlError::Storage(e.to_string()))?;
        Ok(RunToken(id))
    }

    /// Close a crawl run with its final counters.
    pub async fn finish_run(&self, token: &RunToken, report: &RunReport) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE crawl_runs
                 SET finished_at = ?1, pages_ok = ?2, pages_failed = ?3, success = ?4
                 WHERE id = ?5",
                params![
                    now.as_str(),
                    report.pages_ok as i64,
                    report.pages_failed as i64,
                    i64::from(report.success),
                    token.0.as_str(),
                ],
            )
            .await
            .map_err(|e| SiteCrawlError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Get a crawl run by token.
    pub async fn get_run(&self, token: &RunToken) -> Result<Option<RunRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, action, tenant_id, started_at, finished_at, pages_ok, pages_failed, success
                 FROM crawl_runs WHERE id = ?1",
                params![token.0.as_str()],
            )
            .await
            .map_err(|e| SiteCrawlError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(RunRecord {
                token: RunToken(
                    row.get::<String>(0)
                        .map_err(|e| SiteCrawlError::Storage(e.to_string()))?,
                ),
                action: row
                    .get::<String>(1)
                    .map_err(|e| SiteCrawlError::Storage(e.to_string()))?,
                tenant_id: row
                    .get::<String>(2)
                    .map_err(|e| SiteCrawlError::Storage(e.to_string()))?,
                started_at: row
                    .get::<String>(3)
                    .map_err(|e| SiteCrawlError::Storage(e.to_string()))?,
                finished_at: row.get::<String>(4).ok(),
                pages_ok: row.get::<i64>(5).ok().map(|v| v as usize),
                pages_failed: row.get::<i64>(6).ok().map(|v| v as usize),
                success: row.get::<i64>(7).ok().map(|v| v != 0),
            })),
            Ok(None) => Ok(None),
            Err(e) => Err(SiteCrawlError::Storage(e.to_string())),
        }
    }
}

/// A persisted page row.
#[derive(Debug, Clone)]
pub struct StoredPage {
    pub id: String,
    pub site_id: SiteId,
    pub url: String,
    /// Newline-separated summary phrases.
    pub summary: String,
    pub content: String,
    /// SHA-256 of `content`, hex encoded.
    pub content_hash: String,
    pub is_internal: bool,
    pub internal_links: String,
    pub external_links: String,
    pub updated_at: String,
}

/// A crawl run row. Completion fields stay `None` until the run finishes.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub token: RunToken,
    pub action: String,
    pub tenant_id: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub pages_ok: Option<usize>,
    pub pages_failed: Option<usize>,
    pub success: Option<bool>,
}

/// Hex SHA-256 of page content.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn row_to_site(row: &libsql::Row) -> Result<SiteRecord> {
    Ok(SiteRecord {
        id: SiteId(
            row.get::<String>(0)
                .map_err(|e| SiteCrawlError::Storage(e.to_string()))?,
        ),
        tenant_id: row
            .get::<String>(1)
            .map_err(|e| SiteCrawlError::Storage(e.to_string()))?,
        url: row
            .get::<String>(2)
            .map_err(|e| SiteCrawlError::Storage(e.to_string()))?,
    })
}

/// Convert a database row to a [`StoredPage`].
fn row_to_page(row: &libsql::Row) -> Result<StoredPage> {
    Ok(StoredPage {
        id: row
            .get::<String>(0)
            .map_err(|e| SiteCrawlError::Storage(e.to_string()))?,
        site_id: SiteId(
            row.get::<String>(1)
                .map_err(|e| SiteCrawlError::Storage(e.to_string()))?,
        ),
        url: row
            .get::<String>(2)
            .map_err(|e| SiteCrawlError::Storage(e.to_string()))?,
        summary: row
            .get::<String>(3)
            .map_err(|e| SiteCrawlError::Storage(e.to_string()))?,
        content: row
            .get::<String>(4)
            .map_err(|e| SiteCrawlError::Storage(e.to_string()))?,
        content_hash: row
            .get::<String>(5)
            .map_err(|e| SiteCrawlError::Storage(e.to_string()))?,
        is_internal: row
            .get::<i64>(6)
            .map_err(|e| SiteCrawlError::Storage(e.to_string()))?
            != 0,
        internal_links: row
            .get::<String>(7)
            .map_err(|e| SiteCrawlError::Storage(e.to_string()))?,
        external_links: row
            .get::<String>(8)
            .map_err(|e| SiteCrawlError::Storage(e.to_string()))?,
        updated_at: row
            .get::<String>(9)
            .map_err(|e| SiteCrawlError::Storage(e.to_string()))?,
    })
}
