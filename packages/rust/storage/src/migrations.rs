//! SQL migration definitions for the sitecrawl database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: sites, pages, crawl_runs",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per crawled site (canonical base URL)
CREATE TABLE IF NOT EXISTS sites (
    id         TEXT PRIMARY KEY,
    tenant_id  TEXT NOT NULL,
    url        TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sites_tenant ON sites(tenant_id);

-- Reduced pages, keyed by canonical URL within a site
CREATE TABLE IF NOT EXISTS pages (
    id             TEXT PRIMARY KEY,
    site_id        TEXT NOT NULL REFERENCES sites(id) ON DELETE CASCADE,
    url            TEXT NOT NULL,
    summary        TEXT NOT NULL,
    content        TEXT NOT NULL,
    content_hash   TEXT NOT NULL,
    is_internal    INTEGER NOT NULL,
    internal_links TEXT NOT NULL,
    external_links TEXT NOT NULL,
    updated_at     TEXT NOT NULL,
    UNIQUE(site_id, url)
);

CREATE INDEX IF NOT EXISTS idx_pages_site_id ON pages(site_id);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Crawl run log",
            sql: r#"
CREATE TABLE IF NOT EXISTS crawl_runs (
    id           TEXT PRIMARY KEY,
    action       TEXT NOT NULL,
    tenant_id    TEXT NOT NULL,
    started_at   TEXT NOT NULL,
    finished_at  TEXT,
    pages_ok     INTEGER,
    pages_failed INTEGER,
    success      INTEGER
);

CREATE INDEX IF NOT EXISTS idx_crawl_runs_tenant ON crawl_runs(tenant_id);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
