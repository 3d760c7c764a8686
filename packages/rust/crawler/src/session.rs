//! Automation-session seam and the HTTP-backed implementation.
//!
//! The coordinator only sees [`BrowserSession`] / [`SessionFactory`]. A session
//! loads one URL at a time and hands back the delivered markup plus the raw
//! `href` values it contains.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use scraper::{Html, Selector};
use tracing::debug;
use url::Url;

use sitecrawl_shared::{NavigationConfig, Result, SiteCrawlError};

/// How long a navigation waits before the page counts as loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStrategy {
    /// Wait until the network is quiet (strict, first attempt).
    NetworkIdle,
    /// Wait only until the markup has been parsed (relaxed retry).
    DomParsed,
}

/// Options for a single navigation attempt.
#[derive(Debug, Clone, Copy)]
pub struct OpenOptions {
    pub timeout: Duration,
    pub wait: WaitStrategy,
}

/// Rendered document delivered by a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSnapshot {
    /// URL after redirects.
    pub final_url: Url,
    /// Document markup.
    pub html: String,
    /// Raw `href` values, unresolved.
    pub links: Vec<String>,
}

/// Why a navigation attempt produced no document.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NavigationError {
    #[error("navigation timed out after {0:?}")]
    Timeout(Duration),

    #[error("navigation failed: {0}")]
    Failed(String),

    /// The response was an asset (image, font, ...) and was aborted.
    #[error("not a document: {0}")]
    NotDocument(String),
}

/// One reusable automation session ("worker").
#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// Load `url` and return the document snapshot.
    async fn open(
        &self,
        url: &Url,
        opts: OpenOptions,
    ) -> std::result::Result<PageSnapshot, NavigationError>;

    /// Terminate the session and release its resources.
    async fn close(&self);
}

/// Creates sessions for the worker pool.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn launch(&self) -> Result<Arc<dyn BrowserSession>>;
}

// ---------------------------------------------------------------------------
// HTTP session
// ---------------------------------------------------------------------------

/// Launches [`HttpSession`]s sharing one connection pool.
pub struct HttpSessionFactory {
    client: Client,
}

impl HttpSessionFactory {
    /// Build the shared HTTP client.
    pub fn new(config: &NavigationConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| SiteCrawlError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SessionFactory for HttpSessionFactory {
    async fn launch(&self) -> Result<Arc<dyn BrowserSession>> {
        Ok(Arc::new(HttpSession {
            client: self.client.clone(),
        }))
    }
}

/// Session that fetches markup over plain HTTP.
///
/// Both wait strategies resolve once the full body is read; the strategy only
/// changes the time budget supplied by the caller.
pub struct HttpSession {
    client: Client,
}

#[async_trait]
impl BrowserSession for HttpSession {
    async fn open(
        &self,
        url: &Url,
        opts: OpenOptions,
    ) -> std::result::Result<PageSnapshot, NavigationError> {
        debug!(%url, wait = ?opts.wait, "opening page");

        let response = self
            .client
            .get(url.as_str())
            .timeout(opts.timeout)
            .send()
            .await
            .map_err(|e| classify(e, opts.timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(NavigationError::Failed(format!("{url}: HTTP {status}")));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("text/html")
            .to_ascii_lowercase();
        if !is_document_type(&content_type) {
            return Err(NavigationError::NotDocument(content_type));
        }

        let final_url = response.url().clone();
        let html = response
            .text()
            .await
            .map_err(|e| classify(e, opts.timeout))?;
        let links = extract_links(&html);

        Ok(PageSnapshot {
            final_url,
            html,
            links,
        })
    }

    async fn close(&self) {}
}

fn classify(err: reqwest::Error, timeout: Duration) -> NavigationError {
    if err.is_timeout() {
        NavigationError::Timeout(timeout)
    } else {
        NavigationError::Failed(err.to_string())
    }
}

/// Document-ish content types; everything else is aborted like a blocked asset.
fn is_document_type(content_type: &str) -> bool {
    content_type.starts_with("text/html")
        || content_type.starts_with("application/xhtml")
        || content_type.starts_with("text/plain")
}

/// Collect raw `href` values from the markup, skipping pure fragments.
pub fn extract_links(html: &str) -> Vec<String> {
    static LINK_SEL: LazyLock<Selector> =
        LazyLock::new(|| Selector::parse("a[href]").expect("valid selector"));

    let doc = Html::parse_document(html);
    doc.select(&LINK_SEL)
        .filter_map(|el| el.value().attr("href"))
        .map(str::trim)
        .filter(|href| !href.is_empty() && !href.starts_with('#'))
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn opts() -> OpenOptions {
        OpenOptions {
            timeout: Duration::from_secs(5),
            wait: WaitStrategy::NetworkIdle,
        }
    }

    async fn session() -> Arc<dyn BrowserSession> {
        let factory = HttpSessionFactory::new(&NavigationConfig {
            timeout: Duration::from_secs(5),
            relaxed_timeout: Duration::from_secs(10),
            user_agent: "sitecrawl-test".into(),
        })
        .unwrap();
        factory.launch().await.unwrap()
    }

    #[test]
    fn extract_links_skips_anchors() {
        let html = r##"<html><body>
            <a href="/page2">Page 2</a>
            <a href="https://external.com">External</a>
            <a href="#section">Anchor</a>
            <a href="  relative/path ">Relative</a>
            <a>No href</a>
        </body></html>"##;
        let links = extract_links(html);
        assert_eq!(links, vec!["/page2", "https://external.com", "relative/path"]);
    }

    #[tokio::test]
    async fn open_returns_markup_and_links() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html; charset=utf-8")
                    .set_body_string(r#"<html><body><h1>Home</h1><a href="/about">About</a></body></html>"#),
            )
            .mount(&server)
            .await;

        let url = Url::parse(&server.uri()).unwrap();
        let snapshot = session().await.open(&url, opts()).await.unwrap();
        assert!(snapshot.html.contains("<h1>Home</h1>"));
        assert_eq!(snapshot.links, vec!["/about"]);
    }

    #[tokio::test]
    async fn open_aborts_non_documents() {
        let server = MockServer::start().await;
        Mock::given(path("/logo"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/png")
                    .set_body_bytes(vec![0x89, 0x50, 0x4e, 0x47]),
            )
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/logo", server.uri())).unwrap();
        let err = session().await.open(&url, opts()).await.unwrap_err();
        assert_eq!(err, NavigationError::NotDocument("image/png".into()));
    }

    #[tokio::test]
    async fn open_reports_http_errors() {
        let server = MockServer::start().await;
        Mock::given(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/missing", server.uri())).unwrap();
        let err = session().await.open(&url, opts()).await.unwrap_err();
        assert!(matches!(err, NavigationError::Failed(msg) if msg.contains("404")));
    }

    #[tokio::test]
    async fn open_times_out() {
        let server = MockServer::start().await;
        Mock::given(path("/slow"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("<p>late</p>")
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/slow", server.uri())).unwrap();
        let short = OpenOptions {
            timeout: Duration::from_millis(50),
            wait: WaitStrategy::NetworkIdle,
        };
        let err = session().await.open(&url, short).await.unwrap_err();
        assert_eq!(err, NavigationError::Timeout(Duration::from_millis(50)));
    }
}
