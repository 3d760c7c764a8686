//! Link canonicalization and internal/external partitioning.
//!
//! A canonical URL is the identity key for a page within a job: resolved
//! against its base, http(s) only, with no fragment, no query, no trailing
//! slash and no leading `www.` on the host.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use url::Url;

/// Errors produced while canonicalizing a raw href.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    /// The href could not be resolved into a URL.
    #[error("invalid link {href:?}: {reason}")]
    Invalid { href: String, reason: String },

    /// The href uses a scheme other than http/https (mailto:, javascript:, ...).
    #[error("unsupported scheme {0:?}")]
    UnsupportedScheme(String),

    /// The resolved URL has no host.
    #[error("link has no host: {0}")]
    MissingHost(String),
}

/// File extensions that are never crawlable documents.
static BINARY_EXT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\.(pdf|png|jpe?g|gif|webp|svg|ico|bmp|tiff?|docx?|xlsx?|pptx?|odt|ods|odp|rtf|zip|rar|7z|tar|gz|tgz|bz2|xz|dmg|exe|msi|apk|mp3|mp4|avi|mov|wav|woff2?|ttf|eot)$",
    )
    .expect("valid regex")
});

/// Canonicalize `raw_href` relative to `base`.
///
/// Strips, in order: fragment, query, one trailing slash, leading `www.`.
pub fn canonicalize(raw_href: &str, base: &Url) -> Result<String, LinkError> {
    let href = raw_href.trim();
    let mut url = base.join(href).map_err(|e| LinkError::Invalid {
        href: href.to_string(),
        reason: e.to_string(),
    })?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(LinkError::UnsupportedScheme(url.scheme().to_string()));
    }

    url.set_fragment(None);
    url.set_query(None);

    let host = url
        .host_str()
        .ok_or_else(|| LinkError::MissingHost(url.to_string()))?
        .to_string();
    if let Some(bare) = host.strip_prefix("www.") {
        if !bare.is_empty() {
            url.set_host(Some(bare)).map_err(|e| LinkError::Invalid {
                href: href.to_string(),
                reason: e.to_string(),
            })?;
        }
    }

    let mut canonical = url.to_string();
    if canonical.ends_with('/') {
        canonical.pop();
    }
    Ok(canonical)
}

/// Canonicalize an absolute URL string (a seed or a site base).
pub fn canonicalize_absolute(raw: &str) -> Result<String, LinkError> {
    let url = Url::parse(raw.trim()).map_err(|e| LinkError::Invalid {
        href: raw.to_string(),
        reason: e.to_string(),
    })?;
    canonicalize(url.as_str(), &url)
}

/// Whether `url` belongs to the site rooted at `site_base`.
///
/// Compares scheme, host (modulo `www.`) and port after canonicalizing both sides.
pub fn is_internal(url: &str, site_base: &str) -> bool {
    match (origin_of(url), origin_of(site_base)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Whether the URL path ends with a binary-document extension.
pub fn is_binary_resource(url: &str) -> bool {
    match Url::parse(url) {
        Ok(parsed) => BINARY_EXT_RE.is_match(parsed.path()),
        Err(_) => BINARY_EXT_RE.is_match(url),
    }
}

/// Canonical scheme + host + port of an absolute URL.
fn origin_of(raw: &str) -> Option<String> {
    let canonical = canonicalize_absolute(raw).ok()?;
    let url = Url::parse(&canonical).ok()?;
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}://{host}:{port}", url.scheme()),
        None => format!("{}://{host}", url.scheme()),
    })
}

// ---------------------------------------------------------------------------
// Partitioning
// ---------------------------------------------------------------------------

/// Links found on one page, split by site membership.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionedLinks {
    /// Canonical same-site links, first-seen order, deduplicated.
    pub internal: Vec<String>,
    /// Canonical off-site links, first-seen order, deduplicated.
    pub external: Vec<String>,
}

impl PartitionedLinks {
    /// Internal links joined for storage.
    pub fn internal_raw(&self) -> String {
        self.internal.join("\n")
    }

    /// External links joined for storage.
    pub fn external_raw(&self) -> String {
        self.external.join("\n")
    }
}

/// Canonicalize every raw href found on `page_url` and split them against `site_base`.
///
/// Unparseable hrefs, non-http(s) schemes and binary documents are dropped.
pub fn partition_links(raw_hrefs: &[String], page_url: &Url, site_base: &str) -> PartitionedLinks {
    let mut seen = HashSet::new();
    let mut links = PartitionedLinks::default();

    for href in raw_hrefs {
        let Ok(canonical) = canonicalize(href, page_url) else {
            continue;
        };
        if is_binary_resource(&canonical) || !seen.insert(canonical.clone()) {
            continue;
        }
        if is_internal(&canonical, site_base) {
            links.internal.push(canonical);
        } else {
            links.external.push(canonical);
        }
    }

    links
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://www.x.com/docs/").unwrap()
    }

    #[test]
    fn strips_fragment_query_and_trailing_slash() {
        let base = Url::parse("http://x.com").unwrap();
        assert_eq!(canonicalize("http://x.com/a?q=1#f", &base).unwrap(), "http://x.com/a");
        assert_eq!(canonicalize("/a/", &base).unwrap(), "http://x.com/a");
        assert_eq!(canonicalize("/", &base).unwrap(), "http://x.com");
    }

    #[test]
    fn differently_formatted_hrefs_collapse() {
        let page = Url::parse("https://x.com/start").unwrap();
        let variants = ["/a", "/a/", "https://www.x.com/a#frag", "a?utm_source=mail"];
        let keys: HashSet<String> = variants
            .iter()
            .map(|href| canonicalize(href, &page).unwrap())
            .collect();
        assert_eq!(keys.len(), 1);
        assert!(keys.contains("https://x.com/a"));
    }

    #[test]
    fn resolves_relative_links() {
        assert_eq!(
            canonicalize("guide/intro", &base()).unwrap(),
            "https://x.com/docs/guide/intro"
        );
        assert_eq!(canonicalize("../blog", &base()).unwrap(), "https://x.com/blog");
    }

    #[test]
    fn rejects_non_http_schemes() {
        assert!(matches!(
            canonicalize("mailto:hi@x.com", &base()),
            Err(LinkError::UnsupportedScheme(s)) if s == "mailto"
        ));
        assert!(canonicalize("javascript:void(0)", &base()).is_err());
        assert!(canonicalize("ftp://x.com/file", &base()).is_err());
    }

    #[test]
    fn partition_table() {
        let cases = [
            ("http://www.x.com/a", "http://x.com", true),
            ("http://y.com/a", "http://x.com", false),
            ("http://x.com/a?q=1#f", "http://www.x.com", true),
            ("http://x.com:8080/a", "http://x.com", false),
            ("http://blog.x.com/a", "http://x.com", false),
        ];
        for (href, site, expected) in cases {
            let canonical = canonicalize_absolute(href).unwrap();
            assert_eq!(is_internal(&canonical, site), expected, "{href} vs {site}");
        }
    }

    #[test]
    fn binary_documents_are_detected() {
        assert!(is_binary_resource("https://x.com/files/report.PDF"));
        assert!(is_binary_resource("https://x.com/img/logo.png"));
        assert!(!is_binary_resource("https://x.com/pricing"));
        assert!(!is_binary_resource("https://x.com/docs/page.html"));
    }

    #[test]
    fn partition_links_dedups_and_drops_binaries() {
        let page = Url::parse("https://x.com/").unwrap();
        let raw: Vec<String> = [
            "/about",
            "/about/",
            "https://www.x.com/about#team",
            "/brochure.pdf",
            "https://partner.io/",
            "https://partner.io",
            "mailto:sales@x.com",
            "http://[bad",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let links = partition_links(&raw, &page, "https://x.com");
        assert_eq!(links.internal, vec!["https://x.com/about"]);
        assert_eq!(links.external, vec!["https://partner.io"]);
        assert_eq!(links.internal_raw(), "https://x.com/about");
    }
}
