//! Two-step navigation: strict wait first, one relaxed retry, then give up.

use std::time::Duration;

use tracing::{debug, warn};
use url::Url;

use sitecrawl_shared::NavigationConfig;

use crate::session::{BrowserSession, NavigationError, OpenOptions, PageSnapshot, WaitStrategy};

/// Result of [`navigate`]. Never an error: failures are data for the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavigationOutcome {
    /// A document was delivered (possibly on the relaxed retry).
    Loaded(PageSnapshot),
    /// Both attempts ran out of time.
    TimedOut,
    /// The last attempt failed for a reason other than time.
    Failed(String),
}

/// Attempts performed by [`navigate`], in order.
fn attempts(config: &NavigationConfig) -> [OpenOptions; 2] {
    [
        OpenOptions {
            timeout: config.timeout,
            wait: WaitStrategy::NetworkIdle,
        },
        OpenOptions {
            timeout: config.relaxed_timeout,
            wait: WaitStrategy::DomParsed,
        },
    ]
}

/// Load `url` on `session`, retrying once with the relaxed wait condition.
///
/// Each attempt is bounded by its own timeout even if the session ignores it.
pub async fn navigate(
    session: &dyn BrowserSession,
    url: &Url,
    config: &NavigationConfig,
) -> NavigationOutcome {
    let mut last = NavigationError::Failed("no attempt made".into());

    for (attempt, opts) in attempts(config).into_iter().enumerate() {
        match bounded_open(session, url, opts).await {
            Ok(snapshot) => {
                if attempt > 0 {
                    debug!(%url, "loaded on relaxed retry");
                }
                return NavigationOutcome::Loaded(snapshot);
            }
            Err(NavigationError::NotDocument(kind)) => {
                debug!(%url, %kind, "not a document, not retrying");
                return NavigationOutcome::Failed(format!("not a document: {kind}"));
            }
            Err(err) => {
                warn!(%url, attempt = attempt + 1, wait = ?opts.wait, error = %err, "navigation attempt failed");
                last = err;
            }
        }
    }

    match last {
        NavigationError::Timeout(_) => NavigationOutcome::TimedOut,
        other => NavigationOutcome::Failed(other.to_string()),
    }
}

async fn bounded_open(
    session: &dyn BrowserSession,
    url: &Url,
    opts: OpenOptions,
) -> Result<PageSnapshot, NavigationError> {
    // Small grace so a session that honours its own timeout reports it first.
    let bound = opts.timeout + Duration::from_millis(250);
    match tokio::time::timeout(bound, session.open(url, opts)).await {
        Ok(result) => result,
        Err(_) => Err(NavigationError::Timeout(opts.timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    /// Plays back one scripted result per call and records the wait strategies used.
    struct Scripted {
        results: Mutex<Vec<Result<PageSnapshot, NavigationError>>>,
        waits: Mutex<Vec<WaitStrategy>>,
    }

    impl Scripted {
        fn new(mut results: Vec<Result<PageSnapshot, NavigationError>>) -> Self {
            results.reverse();
            Self {
                results: Mutex::new(results),
                waits: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl BrowserSession for Scripted {
        async fn open(
            &self,
            _url: &Url,
            opts: OpenOptions,
        ) -> Result<PageSnapshot, NavigationError> {
            self.waits.lock().unwrap().push(opts.wait);
            self.results
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(Err(NavigationError::Failed("script exhausted".into())))
        }

        async fn close(&self) {}
    }

    fn url() -> Url {
        Url::parse("https://x.com/a").unwrap()
    }

    fn snapshot() -> PageSnapshot {
        PageSnapshot {
            final_url: url(),
            html: "<p>ok</p>".into(),
            links: vec![],
        }
    }

    fn config() -> NavigationConfig {
        NavigationConfig {
            timeout: Duration::from_millis(100),
            relaxed_timeout: Duration::from_millis(200),
            user_agent: "test".into(),
        }
    }

    #[tokio::test]
    async fn first_attempt_success() {
        let session = Scripted::new(vec![Ok(snapshot())]);
        let outcome = navigate(&session, &url(), &config()).await;
        assert!(matches!(outcome, NavigationOutcome::Loaded(_)));
        assert_eq!(*session.waits.lock().unwrap(), vec![WaitStrategy::NetworkIdle]);
    }

    #[tokio::test]
    async fn timeout_then_relaxed_success() {
        let session = Scripted::new(vec![
            Err(NavigationError::Timeout(Duration::from_millis(100))),
            Ok(snapshot()),
        ]);
        let outcome = navigate(&session, &url(), &config()).await;
        assert_eq!(outcome, NavigationOutcome::Loaded(snapshot()));
        assert_eq!(
            *session.waits.lock().unwrap(),
            vec![WaitStrategy::NetworkIdle, WaitStrategy::DomParsed]
        );
    }

    #[tokio::test]
    async fn two_timeouts_give_up() {
        let session = Scripted::new(vec![
            Err(NavigationError::Timeout(Duration::from_millis(100))),
            Err(NavigationError::Timeout(Duration::from_millis(200))),
        ]);
        assert_eq!(
            navigate(&session, &url(), &config()).await,
            NavigationOutcome::TimedOut
        );
    }

    #[tokio::test]
    async fn non_documents_are_not_retried() {
        let session = Scripted::new(vec![Err(NavigationError::NotDocument("image/png".into()))]);
        let outcome = navigate(&session, &url(), &config()).await;
        assert!(matches!(outcome, NavigationOutcome::Failed(msg) if msg.contains("image/png")));
        assert_eq!(session.waits.lock().unwrap().len(), 1);
    }

    /// A session that never answers is cut off by the outer bound.
    struct Hanging;

    #[async_trait]
    impl BrowserSession for Hanging {
        async fn open(
            &self,
            _url: &Url,
            _opts: OpenOptions,
        ) -> Result<PageSnapshot, NavigationError> {
            std::future::pending().await
        }

        async fn close(&self) {}
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_session_is_bounded() {
        assert_eq!(
            navigate(&Hanging, &url(), &config()).await,
            NavigationOutcome::TimedOut
        );
    }
}
