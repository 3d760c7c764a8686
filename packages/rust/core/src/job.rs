//! Per-crawl breadth-first traversal state machine.
//!
//! ```text
//! Initializing ─seed─▶ Crawling ─drained─▶ ExternalPhase ─drained─▶ Completing ─persisted─▶ Done
//!                          └──────── cancelled / forced ───────────────▲
//! ```
//!
//! [`CrawlJob`] is plain data mutated only by the coordinator's control loop
//! (dispatch and completion callbacks). Callers hold a [`JobHandle`] and only
//! read from it, or request cancellation through a flag the loop picks up.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use tokio::sync::{OnceCell, watch};
use tracing::{debug, info, instrument, warn};
use url::Url;

use sitecrawl_crawler::{canonicalize_absolute, partition_links};
use sitecrawl_reducer::remove_boilerplate;
use sitecrawl_shared::{
    CompletedPage, JobDefaults, JobId, JobState, PageTask, Result, RunReport, RunToken,
    SiteCrawlError, SiteId,
};

use crate::store::{PageStore, RunLogger};

// ---------------------------------------------------------------------------
// Job parameters
// ---------------------------------------------------------------------------

/// What to crawl and on whose behalf.
#[derive(Debug, Clone)]
pub struct JobSpec {
    /// Start URL; also identifies the site.
    pub seed_url: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Maximum link distance from the seed.
    pub max_depth: u32,
    /// Advisory cap on internal pages.
    pub max_pages: usize,
    /// Label recorded in the run log.
    pub action: String,
}

impl JobSpec {
    /// A `scrape` job with the configured default bounds.
    pub fn new(seed_url: impl Into<String>, tenant_id: impl Into<String>, defaults: JobDefaults) -> Self {
        Self {
            seed_url: seed_url.into(),
            tenant_id: tenant_id.into(),
            max_depth: defaults.max_depth,
            max_pages: defaults.max_pages,
            action: "scrape".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Task results
// ---------------------------------------------------------------------------

/// A page delivered by a worker, already reduced off the control loop.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// URL after redirects; relative links resolve against it.
    pub final_url: Url,
    /// Raw `href` values.
    pub raw_links: Vec<String>,
    pub reduced_content: String,
    /// Empty for external-phase pages.
    pub summary_phrases: Vec<String>,
}

/// Outcome of one page fetch.
#[derive(Debug, Clone)]
pub enum FetchResult {
    Page(FetchedPage),
    Failed(String),
}

/// What a worker hands back for the task it was given.
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub task: PageTask,
    pub result: FetchResult,
}

/// Point-in-time counters for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobProgress {
    pub state: JobState,
    pub queued: usize,
    pub in_flight: usize,
    pub completed: usize,
    pub failed: usize,
    /// External links collected but not yet scheduled.
    pub external_pending: usize,
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Pending tasks bucketed by depth. Pops the shallowest, FIFO within a depth.
#[derive(Debug, Default)]
struct TaskQueue {
    buckets: BTreeMap<u32, VecDeque<PageTask>>,
    len: usize,
}

impl TaskQueue {
    fn push(&mut self, task: PageTask) {
        self.buckets.entry(task.depth).or_default().push_back(task);
        self.len += 1;
    }

    fn pop(&mut self) -> Option<PageTask> {
        let mut bucket = self.buckets.first_entry()?;
        let task = bucket.get_mut().pop_front();
        if bucket.get().is_empty() {
            bucket.remove();
        }
        if task.is_some() {
            self.len -= 1;
        }
        task
    }

    fn len(&self) -> usize {
        self.len
    }

    fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn clear(&mut self) {
        self.buckets.clear();
        self.len = 0;
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Traversal state of one crawl.
#[derive(Debug)]
pub struct CrawlJob {
    /// Canonical seed URL, used as the site base for partitioning.
    site_base: String,
    max_depth: u32,
    max_pages: usize,
    state: JobState,
    queue: TaskQueue,
    in_flight: HashSet<String>,
    /// Every URL ever queued; never re-enqueued once present.
    visited: HashSet<String>,
    /// Collected external links, first-seen order.
    external_links: Vec<String>,
    external_seen: HashSet<String>,
    completed: Vec<CompletedPage>,
    failed: Vec<String>,
    /// Monotonic count of recorded pages; survives the final clear.
    pages_ok: usize,
    pages_failed: usize,
    external_promoted: bool,
    cancelled: bool,
    forced: bool,
}

impl CrawlJob {
    fn new(site_base: String, max_depth: u32, max_pages: usize) -> Self {
        Self {
            site_base,
            max_depth,
            max_pages: max_pages.max(1),
            state: JobState::Initializing,
            queue: TaskQueue::default(),
            in_flight: HashSet::new(),
            visited: HashSet::new(),
            external_links: Vec::new(),
            external_seen: HashSet::new(),
            completed: Vec::new(),
            failed: Vec::new(),
            pages_ok: 0,
            pages_failed: 0,
            external_promoted: false,
            cancelled: false,
            forced: false,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Queue the seed and start crawling. No-op outside `Initializing`.
    fn seed(&mut self) {
        if self.state != JobState::Initializing {
            return;
        }
        self.visited.insert(self.site_base.clone());
        self.queue.push(PageTask::internal(self.site_base.clone(), 0));
        self.state = JobState::Crawling;
    }

    /// Whether a claim would currently return a task.
    pub fn needs_work(&self) -> bool {
        self.state.is_crawling() && !self.cancelled && !self.queue.is_empty()
    }

    /// Pop the shallowest queued task and mark it in flight.
    pub fn claim_task(&mut self) -> Option<PageTask> {
        if !self.needs_work() {
            return None;
        }
        let task = self.queue.pop()?;
        self.in_flight.insert(task.url.clone());
        Some(task)
    }

    /// Record a finished task. Returns `false` for tasks this job no longer
    /// tracks (revoked, or the job was forced).
    pub fn report_result(&mut self, report: TaskReport) -> bool {
        let TaskReport { task, result } = report;
        if !self.in_flight.remove(&task.url) {
            debug!(url = %task.url, "ignoring result for a task no longer in flight");
            return false;
        }

        match result {
            FetchResult::Failed(reason) => {
                debug!(url = %task.url, %reason, "page failed");
                self.failed.push(task.url);
                self.pages_failed += 1;
            }
            FetchResult::Page(page) => self.record_page(task, page),
        }

        self.advance();
        true
    }

    fn record_page(&mut self, task: PageTask, page: FetchedPage) {
        let links = partition_links(&page.raw_links, &page.final_url, &self.site_base);

        if !task.is_external_phase && !self.cancelled {
            let next_depth = task.depth + 1;
            if next_depth <= self.max_depth {
                for url in &links.internal {
                    if self.visited.len() >= self.max_pages {
                        break;
                    }
                    if self.visited.insert(url.clone()) {
                        self.queue.push(PageTask::internal(url.clone(), next_depth));
                    }
                }
            }
            for url in &links.external {
                if self.external_seen.insert(url.clone()) {
                    self.external_links.push(url.clone());
                }
            }
        }

        debug!(url = %task.url, depth = task.depth, internal = links.internal.len(),
            external = links.external.len(), "page recorded");
        self.completed.push(CompletedPage {
            url: task.url,
            reduced_content: page.reduced_content,
            summary_phrases: if task.is_external_phase {
                Vec::new()
            } else {
                page.summary_phrases
            },
            is_internal: !task.is_external_phase,
            internal_links_raw: links.internal_raw(),
            external_links_raw: links.external_raw(),
        });
        self.pages_ok += 1;
    }

    /// Apply every transition whose condition holds.
    fn advance(&mut self) {
        loop {
            let drained = self.queue.is_empty() && self.in_flight.is_empty();
            match self.state {
                JobState::Crawling if drained && self.cancelled => {
                    self.state = JobState::Completing;
                }
                JobState::Crawling if drained => self.promote_external(),
                JobState::ExternalPhase if drained => {
                    self.state = JobState::Completing;
                }
                _ => break,
            }
        }
    }

    /// Move collected external links into the queue, exactly once.
    fn promote_external(&mut self) {
        if self.external_promoted {
            return;
        }
        self.external_promoted = true;
        let links = std::mem::take(&mut self.external_links);
        if !links.is_empty() {
            info!(site = %self.site_base, external = links.len(), "entering external phase");
        }
        for url in links {
            if self.visited.insert(url.clone()) {
                self.queue.push(PageTask::external(url));
            }
        }
        self.state = JobState::ExternalPhase;
    }

    /// Stop claiming new work. In-flight tasks still report; nothing new is
    /// queued and the external phase is skipped.
    fn cancel(&mut self) {
        if self.cancelled || !matches!(self.state, JobState::Initializing | JobState::Crawling | JobState::ExternalPhase) {
            return;
        }
        self.cancelled = true;
        self.queue.clear();
        if self.state == JobState::Initializing {
            self.state = JobState::Completing;
        }
        self.advance();
    }

    /// Abandon queued and in-flight work and go straight to `Completing`.
    fn force_complete(&mut self) {
        if matches!(self.state, JobState::Completing | JobState::Done) {
            return;
        }
        self.forced = true;
        self.queue.clear();
        self.in_flight.clear();
        self.state = JobState::Completing;
    }

    /// Drop phrases shared by several internal pages.
    fn dedupe_summaries(&mut self) -> usize {
        remove_boilerplate(
            self.completed
                .iter_mut()
                .filter(|page| page.is_internal)
                .map(|page| &mut page.summary_phrases),
        )
    }

    /// Enter `Done` and release every collection.
    fn finish(&mut self) {
        self.state = JobState::Done;
        self.queue.clear();
        self.in_flight = HashSet::new();
        self.visited = HashSet::new();
        self.external_links = Vec::new();
        self.external_seen = HashSet::new();
        self.completed = Vec::new();
        self.failed = Vec::new();
    }

    fn progress(&self) -> JobProgress {
        JobProgress {
            state: self.state,
            queued: self.queue.len(),
            in_flight: self.in_flight.len(),
            completed: self.pages_ok,
            failed: self.pages_failed,
            external_pending: self.external_links.len(),
        }
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

struct JobShared {
    id: JobId,
    seed_url: String,
    tenant_id: String,
    action: String,
    job: Mutex<CrawlJob>,
    cancel_requested: AtomicBool,
    /// Flips to `true` once, when the job reaches `Done`.
    done: watch::Sender<bool>,
    site: OnceCell<SiteId>,
    run: OnceLock<RunToken>,
}

/// Shared handle to a crawl job.
#[derive(Clone)]
pub struct JobHandle {
    shared: Arc<JobShared>,
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.shared.id)
            .field("seed_url", &self.shared.seed_url)
            .field("state", &self.state())
            .finish()
    }
}

impl JobHandle {
    /// Create an `Initializing` job. Fails if the seed is not a crawlable URL.
    pub fn new(spec: &JobSpec) -> Result<Self> {
        let seed_url = canonicalize_absolute(&spec.seed_url)
            .map_err(|e| SiteCrawlError::validation(format!("bad seed url: {e}")))?;
        let (done, _) = watch::channel(false);
        Ok(Self {
            shared: Arc::new(JobShared {
                id: JobId::new(),
                job: Mutex::new(CrawlJob::new(seed_url.clone(), spec.max_depth, spec.max_pages)),
                seed_url,
                tenant_id: spec.tenant_id.clone(),
                action: spec.action.clone(),
                cancel_requested: AtomicBool::new(false),
                done,
                site: OnceCell::new(),
                run: OnceLock::new(),
            }),
        })
    }

    pub fn id(&self) -> JobId {
        self.shared.id
    }

    /// Canonical seed URL.
    pub fn seed_url(&self) -> &str {
        &self.shared.seed_url
    }

    pub fn tenant_id(&self) -> &str {
        &self.shared.tenant_id
    }

    pub fn state(&self) -> JobState {
        self.lock().state
    }

    pub fn is_complete(&self) -> bool {
        self.state() == JobState::Done
    }

    /// Pages recorded so far. Never decreases.
    pub fn scraped_pages_count(&self) -> usize {
        self.lock().pages_ok
    }

    /// Completed pages whose URL is not in `already_seen`, in completion order.
    pub fn completed_pages_excluding(&self, already_seen: &HashSet<String>) -> Vec<CompletedPage> {
        self.lock()
            .completed
            .iter()
            .filter(|page| !already_seen.contains(&page.url))
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> JobProgress {
        self.lock().progress()
    }

    /// Ask the coordinator to stop this job early. Already-completed pages
    /// are still persisted.
    pub fn cleanup(&self) {
        if !self.shared.cancel_requested.swap(true, Ordering::SeqCst) {
            info!(job = %self.id(), "cancellation requested");
        }
    }

    /// Resolve once the job is `Done`.
    pub async fn wait(&self) {
        let mut done = self.shared.done.subscribe();
        // The sender lives as long as `self`, so this only returns once `true`.
        let _ = done.wait_for(|finished| *finished).await;
    }

    /// Site record for this job, found or created on first call.
    ///
    /// Concurrent callers wait for the first resolution instead of racing to
    /// create a second row.
    pub async fn site_id(&self, store: &dyn PageStore) -> Result<SiteId> {
        let url = self.shared.seed_url.as_str();
        let tenant = self.shared.tenant_id.as_str();
        self.shared
            .site
            .get_or_try_init(|| async move {
                if let Some(site) = store.find_site(url).await? {
                    return Ok(site.id);
                }
                debug!(%url, "creating site record");
                store.create_site(url, tenant).await
            })
            .await
            .cloned()
    }

    /// Run-log entry opened for this job by the coordinator.
    pub fn run_token(&self) -> Option<&RunToken> {
        self.shared.run.get()
    }

    pub(crate) fn set_run_token(&self, token: RunToken) {
        let _ = self.shared.run.set(token);
    }

    /// Seed the queue: `Initializing` → `Crawling`.
    pub(crate) fn start(&self) {
        self.lock().seed();
    }

    pub(crate) fn needs_work(&self) -> bool {
        self.lock().needs_work()
    }

    pub(crate) fn claim_task(&self) -> Option<PageTask> {
        self.lock().claim_task()
    }

    pub(crate) fn report_result(&self, report: TaskReport) -> bool {
        self.lock().report_result(report)
    }

    /// Apply a pending [`cleanup`](Self::cleanup) request. Returns `true` the
    /// first time it takes effect.
    pub(crate) fn apply_cancellation(&self) -> bool {
        if !self.shared.cancel_requested.load(Ordering::SeqCst) {
            return false;
        }
        let mut job = self.lock();
        if job.cancelled {
            return false;
        }
        job.cancel();
        true
    }

    pub(crate) fn force_complete(&self) {
        self.lock().force_complete();
    }

    /// Deduplicate summaries, persist every page, log the run and enter `Done`.
    ///
    /// Individual page write failures are logged and skipped.
    #[instrument(skip_all, fields(job = %self.id(), site = %self.seed_url()))]
    pub(crate) async fn finalize(&self, store: &dyn PageStore, runs: &dyn RunLogger) {
        let (pages, report) = {
            let mut job = self.lock();
            let removed = job.dedupe_summaries();
            debug!(removed, "boilerplate phrases removed");
            let report = RunReport {
                action: self.shared.action.clone(),
                tenant_id: self.shared.tenant_id.clone(),
                pages_ok: job.pages_ok,
                pages_failed: job.pages_failed,
                success: !job.forced,
            };
            (job.completed.clone(), report)
        };

        let mut persisted = 0usize;
        match self.shared.site.get() {
            Some(site_id) => {
                for page in &pages {
                    match store.upsert_page(site_id, page).await {
                        Ok(()) => persisted += 1,
                        Err(e) => warn!(url = %page.url, error = %e, "failed to persist page"),
                    }
                }
            }
            None => warn!(pages = pages.len(), "job has no site record, pages not persisted"),
        }

        if let Some(token) = self.shared.run.get() {
            if let Err(e) = runs.log_completion(token, &report).await {
                warn!(error = %e, "failed to log run completion");
            }
        }

        info!(
            pages = report.pages_ok,
            failed = report.pages_failed,
            persisted,
            success = report.success,
            "job done"
        );
        self.lock().finish();
        self.shared.done.send_replace(true);
    }

    fn lock(&self) -> MutexGuard<'_, CrawlJob> {
        self.shared.job.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use sitecrawl_shared::SiteRecord;

    fn spec(seed: &str, max_depth: u32) -> JobSpec {
        JobSpec {
            seed_url: seed.into(),
            tenant_id: "tenant".into(),
            max_depth,
            max_pages: 100,
            action: "scrape".into(),
        }
    }

    fn started(seed: &str, max_depth: u32) -> CrawlJob {
        let mut job = CrawlJob::new(canonicalize_absolute(seed).unwrap(), max_depth, 100);
        job.seed();
        job
    }

    fn page(task: &PageTask, links: &[&str], title: &str) -> TaskReport {
        TaskReport {
            task: task.clone(),
            result: FetchResult::Page(FetchedPage {
                final_url: Url::parse(&task.url).unwrap(),
                raw_links: links.iter().map(|s| s.to_string()).collect(),
                reduced_content: format!("<h1>\n  {title}\n</h1>\n"),
                summary_phrases: vec!["Home".into(), title.into()],
            }),
        }
    }

    fn failed(task: &PageTask) -> TaskReport {
        TaskReport {
            task: task.clone(),
            result: FetchResult::Failed("timed out".into()),
        }
    }

    #[test]
    fn queue_pops_shallowest_first_and_fifo_within_depth() {
        let mut queue = TaskQueue::default();
        queue.push(PageTask::internal("b1", 1));
        queue.push(PageTask::internal("a0", 0));
        queue.push(PageTask::internal("b2", 1));
        queue.push(PageTask::internal("c2", 2));
        queue.push(PageTask::internal("a1", 0));
        assert_eq!(queue.len(), 5);

        let order: Vec<String> = std::iter::from_fn(|| queue.pop()).map(|t| t.url).collect();
        assert_eq!(order, vec!["a0", "a1", "b1", "b2", "c2"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn seed_starts_crawling() {
        let job = started("https://www.x.com/", 2);
        assert_eq!(job.state(), JobState::Crawling);
        assert!(job.needs_work());
        assert!(job.visited.contains("https://x.com"));
    }

    #[test]
    fn differently_formatted_links_are_visited_once() {
        let mut job = started("https://x.com", 2);
        let root = job.claim_task().unwrap();
        job.report_result(page(&root, &["/a", "/a/", "https://www.x.com/a#frag", "a?utm=1"], "Root"));

        let a = job.claim_task().unwrap();
        assert_eq!(a.url, "https://x.com/a");
        assert_eq!(a.depth, 1);
        assert!(job.claim_task().is_none());

        // Links back to already-visited pages are not re-queued.
        job.report_result(page(&a, &["/", "/a"], "A"));
        assert!(job.claim_task().is_none());

        let urls: Vec<&str> = job.completed.iter().map(|p| p.url.as_str()).collect();
        assert_eq!(urls, vec!["https://x.com", "https://x.com/a"]);
    }

    #[test]
    fn depth_bound_is_respected() {
        let mut job = started("https://x.com", 1);
        let root = job.claim_task().unwrap();
        job.report_result(page(&root, &["/one"], "Root"));

        let one = job.claim_task().unwrap();
        assert_eq!(one.depth, 1);
        job.report_result(page(&one, &["/two"], "One"));

        assert!(!job.visited.contains("https://x.com/two"));
        assert!(job.claim_task().is_none());
        assert_eq!(job.state(), JobState::Completing);
    }

    #[test]
    fn max_pages_stops_enqueueing() {
        let mut job = CrawlJob::new("https://x.com".into(), 3, 3);
        job.seed();
        let root = job.claim_task().unwrap();
        job.report_result(page(&root, &["/a", "/b", "/c", "/d"], "Root"));
        assert_eq!(job.visited.len(), 3);
        assert_eq!(job.queue.len(), 2);
    }

    #[test]
    fn claims_move_tasks_to_in_flight() {
        let mut job = started("https://x.com", 2);
        let root = job.claim_task().unwrap();
        assert!(job.in_flight.contains(&root.url));
        job.report_result(page(&root, &["/a", "/b"], "Root"));

        let a = job.claim_task().unwrap();
        let b = job.claim_task().unwrap();
        assert_eq!(job.in_flight.len(), 2);
        assert!(!job.needs_work());

        // Mixed completion order is fine.
        job.report_result(page(&b, &[], "B"));
        assert_eq!(job.state(), JobState::Crawling);
        job.report_result(page(&a, &[], "A"));
        assert_eq!(job.state(), JobState::Completing);
    }

    #[test]
    fn external_links_are_deferred_then_promoted_once() {
        let mut job = started("https://x.com", 2);
        let root = job.claim_task().unwrap();
        job.report_result(page(
            &root,
            &["/a", "https://partner.io/x", "https://partner.io/x#top"],
            "Root",
        ));
        assert_eq!(job.external_links, vec!["https://partner.io/x"]);

        let a = job.claim_task().unwrap();
        assert!(!a.is_external_phase);
        job.report_result(page(&a, &["https://partner.io/x"], "A"));
        assert_eq!(job.state(), JobState::ExternalPhase);
        assert!(job.external_links.is_empty());

        let ext = job.claim_task().unwrap();
        assert!(ext.is_external_phase);
        assert_eq!(ext.depth, 0);
        assert_eq!(ext.url, "https://partner.io/x");

        // External pages are not expanded.
        job.report_result(page(&ext, &["/more", "https://other.io"], "Partner"));
        assert!(job.claim_task().is_none());
        assert_eq!(job.state(), JobState::Completing);
        assert!(job.external_links.is_empty());

        let ext_page = job.completed.last().unwrap();
        assert!(!ext_page.is_internal);
        assert!(ext_page.summary_phrases.is_empty());
    }

    #[test]
    fn empty_external_set_goes_straight_to_completing() {
        let mut job = started("https://x.com", 0);
        let root = job.claim_task().unwrap();
        job.report_result(page(&root, &["/a"], "Root"));
        assert!(job.external_promoted);
        assert_eq!(job.state(), JobState::Completing);
    }

    #[test]
    fn failed_page_still_drains_the_job() {
        let mut job = started("https://x.com", 1);
        let root = job.claim_task().unwrap();
        job.report_result(page(&root, &["/b", "/c"], "A"));

        let b = job.claim_task().unwrap();
        let c = job.claim_task().unwrap();
        job.report_result(failed(&b));
        job.report_result(page(&c, &[], "C"));

        assert_eq!(job.state(), JobState::Completing);
        assert_eq!(job.failed, vec!["https://x.com/b"]);
        let urls: Vec<&str> = job.completed.iter().map(|p| p.url.as_str()).collect();
        assert_eq!(urls, vec!["https://x.com", "https://x.com/c"]);
    }

    #[test]
    fn stale_reports_are_ignored() {
        let mut job = started("https://x.com", 1);
        let root = job.claim_task().unwrap();
        assert!(job.report_result(page(&root, &[], "Root")));
        assert!(!job.report_result(page(&root, &[], "Root")));
        assert_eq!(job.completed.len(), 1);
    }

    #[test]
    fn cancel_skips_external_phase() {
        let mut job = started("https://x.com", 2);
        let root = job.claim_task().unwrap();
        job.report_result(page(&root, &["/a", "/b", "https://partner.io"], "Root"));
        let a = job.claim_task().unwrap();

        job.cancel();
        assert!(job.claim_task().is_none());
        assert_eq!(job.state(), JobState::Crawling);

        job.report_result(page(&a, &["/c"], "A"));
        assert_eq!(job.state(), JobState::Completing);
        assert!(!job.external_promoted);
        assert!(!job.visited.contains("https://x.com/c"));
    }

    #[test]
    fn force_complete_abandons_in_flight_work() {
        let mut job = started("https://x.com", 2);
        let root = job.claim_task().unwrap();
        job.force_complete();
        assert_eq!(job.state(), JobState::Completing);
        assert!(job.forced);
        assert!(!job.report_result(page(&root, &[], "Root")));
    }

    #[test]
    fn boilerplate_removed_from_internal_pages_only() {
        let mut job = started("https://x.com", 1);
        let root = job.claim_task().unwrap();
        job.report_result(page(&root, &["/b", "/c"], "Unique Title"));
        let b = job.claim_task().unwrap();
        let c = job.claim_task().unwrap();
        job.report_result(page(&b, &[], "Second"));
        job.report_result(page(&c, &[], "Third"));

        assert_eq!(job.dedupe_summaries(), 1);
        for page in &job.completed {
            assert!(!page.summary_phrases.contains(&"Home".to_string()));
        }
        assert_eq!(job.completed[0].summary_phrases, vec!["Unique Title"]);
    }

    #[test]
    fn finish_releases_collections_but_keeps_counts() {
        let mut job = started("https://x.com", 1);
        let root = job.claim_task().unwrap();
        job.report_result(page(&root, &[], "Root"));
        job.finish();

        assert_eq!(job.state(), JobState::Done);
        assert!(job.completed.is_empty());
        assert!(job.visited.is_empty());
        assert_eq!(job.progress().completed, 1);
    }

    #[test]
    fn invalid_seed_is_rejected() {
        let err = JobHandle::new(&spec("mailto:hi@x.com", 1)).unwrap_err();
        assert!(matches!(err, SiteCrawlError::Validation { .. }));
    }

    #[test]
    fn handle_streams_new_pages() {
        let handle = JobHandle::new(&spec("https://x.com", 1)).unwrap();
        handle.start();
        let root = handle.claim_task().unwrap();
        handle.report_result(page(&root, &["/a"], "Root"));
        let a = handle.claim_task().unwrap();
        handle.report_result(page(&a, &[], "A"));

        let mut seen = HashSet::new();
        let first = handle.completed_pages_excluding(&seen);
        assert_eq!(first.len(), 2);
        seen.extend(first.into_iter().map(|p| p.url));
        assert!(handle.completed_pages_excluding(&seen).is_empty());
        assert_eq!(handle.scraped_pages_count(), 2);
    }

    #[test]
    fn cleanup_is_applied_once() {
        let handle = JobHandle::new(&spec("https://x.com", 1)).unwrap();
        handle.start();
        assert!(!handle.apply_cancellation());
        handle.cleanup();
        assert!(handle.apply_cancellation());
        assert!(!handle.apply_cancellation());
        assert_eq!(handle.state(), JobState::Completing);
    }

    /// Counts site creations; slow enough that concurrent callers overlap.
    #[derive(Default)]
    struct SlowSites {
        creates: AtomicUsize,
    }

    #[async_trait]
    impl PageStore for SlowSites {
        async fn find_site(&self, _url: &str) -> Result<Option<SiteRecord>> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(None)
        }

        async fn create_site(&self, _url: &str, _tenant_id: &str) -> Result<SiteId> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            Ok(SiteId("site-1".into()))
        }

        async fn upsert_page(&self, _site_id: &SiteId, _page: &CompletedPage) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn site_resolution_is_memoized() {
        let store = SlowSites::default();
        let handle = JobHandle::new(&spec("https://x.com", 1)).unwrap();

        let (a, b, c) = tokio::join!(
            handle.site_id(&store),
            handle.site_id(&store),
            handle.site_id(&store)
        );
        assert_eq!(a.unwrap(), SiteId("site-1".into()));
        assert_eq!(b.unwrap(), SiteId("site-1".into()));
        assert_eq!(c.unwrap(), SiteId("site-1".into()));
        assert_eq!(store.creates.load(Ordering::SeqCst), 1);
    }
}
