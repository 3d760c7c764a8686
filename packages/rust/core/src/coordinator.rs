//! Worker pool coordinator.
//!
//! One control loop owns the pool of automation sessions and every active
//! job. Each iteration it applies finished tasks, reclaims workers from
//! expired batches, prunes finished jobs, then hands one task to each free
//! worker, round-robin across jobs. Worker tasks never touch job state: their
//! results come back over a channel and are applied by the loop.
//!
//! The loop is started by the first [`Coordinator::add_job`] and exits (after
//! tearing the pool down) once no job is left.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};
use url::Url;

use sitecrawl_crawler::{BrowserSession, NavigationOutcome, SessionFactory, navigate};
use sitecrawl_reducer::{extract_summary_phrases, reduce};
use sitecrawl_shared::{PageTask, PoolConfig, Result, SiteCrawlError, SiteId};

use crate::job::{FetchResult, FetchedPage, JobHandle, JobSpec, TaskReport};
use crate::store::{PageStore, RunLogger};

/// Returned by [`Coordinator::add_job`].
#[derive(Debug, Clone)]
pub struct JobTicket {
    pub job: JobHandle,
    pub site_id: SiteId,
}

/// Lifetime counters of the coordinator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Tasks handed to a worker.
    pub dispatched: u64,
    /// Workers returned to the pool (completion, revocation or teardown).
    pub released: u64,
    /// Full pool teardowns.
    pub teardowns: u64,
}

enum Command {
    Register(JobHandle),
    ForceReset,
}

#[derive(Default)]
struct Control {
    /// Present while a control loop is running.
    commands: Option<mpsc::UnboundedSender<Command>>,
    loop_task: Option<JoinHandle<()>>,
    /// When the current pool was launched; cleared by teardown.
    pool_started: Option<Instant>,
    draining: bool,
}

struct Inner {
    config: PoolConfig,
    factory: Arc<dyn SessionFactory>,
    store: Arc<dyn PageStore>,
    runs: Arc<dyn RunLogger>,
    control: Mutex<Control>,
    /// Bumped after every teardown; held callers wait on it.
    teardowns: watch::Sender<u64>,
    dispatched: AtomicU64,
    released: AtomicU64,
}

impl Inner {
    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Multiplexes a fixed pool of automation sessions across crawl jobs.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(
        config: PoolConfig,
        factory: Arc<dyn SessionFactory>,
        store: Arc<dyn PageStore>,
        runs: Arc<dyn RunLogger>,
    ) -> Self {
        let (teardowns, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                config,
                factory,
                store,
                runs,
                control: Mutex::new(Control::default()),
                teardowns,
                dispatched: AtomicU64::new(0),
                released: AtomicU64::new(0),
            }),
        }
    }

    /// Register a crawl job and start it in the background.
    ///
    /// Held while the pool is overdue for recycling. Fails with
    /// [`SiteCrawlError::Shutdown`] once [`shutdown`](Self::shutdown) was called.
    #[instrument(skip_all, fields(seed = %spec.seed_url, tenant = %spec.tenant_id))]
    pub async fn add_job(&self, spec: JobSpec) -> Result<JobTicket> {
        if self.inner.control().draining {
            return Err(SiteCrawlError::Shutdown);
        }
        self.admit().await;

        let job = JobHandle::new(&spec)?;
        let site_id = job.site_id(self.inner.store.as_ref()).await?;
        let token = self.inner.runs.log_start(&spec.action, &spec.tenant_id).await?;
        job.set_run_token(token);
        job.start();

        self.register(job.clone())?;
        info!(job = %job.id(), site = %site_id, max_depth = spec.max_depth, "job registered");
        Ok(JobTicket { job, site_id })
    }

    /// Stop admitting jobs and wait until every active job is done and the
    /// pool is torn down.
    pub async fn shutdown(&self) {
        let running = {
            let mut control = self.inner.control();
            control.draining = true;
            control.loop_task.take()
        };
        info!("coordinator draining");
        if let Some(task) = running {
            if let Err(e) = task.await {
                warn!(error = %e, "control loop ended abnormally");
            }
        }
    }

    /// Force every active job to finish and tear the pool down, as the stall
    /// watchdog would.
    pub fn force_reset(&self) {
        let control = self.inner.control();
        if let Some(commands) = &control.commands {
            let _ = commands.send(Command::ForceReset);
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            dispatched: self.inner.dispatched.load(Ordering::SeqCst),
            released: self.inner.released.load(Ordering::SeqCst),
            teardowns: *self.inner.teardowns.borrow(),
        }
    }

    /// Whether the pool has been running longer than the recycle interval.
    fn pool_overdue(&self) -> bool {
        self.inner
            .control()
            .pool_started
            .is_some_and(|started| started.elapsed() > self.inner.config.recycle_after)
    }

    /// Hold the caller until the pool has been recycled, forcing a reset once
    /// the admission ceiling has passed.
    async fn admit(&self) {
        let mut teardowns = self.inner.teardowns.subscribe();
        let deadline = Instant::now() + self.inner.config.admission_ceiling;
        let mut forced = false;

        while self.pool_overdue() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                if !forced {
                    warn!("pool still overdue at admission ceiling, forcing reset");
                    self.force_reset();
                    forced = true;
                }
                if teardowns.changed().await.is_err() {
                    return;
                }
                continue;
            }

            debug!(?remaining, "pool overdue for recycling, holding new job");
            if let Ok(Err(_)) = tokio::time::timeout(remaining, teardowns.changed()).await {
                return;
            }
        }
    }

    /// Hand `job` to the running loop, spawning one if none is running.
    fn register(&self, job: JobHandle) -> Result<()> {
        let mut control = self.inner.control();
        if control.draining {
            return Err(SiteCrawlError::Shutdown);
        }

        let job = match &control.commands {
            Some(commands) => match commands.send(Command::Register(job)) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(Command::Register(job))) => job,
                Err(_) => return Err(SiteCrawlError::Shutdown),
            },
            None => job,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(Command::Register(job));
        control.commands = Some(tx);
        control.loop_task = Some(tokio::spawn(ControlLoop::new(self.inner.clone(), rx).run()));
        debug!("control loop started");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Worker pool
// ---------------------------------------------------------------------------

struct WorkerSlot {
    session: Arc<dyn BrowserSession>,
    assigned: bool,
}

struct WorkerPool {
    slots: Vec<WorkerSlot>,
}

impl WorkerPool {
    async fn launch(factory: &dyn SessionFactory, workers: usize) -> Result<Self> {
        let mut slots = Vec::with_capacity(workers);
        for _ in 0..workers {
            match factory.launch().await {
                Ok(session) => slots.push(WorkerSlot {
                    session,
                    assigned: false,
                }),
                Err(e) => {
                    for slot in slots {
                        slot.session.close().await;
                    }
                    return Err(e);
                }
            }
        }
        Ok(Self { slots })
    }

    fn free_workers(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| !slot.assigned)
            .map(|(index, _)| index)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Control loop
// ---------------------------------------------------------------------------

type Ticket = u64;

struct InFlight {
    worker: usize,
    job: JobHandle,
    task: PageTask,
    handle: JoinHandle<()>,
}

/// Tasks dispatched in one iteration share a deadline.
struct Batch {
    deadline: Instant,
    tickets: Vec<Ticket>,
}

struct TaskDone {
    ticket: Ticket,
    report: TaskReport,
}

enum Wake {
    Tick,
    Done(Option<TaskDone>),
    Command(Option<Command>),
}

struct ControlLoop {
    inner: Arc<Inner>,
    commands: mpsc::UnboundedReceiver<Command>,
    done_tx: mpsc::UnboundedSender<TaskDone>,
    done_rx: mpsc::UnboundedReceiver<TaskDone>,
    pool: Option<WorkerPool>,
    /// Jobs still crawling (or waiting to), in registration order.
    jobs: Vec<JobHandle>,
    cursor: usize,
    tasks: HashMap<Ticket, InFlight>,
    batches: VecDeque<Batch>,
    next_ticket: Ticket,
    finalizers: JoinSet<()>,
    force_requested: bool,
    progressed: bool,
    stalled_for: Duration,
}

impl ControlLoop {
    fn new(inner: Arc<Inner>, commands: mpsc::UnboundedReceiver<Command>) -> Self {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        Self {
            inner,
            commands,
            done_tx,
            done_rx,
            pool: None,
            jobs: Vec::new(),
            cursor: 0,
            tasks: HashMap::new(),
            batches: VecDeque::new(),
            next_ticket: 0,
            finalizers: JoinSet::new(),
            force_requested: false,
            progressed: false,
            stalled_for: Duration::ZERO,
        }
    }

    #[instrument(name = "control_loop", skip_all)]
    async fn run(mut self) {
        let tick = self.inner.config.tick;
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let wake = tokio::select! {
                _ = ticker.tick() => Wake::Tick,
                done = self.done_rx.recv() => Wake::Done(done),
                command = self.commands.recv() => Wake::Command(command),
            };
            let ticked = matches!(wake, Wake::Tick);
            match wake {
                Wake::Tick => {}
                Wake::Done(Some(done)) => self.apply(done),
                Wake::Command(Some(command)) => self.handle_command(command),
                Wake::Done(None) | Wake::Command(None) => {}
            }
            while let Ok(done) = self.done_rx.try_recv() {
                self.apply(done);
            }
            while let Ok(command) = self.commands.try_recv() {
                self.handle_command(command);
            }

            if self.force_requested {
                self.force_requested = false;
                self.force_all("reset requested").await;
            }

            self.apply_cancellations();
            // Reclaims only the workers of expired batches, not every assigned worker.
            self.expire_batches();
            self.prune();

            if !self.jobs.is_empty() && self.pool.is_none() {
                self.launch_pool().await;
            }
            self.dispatch();

            if ticked {
                self.watch_for_stall(tick).await;
            }

            while let Some(joined) = self.finalizers.try_join_next() {
                if let Err(e) = joined {
                    warn!(error = %e, "job finalization panicked");
                }
            }

            if self.jobs.is_empty() && self.tasks.is_empty() {
                if self.pool.is_some() {
                    self.teardown().await;
                }
                if self.finalizers.is_empty() && self.try_exit() {
                    break;
                }
            }
        }
        debug!("control loop stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Register(job) => {
                self.jobs.push(job);
            }
            Command::ForceReset => self.force_requested = true,
        }
    }

    /// Stop the loop unless a command slipped in; decided under the control
    /// lock so `register` never sends to a loop that is about to exit.
    fn try_exit(&mut self) -> bool {
        let inner = self.inner.clone();
        let mut control = inner.control();
        match self.commands.try_recv() {
            Ok(command) => {
                drop(control);
                self.handle_command(command);
                false
            }
            Err(_) => {
                control.commands = None;
                true
            }
        }
    }

    async fn launch_pool(&mut self) {
        let workers = self.inner.config.workers;
        match WorkerPool::launch(self.inner.factory.as_ref(), workers).await {
            Ok(pool) => {
                info!(workers, "worker pool launched");
                self.inner.control().pool_started = Some(Instant::now());
                self.pool = Some(pool);
            }
            Err(e) => warn!(error = %e, "failed to launch worker pool, retrying next tick"),
        }
    }

    /// Apply one worker result and free its worker.
    fn apply(&mut self, done: TaskDone) {
        let Some(flight) = self.tasks.remove(&done.ticket) else {
            debug!(url = %done.report.task.url, "discarding result of a revoked task");
            return;
        };
        self.release(flight.worker);
        flight.job.report_result(done.report);
        self.progressed = true;
    }

    fn release(&mut self, worker: usize) {
        if let Some(slot) = self.pool.as_mut().and_then(|pool| pool.slots.get_mut(worker)) {
            if slot.assigned {
                slot.assigned = false;
                self.inner.released.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn apply_cancellations(&mut self) {
        for job in &self.jobs {
            if job.apply_cancellation() {
                info!(job = %job.id(), "job cancelled");
            }
        }
    }

    /// Revoke every task of batches past their deadline; their pages count as failed.
    fn expire_batches(&mut self) {
        let now = Instant::now();
        while self.batches.front().is_some_and(|batch| batch.deadline <= now) {
            let Some(batch) = self.batches.pop_front() else {
                break;
            };
            for ticket in batch.tickets {
                let Some(flight) = self.tasks.remove(&ticket) else {
                    continue;
                };
                warn!(url = %flight.task.url, "batch deadline exceeded, reclaiming worker");
                flight.handle.abort();
                self.release(flight.worker);
                flight.job.report_result(TaskReport {
                    task: flight.task,
                    result: FetchResult::Failed("batch deadline exceeded".into()),
                });
                self.progressed = true;
            }
        }
    }

    /// Move jobs that stopped crawling out of the active set and persist them.
    fn prune(&mut self) {
        let mut index = 0;
        while index < self.jobs.len() {
            let state = self.jobs[index].state();
            if state.is_crawling() {
                index += 1;
                continue;
            }
            let job = self.jobs.remove(index);
            if index < self.cursor {
                self.cursor -= 1;
            }
            debug!(job = %job.id(), %state, "job left the active set");
            let store = self.inner.store.clone();
            let runs = self.inner.runs.clone();
            self.finalizers.spawn(async move {
                job.finalize(store.as_ref(), runs.as_ref()).await;
            });
        }
        if self.cursor >= self.jobs.len() {
            self.cursor = 0;
        }
    }

    /// Give each free worker one task, round-robin across jobs.
    fn dispatch(&mut self) {
        let Some(pool) = self.pool.as_mut() else {
            return;
        };

        let mut tickets = Vec::new();
        for worker in pool.free_workers() {
            let count = self.jobs.len();
            let claimed = (0..count).find_map(|offset| {
                let index = (self.cursor + offset) % count;
                let job = &self.jobs[index];
                if !job.needs_work() {
                    return None;
                }
                job.claim_task().map(|task| (index, task))
            });
            let Some((index, task)) = claimed else {
                break;
            };
            self.cursor = (index + 1) % count;

            let job = self.jobs[index].clone();
            let slot = &mut pool.slots[worker];
            slot.assigned = true;
            let ticket = self.next_ticket;
            self.next_ticket += 1;

            debug!(url = %task.url, depth = task.depth, worker, "dispatching");
            let handle = tokio::spawn(fetch_page(
                self.inner.clone(),
                slot.session.clone(),
                job.seed_url().to_string(),
                task.clone(),
                ticket,
                self.done_tx.clone(),
            ));
            self.tasks.insert(
                ticket,
                InFlight {
                    worker,
                    job,
                    task,
                    handle,
                },
            );
            tickets.push(ticket);
        }

        if !tickets.is_empty() {
            self.inner
                .dispatched
                .fetch_add(tickets.len() as u64, Ordering::SeqCst);
            self.progressed = true;
            self.batches.push_back(Batch {
                deadline: Instant::now() + self.inner.config.batch_timeout,
                tickets,
            });
        }
    }

    /// Accumulate no-progress time while jobs are crawling; past the ceiling,
    /// force every job done.
    async fn watch_for_stall(&mut self, tick: Duration) {
        let crawling = self.jobs.iter().any(|job| job.state().is_crawling());
        if std::mem::take(&mut self.progressed) || !crawling {
            self.stalled_for = Duration::ZERO;
            return;
        }

        self.stalled_for += tick;
        if self.stalled_for >= self.inner.config.stall_ceiling {
            warn!(
                stalled_for = ?self.stalled_for,
                jobs = self.jobs.len(),
                in_flight = self.tasks.len(),
                "no progress, forcing all jobs done"
            );
            self.force_all("stalled").await;
        }
    }

    /// Abort all tasks, force every active job to `Completing` and tear down.
    async fn force_all(&mut self, reason: &str) {
        info!(reason, jobs = self.jobs.len(), in_flight = self.tasks.len(), "forced termination");
        for (_, flight) in self.tasks.drain() {
            flight.handle.abort();
        }
        self.batches.clear();
        for job in &self.jobs {
            job.force_complete();
        }
        self.prune();
        self.stalled_for = Duration::ZERO;
        self.teardown().await;
    }

    /// Close every session and drop the pool.
    async fn teardown(&mut self) {
        if let Some(pool) = self.pool.take() {
            let workers = pool.slots.len();
            for slot in pool.slots {
                if slot.assigned {
                    self.inner.released.fetch_add(1, Ordering::SeqCst);
                }
                slot.session.close().await;
            }
            info!(workers, "worker pool torn down");
        }
        self.inner.control().pool_started = None;
        self.inner.teardowns.send_modify(|count| *count += 1);
    }
}

/// Navigate, reduce and summarize one page, then report back to the loop.
async fn fetch_page(
    inner: Arc<Inner>,
    session: Arc<dyn BrowserSession>,
    site_base: String,
    task: PageTask,
    ticket: Ticket,
    done: mpsc::UnboundedSender<TaskDone>,
) {
    let result = match Url::parse(&task.url) {
        Err(e) => FetchResult::Failed(format!("invalid url: {e}")),
        Ok(url) => match navigate(session.as_ref(), &url, &inner.config.navigation).await {
            NavigationOutcome::Loaded(snapshot) => {
                let reduced_content = reduce(&snapshot.html, &inner.config.keep_attrs);
                let summary_phrases = if task.is_external_phase {
                    Vec::new()
                } else {
                    extract_summary_phrases(&reduced_content)
                };
                FetchResult::Page(FetchedPage {
                    final_url: snapshot.final_url,
                    raw_links: snapshot.links,
                    reduced_content,
                    summary_phrases,
                })
            }
            NavigationOutcome::TimedOut => {
                warn!(url = %task.url, site = %site_base, "page timed out twice, skipping");
                FetchResult::Failed("navigation timed out".into())
            }
            NavigationOutcome::Failed(reason) => FetchResult::Failed(reason),
        },
    };

    // The loop may already have stopped after a forced reset.
    let _ = done.send(TaskDone {
        ticket,
        report: TaskReport { task, result },
    });
}
