//! The top-level loop of a crawl.
//!
//! The engine moves requests from the [`Scheduler`] into the [`Downloader`],
//! routes every fetch outcome either back into the scheduler or into the
//! [`Scraper`], and decides when the crawl is over.
//!
//! Each tick of the main loop:
//! 1. picks up a pending close request from the [`ControlHandle`](crate::state::ControlHandle);
//! 2. admits work with `next_request`, unless paused or backing out;
//! 3. sleeps for `tick_interval`;
//! 4. checks for idleness and closes with `"finished"` once idle, unvetoed,
//!    out of seeds and out of pending requests.
//!
//! Completion of every fetch also calls `next_request`, which keeps the
//! downloader saturated between ticks.

use crate::crawler::CrawlContext;
use crate::crawler::scraper::{ScrapeInput, Scraper};
use crate::downloader::{Downloader, DownloaderOutput};
use crate::error::SpiderError;
use crate::request::Request;
use crate::response::FetchOutcome;
use crate::scheduler::Scheduler;
use crate::signals::{Signal, SignalData, vetoed};
use crate::spider::Spider;
use crate::state::{CrawlerState, EngineStatus};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use kanal::AsyncReceiver;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// The lazy sequence of start requests.
pub type SeedStream = BoxStream<'static, Result<Request, SpiderError>>;

const FINISHED: &str = "finished";
const ENGINE_ERROR: &str = "engine_error";

pub struct Engine<S: Spider> {
    ctx: Arc<CrawlContext>,
    state: CrawlerState,
    scheduler: Arc<Scheduler>,
    downloader: Arc<Downloader>,
    scraper: Arc<Scraper<S>>,
    /// Single-flight gate of the seed reader; `None` once exhausted.
    seeds: tokio::sync::Mutex<Option<SeedStream>>,
    seeds_exhausted: AtomicBool,
    /// Only one scheduler drain runs at a time.
    drain_gate: tokio::sync::Mutex<()>,
    output: Mutex<Option<AsyncReceiver<DownloaderOutput>>>,
    router: Mutex<Option<JoinHandle<()>>>,
    last_pause_log: Mutex<Option<Instant>>,
}

impl<S: Spider> Engine<S> {
    pub fn new(
        ctx: Arc<CrawlContext>,
        scheduler: Arc<Scheduler>,
        downloader: Arc<Downloader>,
        scraper: Arc<Scraper<S>>,
        output: AsyncReceiver<DownloaderOutput>,
    ) -> Arc<Self> {
        Arc::new(Engine {
            ctx,
            state: CrawlerState::new(),
            scheduler,
            downloader,
            scraper,
            seeds: tokio::sync::Mutex::new(None),
            seeds_exhausted: AtomicBool::new(false),
            drain_gate: tokio::sync::Mutex::new(()),
            output: Mutex::new(Some(output)),
            router: Mutex::new(None),
            last_pause_log: Mutex::new(None),
        })
    }

    pub fn state(&self) -> &CrawlerState {
        &self.state
    }

    pub fn status(&self) -> EngineStatus {
        self.state.status()
    }

    /// Runs the crawl to completion and returns the finish reason.
    ///
    /// An engine runs once; a second call fails.
    pub async fn run(self: &Arc<Self>, seeds: SeedStream) -> Result<String, SpiderError> {
        self.open(seeds).await?;

        let tick = self.ctx.config.tick_interval;
        loop {
            if let Some(reason) = self.ctx.control.take_close_request() {
                self.close_spider(&reason).await;
                break;
            }

            if self.state.is_running() {
                if let Err(e) = self.next_request().await {
                    error!("Engine loop failed: {}", e);
                    self.close_spider(ENGINE_ERROR).await;
                    break;
                }
            }

            tokio::time::sleep(tick).await;

            if self.state.is_running() {
                match self.idle_close_reason().await {
                    Ok(Some(reason)) => {
                        self.close_spider(reason).await;
                        break;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!("Idle check failed: {}", e);
                        self.close_spider(ENGINE_ERROR).await;
                        break;
                    }
                }
            }

            if self.state.is_closed() {
                break;
            }
        }

        Ok(self
            .ctx
            .stats
            .finish_reason()
            .unwrap_or_else(|| FINISHED.to_string()))
    }

    async fn open(self: &Arc<Self>, seeds: SeedStream) -> Result<(), SpiderError> {
        if !self.state.transition(EngineStatus::Idle, EngineStatus::Running) {
            return Err(SpiderError::General(
                "the engine has already been started".to_string(),
            ));
        }
        info!(
            "Engine starting: concurrent_requests={}, concurrent_requests_per_domain={}, scraper_concurrency={}",
            self.ctx.config.concurrent_requests,
            self.ctx.config.concurrent_requests_per_domain,
            self.ctx.config.scraper_concurrency
        );
        self.ctx
            .fire(Signal::EngineStarted, SignalData::default())
            .await;

        *self.seeds.lock().await = Some(seeds);
        self.downloader.open().await;
        self.scraper.open().await;
        self.spawn_router()?;

        self.ctx
            .fire(Signal::SpiderOpened, SignalData::default())
            .await;
        Ok(())
    }

    fn spawn_router(self: &Arc<Self>) -> Result<(), SpiderError> {
        let output = self.output.lock().take().ok_or_else(|| {
            SpiderError::General("downloader output is already routed".to_string())
        })?;
        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while let Ok((outcome, request)) = output.recv().await {
                engine.handle_downloader_output(outcome, request).await;
            }
            trace!("Downloader output channel closed");
        });
        *self.router.lock() = Some(handle);
        Ok(())
    }

    fn needs_backout(&self) -> bool {
        self.downloader.needs_backout() || self.scraper.needs_backout()
    }

    /// Admits as much work as the downloader and the scraper accept.
    pub async fn next_request(&self) -> Result<(), SpiderError> {
        if !self.state.is_running() || self.paused() {
            return Ok(());
        }

        if !self.seeds_exhausted.load(Ordering::SeqCst) && !self.needs_backout() {
            self.schedule_next_seed().await?;
        }

        let Ok(_gate) = self.drain_gate.try_lock() else {
            trace!("A scheduler drain is already running");
            return Ok(());
        };
        let batch_size = self.ctx.config.dequeue_batch();
        while !self.needs_backout() {
            let mut batch = self.scheduler.dequeue(batch_size);
            let mut admitted = 0usize;
            while !self.needs_backout() {
                // Held across the poll: a request can sit in the dupe filter
                // after leaving the queue and before reaching the downloader.
                let reserved = self.state.reserve();
                let Some(request) = batch.next().await else {
                    break;
                };
                reserved.keep();
                self.admit(request).await;
                admitted += 1;
            }
            if admitted < batch_size {
                break;
            }
        }
        Ok(())
    }

    async fn schedule_next_seed(&self) -> Result<(), SpiderError> {
        let Ok(mut seeds) = self.seeds.try_lock() else {
            return Ok(());
        };
        let Some(stream) = seeds.as_mut() else {
            return Ok(());
        };
        let next = stream.next().await;
        match next {
            Some(Ok(request)) => {
                trace!("Scheduling start request <{}>", request.url);
                self.scheduler.enqueue(request).await?;
            }
            Some(Err(e)) => error!("Failed to create a start request: {}", e),
            None => {
                *seeds = None;
                self.seeds_exhausted.store(true, Ordering::SeqCst);
                debug!("Start requests exhausted");
            }
        }
        Ok(())
    }

    /// Hands a request to the downloader; its `in_progress` unit is already held.
    async fn admit(&self, request: Request) {
        self.ctx
            .fire_if_connected(Signal::RequestReachedDownloader, || {
                SignalData::request(&request)
            })
            .await;
        self.downloader.fetch(request);
    }

    fn paused(&self) -> bool {
        let Some(until) = self.ctx.control.paused_until() else {
            return false;
        };
        let now = Instant::now();
        let mut last = self.last_pause_log.lock();
        let due = last.is_none_or(|logged| {
            now.saturating_duration_since(logged) >= self.ctx.config.pause_log_interval
        });
        if due {
            info!(
                "Spider paused, resuming in {:?}",
                until.saturating_duration_since(now)
            );
            *last = Some(now);
        }
        true
    }

    /// Routes one fetch outcome and tries to admit more work.
    pub async fn handle_downloader_output(&self, outcome: FetchOutcome, request: Request) {
        match outcome {
            FetchOutcome::Request(next) => {
                debug!("Rescheduling <{}> in place of <{}>", next.url, request.url);
                self.ctx.stats.increment_requests_rescheduled();
                if let Err(e) = self.scheduler.enqueue(next).await {
                    error!("Failed to reschedule a request for <{}>: {}", request.url, e);
                }
            }
            FetchOutcome::Response(response) => {
                response.attach_request(request.clone());
                debug!("Crawled ({}) <{}>", response.status, response.url);
                self.ctx.stats.increment_responses_received();
                let response = Arc::new(response);
                self.ctx
                    .fire_if_connected(Signal::ResponseReceived, || {
                        SignalData::request(&request).with_response(Arc::clone(&response))
                    })
                    .await;
                self.scraper
                    .enqueue_scrape(ScrapeInput::Response(response), request);
            }
            FetchOutcome::Error(e) => {
                self.scraper.enqueue_scrape(ScrapeInput::Failure(e), request);
            }
        }

        self.state.in_progress.fetch_sub(1, Ordering::SeqCst);
        if let Err(e) = self.next_request().await {
            error!("Failed to admit more work: {}", e);
        }
    }

    /// Nothing downloading, routing or scraping.
    pub fn is_idle(&self) -> bool {
        self.downloader.active_count() == 0
            && self.state.in_progress() == 0
            && self.scraper.is_idle()
    }

    async fn idle_close_reason(&self) -> Result<Option<&'static str>, SpiderError> {
        if !self.is_idle() {
            return Ok(None);
        }

        let results = self
            .ctx
            .fire(Signal::SpiderIdle, SignalData::default())
            .await;
        if vetoed(&results) {
            debug!("Closing on idle vetoed by a signal handler");
            return Ok(None);
        }
        if self.ctx.control.close_requested() || !self.seeds_exhausted.load(Ordering::SeqCst) {
            return Ok(None);
        }
        if self.scheduler.has_pending().await? {
            return Ok(None);
        }

        tokio::time::sleep(self.ctx.config.idle_confirm_delay).await;
        if !self.is_idle() || self.scheduler.has_pending().await? {
            return Ok(None);
        }
        Ok(Some(FINISHED))
    }

    /// Drains in-flight work and closes every component, in order.
    async fn close_spider(&self, reason: &str) {
        if !self
            .state
            .transition(EngineStatus::Running, EngineStatus::Draining)
        {
            warn!("Close ({}) requested while {:?}", reason, self.status());
            return;
        }
        info!("Closing spider ({})", reason);

        while !self.is_idle() {
            tokio::task::yield_now().await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        if let Err(e) = self.downloader.close().await {
            error!("Error closing downloader: {}", e);
        }
        let router = self.router.lock().take();
        if let Some(router) = router {
            if let Err(e) = router.await {
                error!("Downloader output router failed: {}", e);
            }
        }
        if let Err(e) = self.scraper.close().await {
            error!("Error closing scraper: {}", e);
        }
        if let Err(e) = self.scheduler.close().await {
            error!("Error closing scheduler: {}", e);
        }

        self.ctx.stats.set_finish_reason(reason);
        self.ctx
            .fire(Signal::SpiderClosed, SignalData::reason(reason))
            .await;
        self.ctx
            .fire(Signal::EngineStopped, SignalData::reason(reason))
            .await;
        self.state
            .transition(EngineStatus::Draining, EngineStatus::Closed);
        info!("Spider closed ({})\n{}", reason, self.ctx.stats);
    }
}
