//! # Downloader Module
//!
//! Admits requests into per routing key [`Slot`]s, runs the downloader
//! middleware chain and the [`Transport`] for each one, and reports every
//! outcome to the engine over a channel.
//!
//! ## Admission
//!
//! `fetch` queues the request on its slot and drains the slot:
//! - when a delay is owed, a single deferred drain is scheduled for the
//!   remaining wait and `fetch` returns at once;
//! - with a delay configured, one request is dispatched per drain and the next
//!   drain is deferred by the delay;
//! - without a delay, requests are dispatched while the slot has capacity.
//!
//! Completion of a fetch frees its slot capacity and drains the slot again
//! before the outcome is delivered.

mod slot;
mod transport;

pub use slot::Slot;
#[cfg(feature = "reqwest-transport")]
pub use transport::ReqwestTransport;
pub use transport::Transport;

use crate::crawler::CrawlContext;
use crate::error::SpiderError;
use crate::middleware::downloader::DownloaderMiddlewareManager;
use crate::request::Request;
use crate::response::FetchOutcome;
use dashmap::DashMap;
use kanal::AsyncSender;
use log::{debug, error, trace, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// What the downloader sends back for every accepted request.
pub type DownloaderOutput = (FetchOutcome, Request);

pub struct Downloader {
    ctx: Arc<CrawlContext>,
    transport: Arc<dyn Transport>,
    middleware: DownloaderMiddlewareManager,
    slots: DashMap<String, Arc<Slot>>,
    /// Requests accepted by `fetch` and not yet completed, queued ones included.
    active: AtomicUsize,
    output: AsyncSender<DownloaderOutput>,
    gc_task: Mutex<Option<JoinHandle<()>>>,
}

impl Downloader {
    pub fn new(
        ctx: Arc<CrawlContext>,
        transport: Arc<dyn Transport>,
        middleware: DownloaderMiddlewareManager,
        output: AsyncSender<DownloaderOutput>,
    ) -> Arc<Self> {
        Arc::new(Downloader {
            ctx,
            transport,
            middleware,
            slots: DashMap::new(),
            active: AtomicUsize::new(0),
            output,
            gc_task: Mutex::new(None),
        })
    }

    /// Runs the open hooks of the downloader stages and starts the slot sweep.
    pub async fn open(self: &Arc<Self>) {
        for (name, result) in self.middleware.open_spider(&self.ctx).await {
            if let Err(e) = result {
                error!("Downloader middleware '{}' failed to open: {}", name, e);
            }
        }
        self.start_slot_gc();
    }

    fn start_slot_gc(self: &Arc<Self>) {
        let downloader = Arc::downgrade(self);
        let interval = self.ctx.config.slot_gc_interval;
        let grace = self.ctx.config.slot_gc_grace;
        if interval.is_zero() {
            warn!("Slot sweep disabled: slot_gc_interval is zero");
            return;
        }

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(downloader) = downloader.upgrade() else {
                    break;
                };
                let removed = downloader.sweep_idle_slots(grace);
                if removed > 0 {
                    debug!("Reclaimed {} idle download slots", removed);
                }
            }
        });
        if let Some(previous) = self.gc_task.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Removes slots that have been idle for longer than `grace`.
    pub fn sweep_idle_slots(&self, grace: Duration) -> usize {
        let now = Instant::now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| !slot.is_reclaimable(now, grace));
        before.saturating_sub(self.slots.len())
    }

    /// Accepts a request; the outcome arrives later on the output channel.
    pub fn fetch(self: &Arc<Self>, request: Request) {
        self.active.fetch_add(1, Ordering::SeqCst);
        let key = request.routing_key();
        trace!("Admitting <{}> into slot '{}'", request.url, key);

        // Enqueue under the map entry so a concurrent sweep cannot drop the slot.
        let slot = {
            let slot = self
                .slots
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Slot::from_config(&key, &self.ctx.config)));
            slot.enqueue(request);
            Arc::clone(slot.value())
        };
        self.process_queue(&slot);
    }

    /// True while the downloader holds as many requests as it may.
    pub fn needs_backout(&self) -> bool {
        self.active_count() >= self.ctx.config.concurrent_requests
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn slot(&self, key: &str) -> Option<Arc<Slot>> {
        self.slots.get(key).map(|slot| Arc::clone(slot.value()))
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    fn process_queue(self: &Arc<Self>, slot: &Arc<Slot>) {
        let mut state = slot.state.lock();
        if state.drain_scheduled {
            return;
        }

        let now = Instant::now();
        let delay = slot.next_delay();
        if !delay.is_zero() {
            if let Some(last) = state.last_dispatch {
                let ready_at = last + delay;
                if ready_at > now {
                    state.drain_scheduled = true;
                    self.schedule_drain(slot, ready_at - now);
                    return;
                }
            }
        }

        while state.transferring < slot.concurrency() {
            let Some(request) = state.queue.pop_front() else {
                break;
            };
            state.transferring += 1;
            state.last_dispatch = Some(now);
            state.last_seen = now;

            let downloader = Arc::clone(self);
            let dispatched = Arc::clone(slot);
            tokio::spawn(async move { downloader.dispatch(dispatched, request).await });

            if !delay.is_zero() {
                if !state.queue.is_empty() {
                    state.drain_scheduled = true;
                    self.schedule_drain(slot, delay);
                }
                break;
            }
        }
    }

    fn schedule_drain(self: &Arc<Self>, slot: &Arc<Slot>, wait: Duration) {
        trace!("Slot '{}' drains again in {:?}", slot.key(), wait);
        let downloader = Arc::clone(self);
        let slot = Arc::clone(slot);
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            slot.state.lock().drain_scheduled = false;
            downloader.process_queue(&slot);
        });
    }

    async fn dispatch(self: Arc<Self>, slot: Arc<Slot>, request: Request) {
        let stats = &self.ctx.stats;
        stats.increment_requests_sent();
        debug!(
            "Fetching <{} {}> in slot '{}'",
            request.method,
            request.url,
            slot.key()
        );

        let (outcome, request) = self
            .middleware
            .download(self.transport.as_ref(), request)
            .await;

        match &outcome {
            FetchOutcome::Response(response) => {
                stats.increment_requests_succeeded();
                stats.record_response_status(response.status);
                stats.add_bytes_downloaded(response.body.len());
            }
            FetchOutcome::Error(SpiderError::IgnoreRequest(reason)) => {
                debug!("Ignored <{}>: {}", request.url, reason);
                stats.increment_requests_dropped();
            }
            FetchOutcome::Error(e) => {
                warn!("Failed to fetch <{}>: {}", request.url, e);
                stats.increment_requests_failed();
            }
            FetchOutcome::Request(next) => {
                debug!("<{}> replaced by <{}>", request.url, next.url);
            }
        }

        {
            let mut state = slot.state.lock();
            state.transferring = state.transferring.saturating_sub(1);
            state.last_seen = Instant::now();
        }
        self.process_queue(&slot);
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.output.send((outcome, request)).await.is_err() {
            warn!("Engine no longer listens; fetch outcome discarded");
        }
    }

    /// Stops the sweep, closes the stages and the transport, and closes the
    /// output channel.
    pub async fn close(&self) -> Result<(), SpiderError> {
        if let Some(task) = self.gc_task.lock().take() {
            task.abort();
        }
        for (name, result) in self.middleware.close_spider(&self.ctx).await {
            if let Err(e) = result {
                error!("Downloader middleware '{}' failed to close: {}", name, e);
            }
        }
        let closed = self.transport.close().await;
        if self.output.close().is_err() {
            debug!("Downloader output channel was already closed");
        }
        closed
    }
}
