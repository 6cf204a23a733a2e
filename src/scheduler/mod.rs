//! Holds not-yet-dispatched requests.
//!
//! The `Scheduler` owns a [`RequestQueue`] and a [`DupeFilter`] and is agnostic
//! to which implementations are plugged in. Duplicate suppression happens at
//! one of two checkpoints, chosen by [`DupePolicy`]:
//! - `InQueue`: a duplicate is refused at `enqueue` time;
//! - `OutQueue`: duplicates are accepted into the queue and skipped when
//!   `dequeue` pops them, right before they would reach the downloader.
//!
//! Requests flagged `dont_filter` bypass both checkpoints.

pub mod dupefilter;
pub mod queue;

pub use dupefilter::{BloomDupeFilter, BloomFilter, DupeFilter, MemoryDupeFilter};
pub use queue::{FifoQueue, LifoQueue, PriorityQueue, RequestQueue};

use crate::config::{CrawlerConfig, DupePolicy, DupeStoreKind, QueueKind};
use crate::crawler::CrawlContext;
use crate::error::SpiderError;
use crate::request::Request;
use crate::signals::{Signal, SignalData};
use futures_util::stream::{BoxStream, StreamExt};
use std::sync::Arc;
use tracing::{debug, error, info, trace};

pub struct Scheduler {
    ctx: Arc<CrawlContext>,
    queue: Box<dyn RequestQueue>,
    dupefilter: Box<dyn DupeFilter>,
    policy: DupePolicy,
}

/// The queue selected by `queue_kind`.
pub fn queue_for(config: &CrawlerConfig) -> Box<dyn RequestQueue> {
    match config.queue_kind {
        QueueKind::Priority => Box::new(PriorityQueue::new()),
        QueueKind::Fifo => Box::new(FifoQueue::new()),
        QueueKind::Lifo => Box::new(LifoQueue::new()),
    }
}

/// The dedup store selected by `dedup_store`.
pub fn dupefilter_for(config: &CrawlerConfig) -> Box<dyn DupeFilter> {
    match config.dedup_store {
        DupeStoreKind::Memory => Box::new(MemoryDupeFilter::new()),
        DupeStoreKind::Bloom => Box::new(BloomDupeFilter::new(config.bloom_capacity)),
    }
}

impl Scheduler {
    pub fn new(
        ctx: Arc<CrawlContext>,
        queue: Box<dyn RequestQueue>,
        dupefilter: Box<dyn DupeFilter>,
    ) -> Self {
        let policy = ctx.config.dedup_policy;
        info!("Scheduler initialized with dedup policy {:?}", policy);
        Scheduler {
            ctx,
            queue,
            dupefilter,
            policy,
        }
    }

    /// Builds the in-memory backends named by the context's configuration.
    pub fn from_config(ctx: Arc<CrawlContext>) -> Self {
        let queue = queue_for(&ctx.config);
        let dupefilter = dupefilter_for(&ctx.config);
        Scheduler::new(ctx, queue, dupefilter)
    }

    pub fn policy(&self) -> DupePolicy {
        self.policy
    }

    /// Queues `request`. Returns `false` when it was filtered as a duplicate.
    pub async fn enqueue(&self, request: Request) -> Result<bool, SpiderError> {
        if self.policy == DupePolicy::InQueue
            && !request.dont_filter
            && self.dupefilter.seen(request.fingerprint()).await?
        {
            self.filtered(&request).await;
            return Ok(false);
        }

        trace!("Enqueueing request: {}", request.url);
        let scheduled = self
            .ctx
            .signals
            .is_connected(Signal::RequestScheduled)
            .then(|| SignalData::request(&request));
        self.queue.push(request).await?;
        self.ctx.stats.increment_requests_enqueued();
        if let Some(data) = scheduled {
            self.ctx.fire(Signal::RequestScheduled, data).await;
        }
        Ok(true)
    }

    /// Pops up to `max` requests, lazily.
    ///
    /// Under `OutQueue`, popped duplicates are dropped, so a batch may come
    /// back shorter than `max`. A backend error ends the batch after being logged.
    pub fn dequeue(&self, max: usize) -> BoxStream<'_, Request> {
        self.queue
            .pop(max)
            .take_while(|popped| {
                if let Err(e) = popped {
                    error!("Failed to pop from the request queue: {}", e);
                }
                futures_util::future::ready(popped.is_ok())
            })
            .filter_map(move |popped| async move {
                let request = popped.ok()?;
                if self.policy == DupePolicy::OutQueue && !request.dont_filter {
                    match self.dupefilter.seen(request.fingerprint()).await {
                        Ok(true) => {
                            self.filtered(&request).await;
                            return None;
                        }
                        Ok(false) => {}
                        Err(e) => error!("Dedup store failed for {}: {}", request.url, e),
                    }
                }
                Some(request)
            })
            .boxed()
    }

    pub async fn has_pending(&self) -> Result<bool, SpiderError> {
        Ok(self.queue.len().await? > 0)
    }

    pub async fn len(&self) -> Result<usize, SpiderError> {
        self.queue.len().await
    }

    pub async fn clear(&self) -> Result<(), SpiderError> {
        self.queue.clear().await?;
        self.dupefilter.clear().await
    }

    /// Closes the queue and the dedup store; both are attempted.
    pub async fn close(&self) -> Result<(), SpiderError> {
        info!("Closing scheduler");
        let queue = self.queue.close().await;
        let dupefilter = self.dupefilter.close().await;
        queue.and(dupefilter)
    }

    async fn filtered(&self, request: &Request) {
        debug!("Filtered duplicate request: {}", request.url);
        self.ctx.stats.increment_requests_filtered();
        self.ctx
            .fire_if_connected(Signal::RequestDropped, || {
                SignalData::request(request).with_reason("duplicate")
            })
            .await;
    }
}
