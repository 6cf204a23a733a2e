//! # Builder Module
//!
//! Provides the `CrawlerBuilder`, a fluent API for assembling a `Crawler`.
//!
//! ## Overview
//!
//! The builder collects the configuration, the spider, the transport, the
//! downloader and spider stages, the item pipelines, the queue and dedup
//! backends and any signal handlers. `build` validates the configuration and
//! wires everything around one shared `CrawlContext`.
//!
//! Stages and pipelines are registered with a numeric priority. Downloader
//! request hooks and pipelines run in ascending priority; response, exception
//! and spider output hooks run in the opposite order.
//!
//! ## Example
//!
//! ```rust,ignore
//! use spider_engine::prelude::*;
//!
//! async fn crawl() -> Result<String, SpiderError> {
//!     let crawler = CrawlerBuilder::new(MySpider)
//!         .concurrent_requests(32)
//!         .concurrent_requests_per_domain(4)
//!         .download_delay(Duration::from_millis(250))
//!         .add_pipeline(300, JsonLinesPipeline::new("items.jsonl"))
//!         .build()?;
//!
//!     crawler.start_crawl().await
//! }
//! ```

use crate::config::{CrawlerConfig, DupePolicy, QueueKind, SlotConfig};
use crate::crawler::{CrawlContext, Crawler, Engine, Scraper};
use crate::downloader::{Downloader, Transport};
use crate::error::SpiderError;
use crate::middleware::downloader::{DownloaderMiddleware, DownloaderMiddlewareManager};
use crate::middleware::spider::{SpiderMiddleware, SpiderMiddlewareManager};
use crate::pipeline::{ItemPipelineManager, Pipeline};
use crate::scheduler::{DupeFilter, RequestQueue, Scheduler, dupefilter_for, queue_for};
use crate::signals::{Signal, SignalHandler};
use crate::spider::Spider;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub struct CrawlerBuilder<S: Spider> {
    config: CrawlerConfig,
    spider: S,
    transport: Option<Arc<dyn Transport>>,
    downloader_middlewares: Vec<(i32, Arc<dyn DownloaderMiddleware>)>,
    spider_middlewares: Vec<(i32, Arc<dyn SpiderMiddleware>)>,
    pipelines: Vec<(i32, Arc<dyn Pipeline>)>,
    queue: Option<Box<dyn RequestQueue>>,
    dupefilter: Option<Box<dyn DupeFilter>>,
    handlers: Vec<(Signal, Arc<dyn SignalHandler>)>,
}

impl<S: Spider> CrawlerBuilder<S> {
    /// Creates a new `CrawlerBuilder` for a given spider with the default configuration.
    pub fn new(spider: S) -> Self {
        CrawlerBuilder {
            config: CrawlerConfig::default(),
            spider,
            transport: None,
            downloader_middlewares: Vec::new(),
            spider_middlewares: Vec::new(),
            pipelines: Vec::new(),
            queue: None,
            dupefilter: None,
            handlers: Vec::new(),
        }
    }

    /// Replaces the whole configuration, e.g. one loaded from TOML.
    pub fn config(mut self, config: CrawlerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the global ceiling of requests held by the downloader.
    pub fn concurrent_requests(mut self, limit: usize) -> Self {
        self.config.concurrent_requests = limit;
        self
    }

    /// Sets the default ceiling of in-flight fetches per slot.
    pub fn concurrent_requests_per_domain(mut self, limit: usize) -> Self {
        self.config.concurrent_requests_per_domain = limit;
        self
    }

    pub fn download_delay(mut self, delay: Duration) -> Self {
        self.config.download_delay = delay;
        self
    }

    pub fn randomize_download_delay(mut self, randomize: bool) -> Self {
        self.config.randomize_download_delay = randomize;
        self
    }

    /// Overrides the slot policy for one routing key.
    pub fn slot(mut self, key: impl Into<String>, slot: SlotConfig) -> Self {
        self.config.slots.insert(key.into(), slot);
        self
    }

    /// Sets the number of fetch outcomes processed at the same time.
    pub fn scraper_concurrency(mut self, limit: usize) -> Self {
        self.config.scraper_concurrency = limit;
        self
    }

    pub fn dedup_policy(mut self, policy: DupePolicy) -> Self {
        self.config.dedup_policy = policy;
        self
    }

    pub fn queue_kind(mut self, kind: QueueKind) -> Self {
        self.config.queue_kind = kind;
        self
    }

    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.config.tick_interval = interval;
        self
    }

    /// Sets the transport used for every fetch.
    pub fn transport<T: Transport>(mut self, transport: Arc<T>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Adds a downloader stage at `priority`.
    pub fn add_downloader_middleware<M>(mut self, priority: i32, middleware: M) -> Self
    where
        M: DownloaderMiddleware,
    {
        self.downloader_middlewares
            .push((priority, Arc::new(middleware)));
        self
    }

    /// Adds a spider stage at `priority`.
    pub fn add_spider_middleware<M>(mut self, priority: i32, middleware: M) -> Self
    where
        M: SpiderMiddleware,
    {
        self.spider_middlewares.push((priority, Arc::new(middleware)));
        self
    }

    /// Adds an item pipeline at `priority`.
    pub fn add_pipeline<P>(mut self, priority: i32, pipeline: P) -> Self
    where
        P: Pipeline,
    {
        self.pipelines.push((priority, Arc::new(pipeline)));
        self
    }

    /// Replaces the queue chosen by `queue_kind`.
    pub fn queue<Q: RequestQueue>(mut self, queue: Q) -> Self {
        self.queue = Some(Box::new(queue));
        self
    }

    /// Replaces the dedup store chosen by `dedup_store`.
    pub fn dupefilter<D: DupeFilter>(mut self, dupefilter: D) -> Self {
        self.dupefilter = Some(Box::new(dupefilter));
        self
    }

    /// Connects a signal handler before the run starts.
    pub fn connect_signal<H: SignalHandler>(mut self, signal: Signal, handler: H) -> Self {
        self.handlers.push((signal, Arc::new(handler)));
        self
    }

    /// Validates the configuration and wires the crawler.
    pub fn build(self) -> Result<Crawler<S>, SpiderError> {
        self.config.validate()?;
        let transport = match self.transport {
            Some(transport) => transport,
            None => default_transport()?,
        };

        let ctx = CrawlContext::new(self.config);
        for (signal, handler) in self.handlers {
            ctx.signals.connect(signal, handler);
        }

        let queue = self.queue.unwrap_or_else(|| queue_for(&ctx.config));
        let dupefilter = self
            .dupefilter
            .unwrap_or_else(|| dupefilter_for(&ctx.config));
        let scheduler = Arc::new(Scheduler::new(Arc::clone(&ctx), queue, dupefilter));

        debug!(
            "Wiring {} downloader stages, {} spider stages, {} pipelines",
            self.downloader_middlewares.len(),
            self.spider_middlewares.len(),
            self.pipelines.len()
        );
        let (output_tx, output_rx) = kanal::unbounded_async();
        let downloader = Downloader::new(
            Arc::clone(&ctx),
            transport,
            DownloaderMiddlewareManager::new(self.downloader_middlewares),
            output_tx,
        );

        let spider = Arc::new(self.spider);
        let scraper = Scraper::new(
            Arc::clone(&ctx),
            Arc::clone(&spider),
            SpiderMiddlewareManager::new(self.spider_middlewares),
            ItemPipelineManager::new(self.pipelines),
            Arc::clone(&scheduler),
        );

        let engine = Engine::new(Arc::clone(&ctx), scheduler, downloader, scraper, output_rx);
        Ok(Crawler::new(ctx, spider, engine))
    }
}

#[cfg(feature = "reqwest-transport")]
fn default_transport() -> Result<Arc<dyn Transport>, SpiderError> {
    Ok(Arc::new(crate::downloader::ReqwestTransport::new()?))
}

#[cfg(not(feature = "reqwest-transport"))]
fn default_transport() -> Result<Arc<dyn Transport>, SpiderError> {
    Err(SpiderError::Configuration(
        "no transport configured and the reqwest transport is disabled.".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::ParseOutput;
    use crate::request::Request;
    use crate::response::Response;
    use async_trait::async_trait;

    struct Idle;

    #[async_trait]
    impl Spider for Idle {
        async fn parse(&self, _response: Arc<Response>) -> Result<ParseOutput, SpiderError> {
            Ok(ParseOutput::new())
        }
    }

    struct Unreachable;

    #[async_trait]
    impl Transport for Unreachable {
        async fn fetch(&self, request: &Request) -> Result<Response, SpiderError> {
            Err(SpiderError::transport(request.url.as_str(), "unreachable"))
        }
    }

    #[test]
    fn zero_sweep_interval_is_rejected() {
        let built = CrawlerBuilder::new(Idle)
            .transport(Arc::new(Unreachable))
            .config(CrawlerConfig {
                slot_gc_interval: Duration::ZERO,
                ..CrawlerConfig::default()
            })
            .build();
        assert!(matches!(
            built,
            Err(SpiderError::Configuration(ref msg)) if msg.contains("slot_gc_interval")
        ));
    }

    #[test]
    fn zero_ceilings_are_rejected() {
        let built = CrawlerBuilder::new(Idle)
            .transport(Arc::new(Unreachable))
            .concurrent_requests(0)
            .build();
        assert!(matches!(built, Err(SpiderError::Configuration(_))));

        let built = CrawlerBuilder::new(Idle)
            .transport(Arc::new(Unreachable))
            .slot(
                "example.com",
                SlotConfig {
                    concurrency: Some(0),
                    ..SlotConfig::default()
                },
            )
            .build();
        assert!(matches!(built, Err(SpiderError::Configuration(_))));
    }

    #[test]
    fn signal_handlers_are_connected_at_build() {
        let crawler = CrawlerBuilder::new(Idle)
            .transport(Arc::new(Unreachable))
            .connect_signal(
                Signal::SpiderIdle,
                crate::signals::FnHandler::new("keepalive", |_, _| {
                    Ok(crate::signals::SignalAction::DontClose)
                }),
            )
            .build()
            .unwrap();
        assert!(crawler.signals().is_connected(Signal::SpiderIdle));
        assert!(!crawler.signals().is_connected(Signal::SpiderClosed));
    }
}
