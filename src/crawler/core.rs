//! The `Crawler`, the handle a caller gets from `CrawlerBuilder::build`.
//!
//! It owns the wired-up [`Engine`] and the spider, and runs one crawl:
//! `start_crawl` reads the spider's start requests, drives the engine until it
//! closes and returns the finish reason. Ctrl-C asks for a graceful close with
//! reason `"shutdown"`; in-flight work is allowed to finish.

use super::CrawlContext;
use super::engine::{Engine, SeedStream};
use crate::error::SpiderError;
use crate::signals::SignalManager;
use crate::spider::Spider;
use crate::state::ControlHandle;
use crate::stats::StatCollector;
use std::sync::Arc;
use tracing::{info, warn};

const SHUTDOWN: &str = "shutdown";

/// The central orchestrator of a crawl.
pub struct Crawler<S: Spider> {
    ctx: Arc<CrawlContext>,
    spider: Arc<S>,
    engine: Arc<Engine<S>>,
}

impl<S: Spider> Crawler<S> {
    pub(crate) fn new(ctx: Arc<CrawlContext>, spider: Arc<S>, engine: Arc<Engine<S>>) -> Self {
        Crawler {
            ctx,
            spider,
            engine,
        }
    }

    /// Steers the run from other tasks: pause, resume or close.
    pub fn control(&self) -> ControlHandle {
        self.ctx.control.clone()
    }

    /// Returns a cloned Arc to the `StatCollector` of this run.
    pub fn get_stats(&self) -> Arc<StatCollector> {
        Arc::clone(&self.ctx.stats)
    }

    pub fn signals(&self) -> &SignalManager {
        &self.ctx.signals
    }

    pub fn context(&self) -> Arc<CrawlContext> {
        Arc::clone(&self.ctx)
    }

    pub fn engine(&self) -> Arc<Engine<S>> {
        Arc::clone(&self.engine)
    }

    /// Crawls from the spider's start requests; returns the finish reason.
    pub async fn start_crawl(self) -> Result<String, SpiderError> {
        let seeds = self.spider.start_requests();
        self.start_crawl_with(seeds).await
    }

    /// Crawls from the given seed sequence instead of the spider's own.
    pub async fn start_crawl_with(self, seeds: SeedStream) -> Result<String, SpiderError> {
        info!("Crawler starting spider '{}'", self.spider.name());

        let control = self.ctx.control.clone();
        let ctrl_c = tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Ctrl-C received, initiating graceful shutdown.");
                    control.close(SHUTDOWN);
                }
                Err(e) => warn!("Unable to listen for Ctrl-C: {}", e),
            }
        });

        let result = self.engine.run(seeds).await;
        ctrl_c.abort();

        if let Ok(reason) = &result {
            let stats = self.ctx.stats.snapshot();
            info!(
                "Crawl finished ({}). Stats: requests_enqueued={}, requests_succeeded={}, items_scraped={}",
                reason, stats.requests_enqueued, stats.requests_succeeded, stats.items_scraped
            );
        }
        result
    }
}
