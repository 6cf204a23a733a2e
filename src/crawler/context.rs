//! The per-run registry handed to every component.

use crate::config::CrawlerConfig;
use crate::signals::{Signal, SignalData, SignalManager, SignalResults, close_request};
use crate::state::ControlHandle;
use crate::stats::StatCollector;
use std::sync::Arc;
use tracing::info;

/// Settings, statistics, the signal bus and the control handle of one run.
///
/// Built once by the builder and shared by `Arc`; nothing in the engine reaches
/// for process-wide state.
pub struct CrawlContext {
    pub config: CrawlerConfig,
    pub stats: Arc<StatCollector>,
    pub signals: SignalManager,
    pub control: ControlHandle,
}

impl CrawlContext {
    pub fn new(config: CrawlerConfig) -> Arc<Self> {
        Arc::new(CrawlContext {
            config,
            ..CrawlContext::default()
        })
    }

    /// Fires `signal` and records a close request if a handler returned one.
    pub async fn fire(&self, signal: Signal, data: SignalData) -> SignalResults {
        let results = self.signals.fire(signal, data).await;
        self.honour_close(signal, &results);
        results
    }

    /// Like [`CrawlContext::fire`], but builds the payload only when someone listens.
    pub async fn fire_if_connected(
        &self,
        signal: Signal,
        data: impl FnOnce() -> SignalData,
    ) -> SignalResults {
        let results = self.signals.fire_if_connected(signal, data).await;
        self.honour_close(signal, &results);
        results
    }

    fn honour_close(&self, signal: Signal, results: &SignalResults) {
        if let Some(reason) = close_request(results) {
            info!("A {:?} handler asked to close the spider: {}", signal, reason);
            self.control.close(reason);
        }
    }
}

impl Default for CrawlContext {
    fn default() -> Self {
        CrawlContext {
            config: CrawlerConfig::default(),
            stats: Arc::new(StatCollector::new()),
            signals: SignalManager::new(),
            control: ControlHandle::new(),
        }
    }
}
