//! Turns fetch outcomes into records and follow-up requests.
//!
//! Every outcome handed to [`Scraper::enqueue_scrape`] gets its own task. The
//! tasks run concurrently, bounded by a semaphore of `scraper_concurrency`
//! permits, and each one processes its outcome start to finish:
//!
//! - a response goes through the spider middleware protocol around the spider
//!   callback, and every produced output is classified: requests go back to
//!   the scheduler, records go through the item pipelines;
//! - a failed fetch goes to the spider's `errback` when the request names one,
//!   otherwise it is logged and counted.
//!
//! Queued response bodies are accounted for in bytes, with a per-entry floor,
//! so the engine can back out while the scraper is saturated.

use crate::crawler::CrawlContext;
use crate::error::{PipelineError, SpiderError};
use crate::item::{OutputStream, SpiderOutput};
use crate::middleware::spider::SpiderMiddlewareManager;
use crate::pipeline::{ItemOutcome, ItemPipelineManager, kind_of};
use crate::request::Request;
use crate::response::Response;
use crate::scheduler::Scheduler;
use crate::signals::{Signal, SignalData};
use crate::spider::Spider;
use futures_util::StreamExt;
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Semaphore;

/// A fetch outcome the scraper accepts.
#[derive(Debug)]
pub enum ScrapeInput {
    Response(Arc<Response>),
    Failure(SpiderError),
}

impl ScrapeInput {
    fn body_len(&self) -> usize {
        match self {
            ScrapeInput::Response(response) => response.body.len(),
            ScrapeInput::Failure(_) => 0,
        }
    }
}

struct Pending {
    input: ScrapeInput,
    request: Request,
    cost: usize,
}

pub struct Scraper<S: Spider> {
    ctx: Arc<CrawlContext>,
    spider: Arc<S>,
    middleware: Arc<SpiderMiddlewareManager>,
    pipelines: ItemPipelineManager,
    scheduler: Arc<Scheduler>,
    queue: Mutex<VecDeque<Pending>>,
    /// Accounted bytes of outcomes queued or being processed.
    active_size: AtomicUsize,
    /// Outcomes accepted and not yet fully processed.
    in_flight: AtomicUsize,
    limiter: Semaphore,
}

impl<S: Spider> Scraper<S> {
    pub fn new(
        ctx: Arc<CrawlContext>,
        spider: Arc<S>,
        middleware: SpiderMiddlewareManager,
        pipelines: ItemPipelineManager,
        scheduler: Arc<Scheduler>,
    ) -> Arc<Self> {
        let limiter = Semaphore::new(ctx.config.scraper_concurrency);
        Arc::new(Scraper {
            ctx,
            spider,
            middleware: Arc::new(middleware),
            pipelines,
            scheduler,
            queue: Mutex::new(VecDeque::new()),
            active_size: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            limiter,
        })
    }

    /// Opens the spider stages and the item pipelines; failures are logged.
    pub async fn open(&self) {
        for (name, result) in self.middleware.open_spider(&self.ctx).await {
            if let Err(e) = result {
                error!("Spider middleware '{}' failed to open: {}", name, e);
            }
        }
        for (name, result) in self.pipelines.open(&self.ctx).await {
            if let Err(e) = result {
                error!("Pipeline '{}' failed to open: {}", name, e);
            }
        }
    }

    /// Closes the spider stages and the item pipelines.
    ///
    /// Every stage is closed; the returned error names the ones that failed.
    pub async fn close(&self) -> Result<(), SpiderError> {
        let mut failed = Vec::new();
        for (name, result) in self.middleware.close_spider(&self.ctx).await {
            if let Err(e) = result {
                error!("Spider middleware '{}' failed to close: {}", name, e);
                failed.push(name);
            }
        }
        for (name, result) in self.pipelines.close(&self.ctx).await {
            if let Err(e) = result {
                error!("Pipeline '{}' failed to close: {}", name, e);
                failed.push(name);
            }
        }
        for (name, timing) in self.pipelines.stage_timings() {
            if timing.calls > 0 {
                debug!(
                    "Pipeline '{}' processed {} items in {:?}",
                    name, timing.calls, timing.total
                );
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(SpiderError::General(format!(
                "stages failed to close: {}",
                failed.join(", ")
            )))
        }
    }

    /// Queues an outcome and spawns the task that processes it.
    pub fn enqueue_scrape(self: &Arc<Self>, input: ScrapeInput, request: Request) {
        let cost = input
            .body_len()
            .max(self.ctx.config.scraper_min_response_size);
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.active_size.fetch_add(cost, Ordering::SeqCst);
        self.queue.lock().push_back(Pending {
            input,
            request,
            cost,
        });

        let scraper = Arc::clone(self);
        tokio::spawn(async move { scraper.consume().await });
    }

    /// True while queued bodies exceed `scraper_max_active_size`.
    pub fn needs_backout(&self) -> bool {
        self.active_size() > self.ctx.config.scraper_max_active_size
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) == 0 && self.queue.lock().is_empty()
    }

    pub fn active_size(&self) -> usize {
        self.active_size.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    async fn consume(self: Arc<Self>) {
        let permit = match self.limiter.acquire().await {
            Ok(permit) => Some(permit),
            Err(_) => {
                warn!("Scraper limiter closed; processing without a permit");
                None
            }
        };

        let next = self.queue.lock().pop_front();
        if let Some(Pending {
            input,
            request,
            cost,
        }) = next
        {
            trace!("Scraping outcome for <{}>", request.url);
            self.scrape(input, request).await;
            self.active_size.fetch_sub(cost, Ordering::SeqCst);
        }

        drop(permit);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    async fn scrape(&self, input: ScrapeInput, request: Request) {
        match input {
            ScrapeInput::Response(response) => {
                let spider = Arc::clone(&self.spider);
                let produced = self
                    .middleware
                    .scrape_response(Arc::clone(&response), move |response| async move {
                        spider.scrape(response).await
                    })
                    .await;

                let errors = match produced {
                    Ok(output) => self.handle_output(output, &request, Some(&response)).await,
                    Err(e) => vec![e],
                };
                for e in errors {
                    self.handle_error(e, &request, Some(&response)).await;
                }
            }
            ScrapeInput::Failure(e) => self.handle_error(e, &request, None).await,
        }
    }

    /// Classifies every output and returns the errors the stream yielded.
    async fn handle_output(
        &self,
        mut output: OutputStream,
        request: &Request,
        response: Option<&Arc<Response>>,
    ) -> Vec<SpiderError> {
        let mut errors = Vec::new();
        while let Some(next) = output.next().await {
            match next {
                Ok(SpiderOutput::Request(next)) => self.schedule(next, request).await,
                Ok(SpiderOutput::Item(item)) => self.process_item(item, response).await,
                Err(e) => errors.push(e),
            }
        }
        errors
    }

    async fn schedule(&self, next: Request, parent: &Request) {
        trace!("<{}> produced follow-up <{}>", parent.url, next.url);
        if let Err(e) = self.scheduler.enqueue(next).await {
            error!("Failed to schedule a request produced by <{}>: {}", parent.url, e);
        }
    }

    async fn process_item(&self, item: Value, response: Option<&Arc<Response>>) {
        let stats = &self.ctx.stats;
        if !item.is_object() {
            error!(
                "Spider '{}' produced {} where a record or a request was expected; discarded",
                self.spider.name(),
                kind_of(&item)
            );
            stats.increment_contract_violations();
            return;
        }

        let outcome = self.pipelines.process_item(item, &self.ctx).await;
        let (signal, data) = match outcome {
            ItemOutcome::Scraped(item) => {
                stats.increment_items_scraped();
                (Signal::ItemScraped, SignalData::default().with_item(item))
            }
            ItemOutcome::Dropped { item, reason } => {
                stats.increment_items_dropped();
                (
                    Signal::ItemDropped,
                    SignalData::reason(reason).with_item(item),
                )
            }
            ItemOutcome::Failed { item, error } => {
                if let PipelineError::ContractViolation { stage, detail } = &error {
                    error!("Pipeline '{}' violated its contract: {}", stage, detail);
                    stats.increment_contract_violations();
                } else {
                    error!("Item pipeline failed: {}", error);
                }
                stats.increment_item_errors();
                (
                    Signal::ItemError,
                    SignalData::default().with_item(item).with_error(error),
                )
            }
        };
        let data = match response {
            Some(response) => data.with_response(Arc::clone(response)),
            None => data,
        };
        self.ctx.fire(signal, data).await;
    }

    async fn handle_error(
        &self,
        error: SpiderError,
        request: &Request,
        response: Option<&Arc<Response>>,
    ) {
        let error = error.into_root();
        if let Some(reason) = error.close_reason() {
            info!("Close requested while processing <{}>: {}", request.url, reason);
            self.ctx.control.close(reason);
            return;
        }
        if let SpiderError::IgnoreRequest(reason) = &error {
            debug!("Ignored <{}>: {}", request.url, reason);
            return;
        }
        if let SpiderError::ContractViolation { stage, detail } = &error {
            error!(
                "Stage '{}' violated its contract while processing <{}>: {}",
                stage, request.url, detail
            );
            self.ctx.stats.increment_contract_violations();
            return;
        }

        if request.errback.is_some() {
            match self.spider.errback(request.clone(), &error).await {
                Ok(output) => {
                    let errors = self
                        .handle_output(output.into_stream(), request, response)
                        .await;
                    for e in errors {
                        self.report(e.into_root(), request, response).await;
                    }
                }
                Err(e) => self.report(e, request, response).await,
            }
            return;
        }
        self.report(error, request, response).await;
    }

    /// Logs and counts an error nobody claimed.
    async fn report(&self, error: SpiderError, request: &Request, response: Option<&Arc<Response>>) {
        if let Some(reason) = error.close_reason() {
            self.ctx.control.close(reason);
            return;
        }
        error!("Unhandled error processing <{}>: {}", request.url, error);
        self.ctx.stats.increment_spider_errors();
        self.ctx
            .fire_if_connected(Signal::SpiderError, || {
                let data = SignalData::request(request).with_error(&error);
                match response {
                    Some(response) => data.with_response(Arc::clone(response)),
                    None => data,
                }
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CrawlerConfig;
    use crate::item::ParseOutput;
    use crate::middleware::Stage;
    use crate::pipeline::Pipeline;
    use crate::signals::SignalAction;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    struct Catalog;

    #[async_trait]
    impl Spider for Catalog {
        async fn parse(&self, response: Arc<Response>) -> Result<ParseOutput, SpiderError> {
            let mut output = ParseOutput::new();
            match response.url.path() {
                "/list" => {
                    output.add_request(Request::parse("https://shop.test/item/1")?);
                    output.add_item(json!({"page": "list"}));
                }
                "/scalar" => output.add_item(json!("just a string")),
                "/broken" => return Err(SpiderError::Callback("no price".into())),
                "/close" => return Err(SpiderError::CloseSpider("quota".into())),
                _ => {}
            }
            Ok(output)
        }

        async fn errback(
            &self,
            request: Request,
            _error: &SpiderError,
        ) -> Result<ParseOutput, SpiderError> {
            let mut output = ParseOutput::new();
            output.add_item(json!({"failed": request.url.as_str()}));
            Ok(output)
        }
    }

    struct Collect(Arc<Mutex<Vec<Value>>>);

    impl Stage for Collect {
        fn name(&self) -> &str {
            "collect"
        }
    }

    #[async_trait]
    impl Pipeline for Collect {
        async fn process_item(&self, item: Value, _ctx: &CrawlContext) -> Result<Value, PipelineError> {
            self.0.lock().push(item.clone());
            Ok(item)
        }
    }

    struct Harness {
        ctx: Arc<CrawlContext>,
        scheduler: Arc<Scheduler>,
        scraper: Arc<Scraper<Catalog>>,
        items: Arc<Mutex<Vec<Value>>>,
    }

    fn harness(config: CrawlerConfig) -> Harness {
        let ctx = CrawlContext::new(config);
        let scheduler = Arc::new(Scheduler::from_config(Arc::clone(&ctx)));
        let items = Arc::new(Mutex::new(Vec::new()));
        let pipeline: Arc<dyn Pipeline> = Arc::new(Collect(Arc::clone(&items)));
        let scraper = Scraper::new(
            Arc::clone(&ctx),
            Arc::new(Catalog),
            SpiderMiddlewareManager::new(Vec::new()),
            ItemPipelineManager::new(vec![(100, pipeline)]),
            Arc::clone(&scheduler),
        );
        Harness {
            ctx,
            scheduler,
            scraper,
            items,
        }
    }

    fn response(path: &str) -> (ScrapeInput, Request) {
        let request = Request::parse(&format!("https://shop.test{}", path)).unwrap();
        let response = Response::new(request.url.clone(), 200, "<html></html>");
        response.attach_request(request.clone());
        (ScrapeInput::Response(Arc::new(response)), request)
    }

    async fn until_idle<S: Spider>(scraper: &Scraper<S>) {
        while !scraper.is_idle() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test]
    async fn outputs_are_classified() {
        let h = harness(CrawlerConfig::default());
        let (input, request) = response("/list");
        h.scraper.enqueue_scrape(input, request);
        until_idle(&h.scraper).await;

        assert_eq!(*h.items.lock(), vec![json!({"page": "list"})]);
        assert_eq!(h.scheduler.len().await.unwrap(), 1);
        let stats = h.ctx.stats.snapshot();
        assert_eq!(stats.items_scraped, 1);
        assert_eq!(stats.requests_enqueued, 1);
        assert_eq!(h.scraper.active_size(), 0);
    }

    #[tokio::test]
    async fn scalar_records_are_contract_violations() {
        let h = harness(CrawlerConfig::default());
        let (input, request) = response("/scalar");
        h.scraper.enqueue_scrape(input, request);
        until_idle(&h.scraper).await;

        assert!(h.items.lock().is_empty());
        assert_eq!(h.ctx.stats.snapshot().contract_violations, 1);
    }

    #[tokio::test]
    async fn callback_errors_are_reported() {
        let h = harness(CrawlerConfig::default());
        let reported = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reported);
        h.ctx
            .signals
            .connect_fn(Signal::SpiderError, "recorder", move |_, data| {
                sink.lock().push(data.error.clone().unwrap_or_default());
                Ok(SignalAction::Continue)
            });

        let (input, request) = response("/broken");
        h.scraper.enqueue_scrape(input, request);
        until_idle(&h.scraper).await;

        assert_eq!(h.ctx.stats.snapshot().spider_errors, 1);
        assert_eq!(*reported.lock(), vec!["callback error: no price".to_string()]);
    }

    #[tokio::test]
    async fn failures_reach_the_errback_when_named() {
        let h = harness(CrawlerConfig::default());
        let request = Request::parse("https://shop.test/down")
            .unwrap()
            .with_errback("on_error");
        let failure = SpiderError::transport("https://shop.test/down", "connection refused");
        h.scraper
            .enqueue_scrape(ScrapeInput::Failure(failure), request);

        let silent = Request::parse("https://shop.test/gone").unwrap();
        let failure = SpiderError::transport("https://shop.test/gone", "connection refused");
        h.scraper.enqueue_scrape(ScrapeInput::Failure(failure), silent);
        until_idle(&h.scraper).await;

        assert_eq!(
            *h.items.lock(),
            vec![json!({"failed": "https://shop.test/down"})]
        );
        assert_eq!(h.ctx.stats.snapshot().spider_errors, 1);
    }

    #[tokio::test]
    async fn close_errors_become_close_requests() {
        let h = harness(CrawlerConfig::default());
        let (input, request) = response("/close");
        h.scraper.enqueue_scrape(input, request);
        until_idle(&h.scraper).await;

        assert_eq!(h.ctx.control.take_close_request().as_deref(), Some("quota"));
        assert_eq!(h.ctx.stats.snapshot().spider_errors, 0);
    }

    #[tokio::test]
    async fn small_bodies_count_at_the_floor() {
        let h = harness(CrawlerConfig {
            scraper_concurrency: 1,
            scraper_min_response_size: 1000,
            scraper_max_active_size: 1500,
            ..CrawlerConfig::default()
        });
        let permit = h.scraper.limiter.acquire().await.unwrap();

        let (input, request) = response("/a");
        h.scraper.enqueue_scrape(input, request);
        assert_eq!(h.scraper.active_size(), 1000);
        assert!(!h.scraper.needs_backout());

        let (input, request) = response("/b");
        h.scraper.enqueue_scrape(input, request);
        assert!(h.scraper.needs_backout());
        assert!(!h.scraper.is_idle());

        drop(permit);
        until_idle(&h.scraper).await;
        assert!(!h.scraper.needs_backout());
    }
}
