use parking_lot::Mutex;
use serde_json::{Value, json};
use spider_engine::config::{CrawlerConfig, DupePolicy};
use spider_engine::prelude::*;
use spider_engine::request::META_RETRY_TIMES;
use spider_engine::scheduler::{DupeFilter, MemoryDupeFilter};
use spider_engine::state::EngineStatus;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// An in-process site: bodies by path, paths that fail, paths that answer 503 once.
#[derive(Default)]
struct Site {
    pages: HashMap<String, String>,
    failing: HashSet<String>,
    flaky: Mutex<HashSet<String>>,
    fetched: Mutex<Vec<String>>,
}

impl Site {
    fn new() -> Self {
        Self::default()
    }

    fn page(mut self, path: &str, body: &str) -> Self {
        self.pages.insert(path.to_string(), body.to_string());
        self
    }

    fn failing(mut self, path: &str) -> Self {
        self.failing.insert(path.to_string());
        self
    }

    fn flaky(self, path: &str) -> Self {
        self.flaky.lock().insert(path.to_string());
        self
    }

    fn fetched(&self) -> Vec<String> {
        let mut fetched = self.fetched.lock().clone();
        fetched.sort();
        fetched
    }
}

#[async_trait]
impl Transport for Site {
    async fn fetch(&self, request: &Request) -> Result<Response, SpiderError> {
        let path = request.url.path().to_string();
        self.fetched.lock().push(path.clone());
        tokio::time::sleep(Duration::from_millis(3)).await;

        if self.failing.contains(&path) {
            return Err(SpiderError::transport(request.url.as_str(), "connection refused"));
        }
        if self.flaky.lock().remove(&path) {
            return Ok(Response::new(request.url.clone(), 503, ""));
        }
        match self.pages.get(&path) {
            Some(body) => Ok(Response::new(request.url.clone(), 200, body.clone())),
            None => Ok(Response::new(request.url.clone(), 404, "")),
        }
    }
}

/// Follows `link:<path>` lines and emits a record per `item:<name>` line.
struct LineSpider {
    start: Vec<&'static str>,
}

impl LineSpider {
    fn new(start: Vec<&'static str>) -> Self {
        LineSpider { start }
    }
}

#[async_trait]
impl Spider for LineSpider {
    fn start_urls(&self) -> Vec<&'static str> {
        self.start.clone()
    }

    async fn parse(&self, response: Arc<Response>) -> Result<ParseOutput, SpiderError> {
        let mut output = ParseOutput::new();
        for line in response.text().lines() {
            if let Some(link) = line.strip_prefix("link:") {
                output.add_request(Request::new(response.url.join(link)?));
            } else if let Some(name) = line.strip_prefix("item:") {
                output.add_item(json!({ "name": name }));
            }
        }
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

struct DropNamed(&'static str);

impl Stage for DropNamed {
    fn name(&self) -> &str {
        "drop_named"
    }
}

#[async_trait]
impl Pipeline for DropNamed {
    async fn process_item(&self, item: Value, _ctx: &CrawlContext) -> Result<Value, PipelineError> {
        if item["name"] == self.0 {
            return Err(PipelineError::DropItem("unwanted".into()));
        }
        Ok(item)
    }
}

/// Reschedules 503 responses, at most twice per request.
struct RetryUnavailable;

impl Stage for RetryUnavailable {
    fn name(&self) -> &str {
        "retry"
    }
}

#[async_trait]
impl DownloaderMiddleware for RetryUnavailable {
    async fn process_response(
        &self,
        request: &Request,
        response: Response,
    ) -> Result<MiddlewareAction<Response>, SpiderError> {
        if response.status != 503 || request.retry_times() >= 2 {
            return Ok(MiddlewareAction::Continue(response));
        }
        let retries = request.retry_times() + 1;
        let retry = request.replace(|r| {
            r.dont_filter = true;
            r.meta.insert(META_RETRY_TIMES.to_string(), json!(retries));
        });
        Ok(MiddlewareAction::Retry(Box::new(retry)))
    }
}

/// Fetched-but-unprocessed pages: counted up by the transport, down by the sink.
#[derive(Default)]
struct Backlog {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Backlog {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct Tracked {
    site: Arc<Site>,
    backlog: Arc<Backlog>,
}

#[async_trait]
impl Transport for Tracked {
    async fn fetch(&self, request: &Request) -> Result<Response, SpiderError> {
        let response = self.site.fetch(request).await?;
        if response.text().starts_with("item:") {
            self.backlog.enter();
        }
        Ok(response)
    }
}

/// Holds every record for a while before releasing it from the backlog.
struct SlowSink(Arc<Backlog>);

impl Stage for SlowSink {
    fn name(&self) -> &str {
        "slow_sink"
    }
}

#[async_trait]
impl Pipeline for SlowSink {
    async fn process_item(&self, item: Value, _ctx: &CrawlContext) -> Result<Value, PipelineError> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.0.leave();
        Ok(item)
    }
}

/// A dupe filter whose lookups outlast the idle check.
struct SlowDupeFilter(MemoryDupeFilter);

#[async_trait]
impl DupeFilter for SlowDupeFilter {
    async fn seen(&self, fingerprint: &str) -> Result<bool, SpiderError> {
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.0.seen(fingerprint).await
    }

    async fn clear(&self) -> Result<(), SpiderError> {
        self.0.clear().await
    }
}

fn config() -> CrawlerConfig {
    CrawlerConfig {
        tick_interval: Duration::from_millis(10),
        idle_confirm_delay: Duration::from_millis(5),
        ..CrawlerConfig::default()
    }
}

fn builder(spider: LineSpider, site: &Arc<Site>) -> CrawlerBuilder<LineSpider> {
    CrawlerBuilder::new(spider)
        .config(config())
        .transport(Arc::clone(site))
}

#[tokio::test(start_paused = true)]
async fn seeds_are_drained_then_the_crawl_finishes() {
    let site = Arc::new(Site::new());
    let spider = LineSpider::new(vec![
        "https://site.test/1",
        "https://site.test/2",
        "https://site.test/3",
        "https://site.test/4",
        "https://site.test/5",
    ]);
    let crawler = builder(spider, &site).build().unwrap();

    let events = Arc::new(Mutex::new(Vec::new()));
    let idle = Arc::clone(&events);
    crawler
        .signals()
        .connect_fn(Signal::SpiderIdle, "idle", move |_, _| {
            idle.lock().push("idle".to_string());
            Ok(SignalAction::Continue)
        });
    let closed = Arc::clone(&events);
    crawler
        .signals()
        .connect_fn(Signal::SpiderClosed, "closed", move |_, data| {
            closed
                .lock()
                .push(format!("closed:{}", data.reason.clone().unwrap_or_default()));
            Ok(SignalAction::Continue)
        });

    let engine = crawler.engine();
    let stats = crawler.get_stats();
    let reason = crawler.start_crawl().await.unwrap();

    assert_eq!(reason, "finished");
    assert_eq!(site.fetched(), vec!["/1", "/2", "/3", "/4", "/5"]);
    assert_eq!(engine.status(), EngineStatus::Closed);

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.requests_enqueued, 5);
    assert_eq!(snapshot.responses_received, 5);
    assert_eq!(snapshot.finish_reason.as_deref(), Some("finished"));

    let events = events.lock();
    let n = events.len();
    assert!(n >= 2);
    assert_eq!(events[n - 2], "idle");
    assert_eq!(events[n - 1], "closed:finished");
}

#[tokio::test(start_paused = true)]
async fn transport_failures_do_not_stall_the_crawl() {
    let site = Arc::new(
        Site::new()
            .page("/ok", "link:/next")
            .page("/next", "item:found")
            .failing("/down"),
    );
    let items = Arc::new(Mutex::new(Vec::new()));
    let crawler = builder(
        LineSpider::new(vec!["https://site.test/down", "https://site.test/ok"]),
        &site,
    )
    .add_pipeline(100, Collect(Arc::clone(&items)))
    .build()
    .unwrap();

    let errors = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&errors);
    crawler
        .signals()
        .connect_fn(Signal::SpiderError, "errors", move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(SignalAction::Continue)
        });

    let stats = crawler.get_stats();
    assert_eq!(crawler.start_crawl().await.unwrap(), "finished");

    assert_eq!(site.fetched(), vec!["/down", "/next", "/ok"]);
    assert_eq!(*items.lock(), vec![json!({"name": "found"})]);
    assert_eq!(errors.load(Ordering::SeqCst), 1);

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.requests_failed, 1);
    assert_eq!(snapshot.spider_errors, 1);
}

#[tokio::test(start_paused = true)]
async fn duplicate_links_are_fetched_once() {
    let site = Arc::new(
        Site::new()
            .page("/a", "link:/b\nlink:/a")
            .page("/b", "link:/a\nlink:/c")
            .page("/c", "link:/a"),
    );
    let crawler = builder(LineSpider::new(vec!["https://site.test/a"]), &site)
        .build()
        .unwrap();

    let stats = crawler.get_stats();
    assert_eq!(crawler.start_crawl().await.unwrap(), "finished");

    assert_eq!(site.fetched(), vec!["/a", "/b", "/c"]);
    assert_eq!(stats.snapshot().requests_filtered, 3);
}

#[tokio::test(start_paused = true)]
async fn dropped_records_skip_later_pipelines() {
    let site = Arc::new(Site::new().page("/items", "item:keep\nitem:drop"));
    let kept = Arc::new(Mutex::new(Vec::new()));
    let crawler = builder(LineSpider::new(vec!["https://site.test/items"]), &site)
        .add_pipeline(200, Collect(Arc::clone(&kept)))
        .add_pipeline(100, DropNamed("drop"))
        .build()
        .unwrap();

    let dropped = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&dropped);
    crawler
        .signals()
        .connect_fn(Signal::ItemDropped, "dropped", move |_, data| {
            sink.lock().push((data.item.clone(), data.reason.clone()));
            Ok(SignalAction::Continue)
        });

    let stats = crawler.get_stats();
    assert_eq!(crawler.start_crawl().await.unwrap(), "finished");

    assert_eq!(*kept.lock(), vec![json!({"name": "keep"})]);
    assert_eq!(
        *dropped.lock(),
        vec![(Some(json!({"name": "drop"})), Some("unwanted".to_string()))]
    );
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.items_scraped, 1);
    assert_eq!(snapshot.items_dropped, 1);
}

#[tokio::test(start_paused = true)]
async fn idle_handlers_can_veto_closing() {
    let site = Arc::new(Site::new());
    let crawler = builder(LineSpider::new(vec!["https://site.test/only"]), &site)
        .build()
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    crawler
        .signals()
        .connect_fn(Signal::SpiderIdle, "keepalive", move |_, _| {
            if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                Ok(SignalAction::DontClose)
            } else {
                Ok(SignalAction::Continue)
            }
        });

    assert_eq!(crawler.start_crawl().await.unwrap(), "finished");
    assert!(calls.load(Ordering::SeqCst) >= 4);
}

#[tokio::test(start_paused = true)]
async fn handlers_can_close_the_spider() {
    let site = Arc::new(
        Site::new()
            .page("/1", "item:a\nlink:/2")
            .page("/2", "item:b\nlink:/3")
            .page("/3", "item:c"),
    );
    let crawler = builder(LineSpider::new(vec!["https://site.test/1"]), &site)
        .build()
        .unwrap();
    crawler
        .signals()
        .connect_fn(Signal::ItemScraped, "quota", |_, _| {
            Ok(SignalAction::CloseSpider("enough".into()))
        });

    let stats = crawler.get_stats();
    assert_eq!(crawler.start_crawl().await.unwrap(), "enough");
    assert_eq!(stats.snapshot().finish_reason.as_deref(), Some("enough"));
}

#[tokio::test(start_paused = true)]
async fn unavailable_responses_are_rescheduled() {
    let site = Arc::new(Site::new().page("/flaky", "item:ok").flaky("/flaky"));
    let items = Arc::new(Mutex::new(Vec::new()));
    let crawler = builder(LineSpider::new(vec!["https://site.test/flaky"]), &site)
        .add_downloader_middleware(550, RetryUnavailable)
        .add_pipeline(100, Collect(Arc::clone(&items)))
        .build()
        .unwrap();

    let stats = crawler.get_stats();
    assert_eq!(crawler.start_crawl().await.unwrap(), "finished");

    assert_eq!(site.fetched(), vec!["/flaky", "/flaky"]);
    assert_eq!(*items.lock(), vec![json!({"name": "ok"})]);
    assert_eq!(stats.snapshot().requests_rescheduled, 1);
}

#[tokio::test(start_paused = true)]
async fn paused_crawl_waits_before_admitting_work() {
    let site = Arc::new(Site::new());
    let crawler = builder(LineSpider::new(vec!["https://site.test/later"]), &site)
        .build()
        .unwrap();
    crawler.control().pause(Duration::from_secs(1));

    let started = tokio::time::Instant::now();
    assert_eq!(crawler.start_crawl().await.unwrap(), "finished");

    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(site.fetched(), vec!["/later"]);
}

#[tokio::test(start_paused = true)]
async fn explicit_seeds_replace_start_urls() {
    let site = Arc::new(Site::new());
    let crawler = builder(LineSpider::new(vec!["https://site.test/ignored"]), &site)
        .build()
        .unwrap();

    let seeds = futures_util::stream::iter(vec![
        Request::parse("https://site.test/x").map_err(SpiderError::from),
        Request::parse("https://site.test/y").map_err(SpiderError::from),
    ]);
    let reason = crawler
        .start_crawl_with(futures_util::StreamExt::boxed(seeds))
        .await
        .unwrap();

    assert_eq!(reason, "finished");
    assert_eq!(site.fetched(), vec!["/x", "/y"]);
}

#[tokio::test(start_paused = true)]
async fn out_queue_dedup_fetches_each_page_once() {
    let site = Arc::new(
        Site::new()
            .page("/a", "link:/b\nlink:/a")
            .page("/b", "link:/a\nlink:/c")
            .page("/c", "link:/a"),
    );
    let crawler = builder(LineSpider::new(vec!["https://site.test/a"]), &site)
        .dedup_policy(DupePolicy::OutQueue)
        .build()
        .unwrap();

    let stats = crawler.get_stats();
    assert_eq!(crawler.start_crawl().await.unwrap(), "finished");

    assert_eq!(site.fetched(), vec!["/a", "/b", "/c"]);
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.requests_filtered, 3);
    assert_eq!(snapshot.requests_enqueued, 6);
}

#[tokio::test(start_paused = true)]
async fn slow_dupe_checks_do_not_end_the_crawl_early() {
    let site = Arc::new(
        Site::new()
            .page("/a", "link:/b\nlink:/c")
            .page("/b", "link:/a\nitem:b")
            .page("/c", "item:c"),
    );
    let items = Arc::new(Mutex::new(Vec::new()));
    let crawler = builder(LineSpider::new(vec!["https://site.test/a"]), &site)
        .dedup_policy(DupePolicy::OutQueue)
        .dupefilter(SlowDupeFilter(MemoryDupeFilter::new()))
        .add_pipeline(100, Collect(Arc::clone(&items)))
        .build()
        .unwrap();

    let stats = crawler.get_stats();
    assert_eq!(crawler.start_crawl().await.unwrap(), "finished");

    assert_eq!(site.fetched(), vec!["/a", "/b", "/c"]);
    assert_eq!(items.lock().len(), 2);
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.responses_received, 3);
    assert_eq!(snapshot.requests_filtered, 1);
}

#[tokio::test(start_paused = true)]
async fn busy_scraper_holds_back_new_fetches() {
    let mut hub = String::new();
    for n in 0..12 {
        hub.push_str(&format!("link:/p{}\n", n));
    }
    let mut site = Site::new().page("/hub", &hub);
    for n in 0..12 {
        site = site.page(&format!("/p{}", n), &format!("item:p{}", n));
    }
    let site = Arc::new(site);
    let backlog = Arc::new(Backlog::default());
    let transport = Arc::new(Tracked {
        site: Arc::clone(&site),
        backlog: Arc::clone(&backlog),
    });

    let crawler = CrawlerBuilder::new(LineSpider::new(vec!["https://site.test/hub"]))
        .config(CrawlerConfig {
            scraper_min_response_size: 1000,
            scraper_max_active_size: 1500,
            ..config()
        })
        .concurrent_requests(2)
        .scraper_concurrency(1)
        .transport(transport)
        .add_pipeline(100, SlowSink(Arc::clone(&backlog)))
        .build()
        .unwrap();

    let stats = crawler.get_stats();
    assert_eq!(crawler.start_crawl().await.unwrap(), "finished");

    assert_eq!(site.fetched().len(), 13);
    assert_eq!(stats.snapshot().items_scraped, 12);
    // Two queued outcomes trip the scraper; two more may already be in flight.
    assert!(backlog.peak() <= 4, "backlog peaked at {}", backlog.peak());
}
