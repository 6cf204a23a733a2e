//! # spider-engine
//!
//! A self-feeding crawl engine: a scheduler with duplicate suppression, a
//! downloader with per-destination concurrency and pacing, a bounded scraper
//! and the ordered middleware chains around all of them.
//!
//! Requests flow from the scheduler through the downloader and its stages to
//! a [`Transport`](downloader::Transport); responses flow through the spider
//! stages into the spider callback, whose follow-up requests re-enter the
//! scheduler and whose records go through the item pipelines. The crawl ends
//! when everything is idle and no work is left.
//!
//! ## Example
//!
//! ```rust,ignore
//! use spider_engine::prelude::*;
//! use std::sync::Arc;
//!
//! struct MySpider;
//!
//! #[async_trait]
//! impl Spider for MySpider {
//!     fn start_urls(&self) -> Vec<&'static str> {
//!         vec!["https://example.com"]
//!     }
//!
//!     async fn parse(&self, response: Arc<Response>) -> Result<ParseOutput, SpiderError> {
//!         let mut output = ParseOutput::new();
//!         output.add_item(serde_json::json!({ "url": response.url.as_str() }));
//!         Ok(output)
//!     }
//! }
//!
//! async fn run_crawler() -> Result<String, SpiderError> {
//!     let crawler = CrawlerBuilder::new(MySpider).build()?;
//!     crawler.start_crawl().await
//! }
//! ```

pub mod builder;
pub mod config;
pub mod crawler;
pub mod downloader;
pub mod error;
pub mod item;
pub mod middleware;
pub mod pipeline;
pub mod prelude;
pub mod request;
pub mod response;
pub mod scheduler;
pub mod signals;
pub mod spider;
pub mod state;
pub mod stats;

pub use builder::CrawlerBuilder;
pub use config::CrawlerConfig;
pub use crawler::{CrawlContext, Crawler};
pub use error::{PipelineError, SpiderError};
pub use scheduler::Scheduler;
pub use spider::Spider;

pub use async_trait::async_trait;
pub use tokio;
