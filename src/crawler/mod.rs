//! # Crawler Module
//!
//! The moving parts of one crawl run.
//!
//! ## Key Components
//!
//! - **CrawlContext**: settings, stats, signal bus and control handle of a run
//! - **Engine**: the tick loop moving requests between scheduler, downloader
//!   and scraper, with idle detection and ordered shutdown
//! - **Scraper**: bounded concurrent processing of fetch outcomes through the
//!   spider stages, the spider callbacks and the item pipelines
//! - **Crawler**: the handle returned by the builder
//!
//! ## Architecture
//!
//! Every in-flight fetch and every in-flight scrape is its own Tokio task. The
//! downloader reports outcomes over a channel that a single router task drains
//! into `Engine::handle_downloader_output`.

mod context;
mod core;
mod engine;
mod scraper;

pub use context::CrawlContext;
pub use self::core::Crawler;
pub use engine::{Engine, SeedStream};
pub use scraper::{ScrapeInput, Scraper};
