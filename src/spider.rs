//! # Spider Module
//!
//! Defines the `Spider` trait, the user side of a crawl.
//!
//! ## Overview
//!
//! A spider says where a crawl starts (`start_urls` or `start_requests`) and
//! how each fetched response turns into records and follow-up requests
//! (`parse`). Records are JSON objects; anything a spider emits flows through
//! the spider middleware output chain and then, for records, through the item
//! pipelines.
//!
//! Callbacks take `&self`: the scraper runs many of them at once, so per-run
//! mutable state belongs behind the spider's own synchronization.
//!
//! ## Example
//!
//! ```rust,ignore
//! use spider_engine::prelude::*;
//! use std::sync::Arc;
//!
//! struct ArticleSpider;
//!
//! #[async_trait]
//! impl Spider for ArticleSpider {
//!     fn name(&self) -> &str {
//!         "articles"
//!     }
//!
//!     fn start_urls(&self) -> Vec<&'static str> {
//!         vec!["https://example.com/articles"]
//!     }
//!
//!     async fn parse(&self, response: Arc<Response>) -> Result<ParseOutput, SpiderError> {
//!         let mut output = ParseOutput::new();
//!         output.add_item(serde_json::json!({ "url": response.url.as_str() }));
//!         Ok(output)
//!     }
//! }
//! ```

use crate::error::SpiderError;
use crate::item::{OutputStream, ParseOutput};
use crate::request::Request;
use crate::response::Response;
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use url::Url;

/// Defines the contract for a web spider.
#[async_trait]
pub trait Spider: Send + Sync + 'static {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Returns the initial URLs to start crawling from.
    fn start_urls(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// The seed sequence of the crawl.
    ///
    /// Read lazily by the engine, one item per tick. The default builds a
    /// `GET` request per start URL with any fragment removed.
    fn start_requests(&self) -> BoxStream<'static, Result<Request, SpiderError>> {
        let seeds: Vec<Result<Request, SpiderError>> = self
            .start_urls()
            .into_iter()
            .map(|raw| {
                let mut url = Url::parse(raw)?;
                url.set_fragment(None);
                Ok(Request::new(url))
            })
            .collect();
        stream::iter(seeds).boxed()
    }

    /// Parses a response and extracts scraped items and new requests.
    ///
    /// `response.request()` carries the request that produced it, including
    /// its `callback` name and meta.
    async fn parse(&self, response: Arc<Response>) -> Result<ParseOutput, SpiderError>;

    /// Lazy form of `parse`. Spiders producing large outputs override this to
    /// stream results instead of collecting them.
    async fn scrape(&self, response: Arc<Response>) -> Result<OutputStream, SpiderError> {
        Ok(self.parse(response).await?.into_stream())
    }

    /// Handles a failed request whose `errback` is set.
    async fn errback(
        &self,
        _request: Request,
        _error: &SpiderError,
    ) -> Result<ParseOutput, SpiderError> {
        Ok(ParseOutput::new())
    }
}
