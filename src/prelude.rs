//! A "prelude" for users of the `spider-engine` crate.
//!
//! This prelude re-exports the most commonly used traits and structs so that
//! they can be easily imported.
//!
//! # Example
//!
//! ```
//! use spider_engine::prelude::*;
//! ```

pub use crate::{
    // Core structs
    Crawler,
    CrawlerBuilder,
    CrawlerConfig,
    // Core traits
    Spider,
    // Essential re-exports for trait implementation
    async_trait,
};

pub use crate::crawler::CrawlContext;
pub use crate::downloader::Transport;
pub use crate::error::{PipelineError, SpiderError};
pub use crate::item::{OutputStream, ParseOutput, SpiderOutput};
pub use crate::middleware::Stage;
pub use crate::middleware::downloader::{DownloaderMiddleware, MiddlewareAction};
pub use crate::middleware::spider::SpiderMiddleware;
pub use crate::pipeline::Pipeline;
pub use crate::request::Request;
pub use crate::response::Response;
pub use crate::signals::{Signal, SignalAction, SignalData};
pub use crate::state::ControlHandle;
pub use std::time::Duration;
