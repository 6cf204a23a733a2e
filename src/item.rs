//! Things a spider callback produces.

use crate::error::SpiderError;
use crate::request::Request;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde_json::Value;

/// One element of a callback's output.
#[derive(Debug)]
pub enum SpiderOutput {
    /// A follow-up request to schedule.
    Request(Request),
    /// A record for the sink chain. Only JSON objects are valid records.
    Item(Value),
}

/// Lazy sequence of callback output flowing through the spider stages.
pub type OutputStream = BoxStream<'static, Result<SpiderOutput, SpiderError>>;

/// Eagerly collected callback output.
#[derive(Debug, Default)]
pub struct ParseOutput {
    items: Vec<Value>,
    requests: Vec<Request>,
}

impl ParseOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_item(&mut self, item: impl Into<Value>) {
        self.items.push(item.into());
    }

    pub fn add_request(&mut self, request: Request) {
        self.requests.push(request);
    }

    pub fn add_items<I: IntoIterator<Item = Value>>(&mut self, items: I) {
        self.items.extend(items);
    }

    pub fn add_requests<I: IntoIterator<Item = Request>>(&mut self, requests: I) {
        self.requests.extend(requests);
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.requests.is_empty()
    }

    pub fn into_parts(self) -> (Vec<Value>, Vec<Request>) {
        (self.items, self.requests)
    }

    /// Requests first, then items, as a lazy stream.
    pub fn into_stream(self) -> OutputStream {
        let requests = self.requests.into_iter().map(SpiderOutput::Request);
        let items = self.items.into_iter().map(SpiderOutput::Item);
        stream::iter(requests.chain(items).map(Ok)).boxed()
    }
}

/// An empty output stream.
pub fn empty_output() -> OutputStream {
    stream::empty().boxed()
}
