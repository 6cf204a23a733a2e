//! Fetched responses and the outcome of a single fetch.

use crate::error::SpiderError;
use crate::request::Request;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::OnceLock;
use url::Url;

/// A fetched resource.
#[derive(Debug, Clone)]
pub struct Response {
    pub url: Url,
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
    pub cookies: HashMap<String, String>,
    request: OnceLock<Request>,
}

impl Response {
    pub fn new(url: Url, status: u16, body: impl Into<Bytes>) -> Self {
        Response {
            url,
            status,
            headers: HashMap::new(),
            body: body.into(),
            cookies: HashMap::new(),
            request: OnceLock::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// The request that produced this response, once the engine has attached it.
    pub fn request(&self) -> Option<&Request> {
        self.request.get()
    }

    /// Sets the back-reference to the originating request.
    ///
    /// Only the first call has an effect; returns `false` if a request was
    /// already attached.
    pub fn attach_request(&self, request: Request) -> bool {
        self.request.set(request).is_ok()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// What a fetch produced.
#[derive(Debug)]
pub enum FetchOutcome {
    Response(Response),
    /// A stage replaced the fetch with a new request (redirect, retry).
    Request(Request),
    Error(SpiderError),
}

impl FetchOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            FetchOutcome::Response(_) => "response",
            FetchOutcome::Request(_) => "request",
            FetchOutcome::Error(_) => "error",
        }
    }
}
