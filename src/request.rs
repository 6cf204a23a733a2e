//! The fetch request and its deduplication fingerprint.
//!
//! A `Request` is owned by exactly one component at a time: it moves from the
//! scheduler queue into a downloader slot, back to the engine and finally to
//! the scraper. It is treated as immutable once created; `Request::replace`
//! produces a modified copy and forgets the cached fingerprint.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::OnceLock;
use url::Url;

/// Meta key overriding the routing key of a request.
pub const META_DOWNLOAD_SLOT: &str = "download_slot";
/// Meta key naming the proxy a request goes through.
pub const META_PROXY: &str = "proxy";
/// Meta key holding the link depth of a request.
pub const META_DEPTH: &str = "depth";
/// Meta key holding the number of times a request has been retried.
pub const META_RETRY_TIMES: &str = "retry_times";

/// A request to fetch a single resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub url: Url,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
    pub cookies: HashMap<String, String>,
    pub meta: Map<String, Value>,
    /// Higher values are dequeued sooner.
    pub priority: i32,
    /// Skips duplicate suppression for this request.
    pub dont_filter: bool,
    /// Name of the spider callback handling the response.
    pub callback: Option<String>,
    /// Name of the spider error handler; failures are only routed to the
    /// spider when this is set.
    pub errback: Option<String>,
    #[serde(skip)]
    fingerprint: OnceLock<String>,
}

impl Request {
    /// Creates a `GET` request for the given URL.
    pub fn new(url: Url) -> Self {
        Request {
            url,
            method: "GET".to_string(),
            headers: HashMap::new(),
            body: Bytes::new(),
            cookies: HashMap::new(),
            meta: Map::new(),
            priority: 0,
            dont_filter: false,
            callback: None,
            errback: None,
            fingerprint: OnceLock::new(),
        }
    }

    /// Parses `url` and creates a `GET` request for it.
    pub fn parse(url: &str) -> Result<Self, url::ParseError> {
        Ok(Self::new(Url::parse(url)?))
    }

    pub fn with_method(mut self, method: &str) -> Self {
        self.method = method.to_ascii_uppercase();
        self.fingerprint = OnceLock::new();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self.fingerprint = OnceLock::new();
        self
    }

    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dont_filter(mut self, dont_filter: bool) -> Self {
        self.dont_filter = dont_filter;
        self
    }

    pub fn with_callback(mut self, callback: impl Into<String>) -> Self {
        self.callback = Some(callback.into());
        self
    }

    pub fn with_errback(mut self, errback: impl Into<String>) -> Self {
        self.errback = Some(errback.into());
        self
    }

    /// Uses `fingerprint` instead of the computed one.
    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = OnceLock::from(fingerprint.into());
        self
    }

    /// Returns a copy of this request with `overrides` applied.
    ///
    /// The copy recomputes its fingerprint on demand, except when the original
    /// carried an explicit one and the overrides left the identifying fields alone.
    pub fn replace(&self, overrides: impl FnOnce(&mut Request)) -> Request {
        let mut copy = self.clone();
        overrides(&mut copy);
        if copy.method != self.method || copy.url != self.url || copy.body != self.body {
            copy.fingerprint = OnceLock::new();
        }
        copy
    }

    /// Deterministic hash of method, canonical URL and body.
    pub fn fingerprint(&self) -> &str {
        self.fingerprint.get_or_init(|| {
            let mut hasher = Sha256::new();
            hasher.update(self.method.to_ascii_uppercase().as_bytes());
            hasher.update(b"\n");
            hasher.update(canonicalize_url(&self.url).as_str().as_bytes());
            hasher.update(b"\n");
            hasher.update(&self.body);
            hex::encode(hasher.finalize())
        })
    }

    /// The key of the downloader slot this request is routed through.
    pub fn routing_key(&self) -> String {
        if let Some(slot) = self.meta.get(META_DOWNLOAD_SLOT).and_then(Value::as_str) {
            return slot.to_string();
        }
        if let Some(proxy) = self.meta.get(META_PROXY).and_then(Value::as_str) {
            return match Url::parse(proxy) {
                Ok(url) => url.host_str().unwrap_or(proxy).to_string(),
                Err(_) => proxy.to_string(),
            };
        }
        self.url.host_str().unwrap_or_default().to_string()
    }

    pub fn depth(&self) -> u64 {
        self.meta.get(META_DEPTH).and_then(Value::as_u64).unwrap_or(0)
    }

    pub fn retry_times(&self) -> u64 {
        self.meta
            .get(META_RETRY_TIMES)
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }

    /// Builds a request for `url` one level deeper than this one.
    pub fn follow(&self, url: &str) -> Result<Request, url::ParseError> {
        let target = self.url.join(url)?;
        Ok(Request::new(target).with_meta(META_DEPTH, self.depth() + 1))
    }
}

/// Drops the fragment and sorts the query so equivalent URLs hash alike.
pub fn canonicalize_url(url: &Url) -> Url {
    let mut canonical = url.clone();
    canonical.set_fragment(None);
    let mut pairs: Vec<(String, String)> = canonical
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if pairs.is_empty() {
        canonical.set_query(None);
    } else {
        pairs.sort();
        canonical.query_pairs_mut().clear().extend_pairs(pairs);
    }
    canonical
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_ignores_fragment_and_query_order() {
        let a = Request::parse("https://example.com/p?b=2&a=1#top").unwrap();
        let b = Request::parse("https://example.com/p?a=1&b=2").unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_covers_method_and_body() {
        let get = Request::parse("https://example.com/form").unwrap();
        let post = get.replace(|r| r.method = "POST".into());
        let post_body = post.replace(|r| r.body = Bytes::from_static(b"q=1"));
        assert_ne!(get.fingerprint(), post.fingerprint());
        assert_ne!(post.fingerprint(), post_body.fingerprint());
    }

    #[test]
    fn explicit_fingerprint_survives_unrelated_replace() {
        let req = Request::parse("https://example.com/").unwrap().with_fingerprint("fixed");
        let bumped = req.replace(|r| r.priority = 10);
        assert_eq!(bumped.fingerprint(), "fixed");
        assert_eq!(bumped.priority, 10);
    }

    #[test]
    fn explicit_fingerprint_overrides_a_computed_one() {
        let req = Request::parse("https://example.com/").unwrap();
        let computed = req.fingerprint().to_string();

        let pinned = req.with_fingerprint("fixed");
        assert_ne!(computed, "fixed");
        assert_eq!(pinned.fingerprint(), "fixed");
        assert_eq!(pinned.with_fingerprint("again").fingerprint(), "again");
    }

    #[test]
    fn routing_key_prefers_slot_then_proxy_then_host() {
        let req = Request::parse("https://example.com/a").unwrap();
        assert_eq!(req.routing_key(), "example.com");

        let proxied = req.clone().with_meta(META_PROXY, "http://proxy.local:8080");
        assert_eq!(proxied.routing_key(), "proxy.local");

        let pinned = proxied.with_meta(META_DOWNLOAD_SLOT, "bucket-1");
        assert_eq!(pinned.routing_key(), "bucket-1");
    }

    #[test]
    fn follow_increments_depth() {
        let req = Request::parse("https://example.com/a/").unwrap();
        let next = req.follow("b").unwrap();
        assert_eq!(next.url.as_str(), "https://example.com/a/b");
        assert_eq!(next.depth(), 1);
        assert_eq!(next.follow("c").unwrap().depth(), 2);
    }
}
