//! The network boundary of the downloader.

use crate::error::SpiderError;
use crate::request::Request;
use crate::response::Response;
use async_trait::async_trait;

/// Performs a single fetch.
///
/// Failures must come back as `Err`; timeouts are the transport's business and
/// surface as `SpiderError::Timeout`.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn fetch(&self, request: &Request) -> Result<Response, SpiderError>;

    async fn close(&self) -> Result<(), SpiderError> {
        Ok(())
    }
}

#[cfg(feature = "reqwest-transport")]
pub use reqwest_transport::ReqwestTransport;

#[cfg(feature = "reqwest-transport")]
mod reqwest_transport {
    use super::Transport;
    use crate::error::SpiderError;
    use crate::request::Request;
    use crate::response::Response;
    use anyhow::Context;
    use async_trait::async_trait;
    use reqwest::header::{COOKIE, HeaderMap, HeaderName, HeaderValue, SET_COOKIE};
    use reqwest::{Client, Method};
    use std::time::Duration;

    const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    /// HTTP transport backed by a pooled `reqwest::Client`.
    #[derive(Debug, Clone)]
    pub struct ReqwestTransport {
        client: Client,
    }

    impl ReqwestTransport {
        pub fn new() -> Result<Self, SpiderError> {
            Self::with_timeout(DEFAULT_TIMEOUT)
        }

        pub fn with_timeout(timeout: Duration) -> Result<Self, SpiderError> {
            let client = Client::builder()
                .timeout(timeout)
                .gzip(true)
                .build()
                .map_err(|e| SpiderError::Configuration(format!("http client: {}", e)))?;
            Ok(ReqwestTransport { client })
        }

        pub fn from_client(client: Client) -> Self {
            ReqwestTransport { client }
        }

        fn headers(request: &Request) -> anyhow::Result<HeaderMap> {
            let mut headers = HeaderMap::new();
            for (key, value) in &request.headers {
                let name = HeaderName::from_bytes(key.as_bytes())
                    .with_context(|| format!("invalid header name '{}'", key))?;
                let value = HeaderValue::from_str(value)
                    .with_context(|| format!("invalid value for header '{}'", key))?;
                headers.insert(name, value);
            }
            if !request.cookies.is_empty() {
                let cookie = request
                    .cookies
                    .iter()
                    .map(|(name, value)| format!("{}={}", name, value))
                    .collect::<Vec<_>>()
                    .join("; ");
                let value = HeaderValue::from_str(&cookie).context("invalid cookie header")?;
                headers.insert(COOKIE, value);
            }
            Ok(headers)
        }
    }

    #[async_trait]
    impl Transport for ReqwestTransport {
        async fn fetch(&self, request: &Request) -> Result<Response, SpiderError> {
            let url = request.url.as_str();
            let method = Method::from_bytes(request.method.as_bytes())
                .map_err(|e| SpiderError::transport(url, e))?;

            let sent = self
                .client
                .request(method, request.url.clone())
                .headers(
                    Self::headers(request)
                        .map_err(|e| SpiderError::transport(url, format!("{:#}", e)))?,
                )
                .body(request.body.clone())
                .send()
                .await
                .map_err(|e| map_error(url, e))?;

            let status = sent.status().as_u16();
            let final_url = sent.url().clone();
            let mut headers = std::collections::HashMap::new();
            let mut cookies = std::collections::HashMap::new();
            for (name, value) in sent.headers() {
                let Ok(value) = value.to_str() else {
                    continue;
                };
                if name == SET_COOKIE {
                    if let Some((key, rest)) = value.split_once('=') {
                        let cookie_value = rest.split(';').next().unwrap_or_default();
                        cookies.insert(key.trim().to_string(), cookie_value.to_string());
                    }
                }
                headers.insert(name.as_str().to_string(), value.to_string());
            }
            let body = sent.bytes().await.map_err(|e| map_error(url, e))?;

            let mut response = Response::new(final_url, status, body);
            response.headers = headers;
            response.cookies = cookies;
            Ok(response)
        }
    }

    fn map_error(url: &str, err: reqwest::Error) -> SpiderError {
        if err.is_timeout() {
            SpiderError::Timeout {
                url: url.to_string(),
            }
        } else {
            SpiderError::transport(url, err)
        }
    }

}
