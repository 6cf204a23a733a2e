//! Error types shared by every component of the engine.
//!
//! `SpiderError` covers transport failures, callback failures, stage contract
//! violations and the typed close request. `PipelineError` is what sink stages
//! return; `PipelineError::DropItem` is the drop signal and is not logged as a
//! failure.

use thiserror::Error;

/// The crate-wide error type.
#[derive(Debug, Error)]
pub enum SpiderError {
    /// Network or protocol failure while fetching.
    #[error("transport error for {url}: {message}")]
    Transport { url: String, message: String },

    /// The transport gave up waiting for a response.
    #[error("timeout fetching {url}")]
    Timeout { url: String },

    /// A downloader stage declined the request. Counted, never logged as a failure.
    #[error("request ignored: {0}")]
    IgnoreRequest(String),

    /// A stage returned something outside of its contract.
    #[error("stage '{stage}' violated its contract: {detail}")]
    ContractViolation { stage: String, detail: String },

    /// A spider callback failed.
    #[error("callback error: {0}")]
    Callback(String),

    /// Something in the run asked for the whole crawl to stop.
    #[error("close requested: {0}")]
    CloseSpider(String),

    /// An error that already walked the exception hooks without being claimed.
    #[error(transparent)]
    Unhandled(Box<SpiderError>),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("{0}")]
    General(String),
}

impl SpiderError {
    /// Strips any `Unhandled` wrapping and returns the original error.
    pub fn into_root(self) -> SpiderError {
        match self {
            SpiderError::Unhandled(inner) => inner.into_root(),
            other => other,
        }
    }

    /// Returns the original error without consuming it.
    pub fn root(&self) -> &SpiderError {
        match self {
            SpiderError::Unhandled(inner) => inner.root(),
            other => other,
        }
    }

    pub fn is_contract_violation(&self) -> bool {
        matches!(self.root(), SpiderError::ContractViolation { .. })
    }

    /// Returns the close reason when this error is a close request.
    pub fn close_reason(&self) -> Option<&str> {
        match self.root() {
            SpiderError::CloseSpider(reason) => Some(reason),
            _ => None,
        }
    }

    /// Builds a transport error from anything displayable.
    pub fn transport(url: impl Into<String>, err: impl std::fmt::Display) -> Self {
        SpiderError::Transport {
            url: url.into(),
            message: err.to_string(),
        }
    }
}

/// Keeps the whole context chain of errors raised by `anyhow`-based helpers.
impl From<anyhow::Error> for SpiderError {
    fn from(err: anyhow::Error) -> Self {
        SpiderError::General(format!("{:#}", err))
    }
}

/// Errors raised by sink stages.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Drop signal: the record must not reach further stages.
    #[error("item dropped: {0}")]
    DropItem(String),

    #[error("item error: {0}")]
    Item(String),

    #[error("stage '{stage}' violated its contract: {detail}")]
    ContractViolation { stage: String, detail: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
