//! Lifecycle notifications.
//!
//! Handlers are connected per [`Signal`] and fired with fire-and-collect
//! semantics: every handler runs, each result is reported back to the caller
//! and a failing handler never affects the others. Handlers steer the engine
//! through the typed [`SignalAction`] they return instead of raising.

use crate::error::SpiderError;
use crate::middleware::{Stage, process_parallel};
use crate::request::Request;
use crate::response::Response;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    EngineStarted,
    EngineStopped,
    SpiderOpened,
    SpiderIdle,
    SpiderClosed,
    SpiderError,
    RequestScheduled,
    RequestDropped,
    RequestReachedDownloader,
    ResponseReceived,
    ItemScraped,
    ItemDropped,
    ItemError,
}

/// Payload handed to handlers. Fields are filled depending on the signal.
#[derive(Debug, Clone, Default)]
pub struct SignalData {
    pub request: Option<Request>,
    pub response: Option<Arc<Response>>,
    pub item: Option<Value>,
    pub reason: Option<String>,
    pub error: Option<String>,
}

impl SignalData {
    pub fn request(request: &Request) -> Self {
        SignalData {
            request: Some(request.clone()),
            ..Default::default()
        }
    }

    pub fn reason(reason: impl Into<String>) -> Self {
        SignalData {
            reason: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn with_item(mut self, item: Value) -> Self {
        self.item = Some(item);
        self
    }

    pub fn with_error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_response(mut self, response: Arc<Response>) -> Self {
        self.response = Some(response);
        self
    }
}

/// What a handler wants the engine to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalAction {
    Continue,
    /// Vetoes closing on `SpiderIdle`.
    DontClose,
    /// Asks for the whole run to stop.
    CloseSpider(String),
}

#[async_trait]
pub trait SignalHandler: Stage {
    async fn handle(&self, signal: Signal, data: &SignalData) -> Result<SignalAction, SpiderError>;
}

/// Adapts a plain closure into a [`SignalHandler`].
pub struct FnHandler<F> {
    name: String,
    f: F,
}

impl<F> FnHandler<F>
where
    F: Fn(Signal, &SignalData) -> Result<SignalAction, SpiderError> + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        FnHandler {
            name: name.into(),
            f,
        }
    }
}

impl<F: Send + Sync + 'static> Stage for FnHandler<F> {
    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl<F> SignalHandler for FnHandler<F>
where
    F: Fn(Signal, &SignalData) -> Result<SignalAction, SpiderError> + Send + Sync + 'static,
{
    async fn handle(&self, signal: Signal, data: &SignalData) -> Result<SignalAction, SpiderError> {
        (self.f)(signal, data)
    }
}

pub type SignalResults = Vec<(String, Result<SignalAction, SpiderError>)>;

/// The notification bus of one run.
#[derive(Default)]
pub struct SignalManager {
    handlers: RwLock<HashMap<Signal, Vec<Arc<dyn SignalHandler>>>>,
}

impl SignalManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, signal: Signal, handler: Arc<dyn SignalHandler>) {
        self.handlers.write().entry(signal).or_default().push(handler);
    }

    /// Connects a closure; shorthand for `connect(signal, Arc::new(FnHandler::new(..)))`.
    pub fn connect_fn<F>(&self, signal: Signal, name: &str, f: F)
    where
        F: Fn(Signal, &SignalData) -> Result<SignalAction, SpiderError> + Send + Sync + 'static,
    {
        self.connect(signal, Arc::new(FnHandler::new(name, f)));
    }

    pub fn disconnect_all(&self, signal: Signal) {
        self.handlers.write().remove(&signal);
    }

    pub fn is_connected(&self, signal: Signal) -> bool {
        self.handlers
            .read()
            .get(&signal)
            .is_some_and(|handlers| !handlers.is_empty())
    }

    /// Runs every handler of `signal` and collects their results.
    pub async fn fire(&self, signal: Signal, data: SignalData) -> SignalResults {
        let handlers: Vec<Arc<dyn SignalHandler>> = match self.handlers.read().get(&signal) {
            Some(handlers) => handlers.clone(),
            None => return Vec::new(),
        };
        trace!("Firing {:?} to {} handlers", signal, handlers.len());

        let data = &data;
        let results = process_parallel(&handlers, |handler| {
            handler.handle(signal, data)
        })
        .await;

        for (name, result) in &results {
            if let Err(e) = result {
                error!("Signal handler '{}' failed on {:?}: {}", name, signal, e);
            }
        }
        results
    }

    /// Fires only when someone listens, so callers can skip building payloads.
    pub async fn fire_if_connected(
        &self,
        signal: Signal,
        data: impl FnOnce() -> SignalData,
    ) -> SignalResults {
        if !self.is_connected(signal) {
            return Vec::new();
        }
        self.fire(signal, data()).await
    }
}

/// True when any handler vetoed closing.
pub fn vetoed(results: &SignalResults) -> bool {
    results
        .iter()
        .any(|(_, result)| matches!(result, Ok(SignalAction::DontClose)))
}

/// The first close request among handler results.
pub fn close_request(results: &SignalResults) -> Option<String> {
    results.iter().find_map(|(_, result)| match result {
        Ok(SignalAction::CloseSpider(reason)) => Some(reason.clone()),
        _ => None,
    })
}
