//! Downloader-side stages: they wrap every fetch.
//!
//! Request hooks run in ascending priority order before the transport is
//! called. Response and exception hooks run in descending order afterwards, so
//! the stage closest to the transport sees the response first.

use super::{LifecycleHooks, Stage, ordered, process_chain, process_parallel};
use crate::crawler::CrawlContext;
use crate::downloader::Transport;
use crate::error::SpiderError;
use crate::request::Request;
use crate::response::{FetchOutcome, Response};
use async_trait::async_trait;
use log::{debug, trace};
use std::ops::ControlFlow;
use std::sync::Arc;

/// What a downloader hook wants to happen next.
#[derive(Debug)]
pub enum MiddlewareAction<T> {
    /// Hand the (possibly modified) value to the next stage.
    Continue(T),
    /// Abandon this fetch and send a new request back to the scheduler.
    Retry(Box<Request>),
    /// Stop the chain with this response.
    ReturnResponse(Response),
    /// Discard the request. Surfaces as `SpiderError::IgnoreRequest`.
    Drop,
}

impl<T> MiddlewareAction<T> {
    fn into_flow(self) -> ControlFlow<MiddlewareAction<T>, T> {
        match self {
            MiddlewareAction::Continue(value) => ControlFlow::Continue(value),
            other => ControlFlow::Break(other),
        }
    }
}

/// Hooks a downloader stage implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloaderHooks {
    pub request: bool,
    pub response: bool,
    pub exception: bool,
    pub lifecycle: LifecycleHooks,
}

impl DownloaderHooks {
    pub const ALL: DownloaderHooks = DownloaderHooks {
        request: true,
        response: true,
        exception: true,
        lifecycle: LifecycleHooks::ALL,
    };
}

#[async_trait]
pub trait DownloaderMiddleware: Stage {
    fn hooks(&self) -> DownloaderHooks {
        DownloaderHooks::ALL
    }

    async fn open_spider(&self, _ctx: &CrawlContext) -> Result<(), SpiderError> {
        Ok(())
    }

    async fn close_spider(&self, _ctx: &CrawlContext) -> Result<(), SpiderError> {
        Ok(())
    }

    async fn process_request(
        &self,
        request: Request,
    ) -> Result<MiddlewareAction<Request>, SpiderError> {
        Ok(MiddlewareAction::Continue(request))
    }

    async fn process_response(
        &self,
        _request: &Request,
        response: Response,
    ) -> Result<MiddlewareAction<Response>, SpiderError> {
        Ok(MiddlewareAction::Continue(response))
    }

    /// `Continue(error)` passes the error on; any other action claims it.
    async fn process_exception(
        &self,
        _request: &Request,
        error: SpiderError,
    ) -> Result<MiddlewareAction<SpiderError>, SpiderError> {
        Ok(MiddlewareAction::Continue(error))
    }
}

type StageList = Vec<Arc<dyn DownloaderMiddleware>>;

/// Runs the downloader stages around a transport call.
pub struct DownloaderMiddlewareManager {
    request_hooks: StageList,
    response_hooks: StageList,
    exception_hooks: StageList,
    open_hooks: StageList,
    close_hooks: StageList,
}

impl DownloaderMiddlewareManager {
    pub fn new(stages: Vec<(i32, Arc<dyn DownloaderMiddleware>)>) -> Self {
        let stages = ordered(stages);
        let select = |keep: fn(&DownloaderHooks) -> bool| -> StageList {
            stages.iter().filter(|s| keep(&s.hooks())).cloned().collect()
        };

        let request_hooks = select(|h| h.request);
        let mut response_hooks = select(|h| h.response);
        response_hooks.reverse();
        let mut exception_hooks = select(|h| h.exception);
        exception_hooks.reverse();
        let open_hooks = select(|h| h.lifecycle.open);
        let close_hooks = select(|h| h.lifecycle.close);

        DownloaderMiddlewareManager {
            request_hooks,
            response_hooks,
            exception_hooks,
            open_hooks,
            close_hooks,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.request_hooks.is_empty()
            && self.response_hooks.is_empty()
            && self.exception_hooks.is_empty()
    }

    pub async fn open_spider(&self, ctx: &CrawlContext) -> Vec<(String, Result<(), SpiderError>)> {
        process_parallel(&self.open_hooks, |stage| {
            stage.open_spider(ctx)
        })
        .await
    }

    pub async fn close_spider(&self, ctx: &CrawlContext) -> Vec<(String, Result<(), SpiderError>)> {
        process_parallel(&self.close_hooks, |stage| {
            stage.close_spider(ctx)
        })
        .await
    }

    pub async fn process_request(
        &self,
        request: Request,
    ) -> Result<ControlFlow<MiddlewareAction<Request>, Request>, SpiderError> {
        process_chain(
            &self.request_hooks,
            request,
            |stage, request| async move {
                trace!("Request hook '{}' <{}>", stage.name(), request.url);
                stage
                    .process_request(request)
                    .await
                    .map(MiddlewareAction::into_flow)
            },
        )
        .await
    }

    pub async fn process_response(
        &self,
        request: &Request,
        response: Response,
    ) -> Result<ControlFlow<MiddlewareAction<Response>, Response>, SpiderError> {
        process_chain(
            &self.response_hooks,
            response,
            |stage, response| async move {
                stage
                    .process_response(request, response)
                    .await
                    .map(MiddlewareAction::into_flow)
            },
        )
        .await
    }

    pub async fn process_exception(
        &self,
        request: &Request,
        error: SpiderError,
    ) -> Result<ControlFlow<MiddlewareAction<SpiderError>, SpiderError>, SpiderError> {
        process_chain(
            &self.exception_hooks,
            error,
            |stage, error| async move {
                stage
                    .process_exception(request, error)
                    .await
                    .map(MiddlewareAction::into_flow)
            },
        )
        .await
    }

    /// Runs one request through the stages and the transport.
    ///
    /// Returns the outcome together with the request as it was handed in.
    pub async fn download(
        &self,
        transport: &dyn Transport,
        request: Request,
    ) -> (FetchOutcome, Request) {
        let original = request.clone();

        let fetched = match self.process_request(request).await {
            Ok(ControlFlow::Continue(request)) => {
                let result = transport.fetch(&request).await;
                Some((result, request))
            }
            Ok(ControlFlow::Break(MiddlewareAction::ReturnResponse(response))) => {
                Some((Ok(response), original.clone()))
            }
            Ok(ControlFlow::Break(MiddlewareAction::Retry(next))) => {
                return (FetchOutcome::Request(*next), original);
            }
            Ok(ControlFlow::Break(MiddlewareAction::Drop)) => Some((
                Err(SpiderError::IgnoreRequest(format!(
                    "dropped by downloader middleware <{}>",
                    original.url
                ))),
                original.clone(),
            )),
            Ok(ControlFlow::Break(MiddlewareAction::Continue(_))) => None,
            Err(e) => Some((Err(e), original.clone())),
        };
        let Some((result, sent)) = fetched else {
            return (FetchOutcome::Error(contract_violation()), original);
        };

        let response = match result {
            Ok(response) => response,
            Err(error) => {
                let outcome = self.recover(&sent, error).await;
                return (outcome, original);
            }
        };

        let outcome = match self.process_response(&sent, response).await {
            Ok(ControlFlow::Continue(response)) => FetchOutcome::Response(response),
            Ok(ControlFlow::Break(action)) => match action {
                MiddlewareAction::ReturnResponse(response) => FetchOutcome::Response(response),
                MiddlewareAction::Retry(next) => FetchOutcome::Request(*next),
                MiddlewareAction::Drop => FetchOutcome::Error(SpiderError::IgnoreRequest(
                    format!("response dropped by downloader middleware <{}>", sent.url),
                )),
                MiddlewareAction::Continue(_) => FetchOutcome::Error(contract_violation()),
            },
            Err(e) => FetchOutcome::Error(e),
        };
        (outcome, original)
    }

    async fn recover(&self, request: &Request, error: SpiderError) -> FetchOutcome {
        match self.process_exception(request, error).await {
            Ok(ControlFlow::Continue(error)) | Err(error) => {
                debug!("Fetch of <{}> failed: {}", request.url, error);
                FetchOutcome::Error(error)
            }
            Ok(ControlFlow::Break(action)) => match action {
                MiddlewareAction::ReturnResponse(response) => FetchOutcome::Response(response),
                MiddlewareAction::Retry(next) => FetchOutcome::Request(*next),
                MiddlewareAction::Drop => FetchOutcome::Error(SpiderError::IgnoreRequest(
                    format!("failure dropped by downloader middleware <{}>", request.url),
                )),
                MiddlewareAction::Continue(_) => FetchOutcome::Error(contract_violation()),
            },
        }
    }
}

// `into_flow` never breaks with `Continue`; reaching this is a bug in the chain.
fn contract_violation() -> SpiderError {
    SpiderError::ContractViolation {
        stage: "downloader".to_string(),
        detail: "chain stopped with a continue action".to_string(),
    }
}
