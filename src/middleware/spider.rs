//! Spider-side stages: they wrap every callback invocation.
//!
//! A response goes through three phases:
//!
//! 1. input hooks, ascending priority; a failure skips the callback
//! 2. the callback, whose lazy output then flows through the output hooks in
//!    descending priority, each one wrapping the stream of the previous
//! 3. on any failure, the exception hooks starting right after the failing
//!    stage; the first one returning a replacement stream claims the error and
//!    the replacement continues through the output hooks after it
//!
//! Errors yielded from inside a stream take the same route. Their recovered
//! output is appended after the main stream. An error nobody claims is
//! wrapped in `SpiderError::Unhandled` so outer stages let it pass untouched.

use super::{LifecycleHooks, Stage, ordered, process_parallel};
use crate::crawler::CrawlContext;
use crate::error::SpiderError;
use crate::item::OutputStream;
use crate::response::Response;
use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt, ready};
use futures_util::stream::{self, StreamExt};
use log::debug;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

/// Hooks a spider stage implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiderHooks {
    pub input: bool,
    pub output: bool,
    pub exception: bool,
    pub lifecycle: LifecycleHooks,
}

impl SpiderHooks {
    pub const ALL: SpiderHooks = SpiderHooks {
        input: true,
        output: true,
        exception: true,
        lifecycle: LifecycleHooks::ALL,
    };
}

#[async_trait]
pub trait SpiderMiddleware: Stage {
    fn hooks(&self) -> SpiderHooks {
        SpiderHooks::ALL
    }

    async fn open_spider(&self, _ctx: &CrawlContext) -> Result<(), SpiderError> {
        Ok(())
    }

    async fn close_spider(&self, _ctx: &CrawlContext) -> Result<(), SpiderError> {
        Ok(())
    }

    async fn process_spider_input(&self, _response: &Arc<Response>) -> Result<(), SpiderError> {
        Ok(())
    }

    async fn process_spider_output(
        &self,
        _response: &Arc<Response>,
        output: OutputStream,
    ) -> Result<OutputStream, SpiderError> {
        Ok(output)
    }

    /// `Ok(Some(stream))` claims the error and replaces the output with `stream`.
    async fn process_spider_exception(
        &self,
        _response: &Arc<Response>,
        _error: &SpiderError,
    ) -> Result<Option<OutputStream>, SpiderError> {
        Ok(None)
    }
}

type StageList = Vec<Arc<dyn SpiderMiddleware>>;

/// Output recovered from errors raised mid-stream, emitted after the main output.
type Recovered = Arc<Mutex<VecDeque<OutputStream>>>;

pub struct SpiderMiddlewareManager {
    input_hooks: StageList,
    /// Descending priority. Output and exception walks share these indices.
    chain: StageList,
    open_hooks: StageList,
    close_hooks: StageList,
}

impl SpiderMiddlewareManager {
    pub fn new(stages: Vec<(i32, Arc<dyn SpiderMiddleware>)>) -> Self {
        let stages = ordered(stages);
        let input_hooks = stages.iter().filter(|s| s.hooks().input).cloned().collect();
        let open_hooks = stages
            .iter()
            .filter(|s| s.hooks().lifecycle.open)
            .cloned()
            .collect();
        let close_hooks = stages
            .iter()
            .filter(|s| s.hooks().lifecycle.close)
            .cloned()
            .collect();
        let chain = stages
            .into_iter()
            .rev()
            .filter(|s| {
                let hooks = s.hooks();
                hooks.output || hooks.exception
            })
            .collect();

        SpiderMiddlewareManager {
            input_hooks,
            chain,
            open_hooks,
            close_hooks,
        }
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

    /// Runs `callback` for `response` inside the input/output/exception protocol.
    pub async fn scrape_response<F, Fut>(
        self: &Arc<Self>,
        response: Arc<Response>,
        callback: F,
    ) -> Result<OutputStream, SpiderError>
    where
        F: FnOnce(Arc<Response>) -> Fut,
        Fut: Future<Output = Result<OutputStream, SpiderError>>,
    {
        let recovered: Recovered = Arc::new(Mutex::new(VecDeque::new()));

        let produced = match self.process_input(&response).await {
            Ok(()) => callback(Arc::clone(&response))
                .await
                .map(|output| self.guard(output, 0, &response, &recovered)),
            Err(error) => Err(error),
        };

        let output = match produced {
            Ok(output) => {
                Arc::clone(self)
                    .process_output(Arc::clone(&response), output, 0, Arc::clone(&recovered))
                    .await?
            }
            Err(error) => {
                let (replacement, resume) = self
                    .process_exception(&response, error, 0, &recovered)
                    .await?;
                Arc::clone(self)
                    .process_output(response, replacement, resume, Arc::clone(&recovered))
                    .await?
            }
        };

        Ok(output.chain(drain(recovered)).boxed())
    }

    async fn process_input(&self, response: &Arc<Response>) -> Result<(), SpiderError> {
        for stage in &self.input_hooks {
            stage.process_spider_input(response).await?;
        }
        Ok(())
    }

    fn process_output(
        self: Arc<Self>,
        response: Arc<Response>,
        output: OutputStream,
        start: usize,
        recovered: Recovered,
    ) -> BoxFuture<'static, Result<OutputStream, SpiderError>> {
        async move {
            let mut output = output;
            let mut index = start;
            while index < self.chain.len() {
                let stage = Arc::clone(&self.chain[index]);
                index += 1;
                if !stage.hooks().output {
                    continue;
                }
                match stage.process_spider_output(&response, output).await {
                    Ok(next) => output = self.guard(next, index, &response, &recovered),
                    Err(error) => {
                        let (replacement, resume) = self
                            .process_exception(&response, error, index, &recovered)
                            .await?;
                        output = replacement;
                        index = resume;
                    }
                }
            }
            Ok(output)
        }
        .boxed()
    }

    /// Walks the exception hooks from `start`; returns the replacement stream
    /// and the output index to resume at.
    async fn process_exception(
        self: &Arc<Self>,
        response: &Arc<Response>,
        error: SpiderError,
        start: usize,
        recovered: &Recovered,
    ) -> Result<(OutputStream, usize), SpiderError> {
        if matches!(error, SpiderError::Unhandled(_)) || error.is_contract_violation() {
            return Err(unhandled(error));
        }
        for index in start..self.chain.len() {
            let stage = &self.chain[index];
            if !stage.hooks().exception {
                continue;
            }
            match stage.process_spider_exception(response, &error).await {
                Ok(Some(replacement)) => {
                    debug!(
                        "Spider middleware '{}' recovered from: {}",
                        stage.name(),
                        error
                    );
                    let replacement = self.guard(replacement, index + 1, response, recovered);
                    return Ok((replacement, index + 1));
                }
                Ok(None) => {}
                Err(raised) => return Err(unhandled(raised)),
            }
        }
        Err(unhandled(error))
    }

    /// Routes errors yielded by `output` into the exception walk from `index`.
    ///
    /// The stream ends at its first error. Whatever an exception hook returns
    /// is run through the remaining output hooks and queued on `recovered`.
    fn guard(
        self: &Arc<Self>,
        output: OutputStream,
        index: usize,
        response: &Arc<Response>,
        recovered: &Recovered,
    ) -> OutputStream {
        if !self.chain[index.min(self.chain.len())..]
            .iter()
            .any(|s| s.hooks().exception)
        {
            return output;
        }

        let manager = Arc::clone(self);
        let response = Arc::clone(response);
        let recovered = Arc::clone(recovered);
        output
            .scan(false, move |failed, item| {
                let stop = *failed;
                if matches!(item, Err(ref e) if !matches!(e, SpiderError::Unhandled(_))) {
                    *failed = true;
                }
                let manager = Arc::clone(&manager);
                let response = Arc::clone(&response);
                let recovered = Arc::clone(&recovered);
                async move {
                    if stop {
                        return None;
                    }
                    let error = match item {
                        Err(error) if !matches!(error, SpiderError::Unhandled(_)) => error,
                        other => return Some(Some(other)),
                    };
                    let outcome = match manager
                        .process_exception(&response, error, index, &recovered)
                        .await
                    {
                        Ok((replacement, resume)) => {
                            Arc::clone(&manager)
                                .process_output(
                                    Arc::clone(&response),
                                    replacement,
                                    resume,
                                    Arc::clone(&recovered),
                                )
                                .await
                        }
                        Err(error) => Err(error),
                    };
                    match outcome {
                        Ok(stream) => {
                            recovered.lock().push_back(stream);
                            Some(None)
                        }
                        Err(error) => Some(Some(Err(error))),
                    }
                }
            })
            .filter_map(ready)
            .boxed()
    }
}

fn unhandled(error: SpiderError) -> SpiderError {
    match error {
        SpiderError::Unhandled(_) => error,
        other => SpiderError::Unhandled(Box::new(other)),
    }
}

/// Yields every queued recovered stream, including ones queued while draining.
fn drain(recovered: Recovered) -> OutputStream {
    stream::unfold(recovered, |recovered| async move {
        let next = recovered.lock().pop_front();
        next.map(|output| (output, recovered))
    })
    .flatten()
    .boxed()
}
