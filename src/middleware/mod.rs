//! # Middleware Module
//!
//! Ordered stage execution shared by every manager of the engine.
//!
//! ## Overview
//!
//! Stages are registered with a numeric priority. Each manager sorts its stages
//! once, at construction, and keeps one list per hook in the order that hook
//! runs: request hooks ascending, response and exception hooks descending. The
//! free functions in this module then walk those lists:
//!
//! - [`process_chain`]: call in order, each stage may replace the value or
//!   break out of the chain
//! - [`process_parallel`]: call every stage with the same input and collect
//!   `(stage name, result)` pairs, whatever the individual outcome
//!
//! Reverse-chain execution is `process_chain` over a list stored in reverse.
//! The three-phase input/output/exception protocol of the spider side lives in
//! [`spider`].

pub mod downloader;
pub mod spider;

use futures_util::future::join_all;
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;

/// Anything that can sit in a chain.
pub trait Stage: Send + Sync + 'static {
    /// Identity used in logs and in parallel results.
    fn name(&self) -> &str;
}

/// Lifecycle hooks a stage can opt into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleHooks {
    pub open: bool,
    pub close: bool,
}

impl LifecycleHooks {
    pub const ALL: LifecycleHooks = LifecycleHooks {
        open: true,
        close: true,
    };
    pub const NONE: LifecycleHooks = LifecycleHooks {
        open: false,
        close: false,
    };
}

/// Calls each handler in turn, threading the value through.
///
/// `Continue(value)` hands `value` to the next handler; `Break` stops the chain
/// and is returned as is. An error stops the chain as well. Managers keep one
/// list per hook, already in the order that hook runs.
pub async fn process_chain<'a, H, T, B, E, F, Fut>(
    handlers: &'a [Arc<H>],
    input: T,
    mut call: F,
) -> Result<ControlFlow<B, T>, E>
where
    H: ?Sized,
    F: FnMut(&'a H, T) -> Fut,
    Fut: Future<Output = Result<ControlFlow<B, T>, E>>,
{
    let mut current = input;
    for handler in handlers {
        match call(&**handler, current).await? {
            ControlFlow::Continue(next) => current = next,
            ControlFlow::Break(value) => return Ok(ControlFlow::Break(value)),
        }
    }
    Ok(ControlFlow::Continue(current))
}

/// Calls every handler concurrently with the same input.
///
/// Results come back in handler order. One handler failing never prevents the
/// others from running.
pub async fn process_parallel<'a, H, R, E, F, Fut>(
    handlers: &'a [Arc<H>],
    call: F,
) -> Vec<(String, Result<R, E>)>
where
    H: ?Sized + Stage,
    F: Fn(&'a H) -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    let mut calls = Vec::with_capacity(handlers.len());
    for handler in handlers {
        let handler: &'a H = handler;
        let fut = call(handler);
        calls.push(async move { (handler.name().to_string(), fut.await) });
    }
    join_all(calls).await
}

/// Sorts `(priority, stage)` pairs by priority, keeping registration order
/// among equals.
pub(crate) fn ordered<T: ?Sized>(mut stages: Vec<(i32, Arc<T>)>) -> Vec<Arc<T>> {
    stages.sort_by_key(|(priority, _)| *priority);
    stages.into_iter().map(|(_, stage)| stage).collect()
}
