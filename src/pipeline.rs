//! Sink stages for scraped records.
//!
//! Every record a spider produces runs through the registered pipelines in
//! ascending priority order. A pipeline can:
//! - pass the record on, possibly transformed;
//! - drop it by returning `PipelineError::DropItem`, which stops the chain;
//! - fail with any other error, which also stops the chain and is reported.
//!
//! Records are JSON objects. A pipeline returning anything else breaks its
//! contract and the record is discarded.

use crate::crawler::CrawlContext;
use crate::error::PipelineError;
use crate::middleware::{Stage, ordered, process_chain, process_parallel};
use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, trace};
use serde_json::Value;
use std::convert::Infallible;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[async_trait]
pub trait Pipeline: Stage {
    /// Called once when the crawl opens.
    async fn open(&self, _ctx: &CrawlContext) -> Result<(), PipelineError> {
        Ok(())
    }

    async fn process_item(&self, item: Value, ctx: &CrawlContext) -> Result<Value, PipelineError>;

    /// Called when the spider is closing.
    async fn close(&self, _ctx: &CrawlContext) -> Result<(), PipelineError> {
        Ok(())
    }
}

/// What became of one record.
#[derive(Debug)]
pub enum ItemOutcome {
    /// Went through every stage.
    Scraped(Value),
    /// A stage dropped it; carries the record as produced by the spider.
    Dropped { item: Value, reason: String },
    /// A stage failed; carries the record as produced by the spider.
    Failed { item: Value, error: PipelineError },
}

/// Accumulated time spent in one stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageTiming {
    pub total: Duration,
    pub calls: usize,
}

pub struct ItemPipelineManager {
    stages: Vec<Arc<dyn Pipeline>>,
    timings: DashMap<String, StageTiming>,
}

impl ItemPipelineManager {
    pub fn new(stages: Vec<(i32, Arc<dyn Pipeline>)>) -> Self {
        ItemPipelineManager {
            stages: ordered(stages),
            timings: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub async fn open(&self, ctx: &CrawlContext) -> Vec<(String, Result<(), PipelineError>)> {
        process_parallel(&self.stages, |stage| stage.open(ctx)).await
    }

    pub async fn close(&self, ctx: &CrawlContext) -> Vec<(String, Result<(), PipelineError>)> {
        process_parallel(&self.stages, |stage| stage.close(ctx)).await
    }

    /// Runs `item` through every stage in order.
    pub async fn process_item(&self, item: Value, ctx: &CrawlContext) -> ItemOutcome {
        let produced = item.clone();
        let result: Result<ControlFlow<Infallible, Value>, PipelineError> = process_chain(
            &self.stages,
            item,
            |stage, item| async move {
                trace!("Processing item through pipeline '{}'", stage.name());
                let started = Instant::now();
                let result = stage.process_item(item, ctx).await;
                self.record_timing(stage.name(), started.elapsed());

                let item = match result {
                    Ok(item) => item,
                    Err(e) => return Err(e),
                };
                if !item.is_object() {
                    return Err(PipelineError::ContractViolation {
                        stage: stage.name().to_string(),
                        detail: format!("expected a mapping record, got {}", kind_of(&item)),
                    });
                }
                Ok(ControlFlow::Continue(item))
            },
        )
        .await;

        match result {
            Ok(ControlFlow::Continue(item)) => ItemOutcome::Scraped(item),
            Ok(ControlFlow::Break(never)) => match never {},
            Err(PipelineError::DropItem(reason)) => {
                debug!("Item dropped: {}", reason);
                ItemOutcome::Dropped {
                    item: produced,
                    reason,
                }
            }
            Err(error) => ItemOutcome::Failed {
                item: produced,
                error,
            },
        }
    }

    fn record_timing(&self, stage: &str, elapsed: Duration) {
        let mut timing = self.timings.entry(stage.to_string()).or_default();
        timing.total += elapsed;
        timing.calls += 1;
    }

    /// Per-stage timings, in stage order.
    pub fn stage_timings(&self) -> Vec<(String, StageTiming)> {
        self.stages
            .iter()
            .map(|stage| {
                let timing = self
                    .timings
                    .get(stage.name())
                    .map(|t| *t)
                    .unwrap_or_default();
                (stage.name().to_string(), timing)
            })
            .collect()
    }
}

pub(crate) fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
