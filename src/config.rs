//! Crawl configuration.
//!
//! `CrawlerConfig` can be assembled through `CrawlerBuilder` or loaded from
//! TOML. Durations are written in milliseconds in TOML:
//!
//! ```toml
//! concurrent_requests = 32
//! concurrent_requests_per_domain = 4
//! download_delay_ms = 250
//! dedup_policy = "out_queue"
//!
//! [slots."api.example.com"]
//! concurrency = 1
//! delay_ms = 1000
//! ```

use crate::error::SpiderError;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Where duplicate suppression happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DupePolicy {
    /// Seen fingerprints are rejected by `Scheduler::enqueue`.
    #[default]
    InQueue,
    /// Seen fingerprints are dropped while dequeuing, right before fetch.
    OutQueue,
}

/// Order in which pending requests leave the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    /// Highest priority first, insertion order among equals.
    #[default]
    Priority,
    Fifo,
    Lifo,
}

/// Which seen-set backs the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DupeStoreKind {
    #[default]
    Memory,
    Bloom,
}

/// Per routing key overrides of the downloader slot policy.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SlotConfig {
    pub concurrency: Option<usize>,
    #[serde(rename = "delay_ms", with = "duration_ms::option")]
    pub delay: Option<Duration>,
    pub randomize_delay: Option<bool>,
}

/// Configuration for every component of a crawl.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    /// Global ceiling of requests accepted by the downloader.
    pub concurrent_requests: usize,
    /// Default ceiling of in-flight fetches per slot.
    pub concurrent_requests_per_domain: usize,
    /// Default pause between two dispatches of the same slot.
    #[serde(rename = "download_delay_ms", with = "duration_ms")]
    pub download_delay: Duration,
    /// Jitters the delay into `[0.5, 1.5]` of its value.
    pub randomize_download_delay: bool,
    pub slots: HashMap<String, SlotConfig>,
    /// Number of fetch outcomes processed at the same time.
    pub scraper_concurrency: usize,
    /// Scraper backout threshold, in bytes of queued response bodies.
    pub scraper_max_active_size: usize,
    /// Cost floor of a single queued outcome.
    pub scraper_min_response_size: usize,
    pub dedup_policy: DupePolicy,
    pub queue_kind: QueueKind,
    pub dedup_store: DupeStoreKind,
    /// Expected number of fingerprints for the bloom store.
    pub bloom_capacity: usize,
    /// Requests pulled from the scheduler per drain; defaults to `concurrent_requests`.
    pub dequeue_batch_size: Option<usize>,
    #[serde(rename = "tick_interval_ms", with = "duration_ms")]
    pub tick_interval: Duration,
    #[serde(rename = "idle_confirm_delay_ms", with = "duration_ms")]
    pub idle_confirm_delay: Duration,
    #[serde(rename = "slot_gc_interval_ms", with = "duration_ms")]
    pub slot_gc_interval: Duration,
    #[serde(rename = "slot_gc_grace_ms", with = "duration_ms")]
    pub slot_gc_grace: Duration,
    #[serde(rename = "pause_log_interval_ms", with = "duration_ms")]
    pub pause_log_interval: Duration,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        CrawlerConfig {
            concurrent_requests: 16,
            concurrent_requests_per_domain: 8,
            download_delay: Duration::ZERO,
            randomize_download_delay: true,
            slots: HashMap::new(),
            scraper_concurrency: num_cpus::get().clamp(4, 16),
            scraper_max_active_size: 5_000_000,
            scraper_min_response_size: 1024,
            dedup_policy: DupePolicy::default(),
            queue_kind: QueueKind::default(),
            dedup_store: DupeStoreKind::default(),
            bloom_capacity: 1_000_000,
            dequeue_batch_size: None,
            tick_interval: Duration::from_millis(100),
            idle_confirm_delay: Duration::from_millis(50),
            slot_gc_interval: Duration::from_secs(60),
            slot_gc_grace: Duration::from_secs(60),
            pause_log_interval: Duration::from_secs(10),
        }
    }
}

impl CrawlerConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, SpiderError> {
        let config: CrawlerConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SpiderError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    pub fn dequeue_batch(&self) -> usize {
        self.dequeue_batch_size
            .unwrap_or(self.concurrent_requests)
            .max(1)
    }

    pub fn validate(&self) -> Result<(), SpiderError> {
        if self.concurrent_requests == 0 {
            return Err(SpiderError::Configuration(
                "concurrent_requests must be greater than 0.".to_string(),
            ));
        }
        if self.concurrent_requests_per_domain == 0 {
            return Err(SpiderError::Configuration(
                "concurrent_requests_per_domain must be greater than 0.".to_string(),
            ));
        }
        if self.scraper_concurrency == 0 {
            return Err(SpiderError::Configuration(
                "scraper_concurrency must be greater than 0.".to_string(),
            ));
        }
        if self.tick_interval.is_zero() {
            return Err(SpiderError::Configuration(
                "tick_interval must be greater than 0.".to_string(),
            ));
        }
        if self.slot_gc_interval.is_zero() {
            return Err(SpiderError::Configuration(
                "slot_gc_interval must be greater than 0.".to_string(),
            ));
        }
        for (key, slot) in &self.slots {
            if slot.concurrency == Some(0) {
                return Err(SpiderError::Configuration(format!(
                    "slot '{}' concurrency must be greater than 0.",
                    key
                )));
            }
        }
        Ok(())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }

    pub mod option {
        use serde::{Deserialize, Deserializer};
        use std::time::Duration;

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_toml_with_slot_overrides() {
        let config = CrawlerConfig::from_toml_str(
            r#"
            concurrent_requests = 32
            download_delay_ms = 250
            dedup_policy = "out_queue"
            queue_kind = "lifo"

            [slots."api.example.com"]
            concurrency = 1
            delay_ms = 1000
            "#,
        )
        .unwrap();

        assert_eq!(config.concurrent_requests, 32);
        assert_eq!(config.download_delay, Duration::from_millis(250));
        assert_eq!(config.dedup_policy, DupePolicy::OutQueue);
        assert_eq!(config.queue_kind, QueueKind::Lifo);
        assert_eq!(config.dequeue_batch(), 32);
        let slot = &config.slots["api.example.com"];
        assert_eq!(slot.concurrency, Some(1));
        assert_eq!(slot.delay, Some(Duration::from_secs(1)));
        assert_eq!(slot.randomize_delay, None);
        assert_eq!(config.concurrent_requests_per_domain, 8);
    }

    #[test]
    fn rejects_zero_ceilings() {
        let err = CrawlerConfig::from_toml_str("concurrent_requests = 0").unwrap_err();
        assert!(matches!(err, SpiderError::Configuration(_)));

        let err = CrawlerConfig::from_toml_str("[slots.a]\nconcurrency = 0").unwrap_err();
        assert!(matches!(err, SpiderError::Configuration(_)));
    }

    #[test]
    fn rejects_zero_intervals() {
        let err = CrawlerConfig::from_toml_str("slot_gc_interval_ms = 0").unwrap_err();
        assert!(matches!(err, SpiderError::Configuration(ref msg) if msg.contains("slot_gc_interval")));

        let err = CrawlerConfig::from_toml_str("tick_interval_ms = 0").unwrap_err();
        assert!(matches!(err, SpiderError::Configuration(ref msg) if msg.contains("tick_interval")));
    }
}
