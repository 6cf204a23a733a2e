//! # Statistics Module
//!
//! Collects counters about a crawl run.
//!
//! ## Overview
//!
//! The `StatCollector` lives in the run context and is shared by the engine,
//! scheduler, downloader and scraper. Every counter is an atomic so components
//! can update it from any task without coordination.
//!
//! ## Key Metrics Tracked
//!
//! - **Request Metrics**: enqueued, filtered as duplicates, dropped by stages,
//!   sent to the transport, succeeded, failed, re-scheduled by stages
//! - **Response Metrics**: received, bytes downloaded, status distribution
//! - **Item Metrics**: scraped, dropped by sinks, failed in sinks
//! - **Error Metrics**: unhandled spider errors, stage contract violations
//!
//! ## Example
//!
//! ```rust,ignore
//! let stats = crawler.get_stats();
//! println!("{}", stats.to_json_string_pretty()?);
//! println!("{}", stats.to_markdown_string());
//! ```

use crate::error::SpiderError;
use parking_lot::RwLock;
use serde::Serialize;
use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

// Point-in-time copy of the counters, used by every export format.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub requests_enqueued: usize,
    pub requests_filtered: usize,
    pub requests_dropped: usize,
    pub requests_sent: usize,
    pub requests_succeeded: usize,
    pub requests_failed: usize,
    pub requests_rescheduled: usize,
    pub responses_received: usize,
    pub total_bytes_downloaded: usize,
    pub items_scraped: usize,
    pub items_dropped: usize,
    pub item_errors: usize,
    pub spider_errors: usize,
    pub contract_violations: usize,
    pub response_status_counts: BTreeMap<u16, usize>,
    pub finish_reason: Option<String>,
    #[serde(serialize_with = "serialize_secs")]
    pub elapsed_duration: Duration,
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

impl StatsSnapshot {
    /// Labelled counters grouped by report section, in report order.
    fn sections(&self) -> Vec<(&'static str, Vec<(&'static str, String)>)> {
        vec![
            (
                "Requests",
                vec![
                    ("enqueued", self.requests_enqueued.to_string()),
                    ("filtered", self.requests_filtered.to_string()),
                    ("dropped", self.requests_dropped.to_string()),
                    ("sent", self.requests_sent.to_string()),
                    ("succeeded", self.requests_succeeded.to_string()),
                    ("failed", self.requests_failed.to_string()),
                    ("rescheduled", self.requests_rescheduled.to_string()),
                ],
            ),
            (
                "Responses",
                vec![
                    ("received", self.responses_received.to_string()),
                    ("downloaded", self.formatted_bytes()),
                ],
            ),
            (
                "Items",
                vec![
                    ("scraped", self.items_scraped.to_string()),
                    ("dropped", self.items_dropped.to_string()),
                    ("errors", self.item_errors.to_string()),
                ],
            ),
            (
                "Errors",
                vec![
                    ("spider", self.spider_errors.to_string()),
                    ("contract violations", self.contract_violations.to_string()),
                ],
            ),
        ]
    }

    fn rate(&self, count: usize) -> f64 {
        let secs = self.elapsed_duration.as_secs_f64();
        if secs >= 1.0 { count as f64 / secs } else { 0.0 }
    }

    fn formatted_bytes(&self) -> String {
        const UNITS: [&str; 3] = ["KB", "MB", "GB"];
        let bytes = self.total_bytes_downloaded;
        if bytes < 1024 {
            return format!("{} B", bytes);
        }
        let mut value = bytes as f64;
        let mut unit = "B";
        for next in UNITS {
            if value < 1024.0 {
                break;
            }
            value /= 1024.0;
            unit = next;
        }
        format!("{:.2} {}", value, unit)
    }

    fn finished(&self) -> &str {
        self.finish_reason.as_deref().unwrap_or("running")
    }
}

/// Collects and stores statistics about a crawl run.
#[derive(Debug)]
pub struct StatCollector {
    pub start_time: Instant,

    pub requests_enqueued: AtomicUsize,
    pub requests_filtered: AtomicUsize,
    pub requests_dropped: AtomicUsize,
    pub requests_sent: AtomicUsize,
    pub requests_succeeded: AtomicUsize,
    pub requests_failed: AtomicUsize,
    pub requests_rescheduled: AtomicUsize,

    pub responses_received: AtomicUsize,
    pub response_status_counts: Arc<dashmap::DashMap<u16, usize>>,
    pub total_bytes_downloaded: AtomicUsize,

    pub items_scraped: AtomicUsize,
    pub items_dropped: AtomicUsize,
    pub item_errors: AtomicUsize,

    pub spider_errors: AtomicUsize,
    pub contract_violations: AtomicUsize,

    finish_reason: RwLock<Option<String>>,
}

impl StatCollector {
    /// Creates a new `StatCollector` with all counters at zero.
    pub fn new() -> Self {
        StatCollector {
            start_time: Instant::now(),
            requests_enqueued: AtomicUsize::new(0),
            requests_filtered: AtomicUsize::new(0),
            requests_dropped: AtomicUsize::new(0),
            requests_sent: AtomicUsize::new(0),
            requests_succeeded: AtomicUsize::new(0),
            requests_failed: AtomicUsize::new(0),
            requests_rescheduled: AtomicUsize::new(0),
            responses_received: AtomicUsize::new(0),
            response_status_counts: Arc::new(dashmap::DashMap::new()),
            total_bytes_downloaded: AtomicUsize::new(0),
            items_scraped: AtomicUsize::new(0),
            items_dropped: AtomicUsize::new(0),
            item_errors: AtomicUsize::new(0),
            spider_errors: AtomicUsize::new(0),
            contract_violations: AtomicUsize::new(0),
            finish_reason: RwLock::new(None),
        }
    }

    /// Creates a snapshot of the current statistics.
    pub fn snapshot(&self) -> StatsSnapshot {
        let response_status_counts = self
            .response_status_counts
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();

        StatsSnapshot {
            requests_enqueued: self.requests_enqueued.load(Ordering::SeqCst),
            requests_filtered: self.requests_filtered.load(Ordering::SeqCst),
            requests_dropped: self.requests_dropped.load(Ordering::SeqCst),
            requests_sent: self.requests_sent.load(Ordering::SeqCst),
            requests_succeeded: self.requests_succeeded.load(Ordering::SeqCst),
            requests_failed: self.requests_failed.load(Ordering::SeqCst),
            requests_rescheduled: self.requests_rescheduled.load(Ordering::SeqCst),
            responses_received: self.responses_received.load(Ordering::SeqCst),
            total_bytes_downloaded: self.total_bytes_downloaded.load(Ordering::SeqCst),
            items_scraped: self.items_scraped.load(Ordering::SeqCst),
            items_dropped: self.items_dropped.load(Ordering::SeqCst),
            item_errors: self.item_errors.load(Ordering::SeqCst),
            spider_errors: self.spider_errors.load(Ordering::SeqCst),
            contract_violations: self.contract_violations.load(Ordering::SeqCst),
            response_status_counts,
            finish_reason: self.finish_reason(),
            elapsed_duration: self.start_time.elapsed(),
        }
    }

    pub(crate) fn increment_requests_enqueued(&self) {
        self.requests_enqueued.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_requests_filtered(&self) {
        self.requests_filtered.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_requests_dropped(&self) {
        self.requests_dropped.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_requests_sent(&self) {
        self.requests_sent.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_requests_succeeded(&self) {
        self.requests_succeeded.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_requests_failed(&self) {
        self.requests_failed.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_requests_rescheduled(&self) {
        self.requests_rescheduled.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_responses_received(&self) {
        self.responses_received.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_response_status(&self, status_code: u16) {
        *self.response_status_counts.entry(status_code).or_insert(0) += 1;
    }

    pub(crate) fn add_bytes_downloaded(&self, bytes: usize) {
        self.total_bytes_downloaded
            .fetch_add(bytes, Ordering::SeqCst);
    }

    pub(crate) fn increment_items_scraped(&self) {
        self.items_scraped.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_items_dropped(&self) {
        self.items_dropped.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_item_errors(&self) {
        self.item_errors.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_spider_errors(&self) {
        self.spider_errors.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_contract_violations(&self) {
        self.contract_violations.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn set_finish_reason(&self, reason: &str) {
        *self.finish_reason.write() = Some(reason.to_string());
    }

    pub fn finish_reason(&self) -> Option<String> {
        self.finish_reason.read().clone()
    }

    pub fn to_json_string(&self) -> Result<String, SpiderError> {
        Ok(serde_json::to_string(&self.snapshot())?)
    }

    pub fn to_json_string_pretty(&self) -> Result<String, SpiderError> {
        Ok(serde_json::to_string_pretty(&self.snapshot())?)
    }

    /// Exports the current statistics as a Markdown report.
    pub fn to_markdown_string(&self) -> String {
        let snapshot = self.snapshot();
        let mut report = format!(
            "# Crawl report\n\n- **Elapsed**: {:?}\n- **Finish reason**: {}\n- **Throughput**: {:.2} requests/s, {:.2} items/s\n",
            snapshot.elapsed_duration,
            snapshot.finished(),
            snapshot.rate(snapshot.requests_sent),
            snapshot.rate(snapshot.items_scraped),
        );
        for (section, rows) in snapshot.sections() {
            report.push_str(&format!("\n## {}\n\n| Counter | Value |\n|---|---|\n", section));
            for (label, value) in rows {
                report.push_str(&format!("| {} | {} |\n", label, value));
            }
        }

        report.push_str("\n## Status codes\n\n");
        if snapshot.response_status_counts.is_empty() {
            report.push_str("none\n");
        }
        for (code, count) in &snapshot.response_status_counts {
            report.push_str(&format!("- **{}**: {}\n", code, count));
        }
        report
    }
}

impl Default for StatCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StatCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        writeln!(
            f,
            "crawl {} after {:?}",
            snapshot.finished(),
            snapshot.elapsed_duration
        )?;
        for (section, rows) in snapshot.sections() {
            let rows: Vec<String> = rows
                .into_iter()
                .map(|(label, value)| format!("{}={}", label, value))
                .collect();
            writeln!(f, "  {:<10} {}", section.to_lowercase(), rows.join(" "))?;
        }
        let statuses: Vec<String> = snapshot
            .response_status_counts
            .iter()
            .map(|(code, count)| format!("{}={}", code, count))
            .collect();
        writeln!(f, "  {:<10} {}", "statuses", statuses.join(" "))
    }
}
