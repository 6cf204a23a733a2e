//! Per routing key concurrency and pacing state.

use crate::config::{CrawlerConfig, SlotConfig};
use crate::request::Request;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
pub(crate) struct SlotState {
    pub(crate) queue: VecDeque<Request>,
    pub(crate) transferring: usize,
    pub(crate) last_dispatch: Option<Instant>,
    pub(crate) last_seen: Instant,
    /// A deferred drain is already pending.
    pub(crate) drain_scheduled: bool,
}

/// One downloader slot.
///
/// Requests wait in a plain FIFO queue; at most `concurrency` of them are
/// transferring at any time and, with a delay configured, two dispatches are
/// at least one (possibly jittered) delay apart.
#[derive(Debug)]
pub struct Slot {
    key: String,
    concurrency: usize,
    delay: Duration,
    randomize_delay: bool,
    pub(crate) state: Mutex<SlotState>,
}

impl Slot {
    pub fn new(key: impl Into<String>, concurrency: usize, delay: Duration, randomize_delay: bool) -> Self {
        Slot {
            key: key.into(),
            concurrency: concurrency.max(1),
            delay,
            randomize_delay,
            state: Mutex::new(SlotState {
                queue: VecDeque::new(),
                transferring: 0,
                last_dispatch: None,
                last_seen: Instant::now(),
                drain_scheduled: false,
            }),
        }
    }

    /// Builds the slot for `key` from the defaults and any override in `config.slots`.
    pub fn from_config(key: &str, config: &CrawlerConfig) -> Self {
        let overrides = config.slots.get(key).cloned().unwrap_or_else(SlotConfig::default);
        Slot::new(
            key,
            overrides
                .concurrency
                .unwrap_or(config.concurrent_requests_per_domain),
            overrides.delay.unwrap_or(config.download_delay),
            overrides
                .randomize_delay
                .unwrap_or(config.randomize_download_delay),
        )
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn free_capacity(&self) -> usize {
        self.concurrency
            .saturating_sub(self.state.lock().transferring)
    }

    pub fn transferring(&self) -> usize {
        self.state.lock().transferring
    }

    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// The delay to honour before the next dispatch, jittered into
    /// `[0.5, 1.5]` of the configured value when randomization is on.
    pub fn next_delay(&self) -> Duration {
        if self.delay.is_zero() || !self.randomize_delay {
            return self.delay;
        }
        let factor = rand::thread_rng().gen_range(0.5..=1.5);
        self.delay.mul_f64(factor)
    }

    pub(crate) fn enqueue(&self, request: Request) {
        let mut state = self.state.lock();
        state.queue.push_back(request);
        state.last_seen = Instant::now();
    }

    /// True when nothing is queued or transferring and the slot has not been
    /// touched for longer than `grace`.
    pub fn is_reclaimable(&self, now: Instant, grace: Duration) -> bool {
        let state = self.state.lock();
        state.queue.is_empty()
            && state.transferring == 0
            && !state.drain_scheduled
            && now.saturating_duration_since(state.last_seen) > grace
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn jitter_stays_within_bounds() {
        let slot = Slot::new("example.com", 1, Duration::from_millis(1000), true);
        for _ in 0..200 {
            let delay = slot.next_delay();
            assert!(delay >= Duration::from_millis(500), "{:?}", delay);
            assert!(delay <= Duration::from_millis(1500), "{:?}", delay);
        }

        let fixed = Slot::new("example.com", 1, Duration::from_millis(1000), false);
        assert_eq!(fixed.next_delay(), Duration::from_millis(1000));
    }

    #[test]
    fn overrides_apply_per_key() {
        let mut slots = HashMap::new();
        slots.insert(
            "api.example.com".to_string(),
            SlotConfig {
                concurrency: Some(1),
                delay: Some(Duration::from_secs(2)),
                randomize_delay: Some(false),
            },
        );
        let config = CrawlerConfig {
            slots,
            ..CrawlerConfig::default()
        };

        let api = Slot::from_config("api.example.com", &config);
        assert_eq!(api.concurrency(), 1);
        assert_eq!(api.delay(), Duration::from_secs(2));
        assert_eq!(api.next_delay(), Duration::from_secs(2));

        let other = Slot::from_config("www.example.com", &config);
        assert_eq!(other.concurrency(), config.concurrent_requests_per_domain);
        assert_eq!(other.free_capacity(), config.concurrent_requests_per_domain);
        assert!(other.delay().is_zero());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_slots_become_reclaimable_after_grace() {
        let slot = Slot::new("example.com", 2, Duration::ZERO, false);
        let grace = Duration::from_secs(60);
        assert!(!slot.is_reclaimable(Instant::now(), grace));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(slot.is_reclaimable(Instant::now(), grace));

        slot.state.lock().transferring = 1;
        assert!(!slot.is_reclaimable(Instant::now(), grace));
    }
}
