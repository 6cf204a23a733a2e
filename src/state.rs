//! Module for tracking the run state of the engine.
//!
//! `CrawlerState` holds the lifecycle status (`idle → running → draining →
//! closed`, each transition happening at most once) and the number of requests
//! the engine has handed to the downloader but not yet routed onward.
//!
//! `ControlHandle` is the external steering wheel of a run: pause for a while,
//! resume, or ask for a close. Close requests are only recorded here; the
//! engine loop picks them up on its next tick, so a close is never performed
//! from inside the callback that asked for it.

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineStatus {
    Idle = 0,
    Running = 1,
    Draining = 2,
    Closed = 3,
}

impl EngineStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => EngineStatus::Idle,
            1 => EngineStatus::Running,
            2 => EngineStatus::Draining,
            _ => EngineStatus::Closed,
        }
    }
}

/// Represents the shared run state of the engine.
#[derive(Debug)]
pub struct CrawlerState {
    status: AtomicU8,
    /// Requests handed to the downloader whose outcome was not routed yet.
    pub in_progress: AtomicUsize,
}

impl Default for CrawlerState {
    fn default() -> Self {
        CrawlerState {
            status: AtomicU8::new(EngineStatus::Idle as u8),
            in_progress: AtomicUsize::new(0),
        }
    }
}

impl CrawlerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    /// Moves from `from` to `to`; false if the state was not `from`.
    pub fn transition(&self, from: EngineStatus, to: EngineStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_running(&self) -> bool {
        self.status() == EngineStatus::Running
    }

    pub fn is_closed(&self) -> bool {
        self.status() == EngineStatus::Closed
    }

    pub fn in_progress(&self) -> usize {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Counts one unit of work as in progress until the guard is dropped or
    /// handed off with [`InProgress::keep`].
    pub fn reserve(&self) -> InProgress<'_> {
        self.in_progress.fetch_add(1, Ordering::SeqCst);
        InProgress {
            counter: &self.in_progress,
            kept: false,
        }
    }
}

/// A unit of `in_progress` held while a request is on its way to the
/// downloader.
#[must_use]
pub struct InProgress<'a> {
    counter: &'a AtomicUsize,
    kept: bool,
}

impl InProgress<'_> {
    /// Leaves the unit counted; whoever routes the outcome releases it.
    pub fn keep(mut self) {
        self.kept = true;
    }
}

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        if !self.kept {
            self.counter.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[derive(Debug, Default)]
struct ControlInner {
    close_reason: Mutex<Option<String>>,
    paused_until: Mutex<Option<Instant>>,
}

/// Cloneable handle to pause, resume or close a run from anywhere.
#[derive(Debug, Clone, Default)]
pub struct ControlHandle {
    inner: Arc<ControlInner>,
}

impl ControlHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests the run to close. The first reason wins.
    pub fn close(&self, reason: impl Into<String>) {
        let mut close_reason = self.inner.close_reason.lock();
        if close_reason.is_none() {
            *close_reason = Some(reason.into());
        }
    }

    pub fn close_requested(&self) -> bool {
        self.inner.close_reason.lock().is_some()
    }

    pub(crate) fn take_close_request(&self) -> Option<String> {
        self.inner.close_reason.lock().take()
    }

    /// Stops admitting new work for `duration`.
    pub fn pause(&self, duration: Duration) {
        *self.inner.paused_until.lock() = Some(Instant::now() + duration);
    }

    pub fn resume(&self) {
        *self.inner.paused_until.lock() = None;
    }

    /// The resume time, while the pause is still in effect.
    pub fn paused_until(&self) -> Option<Instant> {
        let mut paused = self.inner.paused_until.lock();
        match *paused {
            Some(until) if until > Instant::now() => Some(until),
            Some(_) => {
                *paused = None;
                None
            }
            None => None,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused_until().is_some()
    }
}
