//! Queue disciplines for pending requests.
//!
//! Every backend carries the request priority itself; the scheduler never
//! orders anything. Pops are lazy: nothing leaves the queue until the stream
//! returned by `pop` is polled.

use crate::error::SpiderError;
use crate::request::Request;
use async_trait::async_trait;
use crossbeam::queue::SegQueue;
use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

#[async_trait]
pub trait RequestQueue: Send + Sync + 'static {
    async fn push(&self, request: Request) -> Result<(), SpiderError>;

    /// Up to `count` requests, removed one at a time as the stream is polled.
    fn pop(&self, count: usize) -> BoxStream<'_, Result<Request, SpiderError>>;

    async fn len(&self) -> Result<usize, SpiderError>;

    async fn clear(&self) -> Result<(), SpiderError>;

    async fn close(&self) -> Result<(), SpiderError> {
        Ok(())
    }
}

/// Builds a lazy pop stream out of a single-item pop.
fn pop_with<'a, F>(count: usize, pop_one: F) -> BoxStream<'a, Result<Request, SpiderError>>
where
    F: Fn() -> Option<Request> + Send + 'a,
{
    stream::unfold((0usize, pop_one), move |(taken, pop_one)| async move {
        if taken >= count {
            return None;
        }
        pop_one().map(|request| (Ok(request), (taken + 1, pop_one)))
    })
    .boxed()
}

struct Prioritized {
    priority: i32,
    sequence: Reverse<u64>,
    request: Request,
}

impl PartialEq for Prioritized {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for Prioritized {}

impl PartialOrd for Prioritized {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Prioritized {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.sequence.cmp(&other.sequence))
    }
}

#[derive(Default)]
struct Heap {
    entries: BinaryHeap<Prioritized>,
    next_sequence: u64,
}

/// Highest priority first; insertion order among equal priorities.
#[derive(Default)]
pub struct PriorityQueue {
    heap: Mutex<Heap>,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn pop_one(&self) -> Option<Request> {
        self.heap.lock().entries.pop().map(|entry| entry.request)
    }
}

#[async_trait]
impl RequestQueue for PriorityQueue {
    async fn push(&self, request: Request) -> Result<(), SpiderError> {
        let mut heap = self.heap.lock();
        let sequence = Reverse(heap.next_sequence);
        heap.next_sequence += 1;
        heap.entries.push(Prioritized {
            priority: request.priority,
            sequence,
            request,
        });
        Ok(())
    }

    fn pop(&self, count: usize) -> BoxStream<'_, Result<Request, SpiderError>> {
        pop_with(count, move || self.pop_one())
    }

    async fn len(&self) -> Result<usize, SpiderError> {
        Ok(self.heap.lock().entries.len())
    }

    async fn clear(&self) -> Result<(), SpiderError> {
        self.heap.lock().entries.clear();
        Ok(())
    }
}

/// Arrival order, lock-free.
#[derive(Default)]
pub struct FifoQueue {
    queue: SegQueue<Request>,
}

impl FifoQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RequestQueue for FifoQueue {
    async fn push(&self, request: Request) -> Result<(), SpiderError> {
        self.queue.push(request);
        Ok(())
    }

    fn pop(&self, count: usize) -> BoxStream<'_, Result<Request, SpiderError>> {
        pop_with(count, move || self.queue.pop())
    }

    async fn len(&self) -> Result<usize, SpiderError> {
        Ok(self.queue.len())
    }

    async fn clear(&self) -> Result<(), SpiderError> {
        while self.queue.pop().is_some() {}
        Ok(())
    }
}

/// Most recent first, which makes the crawl depth-first.
#[derive(Default)]
pub struct LifoQueue {
    stack: Mutex<Vec<Request>>,
}

impl LifoQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RequestQueue for LifoQueue {
    async fn push(&self, request: Request) -> Result<(), SpiderError> {
        self.stack.lock().push(request);
        Ok(())
    }

    fn pop(&self, count: usize) -> BoxStream<'_, Result<Request, SpiderError>> {
        pop_with(count, move || self.stack.lock().pop())
    }

    async fn len(&self) -> Result<usize, SpiderError> {
        Ok(self.stack.lock().len())
    }

    async fn clear(&self) -> Result<(), SpiderError> {
        self.stack.lock().clear();
        Ok(())
    }
}
