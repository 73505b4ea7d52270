//! Delayed Work Queue
//!
//! A time-ordered queue drained by the cleanup dispatcher. Items become
//! visible to [`DelayingQueue::get`] once their delay has passed; among ready
//! items the earliest deadline wins and ties keep insertion order. The queue
//! does not de-duplicate.
//!
//! Retries are limited twice: per item by [`ItemBackoff`] and overall by
//! [`BucketLimiter`]. The longer of the two delays applies.

use parking_lot::Mutex;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Initial retry delay of a failed item
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);

/// Upper bound of the retry delay
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Retries per second allowed across all items
pub const DEFAULT_RETRY_QPS: f64 = 10.0;

/// Retries allowed in a burst across all items
pub const DEFAULT_RETRY_BURST: u32 = 100;

struct Scheduled<T> {
    ready_at: Instant,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Scheduled<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl<T> Eq for Scheduled<T> {}

impl<T> PartialOrd for Scheduled<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Scheduled<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.ready_at, self.seq).cmp(&(other.ready_at, other.seq))
    }
}

struct QueueState<T> {
    heap: BinaryHeap<Reverse<Scheduled<T>>>,
    next_seq: u64,
    shutting_down: bool,
}

/// Min-heap of items keyed by the instant they become ready
pub struct DelayingQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
}

impl<T: Send> DelayingQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                next_seq: 0,
                shutting_down: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Enqueue an item that is ready immediately
    pub fn add(&self, item: T) {
        self.add_after(item, Duration::ZERO);
    }

    /// Enqueue an item that becomes ready after `delay`.
    /// Items added after shutdown are dropped.
    pub fn add_after(&self, item: T, delay: Duration) {
        {
            let mut state = self.state.lock();
            if state.shutting_down {
                return;
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.heap.push(Reverse(Scheduled {
                ready_at: Instant::now() + delay,
                seq,
                item,
            }));
        }
        self.notify.notify_waiters();
    }

    /// Wait for the next ready item. Returns `None` once the queue is shut
    /// down; pending items are abandoned.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before inspecting state so an add in between is not missed
            notified.as_mut().enable();

            let deadline = {
                let mut state = self.state.lock();
                if state.shutting_down {
                    return None;
                }
                match state.heap.peek() {
                    Some(Reverse(next)) if next.ready_at <= Instant::now() => {
                        return state.heap.pop().map(|Reverse(s)| s.item);
                    }
                    Some(Reverse(next)) => Some(next.ready_at),
                    None => None,
                }
            };

            match deadline {
                Some(ready_at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(ready_at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Stop handing out items and wake every waiting worker
    pub fn shut_down(&self) {
        self.state.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    /// Items waiting, ready or not
    pub fn len(&self) -> usize {
        self.state.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Send> Default for DelayingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Retry Backoff
// =============================================================================

/// Per-item exponential retry delay: `base * 2^attempt`, capped at `max`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemBackoff {
    base: Duration,
    max: Duration,
}

impl ItemBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before retry number `attempt` (0 for the first retry)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }
}

impl Default for ItemBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

/// Token bucket shared by every retry, so a wave of failing items cannot
/// hammer the API server faster than `qps`
#[derive(Debug)]
pub struct BucketLimiter {
    qps: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last: Instant,
}

impl BucketLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        Self {
            qps,
            burst: f64::from(burst),
            state: Mutex::new(BucketState {
                tokens: f64::from(burst),
                last: Instant::now(),
            }),
        }
    }

    /// Take one token. Returns how long the caller has to wait until the
    /// token is actually available.
    pub fn reserve(&self) -> Duration {
        let mut state = self.state.lock();
        let now = Instant::now();
        let refill = now.saturating_duration_since(state.last).as_secs_f64() * self.qps;
        state.tokens = (state.tokens + refill).min(self.burst) - 1.0;
        state.last = now;
        if state.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-state.tokens / self.qps)
        }
    }
}

impl Default for BucketLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_QPS, DEFAULT_RETRY_BURST)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_items_wait_for_their_delay() {
        let queue = DelayingQueue::new();
        let start = Instant::now();
        queue.add_after("late", Duration::from_secs(30));
        queue.add_after("early", Duration::from_secs(10));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.get().await, Some("early"));
        assert_eq!(start.elapsed(), Duration::from_secs(10));
        assert_eq!(queue.get().await, Some("late"));
        assert_eq!(start.elapsed(), Duration::from_secs(30));
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_items_keep_insertion_order() {
        let queue = DelayingQueue::new();
        queue.add(1);
        queue.add(2);
        queue.add(2);
        assert_eq!(queue.get().await, Some(1));
        assert_eq!(queue.get().await, Some(2));
        // Duplicates are kept
        assert_eq!(queue.get().await, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_wakes_waiting_worker() {
        let queue = Arc::new(DelayingQueue::new());
        queue.add_after("slow", Duration::from_secs(60));

        let worker = tokio::spawn({
            let queue = queue.clone();
            async move { queue.get().await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        queue.add("fast");

        assert_eq!(worker.await.unwrap(), Some("fast"));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_pending_until_item_added() {
        let queue = DelayingQueue::new();
        let mut get = tokio_test::task::spawn(queue.get());
        tokio_test::assert_pending!(get.poll());

        queue.add(3);
        assert!(get.is_woken());
        tokio_test::assert_ready_eq!(get.poll(), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_releases_workers() {
        let queue: Arc<DelayingQueue<u32>> = Arc::new(DelayingQueue::new());
        let workers: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.get().await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(10)).await;

        queue.shut_down();
        for worker in workers {
            assert_eq!(worker.await.unwrap(), None);
        }

        queue.add(7);
        assert!(queue.is_empty());
        assert!(queue.is_shutting_down());
    }

    #[test]
    fn test_item_backoff() {
        let backoff = ItemBackoff::default();
        assert_eq!(backoff.delay(0), Duration::from_millis(5));
        assert_eq!(backoff.delay(1), Duration::from_millis(10));
        assert_eq!(backoff.delay(10), Duration::from_millis(5120));
        assert_eq!(backoff.delay(20), DEFAULT_MAX_DELAY);
        assert_eq!(backoff.delay(64), DEFAULT_MAX_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_limits_after_burst() {
        let bucket = BucketLimiter::new(1.0, 2);
        assert_eq!(bucket.reserve(), Duration::ZERO);
        assert_eq!(bucket.reserve(), Duration::ZERO);
        assert_eq!(bucket.reserve(), Duration::from_secs(1));
        assert_eq!(bucket.reserve(), Duration::from_secs(2));

        // Refills over time, never above the burst
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(bucket.reserve(), Duration::ZERO);
        assert_eq!(bucket.reserve(), Duration::ZERO);
        assert_eq!(bucket.reserve(), Duration::from_secs(1));
    }
}
