//! Per-connection pacing and buffering
//!
//! Each connection owns a [`TokenBucket`] (read by its writer task) and a
//! [`ClientOutbox`] (filled by the broadcaster, drained by the writer). The
//! outbox never grows past its depth; overflow is dropped and counted.

use super::compression::Frame;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Classic token bucket: `burst` tokens max, refilled at `rate_per_sec`
///
/// A non-positive rate means unlimited.
#[derive(Debug)]
pub struct TokenBucket {
    rate_per_sec: f64,
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Starts full
    pub fn new(rate_per_sec: f64, burst: u32) -> Self {
        Self::starting_at(rate_per_sec, burst, Instant::now())
    }

    pub fn starting_at(rate_per_sec: f64, burst: u32, now: Instant) -> Self {
        let capacity = f64::from(burst.max(1));
        Self {
            rate_per_sec,
            capacity,
            tokens: capacity,
            last_refill: now,
        }
    }

    fn unlimited(&self) -> bool {
        self.rate_per_sec <= 0.0
    }

    fn projected(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * self.rate_per_sec).min(self.capacity)
    }

    pub fn try_acquire(&mut self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&mut self, now: Instant) -> bool {
        if self.unlimited() {
            return true;
        }
        self.tokens = self.projected(now);
        if now > self.last_refill {
            self.last_refill = now;
        }
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// How long until one token is available; zero if one is available now
    pub fn time_until_available(&self, now: Instant) -> Duration {
        if self.unlimited() {
            return Duration::ZERO;
        }
        let tokens = self.projected(now);
        if tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - tokens) / self.rate_per_sec)
        }
    }

    pub fn available(&self, now: Instant) -> f64 {
        if self.unlimited() {
            return f64::INFINITY;
        }
        self.projected(now)
    }
}

/// Bounded FIFO of frames waiting for one client
pub struct ClientOutbox {
    queue: Mutex<VecDeque<Frame>>,
    depth: usize,
    notify: Notify,
    closed: AtomicBool,
    enqueued: AtomicU64,
    dropped: AtomicU64,
}

impl ClientOutbox {
    pub fn new(max_queue_depth: usize) -> Self {
        let depth = max_queue_depth.max(1);
        Self {
            queue: Mutex::new(VecDeque::with_capacity(depth.min(1024))),
            depth,
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            enqueued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue a frame; returns false (and counts a drop) when full or closed
    pub fn push(&self, frame: Frame) -> bool {
        if self.closed.load(Ordering::Acquire) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.depth {
                drop(queue);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            queue.push_back(frame);
        }
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
        true
    }

    pub fn try_pop(&self) -> Option<Frame> {
        self.queue.lock().pop_front()
    }

    /// Wait for the next frame; `None` once closed and empty
    pub async fn recv(&self) -> Option<Frame> {
        loop {
            if let Some(frame) = self.try_pop() {
                return Some(frame);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_saturated(&self) -> bool {
        self.len() >= self.depth
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn text(n: usize) -> Frame {
        Frame::Text(format!("msg-{}", n))
    }

    #[test]
    fn test_bucket_burst_then_deny() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::starting_at(5.0, 5, t0);
        for _ in 0..5 {
            assert!(bucket.try_acquire_at(t0));
        }
        assert!(!bucket.try_acquire_at(t0));
        let wait = bucket.time_until_available(t0).as_secs_f64();
        assert!((wait - 0.2).abs() < 1e-6);
        assert!(bucket.try_acquire_at(t0 + Duration::from_millis(200)));
    }

    #[test]
    fn test_zero_rate_is_unlimited() {
        let mut bucket = TokenBucket::new(0.0, 1);
        for _ in 0..1000 {
            assert!(bucket.try_acquire());
        }
    }

    #[test]
    fn test_ten_per_second_with_hundred_messages() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::starting_at(10.0, 1, t0);
        let outbox = ClientOutbox::new(20);

        for n in 0..100 {
            outbox.push(text(n));
            assert!(outbox.len() <= outbox.depth());
        }
        assert_eq!(outbox.len(), 20);
        assert_eq!(outbox.dropped(), 80);

        // the writer loop, sampled every 10ms for one second
        let mut delivered = 0;
        for step in 0..100u64 {
            let now = t0 + Duration::from_millis(step * 10);
            while bucket.try_acquire_at(now) {
                if outbox.try_pop().is_none() {
                    break;
                }
                delivered += 1;
            }
        }
        assert!(delivered <= 10, "delivered {delivered} in one second");
        assert!(delivered >= 9);
        assert_eq!(outbox.len(), 20 - delivered);
    }

    #[test]
    fn test_outbox_keeps_fifo_order() {
        let outbox = ClientOutbox::new(3);
        assert!(outbox.push(text(1)));
        assert!(outbox.push(text(2)));
        assert_eq!(outbox.try_pop(), Some(text(1)));
        assert!(outbox.push(text(3)));
        assert!(outbox.push(text(4)));
        assert!(outbox.is_saturated());
        assert!(!outbox.push(text(5)));
        assert_eq!(outbox.try_pop(), Some(text(2)));
    }

    #[tokio::test]
    async fn test_recv_wakes_on_push_and_ends_on_close() {
        let outbox = Arc::new(ClientOutbox::new(4));
        let reader = {
            let outbox = outbox.clone();
            tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(frame) = outbox.recv().await {
                    seen.push(frame);
                }
                seen
            })
        };

        tokio::task::yield_now().await;
        outbox.push(text(1));
        outbox.push(text(2));
        tokio::task::yield_now().await;
        outbox.close();
        assert!(!outbox.push(text(3)));

        let seen = reader.await.unwrap();
        assert_eq!(seen, vec![text(1), text(2)]);
    }
}
