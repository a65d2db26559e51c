use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Client-paced fixed-window bucket with an ordered waiting list.
///
/// The bucket never sleeps on its own. Its owner calls [`TokenBucket::pop`]
/// to drain whatever is admissible right now and arms a single timer at
/// [`TokenBucket::next_refill`] when items are left waiting.
#[derive(Debug)]
pub struct TokenBucket<T> {
    capacity: u32,
    /// Tokens only priority items may spend.
    reserved: u32,
    interval: Duration,
    remaining: u32,
    window_start: Option<Instant>,
    waiting: VecDeque<Waiting<T>>,
}

#[derive(Debug)]
struct Waiting<T> {
    item: T,
    priority: bool,
}

impl<T> TokenBucket<T> {
    pub fn new(capacity: u32, interval: Duration) -> Self {
        Self::with_reserved(capacity, 0, interval)
    }

    pub fn with_reserved(capacity: u32, reserved: u32, interval: Duration) -> Self {
        Self {
            capacity,
            reserved: reserved.min(capacity.saturating_sub(1)),
            interval,
            remaining: capacity,
            window_start: None,
            waiting: VecDeque::new(),
        }
    }

    /// Priority items jump to the front of the line, everything else joins
    /// the back.
    pub fn queue(&mut self, item: T, priority: bool) {
        let waiting = Waiting { item, priority };
        if priority {
            self.waiting.push_front(waiting);
        } else {
            self.waiting.push_back(waiting);
        }
    }

    /// Non-blocking admission check for the head of the queue.
    ///
    /// When `allow_normal` is false only priority items are released; normal
    /// items keep their place.
    pub fn pop(&mut self, now: Instant, allow_normal: bool) -> Option<T> {
        self.roll_window(now);
        let head = self.waiting.front()?;
        let floor = if head.priority { 0 } else { self.reserved };
        if !head.priority && !allow_normal {
            return None;
        }
        if self.remaining <= floor {
            return None;
        }
        self.remaining -= 1;
        if self.window_start.is_none() {
            self.window_start = Some(now);
        }
        self.waiting.pop_front().map(|w| w.item)
    }

    /// Spend a token without queueing, for callers that gate a single action.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        self.roll_window(now);
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        if self.window_start.is_none() {
            self.window_start = Some(now);
        }
        true
    }

    /// When the current window ends, if anything is waiting on it.
    pub fn next_refill(&self) -> Option<Instant> {
        if self.waiting.is_empty() {
            return None;
        }
        self.window_start.map(|start| start + self.interval)
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }

    /// Drop queued items that no longer make sense, keeping order.
    pub fn retain(&mut self, mut keep: impl FnMut(&T) -> bool) {
        self.waiting.retain(|w| keep(&w.item));
    }

    /// Remove every queued item, returning them in queue order.
    pub fn drain(&mut self) -> Vec<T> {
        self.waiting.drain(..).map(|w| w.item).collect()
    }

    fn roll_window(&mut self, now: Instant) {
        if let Some(start) = self.window_start {
            if now >= start + self.interval {
                self.remaining = self.capacity;
                self.window_start = None;
            }
        }
    }
}
