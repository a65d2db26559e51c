use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

const WINDOW: usize = 10;

/// Moving-window estimate of `server clock - local clock`.
///
/// Fed from the `Date` header of every response. The header only has
/// one-second resolution, so single samples are noisy; the mean over the
/// window is what matters.
#[derive(Debug, Default)]
pub struct ClockSkew {
    samples: Mutex<VecDeque<i64>>,
}

impl ClockSkew {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, server: DateTime<Utc>, local: DateTime<Utc>) {
        let offset = (server - local).num_milliseconds();
        let Ok(mut samples) = self.samples.lock() else {
            return;
        };
        if samples.len() == WINDOW {
            samples.pop_front();
        }
        samples.push_back(offset);
    }

    /// Mean offset in milliseconds; positive when the server is ahead.
    pub fn offset_ms(&self) -> i64 {
        let Ok(samples) = self.samples.lock() else {
            return 0;
        };
        if samples.is_empty() {
            return 0;
        }
        samples.iter().sum::<i64>() / samples.len() as i64
    }

    /// Convert an absolute server-clock reset (Unix seconds) into a local
    /// monotonic deadline.
    pub fn deadline(&self, reset_epoch_secs: f64, now: Instant, local: DateTime<Utc>) -> Instant {
        let server_now_ms = local.timestamp_millis() + self.offset_ms();
        let wait_ms = (reset_epoch_secs * 1000.0) as i64 - server_now_ms;
        if wait_ms <= 0 {
            now
        } else {
            now + Duration::from_millis(wait_ms as u64)
        }
    }
}
