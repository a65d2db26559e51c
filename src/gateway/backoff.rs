use std::time::Duration;

use rand::Rng;

/// What happens to a shard after it disconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconnectPolicy {
    /// Re-queue behind the other shards after a backoff delay.
    #[default]
    Auto,
    /// Re-queue right away. Consecutive failures after that back off like
    /// `Auto`.
    Immediate,
    /// Stay disconnected until told to connect.
    Never,
}

impl std::str::FromStr for ReconnectPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(ReconnectPolicy::Auto),
            "immediate" | "true" => Ok(ReconnectPolicy::Immediate),
            "never" | "false" => Ok(ReconnectPolicy::Never),
            other => Err(other.to_string()),
        }
    }
}

/// Multiplicative reconnect delay, capped, with full-range jitter on top.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    /// Fraction of the delay added or removed at random.
    jitter: f64,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter: 0.2,
            current: base,
            attempts: 0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before the next attempt, as a function of the previous delay and
    /// the attempt count.
    pub fn next_delay(&mut self) -> Duration {
        let delay = if self.attempts == 0 {
            self.base
        } else {
            (self.current * 2).min(self.max)
        };
        self.current = delay;
        self.attempts += 1;
        self.jittered(delay)
    }

    /// The un-jittered delay most recently handed out.
    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.current = self.base;
        self.attempts = 0;
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter == 0.0 {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        delay.mul_f64(factor).min(self.max.mul_f64(1.0 + self.jitter))
    }
}
