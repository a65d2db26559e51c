use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

/// Used when a session ends before the server has announced its interval.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(41_250);
pub const DEFAULT_HEARTBEAT_JITTER: f64 = 0.05;

/// Heartbeat bookkeeping for one live socket.
#[derive(Debug)]
pub struct Heartbeat {
    interval: Duration,
    next_due: Instant,
    ack_pending: bool,
    last_sent: Option<Instant>,
    last_ack: Option<Instant>,
    latency: Option<Duration>,
}

/// What to do when the heartbeat timer fires.
#[derive(Debug, PartialEq, Eq)]
pub enum Beat {
    Send,
    /// The previous beat was never acknowledged: the connection is dead.
    Missed,
}

impl Heartbeat {
    /// Start the timer at `now`. Only the first beat is jittered; after it
    /// beats are exactly one interval apart, so a missing ack is noticed one
    /// interval after the beat it belongs to.
    pub fn start(interval: Duration, jitter: f64, now: Instant) -> Self {
        Self {
            interval,
            next_due: now + first_beat(interval, jitter),
            ack_pending: false,
            last_sent: None,
            last_ack: None,
            latency: None,
        }
    }

    pub fn next_due(&self) -> Instant {
        self.next_due
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Timer fired at `now`.
    pub fn tick(&mut self, now: Instant) -> Beat {
        if self.ack_pending {
            return Beat::Missed;
        }
        self.ack_pending = true;
        self.last_sent = Some(now);
        self.next_due = now + self.interval;
        Beat::Send
    }

    /// An out-of-band beat requested by the server. Does not move the timer.
    pub fn sent_on_request(&mut self, now: Instant) {
        self.ack_pending = true;
        self.last_sent = Some(now);
    }

    pub fn ack(&mut self, now: Instant) {
        self.ack_pending = false;
        self.last_ack = Some(now);
        if let Some(sent) = self.last_sent {
            self.latency = Some(now.saturating_duration_since(sent));
        }
    }

    pub fn ack_pending(&self) -> bool {
        self.ack_pending
    }

    pub fn last_sent(&self) -> Option<Instant> {
        self.last_sent
    }

    pub fn last_ack(&self) -> Option<Instant> {
        self.last_ack
    }

    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }
}

/// Spreads the first beat of many shards over `[1 - jitter, 1]` of the
/// interval, never later than one interval.
fn first_beat(interval: Duration, jitter: f64) -> Duration {
    let jitter = jitter.clamp(0.0, 0.5);
    if jitter == 0.0 {
        return interval;
    }
    let factor = rand::thread_rng().gen_range(1.0 - jitter..=1.0);
    interval.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_beat_one_interval_out() {
        let now = Instant::now();
        let hb = Heartbeat::start(Duration::from_secs(40), 0.0, now);
        assert_eq!(hb.next_due(), now + Duration::from_secs(40));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let now = Instant::now();
        for _ in 0..100 {
            let hb = Heartbeat::start(Duration::from_secs(40), 0.05, now);
            let due = hb.next_due() - now;
            assert!(due >= Duration::from_secs(38) && due <= Duration::from_secs(40));
        }
    }

    #[test]
    fn test_only_first_beat_is_jittered() {
        let now = Instant::now();
        let interval = Duration::from_secs(40);
        for _ in 0..50 {
            let mut hb = Heartbeat::start(interval, 0.05, now);
            let t1 = hb.next_due();
            assert_eq!(hb.tick(t1), Beat::Send);
            // unacknowledged beat is detected exactly one interval later
            assert_eq!(hb.next_due(), t1 + interval);
            assert_eq!(hb.tick(hb.next_due()), Beat::Missed);
        }
    }

    #[test]
    fn test_missed_ack_is_detected() {
        let now = Instant::now();
        let mut hb = Heartbeat::start(Duration::from_secs(40), 0.0, now);
        let t1 = hb.next_due();
        assert_eq!(hb.tick(t1), Beat::Send);
        hb.ack(t1 + Duration::from_millis(50));
        assert_eq!(hb.latency(), Some(Duration::from_millis(50)));
        let t2 = hb.next_due();
        assert_eq!(t2, t1 + Duration::from_secs(40));
        assert_eq!(hb.tick(t2), Beat::Send);
        assert_eq!(hb.tick(hb.next_due()), Beat::Missed);
    }

    #[test]
    fn test_requested_beat_keeps_schedule() {
        let now = Instant::now();
        let mut hb = Heartbeat::start(Duration::from_secs(40), 0.0, now);
        hb.sent_on_request(now + Duration::from_secs(1));
        assert!(hb.ack_pending());
        assert_eq!(hb.next_due(), now + Duration::from_secs(40));
    }
}
