use std::time::Duration;

use tokio::time::Instant;

/// Quota state for one REST route, as last reported by the server.
///
/// Only the route's drain loop touches this, so there is no locking. The
/// local decrement in [`SequentialBucket::acquire`] is a placeholder until
/// the response headers overwrite it.
#[derive(Debug, Clone)]
pub struct SequentialBucket {
    key: String,
    limit: Option<u32>,
    remaining: Option<u32>,
    reset_at: Option<Instant>,
    reset_after: Option<Duration>,
    bucket_id: Option<String>,
}

/// Authoritative values taken from one response.
#[derive(Debug, Clone, Default)]
pub struct BucketUpdate {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    pub reset_at: Option<Instant>,
    pub reset_after: Option<Duration>,
    pub bucket_id: Option<String>,
}

impl SequentialBucket {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            limit: None,
            remaining: None,
            reset_at: None,
            reset_after: None,
            bucket_id: None,
        }
    }

    /// How long the next call must wait before it may be dispatched.
    ///
    /// `override_reset` replaces the stored reset instant for this check; the
    /// executor passes a skew-adjusted deadline through it. Rolls the window
    /// over when the reset instant has passed.
    pub fn check(&mut self, now: Instant, override_reset: Option<Instant>) -> Option<Duration> {
        if self.remaining != Some(0) {
            return None;
        }
        match override_reset.or(self.reset_at) {
            Some(reset_at) if reset_at > now => Some(reset_at - now),
            Some(_) => {
                self.remaining = self.limit.or(Some(1));
                self.reset_at = None;
                None
            }
            // Exhausted without a reset hint: let one call through to learn more.
            None => None,
        }
    }

    /// Optimistically spend one unit of quota for an outgoing call.
    pub fn acquire(&mut self) {
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
        }
    }

    /// Overwrite state from response headers. Fields the response did not
    /// carry keep their previous value.
    pub fn update(&mut self, update: BucketUpdate) {
        if let Some(id) = update.bucket_id {
            if self.bucket_id.as_deref() != Some(id.as_str()) {
                tracing::debug!(route = %self.key, bucket = %id, "route mapped to server bucket");
                self.bucket_id = Some(id);
            }
        }
        if update.limit.is_some() {
            self.limit = update.limit;
        }
        if update.remaining.is_some() {
            self.remaining = update.remaining;
        }
        if update.reset_at.is_some() {
            self.reset_at = update.reset_at;
        }
        if update.reset_after.is_some() {
            self.reset_after = update.reset_after;
        }
    }

    /// Force the bucket empty until `reset_at`. Used when a 429 proves the
    /// local view was wrong.
    pub fn exhaust(&mut self, reset_at: Instant) {
        self.remaining = Some(0);
        self.reset_at = Some(match self.reset_at {
            Some(existing) if existing > reset_at => existing,
            _ => reset_at,
        });
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn remaining(&self) -> Option<u32> {
        self.remaining
    }

    pub fn reset_at(&self) -> Option<Instant> {
        self.reset_at
    }

    pub fn reset_after(&self) -> Option<Duration> {
        self.reset_after
    }

    pub fn bucket_id(&self) -> Option<&str> {
        self.bucket_id.as_deref()
    }
}
