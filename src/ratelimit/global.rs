use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use tokio::time::Instant;

/// Process-wide REST suspend condition.
///
/// Owned by one `RequestExecutor` and shared with its drain loops. Every loop
/// reads it before dispatching; a global 429 sets the deadline and all routes
/// stall until it passes.
#[derive(Debug, Default)]
pub struct GlobalGate {
    until: ArcSwapOption<Instant>,
}

impl GlobalGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the gate for `retry_after`. An earlier deadline never shortens a
    /// later one.
    pub fn trip(&self, retry_after: Duration) {
        let deadline = Instant::now() + retry_after;
        self.until.rcu(|current| match current.as_deref() {
            Some(existing) if *existing >= deadline => current.clone(),
            _ => Some(Arc::new(deadline)),
        });
        tracing::warn!(retry_after_ms = retry_after.as_millis() as u64, "global rate limit hit");
    }

    /// Remaining suspension, if the gate is currently closed.
    pub fn remaining(&self) -> Option<Duration> {
        let until = self.until.load_full()?;
        let now = Instant::now();
        (*until > now).then(|| *until - now)
    }

    pub fn is_tripped(&self) -> bool {
        self.remaining().is_some()
    }

    /// Suspend until the gate is open. Re-reads after each sleep since
    /// another 429 may have extended the deadline meanwhile.
    pub async fn wait(&self) {
        while let Some(remaining) = self.remaining() {
            tokio::time::sleep(remaining).await;
        }
    }
}
