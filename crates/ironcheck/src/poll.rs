//! Bounded sleep-and-retry polling.
//!
//! Every wait in the harness goes through [`PollPolicy`]: job activation,
//! completion observation and test helpers all share the same deadline and
//! interval semantics.

use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::trace;

/// Deadline and interval for a polling loop.
///
/// The probe is always invoked at least once, even with a zero timeout.
/// Sleeps are clamped to the remaining time so the loop never oversleeps the
/// deadline by more than one probe round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Total time budget for the loop.
    pub timeout: Duration,
    /// Sleep between two probe attempts.
    pub interval: Duration,
}

impl PollPolicy {
    /// Create a policy with the given deadline and interval.
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    /// Invoke `probe` until `satisfied` accepts its value or the deadline passes.
    ///
    /// Returns `Ok(Some(value))` for a satisfying value and `Ok(None)` when
    /// the deadline was reached first. Probe errors are returned immediately
    /// and never retried.
    pub async fn until<T, E, F, Fut, P>(&self, mut probe: F, mut satisfied: P) -> Result<Option<T>, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnMut(&T) -> bool,
    {
        let deadline = Instant::now() + self.timeout;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let value = probe().await?;
            if satisfied(&value) {
                trace!(attempt, "poll satisfied");
                return Ok(Some(value));
            }

            let now = Instant::now();
            if now >= deadline {
                trace!(attempt, timeout_ms = self.timeout.as_millis() as u64, "poll deadline reached");
                return Ok(None);
            }

            sleep(self.interval.min(deadline - now)).await;
        }
    }

    /// Invoke `probe` until it yields `Some` or the deadline passes.
    pub async fn until_some<T, E, F, Fut>(&self, probe: F) -> Result<Option<T>, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        self.until(probe, Option::is_some)
            .await
            .map(Option::flatten)
    }
}
