//! Waiting for a human operator to hand control back.
//!
//! Control handoff is signalled by a server-side pause flag on a remote
//! machine. Waiting for it to clear polls with capped exponential backoff:
//! the sleep doubles after every poll that still sees the flag set and
//! never exceeds the cap, so polling never busy-loops and a cleared flag is
//! noticed within one capped interval.

use std::future::Future;
use std::time::Duration;

use crate::config::BackoffPolicy;
use crate::error::Result;

/// Successive sleep intervals for a [`BackoffPolicy`].
///
/// The sequence is non-decreasing, bounded by the cap, and infinite.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    cap: Duration,
    factor: u32,
}

/// Floor for every interval, so a zeroed policy cannot spin.
const MIN_DELAY: Duration = Duration::from_millis(1);

impl Backoff {
    /// Start a fresh sequence.
    #[must_use]
    pub fn new(policy: BackoffPolicy) -> Self {
        let cap = policy.cap().max(MIN_DELAY);
        Self {
            next: policy.initial().max(MIN_DELAY).min(cap),
            cap,
            factor: policy.factor.max(1),
        }
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let current = self.next;
        self.next = current.saturating_mul(self.factor).min(self.cap);
        Some(current)
    }
}

/// Poll until `is_paused` reports false.
///
/// Returns as soon as a poll observes the flag cleared. Any poll error ends
/// the wait and is returned unchanged. The wait itself has no deadline;
/// dropping the future cancels it at the next poll or sleep.
pub(crate) async fn wait_until_resumed<F, Fut>(policy: BackoffPolicy, mut is_paused: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let mut backoff = Backoff::new(policy);
    let mut polls: u64 = 0;
    loop {
        polls = polls.saturating_add(1);
        if !is_paused().await? {
            tracing::debug!(polls, "Control handed back");
            return Ok(());
        }
        let delay = backoff.next().unwrap_or(policy.cap());
        tracing::debug!(polls, delay_ms = delay.as_millis(), "Still paused, backing off");
        tokio::time::sleep(delay).await;
    }
}
