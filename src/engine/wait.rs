//! How long an empty-handed poller sleeps before looking again.
//!
//! The engine also wakes early when a message is submitted or released in
//! the same process, so these delays bound the latency for work produced by
//! other processes.

use std::fmt::Debug;
use std::time::Duration;

/// Delay policy between polls of an empty queue.
pub trait WaitStrategy: Send + Sync + Debug {
    /// Delay before poll number `attempt + 1`. `attempt` restarts at 0
    /// whenever the poller saw activity (a lost claim).
    fn delay(&self, attempt: u32) -> Duration;
}

/// Same delay every time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedInterval(pub Duration);

impl WaitStrategy for FixedInterval {
    fn delay(&self, _attempt: u32) -> Duration {
        self.0
    }
}

/// `initial * multiplier^attempt`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: u32,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            multiplier: 2,
        }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(50), Duration::from_secs(1))
    }
}

impl WaitStrategy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1).saturating_pow(attempt);
        self.initial.saturating_mul(factor).min(self.max)
    }
}
