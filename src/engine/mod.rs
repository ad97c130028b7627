//! Queue engine: reservation state machine, claim protocol, polling.

pub mod queue;
pub mod wait;

pub use queue::Queue;
pub use wait::{ExponentialBackoff, FixedInterval, WaitStrategy};
