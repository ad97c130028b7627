//! # workq
//!
//! Durable single-process work queue backed by one SQLite file per queue.
//!
//! Producers [`submit`](engine::Queue::submit) opaque JSON payloads;
//! consumers [`reserve`](engine::Queue::reserve) the oldest ready message
//! and later [`finish`](engine::Queue::finish),
//! [`release`](engine::Queue::release) or [`abort`](engine::Queue::abort)
//! it. A message is reserved by at most one consumer at a time; the claim
//! is a conditional update whose affected-row count decides the winner.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod model;
pub mod storage;
pub mod telemetry;

pub use config::{Config, QueueConfig, QueueSettings};
pub use engine::Queue;
pub use error::{Error, Result};
pub use model::{BuriedMessage, Message, MessageId, Receipt, Status};
