//! Storage backend seam.
//!
//! The engine only needs a table of rows with conditional writes that report
//! how many rows they touched. Every mutation is keyed on the message id AND
//! the status the caller expects it to be in (and, for settling a reservation,
//! optionally its lease); an affected count of zero means someone else got
//! there first.
//!
//! [`crate::db::Db`] is the durable SQLite implementation.
//! [`memory::MemoryBackend`] keeps everything in process.

pub mod memory;

use std::future::Future;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{BuriedMessage, MessageId};

/// A stored row as the engine sees it. The payload stays encoded until the
/// engine decides to hand the message out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: MessageId,
    pub payload: String,
    pub failures: u32,
    pub lease: u32,
}

pub trait Backend: Send + Sync {
    /// Insert a `ready` row. `None` if the write did not take effect.
    fn insert(&self, payload: &str) -> impl Future<Output = Result<Option<MessageId>>> + Send;

    /// Oldest `ready` rows, ascending by id. Non-locking.
    fn oldest_ready(&self, limit: usize) -> impl Future<Output = Result<Vec<StoredMessage>>> + Send;

    /// Number of `ready` rows.
    fn count_ready(&self) -> impl Future<Output = Result<u64>> + Send;

    /// `ready -> reserved` for `id`, stamping the new `lease`. Returns
    /// affected rows (0 or 1).
    fn reserve(
        &self,
        id: MessageId,
        lease: u32,
        reserved_until: Option<DateTime<Utc>>,
    ) -> impl Future<Output = Result<u64>> + Send;

    /// `reserved -> ready` for `id`, bumping the failure count. With a
    /// `lease`, only if the reservation still carries it.
    fn release(&self, id: MessageId, lease: Option<u32>) -> impl Future<Output = Result<u64>> + Send;

    /// Delete `id` if it is `reserved` (under `lease`, when given).
    fn delete_reserved(
        &self,
        id: MessageId,
        lease: Option<u32>,
    ) -> impl Future<Output = Result<u64>> + Send;

    /// Delete `id` if it is `ready`.
    fn delete_ready(&self, id: MessageId) -> impl Future<Output = Result<u64>> + Send;

    /// Move `id` from `reserved` (under `lease`, when given) into the buried
    /// ledger, atomically.
    fn bury(
        &self,
        id: MessageId,
        lease: Option<u32>,
        at: DateTime<Utc>,
        reason: Option<&str>,
    ) -> impl Future<Output = Result<u64>> + Send;

    /// Oldest buried messages, ascending by id.
    fn buried(&self, limit: usize) -> impl Future<Output = Result<Vec<BuriedMessage>>> + Send;

    /// Return every reservation that lapsed at or before `now` to `ready`,
    /// bumping their failure counts. Returns how many were returned.
    fn requeue_expired(&self, now: DateTime<Utc>) -> impl Future<Output = Result<u64>> + Send;

    /// Release the backend handle.
    fn close(self) -> impl Future<Output = ()> + Send
    where
        Self: Sized;

    /// Destroy the store and everything in it.
    fn destroy(self) -> impl Future<Output = Result<()>> + Send
    where
        Self: Sized;
}
