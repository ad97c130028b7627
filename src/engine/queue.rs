//! The queue. The public API for producing and consuming messages.
//!
//! Lifecycle of a message:
//!
//! ```text
//! submit ──> ready ──reserve──> reserved ──finish──> (deleted)
//!              │  ^                 │  │
//!              │  └──release/expiry─┘  └──abort──> (buried)
//!              └──take──> (deleted)
//! ```
//!
//! Every transition is a conditional write keyed on the message id and the
//! status the caller expects. The backend's affected-row count decides who
//! won; nothing else is locked. Each reserve also stamps a fresh lease, so a
//! consumer holding a [`Receipt`] from a lapsed reservation cannot settle the
//! message for whoever reserved it next.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use opentelemetry::KeyValue;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{Instrument, Span, debug, info, warn};

use super::wait::WaitStrategy;
use crate::config::{QueueConfig, QueueSettings, validate_name};
use crate::db::Db;
use crate::error::{Error, Result};
use crate::model::{BuriedMessage, Message, MessageId, Receipt};
use crate::storage::memory::MemoryBackend;
use crate::storage::{Backend, StoredMessage};
use crate::telemetry::metrics;
use crate::telemetry::queue::{record_claim, record_state_transition, start_claim_span};

/// A named queue over a storage backend. Owns the backend handle.
///
/// Share it between consumers with `Arc<Queue>`; every method takes `&self`
/// except the two that end its life (`close`, `flush`).
#[derive(Debug)]
pub struct Queue<B: Backend = Db> {
    name: String,
    backend: B,
    settings: QueueSettings,
    wait: Arc<dyn WaitStrategy>,
    /// Woken on submit and release so local waiters skip their sleep.
    wakeup: Notify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClaimMode {
    /// `ready -> reserved`
    Reserve,
    /// `ready -> deleted`
    Take,
}

impl ClaimMode {
    fn as_str(self) -> &'static str {
        match self {
            ClaimMode::Reserve => "reserve",
            ClaimMode::Take => "take",
        }
    }

    fn target_state(self) -> &'static str {
        match self {
            ClaimMode::Reserve => "reserved",
            ClaimMode::Take => "deleted",
        }
    }
}

/// Outcome of one poll cycle.
enum Claim {
    Won(Message),
    /// The conditional write touched nothing: another consumer got the row.
    Lost,
    /// The oldest row could not be decoded and was buried instead.
    Buried,
    Empty,
}

impl Queue<Db> {
    /// Open (creating if needed) the durable queue described by `config`.
    pub async fn open(config: QueueConfig) -> Result<Self> {
        validate_name(&config.name)?;
        config.settings.validate()?;
        let backend = Db::open(&config.storage_root, &config.name).await?;
        Self::with_backend(config.name, backend, config.settings)
    }
}

impl Queue<MemoryBackend> {
    /// Create a queue that lives only in this process (for testing).
    pub fn in_memory(name: impl Into<String>) -> Result<Self> {
        Self::with_backend(name, MemoryBackend::new(), QueueSettings::default())
    }
}

impl<B: Backend> Queue<B> {
    /// Wrap an already-initialized backend.
    pub fn with_backend(name: impl Into<String>, backend: B, settings: QueueSettings) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;
        settings.validate()?;
        let wait = settings.wait_strategy();
        Ok(Self {
            name,
            backend,
            settings,
            wait,
            wakeup: Notify::new(),
        })
    }

    /// Replace the polling policy derived from the settings.
    pub fn with_wait_strategy(mut self, wait: impl WaitStrategy + 'static) -> Self {
        self.wait = Arc::new(wait);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Borrow the storage backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    // -----------------------------------------------------------------------
    // Producing
    // -----------------------------------------------------------------------

    /// Submit a payload. Returns its id, or `None` if the store did not
    /// take the write.
    pub async fn submit<T: Serialize + ?Sized>(&self, payload: &T) -> Result<Option<MessageId>> {
        let encoded = serde_json::to_string(payload)?;
        let id = self.backend.insert(&encoded).await?;

        match id {
            Some(id) => {
                debug!(queue = %self.name, id = %id, "message submitted");
                self.wakeup.notify_waiters();
                self.count_operation("submit", "ok");
            }
            None => {
                warn!(queue = %self.name, "submit did not insert a row");
                self.count_operation("submit", "not_inserted");
            }
        }
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Consuming
    // -----------------------------------------------------------------------

    /// Wait up to `timeout` (default: the queue's default timeout) for the
    /// oldest ready message and reserve it for this caller.
    ///
    /// `Ok(None)` means the timeout elapsed with nothing claimable.
    pub async fn reserve(&self, timeout: Option<Duration>) -> Result<Option<Message>> {
        self.claim_next(timeout, ClaimMode::Reserve).await
    }

    /// Like [`reserve`](Self::reserve), but the message is deleted in the
    /// same conditional write. There is nothing to finish afterwards.
    pub async fn take(&self, timeout: Option<Duration>) -> Result<Option<Message>> {
        self.claim_next(timeout, ClaimMode::Take).await
    }

    /// Acknowledge a reserved message: delete it. `false` if it is not (or
    /// no longer) reserved, which makes repeated calls harmless.
    ///
    /// Pass the [`Message`] (`&message`) to settle only the reservation it
    /// came from; a bare [`MessageId`] settles
    /// whichever reservation the message currently has.
    pub async fn finish(&self, receipt: impl Into<Receipt>) -> Result<bool> {
        let Receipt { id, lease } = receipt.into();
        let finished = self.backend.delete_reserved(id, lease).await? == 1;
        if finished {
            debug!(queue = %self.name, id = %id, "message finished");
        } else {
            debug!(queue = %self.name, id = %id, "finish: message not reserved");
        }
        self.count_operation("finish", if finished { "ok" } else { "noop" });
        Ok(finished)
    }

    /// Hand a reserved message back for redelivery. Its failure count goes
    /// up by one; the payload is untouched. `false` (no-op) if the message
    /// is not reserved (or reserved under a different lease).
    pub async fn release(&self, receipt: impl Into<Receipt>) -> Result<bool> {
        let Receipt { id, lease } = receipt.into();
        let released = self.backend.release(id, lease).await? == 1;
        if released {
            debug!(queue = %self.name, id = %id, "message released");
            self.wakeup.notify_waiters();
        } else {
            debug!(queue = %self.name, id = %id, "release: message not reserved");
        }
        self.count_operation("release", if released { "ok" } else { "noop" });
        Ok(released)
    }

    /// Give up on a reserved message for good: remove it from delivery and
    /// record it in the buried ledger. `false` (no-op) if it is not reserved
    /// (or reserved under a different lease).
    pub async fn abort(&self, receipt: impl Into<Receipt>) -> Result<bool> {
        let Receipt { id, lease } = receipt.into();
        let buried = self.backend.bury(id, lease, Utc::now(), None).await? == 1;
        if buried {
            warn!(queue = %self.name, id = %id, "message aborted and buried");
        } else {
            debug!(queue = %self.name, id = %id, "abort: message not reserved");
        }
        self.count_operation("abort", if buried { "ok" } else { "noop" });
        Ok(buried)
    }

    // -----------------------------------------------------------------------
    // Observing
    // -----------------------------------------------------------------------

    /// Up to `limit` oldest ready messages, left untouched. Anything returned
    /// here may be reserved by someone else a moment later. Rows whose
    /// payload cannot be decoded are skipped; the next reserve or take
    /// buries them.
    pub async fn peek(&self, limit: usize) -> Result<Vec<Message>> {
        self.sweep_expired().await?;
        let rows = self.backend.oldest_ready(limit).await?;
        Ok(rows
            .iter()
            .filter_map(|row| match decode(row) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!(queue = %self.name, id = %row.id, error = %e, "peek: skipping undecodable payload");
                    None
                }
            })
            .collect())
    }

    /// Number of ready messages.
    pub async fn count(&self) -> Result<u64> {
        self.sweep_expired().await?;
        self.backend.count_ready().await
    }

    /// Up to `limit` aborted messages, oldest first.
    pub async fn buried(&self, limit: usize) -> Result<Vec<BuriedMessage>> {
        self.backend.buried(limit).await
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Release the backend handle. Dropping the queue does the same, less
    /// politely.
    pub async fn close(self) {
        self.backend.close().await;
    }

    /// Destroy the queue's store: every message, buried or not, and the
    /// store itself. Irreversible. Meant for tests and teardown.
    pub async fn flush(self) -> Result<()> {
        info!(queue = %self.name, "flushing queue store");
        self.backend.destroy().await
    }

    // -----------------------------------------------------------------------
    // Claim protocol
    // -----------------------------------------------------------------------

    async fn claim_next(&self, timeout: Option<Duration>, mode: ClaimMode) -> Result<Option<Message>> {
        let timeout = timeout.unwrap_or(self.settings.default_timeout);
        let started = Instant::now();
        // Absurd timeouts saturate to "effectively forever".
        let deadline = started
            .checked_add(timeout)
            .unwrap_or_else(|| started + Duration::from_secs(u32::MAX as u64));
        let span = start_claim_span(&self.name, mode.as_str());

        let result: Result<Option<Message>> = async {
            let mut attempt: u32 = 0;
            let mut polls: u32 = 0;
            loop {
                // Armed before polling so a submit landing between the poll
                // and the sleep still wakes us.
                let notified = self.wakeup.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                polls += 1;
                match self.poll_once(mode, &span).await? {
                    Claim::Won(message) => {
                        record_claim(&span, message.id, polls);
                        return Ok(Some(message));
                    }
                    Claim::Lost => attempt = 0,
                    // Each buried row shrinks the ready set; look again at once.
                    Claim::Buried => continue,
                    Claim::Empty => {}
                }

                let now = Instant::now();
                if now >= deadline {
                    return Ok(None);
                }

                let delay = self.wait.delay(attempt).min(deadline - now);
                tokio::select! {
                    () = tokio::time::sleep(delay) => attempt = attempt.saturating_add(1),
                    () = notified => attempt = 0,
                }
            }
        }
        .instrument(span.clone())
        .await;

        let outcome = match &result {
            Ok(Some(_)) => "claimed",
            Ok(None) => "timeout",
            Err(_) => "error",
        };
        metrics::wait_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[
                KeyValue::new("queue", self.name.clone()),
                KeyValue::new("operation", mode.as_str()),
                KeyValue::new("result", outcome),
            ],
        );
        self.count_operation(mode.as_str(), outcome);
        result
    }

    /// One cycle: look at the oldest ready row and try to claim it once.
    async fn poll_once(&self, mode: ClaimMode, span: &Span) -> Result<Claim> {
        self.sweep_expired().await?;

        let Some(candidate) = self.backend.oldest_ready(1).await?.into_iter().next() else {
            return Ok(Claim::Empty);
        };

        // Decode before claiming; a bad row is buried, never handed out.
        let mut message = match decode(&candidate) {
            Ok(message) => message,
            Err(e) => return self.bury_undecodable(&candidate, &e).await,
        };

        let lease = candidate.lease.wrapping_add(1);
        let affected = match mode {
            ClaimMode::Reserve => {
                let reserved_until = self.reservation_deadline()?;
                message.lease = lease;
                message.reserved_until = reserved_until;
                self.backend.reserve(candidate.id, lease, reserved_until).await?
            }
            ClaimMode::Take => self.backend.delete_ready(candidate.id).await?,
        };

        if affected != 1 {
            debug!(queue = %self.name, id = %candidate.id, "claim lost to another consumer");
            metrics::claim_conflicts().add(
                1,
                &[
                    KeyValue::new("queue", self.name.clone()),
                    KeyValue::new("operation", mode.as_str()),
                ],
            );
            return Ok(Claim::Lost);
        }

        record_state_transition(span, candidate.id, "ready", mode.target_state());
        Ok(Claim::Won(message))
    }

    /// Claim an undecodable ready row and move it to the buried ledger with
    /// the decode error as its reason.
    async fn bury_undecodable(&self, candidate: &StoredMessage, error: &serde_json::Error) -> Result<Claim> {
        let lease = candidate.lease.wrapping_add(1);
        if self.backend.reserve(candidate.id, lease, None).await? != 1 {
            return Ok(Claim::Lost);
        }
        let reason = format!("undecodable payload: {error}");
        let buried = self.backend.bury(candidate.id, Some(lease), Utc::now(), Some(&reason)).await?;
        if buried == 1 {
            warn!(queue = %self.name, id = %candidate.id, error = %error, "undecodable payload buried");
        }
        self.count_operation("bury_undecodable", if buried == 1 { "ok" } else { "noop" });
        Ok(Claim::Buried)
    }

    /// Return lapsed reservations to the ready set. No-op without a
    /// visibility timeout.
    async fn sweep_expired(&self) -> Result<()> {
        if self.settings.visibility_timeout.is_none() {
            return Ok(());
        }
        let requeued = self.backend.requeue_expired(Utc::now()).await?;
        if requeued > 0 {
            warn!(queue = %self.name, count = requeued, "reservations expired, messages visible again");
            metrics::reservations_expired().add(requeued, &[KeyValue::new("queue", self.name.clone())]);
            self.wakeup.notify_waiters();
        }
        Ok(())
    }

    fn reservation_deadline(&self) -> Result<Option<DateTime<Utc>>> {
        let Some(timeout) = self.settings.visibility_timeout else {
            return Ok(None);
        };
        TimeDelta::from_std(timeout)
            .ok()
            .and_then(|delta| Utc::now().checked_add_signed(delta))
            .map(Some)
            .ok_or_else(|| Error::Config(format!("visibility timeout {timeout:?} is out of range")))
    }

    fn count_operation(&self, operation: &'static str, result: &'static str) {
        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", self.name.clone()),
                KeyValue::new("operation", operation),
                KeyValue::new("result", result),
            ],
        );
    }
}

fn decode(row: &StoredMessage) -> serde_json::Result<Message> {
    Ok(Message {
        id: row.id,
        payload: serde_json::from_str(&row.payload)?,
        failures: row.failures,
        lease: row.lease,
        reserved_until: None,
    })
}
