//! In-process backend. Same conditional-write contract as SQLite, nothing
//! survives the process. Used by tests and by embedders that only need
//! the reservation protocol.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{Backend, StoredMessage};
use crate::error::Result;
use crate::model::{BuriedMessage, MessageId, Status};

#[derive(Debug, Default)]
pub struct MemoryBackend {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    last_id: i64,
    rows: BTreeMap<MessageId, Row>,
    buried: BTreeMap<MessageId, Buried>,
}

#[derive(Debug)]
struct Buried {
    stored: StoredMessage,
    at: DateTime<Utc>,
    reason: Option<String>,
}

#[derive(Debug)]
struct Row {
    payload: String,
    status: Status,
    failures: u32,
    lease: u32,
    reserved_until: Option<DateTime<Utc>>,
}

impl Row {
    fn holds(&self, expected: Status, lease: Option<u32>) -> bool {
        self.status == expected && lease.is_none_or(|lease| lease == self.lease)
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for MemoryBackend {
    async fn insert(&self, payload: &str) -> Result<Option<MessageId>> {
        let mut inner = self.inner.lock().await;
        inner.last_id += 1;
        let id = MessageId(inner.last_id);
        inner.rows.insert(
            id,
            Row {
                payload: payload.to_string(),
                status: Status::Ready,
                failures: 0,
                lease: 0,
                reserved_until: None,
            },
        );
        Ok(Some(id))
    }

    async fn oldest_ready(&self, limit: usize) -> Result<Vec<StoredMessage>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .rows
            .iter()
            .filter(|(_, row)| row.status == Status::Ready)
            .take(limit)
            .map(|(id, row)| StoredMessage {
                id: *id,
                payload: row.payload.clone(),
                failures: row.failures,
                lease: row.lease,
            })
            .collect())
    }

    async fn count_ready(&self) -> Result<u64> {
        let inner = self.inner.lock().await;
        Ok(inner
            .rows
            .values()
            .filter(|row| row.status == Status::Ready)
            .count() as u64)
    }

    async fn reserve(&self, id: MessageId, lease: u32, reserved_until: Option<DateTime<Utc>>) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        match inner.rows.get_mut(&id) {
            Some(row) if row.status == Status::Ready => {
                row.status = Status::Reserved;
                row.lease = lease;
                row.reserved_until = reserved_until;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn release(&self, id: MessageId, lease: Option<u32>) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        match inner.rows.get_mut(&id) {
            Some(row) if row.holds(Status::Reserved, lease) => {
                row.status = Status::Ready;
                row.failures += 1;
                row.reserved_until = None;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn delete_reserved(&self, id: MessageId, lease: Option<u32>) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        Ok(remove_if(&mut inner.rows, id, Status::Reserved, lease).map_or(0, |_| 1))
    }

    async fn delete_ready(&self, id: MessageId) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        Ok(remove_if(&mut inner.rows, id, Status::Ready, None).map_or(0, |_| 1))
    }

    async fn bury(&self, id: MessageId, lease: Option<u32>, at: DateTime<Utc>, reason: Option<&str>) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let Some(row) = remove_if(&mut inner.rows, id, Status::Reserved, lease) else {
            return Ok(0);
        };
        let stored = StoredMessage {
            id,
            payload: row.payload,
            failures: row.failures + 1,
            lease: row.lease,
        };
        inner.buried.insert(
            id,
            Buried {
                stored,
                at,
                reason: reason.map(str::to_string),
            },
        );
        Ok(1)
    }

    async fn buried(&self, limit: usize) -> Result<Vec<BuriedMessage>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .buried
            .values()
            .take(limit)
            .map(|b| {
                BuriedMessage::from_stored(
                    b.stored.id,
                    &b.stored.payload,
                    b.stored.failures,
                    b.at,
                    b.reason.clone(),
                )
            })
            .collect())
    }

    async fn requeue_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let mut requeued = 0;
        for row in inner.rows.values_mut() {
            let lapsed = row.status == Status::Reserved
                && row.reserved_until.is_some_and(|until| until <= now);
            if lapsed {
                row.status = Status::Ready;
                row.failures += 1;
                row.reserved_until = None;
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    async fn close(self) {}

    async fn destroy(self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.rows.clear();
        inner.buried.clear();
        Ok(())
    }
}

fn remove_if(
    rows: &mut BTreeMap<MessageId, Row>,
    id: MessageId,
    expected: Status,
    lease: Option<u32>,
) -> Option<Row> {
    match rows.get(&id) {
        Some(row) if row.holds(expected, lease) => rows.remove(&id),
        _ => None,
    }
}
