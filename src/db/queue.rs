//! Queue row operations on SQLite.
//!
//! Each transition is a single conditional statement; `rows_affected()` is
//! the only race signal the engine relies on.

use chrono::{DateTime, Utc};

use super::Db;
use crate::error::Result;
use crate::model::{BuriedMessage, MessageId, Status};
use crate::storage::{Backend, StoredMessage};

impl Backend for Db {
    async fn insert(&self, payload: &str) -> Result<Option<MessageId>> {
        let result = sqlx::query("INSERT INTO queue (payload, status) VALUES (?1, ?2)")
            .bind(payload)
            .bind(Status::Ready.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() != 1 {
            return Ok(None);
        }
        Ok(Some(MessageId(result.last_insert_rowid())))
    }

    async fn oldest_ready(&self, limit: usize) -> Result<Vec<StoredMessage>> {
        let rows: Vec<QueueRow> = sqlx::query_as(
            "SELECT id, payload, failures, lease FROM queue
             WHERE status = ?1
             ORDER BY id ASC
             LIMIT ?2",
        )
        .bind(Status::Ready.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(StoredMessage::from).collect())
    }

    async fn count_ready(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(id) FROM queue WHERE status = ?1")
            .bind(Status::Ready.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn reserve(&self, id: MessageId, lease: u32, reserved_until: Option<DateTime<Utc>>) -> Result<u64> {
        let rows_affected = sqlx::query(
            "UPDATE queue SET status = ?1, reserved_until = ?2, lease = ?3
             WHERE id = ?4 AND status = ?5",
        )
        .bind(Status::Reserved.as_str())
        .bind(reserved_until.map(|t| t.timestamp_millis()))
        .bind(i64::from(lease))
        .bind(id.0)
        .bind(Status::Ready.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows_affected)
    }

    async fn release(&self, id: MessageId, lease: Option<u32>) -> Result<u64> {
        let rows_affected = sqlx::query(
            "UPDATE queue SET status = ?1, failures = failures + 1, reserved_until = NULL
             WHERE id = ?2 AND status = ?3 AND (?4 IS NULL OR lease = ?4)",
        )
        .bind(Status::Ready.as_str())
        .bind(id.0)
        .bind(Status::Reserved.as_str())
        .bind(lease.map(i64::from))
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows_affected)
    }

    async fn delete_reserved(&self, id: MessageId, lease: Option<u32>) -> Result<u64> {
        delete_in_status(self, id, Status::Reserved, lease).await
    }

    async fn delete_ready(&self, id: MessageId) -> Result<u64> {
        delete_in_status(self, id, Status::Ready, None).await
    }

    async fn bury(&self, id: MessageId, lease: Option<u32>, at: DateTime<Utc>, reason: Option<&str>) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let copied = sqlx::query(
            "INSERT INTO buried (id, payload, failures, buried_at, reason)
             SELECT id, payload, failures + 1, ?1, ?2 FROM queue
             WHERE id = ?3 AND status = ?4 AND (?5 IS NULL OR lease = ?5)",
        )
        .bind(at)
        .bind(reason)
        .bind(id.0)
        .bind(Status::Reserved.as_str())
        .bind(lease.map(i64::from))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if copied == 0 {
            tx.rollback().await?;
            return Ok(0);
        }

        let deleted = sqlx::query("DELETE FROM queue WHERE id = ?1 AND status = ?2")
            .bind(id.0)
            .bind(Status::Reserved.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(deleted)
    }

    async fn buried(&self, limit: usize) -> Result<Vec<BuriedMessage>> {
        let rows: Vec<BuriedRow> = sqlx::query_as(
            "SELECT id, payload, failures, buried_at, reason FROM buried
             ORDER BY id ASC
             LIMIT ?1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(BuriedMessage::from).collect())
    }

    async fn requeue_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let rows_affected = sqlx::query(
            "UPDATE queue SET status = ?1, failures = failures + 1, reserved_until = NULL
             WHERE status = ?2 AND reserved_until IS NOT NULL AND reserved_until <= ?3",
        )
        .bind(Status::Ready.as_str())
        .bind(Status::Reserved.as_str())
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows_affected)
    }

    async fn close(self) {
        self.pool.close().await;
    }

    async fn destroy(self) -> Result<()> {
        self.remove().await
    }
}

async fn delete_in_status(db: &Db, id: MessageId, status: Status, lease: Option<u32>) -> Result<u64> {
    let rows_affected = sqlx::query("DELETE FROM queue WHERE id = ?1 AND status = ?2 AND (?3 IS NULL OR lease = ?3)")
        .bind(id.0)
        .bind(status.as_str())
        .bind(lease.map(i64::from))
        .execute(&db.pool)
        .await?
        .rows_affected();
    Ok(rows_affected)
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct QueueRow {
    id: i64,
    payload: String,
    failures: i64,
    lease: i64,
}

impl From<QueueRow> for StoredMessage {
    fn from(row: QueueRow) -> Self {
        Self {
            id: MessageId(row.id),
            payload: row.payload,
            failures: row.failures as u32,
            lease: row.lease as u32,
        }
    }
}

#[derive(sqlx::FromRow)]
struct BuriedRow {
    id: i64,
    payload: String,
    failures: i64,
    buried_at: DateTime<Utc>,
    reason: Option<String>,
}

impl From<BuriedRow> for BuriedMessage {
    fn from(row: BuriedRow) -> Self {
        BuriedMessage::from_stored(
            MessageId(row.id),
            &row.payload,
            row.failures as u32,
            row.buried_at,
            row.reason,
        )
    }
}
