//! SQLite store: one database file per queue, connection pool, schema.
//!
//! Queue names map to `<root>/<sha256(name) as hex>.db`. The name is also
//! written into the store itself, so a file that already belongs to a
//! different name is refused instead of shared.

pub mod queue;

use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use tracing::{debug, info};

use crate::error::{Error, Result};

const SCHEMA: &str = include_str!("../../migrations/0001_queue.sql");

/// How long a writer waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Database handle. Owns the connection pool for one queue store.
#[derive(Debug)]
pub struct Db {
    pool: SqlitePool,
    path: PathBuf,
}

/// File name of the store for a queue name. Stable across processes,
/// platforms and releases: lowercase hex SHA-256 of the UTF-8 name.
pub fn store_file_name(name: &str) -> String {
    format!("{}.db", hex::encode(Sha256::digest(name.as_bytes())))
}

impl Db {
    /// Open (creating if needed) the store for `name` under `root`.
    pub async fn open(root: &Path, name: &str) -> Result<Self> {
        tokio::fs::create_dir_all(root).await?;
        Self::open_at(root.join(store_file_name(name)), name).await
    }

    /// Open (creating if needed) a store at an explicit path.
    pub async fn open_at(path: impl Into<PathBuf>, name: &str) -> Result<Self> {
        let path = path.into();
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let db = Self { pool, path };
        if let Err(e) = db.initialize(name).await {
            db.pool.close().await;
            return Err(e);
        }

        info!(queue = name, path = %db.path.display(), "queue store opened");
        Ok(db)
    }

    async fn initialize(&self, name: &str) -> Result<()> {
        self.migrate().await?;
        self.claim_name(name).await
    }

    /// Apply the schema. Safe to run against an existing store.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Record `name` as the owner of this store, or verify that it already is.
    async fn claim_name(&self, name: &str) -> Result<()> {
        sqlx::query("INSERT INTO queue_meta (key, value) VALUES ('name', ?1) ON CONFLICT(key) DO NOTHING")
            .bind(name)
            .execute(&self.pool)
            .await?;

        let owner: String = sqlx::query_scalar("SELECT value FROM queue_meta WHERE key = 'name'")
            .fetch_one(&self.pool)
            .await?;

        if owner != name {
            return Err(Error::NameCollision {
                requested: name.to_string(),
                existing: owner,
            });
        }
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Close the pool and delete the database file with its WAL and SHM
    /// companions.
    pub(crate) async fn remove(self) -> Result<()> {
        self.pool.close().await;
        for suffix in ["", "-wal", "-shm"] {
            let mut file = self.path.clone().into_os_string();
            file.push(suffix);
            match tokio::fs::remove_file(&file).await {
                Ok(()) => debug!(file = ?file, "removed store file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_file_name_is_sha256_hex() {
        assert_eq!(
            store_file_name("Test-queue"),
            "bb523e9e54ece762e357a33d000b0ddcdec2ea05ecde9083ccb840df0998feb1.db"
        );
        assert_eq!(
            store_file_name("orders"),
            "1c168adb00d208e42f93314529f1fa9c0427eb63233ceda95a5db52b7012a719.db"
        );
    }

    #[test]
    fn distinct_names_get_distinct_files() {
        assert_ne!(store_file_name("a"), store_file_name("A"));
        assert_ne!(store_file_name("queue"), store_file_name("queue "));
    }

    #[tokio::test]
    async fn refuses_a_store_owned_by_another_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.db");

        let first = Db::open_at(&path, "alpha").await.unwrap();
        first.pool.close().await;

        let err = Db::open_at(&path, "beta").await.unwrap_err();
        match err {
            Error::NameCollision { requested, existing } => {
                assert_eq!(requested, "beta");
                assert_eq!(existing, "alpha");
            }
            other => panic!("expected NameCollision, got {other:?}"),
        }

        // The rightful owner can still open it.
        Db::open_at(&path, "alpha").await.unwrap();
    }
}
