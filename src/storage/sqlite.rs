// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite blob backend for the offline store.
//!
//! Layout (one encrypted blob per record, indexed by owner):
//! ```sql
//! CREATE TABLE records (
//!   storage_id TEXT PRIMARY KEY,   -- hex sha256 of the record key
//!   owner_sid  TEXT NOT NULL,      -- hex sha256 of the owner id
//!   blob       BLOB NOT NULL       -- nonce || ciphertext || tag
//! );
//! CREATE INDEX idx_records_owner ON records(owner_sid);
//!
//! CREATE TABLE pending_writes (
//!   seq        INTEGER PRIMARY KEY AUTOINCREMENT,  -- FIFO position
//!   storage_id TEXT NOT NULL UNIQUE,
//!   owner_sid  TEXT NOT NULL,
//!   blob       BLOB NOT NULL
//! );
//! ```
//!
//! The database runs in WAL journal mode with `synchronous = FULL`, so a
//! committed statement survives a crash immediately after it returns.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use sqlx::Row;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use super::traits::{BlobStore, PendingBlob, StorageError};
use crate::resilience::retry::{retry, RetryConfig};

fn backend(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

pub struct SqliteBlobStore {
    pool: SqlitePool,
    path: String,
}

impl SqliteBlobStore {
    /// Open (or create) the store at `path` with startup-mode retry.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_secs(5));

        let pool = retry("sqlite_open", &RetryConfig::startup(), || {
            let options = options.clone();
            async move {
                SqlitePoolOptions::new()
                    .max_connections(4)
                    .acquire_timeout(Duration::from_secs(10))
                    .connect_with(options)
                    .await
                    .map_err(backend)
            }
        })
        .await?;

        let store = Self { pool, path: path_str };
        store.init_schema().await?;
        info!(path = %store.path, "Offline store opened");
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS records (
                storage_id TEXT PRIMARY KEY,
                owner_sid TEXT NOT NULL,
                blob BLOB NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_records_owner ON records(owner_sid)",
            r#"
            CREATE TABLE IF NOT EXISTS pending_writes (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                storage_id TEXT NOT NULL UNIQUE,
                owner_sid TEXT NOT NULL,
                blob BLOB NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_pending_owner ON pending_writes(owner_sid, seq)",
        ];
        for sql in statements {
            sqlx::query(sql).execute(&self.pool).await.map_err(backend)?;
        }
        Ok(())
    }

    /// Path of the database file (for display).
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Close the pool, flushing WAL frames.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl BlobStore for SqliteBlobStore {
    async fn put_record(&self, owner_sid: &str, storage_id: &str, blob: &[u8]) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO records (storage_id, owner_sid, blob) VALUES (?, ?, ?) \
             ON CONFLICT(storage_id) DO UPDATE SET owner_sid = excluded.owner_sid, blob = excluded.blob",
        )
        .bind(storage_id)
        .bind(owner_sid)
        .bind(blob)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn get_record(&self, storage_id: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let row = sqlx::query("SELECT blob FROM records WHERE storage_id = ?")
            .bind(storage_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.map(|r| r.try_get::<Vec<u8>, _>("blob").map_err(backend))
            .transpose()
    }

    async fn delete_record(&self, owner_sid: &str, storage_id: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM records WHERE storage_id = ? AND owner_sid = ?")
            .bind(storage_id)
            .bind(owner_sid)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn owner_records(&self, owner_sid: &str, offset: u64, limit: usize) -> Result<Vec<String>, StorageError> {
        let rows = sqlx::query(
            "SELECT storage_id FROM records WHERE owner_sid = ? ORDER BY storage_id LIMIT ? OFFSET ?",
        )
        .bind(owner_sid)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("storage_id").map_err(backend))
            .collect()
    }

    async fn owners(&self) -> Result<Vec<String>, StorageError> {
        let rows = sqlx::query(
            "SELECT owner_sid FROM records UNION SELECT owner_sid FROM pending_writes ORDER BY owner_sid",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("owner_sid").map_err(backend))
            .collect()
    }

    async fn delete_owner(&self, owner_sid: &str) -> Result<u64, StorageError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        let removed = sqlx::query("DELETE FROM records WHERE owner_sid = ?")
            .bind(owner_sid)
            .execute(&mut *tx)
            .await
            .map_err(backend)?
            .rows_affected();
        sqlx::query("DELETE FROM pending_writes WHERE owner_sid = ?")
            .bind(owner_sid)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        tx.commit().await.map_err(backend)?;
        debug!(removed, "Owner rows deleted");
        Ok(removed)
    }

    async fn upsert_pending(&self, owner_sid: &str, storage_id: &str, blob: &[u8]) -> Result<(), StorageError> {
        // ON CONFLICT keeps the row (and its seq), so a superseding write holds its queue slot.
        sqlx::query(
            "INSERT INTO pending_writes (storage_id, owner_sid, blob) VALUES (?, ?, ?) \
             ON CONFLICT(storage_id) DO UPDATE SET blob = excluded.blob",
        )
        .bind(storage_id)
        .bind(owner_sid)
        .bind(blob)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn get_pending(&self, storage_id: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let row = sqlx::query("SELECT blob FROM pending_writes WHERE storage_id = ?")
            .bind(storage_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.map(|r| r.try_get::<Vec<u8>, _>("blob").map_err(backend))
            .transpose()
    }

    async fn pending_for_owner(&self, owner_sid: &str) -> Result<Vec<PendingBlob>, StorageError> {
        let rows = sqlx::query(
            "SELECT seq, storage_id, blob FROM pending_writes WHERE owner_sid = ? ORDER BY seq",
        )
        .bind(owner_sid)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter()
            .map(|r| {
                Ok(PendingBlob {
                    seq: r.try_get::<i64, _>("seq").map_err(backend)?,
                    storage_id: r.try_get::<String, _>("storage_id").map_err(backend)?,
                    blob: r.try_get::<Vec<u8>, _>("blob").map_err(backend)?,
                })
            })
            .collect()
    }

    async fn remove_pending(&self, storage_id: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM pending_writes WHERE storage_id = ?")
            .bind(storage_id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let dir = tempdir().unwrap();
        let store = SqliteBlobStore::open(dir.path().join("store.db")).await.unwrap();

        store.put_record("o1", "r1", b"sealed").await.unwrap();
        assert_eq!(store.get_record("r1").await.unwrap(), Some(b"sealed".to_vec()));
        assert!(store.get_record("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_persistence_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("restart.db");

        {
            let store = SqliteBlobStore::open(&path).await.unwrap();
            store.put_record("o1", "r1", b"one").await.unwrap();
            store.upsert_pending("o1", "r1", b"p1").await.unwrap();
            store.close().await;
        }

        let store = SqliteBlobStore::open(&path).await.unwrap();
        assert_eq!(store.get_record("r1").await.unwrap(), Some(b"one".to_vec()));
        assert_eq!(store.pending_for_owner("o1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_pending_fifo_with_supersede() {
        let dir = tempdir().unwrap();
        let store = SqliteBlobStore::open(dir.path().join("fifo.db")).await.unwrap();

        store.upsert_pending("o1", "a", b"a1").await.unwrap();
        store.upsert_pending("o1", "b", b"b1").await.unwrap();
        store.upsert_pending("o1", "a", b"a2").await.unwrap();

        let pending = store.pending_for_owner("o1").await.unwrap();
        let ids: Vec<_> = pending.iter().map(|p| p.storage_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(pending[0].blob, b"a2".to_vec());

        store.remove_pending("a").await.unwrap();
        assert_eq!(store.pending_for_owner("o1").await.unwrap().len(), 1);
        assert!(store.get_pending("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_owner_only_touches_owner() {
        let dir = tempdir().unwrap();
        let store = SqliteBlobStore::open(dir.path().join("owners.db")).await.unwrap();

        store.put_record("o1", "r1", b"x").await.unwrap();
        store.put_record("o1", "r2", b"x").await.unwrap();
        store.put_record("o2", "r3", b"y").await.unwrap();
        store.upsert_pending("o1", "r1", b"p").await.unwrap();

        assert_eq!(store.delete_owner("o1").await.unwrap(), 2);
        assert_eq!(store.delete_owner("o1").await.unwrap(), 0);
        assert_eq!(store.owners().await.unwrap(), vec!["o2".to_string()]);
        assert!(store.pending_for_owner("o1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_owner_records_paging() {
        let dir = tempdir().unwrap();
        let store = SqliteBlobStore::open(dir.path().join("paging.db")).await.unwrap();
        for i in 0..5 {
            store.put_record("o1", &format!("r{}", i), b"x").await.unwrap();
        }
        assert_eq!(store.owner_records("o1", 0, 3).await.unwrap().len(), 3);
        assert_eq!(store.owner_records("o1", 3, 3).await.unwrap().len(), 2);
        assert!(store.owner_records("o1", 5, 3).await.unwrap().is_empty());
    }
}
