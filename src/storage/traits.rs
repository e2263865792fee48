// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    /// No key loaded, or the cipher refused to seal
    #[error("Encryption failure: {0}")]
    EncryptionFailure(String),
    /// Tampered blob or wrong key; callers treat this as a miss
    #[error("Decryption failure for '{id}'")]
    DecryptionFailure { id: String },
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// A sealed pending write as held by the backend, in queue order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingBlob {
    pub storage_id: String,
    pub seq: i64,
    pub blob: Vec<u8>,
}

/// Raw blob persistence underneath the encrypted store.
///
/// Implementations only ever see storage ids (hex digests) and ciphertext.
/// Every mutating call must be durable when it returns.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put_record(&self, owner_sid: &str, storage_id: &str, blob: &[u8]) -> Result<(), StorageError>;
    async fn get_record(&self, storage_id: &str) -> Result<Option<Vec<u8>>, StorageError>;
    async fn delete_record(&self, owner_sid: &str, storage_id: &str) -> Result<(), StorageError>;

    /// Page through the owner index in stable order.
    /// Returns an empty vec once `offset` passes the end.
    async fn owner_records(&self, owner_sid: &str, offset: u64, limit: usize) -> Result<Vec<String>, StorageError>;

    /// Owner storage ids present in the index.
    async fn owners(&self) -> Result<Vec<String>, StorageError>;

    /// Remove every record, index row and pending write of an owner.
    /// Returns the number of records removed.
    async fn delete_owner(&self, owner_sid: &str) -> Result<u64, StorageError>;

    /// Insert a pending write, or replace the blob of an existing one for the
    /// same storage id while keeping its queue position.
    async fn upsert_pending(&self, owner_sid: &str, storage_id: &str, blob: &[u8]) -> Result<(), StorageError>;

    /// Existing pending blob for a storage id (used to carry the base version forward).
    async fn get_pending(&self, storage_id: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Pending writes of an owner, oldest first.
    async fn pending_for_owner(&self, owner_sid: &str) -> Result<Vec<PendingBlob>, StorageError>;

    async fn remove_pending(&self, storage_id: &str) -> Result<(), StorageError>;
}
