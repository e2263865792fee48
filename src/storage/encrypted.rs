// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Encrypted, owner-scoped offline store.
//!
//! Sits between the coordinator and a raw [`BlobStore`]. Records and pending
//! writes are serialized to JSON, sealed with the active owner's
//! [`RecordCipher`], and written under their storage id. Only the owner that
//! is currently active can read anything back.
//!
//! ```text
//! put(record) ──► serde_json ──► seal(storage_id) ──► BlobStore::put_record
//! get(key)    ◄── serde_json ◄── open(storage_id) ◄── BlobStore::get_record
//!                                   │
//!                                   └─ auth failure ⇒ warn + None
//! ```

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use super::traits::{BlobStore, StorageError};
use crate::crypto::{DeviceKey, RecordCipher};
use crate::metrics::LatencyTimer;
use crate::record::{OwnerId, PendingWrite, Record, RecordKey};
use crate::util::PageCursor;

struct ActiveOwner {
    owner: OwnerId,
    owner_sid: String,
    cipher: RecordCipher,
}

/// Associated data for pending blobs, kept distinct from record blobs so the
/// two tables can't be swapped.
fn pending_aad(storage_id: &str) -> String {
    format!("pending/{}", storage_id)
}

pub struct EncryptedStore {
    backend: Arc<dyn BlobStore>,
    active: RwLock<Option<Arc<ActiveOwner>>>,
}

impl EncryptedStore {
    pub fn new(backend: Arc<dyn BlobStore>) -> Self {
        Self {
            backend,
            active: RwLock::new(None),
        }
    }

    /// Load the cipher and make `owner` the only readable owner.
    pub fn activate(&self, owner: &OwnerId, key: &DeviceKey) {
        let active = ActiveOwner {
            owner: owner.clone(),
            owner_sid: owner.storage_id(),
            cipher: RecordCipher::new(key),
        };
        *self.active.write() = Some(Arc::new(active));
        info!(owner = %owner, "Offline store activated");
    }

    /// Drop the cipher. Subsequent puts fail and gets miss.
    pub fn deactivate(&self) {
        if let Some(prev) = self.active.write().take() {
            info!(owner = %prev.owner, "Offline store deactivated");
        }
    }

    #[must_use]
    pub fn active_owner(&self) -> Option<OwnerId> {
        self.active.read().as_ref().map(|a| a.owner.clone())
    }

    fn active_for(&self, owner: &OwnerId) -> Option<Arc<ActiveOwner>> {
        self.active
            .read()
            .as_ref()
            .filter(|a| &a.owner == owner)
            .cloned()
    }

    fn require_active(&self, owner: &OwnerId, op: &str) -> Result<Arc<ActiveOwner>, StorageError> {
        self.active_for(owner).ok_or_else(|| {
            match self.active_owner() {
                Some(active) => error!(op, active = %active, requested = %owner, "Store refused cross-owner access"),
                None => warn!(op, owner = %owner, "Store has no active key"),
            }
            StorageError::EncryptionFailure(format!("no key loaded for owner '{}'", owner))
        })
    }

    /// Seal and persist a record. Durable when this returns.
    pub async fn put(&self, record: &Record) -> Result<(), StorageError> {
        let start = Instant::now();
        let active = self.require_active(record.key.owner(), "put")?;
        let sid = record.key.storage_id();
        let plain = serde_json::to_vec(record).map_err(|e| StorageError::Serialization(e.to_string()))?;
        let blob = active.cipher.seal(&sid, &plain)?;
        self.backend.put_record(&active.owner_sid, &sid, &blob).await?;
        crate::metrics::record_store_op("put", "success");
        crate::metrics::record_store_latency("put", start.elapsed());
        Ok(())
    }

    /// Record for `key`, or `None` if absent, foreign, or unreadable.
    pub async fn get(&self, key: &RecordKey) -> Result<Option<Record>, StorageError> {
        let _timer = LatencyTimer::new("store", "get");
        let Some(active) = self.active_for(key.owner()) else {
            return Ok(None);
        };
        let sid = key.storage_id();
        let Some(blob) = self.backend.get_record(&sid).await? else {
            return Ok(None);
        };
        Ok(self.open_record(&active, &sid, &blob).filter(|r| &r.key == key))
    }

    fn open_record(&self, active: &ActiveOwner, sid: &str, blob: &[u8]) -> Option<Record> {
        let plain = match active.cipher.open(sid, blob) {
            Ok(p) => p,
            Err(e) => {
                warn!(storage_id = %sid, error = %e, "Unreadable record treated as missing");
                crate::metrics::record_decryption_failure();
                return None;
            }
        };
        match serde_json::from_slice::<Record>(&plain) {
            Ok(r) => Some(r),
            Err(e) => {
                warn!(storage_id = %sid, error = %e, "Undecodable record treated as missing");
                crate::metrics::record_decryption_failure();
                None
            }
        }
    }

    /// Remove one record (server-side deletion).
    pub async fn delete(&self, key: &RecordKey) -> Result<(), StorageError> {
        let active = self.require_active(key.owner(), "delete")?;
        self.backend.delete_record(&active.owner_sid, &key.storage_id()).await
    }

    /// Erase every record and pending write of `owner`. Idempotent; needs no key.
    pub async fn delete_all_for_owner(&self, owner: &OwnerId) -> Result<u64, StorageError> {
        let removed = self.backend.delete_owner(&owner.storage_id()).await?;
        info!(owner = %owner, removed, "Owner data erased");
        Ok(removed)
    }

    /// Owner storage ids present on disk.
    pub async fn owners(&self) -> Result<Vec<String>, StorageError> {
        self.backend.owners().await
    }

    /// Erase every owner except `keep`. Returns how many owners were purged.
    pub async fn purge_other_owners(&self, keep: &OwnerId) -> Result<usize, StorageError> {
        let keep_sid = keep.storage_id();
        let mut purged = 0;
        for sid in self.backend.owners().await? {
            if sid != keep_sid {
                let removed = self.backend.delete_owner(&sid).await?;
                warn!(owner_sid = %sid, removed, "Purged data left behind by another owner");
                purged += 1;
            }
        }
        Ok(purged)
    }

    /// Queue a write for flush.
    ///
    /// A write for a key that is already queued replaces the queued payload
    /// but keeps its queue position and its original base version.
    pub async fn enqueue_pending_write(&self, write: &PendingWrite) -> Result<(), StorageError> {
        let active = self.require_active(write.key.owner(), "enqueue")?;
        let sid = write.key.storage_id();
        let aad = pending_aad(&sid);

        let mut write = write.clone();
        if let Some(existing) = self.backend.get_pending(&sid).await? {
            if let Some(prev) = self.open_pending(&active, &aad, &existing) {
                debug!(key = %write.key, base_version = prev.base_version, "Superseding queued write");
                write.base_version = prev.base_version;
            }
        }

        let plain = serde_json::to_vec(&write).map_err(|e| StorageError::Serialization(e.to_string()))?;
        let blob = active.cipher.seal(&aad, &plain)?;
        self.backend.upsert_pending(&active.owner_sid, &sid, &blob).await
    }

    fn open_pending(&self, active: &ActiveOwner, aad: &str, blob: &[u8]) -> Option<PendingWrite> {
        let decoded = active
            .cipher
            .open(aad, blob)
            .ok()
            .and_then(|plain| serde_json::from_slice::<PendingWrite>(&plain).ok());
        if decoded.is_none() {
            warn!(aad = %aad, "Unreadable pending write skipped");
            crate::metrics::record_decryption_failure();
        }
        decoded
    }

    /// Queued writes of `owner`, oldest first.
    ///
    /// Writes stay queued until [`remove_pending_write`](Self::remove_pending_write),
    /// so a crash mid-flush loses nothing.
    pub async fn drain_pending_writes(&self, owner: &OwnerId) -> Result<Vec<PendingWrite>, StorageError> {
        let _timer = LatencyTimer::new("store", "drain");
        let Some(active) = self.active_for(owner) else {
            return Ok(Vec::new());
        };
        let queued = self.backend.pending_for_owner(&active.owner_sid).await?;
        Ok(queued
            .iter()
            .filter_map(|p| self.open_pending(&active, &pending_aad(&p.storage_id), &p.blob))
            .collect())
    }

    /// The queued write for `key`, if any.
    pub async fn pending_write(&self, key: &RecordKey) -> Result<Option<PendingWrite>, StorageError> {
        let Some(active) = self.active_for(key.owner()) else {
            return Ok(None);
        };
        let sid = key.storage_id();
        let Some(blob) = self.backend.get_pending(&sid).await? else {
            return Ok(None);
        };
        Ok(self.open_pending(&active, &pending_aad(&sid), &blob))
    }

    /// Acknowledge one resolved write.
    pub async fn remove_pending_write(&self, key: &RecordKey) -> Result<(), StorageError> {
        self.backend.remove_pending(&key.storage_id()).await
    }

    /// Whether `key` has a queued write.
    pub async fn has_pending_write(&self, key: &RecordKey) -> Result<bool, StorageError> {
        Ok(self.backend.get_pending(&key.storage_id()).await?.is_some())
    }

    /// All dirty records of `owner`, walking the owner index page by page.
    pub async fn dirty_records(&self, owner: &OwnerId, page_size: usize) -> Result<Vec<Record>, StorageError> {
        let Some(active) = self.active_for(owner) else {
            return Ok(Vec::new());
        };
        let mut cursor = PageCursor::new(page_size);
        let mut dirty = Vec::new();
        while let Some(page) = cursor
            .next_page(|offset, limit| self.backend.owner_records(&active.owner_sid, offset, limit))
            .await?
        {
            for sid in page {
                let Some(blob) = self.backend.get_record(&sid).await? else {
                    continue;
                };
                if let Some(record) = self.open_record(&active, &sid, &blob) {
                    if record.local_dirty {
                        dirty.push(record);
                    }
                }
            }
        }
        Ok(dirty)
    }
}
