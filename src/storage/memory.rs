// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use super::traits::{BlobStore, PendingBlob, StorageError};

#[derive(Default)]
struct PendingQueue {
    by_seq: BTreeMap<i64, (String, String, Vec<u8>)>,
    seq_of: BTreeMap<String, i64>,
}

/// Volatile blob store.
///
/// Clones share the same maps, so dropping one coordinator and building a new
/// one over a clone behaves like a process restart against the same disk.
#[derive(Clone, Default)]
pub struct InMemoryBlobStore {
    records: Arc<DashMap<String, (String, Vec<u8>)>>,
    owner_index: Arc<DashMap<String, BTreeSet<String>>>,
    pending: Arc<Mutex<PendingQueue>>,
    next_seq: Arc<AtomicI64>,
    fail_writes: Arc<AtomicBool>,
}

impl InMemoryBlobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of record blobs across all owners
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.lock().by_seq.len()
    }

    /// Make every mutating call fail, simulating a full or broken disk.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }

    /// Overwrite a stored blob in place (tamper simulation).
    pub fn corrupt_record(&self, storage_id: &str) -> bool {
        match self.records.get_mut(storage_id) {
            Some(mut entry) => {
                if let Some(byte) = entry.1.last_mut() {
                    *byte ^= 0xFF;
                }
                true
            }
            None => false,
        }
    }

    fn check_writable(&self) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(StorageError::Backend("simulated write failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put_record(&self, owner_sid: &str, storage_id: &str, blob: &[u8]) -> Result<(), StorageError> {
        self.check_writable()?;
        self.records
            .insert(storage_id.to_string(), (owner_sid.to_string(), blob.to_vec()));
        self.owner_index
            .entry(owner_sid.to_string())
            .or_default()
            .insert(storage_id.to_string());
        Ok(())
    }

    async fn get_record(&self, storage_id: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.records.get(storage_id).map(|r| r.value().1.clone()))
    }

    async fn delete_record(&self, owner_sid: &str, storage_id: &str) -> Result<(), StorageError> {
        self.check_writable()?;
        self.records.remove(storage_id);
        if let Some(mut keys) = self.owner_index.get_mut(owner_sid) {
            keys.remove(storage_id);
        }
        Ok(())
    }

    async fn owner_records(&self, owner_sid: &str, offset: u64, limit: usize) -> Result<Vec<String>, StorageError> {
        Ok(self
            .owner_index
            .get(owner_sid)
            .map(|keys| {
                keys.iter()
                    .skip(offset as usize)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn owners(&self) -> Result<Vec<String>, StorageError> {
        let mut owners: BTreeSet<String> = self
            .owner_index
            .iter()
            .filter(|e| !e.value().is_empty())
            .map(|e| e.key().clone())
            .collect();
        for (owner, _, _) in self.pending.lock().by_seq.values() {
            owners.insert(owner.clone());
        }
        Ok(owners.into_iter().collect())
    }

    async fn delete_owner(&self, owner_sid: &str) -> Result<u64, StorageError> {
        self.check_writable()?;
        let mut removed = 0u64;
        if let Some((_, keys)) = self.owner_index.remove(owner_sid) {
            for sid in keys {
                if self.records.remove(&sid).is_some() {
                    removed += 1;
                }
            }
        }
        let mut queue = self.pending.lock();
        let doomed: Vec<i64> = queue
            .by_seq
            .iter()
            .filter(|(_, (owner, _, _))| owner == owner_sid)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in doomed {
            if let Some((_, sid, _)) = queue.by_seq.remove(&seq) {
                queue.seq_of.remove(&sid);
            }
        }
        Ok(removed)
    }

    async fn upsert_pending(&self, owner_sid: &str, storage_id: &str, blob: &[u8]) -> Result<(), StorageError> {
        self.check_writable()?;
        let mut queue = self.pending.lock();
        let seq = match queue.seq_of.get(storage_id) {
            Some(seq) => *seq,
            None => self.next_seq.fetch_add(1, Ordering::AcqRel),
        };
        queue.seq_of.insert(storage_id.to_string(), seq);
        queue
            .by_seq
            .insert(seq, (owner_sid.to_string(), storage_id.to_string(), blob.to_vec()));
        Ok(())
    }

    async fn get_pending(&self, storage_id: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let queue = self.pending.lock();
        Ok(queue
            .seq_of
            .get(storage_id)
            .and_then(|seq| queue.by_seq.get(seq))
            .map(|(_, _, blob)| blob.clone()))
    }

    async fn pending_for_owner(&self, owner_sid: &str) -> Result<Vec<PendingBlob>, StorageError> {
        let queue = self.pending.lock();
        Ok(queue
            .by_seq
            .iter()
            .filter(|(_, (owner, _, _))| owner == owner_sid)
            .map(|(seq, (_, sid, blob))| PendingBlob {
                storage_id: sid.clone(),
                seq: *seq,
                blob: blob.clone(),
            })
            .collect())
    }

    async fn remove_pending(&self, storage_id: &str) -> Result<(), StorageError> {
        self.check_writable()?;
        let mut queue = self.pending.lock();
        if let Some(seq) = queue.seq_of.remove(storage_id) {
            queue.by_seq.remove(&seq);
        }
        Ok(())
    }
}
