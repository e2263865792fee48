// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Server-wins reconciliation of queued writes.
//!
//! For each pending write:
//!
//! ```text
//! fetch server ──► payload already there? ──yes──► AlreadyApplied (crash after ack)
//!      │                    no
//!      ▼
//! server.version == base ──yes──► push ──Accepted──► Pushed (clean, new version)
//!      │ no                          └─Conflict──┐
//!      ▼                                          ▼
//!  server wins ◄──────────────────────────────────┘
//!  (overwrite or delete local, log one ConflictRecord)
//! ```
//!
//! A network failure leaves the write queued and the local record dirty.
//! Callers hold the owner lock around [`ConflictResolver::resolve`].

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info};

use crate::coordinator::SyncError;
use crate::realtime::AppliedEvents;
use crate::record::{now_millis, ConflictRecord, PendingWrite, Record, RecordKey, Resolution};
use crate::remote::{PushOutcome, RemoteBackend};
use crate::resilience::circuit_breaker::CircuitBreaker;
use crate::storage::encrypted::EncryptedStore;

/// Bounded history of resolved conflicts, oldest evicted first.
pub struct ConflictLog {
    capacity: usize,
    entries: Mutex<VecDeque<ConflictRecord>>,
}

impl ConflictLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    pub fn push(&self, conflict: ConflictRecord) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.lock();
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(conflict);
    }

    /// Retained conflicts, oldest first.
    #[must_use]
    pub fn recent(&self) -> Vec<ConflictRecord> {
        self.entries.lock().iter().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// What happened to one pending write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResolution {
    /// Server accepted the write
    Pushed { record: Record },
    /// Server already held this payload (an earlier push was acknowledged but not recorded)
    AlreadyApplied { record: Record },
    /// Server value replaced the local edit
    ServerWins { record: Record, conflict: ConflictRecord },
    /// Server deleted the record; local edit dropped
    Discarded { conflict: ConflictRecord },
}

impl WriteResolution {
    /// The clean record now stored locally, if any.
    #[must_use]
    pub fn record(&self) -> Option<&Record> {
        match self {
            Self::Pushed { record } | Self::AlreadyApplied { record } | Self::ServerWins { record, .. } => Some(record),
            Self::Discarded { .. } => None,
        }
    }

    #[must_use]
    pub fn conflict(&self) -> Option<&ConflictRecord> {
        match self {
            Self::ServerWins { conflict, .. } | Self::Discarded { conflict } => Some(conflict),
            _ => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Pushed { .. } => "pushed",
            Self::AlreadyApplied { .. } => "already_applied",
            Self::ServerWins { .. } => "server_wins",
            Self::Discarded { .. } => "local_discarded",
        }
    }
}

pub struct ConflictResolver {
    backend: Arc<dyn RemoteBackend>,
    breaker: Arc<CircuitBreaker>,
    log: Arc<ConflictLog>,
    applied: Arc<AppliedEvents>,
}

impl ConflictResolver {
    pub fn new(
        backend: Arc<dyn RemoteBackend>,
        breaker: Arc<CircuitBreaker>,
        log: Arc<ConflictLog>,
        applied: Arc<AppliedEvents>,
    ) -> Self {
        Self { backend, breaker, log, applied }
    }

    #[must_use]
    pub fn log(&self) -> &Arc<ConflictLog> {
        &self.log
    }

    /// Reconcile one pending write against the server.
    pub async fn resolve(&self, store: &EncryptedStore, write: &PendingWrite) -> Result<WriteResolution, SyncError> {
        let key = &write.key;
        let server = self.fetch(key).await?;
        let server_version = server.as_ref().map_or(0, |r| r.version);

        let resolution = match server {
            Some(current) if current.payload == write.payload && current.version > write.base_version => {
                debug!(key = %key, version = current.version, "Write already on server");
                let record = Record::from_server(key.clone(), current.payload, current.version);
                store.put(&record).await?;
                WriteResolution::AlreadyApplied { record }
            }
            _ if server_version == write.base_version => {
                match self.push(key, &write.payload, write.base_version).await? {
                    PushOutcome::Accepted { version, event_id } => {
                        self.applied.insert(event_id);
                        let record = Record::from_server(key.clone(), write.payload.clone(), version);
                        store.put(&record).await?;
                        debug!(key = %key, version, "Write pushed");
                        WriteResolution::Pushed { record }
                    }
                    PushOutcome::Conflict { current: latest } => {
                        debug!(key = %key, "Push lost the race, server wins");
                        self.server_wins(store, write, latest).await?
                    }
                }
            }
            current => self.server_wins(store, write, current).await?,
        };

        store.remove_pending_write(key).await?;
        crate::metrics::record_resolution(resolution.label());
        Ok(resolution)
    }

    async fn fetch(&self, key: &RecordKey) -> Result<Option<Record>, SyncError> {
        let backend = &self.backend;
        self.breaker
            .execute(|| backend.fetch(key))
            .await
            .map_err(SyncError::from)
    }

    async fn push(&self, key: &RecordKey, payload: &[u8], base_version: u64) -> Result<PushOutcome, SyncError> {
        let backend = &self.backend;
        self.breaker
            .execute(|| backend.push(key, payload, base_version))
            .await
            .map_err(SyncError::from)
    }

    async fn server_wins(
        &self,
        store: &EncryptedStore,
        write: &PendingWrite,
        current: Option<Record>,
    ) -> Result<WriteResolution, SyncError> {
        let key = &write.key;
        let resolution = match current {
            Some(remote) => {
                let record = Record::from_server(key.clone(), remote.payload.clone(), remote.version);
                store.put(&record).await?;
                let conflict = ConflictRecord {
                    key: key.clone(),
                    local_payload: write.payload.clone(),
                    remote_payload: Some(remote.payload),
                    remote_version: remote.version,
                    resolution: Resolution::ServerWins,
                    resolved_at: now_millis(),
                };
                WriteResolution::ServerWins { record, conflict }
            }
            None => {
                store.delete(key).await?;
                let conflict = ConflictRecord {
                    key: key.clone(),
                    local_payload: write.payload.clone(),
                    remote_payload: None,
                    remote_version: 0,
                    resolution: Resolution::LocalDiscarded,
                    resolved_at: now_millis(),
                };
                WriteResolution::Discarded { conflict }
            }
        };

        if let Some(conflict) = resolution.conflict() {
            info!(
                key = %key,
                base_version = write.base_version,
                remote_version = conflict.remote_version,
                resolution = %conflict.resolution,
                "Conflict resolved"
            );
            self.log.push(conflict.clone());
        }
        Ok(resolution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::DeviceKey;
    use crate::record::OwnerId;
    use crate::remote::memory::InMemoryBackend;
    use crate::resilience::circuit_breaker::CircuitConfig;
    use crate::resilience::retry::RetryConfig;
    use crate::storage::memory::InMemoryBlobStore;

    struct Fixture {
        server: InMemoryBackend,
        store: EncryptedStore,
        resolver: ConflictResolver,
        applied: Arc<AppliedEvents>,
    }

    fn fixture() -> Fixture {
        let server = InMemoryBackend::new();
        let store = EncryptedStore::new(Arc::new(InMemoryBlobStore::new()));
        store.activate(&OwnerId::new("alice"), &DeviceKey::generate());
        let applied = Arc::new(AppliedEvents::new(64));
        let breaker = Arc::new(CircuitBreaker::new("test", CircuitConfig::test(), RetryConfig::test()));
        let resolver = ConflictResolver::new(
            Arc::new(server.clone()),
            breaker,
            Arc::new(ConflictLog::new(8)),
            applied.clone(),
        );
        Fixture { server, store, resolver, applied }
    }

    fn key(id: &str) -> RecordKey {
        RecordKey::new(OwnerId::new("alice"), "doc", id)
    }

    async fn queue(f: &Fixture, k: &RecordKey, payload: &[u8], base: u64) -> PendingWrite {
        let write = PendingWrite::new(k.clone(), payload.to_vec(), base);
        f.store.put(&Record::local(k.clone(), payload.to_vec(), base)).await.unwrap();
        f.store.enqueue_pending_write(&write).await.unwrap();
        write
    }

    #[test]
    fn test_log_is_bounded() {
        let log = ConflictLog::new(2);
        for i in 0..5u8 {
            log.push(ConflictRecord {
                key: key(&i.to_string()),
                local_payload: vec![i],
                remote_payload: None,
                remote_version: 0,
                resolution: Resolution::LocalDiscarded,
                resolved_at: 0,
            });
        }
        let recent = log.recent();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].local_payload, vec![3]);
        assert_eq!(recent[1].local_payload, vec![4]);
    }

    #[tokio::test]
    async fn test_matching_base_pushes() {
        let f = fixture();
        let k = key("d1");
        let write = queue(&f, &k, b"mine", 0).await;

        let resolution = f.resolver.resolve(&f.store, &write).await.unwrap();
        let record = resolution.record().unwrap();
        assert_eq!(record.version, 1);
        assert!(!record.local_dirty);
        assert_eq!(f.server.get(&k).unwrap().payload, b"mine".to_vec());
        assert!(!f.store.has_pending_write(&k).await.unwrap());
        assert!(!f.store.get(&k).await.unwrap().unwrap().local_dirty);
        assert_eq!(f.applied.len(), 1);
        assert!(f.resolver.log().is_empty());
    }

    #[tokio::test]
    async fn test_stale_base_server_wins() {
        let f = fixture();
        let k = key("d1");
        f.server.server_write(&k, b"theirs".to_vec());
        f.server.server_write(&k, b"theirs-2".to_vec());
        let write = queue(&f, &k, b"mine", 1).await;

        let resolution = f.resolver.resolve(&f.store, &write).await.unwrap();
        let conflict = resolution.conflict().unwrap();
        assert_eq!(conflict.resolution, Resolution::ServerWins);
        assert_eq!(conflict.remote_version, 2);
        assert_eq!(conflict.local_payload, b"mine".to_vec());

        let local = f.store.get(&k).await.unwrap().unwrap();
        assert_eq!(local.payload, b"theirs-2".to_vec());
        assert_eq!(local.version, 2);
        assert!(!local.local_dirty);
        assert_eq!(f.resolver.log().len(), 1);
        assert_eq!(f.server.push_count(), 0);
    }

    #[tokio::test]
    async fn test_server_delete_discards_local() {
        let f = fixture();
        let k = key("d1");
        f.server.server_write(&k, b"v1".to_vec());
        f.server.server_delete(&k);
        let write = queue(&f, &k, b"mine", 1).await;

        let resolution = f.resolver.resolve(&f.store, &write).await.unwrap();
        assert_eq!(resolution.conflict().unwrap().resolution, Resolution::LocalDiscarded);
        assert!(resolution.conflict().unwrap().remote_payload.is_none());
        assert!(f.store.get(&k).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_already_applied_is_not_a_conflict() {
        let f = fixture();
        let k = key("d1");
        let write = queue(&f, &k, b"mine", 0).await;
        f.server.push(&k, b"mine", 0).await.unwrap();

        let resolution = f.resolver.resolve(&f.store, &write).await.unwrap();
        assert!(matches!(resolution, WriteResolution::AlreadyApplied { .. }));
        assert!(f.resolver.log().is_empty());
        assert_eq!(f.server.get(&k).unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_network_failure_leaves_write_queued() {
        let f = fixture();
        let k = key("d1");
        let write = queue(&f, &k, b"mine", 0).await;
        f.server.set_online(false);

        let err = f.resolver.resolve(&f.store, &write).await.unwrap_err();
        assert!(matches!(err, SyncError::Offline));
        assert!(f.store.has_pending_write(&k).await.unwrap());
        assert!(f.store.get(&k).await.unwrap().unwrap().local_dirty);
    }
}
